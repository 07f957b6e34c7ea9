// ABOUTME: Index-based editing of list-valued sections inside a record body.
// ABOUTME: Sections are arrays keyed by name on the body's root object (e.g. repeated vehicles).

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from section item edits.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("record body root is not an object")]
    NotAnObject,

    #[error("section {0:?} is not a list")]
    NotAList(String),

    #[error("index {index} is out of range for section {section:?} with {len} items")]
    IndexOutOfRange {
        section: String,
        index: usize,
        len: usize,
    },
}

fn root_mut(body: &mut Value) -> Result<&mut Map<String, Value>, ItemError> {
    body.as_object_mut().ok_or(ItemError::NotAnObject)
}

fn section_mut<'a>(body: &'a mut Value, section: &str) -> Result<&'a mut Vec<Value>, ItemError> {
    let slot = root_mut(body)?
        .entry(section.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| ItemError::NotAList(section.to_string()))
}

/// Items currently in a section. An absent or null section is empty.
pub fn items<'a>(body: &'a Value, section: &str) -> Result<&'a [Value], ItemError> {
    let root = body.as_object().ok_or(ItemError::NotAnObject)?;
    match root.get(section) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(list)) => Ok(list.as_slice()),
        Some(_) => Err(ItemError::NotAList(section.to_string())),
    }
}

/// The item at `index`, or None if out of range.
pub fn get_item<'a>(
    body: &'a Value,
    section: &str,
    index: usize,
) -> Result<Option<&'a Value>, ItemError> {
    Ok(items(body, section)?.get(index))
}

/// The item at `index` for editing. Asking for one past the end appends a
/// fresh empty object, which is how a new sub-entity form starts.
pub fn get_or_create_item<'a>(
    body: &'a mut Value,
    section: &str,
    index: usize,
) -> Result<&'a mut Value, ItemError> {
    let list = section_mut(body, section)?;
    let len = list.len();
    if index > len {
        return Err(ItemError::IndexOutOfRange {
            section: section.to_string(),
            index,
            len,
        });
    }
    if index == len {
        tracing::debug!(section, index, "creating new section item");
        list.push(Value::Object(Map::new()));
    }
    Ok(&mut list[index])
}

/// Append an item and return its index. Creates the section if needed.
pub fn add_item(body: &mut Value, section: &str, item: Value) -> Result<usize, ItemError> {
    let list = section_mut(body, section)?;
    list.push(item);
    Ok(list.len() - 1)
}

/// Remove the item at `index`, shifting later items down. Returns false
/// when there is nothing at that index.
pub fn delete_item(body: &mut Value, section: &str, index: usize) -> Result<bool, ItemError> {
    let root = root_mut(body)?;
    let Some(slot) = root.get_mut(section) else {
        return Ok(false);
    };
    let list = match slot {
        Value::Null => return Ok(false),
        Value::Array(list) => list,
        _ => return Err(ItemError::NotAList(section.to_string())),
    };
    if index >= list.len() {
        tracing::warn!(section, index, len = list.len(), "no section item to delete");
        return Ok(false);
    }
    list.remove(index);
    Ok(true)
}
