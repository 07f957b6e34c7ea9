// ABOUTME: The Record entity: a deserialized body plus its persistence identity.
// ABOUTME: Carries the store-assigned id, schema version, constant fields, and store timestamps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{self, Body, CodecError};
use crate::constants::ConstantFields;

/// Store-assigned row identity. Immutable once assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        RecordId(value)
    }
}

/// One user submission. The caller owns the record while editing it and
/// hands it to the store to persist; the store holds no copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// None until the first insert.
    pub id: Option<RecordId>,
    schema_version: String,
    /// None only when the stored body text could not be decoded.
    pub body: Option<Body>,
    pub constants: ConstantFields,
    pub entered_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    /// Create an unsaved record for the given schema version.
    pub fn new(schema_version: impl Into<String>, body: Body, constants: ConstantFields) -> Self {
        Self {
            id: None,
            schema_version: schema_version.into(),
            body: Some(body),
            constants,
            entered_at: None,
            updated_at: None,
        }
    }

    /// Rebuild a record from its stored parts.
    pub fn from_stored(
        id: RecordId,
        schema_version: String,
        body: Option<Body>,
        constants: ConstantFields,
        entered_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Some(id),
            schema_version,
            body,
            constants,
            entered_at: Some(entered_at),
            updated_at,
        }
    }

    /// Schema version is fixed at creation; there is deliberately no setter.
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Encode the body for storage. A record whose body failed to load has
    /// nothing to encode and is refused; the caller decides between recovery
    /// and re-entry.
    pub fn serialized_body(&self) -> Result<String, CodecError> {
        match &self.body {
            Some(body) => codec::serialize(body),
            None => Err(CodecError::MissingBody),
        }
    }
}
