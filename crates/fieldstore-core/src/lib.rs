// ABOUTME: Core library for fieldstore, containing the record model and body codec.
// ABOUTME: Everything here is pure; persistence lives in fieldstore-store.

pub mod codec;
pub mod constants;
pub mod items;
pub mod record;

pub use codec::{Body, CodecError};
pub use constants::{ConstantFields, Light, Location, UnknownEnumToken, Weather};
pub use items::ItemError;
pub use record::{Record, RecordId};
