//! CQL requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use crate::frame::frame_errors::ParseError;
use crate::frame::ProtocolVersion;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError>;

    fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, ParseError> {
        let mut v = Vec::new();
        self.serialize(version, &mut v)?;
        Ok(v.into())
    }
}

/// Requests which can be deserialized from their serialized form.
/// Used by tests to decode what the driver actually sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError>;
}
