use crate::frame::frame_errors::ParseError;
use crate::frame::ProtocolVersion;

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

pub struct Prepare<'a> {
    pub query: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(self.query, buf)?;
        Ok(())
    }
}

/// An owned counterpart, only used when decoding what was sent.
pub struct PrepareOwned {
    pub query: String,
}

impl SerializableRequest for PrepareOwned {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for PrepareOwned {
    fn deserialize(_version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let query = types::read_long_string(buf)?.to_owned();
        Ok(Self { query })
    }
}
