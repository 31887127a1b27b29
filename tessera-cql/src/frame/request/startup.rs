use std::collections::HashMap;

use crate::frame::frame_errors::ParseError;
use crate::frame::ProtocolVersion;

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

pub struct Startup {
    pub options: HashMap<String, String>,
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Startup {
    fn deserialize(_version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let options = types::read_string_map(buf)?;
        Ok(Self { options })
    }
}
