use crate::frame::frame_errors::ParseError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;
use crate::frame::ProtocolVersion;
use bytes::Bytes;

#[cfg_attr(test, derive(Debug, PartialEq, Eq))]
pub struct Execute<'a> {
    pub id: Bytes,
    /// Protocol 5: the client must echo the result-metadata id it holds so
    /// that the server can detect a stale view of the result set.
    pub result_metadata_id: Option<Bytes>,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        types::write_short_bytes(&self.id[..], buf)?;

        if version >= ProtocolVersion::V5 {
            let metadata_id = self.result_metadata_id.as_ref().ok_or_else(|| {
                ParseError::BadIncomingData(
                    "EXECUTE on protocol 5 requires a result metadata id".to_string(),
                )
            })?;
            types::write_short_bytes(&metadata_id[..], buf)?;
        }

        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let result_metadata_id = if version >= ProtocolVersion::V5 {
            Some(Bytes::copy_from_slice(types::read_short_bytes(buf)?))
        } else {
            None
        };
        let parameters = QueryParameters::deserialize(buf)?;

        Ok(Self {
            id,
            result_metadata_id,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_round_trip_v4() {
        let execute = Execute {
            id: Bytes::from_static(b"deadbeef"),
            result_metadata_id: None,
            parameters: QueryParameters::default(),
        };

        let mut buf = Vec::new();
        execute.serialize(ProtocolVersion::V4, &mut buf).unwrap();
        let deserialized = Execute::deserialize(ProtocolVersion::V4, &mut &buf[..]).unwrap();
        assert_eq!(deserialized, execute);
    }

    #[test]
    fn execute_round_trip_v5_carries_metadata_id() {
        let execute = Execute {
            id: Bytes::from_static(b"deadbeef"),
            result_metadata_id: Some(Bytes::from_static(b"cafebabe")),
            parameters: QueryParameters::default(),
        };

        let mut buf = Vec::new();
        execute.serialize(ProtocolVersion::V5, &mut buf).unwrap();
        let deserialized = Execute::deserialize(ProtocolVersion::V5, &mut &buf[..]).unwrap();
        assert_eq!(deserialized, execute);
    }

    #[test]
    fn execute_v5_without_metadata_id_is_rejected() {
        let execute = Execute {
            id: Bytes::from_static(b"deadbeef"),
            result_metadata_id: None,
            parameters: QueryParameters::default(),
        };

        let mut buf = Vec::new();
        assert!(execute.serialize(ProtocolVersion::V5, &mut buf).is_err());
    }
}
