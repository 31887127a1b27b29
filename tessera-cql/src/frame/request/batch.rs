use bytes::{Buf, Bytes};
use std::{borrow::Cow, convert::TryInto};

use crate::frame::frame_errors::ParseError;
use crate::frame::ProtocolVersion;
use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types::{self, SerialConsistency},
    value::{BatchValues, BatchValuesIterator, SerializedValues},
};

use super::DeserializableRequest;

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const ALL_FLAGS: u8 = FLAG_WITH_SERIAL_CONSISTENCY | FLAG_WITH_DEFAULT_TIMESTAMP;

/// The server's statement counter is a 16-bit field.
pub const BATCH_STATEMENTS_LIMIT: usize = u16::MAX as usize;

pub struct Batch<'b, Statement, Values>
where
    BatchStatement<'b>: From<&'b Statement>,
    Statement: Clone,
    Values: BatchValues,
{
    pub statements: Cow<'b, [Statement]>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub values: Values,
}

/// The type of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            other => Err(ParseError::BadIncomingData(format!(
                "Bad batch type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Cow<'a, Bytes> },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        match self {
            Self::Query { text } => {
                buf.push(0);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.push(1);
                types::write_short_bytes(&id[..], buf)?;
            }
        }
        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<BatchStatement<'static>, ParseError> {
        let kind = buf.get_u8();
        match kind {
            0 => {
                let text = Cow::Owned(types::read_long_string(buf)?.to_owned());
                Ok(BatchStatement::Query { text })
            }
            1 => {
                let id = types::read_short_bytes(buf)?.to_vec().into();
                Ok(BatchStatement::Prepared { id: Cow::Owned(id) })
            }
            _ => Err(ParseError::BadIncomingData(format!(
                "Unexpected batch statement kind: {}",
                kind
            ))),
        }
    }
}

impl<Statement, Values> SerializableRequest for Batch<'_, Statement, Values>
where
    for<'s> BatchStatement<'s>: From<&'s Statement>,
    Statement: Clone,
    Values: BatchValues,
{
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, _version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        buf.push(self.batch_type as u8);

        // The statement counter on the wire is 16 bits.
        let statement_count: u16 = self.statements.len().try_into().map_err(|_| {
            ParseError::BadIncomingData(format!(
                "Batch has too many statements: {}, while the limit is {}",
                self.statements.len(),
                BATCH_STATEMENTS_LIMIT
            ))
        })?;
        types::write_short(statement_count, buf);

        let mismatch = |value_list_count: usize| {
            ParseError::BadIncomingData(format!(
                "Batch has {statement_count} statements but {value_list_count} value lists"
            ))
        };

        // Statements and their value lists interleave on the wire, so the
        // two sequences are walked in lockstep and must end together.
        let mut value_lists = self.values.batch_values_iter();
        for (position, statement) in self.statements.iter().enumerate() {
            BatchStatement::from(statement).serialize(buf)?;
            value_lists
                .write_next_to_request(buf)
                .ok_or_else(|| mismatch(position))??;
        }
        if value_lists.skip_next().is_some() {
            let leftover = 1 + value_lists.count();
            return Err(mismatch(statement_count as usize + leftover));
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        buf.push(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

/// A batch read back from its serialized form; only used to decode
/// what the driver sent.
pub struct BatchOwned {
    pub statements: Vec<BatchStatement<'static>>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub values: Vec<SerializedValues>,
}

impl SerializableRequest for BatchOwned {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(&self, version: ProtocolVersion, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        let batch: Batch<'_, BatchStatement<'static>, &Vec<SerializedValues>> = Batch {
            statements: Cow::Borrowed(&self.statements),
            batch_type: self.batch_type,
            consistency: self.consistency,
            serial_consistency: self.serial_consistency,
            timestamp: self.timestamp,
            values: &self.values,
        };
        batch.serialize(version, buf)
    }
}

impl DeserializableRequest for BatchOwned {
    fn deserialize(_version: ProtocolVersion, buf: &mut &[u8]) -> Result<Self, ParseError> {
        let batch_type = buf.get_u8().try_into()?;

        let statements_count: usize = types::read_short(buf)?.into();
        let statements_with_values = (0..statements_count)
            .map(|_| {
                let batch_statement = BatchStatement::deserialize(buf)?;

                // Bound values of a statement are never named.
                let values = SerializedValues::new_from_frame(buf, false)?;

                Ok((batch_statement, values))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        let consistency = types::read_consistency(buf)?;

        let flags = buf.get_u8();
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown batch flags: {:#04x}",
                unknown_flags
            )));
        }
        let serial_consistency_flag = (flags & FLAG_WITH_SERIAL_CONSISTENCY) != 0;
        let default_timestamp_flag = (flags & FLAG_WITH_DEFAULT_TIMESTAMP) != 0;

        let serial_consistency = serial_consistency_flag
            .then(|| types::read_consistency(buf))
            .transpose()?
            .map(|consistency| match SerialConsistency::try_from(consistency) {
                Ok(serial_consistency) => Ok(serial_consistency),
                Err(_) => Err(ParseError::BadIncomingData(format!(
                    "Expected serial consistency, got {}",
                    consistency
                ))),
            })
            .transpose()?;

        let timestamp = default_timestamp_flag
            .then(|| types::read_long(buf))
            .transpose()?;

        let (statements, values): (Vec<BatchStatement>, Vec<SerializedValues>) =
            statements_with_values.into_iter().unzip();

        Ok(Self {
            statements,
            batch_type,
            consistency,
            serial_consistency,
            timestamp,
            values,
        })
    }
}

impl<'s, 'b: 's> From<&'s BatchStatement<'b>> for BatchStatement<'s> {
    fn from(value: &'s BatchStatement<'b>) -> Self {
        match value {
            BatchStatement::Query { text } => BatchStatement::Query {
                text: Cow::Borrowed(text),
            },
            BatchStatement::Prepared { id } => BatchStatement::Prepared {
                id: Cow::Borrowed(id),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;

    fn statements(count: usize) -> Vec<BatchStatement<'static>> {
        (0..count)
            .map(|_| BatchStatement::Query {
                text: Cow::Borrowed("INSERT INTO ks.t (a) VALUES (?)"),
            })
            .collect()
    }

    fn make_batch(
        count: usize,
    ) -> Batch<'static, BatchStatement<'static>, Vec<SerializedValues>> {
        Batch {
            statements: Cow::Owned(statements(count)),
            batch_type: BatchType::Logged,
            consistency: Consistency::Quorum,
            serial_consistency: None,
            timestamp: None,
            values: vec![SerializedValues::new(); count],
        }
    }

    #[test]
    fn batch_round_trip() {
        let batch = make_batch(2);
        let mut buf = Vec::new();
        batch.serialize(ProtocolVersion::V4, &mut buf).unwrap();

        let deserialized = BatchOwned::deserialize(ProtocolVersion::V4, &mut &buf[..]).unwrap();
        assert_eq!(deserialized.statements.len(), 2);
        assert_eq!(deserialized.consistency, Consistency::Quorum);
        assert!(matches!(deserialized.batch_type, BatchType::Logged));
    }

    #[test]
    fn batch_over_the_statement_limit_is_rejected_before_send() {
        let batch = make_batch(BATCH_STATEMENTS_LIMIT + 2);
        let mut buf = Vec::new();
        let err = batch.serialize(ProtocolVersion::V4, &mut buf).unwrap_err();
        assert!(err.to_string().contains("too many statements"));
    }

    #[test]
    fn mismatched_values_count_is_rejected() {
        let batch: Batch<'static, BatchStatement<'static>, Vec<SerializedValues>> = Batch {
            statements: Cow::Owned(statements(2)),
            batch_type: BatchType::Unlogged,
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
            values: vec![SerializedValues::new(); 1],
        };
        let mut buf = Vec::new();
        assert!(batch.serialize(ProtocolVersion::V4, &mut buf).is_err());
    }
}
