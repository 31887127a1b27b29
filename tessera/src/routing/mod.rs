pub mod locator;
pub mod partitioner;
pub mod ring;

use bytes::{BufMut, Bytes, BytesMut};
use num_bigint::BigInt;
use std::convert::TryInto;
use tessera_cql::frame::response::result::PartitionKeyIndex;
use tessera_cql::frame::types::RawValue;
use tessera_cql::frame::value::SerializedValues;
use thiserror::Error;

/// A point on the partitioner's ordered domain.
///
/// Each partitioner hashes routing keys into its own domain: a signed
/// 64-bit integer for Murmur3, a non-negative big integer for the random
/// partitioner, and the raw key bytes for the byte-ordered one. A ring is
/// always homogeneous, so tokens of different kinds never get compared
/// in practice.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Token {
    Murmur3(i64),
    Random(BigInt),
    ByteOrdered(Vec<u8>),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Murmur3(v) => write!(f, "{}", v),
            Token::Random(v) => write!(f, "{}", v),
            Token::ByteOrdered(v) => {
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Could not parse token {token:?} for partitioner {partitioner}")]
pub struct TokenParseError {
    pub token: String,
    pub partitioner: &'static str,
}

/// An error returned when a routing key cannot be derived from bound values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PartitionKeyError {
    #[error("No value with index {0} to be part of the partition key, values len: {1}")]
    NoPkIndexValue(u16, u16),
    #[error("Value bound to a partition key column is null or unset")]
    NullValueInPartitionKey,
    #[error("Value too long to create a composite partition key! Length: {0}, Max allowed length: {1}")]
    ValueTooLong(usize, usize),
}

/// Computes the routing key from serialized bind values, using the
/// partition-key indexes reported by the server when preparing.
///
/// A single-column key is the raw value; a composite key concatenates
/// its components as 2-byte-length ‖ value ‖ 0x00, in partition key
/// order (which need not be the bind order).
pub(crate) fn compute_routing_key(
    pk_indexes: &[PartitionKeyIndex],
    bound_values: &SerializedValues,
) -> Result<Option<Bytes>, PartitionKeyError> {
    if pk_indexes.is_empty() {
        return Ok(None);
    }

    // Scan the bound values once; pk_indexes is sorted by bind position,
    // so a peekable cursor over it tells which values participate.
    // `sequence` says where each one lands in the key.
    let mut components: smallvec::SmallVec<[Option<&[u8]>; 4]> =
        smallvec::smallvec![None; pk_indexes.len()];
    let mut wanted = pk_indexes.iter().copied().peekable();

    for (position, value) in bound_values.iter().enumerate() {
        let Some(next_wanted) = wanted.peek() else {
            break;
        };
        if position as u16 != next_wanted.index {
            continue;
        }

        match value {
            RawValue::Value(raw) => components[next_wanted.sequence as usize] = Some(raw),
            RawValue::Null | RawValue::Unset => {
                return Err(PartitionKeyError::NullValueInPartitionKey)
            }
        }
        wanted.next();
    }

    if let Some(missing) = wanted.peek() {
        return Err(PartitionKeyError::NoPkIndexValue(
            missing.index,
            bound_values.len(),
        ));
    }

    // Every pk index filled exactly one distinct slot above.
    let components = components
        .into_iter()
        .map(|slot| slot.ok_or(PartitionKeyError::NullValueInPartitionKey))
        .collect::<Result<smallvec::SmallVec<[&[u8]; 4]>, _>>()?;

    let routing_key = match components.as_slice() {
        [single] => Bytes::copy_from_slice(single),
        several => {
            let mut key = BytesMut::new();
            for component in several {
                let component_len: u16 = component.len().try_into().map_err(|_| {
                    PartitionKeyError::ValueTooLong(component.len(), u16::MAX as usize)
                })?;
                key.put_u16(component_len);
                key.put_slice(component);
                key.put_u8(0);
            }
            key.freeze()
        }
    };

    Ok(Some(routing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_cql::frame::value::SerializedValues;

    fn pk_index(index: u16, sequence: u16) -> PartitionKeyIndex {
        PartitionKeyIndex { index, sequence }
    }

    #[test]
    fn single_column_routing_key_is_raw_value() {
        let mut values = SerializedValues::new();
        values.add_value(&67_i32).unwrap();

        let key = compute_routing_key(&[pk_index(0, 0)], &values)
            .unwrap()
            .unwrap();
        assert_eq!(&key[..], &67_i32.to_be_bytes());
    }

    #[test]
    fn composite_routing_key_has_length_prefixes() {
        let mut values = SerializedValues::new();
        values.add_value(&1_i16).unwrap();
        values.add_value(&2_i32).unwrap();

        let key = compute_routing_key(&[pk_index(0, 0), pk_index(1, 1)], &values)
            .unwrap()
            .unwrap();
        assert_eq!(&key[..], &[0, 2, 0, 1, 0, 0, 4, 0, 0, 0, 2, 0]);
    }

    #[test]
    fn pk_order_follows_sequence_not_bind_order() {
        let mut values = SerializedValues::new();
        values.add_value(&1_i32).unwrap();
        values.add_value(&2_i32).unwrap();

        // Second bound value is the first partition key component.
        let key = compute_routing_key(&[pk_index(0, 1), pk_index(1, 0)], &values)
            .unwrap()
            .unwrap();
        assert_eq!(&key[..], &[0, 4, 0, 0, 0, 2, 0, 0, 4, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn missing_pk_value_is_an_error() {
        let mut values = SerializedValues::new();
        values.add_value(&1_i32).unwrap();

        let err = compute_routing_key(&[pk_index(0, 0), pk_index(1, 1)], &values).unwrap_err();
        assert_eq!(err, PartitionKeyError::NoPkIndexValue(1, 1));
    }

    #[test]
    fn null_pk_value_is_an_error() {
        let mut values = SerializedValues::new();
        values.add_value(&Option::<i32>::None).unwrap();

        let err = compute_routing_key(&[pk_index(0, 0)], &values).unwrap_err();
        assert_eq!(err, PartitionKeyError::NullValueInPartitionKey);
    }
}
