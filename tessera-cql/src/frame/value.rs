use crate::frame::frame_errors::ParseError;
use crate::frame::types;
use bigdecimal::BigDecimal;
use bytes::BufMut;
use num_bigint::BigInt;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::convert::TryInto;
use std::hash::BuildHasher;
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "chrono")]
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};

use super::response::result::CqlValue;
use super::types::vint_encode;
use super::types::RawValue;

/// Every value being sent in a query must implement this trait.
/// `serialize()` should write the value as `[bytes]` to the provided buffer.
pub trait Value {
    /// Width in bytes of this type's wire representation, if the type is
    /// fixed-width. Elements of `vector` values with fixed-width types are
    /// laid out back to back, without length prefixes.
    const ELEMENT_WIDTH: Option<usize> = None;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError>;
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueSerializationError {
    #[error("Value too big to be sent in a request - max 2GiB allowed")]
    ValueTooBig,
    #[error("expected vector with {expected} dimensions, received {received}")]
    VectorDimensionMismatch { expected: u16, received: usize },
}

use ValueSerializationError::ValueTooBig;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Value is too large to fit in the CQL type")]
pub struct ValueOverflow;

/// Represents an unset value
pub struct Unset;

/// Represents a counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Counter(pub i64);

/// Enum providing a way to represent a value that might be unset
#[derive(Clone, Copy)]
pub enum MaybeUnset<V> {
    Unset,
    Set(V),
}

/// Native CQL date representation that allows for a bigger range of dates (-262145-1-1 to 262143-12-31).
///
/// Represented as number of days since -5877641-06-23 i.e. 2^31 days before unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CqlDate(pub u32);

/// Native CQL timestamp representation that allows full supported timestamp range.
///
/// Represented as signed milliseconds since unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CqlTimestamp(pub i64);

/// Native CQL time representation.
///
/// Represented as nanoseconds since midnight.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CqlTime(pub i64);

/// A version-1 UUID carried by the `timeuuid` type.
/// Kept distinct from `Uuid` so that the two CQL types don't mix up.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CqlTimeuuid(Uuid);

impl CqlTimeuuid {
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for CqlTimeuuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for CqlTimeuuid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

impl std::fmt::Display for CqlTimeuuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Represents a CQL Duration value
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub struct CqlDuration {
    pub months: i32,
    pub days: i32,
    pub nanoseconds: i64,
}

/// A fixed-dimension homogeneous sequence, the `vector<T, n>` type.
///
/// The declared dimension travels with the value so that a mismatched
/// element count is rejected before anything reaches the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct CqlVector<T> {
    pub dimensions: u16,
    pub elements: Vec<T>,
}

impl<T> CqlVector<T> {
    pub fn new(dimensions: u16, elements: Vec<T>) -> Self {
        Self {
            dimensions,
            elements,
        }
    }
}

#[cfg(feature = "chrono")]
impl From<NaiveDate> for CqlDate {
    fn from(value: NaiveDate) -> Self {
        let unix_epoch = NaiveDate::from_yo_opt(1970, 1).unwrap();

        // `NaiveDate` range is -262145-01-01 to 262143-12-31,
        // which is well within the CQL date range.
        let days = ((1 << 31) + value.signed_duration_since(unix_epoch).num_days()) as u32;

        Self(days)
    }
}

#[cfg(feature = "chrono")]
impl TryInto<NaiveDate> for CqlDate {
    type Error = ValueOverflow;

    fn try_into(self) -> Result<NaiveDate, Self::Error> {
        let days_since_unix_epoch = self.0 as i64 - (1 << 31);

        let duration_since_unix_epoch = chrono::Duration::days(days_since_unix_epoch);

        NaiveDate::from_yo_opt(1970, 1)
            .unwrap()
            .checked_add_signed(duration_since_unix_epoch)
            .ok_or(ValueOverflow)
    }
}

#[cfg(feature = "chrono")]
impl From<DateTime<Utc>> for CqlTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis())
    }
}

#[cfg(feature = "chrono")]
impl TryInto<DateTime<Utc>> for CqlTimestamp {
    type Error = ValueOverflow;

    fn try_into(self) -> Result<DateTime<Utc>, Self::Error> {
        match Utc.timestamp_millis_opt(self.0) {
            chrono::LocalResult::Single(datetime) => Ok(datetime),
            _ => Err(ValueOverflow),
        }
    }
}

#[cfg(feature = "chrono")]
impl TryFrom<NaiveTime> for CqlTime {
    type Error = ValueOverflow;

    fn try_from(value: NaiveTime) -> Result<Self, Self::Error> {
        let nanos = value
            .signed_duration_since(chrono::NaiveTime::MIN)
            .num_nanoseconds()
            .unwrap();

        // Value can exceed the max CQL time in case of a leap second
        if nanos <= 86399999999999 {
            Ok(Self(nanos))
        } else {
            Err(ValueOverflow)
        }
    }
}

#[cfg(feature = "chrono")]
impl TryInto<NaiveTime> for CqlTime {
    type Error = ValueOverflow;

    fn try_into(self) -> Result<NaiveTime, Self::Error> {
        let secs = (self.0 / 1_000_000_000)
            .try_into()
            .map_err(|_| ValueOverflow)?;
        let nanos = (self.0 % 1_000_000_000)
            .try_into()
            .map_err(|_| ValueOverflow)?;
        NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos).ok_or(ValueOverflow)
    }
}

/// Bind values in their wire form, ready to splice into a request.
/// New values are serialized as they are added; iteration walks the
/// already-serialized buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SerializedValues {
    buf: Vec<u8>,
    count: u16,
    named: bool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SerializeValuesError {
    #[error("Too many values to add, max 65,535 values can be sent in a request")]
    TooManyValues,
    #[error("Mixing named and not named values is not allowed")]
    MixingNamedAndNotNamedValues,
    #[error(transparent)]
    ValueSerialization(#[from] ValueSerializationError),
    #[error("Parsing serialized values failed")]
    ParseError,
}

pub type SerializedResult<'a> = Result<Cow<'a, SerializedValues>, SerializeValuesError>;

/// Represents a list of values to be sent in a query;
/// gets serialized and put into the request.
pub trait ValueList {
    /// Provides a view of ValueList as SerializedValues.
    /// Returns `Cow<SerializedValues>` to make the impl for SerializedValues efficient.
    fn serialized(&self) -> SerializedResult<'_>;

    fn write_to_request(&self, buf: &mut impl BufMut) -> Result<(), SerializeValuesError> {
        let serialized = self.serialized()?;
        SerializedValues::write_to_request(&serialized, buf);

        Ok(())
    }
}

impl SerializedValues {
    /// Creates an empty value list
    pub const fn new() -> Self {
        SerializedValues {
            buf: Vec::new(),
            count: 0,
            named: false,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SerializedValues {
            buf: Vec::with_capacity(capacity),
            count: 0,
            named: false,
        }
    }

    pub fn has_names(&self) -> bool {
        self.named
    }

    /// A const empty instance, useful for taking references
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    /// Serializes a value and appends it to the list
    pub fn add_value(&mut self, val: &impl Value) -> Result<(), SerializeValuesError> {
        if self.named {
            return Err(SerializeValuesError::MixingNamedAndNotNamedValues);
        }
        self.append(None, val)
    }

    pub fn add_named_value(
        &mut self,
        name: &str,
        val: &impl Value,
    ) -> Result<(), SerializeValuesError> {
        if self.count > 0 && !self.named {
            return Err(SerializeValuesError::MixingNamedAndNotNamedValues);
        }
        self.named = true;
        self.append(Some(name), val)
    }

    // A failed serialization leaves the buffer exactly as it was.
    fn append(&mut self, name: Option<&str>, val: &impl Value) -> Result<(), SerializeValuesError> {
        if self.count == u16::MAX {
            return Err(SerializeValuesError::TooManyValues);
        }

        let rollback_to = self.buf.len();
        let result: Result<(), SerializeValuesError> = (|| {
            if let Some(name) = name {
                types::write_string(name, &mut self.buf)
                    .map_err(|_| SerializeValuesError::ParseError)?;
            }
            val.serialize(&mut self.buf)?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.count += 1;
                Ok(())
            }
            Err(err) => {
                self.buf.truncate(rollback_to);
                Err(err)
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RawValue> {
        SerializedValuesIterator {
            rest: &self.buf,
            named: self.named,
        }
    }

    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.count);
        buf.put(&self.buf[..]);
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> u16 {
        self.count
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Recreates the value list from a request frame
    pub fn new_from_frame(buf: &mut &[u8], named: bool) -> Result<Self, ParseError> {
        let count = types::read_short(buf)?;

        // Walk over the values once to find where they end; the raw
        // byte range is the buffer.
        let before = *buf;
        for _ in 0..count {
            if named {
                let _name = types::read_string(buf)?;
            }
            let _value = types::read_value(buf)?;
        }
        let consumed = before.len() - buf.len();

        Ok(SerializedValues {
            buf: before[..consumed].to_vec(),
            count,
            named,
        })
    }
}

#[derive(Clone, Copy)]
pub struct SerializedValuesIterator<'a> {
    rest: &'a [u8],
    named: bool,
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = RawValue<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        // Only the values themselves are yielded, names are stepped over.
        if self.named {
            types::read_short_bytes(&mut self.rest).expect("badly encoded value name");
        }

        Some(types::read_value(&mut self.rest).expect("badly encoded value"))
    }
}

/// Represents a list of `ValueList`s for a Batch statement
pub trait BatchValues {
    type BatchValuesIter<'r>: BatchValuesIterator<'r>
    where
        Self: 'r;
    fn batch_values_iter(&self) -> Self::BatchValuesIter<'_>;
}

/// An iterator-like over `ValueList`s. Making `ValueList` methods accessible
/// instead of being an actual iterator sidesteps the lack of lending iterators.
pub trait BatchValuesIterator<'a> {
    fn next_serialized(&mut self) -> Option<SerializedResult<'a>>;
    fn write_next_to_request(
        &mut self,
        buf: &mut impl BufMut,
    ) -> Option<Result<(), SerializeValuesError>>;
    fn skip_next(&mut self) -> Option<()>;
    fn count(mut self) -> usize
    where
        Self: Sized,
    {
        let mut count = 0;
        while self.skip_next().is_some() {
            count += 1;
        }
        count
    }
}

/// Adapts an iterator over `ValueList`s into a [BatchValuesIterator].
pub struct ValueListsIterator<IT> {
    inner: IT,
}

impl<'r, 'a: 'r, IT, VL> BatchValuesIterator<'r> for ValueListsIterator<IT>
where
    IT: Iterator<Item = &'a VL>,
    VL: ValueList + 'a,
{
    fn next_serialized(&mut self) -> Option<SerializedResult<'r>> {
        self.inner.next().map(ValueList::serialized)
    }
    fn write_next_to_request(
        &mut self,
        buf: &mut impl BufMut,
    ) -> Option<Result<(), SerializeValuesError>> {
        self.inner.next().map(|value_list| value_list.write_to_request(buf))
    }
    fn skip_next(&mut self) -> Option<()> {
        self.inner.next().map(|_| ())
    }
}

//
//  Value impls
//

impl Value for i8 {
    const ELEMENT_WIDTH: Option<usize> = Some(1);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(1);
        buf.put_i8(*self);
        Ok(())
    }
}

impl Value for i16 {
    const ELEMENT_WIDTH: Option<usize> = Some(2);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(2);
        buf.put_i16(*self);
        Ok(())
    }
}

impl Value for i32 {
    const ELEMENT_WIDTH: Option<usize> = Some(4);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(4);
        buf.put_i32(*self);
        Ok(())
    }
}

impl Value for i64 {
    const ELEMENT_WIDTH: Option<usize> = Some(8);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(8);
        buf.put_i64(*self);
        Ok(())
    }
}

impl Value for bool {
    const ELEMENT_WIDTH: Option<usize> = Some(1);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(1);
        buf.put_u8(if *self { 0x01 } else { 0x00 });
        Ok(())
    }
}

impl Value for f32 {
    const ELEMENT_WIDTH: Option<usize> = Some(4);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(4);
        buf.put_f32(*self);
        Ok(())
    }
}

impl Value for f64 {
    const ELEMENT_WIDTH: Option<usize> = Some(8);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(8);
        buf.put_f64(*self);
        Ok(())
    }
}

impl Value for Uuid {
    const ELEMENT_WIDTH: Option<usize> = Some(16);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(16);
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Value for CqlTimeuuid {
    const ELEMENT_WIDTH: Option<usize> = Some(16);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        self.0.serialize(buf)
    }
}

impl Value for BigInt {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        let serialized = self.to_signed_bytes_be();
        let serialized_len: i32 = serialized.len().try_into().map_err(|_| ValueTooBig)?;

        buf.put_i32(serialized_len);
        buf.extend_from_slice(&serialized);

        Ok(())
    }
}

impl Value for BigDecimal {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        let (value, scale) = self.as_bigint_and_exponent();

        let serialized = value.to_signed_bytes_be();
        let serialized_len: i32 = serialized.len().try_into().map_err(|_| ValueTooBig)?;

        buf.put_i32(serialized_len + 4);
        buf.put_i32(scale.try_into().map_err(|_| ValueTooBig)?);
        buf.extend_from_slice(&serialized);

        Ok(())
    }
}

impl Value for CqlDate {
    const ELEMENT_WIDTH: Option<usize> = Some(4);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(4);
        buf.put_u32(self.0);
        Ok(())
    }
}

impl Value for CqlTimestamp {
    const ELEMENT_WIDTH: Option<usize> = Some(8);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(8);
        buf.put_i64(self.0);
        Ok(())
    }
}

impl Value for CqlTime {
    const ELEMENT_WIDTH: Option<usize> = Some(8);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        buf.put_i32(8);
        buf.put_i64(self.0);
        Ok(())
    }
}

#[cfg(feature = "chrono")]
impl Value for NaiveDate {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        CqlDate::from(*self).serialize(buf)
    }
}

#[cfg(feature = "chrono")]
impl Value for DateTime<Utc> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        CqlTimestamp::from(*self).serialize(buf)
    }
}

#[cfg(feature = "chrono")]
impl Value for NaiveTime {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        CqlTime::try_from(*self)
            .map_err(|_| ValueTooBig)?
            .serialize(buf)
    }
}

impl Value for &str {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        let str_bytes: &[u8] = self.as_bytes();
        let val_len: i32 = str_bytes.len().try_into().map_err(|_| ValueTooBig)?;

        buf.put_i32(val_len);
        buf.put(str_bytes);

        Ok(())
    }
}

impl Value for String {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        <&str as Value>::serialize(&self.as_str(), buf)
    }
}

impl Value for Vec<u8> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        <&[u8] as Value>::serialize(&self.as_slice(), buf)
    }
}

impl Value for &[u8] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        let val_len: i32 = self.len().try_into().map_err(|_| ValueTooBig)?;
        buf.put_i32(val_len);

        buf.extend_from_slice(self);

        Ok(())
    }
}

impl<const N: usize> Value for [u8; N] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        let val_len: i32 = self.len().try_into().map_err(|_| ValueTooBig)?;
        buf.put_i32(val_len);

        buf.extend_from_slice(self);

        Ok(())
    }
}

impl Value for IpAddr {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        match self {
            IpAddr::V4(addr) => {
                buf.put_i32(4);
                buf.extend_from_slice(&addr.octets());
            }
            IpAddr::V6(addr) => {
                buf.put_i32(16);
                buf.extend_from_slice(&addr.octets());
            }
        }

        Ok(())
    }
}

/// Every `Option<T>` can be serialized as None -> NULL, Some(val) -> val.serialize()
impl<T: Value> Value for Option<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        match self {
            Some(val) => <T as Value>::serialize(val, buf),
            None => {
                buf.put_i32(-1);
                Ok(())
            }
        }
    }
}

impl Value for Unset {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        // Unset serializes itself to an empty value with length = -2
        buf.put_i32(-2);
        Ok(())
    }
}

impl Value for Counter {
    const ELEMENT_WIDTH: Option<usize> = Some(8);

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        self.0.serialize(buf)
    }
}

impl Value for CqlDuration {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        with_length_prefix(buf, |buf| {
            vint_encode(self.months as i64, buf);
            vint_encode(self.days as i64, buf);
            vint_encode(self.nanoseconds, buf);
            Ok(())
        })
    }
}

impl<V: Value> Value for MaybeUnset<V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        match self {
            MaybeUnset::Set(v) => v.serialize(buf),
            MaybeUnset::Unset => Unset.serialize(buf),
        }
    }
}

impl<T: Value + ?Sized> Value for &T {
    const ELEMENT_WIDTH: Option<usize> = T::ELEMENT_WIDTH;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        <T as Value>::serialize(*self, buf)
    }
}

impl<T: Value + ?Sized> Value for Box<T> {
    const ELEMENT_WIDTH: Option<usize> = T::ELEMENT_WIDTH;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        <T as Value>::serialize(self.as_ref(), buf)
    }
}

// Runs `write_body`, then fills in the i32 length prefix that every
// [bytes] value starts with. The placeholder is reserved up front so
// the body is written in one pass.
fn with_length_prefix(
    buf: &mut Vec<u8>,
    write_body: impl FnOnce(&mut Vec<u8>) -> Result<(), ValueSerializationError>,
) -> Result<(), ValueSerializationError> {
    let prefix_at = buf.len();
    buf.extend_from_slice(&[0; 4]);

    write_body(buf)?;

    let body_len: i32 = (buf.len() - prefix_at - 4)
        .try_into()
        .map_err(|_| ValueTooBig)?;
    buf[prefix_at..prefix_at + 4].copy_from_slice(&body_len.to_be_bytes());
    Ok(())
}

fn serialize_map<K: Value, V: Value>(
    kv_iter: impl Iterator<Item = (K, V)>,
    kv_count: usize,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    with_length_prefix(buf, |buf| {
        buf.put_i32(kv_count.try_into().map_err(|_| ValueTooBig)?);
        for (key, value) in kv_iter {
            key.serialize(buf)?;
            value.serialize(buf)?;
        }
        Ok(())
    })
}

fn serialize_list_or_set<'a, V: 'a + Value>(
    elements_iter: impl Iterator<Item = &'a V>,
    element_count: usize,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    with_length_prefix(buf, |buf| {
        buf.put_i32(element_count.try_into().map_err(|_| ValueTooBig)?);
        for element in elements_iter {
            element.serialize(buf)?;
        }
        Ok(())
    })
}

impl<V: Value, S: BuildHasher + Default> Value for HashSet<V, S> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        serialize_list_or_set(self.iter(), self.len(), buf)
    }
}

impl<K: Value, V: Value, S: BuildHasher> Value for HashMap<K, V, S> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        serialize_map(self.iter(), self.len(), buf)
    }
}

impl<V: Value> Value for BTreeSet<V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        serialize_list_or_set(self.iter(), self.len(), buf)
    }
}

impl<K: Value, V: Value> Value for BTreeMap<K, V> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        serialize_map(self.iter(), self.len(), buf)
    }
}

impl<T: Value> Value for Vec<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        serialize_list_or_set(self.iter(), self.len(), buf)
    }
}

impl<T: Value> Value for &[T] {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        serialize_list_or_set(self.iter(), self.len(), buf)
    }
}

impl<T: Value> Value for CqlVector<T> {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        if self.elements.len() != self.dimensions as usize {
            return Err(ValueSerializationError::VectorDimensionMismatch {
                expected: self.dimensions,
                received: self.elements.len(),
            });
        }

        with_length_prefix(buf, |buf| {
            let mut element_buf: Vec<u8> = Vec::new();
            for element in self.elements.iter() {
                element_buf.clear();
                element.serialize(&mut element_buf)?;
                // Value::serialize writes a [bytes]: strip the length prefix
                // and lay the body out according to the element width rule.
                let body = &element_buf[4..];
                match T::ELEMENT_WIDTH {
                    Some(_) => buf.extend_from_slice(body),
                    None => {
                        types::unsigned_vint_encode(body.len() as u64, buf);
                        buf.extend_from_slice(body);
                    }
                }
            }
            Ok(())
        })
    }
}

fn serialize_tuple<V: Value>(
    elem_iter: impl Iterator<Item = V>,
    buf: &mut Vec<u8>,
) -> Result<(), ValueSerializationError> {
    with_length_prefix(buf, |buf| {
        for elem in elem_iter {
            elem.serialize(buf)?;
        }
        Ok(())
    })
}

fn serialize_empty(buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
    buf.put_i32(0);
    Ok(())
}

impl CqlValue {
    // Vector elements of fixed-width kinds are laid out without prefixes.
    fn fixed_element_width(&self) -> Option<usize> {
        match self {
            CqlValue::TinyInt(_) | CqlValue::Boolean(_) => Some(1),
            CqlValue::SmallInt(_) => Some(2),
            CqlValue::Int(_) | CqlValue::Float(_) | CqlValue::Date(_) => Some(4),
            CqlValue::BigInt(_)
            | CqlValue::Double(_)
            | CqlValue::Timestamp(_)
            | CqlValue::Time(_)
            | CqlValue::Counter(_) => Some(8),
            CqlValue::Uuid(_) | CqlValue::Timeuuid(_) => Some(16),
            _ => None,
        }
    }
}

impl Value for CqlValue {
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
        match self {
            CqlValue::Map(m) => serialize_map(m.iter().map(|(k, v)| (k, v)), m.len(), buf),
            CqlValue::Tuple(t) => serialize_tuple(t.iter(), buf),

            // A UDT value is composed of successive [bytes] values, one for each
            // field of the UDT (in the order defined by the type), so it
            // serializes the same way a tuple does.
            CqlValue::UserDefinedType { fields, .. } => {
                serialize_tuple(fields.iter().map(|(_, value)| value), buf)
            }

            CqlValue::Vector(elements) => with_length_prefix(buf, |buf| {
                let fixed = elements.first().and_then(CqlValue::fixed_element_width);
                let mut element_buf: Vec<u8> = Vec::new();
                for element in elements.iter() {
                    element_buf.clear();
                    element.serialize(&mut element_buf)?;
                    let body = &element_buf[4..];
                    if fixed.is_none() {
                        types::unsigned_vint_encode(body.len() as u64, buf);
                    }
                    buf.extend_from_slice(body);
                }
                Ok(())
            }),

            CqlValue::Date(d) => d.serialize(buf),
            CqlValue::Duration(d) => d.serialize(buf),
            CqlValue::Timestamp(t) => t.serialize(buf),
            CqlValue::Time(t) => t.serialize(buf),

            CqlValue::Ascii(s) | CqlValue::Text(s) => s.serialize(buf),
            CqlValue::List(v) | CqlValue::Set(v) => v.serialize(buf),

            CqlValue::Blob(b) => b.serialize(buf),
            CqlValue::Boolean(b) => b.serialize(buf),
            CqlValue::Counter(c) => c.serialize(buf),
            CqlValue::Decimal(d) => d.serialize(buf),
            CqlValue::Double(d) => d.serialize(buf),
            CqlValue::Float(f) => f.serialize(buf),
            CqlValue::Int(i) => i.serialize(buf),
            CqlValue::BigInt(i) => i.serialize(buf),
            CqlValue::Inet(i) => i.serialize(buf),
            CqlValue::SmallInt(s) => s.serialize(buf),
            CqlValue::TinyInt(t) => t.serialize(buf),
            CqlValue::Timeuuid(t) => t.serialize(buf),
            CqlValue::Uuid(u) => u.serialize(buf),
            CqlValue::Varint(v) => v.serialize(buf),

            CqlValue::Empty => serialize_empty(buf),
        }
    }
}

macro_rules! impl_value_for_tuple {
    ( $($Ti:ident),* ; $($FieldI:tt),* ) => {
        impl<$($Ti),+> Value for ($($Ti,)+)
        where
            $($Ti: Value),+
        {
            fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), ValueSerializationError> {
                with_length_prefix(buf, |buf| {
                    $(
                        self.$FieldI.serialize(buf)?;
                    )*
                    Ok(())
                })
            }
        }
    }
}

impl_value_for_tuple!(T0; 0);
impl_value_for_tuple!(T0, T1; 0, 1);
impl_value_for_tuple!(T0, T1, T2; 0, 1, 2);
impl_value_for_tuple!(T0, T1, T2, T3; 0, 1, 2, 3);
impl_value_for_tuple!(T0, T1, T2, T3, T4; 0, 1, 2, 3, 4);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5; 0, 1, 2, 3, 4, 5);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6; 0, 1, 2, 3, 4, 5, 6);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7; 0, 1, 2, 3, 4, 5, 6, 7);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8; 0, 1, 2, 3, 4, 5, 6, 7, 8);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9; 0, 1, 2, 3, 4, 5, 6, 7, 8, 9);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14);
impl_value_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15);

//
//  ValueList impls
//

/// Implements ValueList for an empty values list
impl ValueList for () {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Owned(SerializedValues::new()))
    }
}

/// Implements ValueList for &[] - u8 arrays - allows to pass some values
/// as a slice, e.g. `&[] as &[i32]` for an empty list.
impl<T: Value> ValueList for &[T] {
    fn serialized(&self) -> SerializedResult<'_> {
        let mut result = SerializedValues::with_capacity(self.len() * 8);
        for val in *self {
            result.add_value(val)?;
        }

        Ok(Cow::Owned(result))
    }
}

impl<T: Value> ValueList for Vec<T> {
    fn serialized(&self) -> SerializedResult<'_> {
        let mut result = SerializedValues::with_capacity(self.len() * 8);
        for val in self {
            result.add_value(val)?;
        }

        Ok(Cow::Owned(result))
    }
}

/// Implements ValueList for maps of named values.
impl<T: Value, S: BuildHasher> ValueList for HashMap<&str, T, S> {
    fn serialized(&self) -> SerializedResult<'_> {
        let mut result = SerializedValues::with_capacity(self.len() * 8);
        for (name, val) in self {
            result.add_named_value(name, val)?;
        }

        Ok(Cow::Owned(result))
    }
}

macro_rules! impl_value_list_for_tuple {
    ( $($Ti:ident),* ; $($FieldI:tt),* ) => {
        impl<$($Ti),+> ValueList for ($($Ti,)+)
        where
            $($Ti: Value),+
        {
            fn serialized(&self) -> SerializedResult<'_> {
                let mut result = SerializedValues::with_capacity(128);
                $(
                    result.add_value(&self.$FieldI)?;
                )*
                Ok(Cow::Owned(result))
            }
        }
    }
}

impl_value_list_for_tuple!(T0; 0);
impl_value_list_for_tuple!(T0, T1; 0, 1);
impl_value_list_for_tuple!(T0, T1, T2; 0, 1, 2);
impl_value_list_for_tuple!(T0, T1, T2, T3; 0, 1, 2, 3);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4; 0, 1, 2, 3, 4);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5; 0, 1, 2, 3, 4, 5);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6; 0, 1, 2, 3, 4, 5, 6);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7; 0, 1, 2, 3, 4, 5, 6, 7);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8; 0, 1, 2, 3, 4, 5, 6, 7, 8);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14);
impl_value_list_for_tuple!(T0, T1, T2, T3, T4, T5, T6, T7, T8, T9, T10, T11, T12, T13, T14, T15;
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15);

/// Every &impl ValueList should also implement ValueList
impl<T: ValueList> ValueList for &T {
    fn serialized(&self) -> SerializedResult<'_> {
        <T as ValueList>::serialized(*self)
    }
}

impl ValueList for SerializedValues {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Borrowed(self))
    }
}

impl<'b> ValueList for Cow<'b, SerializedValues> {
    fn serialized(&self) -> SerializedResult<'_> {
        Ok(Cow::Borrowed(self.as_ref()))
    }
}

//
//  BatchValues impls
//

// Implement BatchValues for slices of ValueList types
impl<T: ValueList> BatchValues for [T] {
    type BatchValuesIter<'r> = ValueListsIterator<std::slice::Iter<'r, T>> where Self: 'r;
    fn batch_values_iter(&self) -> Self::BatchValuesIter<'_> {
        ValueListsIterator { inner: self.iter() }
    }
}

// Implement BatchValues for Vec<ValueList>
impl<T: ValueList> BatchValues for Vec<T> {
    type BatchValuesIter<'r> = ValueListsIterator<std::slice::Iter<'r, T>> where Self: 'r;
    fn batch_values_iter(&self) -> Self::BatchValuesIter<'_> {
        BatchValues::batch_values_iter(self.as_slice())
    }
}

/// Every &impl BatchValues should also implement BatchValues
impl<'a, T: BatchValues + ?Sized> BatchValues for &'a T {
    type BatchValuesIter<'r> = <T as BatchValues>::BatchValuesIter<'r> where Self: 'r;
    fn batch_values_iter(&self) -> Self::BatchValuesIter<'_> {
        <T as BatchValues>::batch_values_iter(*self)
    }
}
