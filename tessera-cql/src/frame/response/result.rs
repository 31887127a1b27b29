use crate::frame::frame_errors::ParseError;
use crate::frame::response::custom_type_parser::CustomTypeParser;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types::{read_exact_slice, unsigned_vint_decode, vint_decode};
use crate::frame::value::{
    Counter, CqlDate, CqlDuration, CqlTime, CqlTimestamp, CqlTimeuuid,
};
use crate::frame::{types, ProtocolVersion};
use bigdecimal::BigDecimal;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, Bytes};
use num_bigint::BigInt;
use std::{
    convert::{TryFrom, TryInto},
    net::IpAddr,
    result::Result as StdResult,
    str,
};
use uuid::Uuid;

#[derive(Debug)]
pub struct SetKeyspace {
    pub keyspace_name: String,
}

#[derive(Debug)]
pub struct Prepared {
    pub id: Bytes,
    /// Id of the result metadata, sent by servers speaking protocol 5.
    /// Changes whenever a schema change alters the result set of the statement.
    pub result_metadata_id: Option<Bytes>,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug)]
pub struct SchemaChange {
    pub event: SchemaChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        type_name: String,
        keyspace: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
    Vector {
        typ: Box<ColumnType>,
        dimensions: u16,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(Counter),
    Decimal(BigDecimal),
    /// Days since -5877641-06-23 i.e. 2^31 days before unix epoch
    Date(CqlDate),
    Double(f64),
    Duration(CqlDuration),
    Empty,
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// Milliseconds since unix epoch
    Timestamp(CqlTimestamp),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        /// Order of `fields` must match the order of fields as defined in the UDT.
        fields: Vec<(String, Option<CqlValue>)>,
    },
    SmallInt(i16),
    TinyInt(i8),
    /// Nanoseconds since midnight
    Time(CqlTime),
    Timeuuid(CqlTimeuuid),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    Varint(BigInt),
    Vector(Vec<CqlValue>),
}

impl ColumnType {
    // Returns true if the type allows a special, empty value in addition to its
    // natural representation. For example, int represents a 32-bit integer,
    // but it can also hold a 0-bit empty value.
    pub(crate) fn supports_special_empty_value(&self) -> bool {
        #[allow(clippy::match_like_matches_macro)]
        match self {
            ColumnType::Counter
            | ColumnType::Duration
            | ColumnType::List(_)
            | ColumnType::Map(_, _)
            | ColumnType::Set(_)
            | ColumnType::UserDefinedType { .. }
            | ColumnType::Vector { .. }
            | ColumnType::Custom(_) => false,

            _ => true,
        }
    }

    /// Byte width of values of this type, if the type is fixed-width.
    /// Vector elements of fixed-width types are stored without length prefixes.
    pub fn value_width(&self) -> Option<usize> {
        match self {
            ColumnType::TinyInt | ColumnType::Boolean => Some(1),
            ColumnType::SmallInt => Some(2),
            ColumnType::Int | ColumnType::Float | ColumnType::Date => Some(4),
            ColumnType::BigInt
            | ColumnType::Double
            | ColumnType::Counter
            | ColumnType::Timestamp
            | ColumnType::Time => Some(8),
            ColumnType::Uuid | ColumnType::Timeuuid => Some(16),
            _ => None,
        }
    }
}

impl CqlValue {
    pub fn as_ascii(&self) -> Option<&String> {
        if let Self::Ascii(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_cql_date(&self) -> Option<CqlDate> {
        if let Self::Date(d) = self {
            Some(*d)
        } else {
            None
        }
    }

    pub fn as_cql_timestamp(&self) -> Option<CqlTimestamp> {
        if let Self::Timestamp(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_cql_time(&self) -> Option<CqlTime> {
        if let Self::Time(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_cql_duration(&self) -> Option<CqlDuration> {
        if let Self::Duration(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_counter(&self) -> Option<Counter> {
        if let Self::Counter(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        if let Self::Boolean(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        if let Self::Double(d) = self {
            Some(*d)
        } else {
            None
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        if let Self::Uuid(u) = self {
            Some(*u)
        } else {
            None
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        if let Self::Float(f) = self {
            Some(*f)
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        if let Self::Int(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        if let Self::BigInt(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_tinyint(&self) -> Option<i8> {
        if let Self::TinyInt(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_smallint(&self) -> Option<i16> {
        if let Self::SmallInt(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_blob(&self) -> Option<&Vec<u8>> {
        if let Self::Blob(v) = self {
            Some(v)
        } else {
            None
        }
    }

    pub fn as_text(&self) -> Option<&String> {
        if let Self::Text(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_timeuuid(&self) -> Option<CqlTimeuuid> {
        if let Self::Timeuuid(u) = self {
            Some(*u)
        } else {
            None
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) => Some(s),
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_blob(self) -> Option<Vec<u8>> {
        if let Self::Blob(b) = self {
            Some(b)
        } else {
            None
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        if let Self::Inet(a) = self {
            Some(*a)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&Vec<CqlValue>> {
        if let Self::List(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_set(&self) -> Option<&Vec<CqlValue>> {
        if let Self::Set(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&Vec<(CqlValue, CqlValue)>> {
        if let Self::Map(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_udt(&self) -> Option<&Vec<(String, Option<CqlValue>)>> {
        match self {
            Self::UserDefinedType { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&Vec<CqlValue>> {
        if let Self::Vector(v) = self {
            Some(v)
        } else {
            None
        }
    }

    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(s) => Some(s),
            Self::Set(s) => Some(s),
            Self::Vector(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_pair_vec(self) -> Option<Vec<(CqlValue, CqlValue)>> {
        if let Self::Map(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn into_udt_pair_vec(self) -> Option<Vec<(String, Option<CqlValue>)>> {
        match self {
            Self::UserDefinedType { fields, .. } => Some(fields),
            _ => None,
        }
    }

    pub fn into_varint(self) -> Option<BigInt> {
        if let Self::Varint(i) = self {
            Some(i)
        } else {
            None
        }
    }

    pub fn into_decimal(self) -> Option<BigDecimal> {
        if let Self::Decimal(i) = self {
            Some(i)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Default)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub paging_state: Option<Bytes>,
    /// Protocol 5: set when the server signals Metadata_changed; the driver
    /// must start using this id (and these columns) for the statement.
    pub new_metadata_id: Option<Bytes>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Copy, Clone)]
pub struct PartitionKeyIndex {
    /// Index in the serialized values
    pub index: u16,
    /// Sequence number in the partition key
    pub sequence: u16,
}

#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// pk_indexes are sorted by `index` and can be reordered in partition key order
    /// using the `sequence` field
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<Option<CqlValue>>,
}

impl Row {
    /// Allows converting a Row into a tuple of rust types
    pub fn into_typed<RowT: crate::frame::response::cql_to_rust::FromRow>(
        self,
    ) -> StdResult<RowT, crate::frame::response::cql_to_rust::FromRowError> {
        RowT::from_row(self)
    }
}

#[derive(Debug)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows_count: usize,
    pub rows: Vec<Row>,
    /// Original size of the serialized rows.
    pub serialized_size: usize,
}

#[derive(Debug)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(SetKeyspace),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

fn deser_table_spec(buf: &mut &[u8]) -> StdResult<TableSpec, ParseError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

pub(crate) fn deser_type(buf: &mut &[u8]) -> StdResult<ColumnType, ParseError> {
    use ColumnType::*;
    let id = types::read_short(buf)?;
    Ok(match id {
        0x0000 => {
            let type_str: String = types::read_string(buf)?.to_string();
            // Vectors and durations have no short id; they arrive as
            // marshal class names. Anything unknown stays Custom.
            match CustomTypeParser::parse(&type_str) {
                Ok(typ) => typ,
                Err(_) => Custom(type_str),
            }
        }
        0x0001 => Ascii,
        0x0002 => BigInt,
        0x0003 => Blob,
        0x0004 => Boolean,
        0x0005 => Counter,
        0x0006 => Decimal,
        0x0007 => Double,
        0x0008 => Float,
        0x0009 => Int,
        0x000B => Timestamp,
        0x000C => Uuid,
        0x000D => Text,
        0x000E => Varint,
        0x000F => Timeuuid,
        0x0010 => Inet,
        0x0011 => Date,
        0x0012 => Time,
        0x0013 => SmallInt,
        0x0014 => TinyInt,
        0x0015 => Duration,
        0x0020 => List(Box::new(deser_type(buf)?)),
        0x0021 => Map(Box::new(deser_type(buf)?), Box::new(deser_type(buf)?)),
        0x0022 => Set(Box::new(deser_type(buf)?)),
        0x0030 => {
            let keyspace: String = types::read_string(buf)?.to_string();
            let type_name: String = types::read_string(buf)?.to_string();
            let field_count: usize = types::read_short(buf)?.into();

            let field_types = (0..field_count)
                .map(|_| {
                    let field_name = types::read_string(buf)?.to_string();
                    let field_type = deser_type(buf)?;
                    Ok((field_name, field_type))
                })
                .collect::<StdResult<Vec<_>, ParseError>>()?;

            UserDefinedType {
                type_name,
                keyspace,
                field_types,
            }
        }
        0x0031 => {
            let element_count: usize = types::read_short(buf)?.into();
            let element_types = (0..element_count)
                .map(|_| deser_type(buf))
                .collect::<StdResult<Vec<_>, ParseError>>()?;
            Tuple(element_types)
        }
        id => {
            return Err(ParseError::TypeNotImplemented(id));
        }
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: &Option<TableSpec>,
    col_count: usize,
) -> StdResult<Vec<ColumnSpec>, ParseError> {
    (0..col_count)
        .map(|_| {
            // Without a global table spec, every column carries its own.
            let table_spec = match global_table_spec {
                Some(spec) => spec.clone(),
                None => deser_table_spec(buf)?,
            };
            let name = types::read_string(buf)?.to_owned();
            let typ = deser_type(buf)?;
            Ok(ColumnSpec {
                table_spec,
                name,
                typ,
            })
        })
        .collect()
}

fn deser_result_metadata(
    buf: &mut &[u8],
    version: ProtocolVersion,
) -> StdResult<ResultMetadata, ParseError> {
    const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    const HAS_MORE_PAGES: i32 = 0x0002;
    const NO_METADATA: i32 = 0x0004;
    const METADATA_CHANGED: i32 = 0x0008;

    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & HAS_MORE_PAGES != 0;
    let no_metadata = flags & NO_METADATA != 0;
    let metadata_changed = flags & METADATA_CHANGED != 0;

    let col_count: usize = types::read_int(buf)?.try_into()?;

    let paging_state = if has_more_pages {
        Some(types::read_bytes(buf)?.to_owned().into())
    } else {
        None
    };

    let new_metadata_id = if metadata_changed {
        if version < ProtocolVersion::V5 {
            return Err(ParseError::BadIncomingData(
                "Metadata_changed flag set on a pre-v5 connection".to_string(),
            ));
        }
        Some(Bytes::copy_from_slice(types::read_short_bytes(buf)?))
    } else {
        None
    };

    if no_metadata {
        return Ok(ResultMetadata {
            col_count,
            paging_state,
            new_metadata_id,
            col_specs: vec![],
        });
    }

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(ResultMetadata {
        col_count,
        paging_state,
        new_metadata_id,
        col_specs,
    })
}

fn deser_prepared_metadata(buf: &mut &[u8]) -> StdResult<PreparedMetadata, ParseError> {
    const GLOBAL_TABLES_SPEC: i32 = 0x0001;

    let flags = types::read_int(buf)?;
    let global_tables_spec = flags & GLOBAL_TABLES_SPEC != 0;

    let col_count = types::read_int_length(buf)?;

    let pk_count: usize = types::read_int(buf)?.try_into()?;

    // The wire lists bind-marker indexes in partition key order; remember
    // that order in `sequence` and sort by bind position for extraction.
    let mut pk_indexes = (0..pk_count)
        .map(|sequence| {
            Ok(PartitionKeyIndex {
                index: types::read_short(buf)?,
                sequence: sequence as u16,
            })
        })
        .collect::<StdResult<Vec<_>, ParseError>>()?;
    pk_indexes.sort_unstable_by_key(|pki| pki.index);

    let global_table_spec = if global_tables_spec {
        Some(deser_table_spec(buf)?)
    } else {
        None
    };

    let col_specs = deser_col_specs(buf, &global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

pub fn deser_cql_value(typ: &ColumnType, buf: &mut &[u8]) -> StdResult<CqlValue, ParseError> {
    use ColumnType::*;

    if buf.is_empty() && typ.supports_special_empty_value() {
        match typ {
            Ascii | Blob | Text => {
                // A zero-length string or blob is just a regular value
            }
            _ => return Ok(CqlValue::Empty),
        }
    }

    Ok(match typ {
        Custom(type_str) => {
            return Err(ParseError::BadIncomingData(format!(
                "Support for custom types is not yet implemented: {}",
                type_str
            )));
        }
        Ascii => {
            if !buf.is_ascii() {
                return Err(ParseError::BadIncomingData(
                    "ascii value contains non-ascii characters".to_string(),
                ));
            }
            CqlValue::Ascii(str::from_utf8(buf)?.to_owned())
        }
        Boolean => {
            if buf.len() != 1 {
                return Err(ParseError::BadIncomingData(format!(
                    "a boolean value needs exactly 1 byte, got {}",
                    buf.len()
                )));
            }
            CqlValue::Boolean(buf[0] != 0x00)
        }
        Blob => CqlValue::Blob(buf.to_vec()),
        Date => {
            if buf.len() != 4 {
                return Err(ParseError::BadIncomingData(format!(
                    "a date value needs exactly 4 bytes, got {}",
                    buf.len()
                )));
            }

            let date_value = buf.read_u32::<BigEndian>()?;
            CqlValue::Date(CqlDate(date_value))
        }
        Counter => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "a counter value needs exactly 8 bytes, got {}",
                    buf.len()
                )));
            }
            CqlValue::Counter(crate::frame::value::Counter(buf.read_i64::<BigEndian>()?))
        }
        Decimal => {
            let scale = types::read_int(buf)? as i64;
            let int_value = num_bigint::BigInt::from_signed_bytes_be(buf);
            let big_decimal: BigDecimal = BigDecimal::from((int_value, scale));

            CqlValue::Decimal(big_decimal)
        }
        Double => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "a double value needs exactly 8 bytes, got {}",
                    buf.len()
                )));
            }
            CqlValue::Double(buf.read_f64::<BigEndian>()?)
        }
        Float => {
            if buf.len() != 4 {
                return Err(ParseError::BadIncomingData(format!(
                    "a float value needs exactly 4 bytes, got {}",
                    buf.len()
                )));
            }
            CqlValue::Float(buf.read_f32::<BigEndian>()?)
        }
        Int => {
            if buf.len() != 4 {
                return Err(ParseError::BadIncomingData(format!(
                    "an int value needs exactly 4 bytes, got {}",
                    buf.len()
                )));
            }
            CqlValue::Int(buf.read_i32::<BigEndian>()?)
        }
        SmallInt => {
            if buf.len() != 2 {
                return Err(ParseError::BadIncomingData(format!(
                    "a smallint value needs exactly 2 bytes, got {}",
                    buf.len()
                )));
            }

            CqlValue::SmallInt(buf.read_i16::<BigEndian>()?)
        }
        TinyInt => {
            if buf.len() != 1 {
                return Err(ParseError::BadIncomingData(format!(
                    "a tinyint value needs exactly 1 byte, got {}",
                    buf.len()
                )));
            }

            CqlValue::TinyInt(buf.read_i8()?)
        }
        BigInt => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "a bigint value needs exactly 8 bytes, got {}",
                    buf.len()
                )));
            }

            CqlValue::BigInt(buf.read_i64::<BigEndian>()?)
        }
        Text => CqlValue::Text(str::from_utf8(buf)?.to_owned()),
        Timestamp => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "a timestamp value needs exactly 8 bytes, got {}",
                    buf.len()
                )));
            }

            CqlValue::Timestamp(CqlTimestamp(buf.read_i64::<BigEndian>()?))
        }
        Time => {
            if buf.len() != 8 {
                return Err(ParseError::BadIncomingData(format!(
                    "a time value needs exactly 8 bytes, got {}",
                    buf.len()
                )));
            }

            let nanoseconds: i64 = buf.read_i64::<BigEndian>()?;

            // Valid values are in the range 0 to 86399999999999
            if !(0..=86399999999999).contains(&nanoseconds) {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid time value: {}",
                    nanoseconds
                )));
            }

            CqlValue::Time(CqlTime(nanoseconds))
        }
        Duration => {
            let months_i64 = vint_decode(buf).map_err(|_| {
                ParseError::BadIncomingData("duration is missing its months vint".to_string())
            })?;
            let days_i64 = vint_decode(buf).map_err(|_| {
                ParseError::BadIncomingData("duration is missing its days vint".to_string())
            })?;
            let nanoseconds = vint_decode(buf).map_err(|_| {
                ParseError::BadIncomingData("duration is missing its nanoseconds vint".to_string())
            })?;

            let months = months_i64.try_into().map_err(|_| {
                ParseError::BadIncomingData(format!(
                    "duration months exceed the 32-bit range: {}",
                    months_i64
                ))
            })?;
            let days = days_i64.try_into().map_err(|_| {
                ParseError::BadIncomingData(format!(
                    "duration days exceed the 32-bit range: {}",
                    days_i64
                ))
            })?;

            CqlValue::Duration(CqlDuration {
                months,
                days,
                nanoseconds,
            })
        }
        Inet => CqlValue::Inet(match buf.len() {
            4 => {
                let ret = IpAddr::from(<[u8; 4]>::try_from(&buf[0..4])?);
                buf.advance(4);
                ret
            }
            16 => {
                let ret = IpAddr::from(<[u8; 16]>::try_from(&buf[0..16])?);
                buf.advance(16);
                ret
            }
            v => {
                return Err(ParseError::BadIncomingData(format!(
                    "Invalid inet bytes length: {}",
                    v
                )));
            }
        }),
        Uuid => {
            if buf.len() != 16 {
                return Err(ParseError::BadIncomingData(format!(
                    "uuid must be exactly 16 bytes long, found {} bytes",
                    buf.len()
                )));
            }
            let uuid = uuid::Uuid::from_slice(buf).expect("Deserializing Uuid failed.");
            CqlValue::Uuid(uuid)
        }
        Timeuuid => {
            if buf.len() != 16 {
                return Err(ParseError::BadIncomingData(format!(
                    "timeuuid must be exactly 16 bytes long, found {} bytes",
                    buf.len()
                )));
            }
            let uuid = uuid::Uuid::from_slice(buf).expect("Deserializing Uuid failed.");
            CqlValue::Timeuuid(CqlTimeuuid::from(uuid))
        }
        Varint => CqlValue::Varint(num_bigint::BigInt::from_signed_bytes_be(buf)),
        List(type_name) => {
            let len: usize = types::read_int_length(buf)?;
            let mut res = Vec::with_capacity(len);
            for _ in 0..len {
                // length -1 inside a collection means an absent element
                match types::read_bytes_opt(buf)? {
                    Some(mut b) => res.push(deser_cql_value(type_name, &mut b)?),
                    None => res.push(CqlValue::Empty),
                }
            }
            CqlValue::List(res)
        }
        Map(key_type, value_type) => {
            let len: usize = types::read_int_length(buf)?;
            let mut res = Vec::with_capacity(len);
            for _ in 0..len {
                let mut b = types::read_bytes(buf)?;
                let key = deser_cql_value(key_type, &mut b)?;
                b = types::read_bytes(buf)?;
                let val = deser_cql_value(value_type, &mut b)?;
                res.push((key, val));
            }
            CqlValue::Map(res)
        }
        Set(type_name) => {
            let len: usize = types::read_int_length(buf)?;
            let mut res = Vec::with_capacity(len);
            for _ in 0..len {
                match types::read_bytes_opt(buf)? {
                    Some(mut b) => res.push(deser_cql_value(type_name, &mut b)?),
                    None => res.push(CqlValue::Empty),
                }
            }
            CqlValue::Set(res)
        }
        UserDefinedType {
            type_name,
            keyspace,
            field_types,
        } => {
            let mut fields: Vec<(String, Option<CqlValue>)> = Vec::new();

            for (field_name, field_type) in field_types {
                // Trailing fields can be absent
                if buf.is_empty() {
                    break;
                }

                let mut field_value: Option<CqlValue> = None;
                if let Some(mut field_val_bytes) = types::read_bytes_opt(buf)? {
                    field_value = Some(deser_cql_value(field_type, &mut field_val_bytes)?);
                }

                fields.push((field_name.clone(), field_value));
            }

            CqlValue::UserDefinedType {
                type_name: type_name.clone(),
                keyspace: keyspace.clone(),
                fields,
            }
        }
        Tuple(type_names) => {
            let mut res = Vec::with_capacity(type_names.len());
            for type_name in type_names {
                match types::read_bytes_opt(buf)? {
                    Some(mut b) => res.push(Some(deser_cql_value(type_name, &mut b)?)),
                    None => res.push(None),
                };
            }

            CqlValue::Tuple(res)
        }
        Vector { typ, dimensions } => {
            let declared: usize = *dimensions as usize;
            let mut elements: Vec<CqlValue> = Vec::with_capacity(declared);

            match typ.value_width() {
                Some(width) => {
                    if buf.len() % width != 0 {
                        return Err(ParseError::BadIncomingData(format!(
                            "vector value length {} is not a multiple of the element width {}",
                            buf.len(),
                            width
                        )));
                    }
                    let received = buf.len() / width;
                    if received != declared {
                        return Err(ParseError::BadIncomingData(format!(
                            "expected vector with {} dimensions, received {}",
                            declared, received
                        )));
                    }
                    for _ in 0..declared {
                        let mut raw = read_exact_slice(width, buf)?;
                        elements.push(deser_cql_value(typ, &mut raw)?);
                    }
                }
                None => {
                    while !buf.is_empty() {
                        let element_len = unsigned_vint_decode(buf).map_err(|_| {
                            ParseError::BadIncomingData(
                                "vector element is missing its length vint".to_string(),
                            )
                        })? as usize;
                        let mut raw = read_exact_slice(element_len, buf)?;
                        elements.push(deser_cql_value(typ, &mut raw)?);
                    }
                    if elements.len() != declared {
                        return Err(ParseError::BadIncomingData(format!(
                            "expected vector with {} dimensions, received {}",
                            declared,
                            elements.len()
                        )));
                    }
                }
            }

            CqlValue::Vector(elements)
        }
    })
}

fn deser_rows(buf: &mut &[u8], version: ProtocolVersion) -> StdResult<Rows, ParseError> {
    let metadata = deser_result_metadata(buf, version)?;

    let original_size = buf.len();

    // Parse rows eagerly; the metadata determines the shape of every row.
    let rows_count: usize = types::read_int(buf)?.try_into()?;

    let mut rows = Vec::with_capacity(rows_count);
    for _ in 0..rows_count {
        let mut columns = Vec::with_capacity(metadata.col_count);
        for i in 0..metadata.col_count {
            let v = if let Some(mut b) = types::read_bytes_opt(buf)? {
                // Metadata can be legitimately missing (SKIP_METADATA); in
                // that case rows cannot be decoded into values.
                let col_spec = metadata.col_specs.get(i).ok_or_else(|| {
                    ParseError::BadIncomingData(
                        "Row received without result metadata".to_string(),
                    )
                })?;
                Some(deser_cql_value(&col_spec.typ, &mut b)?)
            } else {
                None
            };
            columns.push(v);
        }
        rows.push(Row { columns });
    }
    Ok(Rows {
        metadata,
        rows_count,
        rows,
        serialized_size: original_size - buf.len(),
    })
}

fn deser_set_keyspace(buf: &mut &[u8]) -> StdResult<SetKeyspace, ParseError> {
    let keyspace_name: String = types::read_string(buf)?.to_string();

    Ok(SetKeyspace { keyspace_name })
}

fn deser_prepared(buf: &mut &[u8], version: ProtocolVersion) -> StdResult<Prepared, ParseError> {
    let id_len = types::read_short(buf)? as usize;
    let id: Bytes = buf[0..id_len].to_owned().into();
    buf.advance(id_len);

    let result_metadata_id = if version >= ProtocolVersion::V5 {
        Some(Bytes::copy_from_slice(types::read_short_bytes(buf)?))
    } else {
        None
    };

    let prepared_metadata = deser_prepared_metadata(buf)?;
    let result_metadata = deser_result_metadata(buf, version)?;
    Ok(Prepared {
        id,
        result_metadata_id,
        prepared_metadata,
        result_metadata,
    })
}

fn deser_schema_change(buf: &mut &[u8]) -> StdResult<SchemaChange, ParseError> {
    Ok(SchemaChange {
        event: SchemaChangeEvent::deserialize(buf)?,
    })
}

pub fn deserialize(buf: &mut &[u8], version: ProtocolVersion) -> StdResult<Result, ParseError> {
    use self::Result::*;
    Ok(match types::read_int(buf)? {
        0x0001 => Void,
        0x0002 => Rows(deser_rows(buf, version)?),
        0x0003 => SetKeyspace(deser_set_keyspace(buf)?),
        0x0004 => Prepared(deser_prepared(buf, version)?),
        0x0005 => SchemaChange(deser_schema_change(buf)?),
        k => {
            return Err(ParseError::BadIncomingData(format!(
                "Unknown query result kind: {}",
                k
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types;

    fn rows_body(flags: i32, extra: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut body = Vec::new();
        types::write_int(0x0002, &mut body); // kind: Rows
        types::write_int(flags, &mut body);
        types::write_int(0, &mut body); // col count
        extra(&mut body);
        types::write_int(0, &mut body); // rows count
        body
    }

    #[test]
    fn metadata_changed_carries_the_new_id_on_v5() {
        const METADATA_CHANGED: i32 = 0x0008;
        const NO_METADATA: i32 = 0x0004;

        let body = rows_body(METADATA_CHANGED | NO_METADATA, |body| {
            types::write_short_bytes(b"new_metadata_id", body).unwrap();
        });

        let result = deserialize(&mut &body[..], ProtocolVersion::V5).unwrap();
        match result {
            Result::Rows(rows) => {
                assert_eq!(
                    rows.metadata.new_metadata_id,
                    Some(Bytes::from_static(b"new_metadata_id"))
                );
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn metadata_changed_is_rejected_below_v5() {
        const METADATA_CHANGED: i32 = 0x0008;
        const NO_METADATA: i32 = 0x0004;

        let body = rows_body(METADATA_CHANGED | NO_METADATA, |body| {
            types::write_short_bytes(b"new_metadata_id", body).unwrap();
        });

        assert!(deserialize(&mut &body[..], ProtocolVersion::V4).is_err());
    }

    #[test]
    fn paging_state_is_extracted() {
        const HAS_MORE_PAGES: i32 = 0x0002;
        const NO_METADATA: i32 = 0x0004;

        let body = rows_body(HAS_MORE_PAGES | NO_METADATA, |body| {
            types::write_bytes(b"next_page", body).unwrap();
        });

        let result = deserialize(&mut &body[..], ProtocolVersion::V4).unwrap();
        match result {
            Result::Rows(rows) => {
                assert_eq!(
                    rows.metadata.paging_state,
                    Some(Bytes::from_static(b"next_page"))
                );
                assert_eq!(rows.rows_count, 0);
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[test]
    fn prepared_statement_with_pk_indexes() {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body); // kind: Prepared
        types::write_short_bytes(b"id", &mut body).unwrap();
        types::write_int(0, &mut body); // prepared metadata flags
        types::write_int(2, &mut body); // col count
        types::write_int(2, &mut body); // pk count
        types::write_short(1, &mut body); // second value first in the key
        types::write_short(0, &mut body);
        for (name, id) in [("b", 0x0009_u16), ("a", 0x000D_u16)] {
            types::write_string("ks", &mut body).unwrap();
            types::write_string("t", &mut body).unwrap();
            types::write_string(name, &mut body).unwrap();
            types::write_short(id, &mut body);
        }
        types::write_int(0, &mut body); // result metadata flags
        types::write_int(0, &mut body); // result metadata col count

        let result = deserialize(&mut &body[..], ProtocolVersion::V4).unwrap();
        let prepared = match result {
            Result::Prepared(prepared) => prepared,
            other => panic!("expected prepared, got {:?}", other),
        };
        assert_eq!(prepared.id, Bytes::from_static(b"id"));
        assert!(prepared.result_metadata_id.is_none());

        // pk_indexes are sorted by index, with sequence remembering
        // the partition key order.
        let indexes: Vec<(u16, u16)> = prepared
            .prepared_metadata
            .pk_indexes
            .iter()
            .map(|pki| (pki.index, pki.sequence))
            .collect();
        assert_eq!(indexes, vec![(0, 1), (1, 0)]);

        assert_eq!(prepared.prepared_metadata.col_specs.len(), 2);
        assert_eq!(prepared.prepared_metadata.col_specs[0].typ, ColumnType::Int);
        assert_eq!(prepared.prepared_metadata.col_specs[1].typ, ColumnType::Text);
    }
}
