//! CQL binary protocol in-wire types.

use super::frame_errors::ParseError;
use super::TryFromPrimitiveError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::str;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    #[default]
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,

    // SELECT statements may use Serial or LocalSerial to read
    // the most recent Paxos state.
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x000A => Ok(Consistency::LocalOne),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            _ => Err(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: value,
            }),
        }
    }
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<i16> for SerialConsistency {
    type Error = TryFromPrimitiveError<i16>;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0x0008 => Ok(Self::Serial),
            0x0009 => Ok(Self::LocalSerial),
            _ => Err(TryFromPrimitiveError {
                enum_name: "SerialConsistency",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug, Error)]
#[error("Expected Consistency Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            _ => Err(NonSerialConsistencyError(c)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A single `[value]` as encoded in requests: null, unset or raw bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

impl<'a> RawValue<'a> {
    #[inline]
    pub fn as_value(&self) -> Option<&'a [u8]> {
        match self {
            RawValue::Value(v) => Some(v),
            RawValue::Null | RawValue::Unset => None,
        }
    }
}

pub(crate) fn read_exact_slice<'a>(count: usize, buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    if buf.len() < count {
        return Err(ParseError::BadIncomingData(format!(
            "Not enough bytes! expected: {} received: {}",
            count,
            buf.len(),
        )));
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, ParseError> {
    let v = buf.read_i32::<BigEndian>()?;
    Ok(v)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub(crate) fn read_int_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let v = read_int(buf)?;
    let v: usize = v.try_into()?;

    Ok(v)
}

fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let v: i32 = v.try_into()?;

    write_int(v, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, ParseError> {
    let v = buf.read_i64::<BigEndian>()?;
    Ok(v)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, ParseError> {
    let v = buf.read_u16::<BigEndian>()?;
    Ok(v)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, ParseError> {
    let v = read_short(buf)?;
    let v: usize = v.into();
    Ok(v)
}

fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, ParseError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    let v = Some(read_exact_slice(len, buf)?);
    Ok(v)
}

// Same as read_bytes_opt, but the value must not be `null`.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_int_length(buf)?;
    let v = read_exact_slice(len, buf)?;
    Ok(v)
}

pub fn read_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, ParseError> {
    let len = read_int(buf)?;
    match len {
        -2 => Ok(RawValue::Unset),
        -1 => Ok(RawValue::Null),
        len if len >= 0 => {
            let v = read_exact_slice(len as usize, buf)?;
            Ok(RawValue::Value(v))
        }
        len => Err(ParseError::BadIncomingData(format!(
            "Invalid value length: {}",
            len,
        ))),
    }
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], ParseError> {
    let len = read_short_length(buf)?;
    let v = read_exact_slice(len, buf)?;
    Ok(v)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(v: Option<impl AsRef<[u8]>>, buf: &mut impl BufMut) -> Result<(), ParseError> {
    match v {
        Some(bytes) => {
            write_int_length(bytes.as_ref().len(), buf)?;
            buf.put_slice(bytes.as_ref());
        }
        None => write_int(-1, buf),
    }

    Ok(())
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_bytes_map(buf: &mut &[u8]) -> Result<HashMap<String, Bytes>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = Bytes::copy_from_slice(read_bytes(buf)?);
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_bytes_map<B>(v: &HashMap<String, B>, buf: &mut impl BufMut) -> Result<(), ParseError>
where
    B: AsRef<[u8]>,
{
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_bytes(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_short_length(buf)?;
    let raw = read_exact_slice(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let raw = v.as_bytes();
    write_short_length(v.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, ParseError> {
    let len = read_int_length(buf)?;
    let raw = read_exact_slice(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), ParseError> {
    let raw = v.as_bytes();
    write_int_length(raw.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for v in v.iter() {
        write_string(v, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(buf: &mut &[u8]) -> Result<HashMap<String, Vec<String>>, ParseError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), ParseError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, ParseError> {
    let raw = read_exact_slice(16, buf)?;

    // Infallible: read_exact_slice returned exactly 16 bytes.
    let raw_array: &[u8; 16] = raw.try_into().expect("slice length checked");

    Ok(Uuid::from_bytes(*raw_array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid.as_bytes()[..]);
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, ParseError> {
    let raw = buf.read_u16::<BigEndian>()?;
    let parsed = Consistency::try_from(raw)?;
    Ok(parsed)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    buf.put_u16(c as u16);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    buf.put_u16(c as u16);
}

pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, ParseError> {
    let len = buf.read_u8()?;
    let ip_addr = match len {
        4 => {
            let ret = IpAddr::from(<[u8; 4]>::try_from(read_exact_slice(4, buf)?)?);
            ret
        }
        16 => {
            let ret = IpAddr::from(<[u8; 16]>::try_from(read_exact_slice(16, buf)?)?);
            ret
        }
        v => {
            return Err(ParseError::BadIncomingData(format!(
                "Invalid inet bytes length: {}",
                v,
            )))
        }
    };
    let port = read_int(buf)?;

    Ok(SocketAddr::new(ip_addr, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }

    write_int(addr.port() as i32, buf)
}

// The zig-zag transform interleaves negative numbers between positive
// ones (0, -1, 1, -2, ...), so that small magnitudes of either sign
// encode into few vint bytes.
fn zig_zag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zig_zag_decode(v: u64) -> i64 {
    let sign = -((v & 1) as i64);
    ((v >> 1) as i64) ^ sign
}

// An unsigned vint carries the continuation count in the first byte:
// the number of leading one bits equals the number of bytes that follow.
// The remaining bits of the first byte and all following bytes hold the
// value, big-endian.
pub(crate) fn unsigned_vint_encode(value: u64, buf: &mut Vec<u8>) {
    let significant_bits = (64 - value.leading_zeros()).max(1) as usize;

    // The first byte contributes (7 - extra) value bits, every
    // continuation byte contributes 8, so capacity is 7 + 7 * extra.
    let extra_bytes = if significant_bits <= 7 {
        0
    } else {
        ((significant_bits - 8) / 7 + 1).min(8)
    };

    if extra_bytes == 8 {
        buf.put_u8(0xFF);
        buf.extend_from_slice(&value.to_be_bytes());
        return;
    }

    let continuation_marker: u8 = if extra_bytes == 0 {
        0
    } else {
        0xFF << (8 - extra_bytes)
    };
    buf.put_u8(continuation_marker | (value >> (8 * extra_bytes)) as u8);
    for shift in (0..extra_bytes).rev() {
        buf.put_u8((value >> (8 * shift)) as u8);
    }
}

pub(crate) fn unsigned_vint_decode(buf: &mut &[u8]) -> Result<u64, std::io::Error> {
    let first = buf.read_u8()?;
    let extra_bytes = first.leading_ones() as usize;

    // With 7 or 8 continuation bytes the first byte holds no value bits.
    let mut value = if extra_bytes >= 7 {
        0
    } else {
        u64::from(first & (0xFF >> (extra_bytes + 1)))
    };
    for _ in 0..extra_bytes.min(8) {
        value = (value << 8) | u64::from(buf.read_u8()?);
    }

    Ok(value)
}

pub(crate) fn vint_encode(v: i64, buf: &mut Vec<u8>) {
    unsigned_vint_encode(zig_zag_encode(v), buf)
}

pub(crate) fn vint_decode(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    unsigned_vint_decode(buf).map(zig_zag_decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn type_int() {
        let vals = [i32::MIN, -1, 0, 1, i32::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_int(*val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long() {
        let vals = [i64::MIN, -1, 0, 1, i64::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long(*val, &mut buf);
            assert_eq!(read_long(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_short() {
        let vals: [u16; 3] = [0, 1, u16::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_short(*val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_string(val, &mut buf).unwrap();
            assert_eq!(read_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_long_string() {
        let vals = [String::from(""), String::from("hello, world!")];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_long_string(val, &mut buf).unwrap();
            assert_eq!(read_long_string(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string_map() {
        let mut val = HashMap::new();
        val.insert(String::from(""), String::from(""));
        val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
        val.insert(String::from("THROW_ON_OVERLOAD"), String::from(""));
        let mut buf = Vec::new();
        write_string_map(&val, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_string_list() {
        let val = vec![
            "".to_owned(),
            "CQL_VERSION".to_owned(),
            "THROW_ON_OVERLOAD".to_owned(),
        ];

        let mut buf = Vec::new();
        write_string_list(&val, &mut buf).unwrap();
        assert_eq!(read_string_list(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_string_multimap() {
        let mut val = HashMap::new();
        val.insert(String::from(""), vec![String::from("")]);
        val.insert(
            String::from("versions"),
            vec![String::from("3.0.0"), String::from("4.2.0")],
        );
        val.insert(String::from("empty"), vec![]);
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn type_uuid() {
        let u = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let mut buf = Vec::new();
        write_uuid(&u, &mut buf);
        let u2 = read_uuid(&mut &*buf).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn type_consistency() {
        let c = Consistency::Quorum;
        let mut buf = Vec::new();
        write_consistency(c, &mut buf);
        let c2 = read_consistency(&mut &*buf).unwrap();
        assert_eq!(c, c2);

        let c: i16 = 0x1234;
        buf.clear();
        buf.put_i16(c);
        let c_result = read_consistency(&mut &*buf);
        assert!(c_result.is_err());

        let err_str = format!("{}", c_result.unwrap_err());
        assert!(err_str.contains(&format!("{}", c)));
    }

    #[test]
    fn type_inet() {
        use std::net::{Ipv4Addr, Ipv6Addr};

        let iv4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1234);
        let iv6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 2345);
        let mut buf = Vec::new();

        write_inet(iv4, &mut buf);
        let read_iv4 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv4, read_iv4);
        buf.clear();

        write_inet(iv6, &mut buf);
        let read_iv6 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv6, read_iv6);
    }

    #[test]
    fn zig_zag_round_trip() {
        assert_eq!(zig_zag_encode(0), 0);
        assert_eq!(zig_zag_encode(-1), 1);
        assert_eq!(zig_zag_encode(1), 2);
        assert_eq!(zig_zag_encode(-2), 3);
        assert_eq!(zig_zag_decode(0), 0);
        assert_eq!(zig_zag_decode(1), -1);
        assert_eq!(zig_zag_decode(2), 1);
        assert_eq!(zig_zag_decode(3), -2);
    }

    #[test]
    fn unsigned_vint_boundaries() {
        // Boundary cases around every length change of the encoding.
        let cases: &[(u64, &[u8])] = &[
            (0, &[0]),
            (1, &[1]),
            ((1 << 7) - 1, &[127]),
            (1 << 7, &[128, 128]),
            ((1 << 8) - 1, &[128, 255]),
            (1 << 8, &[129, 0]),
            ((1 << 14) - 1, &[191, 255]),
            (1 << 14, &[192, 64, 0]),
            ((1 << 21) - 1, &[223, 255, 255]),
            (1 << 21, &[224, 32, 0, 0]),
            ((1 << 28) - 1, &[239, 255, 255, 255]),
            (1 << 28, &[240, 16, 0, 0, 0]),
            ((1 << 35) - 1, &[247, 255, 255, 255, 255]),
            (1 << 35, &[248, 8, 0, 0, 0, 0]),
            ((1 << 42) - 1, &[251, 255, 255, 255, 255, 255]),
            (1 << 42, &[252, 4, 0, 0, 0, 0, 0]),
            ((1 << 49) - 1, &[253, 255, 255, 255, 255, 255, 255]),
            (1 << 49, &[254, 2, 0, 0, 0, 0, 0, 0]),
            ((1 << 56) - 1, &[254, 255, 255, 255, 255, 255, 255, 255]),
            (1 << 56, &[255, 1, 0, 0, 0, 0, 0, 0, 0]),
            (u64::MAX, &[255, 255, 255, 255, 255, 255, 255, 255, 255]),
        ];

        let mut buf = Vec::new();
        for (v, expected) in cases {
            unsigned_vint_encode(*v, &mut buf);
            assert_eq!(&buf[..], *expected);
            let decoded = unsigned_vint_decode(&mut buf.as_slice()).unwrap();
            assert_eq!(decoded, *v);
            buf.clear();
        }
    }

    #[test]
    fn vint_round_trip() {
        let mut buf: Vec<u8> = Vec::with_capacity(128);

        let mut check = |n: i64| {
            vint_encode(n, &mut buf);
            assert_eq!(vint_decode(&mut buf.as_slice()).unwrap(), n);
            buf.clear();
        };

        for i in 0..63 {
            check((1 << i) - 1);
            check(1 - (1 << i));
            check(1 << i);
            check(-(1 << i));
        }
        check(i64::MAX);
        check(i64::MIN);
    }
}
