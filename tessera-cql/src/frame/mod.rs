pub mod frame_errors;
pub mod request;
pub mod response;
pub mod segment;
pub mod server_event_type;
pub mod types;
pub mod value;

#[cfg(test)]
mod value_tests;

use crate::frame::frame_errors::FrameError;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::fmt::Display;
use std::{collections::HashMap, convert::TryFrom};

use request::SerializableRequest;
use response::ResponseOpcode;

pub(crate) const HEADER_SIZE: usize = 9;

// Frame flags
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;
const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
const FLAG_WARNING: u8 = 0x08;

/// Native protocol version spoken on a connection.
///
/// Versions 1 and 2 are legacy and rejected during negotiation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ProtocolVersion {
    V3 = 3,
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    pub const DEFAULT: ProtocolVersion = ProtocolVersion::V4;

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Protocol 5 moves framing to the checksummed segment layer
    /// once the connection handshake completes.
    pub fn uses_segment_framing(self) -> bool {
        self >= ProtocolVersion::V5
    }

    /// The next lower supported version, used when the server rejects ours.
    pub fn try_downgrade(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V5 => Some(ProtocolVersion::V4),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => None,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: other,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_byte())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm. Not usable on protocol 5.
    Snappy,
}

impl Compression {
    pub fn is_allowed_on(self, version: ProtocolVersion) -> bool {
        match self {
            Compression::Lz4 => true,
            Compression::Snappy => version < ProtocolVersion::V5,
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Lz4 => f.write_str("lz4"),
            Compression::Snappy => f.write_str("snappy"),
        }
    }
}

pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, FrameError> {
        let mut flags = 0;
        if tracing {
            flags |= FLAG_TRACING;
        }

        // On protocol 5 bodies are left uncompressed here; compression
        // happens in the segment layer for the whole byte stream.
        let mut body = Vec::new();
        if let (Some(compression), false) = (compression, version.uses_segment_framing()) {
            flags |= FLAG_COMPRESSION;
            let uncompressed = req.to_bytes(version)?;
            compress_append(&uncompressed, compression, &mut body)?;
        } else {
            req.serialize(version, &mut body)?;
        }

        let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
        data.push(version.as_byte());
        data.push(flags);
        data.extend_from_slice(&0_i16.to_be_bytes()); // stream, patched later
        data.push(R::OPCODE as u8);
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(&body);

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

fn parse_response_header(
    raw_header: &[u8; HEADER_SIZE],
    expected_version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, usize), FrameError> {
    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & 0x80 != 0x80 {
        return Err(FrameError::FrameFromClient);
    }
    if version & 0x7F != expected_version.as_byte() {
        return Err(FrameError::VersionMismatch(
            version & 0x7F,
            expected_version.as_byte(),
        ));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;
    let length = buf.get_u32() as usize;

    Ok((frame_params, opcode, length))
}

/// Reads a single legacy-framed response from the stream.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
    expected_version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let (frame_params, opcode, length) = parse_response_header(&raw_header, expected_version)?;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Parses a whole response frame out of an in-memory buffer, as extracted
/// from the protocol-5 segment layer.
pub fn parse_response_frame(
    mut frame: Bytes,
    expected_version: ProtocolVersion,
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    if frame.len() < HEADER_SIZE {
        return Err(FrameError::ConnectionClosed(
            HEADER_SIZE - frame.len(),
            HEADER_SIZE,
        ));
    }
    let mut raw_header = [0u8; HEADER_SIZE];
    raw_header.copy_from_slice(&frame[..HEADER_SIZE]);
    frame.advance(HEADER_SIZE);

    let (frame_params, opcode, length) = parse_response_header(&raw_header, expected_version)?;
    if frame.len() != length {
        return Err(FrameError::ConnectionClosed(
            length.saturating_sub(frame.len()),
            length,
        ));
    }

    Ok((frame_params, opcode, frame))
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        match compression {
            Some(compression) => body = decompress(&body, compression)?.into(),
            None => return Err(FrameError::NoCompressionNegotiated),
        }
    }

    // The flag-dependent extensions precede the proper body; read them
    // off a cursor, then chop the consumed prefix once.
    let mut cursor: &[u8] = &body;

    let trace_id = match flags & FLAG_TRACING {
        0 => None,
        _ => Some(types::read_uuid(&mut cursor)?),
    };

    let warnings = match flags & FLAG_WARNING {
        0 => Vec::new(),
        _ => types::read_string_list(&mut cursor)?,
    };

    let custom_payload = match flags & FLAG_CUSTOM_PAYLOAD {
        0 => None,
        _ => Some(types::read_bytes_map(&mut cursor)?),
    };

    let consumed = body.len() - cursor.len();
    body.advance(consumed);

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

// Legacy (pre-v5) body compression. An lz4 body is prefixed with the
// uncompressed length; snappy bodies are self-describing.
fn compress_append(
    body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    match compression {
        Compression::Lz4 => {
            out.put_u32(body.len() as u32);
            out.extend_from_slice(&lz4_flex::compress(body));
        }
        Compression::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(body)
                .map_err(|_| FrameError::FrameCompression)?;
            out.extend_from_slice(&compressed);
        }
    }
    Ok(())
}

fn decompress(mut body: &[u8], compression: Compression) -> Result<Vec<u8>, FrameError> {
    match compression {
        Compression::Lz4 => {
            let decompressed_len = body.get_u32() as usize;
            Ok(lz4_flex::decompress(body, decompressed_len)?)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(body)
            .map_err(|_| FrameError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    pub(crate) enum_name: &'static str,
    pub(crate) primitive: T,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_compression_round_trips() {
        let body = b"repetitive repetitive repetitive payload".repeat(64);

        for compression in [Compression::Lz4, Compression::Snappy] {
            let mut compressed = Vec::new();
            compress_append(&body, compression, &mut compressed).unwrap();
            // A repetitive body must actually shrink.
            assert!(compressed.len() < body.len(), "{}", compression);

            let restored = decompress(&compressed, compression).unwrap();
            assert_eq!(restored, body, "{}", compression);
        }
    }

    #[test]
    fn request_frames_carry_version_opcode_and_length() {
        let request = crate::frame::request::Startup {
            options: std::collections::HashMap::new(),
        };
        let mut serialized =
            SerializedRequest::make(&request, ProtocolVersion::V4, None, false).unwrap();
        serialized.set_stream(7);

        let data = serialized.get_data();
        assert_eq!(data[0], 0x04);
        assert_eq!(i16::from_be_bytes([data[2], data[3]]), 7);
        assert_eq!(data[4], 0x01); // STARTUP
        let body_len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        assert_eq!(data.len(), HEADER_SIZE + body_len);
    }

    #[test]
    fn version_negotiation_order() {
        assert_eq!(
            ProtocolVersion::V5.try_downgrade(),
            Some(ProtocolVersion::V4)
        );
        assert_eq!(
            ProtocolVersion::V4.try_downgrade(),
            Some(ProtocolVersion::V3)
        );
        assert_eq!(ProtocolVersion::V3.try_downgrade(), None);
    }

    #[test]
    fn snappy_rejected_on_v5() {
        assert!(Compression::Snappy.is_allowed_on(ProtocolVersion::V4));
        assert!(!Compression::Snappy.is_allowed_on(ProtocolVersion::V5));
        assert!(Compression::Lz4.is_allowed_on(ProtocolVersion::V5));
    }
}
