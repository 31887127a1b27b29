use super::TryFromPrimitiveError;
use crate::frame::value::SerializeValuesError;
use thiserror::Error;

/// An error that occurred when parsing a frame body received from the server.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Could not parse frame body: {0}")]
    BadIncomingData(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Type with id {0:#06x} is not yet implemented")]
    TypeNotImplemented(u16),
    #[error(transparent)]
    SerializeValuesError(#[from] SerializeValuesError),
    #[error("Could not parse custom type name: {0}")]
    CustomTypeParseError(String),
    #[error(transparent)]
    IntConversion(#[from] std::num::TryFromIntError),
}

impl<T: Copy + std::fmt::Debug> From<TryFromPrimitiveError<T>> for ParseError {
    fn from(err: TryFromPrimitiveError<T>) -> Self {
        ParseError::BadIncomingData(err.to_string())
    }
}

impl From<std::str::Utf8Error> for ParseError {
    fn from(err: std::str::Utf8Error) -> Self {
        ParseError::BadIncomingData(format!("UTF8 deserialization failed: {}", err))
    }
}

impl From<std::array::TryFromSliceError> for ParseError {
    fn from(err: std::array::TryFromSliceError) -> Self {
        ParseError::BadIncomingData(format!("Slice conversion failed: {}", err))
    }
}

/// An error that occurred at the framing layer, fatal for the connection.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Frame uses protocol version {0}, expected {1}")]
    VersionMismatch(u8, u8),
    #[error("Connection was closed before body was read: missing {0} out of {1} bytes")]
    ConnectionClosed(usize, usize),
    #[error("Frame decompression failed")]
    FrameDecompression,
    #[error("Frame compression failed")]
    FrameCompression,
    #[error(transparent)]
    StdIoError(#[from] std::io::Error),
    #[error(transparent)]
    UnexpectedOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Request serialization failed: {0}")]
    BadDataToSerialize(String),
    #[error(transparent)]
    Lz4CompressError(#[from] lz4_flex::block::CompressError),
    #[error(transparent)]
    Lz4DecompressError(#[from] lz4_flex::block::DecompressError),
    #[error("Segment header CRC24 mismatch: computed {computed:#08x}, received {received:#08x}")]
    HeaderCrcMismatch { computed: u32, received: u32 },
    #[error("Segment payload CRC32 mismatch: computed {computed:#010x}, received {received:#010x}")]
    PayloadCrcMismatch { computed: u32, received: u32 },
    #[error("Segment payload length {0} exceeds the maximum of 131071 bytes")]
    SegmentTooLarge(usize),
    #[error("A non-self-contained segment does not hold a whole frame header")]
    IncompleteBigFrameHeader,
}
