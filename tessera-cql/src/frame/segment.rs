//! Protocol 5 checksummed segment layer.
//!
//! Once the handshake completes on a protocol-5 connection, the byte stream
//! between peers is chopped into segments of at most 128 KiB - 1 payload
//! bytes, each protected by a CRC-24 over the header and a CRC-32 over the
//! payload. Several small frames may share a single self-contained segment;
//! a frame that exceeds the budget is sliced across multiple segments, none
//! of which are self-contained.

use super::frame_errors::FrameError;
use super::{Compression, HEADER_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum payload carried by one segment: 128 KiB - 1.
pub const MAX_PAYLOAD_SIZE: usize = 128 * 1024 - 1;

const CRC24_INIT: u32 = 0x875060;
const CRC24_POLY: u32 = 0x1974F0B;

// The CRC32 of an empty buffer is 0; seeding the hasher guards
// zero-length payloads against all-zero corruption.
const CRC32_INITIAL_BYTES: [u8; 4] = [0xFA, 0x2D, 0x55, 0xCA];

const UNCOMPRESSED_HEADER_SIZE: usize = 3 + 3;
const COMPRESSED_HEADER_SIZE: usize = 5 + 3;

pub(crate) fn crc24(data: &[u8]) -> u32 {
    let mut crc = CRC24_INIT;
    for byte in data {
        crc ^= (*byte as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x1000000 != 0 {
                crc ^= CRC24_POLY;
            }
        }
    }
    crc & 0xFFFFFF
}

pub(crate) fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&CRC32_INITIAL_BYTES);
    hasher.update(data);
    hasher.finalize()
}

/// One decoded segment: its (decompressed) payload and whether it holds
/// only whole frames.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment {
    pub payload: Vec<u8>,
    pub self_contained: bool,
}

/// Appends a single segment carrying `payload` to `out`.
///
/// The caller must keep `payload` within [MAX_PAYLOAD_SIZE].
pub fn encode_segment(
    payload: &[u8],
    self_contained: bool,
    compression: Option<Compression>,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::SegmentTooLarge(payload.len()));
    }

    match compression {
        None => {
            let header_data: u64 = payload.len() as u64 | (self_contained as u64) << 17;
            put_header(header_data, 3, out);
            out.extend_from_slice(payload);
            out.extend_from_slice(&crc32(payload).to_le_bytes());
        }
        Some(Compression::Lz4) => {
            let compressed = lz4_flex::compress(payload);
            // An uncompressed length of 0 means the payload is sent verbatim
            // because compression would not shrink it.
            let (wire_payload, uncompressed_len): (&[u8], usize) =
                if compressed.len() >= payload.len() {
                    (payload, 0)
                } else {
                    (&compressed, payload.len())
                };

            let header_data: u64 = wire_payload.len() as u64
                | (uncompressed_len as u64) << 17
                | (self_contained as u64) << 34;
            put_header(header_data, 5, out);
            out.extend_from_slice(wire_payload);
            out.extend_from_slice(&crc32(wire_payload).to_le_bytes());
        }
        Some(Compression::Snappy) => {
            // Snappy is rejected during negotiation on protocol 5.
            return Err(FrameError::FrameCompression);
        }
    }

    Ok(())
}

fn put_header(header_data: u64, header_len: usize, out: &mut Vec<u8>) {
    let header_bytes = header_data.to_le_bytes();
    out.extend_from_slice(&header_bytes[..header_len]);
    let crc = crc24(&header_bytes[..header_len]);
    out.extend_from_slice(&crc.to_le_bytes()[..3]);
}

/// Appends a whole serialized frame to `out` as one or more segments.
pub fn encode_frame(
    frame: &[u8],
    compression: Option<Compression>,
    out: &mut Vec<u8>,
) -> Result<(), FrameError> {
    if frame.len() <= MAX_PAYLOAD_SIZE {
        encode_segment(frame, true, compression, out)
    } else {
        for chunk in frame.chunks(MAX_PAYLOAD_SIZE) {
            encode_segment(chunk, false, compression, out)?;
        }
        Ok(())
    }
}

/// Reads and verifies one segment from the stream.
pub async fn read_segment(
    reader: &mut (impl AsyncRead + Unpin),
    compression: Option<Compression>,
) -> Result<Segment, FrameError> {
    let header_size = match compression {
        None => UNCOMPRESSED_HEADER_SIZE,
        Some(_) => COMPRESSED_HEADER_SIZE,
    };
    let mut header = [0u8; COMPRESSED_HEADER_SIZE];
    reader.read_exact(&mut header[..header_size]).await?;

    let crc_bytes = &header[header_size - 3..header_size];
    let received_crc =
        u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], 0]);
    let computed_crc = crc24(&header[..header_size - 3]);
    if received_crc != computed_crc {
        return Err(FrameError::HeaderCrcMismatch {
            computed: computed_crc,
            received: received_crc,
        });
    }

    let mut header_data: u64 = 0;
    for (i, byte) in header[..header_size - 3].iter().enumerate() {
        header_data |= (*byte as u64) << (8 * i);
    }

    let (payload_len, uncompressed_len, self_contained) = match compression {
        None => (
            (header_data & 0x1FFFF) as usize,
            0usize,
            header_data & (1 << 17) != 0,
        ),
        Some(_) => (
            (header_data & 0x1FFFF) as usize,
            ((header_data >> 17) & 0x1FFFF) as usize,
            header_data & (1 << 34) != 0,
        ),
    };

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload).await?;

    let mut crc32_bytes = [0u8; 4];
    reader.read_exact(&mut crc32_bytes).await?;
    let received_crc32 = u32::from_le_bytes(crc32_bytes);
    let computed_crc32 = crc32(&payload);
    if received_crc32 != computed_crc32 {
        return Err(FrameError::PayloadCrcMismatch {
            computed: computed_crc32,
            received: received_crc32,
        });
    }

    if compression.is_some() && uncompressed_len > 0 {
        payload = lz4_flex::decompress(&payload, uncompressed_len)?;
    }

    Ok(Segment {
        payload,
        self_contained,
    })
}

/// Reassembles frames from a stream of segments.
///
/// A self-contained segment holds one or more whole frames. Slices of a
/// larger frame arrive in non-self-contained segments and are buffered
/// until the frame completes.
#[derive(Default)]
pub struct FrameAccumulator {
    partial: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            partial: BytesMut::new(),
        }
    }

    /// Feeds one segment, returning every frame that is now complete.
    pub fn feed(&mut self, segment: Segment) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();

        if segment.self_contained {
            let mut payload = Bytes::from(segment.payload);
            while !payload.is_empty() {
                let frame_len = Self::whole_frame_length(&payload)?;
                if payload.len() < frame_len {
                    // A self-contained segment must hold whole frames only.
                    return Err(FrameError::ConnectionClosed(
                        frame_len - payload.len(),
                        frame_len,
                    ));
                }
                frames.push(payload.split_to(frame_len));
            }
            return Ok(frames);
        }

        self.partial.extend_from_slice(&segment.payload);
        loop {
            if self.partial.len() < HEADER_SIZE {
                break;
            }
            let frame_len = Self::whole_frame_length(&self.partial)?;
            if self.partial.len() < frame_len {
                break;
            }
            frames.push(self.partial.split_to(frame_len).freeze());
        }
        Ok(frames)
    }

    // Length of the frame starting at the beginning of `data`,
    // including its header.
    fn whole_frame_length(data: &[u8]) -> Result<usize, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::IncompleteBigFrameHeader);
        }
        let mut length_bytes = &data[5..9];
        let body_len = length_bytes.get_u32() as usize;
        Ok(HEADER_SIZE + body_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a fake frame: 9-byte header with given body length.
    fn fake_frame(body_len: usize, fill: u8) -> Vec<u8> {
        let mut frame = vec![0x85, 0, 0, 1, 0x08, 0, 0, 0, 0];
        frame[5..9].copy_from_slice(&(body_len as u32).to_be_bytes());
        frame.extend(std::iter::repeat(fill).take(body_len));
        frame
    }

    async fn decode_all(data: &[u8], compression: Option<Compression>) -> Vec<Bytes> {
        let mut reader = data;
        let mut accumulator = FrameAccumulator::new();
        let mut frames = Vec::new();
        while !reader.is_empty() {
            let segment = read_segment(&mut reader, compression).await.unwrap();
            frames.extend(accumulator.feed(segment).unwrap());
        }
        frames
    }

    #[test]
    fn crc32_known_value() {
        // Standard CRC-32 check value, offset by the protocol's seed bytes.
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(b"123456789");
        assert_eq!(hasher.finalize(), 0xCBF43926);
    }

    #[test]
    fn crc24_detects_corruption() {
        let header = [0x12, 0x34, 0x56];
        let good = crc24(&header);
        let mut corrupted = header;
        corrupted[1] ^= 0x01;
        assert_ne!(good, crc24(&corrupted));
    }

    #[tokio::test]
    async fn self_contained_round_trip() {
        let frame = fake_frame(100, 0xAB);
        let mut encoded = Vec::new();
        encode_frame(&frame, None, &mut encoded).unwrap();

        let frames = decode_all(&encoded, None).await;
        assert_eq!(frames, vec![Bytes::from(frame)]);
    }

    #[tokio::test]
    async fn two_frames_share_a_segment() {
        let frame1 = fake_frame(10, 0x01);
        let frame2 = fake_frame(20, 0x02);
        let mut payload = frame1.clone();
        payload.extend_from_slice(&frame2);

        let mut encoded = Vec::new();
        encode_segment(&payload, true, None, &mut encoded).unwrap();

        let frames = decode_all(&encoded, None).await;
        assert_eq!(frames, vec![Bytes::from(frame1), Bytes::from(frame2)]);
    }

    #[tokio::test]
    async fn large_frame_spans_segments() {
        let frame = fake_frame(3 * MAX_PAYLOAD_SIZE / 2, 0xCD);
        let mut encoded = Vec::new();
        encode_frame(&frame, None, &mut encoded).unwrap();

        let frames = decode_all(&encoded, None).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], Bytes::from(frame));
    }

    #[tokio::test]
    async fn compressed_round_trip() {
        let frame = fake_frame(5000, 0x00);
        let mut encoded = Vec::new();
        encode_frame(&frame, Some(Compression::Lz4), &mut encoded).unwrap();
        // Zero-filled body must actually compress.
        assert!(encoded.len() < frame.len());

        let frames = decode_all(&encoded, Some(Compression::Lz4)).await;
        assert_eq!(frames, vec![Bytes::from(frame)]);
    }

    #[tokio::test]
    async fn incompressible_payload_goes_verbatim() {
        use rand_like_fill::fill_incompressible;

        let mut frame = fake_frame(300, 0);
        fill_incompressible(&mut frame[HEADER_SIZE..]);
        let mut encoded = Vec::new();
        encode_frame(&frame, Some(Compression::Lz4), &mut encoded).unwrap();

        let frames = decode_all(&encoded, Some(Compression::Lz4)).await;
        assert_eq!(frames, vec![Bytes::from(frame)]);
    }

    #[tokio::test]
    async fn corrupted_header_is_rejected() {
        let frame = fake_frame(50, 0xEE);
        let mut encoded = Vec::new();
        encode_frame(&frame, None, &mut encoded).unwrap();
        encoded[0] ^= 0x40;

        let mut reader = &encoded[..];
        let result = read_segment(&mut reader, None).await;
        assert!(matches!(result, Err(FrameError::HeaderCrcMismatch { .. })));
    }

    #[tokio::test]
    async fn corrupted_payload_is_rejected() {
        let frame = fake_frame(50, 0xEE);
        let mut encoded = Vec::new();
        encode_frame(&frame, None, &mut encoded).unwrap();
        let corrupt_at = encoded.len() - 10;
        encoded[corrupt_at] ^= 0x01;

        let mut reader = &encoded[..];
        let result = read_segment(&mut reader, None).await;
        assert!(matches!(result, Err(FrameError::PayloadCrcMismatch { .. })));
    }

    #[test]
    fn oversized_segment_is_rejected() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let mut out = Vec::new();
        assert!(matches!(
            encode_segment(&payload, true, None, &mut out),
            Err(FrameError::SegmentTooLarge(_))
        ));
    }

    // A deterministic byte pattern that lz4 cannot shrink.
    mod rand_like_fill {
        pub fn fill_incompressible(data: &mut [u8]) {
            let mut state: u64 = 0x9E3779B97F4A7C15;
            for byte in data.iter_mut() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                *byte = (state >> 32) as u8;
            }
        }
    }
}
