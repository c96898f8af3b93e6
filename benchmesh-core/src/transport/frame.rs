// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Length-prefixed, checksummed frames over any async byte stream.
//!
//! ```text
//! +----------------+----------------+------------------+
//! | length: u32 LE | crc32: u32 LE  | payload (JSON)   |
//! +----------------+----------------+------------------+
//! ```
//!
//! A checksum mismatch or an undecodable payload consumes exactly one frame,
//! so the reader stays aligned and may continue.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Frame header size in bytes (length + checksum).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Build a complete frame around raw payload bytes.
pub fn encode_payload(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Serialize a message to JSON and frame it.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    encode_payload(&payload)
}

/// Write raw payload bytes as a single frame.
pub async fn write_payload<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_payload(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one message as a single frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and verify the next frame, returning its payload bytes.
///
/// A clean EOF before any header byte is reported as [`FrameError::Closed`].
pub async fn read_payload<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; length];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Closed)
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    // Validate checksum - fail the frame, keep the stream
    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }

    Ok(payload)
}

/// Read the next frame and decode it as `T`.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_payload(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        nonce: u64,
    }

    #[test]
    fn test_frame_layout() {
        let frame = encode(&Ping { nonce: 7 }).unwrap();
        let payload = br#"{"nonce":7}"#;

        assert_eq!(&frame[0..4], &(payload.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..8], &crc32fast::hash(payload).to_le_bytes());
        assert_eq!(&frame[8..], payload);
    }

    #[tokio::test]
    async fn test_read_sequence_then_closed() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &Ping { nonce: 1 }).await.unwrap();
        write_frame(&mut a, &Ping { nonce: 2 }).await.unwrap();
        drop(a);

        let first: Ping = read_frame(&mut b).await.unwrap();
        let second: Ping = read_frame(&mut b).await.unwrap();
        assert_eq!((first.nonce, second.nonce), (1, 2));

        let err = read_frame::<_, Ping>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_skips_one_frame() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let mut corrupt = encode(&Ping { nonce: 1 }).unwrap();
        let last = corrupt.len() - 2;
        corrupt[last] ^= 0xff;
        a.write_all(&corrupt).await.unwrap();
        write_frame(&mut a, &Ping { nonce: 2 }).await.unwrap();

        let err = read_frame::<_, Ping>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
        assert!(!err.is_fatal());

        let next: Ping = read_frame(&mut b).await.unwrap();
        assert_eq!(next.nonce, 2);
    }

    #[tokio::test]
    async fn test_undecodable_payload() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_payload(&mut a, b"not json").await.unwrap();

        let err = read_frame::<_, Ping>(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[tokio::test]
    async fn test_oversized_header_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut header = Vec::new();
        header.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        a.write_all(&header).await.unwrap();

        let err = read_payload(&mut b).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { .. }));
        assert!(err.is_fatal());
    }
}
