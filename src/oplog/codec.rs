//! Checksummed record framing
//!
//! Frame format: [body_len(u32)] [body] [xxh64(body)(u64)]
//!
//! Shared by the initial-sync spill file and the storage journal.

use base64::{engine::general_purpose, Engine as _};
use std::io::{self, Read};
use thiserror::Error;
use tracing::error;

/// Frame header + trailer size
pub const FRAME_OVERHEAD: usize = 12;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record truncated")]
    Truncated,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: u64, actual: u64 },

    #[error("invalid operation kind {0}")]
    InvalidKind(u8),

    #[error("invalid record tag {0}")]
    InvalidTag(u8),

    #[error("namespace is not valid utf-8")]
    InvalidUtf8,

    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Wrap a body in a frame
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(body.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    let checksum = xxhash_rust::xxh64::xxh64(body, 0);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// Unwrap a frame at the start of `data`, returning the body and bytes consumed
pub fn decode_frame(data: &[u8]) -> Result<(&[u8], usize), CodecError> {
    if data.len() < FRAME_OVERHEAD {
        return Err(CodecError::Truncated);
    }
    let body_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let total = body_len + FRAME_OVERHEAD;
    if data.len() < total {
        return Err(CodecError::Truncated);
    }

    let body = &data[4..4 + body_len];
    let mut stored = [0u8; 8];
    stored.copy_from_slice(&data[4 + body_len..total]);
    verify(body, u64::from_le_bytes(stored))?;

    Ok((body, total))
}

/// Read one frame from a stream; `Ok(None)` if the stream ends before a header
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let body_len = u32::from_le_bytes(header) as usize;
    let mut body = vec![0u8; body_len];
    let mut trailer = [0u8; 8];
    reader.read_exact(&mut body).map_err(truncated)?;
    reader.read_exact(&mut trailer).map_err(truncated)?;
    verify(&body, u64::from_le_bytes(trailer))?;

    Ok(Some(body))
}

fn verify(body: &[u8], expected: u64) -> Result<(), CodecError> {
    let actual = xxhash_rust::xxh64::xxh64(body, 0);
    if expected != actual {
        let preview = &body[..body.len().min(64)];
        error!(
            "Corrupted record ({} bytes). Head (B64): {}",
            body.len(),
            general_purpose::STANDARD.encode(preview)
        );
        return Err(CodecError::Checksum { expected, actual });
    }
    Ok(())
}

fn truncated(e: io::Error) -> CodecError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        CodecError::Truncated
    } else {
        CodecError::Io(e)
    }
}
