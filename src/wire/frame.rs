//! Master socket framing
//!
//! Each message, in both directions, is an 8 digit uppercase hex length
//! followed by exactly that many raw bytes. There is no trailing delimiter.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Largest frame we are willing to buffer (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Remote end closed")]
    Closed,
    #[error("Invalid frame header: {0:?}")]
    InvalidHeader(String),
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
}

/// Write one frame
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let header = format!("{:08X}", payload.len());
    writer.write_all(header.as_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header)?;

    let text = std::str::from_utf8(&header)
        .map_err(|_| FrameError::InvalidHeader(String::from_utf8_lossy(&header).into_owned()))?;
    let len = usize::from_str_radix(text, 16)
        .map_err(|_| FrameError::InvalidHeader(text.to_string()))?;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    read_exact_or_closed(reader, &mut payload)?;
    Ok(payload)
}

fn read_exact_or_closed<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
        Err(e) => Err(e.into()),
    }
}
