//! Netstrings: `<decimal length>:<payload>,`

use std::io::{self, Read, Write};
use thiserror::Error;

/// Longest length prefix accepted (enough for any usize payload we allow)
const MAX_LENGTH_DIGITS: usize = 10;

/// Maximum netstring payload (1MB), same bound as the daemon IPC
pub const MAX_NETSTRING_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum NetstringError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Short netstring read")]
    Short,
    #[error("Invalid netstring length: {0:?}")]
    InvalidLength(String),
    #[error("Netstring too large: {0} bytes")]
    TooLarge(usize),
    #[error("Missing netstring terminator")]
    MissingTerminator,
}

/// Write one netstring and flush
pub fn write_netstring<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), NetstringError> {
    if payload.len() > MAX_NETSTRING_SIZE {
        return Err(NetstringError::TooLarge(payload.len()));
    }
    write!(writer, "{}:", payload.len())?;
    writer.write_all(payload)?;
    writer.write_all(b",")?;
    writer.flush()?;
    Ok(())
}

/// Read one netstring
pub fn read_netstring<R: Read>(reader: &mut R) -> Result<Vec<u8>, NetstringError> {
    let mut digits = String::new();
    loop {
        let byte = read_byte(reader)?;
        if byte == b':' {
            break;
        }
        if !byte.is_ascii_digit() || digits.len() >= MAX_LENGTH_DIGITS {
            digits.push(byte as char);
            return Err(NetstringError::InvalidLength(digits));
        }
        digits.push(byte as char);
    }

    let len: usize = digits
        .parse()
        .map_err(|_| NetstringError::InvalidLength(digits.clone()))?;
    if len > MAX_NETSTRING_SIZE {
        return Err(NetstringError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(short_read)?;

    if read_byte(reader)? != b',' {
        return Err(NetstringError::MissingTerminator);
    }
    Ok(payload)
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8, NetstringError> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).map_err(short_read)?;
    Ok(byte[0])
}

fn short_read(e: io::Error) -> NetstringError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NetstringError::Short
    } else {
        NetstringError::Io(e)
    }
}
