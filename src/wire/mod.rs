//! Wire framing for the two byte protocols the client speaks
//!
//! - `frame`: 8-hex-digit length prefixed frames used on the master socket
//! - `sequence`: `%`-separated string sequences carried inside those frames
//! - `netstring`: `<len>:<payload>,` frames used on the privilege channel pipes

pub mod frame;
pub mod netstring;
pub mod sequence;

pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
pub use netstring::{read_netstring, write_netstring, NetstringError};
pub use sequence::{decode_sequence, encode_sequence};
