//! Wire framing for the gfmd channel's async RPC stream.
//!
//! Every frame is `<type:u8> <xid:u32> <size:u32> <payload[size]>`, written
//! and read as a unit over a blocking duplex stream. A request's payload is
//! `<opcode:i32> <args...>`; a response's payload is `<errcode:i32>
//! <result...>`. Short reads and oversized frames are framing errors, fatal
//! to the stream they occur on.

use std::io::{self, Read, Write};

use gfmd_core::error::{GfmdError, Result};

/// Frames larger than this are rejected outright; a well-behaved peer never
/// sends one (journal batches are capped well below this at the source).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Request = 0,
    Response = 1,
}

impl FrameType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(GfmdError::framing(format!("unknown frame type byte {other}"))),
        }
    }
}

/// A decoded frame header plus its raw payload bytes.
#[derive(Debug)]
pub struct Frame {
    pub frame_type: FrameType,
    pub xid: u32,
    pub payload: Vec<u8>,
}

/// Write one frame to `w`. Framing is not interleaved on a single
/// stream by this function; callers serialize writes with their own lock
/// (design §4.3: "writes are serialized per stream").
pub fn write_frame(w: &mut impl Write, frame_type: FrameType, xid: u32, payload: &[u8]) -> Result<()> {
    if payload.len() as u64 > u64::from(MAX_FRAME_SIZE) {
        return Err(GfmdError::framing("payload exceeds MAX_FRAME_SIZE"));
    }
    let mut header = [0u8; 9];
    header[0] = frame_type as u8;
    header[1..5].copy_from_slice(&xid.to_be_bytes());
    header[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    w.write_all(&header)?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Read exactly one frame from `r`, blocking until it is fully available.
/// A clean EOF before any bytes are read is reported as `UnexpectedEof` via
/// `io::Error`; a partial header or payload is a framing error.
pub fn read_frame(r: &mut impl Read) -> Result<Frame> {
    let mut header = [0u8; 9];
    read_exact_or_eof(r, &mut header)?;

    let frame_type = FrameType::from_byte(header[0])?;
    let xid = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let size = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);

    if size > MAX_FRAME_SIZE {
        return Err(GfmdError::framing(format!("frame size {size} exceeds maximum")));
    }

    let mut payload = vec![0u8; size as usize];
    r.read_exact(&mut payload)?;

    Ok(Frame {
        frame_type,
        xid,
        payload,
    })
}

/// Like `Read::read_exact`, but a zero-byte read before any data is
/// transferred is treated as a clean, expected connection close rather than
/// a framing violation — the common case for a peer hanging up between
/// requests.
fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => {
                return Err(GfmdError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
            Ok(0) => {
                return Err(GfmdError::framing("connection closed mid-frame"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(GfmdError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_a_request_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameType::Request, 42, b"hello").unwrap();

        let mut cursor = Cursor::new(buf);
        let frame = read_frame(&mut cursor).unwrap();
        assert_eq!(frame.frame_type, FrameType::Request);
        assert_eq!(frame.xid, 42);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn clean_eof_before_any_bytes_is_unexpected_eof() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let err = read_frame(&mut cursor).unwrap_err();
        match err {
            GfmdError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io(UnexpectedEof), got {other:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        let mut header = [0u8; 9];
        header[0] = FrameType::Request as u8;
        header[5..9].copy_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        buf.extend_from_slice(&header);

        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn truncated_payload_is_a_framing_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, FrameType::Response, 1, b"0123456789").unwrap();
        buf.truncate(buf.len() - 3); // cut the payload short
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}
