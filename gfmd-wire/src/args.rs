//! Compact argument encoding used inside request/response payloads.
//!
//! Grounded on the byte-offset-tracking parse style used for command
//! property lists: each `decode_*` method advances a cursor and returns a
//! framing error the moment the buffer runs short, rather than panicking or
//! reading out of bounds.
//!
//! Types: `i` = i32, `l` = i64, `s` = nul-terminated string, `b` = sized
//! bytes the caller bounds (decoded the same as `B` here; the caller-vs-callee
//! allocation distinction in the source is a C memory-ownership concern that
//! doesn't apply to an owned `Vec<u8>`), `B` = sized bytes the callee
//! allocates.

use gfmd_core::error::{GfmdError, Result};

/// A growable little encoder for building a request/response payload.
#[derive(Debug, Default)]
pub struct ArgEncoder {
    buf: Vec<u8>,
}

impl ArgEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn put_bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(b);
        self
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// A cursor over a received payload for decoding compact arguments.
pub struct ArgDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ArgDecoder<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.len() - self.pos < n {
            return Err(GfmdError::framing("argument decode ran past end of payload"));
        }
        Ok(())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        let v = i32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let v = i64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let start = self.pos;
        let nul = self.buf[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| GfmdError::framing("unterminated string argument"))?;
        let s = std::str::from_utf8(&self.buf[start..start + nul])
            .map_err(|_| GfmdError::framing("string argument is not valid utf-8"))?
            .to_string();
        self.pos = start + nul + 1;
        Ok(s)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>> {
        self.need(4)?;
        let len = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        self.need(len)?;
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_arguments() {
        let payload = ArgEncoder::new()
            .put_i32(-7)
            .put_i64(1234567890123)
            .put_str("gfmd01")
            .put_bytes(&[1, 2, 3, 4])
            .finish();

        let mut dec = ArgDecoder::new(&payload);
        assert_eq!(dec.get_i32().unwrap(), -7);
        assert_eq!(dec.get_i64().unwrap(), 1234567890123);
        assert_eq!(dec.get_str().unwrap(), "gfmd01");
        assert_eq!(dec.get_bytes().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn truncated_buffer_is_a_framing_error_not_a_panic() {
        let mut dec = ArgDecoder::new(&[0, 0, 0]);
        assert!(dec.get_i32().is_err());
    }

    #[test]
    fn unterminated_string_is_rejected() {
        let mut dec = ArgDecoder::new(b"no-nul-here");
        assert!(dec.get_str().is_err());
    }
}
