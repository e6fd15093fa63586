//! Bounds-checked readers and writers for the primitive field encodings.
//!
//! Integers are little-endian, IPv4 addresses are four network-order octets,
//! strings and blobs carry a packed length (one byte below 255, otherwise
//! `0xFF` followed by a 24-bit little-endian length).

use super::WireError;
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

const PACKED_LEN_ESCAPE: u8 = 0xFF;
const PACKED_LEN_MAX: usize = 0x00FF_FFFF;

pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, needed: usize) -> Result<(), WireError> {
        if self.buf.len() < needed {
            return Err(WireError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    /// Network-order u16, used where a value is spliced into foreign protocols.
    pub fn u16_be(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn addr(&mut self) -> Result<Ipv4Addr, WireError> {
        self.need(4)?;
        let mut octets = [0u8; 4];
        self.buf.copy_to_slice(&mut octets);
        Ok(Ipv4Addr::from(octets))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn packed_len(&mut self) -> Result<usize, WireError> {
        let first = self.u8()?;
        if first != PACKED_LEN_ESCAPE {
            return Ok(first as usize);
        }
        self.need(3)?;
        let low = self.buf.get_u16_le() as usize;
        let high = self.buf.get_u8() as usize;
        Ok(low | (high << 16))
    }

    pub fn blob(&mut self) -> Result<Vec<u8>, WireError> {
        let n = self.packed_len()?;
        Ok(self.bytes(n)?.to_vec())
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        String::from_utf8(self.blob()?).map_err(|_| WireError::InvalidString)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn u16_be(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn addr(&mut self, v: Ipv4Addr) {
        self.buf.put_slice(&v.octets());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    pub fn packed_len(&mut self, n: usize) -> Result<(), WireError> {
        if n > PACKED_LEN_MAX {
            return Err(WireError::TooLarge {
                size: n,
                max: PACKED_LEN_MAX,
            });
        }
        if n < PACKED_LEN_ESCAPE as usize {
            self.buf.put_u8(n as u8);
        } else {
            self.buf.put_u8(PACKED_LEN_ESCAPE);
            self.buf.put_u16_le((n & 0xFFFF) as u16);
            self.buf.put_u8((n >> 16) as u8);
        }
        Ok(())
    }

    pub fn blob(&mut self, v: &[u8]) -> Result<(), WireError> {
        self.packed_len(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    pub fn string(&mut self, v: &str) -> Result<(), WireError> {
        self.blob(v.as_bytes())
    }

    /// Reserve a little-endian u16 to be filled in later; returns its offset.
    pub fn reserve_u16(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.put_u16_le(0);
        at
    }

    pub fn patch_u16(&mut self, at: usize, v: u16) {
        self.buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn reserve_i32(&mut self) -> usize {
        let at = self.buf.len();
        self.buf.put_i32_le(0);
        at
    }

    pub fn patch_i32(&mut self, at: usize, v: i32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}
