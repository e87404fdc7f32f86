use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::DecodeError;

/// Cursor over MySQL wire data.
///
/// Writes append to the tail, reads consume from the head. All integers are
/// little-endian per the MySQL client/server protocol. Reads return
/// `DecodeError::UnexpectedEof` on short input; writes grow the buffer and
/// cannot fail.
#[derive(Debug, Default)]
pub struct WireBuf {
    b: BytesMut,
}

impl WireBuf {
    pub fn new() -> Self {
        Self { b: BytesMut::new() }
    }

    pub fn from_bytes(data: impl Into<BytesMut>) -> Self {
        Self { b: data.into() }
    }

    /// Number of bytes left to read (or written and not yet consumed).
    pub fn remaining(&self) -> usize {
        self.b.len()
    }

    pub fn is_empty(&self) -> bool {
        self.b.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.b
    }

    pub fn into_bytes(self) -> Bytes {
        self.b.freeze()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.b.put_u8(v);
    }

    pub fn put_u16_le(&mut self, v: u16) {
        self.b.put_u16_le(v);
    }

    pub fn put_u24_le(&mut self, v: u32) {
        self.b.put_u16_le((v & 0xFFFF) as u16);
        self.b.put_u8((v >> 16) as u8);
    }

    pub fn put_u32_le(&mut self, v: u32) {
        self.b.put_u32_le(v);
    }

    pub fn put_u64_le(&mut self, v: u64) {
        self.b.put_u64_le(v);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.b.extend_from_slice(data);
    }

    pub fn put_zeros(&mut self, n: usize) {
        self.b.put_bytes(0, n);
    }

    /// Write a string followed by a NUL byte.
    pub fn put_str_null(&mut self, s: &str) {
        self.b.extend_from_slice(s.as_bytes());
        self.b.put_u8(0);
    }

    /// Write a length-encoded integer: 1, 3, 4 or 9 bytes depending on
    /// magnitude.
    pub fn put_lenenc_int(&mut self, n: u64) {
        match n {
            0..=0xFA => self.put_u8(n as u8),
            0xFB..=0xFFFF => {
                self.put_u8(0xFC);
                self.put_u16_le(n as u16);
            }
            0x1_0000..=0xFF_FFFF => {
                self.put_u8(0xFD);
                self.put_u24_le(n as u32);
            }
            _ => {
                self.put_u8(0xFE);
                self.put_u64_le(n);
            }
        }
    }

    pub fn put_lenenc_bytes(&mut self, data: &[u8]) {
        self.put_lenenc_int(data.len() as u64);
        self.put_bytes(data);
    }

    pub fn put_lenenc_str(&mut self, s: &str) {
        self.put_lenenc_bytes(s.as_bytes());
    }

    fn ensure(&self, n: usize) -> Result<(), DecodeError> {
        if self.b.len() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.b.get_u8())
    }

    pub fn get_u16_le(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.b.get_u16_le())
    }

    pub fn get_u24_le(&mut self) -> Result<u32, DecodeError> {
        let low = self.get_u16_le()? as u32;
        let high = self.get_u8()? as u32;
        Ok(low | high << 16)
    }

    pub fn get_u32_le(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.b.get_u32_le())
    }

    pub fn get_u64_le(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.b.get_u64_le())
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        self.ensure(n)?;
        Ok(self.b.split_to(n).freeze())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.ensure(n)?;
        self.b.advance(n);
        Ok(())
    }

    /// Read up to and including the next NUL byte; returns the string
    /// without the terminator.
    pub fn get_str_null(&mut self) -> Result<String, DecodeError> {
        let pos = self
            .b
            .iter()
            .position(|&c| c == 0)
            .ok_or(DecodeError::UnexpectedEof)?;
        let data = self.b.split_to(pos);
        self.b.advance(1);
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub fn get_lenenc_int(&mut self) -> Result<u64, DecodeError> {
        let first = self.get_u8()?;
        match first {
            0..=0xFB => Ok(first as u64),
            0xFC => Ok(self.get_u16_le()? as u64),
            0xFD => Ok(self.get_u24_le()? as u64),
            0xFE => self.get_u64_le(),
            _ => Err(DecodeError::InvalidLenenc(first)),
        }
    }

    pub fn get_lenenc_bytes(&mut self) -> Result<Bytes, DecodeError> {
        let n = self.get_lenenc_int()?;
        self.get_bytes(n as usize)
    }

    pub fn get_lenenc_str(&mut self) -> Result<String, DecodeError> {
        let data = self.get_lenenc_bytes()?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Consume the rest of the buffer.
    pub fn take_rest(&mut self) -> Bytes {
        self.b.split().freeze()
    }
}
