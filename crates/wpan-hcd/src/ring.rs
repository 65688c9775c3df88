//! Byte ring holding length-prefixed data units.
//!
//! Each unit is stored as one length byte followed by the payload, so a unit carries at most 255
//! bytes. One byte of the ring is always left unused to tell "full" from "empty".

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring buffer full")]
    Full,

    #[error("unit larger than 255 bytes")]
    UnitTooLarge,
}

#[derive(Debug)]
pub struct DataRing {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
    units: usize,
}

impl DataRing {
    /// Creates a ring with `capacity` bytes of storage (at least 2).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(2)].into_boxed_slice(),
            read: 0,
            write: 0,
            units: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can still be written, length prefixes included.
    pub fn free_space(&self) -> usize {
        let cap = self.buf.len();
        (self.read + cap - self.write - 1) % cap
    }

    pub fn buffered_units(&self) -> usize {
        self.units
    }

    pub fn is_empty(&self) -> bool {
        self.units == 0
    }

    pub fn write_unit(&mut self, data: &[u8]) -> Result<(), RingError> {
        let len = u8::try_from(data.len()).map_err(|_| RingError::UnitTooLarge)?;
        if self.free_space() < data.len() + 1 {
            return Err(RingError::Full);
        }
        self.buf[self.write] = len;
        self.write = self.advance(self.write, 1);
        self.copy_in(data);
        self.units += 1;
        Ok(())
    }

    /// Length of the oldest unit.
    pub fn peek_unit_len(&self) -> Option<usize> {
        (!self.is_empty()).then(|| usize::from(self.buf[self.read]))
    }

    /// Copies the oldest unit into `dst`, truncating to `dst.len()`, and consumes the whole unit.
    /// Returns the number of bytes copied.
    pub fn read_unit_into(&mut self, dst: &mut [u8]) -> Option<usize> {
        let len = self.peek_unit_len()?;
        let start = self.advance(self.read, 1);
        let copied = len.min(dst.len());
        let first = copied.min(self.buf.len() - start);
        dst[..first].copy_from_slice(&self.buf[start..start + first]);
        dst[first..copied].copy_from_slice(&self.buf[..copied - first]);
        self.read = self.advance(start, len);
        self.units -= 1;
        Some(copied)
    }

    pub fn read_unit(&mut self) -> Option<Vec<u8>> {
        let mut out = vec![0; self.peek_unit_len()?];
        self.read_unit_into(&mut out)?;
        Some(out)
    }

    /// Drops the oldest unit, returning its length.
    pub fn skip_unit(&mut self) -> Option<usize> {
        let len = self.peek_unit_len()?;
        self.read = self.advance(self.read, len + 1);
        self.units -= 1;
        Some(len)
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
        self.units = 0;
    }

    fn advance(&self, pos: usize, by: usize) -> usize {
        (pos + by) % self.buf.len()
    }

    fn copy_in(&mut self, data: &[u8]) {
        let first = data.len().min(self.buf.len() - self.write);
        self.buf[self.write..self.write + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
        self.write = self.advance(self.write, data.len());
    }
}
