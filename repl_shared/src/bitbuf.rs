//! Bit-level read/write buffers.
//!
//! The entity update wire format is specified in bits, not bytes, so the
//! writer and reader here are the single source of truth for bit order:
//! least-significant bit first within each byte. Every encoded field is
//! written and read through these types; nothing else touches raw bits.

use crate::error::ReplError;

/// Append-only bit stream writer backed by a growable byte buffer.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    data: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Backing bytes; the final byte may be partially filled.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> (Vec<u8>, usize) {
        (self.data, self.bits)
    }

    pub fn write_bit(&mut self, bit: bool) {
        let byte = self.bits / 8;
        if byte == self.data.len() {
            self.data.push(0);
        }
        if bit {
            self.data[byte] |= 1 << (self.bits % 8);
        }
        self.bits += 1;
    }

    /// Writes the low `count` bits of `val`, LSB first.
    pub fn write_ubits(&mut self, val: u32, count: u32) {
        debug_assert!(count <= 32);
        debug_assert!(count == 32 || val < (1u64 << count) as u32);
        for i in 0..count {
            self.write_bit((val >> i) & 1 != 0);
        }
    }

    /// Variable-width unsigned integer: a 2-bit width selector followed by
    /// 4, 8, 12 or 32 value bits. Small values (entity index offsets are
    /// almost always small) cost 6 bits.
    pub fn write_ubitvar(&mut self, val: u32) {
        if val < (1 << 4) {
            self.write_ubits(0, 2);
            self.write_ubits(val, 4);
        } else if val < (1 << 8) {
            self.write_ubits(1, 2);
            self.write_ubits(val, 8);
        } else if val < (1 << 12) {
            self.write_ubits(2, 2);
            self.write_ubits(val, 12);
        } else {
            self.write_ubits(3, 2);
            self.write_ubits(val, 32);
        }
    }

    /// Splices `bit_len` bits from another buffer, preserving bit order
    /// across the unaligned boundary. Used to replay cached delta bits and
    /// to append per-entity bodies built in scratch writers.
    pub fn write_raw_bits(&mut self, src: &[u8], bit_len: usize) {
        debug_assert!(bit_len <= src.len() * 8);
        for i in 0..bit_len {
            self.write_bit((src[i / 8] >> (i % 8)) & 1 != 0);
        }
    }
}

/// Bit stream reader over a borrowed byte slice with an explicit bit length.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bits: usize,
    cursor: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8], bits: usize) -> Self {
        debug_assert!(bits <= data.len() * 8);
        Self {
            data,
            bits,
            cursor: 0,
        }
    }

    pub fn remaining_bits(&self) -> usize {
        self.bits - self.cursor
    }

    pub fn read_bit(&mut self) -> Result<bool, ReplError> {
        if self.cursor >= self.bits {
            return Err(ReplError::Underflow { wanted: 1 });
        }
        let bit = (self.data[self.cursor / 8] >> (self.cursor % 8)) & 1 != 0;
        self.cursor += 1;
        Ok(bit)
    }

    pub fn read_ubits(&mut self, count: u32) -> Result<u32, ReplError> {
        debug_assert!(count <= 32);
        if self.remaining_bits() < count as usize {
            return Err(ReplError::Underflow { wanted: count });
        }
        let mut val = 0u32;
        for i in 0..count {
            if self.read_bit()? {
                val |= 1 << i;
            }
        }
        Ok(val)
    }

    pub fn read_ubitvar(&mut self) -> Result<u32, ReplError> {
        let sel = self.read_ubits(2)?;
        let width = match sel {
            0 => 4,
            1 => 8,
            2 => 12,
            _ => 32,
        };
        self.read_ubits(width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_roundtrip() {
        let mut w = BitWriter::new();
        w.write_bit(true);
        w.write_ubits(0b1011, 4);
        w.write_ubits(0xDEAD, 16);
        w.write_bit(false);

        let (bytes, bits) = w.into_bytes();
        let mut r = BitReader::new(&bytes, bits);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_ubits(4).unwrap(), 0b1011);
        assert_eq!(r.read_ubits(16).unwrap(), 0xDEAD);
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.remaining_bits(), 0);
    }

    #[test]
    fn ubitvar_selects_minimal_width() {
        for (val, expect_bits) in [(0u32, 6), (15, 6), (16, 10), (255, 10), (256, 14), (4095, 14), (4096, 34)] {
            let mut w = BitWriter::new();
            w.write_ubitvar(val);
            assert_eq!(w.bit_len(), expect_bits, "val {val}");
            let (bytes, bits) = w.into_bytes();
            let mut r = BitReader::new(&bytes, bits);
            assert_eq!(r.read_ubitvar().unwrap(), val);
        }
    }

    #[test]
    fn raw_bit_splice_is_unaligned_safe() {
        let mut body = BitWriter::new();
        body.write_ubits(0x2A5, 10);

        let mut w = BitWriter::new();
        w.write_ubits(0b101, 3); // misalign on purpose
        w.write_raw_bits(body.as_bytes(), body.bit_len());

        let (bytes, bits) = w.into_bytes();
        let mut r = BitReader::new(&bytes, bits);
        assert_eq!(r.read_ubits(3).unwrap(), 0b101);
        assert_eq!(r.read_ubits(10).unwrap(), 0x2A5);
    }

    #[test]
    fn underflow_is_an_error() {
        let mut r = BitReader::new(&[0xFF], 3);
        assert_eq!(r.read_ubits(3).unwrap(), 0b111);
        assert!(matches!(r.read_bit(), Err(ReplError::Underflow { .. })));
    }
}
