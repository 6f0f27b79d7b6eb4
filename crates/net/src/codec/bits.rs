use super::CodecError;

/// LSB-first bit accumulator.
#[derive(Debug, Default)]
pub struct BitWriter {
    bytes: Vec<u8>,
    acc: u8,
    used: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bits(&mut self, value: u64, count: u32) {
        debug_assert!(count <= 64);
        debug_assert!(count == 64 || value < (1u64 << count));
        let mut value = value;
        let mut remaining = count;
        while remaining > 0 {
            let take = (8 - self.used).min(remaining);
            let chunk = (value & ((1u64 << take) - 1)) as u8;
            self.acc |= chunk << self.used;
            self.used += take;
            if self.used == 8 {
                self.bytes.push(self.acc);
                self.acc = 0;
                self.used = 0;
            }
            value >>= take;
            remaining -= take;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.write_bits(*b as u64, 8);
        }
    }

    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8 + self.used as usize
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.bytes.push(self.acc);
        }
        self.bytes
    }
}

/// LSB-first reader over a byte slice.
#[derive(Debug)]
pub struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_bits(&mut self, count: u32) -> Result<u64, CodecError> {
        debug_assert!(count <= 64);
        if self.pos + count as usize > self.bytes.len() * 8 {
            return Err(CodecError::Truncated);
        }
        let mut out = 0u64;
        let mut got = 0u32;
        while got < count {
            let byte = self.bytes[self.pos / 8];
            let offset = (self.pos % 8) as u32;
            let take = (8 - offset).min(count - got);
            let chunk = ((byte >> offset) as u64) & ((1u64 << take) - 1);
            out |= chunk << got;
            got += take;
            self.pos += take as usize;
        }
        Ok(out)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.read_bits(8)? as u8);
        }
        Ok(out)
    }

    /// True when fewer than 8 bits remain; a well-formed stream ends with
    /// only zero padding in the final byte.
    pub fn at_end(&self) -> bool {
        self.bytes.len() * 8 - self.pos < 8
    }
}
