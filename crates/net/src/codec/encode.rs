use super::bits::BitWriter;
use super::{
    BINARY_LEN_BITS, CodecError, MAX_BINARY_LEN, MAX_STRING_LEN, STRING_LEN_BITS, TAG_BITS,
    control,
};
use crate::mphf::StringMphf;

/// Sequence level opened at a given struct depth. `pending` flips once the
/// first element lands, which is also when the open tag gets written.
#[derive(Debug, Clone, Copy)]
struct SeqLevel {
    depth: u32,
    pending: bool,
}

/// Writes one value tree as a tagged bit stream. Struct keys are hashed
/// through the shared dictionary so both peers agree on key ids.
pub struct Encoder<'a> {
    bits: BitWriter,
    mphf: &'a StringMphf,
    seq_levels: Vec<SeqLevel>,
    struct_depth: u32,
}

impl<'a> Encoder<'a> {
    pub fn new(mphf: &'a StringMphf) -> Self {
        Self {
            bits: BitWriter::new(),
            mphf,
            seq_levels: Vec::new(),
            struct_depth: 0,
        }
    }

    fn tag(&mut self, tag: u8) {
        self.bits.write_bits(tag as u64, TAG_BITS);
    }

    /// Separator bookkeeping for elements sitting directly in a sequence.
    fn element_prologue(&mut self) {
        if let Some(level) = self.seq_levels.last_mut() {
            if level.depth == self.struct_depth {
                let tag = if level.pending {
                    control::SEQUENCE_NEXT
                } else {
                    level.pending = true;
                    control::SEQUENCE
                };
                self.bits.write_bits(tag as u64, TAG_BITS);
            }
        }
    }

    pub fn begin_sequence(&mut self) {
        self.element_prologue();
        self.seq_levels.push(SeqLevel {
            depth: self.struct_depth,
            pending: false,
        });
    }

    pub fn end_sequence(&mut self) -> Result<(), CodecError> {
        let level = self.seq_levels.pop().ok_or(CodecError::BadNavigation)?;
        if level.pending {
            self.tag(control::SEQUENCE_END);
        } else {
            self.tag(control::EMPTY_SEQUENCE);
        }
        Ok(())
    }

    pub fn begin_struct(&mut self) {
        self.element_prologue();
        self.tag(control::STRUCT);
        self.struct_depth += 1;
    }

    pub fn end_struct(&mut self) -> Result<(), CodecError> {
        if self.struct_depth == 0 {
            return Err(CodecError::BadNavigation);
        }
        self.tag(control::STRUCT_END);
        self.struct_depth -= 1;
        Ok(())
    }

    pub fn push_key(&mut self, key: &str) {
        self.tag(control::KEY);
        let id = self.mphf.compute(key);
        self.bits.write_bits(id as u64, self.mphf.hash_len());
    }

    pub fn pop_key(&mut self) {}

    pub fn write_bool(&mut self, value: bool) {
        self.element_prologue();
        self.tag(control::BOOLEAN);
        self.bits.write_bits(value as u64, 1);
    }

    pub fn write_int(&mut self, value: i32) {
        self.element_prologue();
        self.tag(control::INT);
        self.bits.write_bits(value as u32 as u64, 32);
    }

    pub fn write_uint(&mut self, value: u32) {
        self.element_prologue();
        self.tag(control::UINT);
        self.bits.write_bits(value as u64, 32);
    }

    pub fn write_uint64(&mut self, value: u64) {
        self.element_prologue();
        self.tag(control::UINT64);
        self.bits.write_bits(value, 64);
    }

    pub fn write_float(&mut self, value: f32) {
        self.element_prologue();
        self.tag(control::FLOAT);
        self.bits.write_bits(value.to_bits() as u64, 32);
    }

    pub fn write_double(&mut self, value: f64) {
        self.element_prologue();
        self.tag(control::DOUBLE);
        self.bits.write_bits(value.to_bits(), 64);
    }

    pub fn write_str(&mut self, value: &str) -> Result<(), CodecError> {
        let bytes = value.as_bytes();
        if bytes.len() > MAX_STRING_LEN {
            return Err(CodecError::StringTooLong(bytes.len()));
        }
        self.element_prologue();
        self.tag(control::STRING);
        self.bits.write_bits(bytes.len() as u64, STRING_LEN_BITS);
        self.bits.write_bytes(bytes);
        Ok(())
    }

    pub fn write_bin(&mut self, value: &[u8]) -> Result<(), CodecError> {
        if value.len() > MAX_BINARY_LEN {
            return Err(CodecError::BinaryTooLong(value.len()));
        }
        self.element_prologue();
        self.tag(control::BINARY);
        self.bits.write_bits(value.len() as u64, BINARY_LEN_BITS);
        self.bits.write_bytes(value);
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        debug_assert!(self.seq_levels.is_empty());
        debug_assert_eq!(self.struct_depth, 0);
        self.bits.finish()
    }
}
