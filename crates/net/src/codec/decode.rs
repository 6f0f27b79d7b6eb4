use super::bits::BitReader;
use super::{BINARY_LEN_BITS, CodecError, MAX_NESTING_DEPTH, STRING_LEN_BITS, TAG_BITS, control};
use crate::mphf::StringMphf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElemKind {
    Bool,
    Int,
    UInt,
    UInt64,
    Float,
    Double,
    Str,
    Bin,
    Seq,
    Struct,
}

#[derive(Debug, Clone, Copy)]
struct Elem {
    kind: ElemKind,
    idx: u32,
}

/// Flat decode arena. One pass over the bit stream fills the per-kind
/// vectors; containers store contiguous index ranges instead of owning
/// their children. `clear` drops no capacity, so one arena serves a
/// connection for its whole lifetime.
#[derive(Debug, Default)]
pub struct ReadArena {
    bools: Vec<bool>,
    ints: Vec<i32>,
    uints: Vec<u32>,
    uint64s: Vec<u64>,
    floats: Vec<f32>,
    doubles: Vec<f64>,
    strings: Vec<String>,
    blobs: Vec<Vec<u8>>,
    elems: Vec<Elem>,
    seq_elems: Vec<u32>,
    seqs: Vec<(u32, u32)>,
    struct_fields: Vec<(u32, u32)>,
    structs: Vec<(u32, u32)>,
}

impl ReadArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.bools.clear();
        self.ints.clear();
        self.uints.clear();
        self.uint64s.clear();
        self.floats.clear();
        self.doubles.clear();
        self.strings.clear();
        self.blobs.clear();
        self.elems.clear();
        self.seq_elems.clear();
        self.seqs.clear();
        self.struct_fields.clear();
        self.structs.clear();
    }
}

struct Parser<'a, 'b> {
    bits: BitReader<'a>,
    arena: &'b mut ReadArena,
    depth: u32,
}

impl Parser<'_, '_> {
    fn read_tag(&mut self) -> Result<u8, CodecError> {
        Ok(self.bits.read_bits(TAG_BITS)? as u8)
    }

    fn push_elem(&mut self, kind: ElemKind, idx: usize) -> u32 {
        self.arena.elems.push(Elem {
            kind,
            idx: idx as u32,
        });
        (self.arena.elems.len() - 1) as u32
    }

    fn parse_element(&mut self, tag: u8, key_bits: u32) -> Result<u32, CodecError> {
        match tag {
            control::BOOLEAN => {
                let v = self.bits.read_bits(1)? != 0;
                self.arena.bools.push(v);
                Ok(self.push_elem(ElemKind::Bool, self.arena.bools.len() - 1))
            }
            control::INT => {
                let v = self.bits.read_bits(32)? as u32 as i32;
                self.arena.ints.push(v);
                Ok(self.push_elem(ElemKind::Int, self.arena.ints.len() - 1))
            }
            control::UINT => {
                let v = self.bits.read_bits(32)? as u32;
                self.arena.uints.push(v);
                Ok(self.push_elem(ElemKind::UInt, self.arena.uints.len() - 1))
            }
            control::UINT64 => {
                let v = self.bits.read_bits(64)?;
                self.arena.uint64s.push(v);
                Ok(self.push_elem(ElemKind::UInt64, self.arena.uint64s.len() - 1))
            }
            control::FLOAT => {
                let v = f32::from_bits(self.bits.read_bits(32)? as u32);
                self.arena.floats.push(v);
                Ok(self.push_elem(ElemKind::Float, self.arena.floats.len() - 1))
            }
            control::DOUBLE => {
                let v = f64::from_bits(self.bits.read_bits(64)?);
                self.arena.doubles.push(v);
                Ok(self.push_elem(ElemKind::Double, self.arena.doubles.len() - 1))
            }
            control::STRING => {
                let len = self.bits.read_bits(STRING_LEN_BITS)? as usize;
                let bytes = self.bits.read_bytes(len)?;
                let s = String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                self.arena.strings.push(s);
                Ok(self.push_elem(ElemKind::Str, self.arena.strings.len() - 1))
            }
            control::BINARY => {
                let len = self.bits.read_bits(BINARY_LEN_BITS)? as usize;
                let bytes = self.bits.read_bytes(len)?;
                self.arena.blobs.push(bytes);
                Ok(self.push_elem(ElemKind::Bin, self.arena.blobs.len() - 1))
            }
            control::EMPTY_SEQUENCE => {
                let at = self.arena.seq_elems.len() as u32;
                self.arena.seqs.push((at, at));
                Ok(self.push_elem(ElemKind::Seq, self.arena.seqs.len() - 1))
            }
            control::SEQUENCE => {
                if self.depth >= MAX_NESTING_DEPTH {
                    return Err(CodecError::NestingTooDeep);
                }
                self.depth += 1;
                // Children land in a local list first so the arena range
                // stays contiguous across nested containers.
                let mut children = Vec::new();
                let first = self.read_tag()?;
                children.push(self.parse_element(first, key_bits)?);
                loop {
                    match self.read_tag()? {
                        control::SEQUENCE_NEXT => {
                            let tag = self.read_tag()?;
                            children.push(self.parse_element(tag, key_bits)?);
                        }
                        control::SEQUENCE_END => break,
                        other => return Err(CodecError::UnexpectedTag(other)),
                    }
                }
                self.depth -= 1;
                let begin = self.arena.seq_elems.len() as u32;
                self.arena.seq_elems.extend(children);
                let end = self.arena.seq_elems.len() as u32;
                self.arena.seqs.push((begin, end));
                Ok(self.push_elem(ElemKind::Seq, self.arena.seqs.len() - 1))
            }
            control::STRUCT => {
                if self.depth >= MAX_NESTING_DEPTH {
                    return Err(CodecError::NestingTooDeep);
                }
                self.depth += 1;
                let mut fields = Vec::new();
                loop {
                    match self.read_tag()? {
                        control::KEY => {
                            let key = self.bits.read_bits(key_bits)? as u32;
                            let tag = self.read_tag()?;
                            fields.push((key, self.parse_element(tag, key_bits)?));
                        }
                        control::STRUCT_END => break,
                        other => return Err(CodecError::UnexpectedTag(other)),
                    }
                }
                self.depth -= 1;
                let begin = self.arena.struct_fields.len() as u32;
                self.arena.struct_fields.extend(fields);
                let end = self.arena.struct_fields.len() as u32;
                self.arena.structs.push((begin, end));
                Ok(self.push_elem(ElemKind::Struct, self.arena.structs.len() - 1))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Root,
    Seq { seq: u32, pos: u32 },
    Struct { st: u32, next: u32 },
    Field { elem: u32 },
}

/// Browses one decoded message. Construction runs the full parse; the
/// navigation calls then walk the arena without touching the input again.
pub struct Decoder<'a, 'm> {
    arena: &'a mut ReadArena,
    mphf: &'m StringMphf,
    root: u32,
    stack: Vec<Frame>,
}

impl<'a, 'm> Decoder<'a, 'm> {
    pub fn new(
        arena: &'a mut ReadArena,
        mphf: &'m StringMphf,
        bytes: &[u8],
    ) -> Result<Self, CodecError> {
        arena.clear();
        let mut parser = Parser {
            bits: BitReader::new(bytes),
            arena: &mut *arena,
            depth: 0,
        };
        let tag = parser.read_tag()?;
        let root = parser.parse_element(tag, mphf.hash_len())?;
        Ok(Self {
            arena,
            mphf,
            root,
            stack: vec![Frame::Root],
        })
    }

    fn current(&self) -> Result<Elem, CodecError> {
        let elem = match *self.stack.last().ok_or(CodecError::BadNavigation)? {
            Frame::Root => self.root,
            Frame::Field { elem } => elem,
            Frame::Seq { seq, pos } => {
                let (begin, end) = self.arena.seqs[seq as usize];
                if begin + pos >= end {
                    return Err(CodecError::BadNavigation);
                }
                self.arena.seq_elems[(begin + pos) as usize]
            }
            Frame::Struct { .. } => return Err(CodecError::BadNavigation),
        };
        Ok(self.arena.elems[elem as usize])
    }

    /// Enters the sequence at the cursor, returning its element count.
    pub fn begin_sequence(&mut self) -> Result<usize, CodecError> {
        let elem = self.current()?;
        if elem.kind != ElemKind::Seq {
            return Err(CodecError::TypeMismatch);
        }
        let (begin, end) = self.arena.seqs[elem.idx as usize];
        self.stack.push(Frame::Seq {
            seq: elem.idx,
            pos: 0,
        });
        Ok((end - begin) as usize)
    }

    pub fn next_element(&mut self) -> Result<(), CodecError> {
        match self.stack.last_mut() {
            Some(Frame::Seq { pos, .. }) => {
                *pos += 1;
                Ok(())
            }
            _ => Err(CodecError::BadNavigation),
        }
    }

    pub fn end_sequence(&mut self) -> Result<(), CodecError> {
        match self.stack.pop() {
            Some(Frame::Seq { .. }) => Ok(()),
            _ => Err(CodecError::BadNavigation),
        }
    }

    pub fn begin_struct(&mut self) -> Result<(), CodecError> {
        let elem = self.current()?;
        if elem.kind != ElemKind::Struct {
            return Err(CodecError::TypeMismatch);
        }
        self.stack.push(Frame::Struct {
            st: elem.idx,
            next: 0,
        });
        Ok(())
    }

    /// Positions the cursor on a struct field. Fields written in the
    /// expected order hit the fast path; otherwise the key is searched, and
    /// as a last resort the in-order field is taken so that peers with a
    /// drifted field set can still make progress.
    pub fn push_key(&mut self, key: &str) -> Result<(), CodecError> {
        let id = self.mphf.compute(key);
        let (st, next) = match self.stack.last() {
            Some(&Frame::Struct { st, next }) => (st, next),
            _ => return Err(CodecError::BadNavigation),
        };
        let (begin, end) = self.arena.structs[st as usize];
        let fields = &self.arena.struct_fields[begin as usize..end as usize];
        let len = fields.len() as u32;

        let chosen = if next < len && fields[next as usize].0 == id {
            next
        } else if let Some(found) = fields.iter().position(|&(k, _)| k == id) {
            found as u32
        } else if next < len {
            next
        } else {
            return Err(CodecError::KeyNotFound(id));
        };

        let elem = fields[chosen as usize].1;
        if let Some(Frame::Struct { next, .. }) = self.stack.last_mut() {
            *next = chosen + 1;
        }
        self.stack.push(Frame::Field { elem });
        Ok(())
    }

    pub fn pop_key(&mut self) -> Result<(), CodecError> {
        match self.stack.pop() {
            Some(Frame::Field { .. }) => Ok(()),
            _ => Err(CodecError::BadNavigation),
        }
    }

    pub fn end_struct(&mut self) -> Result<(), CodecError> {
        match self.stack.pop() {
            Some(Frame::Struct { .. }) => Ok(()),
            _ => Err(CodecError::BadNavigation),
        }
    }

    fn scalar(&self, kind: ElemKind) -> Result<u32, CodecError> {
        let elem = self.current()?;
        if elem.kind != kind {
            return Err(CodecError::TypeMismatch);
        }
        Ok(elem.idx)
    }

    pub fn read_bool(&self) -> Result<bool, CodecError> {
        Ok(self.arena.bools[self.scalar(ElemKind::Bool)? as usize])
    }

    pub fn read_int(&self) -> Result<i32, CodecError> {
        Ok(self.arena.ints[self.scalar(ElemKind::Int)? as usize])
    }

    pub fn read_uint(&self) -> Result<u32, CodecError> {
        Ok(self.arena.uints[self.scalar(ElemKind::UInt)? as usize])
    }

    pub fn read_uint64(&self) -> Result<u64, CodecError> {
        Ok(self.arena.uint64s[self.scalar(ElemKind::UInt64)? as usize])
    }

    pub fn read_float(&self) -> Result<f32, CodecError> {
        Ok(self.arena.floats[self.scalar(ElemKind::Float)? as usize])
    }

    pub fn read_double(&self) -> Result<f64, CodecError> {
        Ok(self.arena.doubles[self.scalar(ElemKind::Double)? as usize])
    }

    pub fn read_str(&self) -> Result<&str, CodecError> {
        Ok(&self.arena.strings[self.scalar(ElemKind::Str)? as usize])
    }

    pub fn read_bin(&self) -> Result<&[u8], CodecError> {
        Ok(&self.arena.blobs[self.scalar(ElemKind::Bin)? as usize])
    }
}
