//! Self-describing bit-packed value codec.
//!
//! Command arguments and results cross the wire as a compact bit stream:
//! every element is introduced by a 4-bit control tag, struct keys are
//! dictionary-hashed ids, and containers carry explicit terminators instead
//! of length prefixes. Decoding lands in a reusable flat arena
//! ([`ReadArena`]) that is browsed in place.

mod bits;
mod decode;
mod encode;
mod value;

pub use bits::{BitReader, BitWriter};
pub use decode::{Decoder, ReadArena};
pub use encode::Encoder;
pub use value::{TypeDesc, Value, decode_value, encode_value};

/// 4-bit control tags. `Sequence` is written lazily by the first element of
/// a sequence so that an element-free sequence collapses to the single
/// `EmptySequence` tag.
pub mod control {
    pub const SEQUENCE_END: u8 = 0;
    pub const SEQUENCE_NEXT: u8 = 1;
    pub const STRUCT_END: u8 = 2;
    pub const BINARY: u8 = 3;
    pub const BOOLEAN: u8 = 4;
    pub const STRING: u8 = 5;
    pub const DOUBLE: u8 = 6;
    pub const FLOAT: u8 = 7;
    pub const UINT64: u8 = 8;
    pub const UINT: u8 = 9;
    pub const INT: u8 = 10;
    pub const KEY: u8 = 11;
    pub const STRUCT: u8 = 12;
    pub const SEQUENCE: u8 = 13;
    pub const EMPTY_SEQUENCE: u8 = 14;
}

pub const TAG_BITS: u32 = 4;

/// Strings carry an 8-bit byte-length prefix.
pub const MAX_STRING_LEN: usize = 255;
pub const STRING_LEN_BITS: u32 = 8;

/// Binary blobs carry a 12-bit byte-length prefix.
pub const MAX_BINARY_LEN: usize = 4095;
pub const BINARY_LEN_BITS: u32 = 12;

/// Container nesting cap. Bounds the parser's recursion so a hostile
/// stream of open tags cannot exhaust the stack.
pub const MAX_NESTING_DEPTH: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("bit stream ended early")]
    Truncated,
    #[error("unknown control tag {0}")]
    UnknownTag(u8),
    #[error("unexpected control tag {0}")]
    UnexpectedTag(u8),
    #[error("string of {0} bytes exceeds the {MAX_STRING_LEN}-byte limit")]
    StringTooLong(usize),
    #[error("binary blob of {0} bytes exceeds the {MAX_BINARY_LEN}-byte limit")]
    BinaryTooLong(usize),
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
    #[error("containers nest deeper than {MAX_NESTING_DEPTH} levels")]
    NestingTooDeep,
    #[error("element is not of the requested kind")]
    TypeMismatch,
    #[error("no field for key id {0}")]
    KeyNotFound(u32),
    #[error("navigation call does not match the current container")]
    BadNavigation,
}
