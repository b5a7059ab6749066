//! Core results and error types

use std::path::PathBuf;
use thiserror::Error;

/// Core error type encompassing all class-file model errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Input ended before a complete structure could be read.
    #[error("unexpected end of input at offset {offset} (wanted {wanted} more bytes)")]
    UnexpectedEof {
        /// Offset at which the read was attempted.
        offset: usize,
        /// Number of bytes requested.
        wanted: usize,
    },

    /// The class-file structure or constant pool could not be decoded.
    #[error("malformed class file: {0}")]
    Decode(#[from] noak::error::DecodeError),

    /// A constant-pool index is zero, out of range or points at the upper half of a wide entry.
    #[error("invalid constant pool index {0}")]
    InvalidConstantIndex(u16),

    /// A constant-pool entry has a different kind than the referencing site expects.
    #[error("constant pool entry {index} is not a {expected}")]
    ConstantKindMismatch {
        /// The pool index of the entry.
        index: u16,
        /// The expected entry kind.
        expected: &'static str,
    },

    /// The constant pool cannot hold another entry.
    #[error("constant pool overflow")]
    ConstantPoolOverflow,

    /// The byte at `offset` is not a valid JVM opcode.
    #[error("invalid opcode 0x{opcode:02x} at offset {offset}")]
    InvalidOpcode {
        /// The raw opcode byte.
        opcode: u8,
        /// Bytecode offset of the instruction.
        offset: usize,
    },

    /// A branch, switch, handler or debug-table offset does not land on an instruction.
    #[error("invalid branch target {target} from offset {offset}")]
    InvalidBranchTarget {
        /// Offset of the referencing instruction or table entry.
        offset: usize,
        /// The offending target.
        target: i64,
    },

    /// A field or method descriptor could not be parsed.
    #[error("invalid descriptor '{0}'")]
    InvalidDescriptor(String),

    /// Re-assembled code exceeds the 65535-byte limit.
    #[error("code too large: {0} bytes")]
    CodeTooLarge(usize),

    /// Stack-map frame inference failed.
    #[error("frame computation failed at offset {offset}: {msg}")]
    FrameComputation {
        /// Bytecode offset where the analysis failed.
        offset: usize,
        /// Description of the failure.
        msg: String,
    },

    /// Subroutine inlining failed.
    #[error("subroutine inlining failed: {0}")]
    Subroutine(String),

    /// A class could not be described by any type source.
    #[error("unresolved type '{0}'")]
    UnresolvedType(String),

    /// Failed to read file at the specified path.
    #[error("could not read file '{}': {source}", path.display())]
    FileRead {
        /// The path to the file that could not be read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to read an archive.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

/// Core result type
pub type Result<T> = std::result::Result<T, Error>;
