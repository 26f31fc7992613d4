//! Error kinds produced by the core, per spec §7.
use thiserror::Error;

/// A fault observed while decoding or executing a bytecode buffer.
///
/// Every variant carries the byte offset of the instruction that was being
/// fetched or executed when the fault was detected, so the embedding CLI can
/// print a short diagnostic without needing a disassembler.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("decode error at {offset}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("type error at {offset}: {reason}")]
    Type { offset: usize, reason: String },

    #[error("range error at {offset}: {reason}")]
    Range { offset: usize, reason: String },

    #[error("stack underflow at {offset}")]
    Underflow { offset: usize },

    #[error("stack overflow at {offset}")]
    Overflow { offset: usize },

    #[error("arithmetic error at {offset}: {reason}")]
    Arith { offset: usize, reason: String },

    #[error("io error at {offset}: {reason}")]
    Io { offset: usize, reason: String },
}

impl VmError {
    pub fn offset(&self) -> usize {
        match self {
            VmError::Decode { offset, .. }
            | VmError::Type { offset, .. }
            | VmError::Range { offset, .. }
            | VmError::Underflow { offset }
            | VmError::Overflow { offset }
            | VmError::Arith { offset, .. }
            | VmError::Io { offset, .. } => *offset,
        }
    }

    pub(crate) fn decode(offset: usize, reason: impl Into<String>) -> Self {
        VmError::Decode { offset, reason: reason.into() }
    }

    pub(crate) fn ty(offset: usize, reason: impl Into<String>) -> Self {
        VmError::Type { offset, reason: reason.into() }
    }

    pub(crate) fn range(offset: usize, reason: impl Into<String>) -> Self {
        VmError::Range { offset, reason: reason.into() }
    }

    pub(crate) fn underflow(offset: usize) -> Self {
        VmError::Underflow { offset }
    }

    pub(crate) fn overflow(offset: usize) -> Self {
        VmError::Overflow { offset }
    }

    pub(crate) fn arith(offset: usize, reason: impl Into<String>) -> Self {
        VmError::Arith { offset, reason: reason.into() }
    }

    pub(crate) fn io(offset: usize, reason: impl Into<String>) -> Self {
        VmError::Io { offset, reason: reason.into() }
    }
}

pub type VmResult<T> = Result<T, VmError>;
