//! Error taxonomy for expression decoding and evaluation.

use gimli::DwOp;
use marlin_target::{RegisterKind, TargetError};

/// A piece of execution context an opcode needed but the caller did not
/// provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextItem {
    Process,
    Frame,
    Thread,
    RegisterContext,
    Module,
}

impl std::fmt::Display for ContextItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContextItem::Process => "process",
            ContextItem::Frame => "stack frame",
            ContextItem::Thread => "thread",
            ContextItem::RegisterContext => "register context",
            ContextItem::Module => "module",
        };
        f.write_str(name)
    }
}

/// Failure of expression decoding or evaluation. No error is retried and no
/// partial result survives one; every variant names the opcode involved
/// where that is meaningful.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// Truncated or malformed opcode stream, unknown opcode byte, or an
    /// out-of-bounds branch target.
    #[error("malformed opcode stream at offset {offset:#x}: {reason}")]
    Decode { offset: usize, reason: String },

    #[error("expression stack needs at least {need} items for {op}, has {have}")]
    StackUnderflow { op: DwOp, need: usize, have: usize },

    #[error("division by zero in {op}")]
    DivisionByZero { op: DwOp },

    /// A value was outside an operation's domain: unrepresentable bitfield
    /// extraction, a non-scalar where a scalar is required, a piece sourced
    /// from a non-load address.
    #[error("{op}: {reason}")]
    ValueDomain { op: DwOp, reason: String },

    #[error("no {need} available for {op}")]
    MissingContext { op: DwOp, need: ContextItem },

    #[error("failed to read {size} bytes of process memory at {addr:#x} for {op}")]
    Memory {
        op: DwOp,
        addr: u64,
        size: usize,
        #[source]
        source: TargetError,
    },

    #[error("unable to read register {number} (kind {kind:?}) for {op}: {reason}")]
    Register {
        op: DwOp,
        kind: RegisterKind,
        number: u32,
        reason: String,
    },

    /// The frame exists but could not produce the value the opcode needs
    /// (frame base or canonical frame address).
    #[error("{op}: {reason}")]
    Frame { op: DwOp, reason: String },

    #[error("no TLS data currently exists for this thread")]
    TlsUnavailable,

    #[error("unimplemented opcode {op}")]
    NotImplemented { op: DwOp },

    /// Empty opcode slice, a location list with no entry covering the
    /// probe PC, or an evaluation that left nothing on the stack.
    #[error("no location, value may have been optimized out")]
    NoLocation,
}

impl EvalError {
    pub(crate) fn truncated(offset: usize) -> Self {
        EvalError::Decode {
            offset,
            reason: "unexpected end of opcode stream".to_string(),
        }
    }
}
