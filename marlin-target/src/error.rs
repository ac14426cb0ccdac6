//! Error types returned by the target collaborator traits.

/// Failures surfaced by the [`Process`](crate::Process),
/// [`Frame`](crate::Frame) and [`RegisterContext`](crate::RegisterContext)
/// contracts. The expression evaluator wraps these with the opcode that
/// triggered the access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("memory read of {size} bytes at {addr:#x} failed: {reason}")]
    MemoryRead {
        addr: u64,
        size: usize,
        reason: String,
    },

    #[error("register {native} is not available")]
    RegisterUnavailable { native: u32 },

    #[error("register {native} cannot be represented as a scalar value")]
    RegisterNotScalar { native: u32 },

    #[error("frame base is not available: {reason}")]
    FrameBase { reason: String },
}
