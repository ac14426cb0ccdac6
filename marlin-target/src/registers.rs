//! Register-number namespaces and the register access contract.
//!
//! A DWARF expression names registers by number, but the number only means
//! something within a namespace: DWARF register numbers, the eh_frame
//! unwinder's numbers, and the debugger's generic set (pc/sp/fp) all
//! disagree on most targets. The evaluator carries the namespace its
//! expression was encoded with and asks the register context to translate
//! before every fetch.

use crate::error::TargetError;
use crate::scalar::Scalar;

/// The namespace a register number is interpreted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterKind {
    /// Register numbering from the DWARF specification for the target ABI.
    Dwarf,
    /// Numbering used by eh_frame call-frame information.
    EhFrame,
    /// The debugger's architecture-independent set (pc, sp, fp, ...).
    Generic,
}

/// Register access for one thread's current frame.
pub trait RegisterContext {
    /// Translate a `(kind, number)` pair to this context's native register
    /// index. `None` when the register has no equivalent on the target.
    fn convert_to_native(&self, kind: RegisterKind, num: u32) -> Option<u32>;

    /// Read a native register as a scalar. Registers without a scalar
    /// rendering (large vector registers) fail with
    /// [`TargetError::RegisterNotScalar`].
    fn read_register(&self, native: u32) -> Result<Scalar, TargetError>;

    /// The current program counter, if known.
    fn program_counter(&self) -> Option<u64>;
}
