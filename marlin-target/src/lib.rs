//! Target abstractions for the marlin debugger core.
//!
//! Everything the DWARF expression evaluator needs from the world around it
//! lives here: scalar register values, register-number namespaces, and the
//! narrow trait contracts for reading a debuggee process, stack frame, and
//! thread. The evaluator crate depends on these traits only; concrete
//! implementations are provided by the process plug-ins (or by test stubs).

pub mod error;
pub mod module;
pub mod registers;
pub mod scalar;
pub mod target;

pub use error::TargetError;
pub use module::{ModuleHandle, ModuleId, ModuleRegistry};
pub use registers::{RegisterContext, RegisterKind};
pub use scalar::Scalar;
pub use target::{Frame, Process, Thread};

// Re-export the endian vocabulary shared with the DWARF crate.
pub use gimli::RunTimeEndian;
