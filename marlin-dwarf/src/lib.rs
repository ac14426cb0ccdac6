//! DWARF location expression core for the marlin debugger.
//!
//! Decodes DWARF v2–v4 location bytecode (single expressions and location
//! lists), runs it on a stack machine over tagged values, and resolves the
//! result against a live target through the `marlin-target` contracts.
//!
//! The crate deliberately owns the whole decode/evaluate pipeline instead of
//! delegating to a DWARF library: a debugger needs to rewrite `DW_OP_addr`
//! immediates after the dynamic linker slides a module, to select
//! location-list entries by PC, and to evaluate against its own notion of
//! registers and memory. `gimli` supplies the opcode vocabulary and the
//! endian plumbing only.

pub mod errors;
pub mod expression;
pub mod opcode;
pub mod reader;
pub mod value;

pub(crate) mod evaluator;
pub(crate) mod loclist;

pub use errors::{ContextItem, EvalError};
pub use expression::{EvalContext, Expression};
pub use opcode::operand_size;
pub use reader::ByteReader;
pub use value::{Value, ValueKind};

// Re-export the opcode constants so callers can build and inspect
// expressions without naming gimli directly.
pub use gimli::{constants, DwOp, RunTimeEndian};
