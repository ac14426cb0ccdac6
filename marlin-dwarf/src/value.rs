//! Tagged runtime values for the expression stack.
//!
//! The meaning of a stack entry depends on what produced it: `DW_OP_addr`
//! pushes an address inside the object file, `DW_OP_breg*` an address in
//! the debuggee, `DW_OP_call_frame_cfa` an address the debugger itself
//! vouches for. Dereference and piece-assembly opcodes branch on this tag,
//! so it is a closed sum type and every consumer matches exhaustively.

use marlin_target::Scalar;

/// Discriminant of a [`Value`], used for dispatch and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    FileAddress,
    LoadAddress,
    HostAddress,
    Vector,
    Bytes,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Scalar => "scalar",
            ValueKind::FileAddress => "file address",
            ValueKind::LoadAddress => "load address",
            ValueKind::HostAddress => "host address",
            ValueKind::Vector => "vector",
            ValueKind::Bytes => "byte buffer",
        };
        f.write_str(name)
    }
}

/// One entry on the evaluation stack, or the final result of an
/// evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A plain number with width and signedness.
    Scalar(Scalar),
    /// Unrelocated address within an object file's linked layout.
    FileAddress(u64),
    /// Address in the debuggee's address space.
    LoadAddress(u64),
    /// Address in the debugger's own address space.
    HostAddress(u64),
    /// Opaque vector bytes (oversized register contents).
    Vector(Vec<u8>),
    /// Assembled multi-piece buffer.
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Scalar(_) => ValueKind::Scalar,
            Value::FileAddress(_) => ValueKind::FileAddress,
            Value::LoadAddress(_) => ValueKind::LoadAddress,
            Value::HostAddress(_) => ValueKind::HostAddress,
            Value::Vector(_) => ValueKind::Vector,
            Value::Bytes(_) => ValueKind::Bytes,
        }
    }

    /// The numeric reading of this value. Address kinds read as unsigned
    /// 64-bit scalars; vectors and byte buffers have none.
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Scalar(s) => Some(*s),
            Value::FileAddress(a) | Value::LoadAddress(a) | Value::HostAddress(a) => {
                Some(Scalar::from(*a))
            }
            Value::Vector(_) | Value::Bytes(_) => None,
        }
    }

    /// Rebuild a value of `kind` around a computed scalar. Arithmetic
    /// preserves the tag of the value it started from, so adding an offset
    /// to a load address yields a load address.
    pub(crate) fn with_scalar(kind: ValueKind, scalar: Scalar) -> Value {
        match kind {
            ValueKind::FileAddress => Value::FileAddress(scalar.as_u64()),
            ValueKind::LoadAddress => Value::LoadAddress(scalar.as_u64()),
            ValueKind::HostAddress => Value::HostAddress(scalar.as_u64()),
            ValueKind::Scalar | ValueKind::Vector | ValueKind::Bytes => Value::Scalar(scalar),
        }
    }

    /// Grow a buffer-backed value (vector or assembled bytes) to at least
    /// `n` bytes, zero-filling the new space. Returns false for value
    /// kinds that carry no buffer.
    pub fn resize(&mut self, n: usize) -> bool {
        match self {
            Value::Vector(bytes) | Value::Bytes(bytes) => {
                if bytes.len() < n {
                    bytes.resize(n, 0);
                }
                true
            }
            _ => false,
        }
    }

    /// `DW_OP_stack_value` semantics: the entry is the object's value, not
    /// its location. Address tags collapse to plain scalars; vectors and
    /// buffers already are values and stay untouched.
    pub fn retag_scalar(self) -> Value {
        match self {
            Value::FileAddress(a) | Value::LoadAddress(a) | Value::HostAddress(a) => {
                Value::Scalar(Scalar::from(a))
            }
            other => other,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Scalar(s) => write!(f, "scalar {s}"),
            Value::FileAddress(a) => write!(f, "file address {a:#x}"),
            Value::LoadAddress(a) => write!(f, "load address {a:#x}"),
            Value::HostAddress(a) => write!(f, "host address {a:#x}"),
            Value::Vector(b) => write!(f, "vector of {} bytes", b.len()),
            Value::Bytes(b) => write!(f, "buffer of {} bytes", b.len()),
        }
    }
}
