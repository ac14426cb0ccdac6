//! Process, frame and thread contracts consumed by the evaluator.

use gimli::{Endianity, RunTimeEndian};

use crate::error::TargetError;
use crate::module::ModuleId;
use crate::registers::RegisterContext;
use crate::scalar::Scalar;

/// A running (or core-file) debuggee process.
pub trait Process {
    /// Read exactly `len` bytes from the process at `addr`. Short reads are
    /// reported as errors, never as truncated buffers.
    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, TargetError>;

    /// Byte order of the debuggee.
    fn byte_order(&self) -> RunTimeEndian;

    /// Pointer width of the debuggee in bytes.
    fn address_size(&self) -> u8;

    /// Read a pointer-sized word at `addr`, zero-extended to 64 bits.
    fn read_pointer(&self, addr: u64) -> Result<u64, TargetError> {
        let size = self.address_size() as usize;
        let bytes = self.read_memory(addr, size)?;
        let mut word = [0u8; 8];
        if self.byte_order().is_big_endian() {
            word[8 - size..].copy_from_slice(&bytes);
            Ok(u64::from_be_bytes(word))
        } else {
            word[..size].copy_from_slice(&bytes);
            Ok(u64::from_le_bytes(word))
        }
    }
}

/// One call frame of a stopped thread.
pub trait Frame {
    /// The frame base (the value `DW_OP_fbreg` offsets are relative to),
    /// usually itself computed from the function's `DW_AT_frame_base`.
    fn frame_base(&self) -> Result<Scalar, TargetError>;

    /// The canonical frame address from unwind info, if known.
    fn cfa(&self) -> Option<u64>;

    /// Register state for this frame, when available.
    fn register_context(&self) -> Option<&dyn RegisterContext>;
}

/// A thread of the debuggee, used to resolve thread-local storage.
pub trait Thread {
    /// Base load address of the TLS block this module contributes to the
    /// thread, or `None` when no TLS data exists yet.
    fn thread_local_base(&self, module: ModuleId) -> Option<u64>;
}
