//! Operand-shape catalog for DWARF expression opcodes.
//!
//! Knowing how many bytes an opcode's immediate occupies is independent of
//! knowing what the opcode does. The catalog answers only the first
//! question, which lets the `DW_OP_addr` rewriter and the evaluator's
//! skip-unimplemented path step over opcodes without interpreting them.

use gimli::constants::*;
use gimli::DwOp;

use crate::errors::EvalError;
use crate::reader::ByteReader;

/// Marks a variable as uninitialised at this PC. Emitted by Apple's
/// toolchain; gimli does not name it.
pub const DW_OP_APPLE_uninit: DwOp = DwOp(0xf0);

fn is_nullary(op: DwOp) -> bool {
    matches!(
        op,
        DW_OP_deref
            | DW_OP_dup
            | DW_OP_drop
            | DW_OP_over
            | DW_OP_swap
            | DW_OP_rot
            | DW_OP_xderef
            | DW_OP_abs
            | DW_OP_and
            | DW_OP_div
            | DW_OP_minus
            | DW_OP_mod
            | DW_OP_mul
            | DW_OP_neg
            | DW_OP_not
            | DW_OP_or
            | DW_OP_plus
            | DW_OP_shl
            | DW_OP_shr
            | DW_OP_shra
            | DW_OP_xor
            | DW_OP_eq
            | DW_OP_ge
            | DW_OP_gt
            | DW_OP_le
            | DW_OP_lt
            | DW_OP_ne
            | DW_OP_nop
            | DW_OP_push_object_address
            | DW_OP_form_tls_address
            | DW_OP_call_frame_cfa
            | DW_OP_stack_value
            | DW_OP_GNU_push_tls_address
            | DW_OP_APPLE_uninit
    ) || (DW_OP_lit0.0..=DW_OP_lit31.0).contains(&op.0)
        || (DW_OP_reg0.0..=DW_OP_reg31.0).contains(&op.0)
}

fn is_single_leb(op: DwOp) -> bool {
    matches!(
        op,
        DW_OP_constu | DW_OP_consts | DW_OP_plus_uconst | DW_OP_regx | DW_OP_fbreg | DW_OP_piece
    ) || (DW_OP_breg0.0..=DW_OP_breg31.0).contains(&op.0)
}

/// Size in bytes of `op`'s encoded operands. `operands` must be positioned
/// immediately after the opcode byte; it is not advanced. Unknown opcodes
/// are decode errors; callers must not guess their way past them.
pub fn operand_size(op: DwOp, operands: &ByteReader<'_>) -> Result<usize, EvalError> {
    let mut r = *operands;
    let start = r.offset();

    if is_nullary(op) {
        return Ok(0);
    }
    if is_single_leb(op) {
        r.skip_leb128()?;
        return Ok(r.offset() - start);
    }

    match op {
        DW_OP_addr | DW_OP_call_ref => Ok(r.address_size() as usize),

        DW_OP_const1u | DW_OP_const1s | DW_OP_pick | DW_OP_deref_size | DW_OP_xderef_size => Ok(1),

        DW_OP_const2u | DW_OP_const2s | DW_OP_skip | DW_OP_bra | DW_OP_call2 => Ok(2),

        DW_OP_const4u | DW_OP_const4s | DW_OP_call4 => Ok(4),

        DW_OP_const8u | DW_OP_const8s => Ok(8),

        DW_OP_bregx | DW_OP_bit_piece => {
            r.skip_leb128()?;
            r.skip_leb128()?;
            Ok(r.offset() - start)
        }

        DW_OP_implicit_value => {
            let block_len = r.read_uleb128()?;
            let block_len = usize::try_from(block_len).map_err(|_| EvalError::Decode {
                offset: start,
                reason: "implicit value block length overflows".to_string(),
            })?;
            Ok(r.offset() - start + block_len)
        }

        _ => Err(EvalError::Decode {
            offset: start.saturating_sub(1),
            reason: format!("unknown DWARF expression opcode {:#04x}", op.0),
        }),
    }
}
