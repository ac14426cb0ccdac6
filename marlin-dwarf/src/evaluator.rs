//! The DWARF expression stack machine.
//!
//! One call evaluates one opcode slice to completion against its own value
//! stack and piece buffer; nothing is shared between evaluations and
//! identical inputs with identical collaborator state produce identical
//! results. Collaborator failures abort the run and propagate typed.

use gimli::constants::*;
use gimli::{DwOp, RunTimeEndian};
use tracing::{debug, trace, warn};

use marlin_target::{ModuleId, RegisterContext, RegisterKind, Scalar};

use crate::errors::{ContextItem, EvalError};
use crate::expression::EvalContext;
use crate::opcode::{operand_size, DW_OP_APPLE_uninit};
use crate::reader::ByteReader;
use crate::value::{Value, ValueKind};

fn require_depth(stack: &[Value], need: usize, op: DwOp) -> Result<(), EvalError> {
    if stack.len() < need {
        Err(EvalError::StackUnderflow {
            op,
            need,
            have: stack.len(),
        })
    } else {
        Ok(())
    }
}

fn pop_scalar(stack: &mut Vec<Value>, op: DwOp) -> Result<(Scalar, ValueKind), EvalError> {
    require_depth(stack, 1, op)?;
    let value = stack.pop().expect("depth checked");
    let kind = value.kind();
    let scalar = value.as_scalar().ok_or_else(|| EvalError::ValueDomain {
        op,
        reason: format!("{kind} has no scalar value"),
    })?;
    Ok((scalar, kind))
}

/// Pop two operands, combine their scalars, push the result. The result
/// keeps the tag of the deeper operand, so offsetting a load address
/// yields a load address.
fn binary_op(
    stack: &mut Vec<Value>,
    op: DwOp,
    f: impl FnOnce(Scalar, Scalar) -> Result<Scalar, EvalError>,
) -> Result<(), EvalError> {
    require_depth(stack, 2, op)?;
    let (rhs, _) = pop_scalar(stack, op)?;
    let (lhs, lhs_kind) = pop_scalar(stack, op)?;
    stack.push(Value::with_scalar(lhs_kind, f(lhs, rhs)?));
    Ok(())
}

fn unary_op(
    stack: &mut Vec<Value>,
    op: DwOp,
    f: impl FnOnce(Scalar) -> Result<Scalar, EvalError>,
) -> Result<(), EvalError> {
    let (operand, kind) = pop_scalar(stack, op)?;
    stack.push(Value::with_scalar(kind, f(operand)?));
    Ok(())
}

fn read_register_scalar(
    registers: Option<&dyn RegisterContext>,
    kind: RegisterKind,
    number: u32,
    op: DwOp,
) -> Result<Scalar, EvalError> {
    let regs = registers.ok_or(EvalError::MissingContext {
        op,
        need: ContextItem::RegisterContext,
    })?;
    let native = regs
        .convert_to_native(kind, number)
        .ok_or_else(|| EvalError::Register {
            op,
            kind,
            number,
            reason: "no native register mapping".to_string(),
        })?;
    regs.read_register(native).map_err(|e| EvalError::Register {
        op,
        kind,
        number,
        reason: e.to_string(),
    })
}

/// Read a pointer-sized word out of the debugger's own address space.
///
/// # Safety
///
/// Host addresses enter the stack only for memory the debugger itself
/// owns (the CFA contract and host-side staging buffers); the value must
/// point at readable memory of at least pointer size.
unsafe fn read_host_pointer(addr: u64) -> u64 {
    std::ptr::read_unaligned(addr as usize as *const usize) as u64
}

fn branch(reader: &mut ByteReader<'_>, rel: i16, op: DwOp) -> Result<(), EvalError> {
    let target = reader.offset() as i64 + i64::from(rel);
    if target < 0 || target >= reader.len() as i64 {
        return Err(EvalError::Decode {
            offset: reader.offset(),
            reason: format!("branch target out of range in {op}"),
        });
    }
    reader.seek(target as usize)
}

pub(crate) fn evaluate_opcodes(
    opcodes: &[u8],
    byte_order: RunTimeEndian,
    address_size: u8,
    register_kind: RegisterKind,
    module: Option<ModuleId>,
    ctx: &EvalContext<'_>,
    initial_value: Option<Value>,
) -> Result<Value, EvalError> {
    if opcodes.is_empty() {
        return Err(EvalError::NoLocation);
    }

    let registers = ctx
        .registers
        .or_else(|| ctx.frame.and_then(|f| f.register_context()));

    let mut stack: Vec<Value> = Vec::new();
    stack.extend(initial_value);

    // Multi-piece accumulation; `pieces.len() == piece_offset` before
    // every piece after the first.
    let mut pieces: Vec<u8> = Vec::new();
    let mut piece_offset: u64 = 0;

    let mut reader = ByteReader::new(opcodes, byte_order, address_size);
    debug!(len = opcodes.len(), "evaluating DWARF expression");

    while !reader.at_end() {
        let op_offset = reader.offset();
        let op = DwOp(reader.read_u8()?);
        trace!(offset = op_offset, %op, depth = stack.len(), "step");

        match op {
            DW_OP_addr => {
                let addr = reader.read_address()?;
                stack.push(Value::FileAddress(addr));
            }

            DW_OP_deref => {
                require_depth(&stack, 1, op)?;
                let replacement = match stack.last().expect("depth checked") {
                    Value::HostAddress(addr) => {
                        // SAFETY: see read_host_pointer; host addresses are
                        // debugger-owned by construction.
                        let word = unsafe { read_host_pointer(*addr) };
                        Some(Value::Scalar(Scalar::from(word)))
                    }
                    Value::LoadAddress(addr) => {
                        let addr = *addr;
                        let process = ctx.process.ok_or(EvalError::MissingContext {
                            op,
                            need: ContextItem::Process,
                        })?;
                        let word = process.read_pointer(addr).map_err(|e| EvalError::Memory {
                            op,
                            addr,
                            size: address_size as usize,
                            source: e,
                        })?;
                        Some(Value::Scalar(Scalar::from(word)))
                    }
                    // File addresses are not readable before relocation and
                    // plain values have nothing to dereference; both pass
                    // through untouched.
                    _ => None,
                };
                if let Some(value) = replacement {
                    *stack.last_mut().expect("depth checked") = value;
                }
            }

            DW_OP_deref_size => {
                require_depth(&stack, 1, op)?;
                let size = reader.read_u8()? as usize;
                if size == 0 || size > 8 {
                    return Err(EvalError::Decode {
                        offset: op_offset,
                        reason: format!("invalid dereference size {size}"),
                    });
                }
                let replacement = match stack.last().expect("depth checked") {
                    Value::HostAddress(addr) => {
                        // SAFETY: see read_host_pointer.
                        let word = unsafe { read_host_pointer(*addr) };
                        let word = if size >= 8 {
                            word
                        } else {
                            word & ((1u64 << (size * 8)) - 1)
                        };
                        Some(Value::Scalar(Scalar::from(word)))
                    }
                    Value::LoadAddress(addr) => {
                        let addr = *addr;
                        let process = ctx.process.ok_or(EvalError::MissingContext {
                            op,
                            need: ContextItem::Process,
                        })?;
                        let bytes =
                            process
                                .read_memory(addr, size)
                                .map_err(|e| EvalError::Memory {
                                    op,
                                    addr,
                                    size,
                                    source: e,
                                })?;
                        let mut word_reader =
                            ByteReader::new(&bytes, process.byte_order(), address_size);
                        let word = word_reader.read_unsigned(size)?;
                        Some(Value::Scalar(Scalar::from(word)))
                    }
                    _ => None,
                };
                if let Some(value) = replacement {
                    *stack.last_mut().expect("depth checked") = value;
                }
            }

            DW_OP_xderef | DW_OP_xderef_size | DW_OP_push_object_address | DW_OP_call2
            | DW_OP_call4 | DW_OP_call_ref => {
                return Err(EvalError::NotImplemented { op });
            }

            DW_OP_const1u => stack.push(Value::Scalar(Scalar::from(reader.read_u8()?))),
            DW_OP_const1s => stack.push(Value::Scalar(Scalar::from(reader.read_u8()? as i8))),
            DW_OP_const2u => stack.push(Value::Scalar(Scalar::from(reader.read_u16()?))),
            DW_OP_const2s => stack.push(Value::Scalar(Scalar::from(reader.read_u16()? as i16))),
            DW_OP_const4u => stack.push(Value::Scalar(Scalar::from(reader.read_u32()?))),
            DW_OP_const4s => stack.push(Value::Scalar(Scalar::from(reader.read_u32()? as i32))),
            DW_OP_const8u => stack.push(Value::Scalar(Scalar::from(reader.read_u64()?))),
            DW_OP_const8s => stack.push(Value::Scalar(Scalar::from(reader.read_u64()? as i64))),
            DW_OP_constu => stack.push(Value::Scalar(Scalar::from(reader.read_uleb128()?))),
            DW_OP_consts => stack.push(Value::Scalar(Scalar::from(reader.read_sleb128()?))),

            DW_OP_dup => {
                require_depth(&stack, 1, op)?;
                stack.push(stack.last().expect("depth checked").clone());
            }

            DW_OP_drop => {
                require_depth(&stack, 1, op)?;
                stack.pop();
            }

            DW_OP_over => {
                require_depth(&stack, 2, op)?;
                stack.push(stack[stack.len() - 2].clone());
            }

            DW_OP_pick => {
                let index = reader.read_u8()? as usize;
                if index >= stack.len() {
                    return Err(EvalError::StackUnderflow {
                        op,
                        need: index + 1,
                        have: stack.len(),
                    });
                }
                stack.push(stack[index].clone());
            }

            DW_OP_swap => {
                require_depth(&stack, 2, op)?;
                let len = stack.len();
                stack.swap(len - 1, len - 2);
            }

            DW_OP_rot => {
                require_depth(&stack, 3, op)?;
                let len = stack.len();
                let top = stack.remove(len - 1);
                stack.insert(len - 3, top);
            }

            DW_OP_abs => unary_op(&mut stack, op, |s| {
                s.absolute().ok_or_else(|| EvalError::ValueDomain {
                    op,
                    reason: "absolute value is unrepresentable".to_string(),
                })
            })?,

            DW_OP_and => binary_op(&mut stack, op, |a, b| Ok(a.bit_and(b)))?,

            DW_OP_div => binary_op(&mut stack, op, |a, b| {
                if b.is_zero() {
                    return Err(EvalError::DivisionByZero { op });
                }
                a.div(b).ok_or_else(|| EvalError::ValueDomain {
                    op,
                    reason: "quotient is unrepresentable".to_string(),
                })
            })?,

            DW_OP_minus => binary_op(&mut stack, op, |a, b| Ok(a.sub(b)))?,

            DW_OP_mod => binary_op(&mut stack, op, |a, b| {
                if b.is_zero() {
                    return Err(EvalError::DivisionByZero { op });
                }
                a.rem(b).ok_or_else(|| EvalError::ValueDomain {
                    op,
                    reason: "remainder is unrepresentable".to_string(),
                })
            })?,

            DW_OP_mul => binary_op(&mut stack, op, |a, b| Ok(a.mul(b)))?,
            DW_OP_neg => unary_op(&mut stack, op, |s| Ok(s.negate()))?,
            DW_OP_not => unary_op(&mut stack, op, |s| Ok(s.ones_complement()))?,
            DW_OP_or => binary_op(&mut stack, op, |a, b| Ok(a.bit_or(b)))?,
            DW_OP_plus => binary_op(&mut stack, op, |a, b| Ok(a.add(b)))?,

            DW_OP_plus_uconst => {
                let (top, kind) = pop_scalar(&mut stack, op)?;
                let addend = reader.read_uleb128()?;
                stack.push(Value::with_scalar(kind, top.add(Scalar::from(addend))));
            }

            DW_OP_shl => binary_op(&mut stack, op, |a, b| Ok(a.shl(b)))?,
            DW_OP_shr => binary_op(&mut stack, op, |a, b| Ok(a.shr_logical(b)))?,
            DW_OP_shra => binary_op(&mut stack, op, |a, b| Ok(a.shr_arithmetic(b)))?,
            DW_OP_xor => binary_op(&mut stack, op, |a, b| Ok(a.bit_xor(b)))?,

            DW_OP_skip => {
                let rel = reader.read_u16()? as i16;
                branch(&mut reader, rel, op)?;
            }

            DW_OP_bra => {
                let (condition, _) = pop_scalar(&mut stack, op)?;
                let rel = reader.read_u16()? as i16;
                if !condition.is_zero() {
                    branch(&mut reader, rel, op)?;
                }
            }

            DW_OP_eq => binary_op(&mut stack, op, |a, b| Ok(a.eq(b)))?,
            DW_OP_ge => binary_op(&mut stack, op, |a, b| Ok(a.ge(b)))?,
            DW_OP_gt => binary_op(&mut stack, op, |a, b| Ok(a.gt(b)))?,
            DW_OP_le => binary_op(&mut stack, op, |a, b| Ok(a.le(b)))?,
            DW_OP_lt => binary_op(&mut stack, op, |a, b| Ok(a.lt(b)))?,
            DW_OP_ne => binary_op(&mut stack, op, |a, b| Ok(a.ne(b)))?,

            _ if (DW_OP_lit0.0..=DW_OP_lit31.0).contains(&op.0) => {
                stack.push(Value::Scalar(Scalar::from((op.0 - DW_OP_lit0.0) as i32)));
            }

            _ if (DW_OP_reg0.0..=DW_OP_reg31.0).contains(&op.0) => {
                let number = (op.0 - DW_OP_reg0.0) as u32;
                let value = read_register_scalar(registers, register_kind, number, op)?;
                stack.push(Value::Scalar(value));
            }

            DW_OP_regx => {
                let number = u32::try_from(reader.read_uleb128()?).map_err(|_| {
                    EvalError::Decode {
                        offset: op_offset,
                        reason: "register number does not fit in 32 bits".to_string(),
                    }
                })?;
                let value = read_register_scalar(registers, register_kind, number, op)?;
                stack.push(Value::Scalar(value));
            }

            _ if (DW_OP_breg0.0..=DW_OP_breg31.0).contains(&op.0) => {
                let number = (op.0 - DW_OP_breg0.0) as u32;
                let base = read_register_scalar(registers, register_kind, number, op)?;
                let offset = reader.read_sleb128()?;
                stack.push(Value::LoadAddress(base.add(Scalar::from(offset)).as_u64()));
            }

            DW_OP_bregx => {
                let number = u32::try_from(reader.read_uleb128()?).map_err(|_| {
                    EvalError::Decode {
                        offset: op_offset,
                        reason: "register number does not fit in 32 bits".to_string(),
                    }
                })?;
                let base = read_register_scalar(registers, register_kind, number, op)?;
                let offset = reader.read_sleb128()?;
                stack.push(Value::LoadAddress(base.add(Scalar::from(offset)).as_u64()));
            }

            DW_OP_fbreg => {
                let frame = ctx.frame.ok_or(EvalError::MissingContext {
                    op,
                    need: ContextItem::Frame,
                })?;
                let base = frame.frame_base().map_err(|e| EvalError::Frame {
                    op,
                    reason: e.to_string(),
                })?;
                let offset = reader.read_sleb128()?;
                stack.push(Value::LoadAddress(base.add(Scalar::from(offset)).as_u64()));
            }

            DW_OP_nop => {}

            DW_OP_piece => {
                let piece_size = reader.read_uleb128()?;
                if piece_size == 0 {
                    continue;
                }
                let size = usize::try_from(piece_size).map_err(|_| EvalError::ValueDomain {
                    op,
                    reason: format!("piece of {piece_size} bytes is unrepresentable"),
                })?;

                if pieces.len() as u64 != piece_offset {
                    return Err(EvalError::ValueDomain {
                        op,
                        reason: format!(
                            "piece expected at offset {piece_offset} but the buffer holds {} bytes",
                            pieces.len()
                        ),
                    });
                }

                if stack.is_empty() {
                    // This piece of the object is unavailable at the
                    // current PC; it still occupies its slot.
                    pieces.resize(pieces.len() + size, 0);
                } else {
                    let source = stack.pop().expect("non-empty");
                    match &source {
                        Value::LoadAddress(addr) => {
                            let addr = *addr;
                            let process = ctx.process.ok_or(EvalError::MissingContext {
                                op,
                                need: ContextItem::Process,
                            })?;
                            let bytes = process.read_memory(addr, size).map_err(|e| {
                                EvalError::Memory {
                                    op,
                                    addr,
                                    size,
                                    source: e,
                                }
                            })?;
                            pieces.extend_from_slice(&bytes);
                        }
                        Value::FileAddress(addr) | Value::HostAddress(addr) => {
                            return Err(EvalError::ValueDomain {
                                op,
                                reason: format!(
                                    "cannot assemble a {size} byte piece from a {} ({addr:#x})",
                                    source.kind()
                                ),
                            });
                        }
                        Value::Scalar(scalar) => {
                            let bits = size
                                .checked_mul(8)
                                .and_then(|b| u32::try_from(b).ok())
                                .ok_or_else(|| EvalError::ValueDomain {
                                    op,
                                    reason: format!("piece of {size} bytes is unrepresentable"),
                                })?;
                            let field = scalar.extract_bitfield(bits, 0).ok_or_else(|| {
                                EvalError::ValueDomain {
                                    op,
                                    reason: format!(
                                        "unable to extract {size} bytes from a {} byte scalar",
                                        scalar.byte_width()
                                    ),
                                }
                            })?;
                            pieces.extend_from_slice(&field.to_target_bytes(size, byte_order));
                        }
                        Value::Vector(bytes) => {
                            if bytes.len() < size {
                                return Err(EvalError::ValueDomain {
                                    op,
                                    reason: format!(
                                        "unable to extract {size} bytes from a {} byte vector",
                                        bytes.len()
                                    ),
                                });
                            }
                            pieces.extend_from_slice(&bytes[..size]);
                        }
                        Value::Bytes(_) => {
                            return Err(EvalError::ValueDomain {
                                op,
                                reason: "piece source is already an assembled buffer".to_string(),
                            });
                        }
                    }
                }
                piece_offset += piece_size;
            }

            DW_OP_bit_piece => {
                require_depth(&stack, 1, op)?;
                let bit_size = reader.read_uleb128()?;
                let bit_offset = reader.read_uleb128()?;
                let (size, offset) = match (u32::try_from(bit_size), u32::try_from(bit_offset)) {
                    (Ok(s), Ok(o)) => (s, o),
                    _ => {
                        return Err(EvalError::ValueDomain {
                            op,
                            reason: format!(
                                "bit piece of {bit_size} bits at offset {bit_offset} is unrepresentable"
                            ),
                        })
                    }
                };
                let top = stack.last_mut().expect("depth checked");
                match top {
                    Value::Scalar(scalar) => {
                        let field = scalar.extract_bitfield(size, offset).ok_or_else(|| {
                            EvalError::ValueDomain {
                                op,
                                reason: format!(
                                    "unable to extract a {size} bit value at bit offset {offset} \
                                     from a {} bit scalar",
                                    scalar.byte_width() as u32 * 8
                                ),
                            }
                        })?;
                        *scalar = field;
                    }
                    other => {
                        return Err(EvalError::ValueDomain {
                            op,
                            reason: format!("unable to extract a bit piece from a {}", other.kind()),
                        });
                    }
                }
            }

            DW_OP_stack_value => {
                require_depth(&stack, 1, op)?;
                let top = stack.pop().expect("depth checked");
                stack.push(top.retag_scalar());
            }

            DW_OP_call_frame_cfa => {
                let frame = ctx.frame.ok_or(EvalError::MissingContext {
                    op,
                    need: ContextItem::Frame,
                })?;
                let cfa = frame.cfa().ok_or_else(|| EvalError::Frame {
                    op,
                    reason: "stack frame does not include a canonical frame address".to_string(),
                })?;
                // Callers rely on the CFA arriving host-tagged.
                stack.push(Value::HostAddress(cfa));
            }

            DW_OP_GNU_push_tls_address => {
                require_depth(&stack, 1, op)?;
                let module = module.ok_or(EvalError::MissingContext {
                    op,
                    need: ContextItem::Module,
                })?;
                let thread = ctx.thread.ok_or(EvalError::MissingContext {
                    op,
                    need: ContextItem::Thread,
                })?;
                let tls_base = thread
                    .thread_local_base(module)
                    .ok_or(EvalError::TlsUnavailable)?;
                let (offset, _) = pop_scalar(&mut stack, op)?;
                stack.push(Value::LoadAddress(tls_base.wrapping_add(offset.as_u64())));
            }

            DW_OP_form_tls_address | DW_OP_implicit_value | DW_OP_APPLE_uninit => {
                let size = operand_size(op, &reader)?;
                reader.skip(size)?;
                warn!(%op, "skipping opcode with unimplemented semantics");
            }

            _ => {
                return Err(EvalError::Decode {
                    offset: op_offset,
                    reason: format!("unknown DWARF expression opcode {:#04x}", op.0),
                });
            }
        }
    }

    if !pieces.is_empty() {
        return Ok(Value::Bytes(pieces));
    }
    stack.pop().ok_or(EvalError::NoLocation)
}
