//! The `Expression` value type: DWARF location bytecode plus the metadata
//! needed to decode it.
//!
//! An expression is either a single opcode stream or a location list
//! covering several PC ranges (`loclist_slide` present). The buffer is
//! shared and never mutated; rewriting a `DW_OP_addr` immediate produces a
//! new expression because the source bytes may live in a read-only mapping
//! of the object file.

use std::sync::Arc;

use gimli::constants::DW_OP_addr;
use gimli::{DwOp, Endianity, RunTimeEndian};
use tracing::debug;

use marlin_target::{Frame, ModuleId, Process, RegisterContext, RegisterKind, Thread};

use crate::errors::EvalError;
use crate::evaluator::evaluate_opcodes;
use crate::loclist;
use crate::opcode::operand_size;
use crate::reader::ByteReader;
use crate::value::Value;

/// References into the surrounding debugger state an evaluation may
/// consult. Every field is optional; opcodes that need an absent piece
/// fail with a `MissingContext` error instead of crashing.
#[derive(Clone, Copy, Default)]
pub struct EvalContext<'a> {
    pub process: Option<&'a dyn Process>,
    pub frame: Option<&'a dyn Frame>,
    pub thread: Option<&'a dyn Thread>,
    pub registers: Option<&'a dyn RegisterContext>,
    /// Module to resolve TLS against when the expression itself carries
    /// none.
    pub module: Option<ModuleId>,
}

/// DWARF location bytecode with its decode metadata.
#[derive(Debug, Clone)]
pub struct Expression {
    data: Arc<[u8]>,
    byte_order: RunTimeEndian,
    address_size: u8,
    register_kind: RegisterKind,
    /// `Some` marks the buffer as a location list whose entry addresses
    /// are relative to this slide.
    loclist_slide: Option<u64>,
    /// Non-owning link to the module the bytecode came from.
    module: Option<ModuleId>,
}

impl Expression {
    pub fn new(
        bytes: impl Into<Arc<[u8]>>,
        byte_order: RunTimeEndian,
        address_size: u8,
        register_kind: RegisterKind,
        loclist_slide: Option<u64>,
    ) -> Self {
        Expression {
            data: bytes.into(),
            byte_order,
            address_size,
            register_kind,
            loclist_slide,
            module: None,
        }
    }

    /// Synthesize an expression holding a raw constant block, used for
    /// variables whose debug info supplies `DW_AT_const_value` instead of
    /// a location. Callers consume the bytes directly.
    pub fn from_const(value: u64, byte_size: usize, byte_order: RunTimeEndian) -> Self {
        let byte_size = byte_size.min(8);
        let bytes = if byte_order.is_big_endian() {
            value.to_be_bytes()[8 - byte_size..].to_vec()
        } else {
            value.to_le_bytes()[..byte_size].to_vec()
        };
        Expression {
            data: bytes.into(),
            byte_order,
            address_size: byte_size.max(1) as u8,
            register_kind: RegisterKind::Dwarf,
            loclist_slide: None,
            module: None,
        }
    }

    pub fn with_module(mut self, module: ModuleId) -> Self {
        self.module = Some(module);
        self
    }

    pub fn module(&self) -> Option<ModuleId> {
        self.module
    }

    pub fn is_valid(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn opcode_data(&self) -> &[u8] {
        &self.data
    }

    pub fn byte_order(&self) -> RunTimeEndian {
        self.byte_order
    }

    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    pub fn register_kind(&self) -> RegisterKind {
        self.register_kind
    }

    pub fn loclist_slide(&self) -> Option<u64> {
        self.loclist_slide
    }

    pub fn set_loclist_slide(&mut self, slide: Option<u64>) {
        self.loclist_slide = slide;
    }

    pub fn is_location_list(&self) -> bool {
        self.loclist_slide.is_some()
    }

    /// The `(offset, length)` of the expression slice applying at `pc`.
    /// A plain expression is its own single range; a location list is
    /// searched with `base_addr` as the list's base.
    pub fn find_range(&self, base_addr: u64, pc: u64) -> Result<Option<(usize, usize)>, EvalError> {
        match self.loclist_slide {
            None => Ok(Some((0, self.data.len()))),
            Some(slide) => loclist::find_range(
                &self.data,
                self.byte_order,
                self.address_size,
                base_addr,
                slide,
                pc,
            ),
        }
    }

    /// Whether some location-list entry covers `pc`. Always false for a
    /// plain expression and for malformed lists.
    pub fn location_list_contains(&self, base_addr: u64, pc: u64) -> bool {
        self.is_location_list() && matches!(self.find_range(base_addr, pc), Ok(Some(_)))
    }

    /// The immediate of the `idx`-th `DW_OP_addr` in the expression, or
    /// `None` when there are fewer. Location lists are not searched.
    pub fn get_addr_at(&self, idx: u32) -> Result<Option<u64>, EvalError> {
        if self.is_location_list() {
            return Ok(None);
        }
        let mut reader = ByteReader::new(&self.data, self.byte_order, self.address_size);
        let mut seen = 0u32;
        while !reader.at_end() {
            let op = DwOp(reader.read_u8()?);
            if op == DW_OP_addr {
                let addr = reader.read_address()?;
                if seen == idx {
                    return Ok(Some(addr));
                }
                seen += 1;
            } else {
                let size = operand_size(op, &reader)?;
                reader.skip(size)?;
            }
        }
        Ok(None)
    }

    /// Replace the first `DW_OP_addr` immediate with `file_addr`,
    /// returning a new expression over a fresh buffer. `None` when the
    /// expression has no `DW_OP_addr` (or is a location list). The source
    /// buffer is never written to.
    pub fn rewrite_addr(&self, file_addr: u64) -> Result<Option<Expression>, EvalError> {
        if self.is_location_list() {
            return Ok(None);
        }
        let mut reader = ByteReader::new(&self.data, self.byte_order, self.address_size);
        while !reader.at_end() {
            let op = DwOp(reader.read_u8()?);
            if op == DW_OP_addr {
                let immediate_at = reader.offset();
                // verify the immediate fits before copying
                reader.read_address()?;

                let mut bytes = self.data.to_vec();
                write_address(
                    &mut bytes[immediate_at..],
                    file_addr,
                    self.address_size,
                    self.byte_order,
                );
                let mut rewritten = self.clone();
                rewritten.data = bytes.into();
                return Ok(Some(rewritten));
            }
            let size = operand_size(op, &reader)?;
            reader.skip(size)?;
        }
        Ok(None)
    }

    /// Run the expression and produce its result value.
    ///
    /// For a location list, the probe PC is taken from `ctx.registers`
    /// (falling back to the frame's register context) and `loclist_base`
    /// anchors the entry addresses; no covering entry, an unknown PC, or a
    /// missing base all surface as `NoLocation`.
    pub fn evaluate(
        &self,
        ctx: &EvalContext<'_>,
        initial_value: Option<Value>,
        loclist_base: Option<u64>,
    ) -> Result<Value, EvalError> {
        let module = self.module.or(ctx.module);

        if self.is_location_list() {
            let registers = ctx
                .registers
                .or_else(|| ctx.frame.and_then(|f| f.register_context()));
            let pc = registers.and_then(|r| r.program_counter());
            let (Some(pc), Some(base)) = (pc, loclist_base) else {
                return Err(EvalError::NoLocation);
            };
            let Some((offset, length)) = self.find_range(base, pc)? else {
                debug!(pc, "no location list entry covers the pc");
                return Err(EvalError::NoLocation);
            };
            return evaluate_opcodes(
                &self.data[offset..offset + length],
                self.byte_order,
                self.address_size,
                self.register_kind,
                module,
                ctx,
                initial_value,
            );
        }

        evaluate_opcodes(
            &self.data,
            self.byte_order,
            self.address_size,
            self.register_kind,
            module,
            ctx,
            initial_value,
        )
    }
}

fn write_address(buf: &mut [u8], value: u64, address_size: u8, endian: RunTimeEndian) {
    let size = address_size as usize;
    if endian.is_big_endian() {
        buf[..size].copy_from_slice(&value.to_be_bytes()[8 - size..]);
    } else {
        buf[..size].copy_from_slice(&value.to_le_bytes()[..size]);
    }
}
