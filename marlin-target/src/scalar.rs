//! Width- and signedness-tracking machine integers.
//!
//! DWARF expression opcodes push values of a specific width and signedness
//! (`DW_OP_const1s` pushes a signed byte, `DW_OP_const4u` an unsigned
//! 32-bit value) and later arithmetic must honour what was pushed. `Scalar`
//! keeps the raw two's-complement bits together with that type information
//! and applies C's usual arithmetic conversions when two scalars meet.

use gimli::{Endianity, RunTimeEndian};

/// A machine integer with an explicit byte width (1, 2, 4 or 8) and
/// signedness. The stored bits are truncated to the width; accessors
/// zero- or sign-extend as appropriate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scalar {
    bits: u64,
    width: u8,
    signed: bool,
}

fn width_mask(width: u8) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn sign_extend(bits: u64, from_bits: u32) -> i64 {
    debug_assert!(from_bits > 0 && from_bits <= 64);
    let shift = 64 - from_bits;
    ((bits << shift) as i64) >> shift
}

impl Scalar {
    pub fn new(bits: u64, width: u8, signed: bool) -> Self {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        Scalar {
            bits: bits & width_mask(width),
            width,
            signed,
        }
    }

    pub fn byte_width(&self) -> u8 {
        self.width
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// The value zero-extended from its width.
    pub fn as_u64(&self) -> u64 {
        self.bits & width_mask(self.width)
    }

    /// The value sign-extended from its width.
    pub fn as_i64(&self) -> i64 {
        sign_extend(self.as_u64(), self.width as u32 * 8)
    }

    pub fn is_zero(&self) -> bool {
        self.as_u64() == 0
    }

    /// Value-preserving conversion to a different width/signedness, then
    /// truncation into the new width.
    fn converted(self, width: u8, signed: bool) -> Scalar {
        let value = if self.signed {
            self.as_i64() as u64
        } else {
            self.as_u64()
        };
        Scalar::new(value, width, signed)
    }

    /// C integer promotion: anything narrower than 4 bytes becomes a
    /// signed 32-bit value (both i8/i16 and u8/u16 fit in int).
    fn promoted(self) -> Scalar {
        if self.width < 4 {
            self.converted(4, true)
        } else {
            self
        }
    }

    /// Usual arithmetic conversions for a binary operation: promote both
    /// operands, then adopt the wider operand's width; on equal widths the
    /// result is unsigned if either side is.
    fn usual_conversions(self, other: Scalar) -> (Scalar, Scalar) {
        let a = self.promoted();
        let b = other.promoted();
        let width = a.width.max(b.width);
        let signed = if a.width == b.width {
            a.signed && b.signed
        } else if a.width > b.width {
            a.signed
        } else {
            b.signed
        };
        (a.converted(width, signed), b.converted(width, signed))
    }

    pub fn add(self, rhs: Scalar) -> Scalar {
        let (a, b) = self.usual_conversions(rhs);
        Scalar::new(a.as_u64().wrapping_add(b.as_u64()), a.width, a.signed)
    }

    pub fn sub(self, rhs: Scalar) -> Scalar {
        let (a, b) = self.usual_conversions(rhs);
        Scalar::new(a.as_u64().wrapping_sub(b.as_u64()), a.width, a.signed)
    }

    pub fn mul(self, rhs: Scalar) -> Scalar {
        let (a, b) = self.usual_conversions(rhs);
        Scalar::new(a.as_u64().wrapping_mul(b.as_u64()), a.width, a.signed)
    }

    /// Division following the operands' signedness. `None` on division by
    /// zero and on `i64::MIN / -1`.
    pub fn div(self, rhs: Scalar) -> Option<Scalar> {
        let (a, b) = self.usual_conversions(rhs);
        if b.is_zero() {
            return None;
        }
        let bits = if a.signed {
            a.as_i64().checked_div(b.as_i64())? as u64
        } else {
            a.as_u64() / b.as_u64()
        };
        Some(Scalar::new(bits, a.width, a.signed))
    }

    /// Remainder following the operands' signedness, same failure cases as
    /// [`Scalar::div`].
    pub fn rem(self, rhs: Scalar) -> Option<Scalar> {
        let (a, b) = self.usual_conversions(rhs);
        if b.is_zero() {
            return None;
        }
        let bits = if a.signed {
            a.as_i64().checked_rem(b.as_i64())? as u64
        } else {
            a.as_u64() % b.as_u64()
        };
        Some(Scalar::new(bits, a.width, a.signed))
    }

    pub fn bit_and(self, rhs: Scalar) -> Scalar {
        let (a, b) = self.usual_conversions(rhs);
        Scalar::new(a.as_u64() & b.as_u64(), a.width, a.signed)
    }

    pub fn bit_or(self, rhs: Scalar) -> Scalar {
        let (a, b) = self.usual_conversions(rhs);
        Scalar::new(a.as_u64() | b.as_u64(), a.width, a.signed)
    }

    pub fn bit_xor(self, rhs: Scalar) -> Scalar {
        let (a, b) = self.usual_conversions(rhs);
        Scalar::new(a.as_u64() ^ b.as_u64(), a.width, a.signed)
    }

    /// Left shift. The result keeps the (promoted) left operand's type;
    /// shifting by the width or more yields zero.
    pub fn shl(self, amount: Scalar) -> Scalar {
        let a = self.promoted();
        let n = amount.as_u64();
        let bits = if n >= a.width as u64 * 8 {
            0
        } else {
            a.as_u64() << n
        };
        Scalar::new(bits, a.width, a.signed)
    }

    /// Logical right shift: always zero-fills regardless of signedness.
    pub fn shr_logical(self, amount: Scalar) -> Scalar {
        let a = self.promoted();
        let n = amount.as_u64();
        let bits = if n >= a.width as u64 * 8 {
            0
        } else {
            a.as_u64() >> n
        };
        Scalar::new(bits, a.width, a.signed)
    }

    /// Arithmetic right shift: fills with the sign bit.
    pub fn shr_arithmetic(self, amount: Scalar) -> Scalar {
        let a = self.promoted();
        let n = amount.as_u64();
        let total = a.width as u64 * 8;
        let value = a.as_i64();
        let bits = if n >= total {
            if value < 0 {
                u64::MAX
            } else {
                0
            }
        } else {
            (value >> n) as u64
        };
        Scalar::new(bits, a.width, a.signed)
    }

    /// Two's-complement negation within the current width.
    pub fn negate(self) -> Scalar {
        Scalar::new(self.as_u64().wrapping_neg(), self.width, self.signed)
    }

    /// Bitwise ones-complement within the current width.
    pub fn ones_complement(self) -> Scalar {
        Scalar::new(!self.as_u64(), self.width, self.signed)
    }

    /// Absolute value treating the scalar as signed. `None` when the
    /// magnitude is unrepresentable (`i64::MIN`). Unsigned scalars are
    /// returned unchanged.
    pub fn absolute(self) -> Option<Scalar> {
        if !self.signed {
            return Some(self);
        }
        let value = self.as_i64().checked_abs()?;
        Some(Scalar::new(value as u64, self.width, self.signed))
    }

    fn compare(self, rhs: Scalar) -> std::cmp::Ordering {
        let (a, b) = self.usual_conversions(rhs);
        if a.signed {
            a.as_i64().cmp(&b.as_i64())
        } else {
            a.as_u64().cmp(&b.as_u64())
        }
    }

    fn boolean(result: bool) -> Scalar {
        Scalar::from(result as i32)
    }

    pub fn eq(self, rhs: Scalar) -> Scalar {
        Scalar::boolean(self.compare(rhs).is_eq())
    }

    pub fn ne(self, rhs: Scalar) -> Scalar {
        Scalar::boolean(self.compare(rhs).is_ne())
    }

    pub fn lt(self, rhs: Scalar) -> Scalar {
        Scalar::boolean(self.compare(rhs).is_lt())
    }

    pub fn le(self, rhs: Scalar) -> Scalar {
        Scalar::boolean(self.compare(rhs).is_le())
    }

    pub fn gt(self, rhs: Scalar) -> Scalar {
        Scalar::boolean(self.compare(rhs).is_gt())
    }

    pub fn ge(self, rhs: Scalar) -> Scalar {
        Scalar::boolean(self.compare(rhs).is_ge())
    }

    /// Extract `bit_size` bits starting `bit_offset` bits above the least
    /// significant bit. Fails when the requested field does not fit in the
    /// scalar's width. Signed scalars sign-extend from the extracted field.
    pub fn extract_bitfield(self, bit_size: u32, bit_offset: u32) -> Option<Scalar> {
        let total = self.width as u32 * 8;
        if bit_size == 0 || bit_size.checked_add(bit_offset)? > total {
            return None;
        }
        let field = if bit_size >= 64 {
            self.as_u64() >> bit_offset
        } else {
            (self.as_u64() >> bit_offset) & ((1u64 << bit_size) - 1)
        };
        let bits = if self.signed {
            sign_extend(field, bit_size) as u64
        } else {
            field
        };
        Some(Scalar::new(bits, self.width, self.signed))
    }

    /// Serialise the low `len` bytes of the value in the given byte order.
    /// Used when appending scalar-sourced pieces to a composite buffer.
    pub fn to_target_bytes(&self, len: usize, endian: RunTimeEndian) -> Vec<u8> {
        let len = len.min(8);
        let value = self.as_u64();
        if endian.is_big_endian() {
            value.to_be_bytes()[8 - len..].to_vec()
        } else {
            value.to_le_bytes()[..len].to_vec()
        }
    }
}

impl From<u8> for Scalar {
    fn from(v: u8) -> Self {
        Scalar::new(v as u64, 1, false)
    }
}

impl From<i8> for Scalar {
    fn from(v: i8) -> Self {
        Scalar::new(v as u64, 1, true)
    }
}

impl From<u16> for Scalar {
    fn from(v: u16) -> Self {
        Scalar::new(v as u64, 2, false)
    }
}

impl From<i16> for Scalar {
    fn from(v: i16) -> Self {
        Scalar::new(v as u64, 2, true)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::new(v as u64, 4, false)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::new(v as u64, 4, true)
    }
}

impl From<u64> for Scalar {
    fn from(v: u64) -> Self {
        Scalar::new(v, 8, false)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::new(v as u64, 8, true)
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.signed {
            write!(f, "{}", self.as_i64())
        } else {
            write!(f, "{:#x}", self.as_u64())
        }
    }
}
