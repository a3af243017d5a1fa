//! The barrel shifter and the flag-producing arithmetic core.
//!
//! Data-processing instructions feed their second operand through the barrel
//! shifter; the shifter's carry-out becomes the C flag for logical
//! operations, while arithmetic operations derive C and V from the add or
//! subtract itself.
//!
//! Shift-amount edge cases (immediate encodings):
//!
//! - `LSL #0` leaves the value and carry untouched
//! - `LSR #0` encodes `LSR #32`: result 0, carry = bit 31
//! - `ASR #0` encodes `ASR #32`: sign fill, carry = bit 31
//! - `ROR #0` encodes `RRX`: rotate through carry by one
//!
//! Register-specified amounts skip those encodings: amount 0 changes
//! nothing, and amounts of 32 and beyond are defined per the ARM ARM
//! ([`shift_by_register`]).

use serde::{Deserialize, Serialize};

use crate::bitwise::{Bits, borrowed_sub, carried_add, overflowed_add, overflowed_sub};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl From<u32> for ShiftKind {
    fn from(bits: u32) -> Self {
        match bits & 0b11 {
            0 => Self::Lsl,
            1 => Self::Lsr,
            2 => Self::Asr,
            _ => Self::Ror,
        }
    }
}

/// A value plus the four condition flags it produces.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ArithmeticOpResult {
    pub result: u32,
    pub carry: bool,
    pub overflow: bool,
    pub sign: bool,
    pub zero: bool,
}

impl ArithmeticOpResult {
    fn from_logical(result: u32, carry: bool) -> Self {
        Self {
            result,
            carry,
            overflow: false,
            sign: result.get_bit(31),
            zero: result == 0,
        }
    }
}

/// Barrel shift with an immediate amount; amount 0 selects the special
/// encodings listed in the module docs. Only `result` and `carry` are
/// meaningful in the return value.
#[must_use]
pub fn shift(kind: ShiftKind, amount: u32, value: u32, carry: bool) -> ArithmeticOpResult {
    match (kind, amount) {
        (ShiftKind::Lsl, 0) => ArithmeticOpResult {
            result: value,
            carry,
            ..Default::default()
        },
        (ShiftKind::Lsr | ShiftKind::Asr, 0) => shift_by_register(kind, 32, value, carry),
        (ShiftKind::Ror, 0) => ArithmeticOpResult {
            // RRX: carry shifts in at the top, bit 0 falls into carry
            result: (value >> 1) | (u32::from(carry) << 31),
            carry: value.get_bit(0),
            ..Default::default()
        },
        _ => shift_by_register(kind, amount, value, carry),
    }
}

/// Barrel shift with a register-specified amount: 0 changes nothing, 32 and
/// beyond follow the ARM ARM tables.
#[must_use]
pub fn shift_by_register(
    kind: ShiftKind,
    amount: u32,
    value: u32,
    carry: bool,
) -> ArithmeticOpResult {
    let result = match (kind, amount) {
        (_, 0) => ArithmeticOpResult {
            result: value,
            carry,
            ..Default::default()
        },
        (ShiftKind::Lsl, 1..=31) => ArithmeticOpResult {
            result: value << amount,
            carry: value.get_bit((32 - amount) as u8),
            ..Default::default()
        },
        (ShiftKind::Lsl, 32) => ArithmeticOpResult {
            result: 0,
            carry: value.get_bit(0),
            ..Default::default()
        },
        (ShiftKind::Lsl, _) => ArithmeticOpResult::default(),
        (ShiftKind::Lsr, 1..=31) => ArithmeticOpResult {
            result: value >> amount,
            carry: value.get_bit((amount - 1) as u8),
            ..Default::default()
        },
        (ShiftKind::Lsr, 32) => ArithmeticOpResult {
            result: 0,
            carry: value.get_bit(31),
            ..Default::default()
        },
        (ShiftKind::Lsr, _) => ArithmeticOpResult::default(),
        (ShiftKind::Asr, 1..=31) => ArithmeticOpResult {
            result: ((value as i32) >> amount) as u32,
            carry: value.get_bit((amount - 1) as u8),
            ..Default::default()
        },
        // ASR #32 and beyond: the sign floods everything
        (ShiftKind::Asr, _) => ArithmeticOpResult {
            result: ((value as i32) >> 31) as u32,
            carry: value.get_bit(31),
            ..Default::default()
        },
        (ShiftKind::Ror, _) => {
            // ROR by n acts as ROR by n mod 32; a multiple of 32 keeps the
            // value and exposes bit 31 in carry
            let effective = amount % 32;
            if effective == 0 {
                ArithmeticOpResult {
                    result: value,
                    carry: value.get_bit(31),
                    ..Default::default()
                }
            } else {
                ArithmeticOpResult {
                    result: value.rotate_right(effective),
                    carry: value.get_bit((effective - 1) as u8),
                    ..Default::default()
                }
            }
        }
    };
    ArithmeticOpResult {
        sign: result.result.get_bit(31),
        zero: result.result == 0,
        ..result
    }
}

#[must_use]
pub fn and(first: u32, second: u32, carry: bool) -> ArithmeticOpResult {
    ArithmeticOpResult::from_logical(first & second, carry)
}

#[must_use]
pub fn eor(first: u32, second: u32, carry: bool) -> ArithmeticOpResult {
    ArithmeticOpResult::from_logical(first ^ second, carry)
}

#[must_use]
pub fn orr(first: u32, second: u32, carry: bool) -> ArithmeticOpResult {
    ArithmeticOpResult::from_logical(first | second, carry)
}

#[must_use]
pub fn add(first: u32, second: u32) -> ArithmeticOpResult {
    let result = first.wrapping_add(second);
    ArithmeticOpResult {
        result,
        carry: carried_add(first, second),
        overflow: overflowed_add(first, second, result),
        sign: result.get_bit(31),
        zero: result == 0,
    }
}

#[must_use]
pub fn sub(first: u32, second: u32) -> ArithmeticOpResult {
    let result = first.wrapping_sub(second);
    ArithmeticOpResult {
        result,
        // C after a subtraction is the complement of borrow
        carry: !borrowed_sub(first, second),
        overflow: overflowed_sub(first, second, result),
        sign: result.get_bit(31),
        zero: result == 0,
    }
}

#[must_use]
pub fn adc(first: u32, second: u32, carry_in: bool) -> ArithmeticOpResult {
    let wide = u64::from(first) + u64::from(second) + u64::from(carry_in);
    let result = wide as u32;
    ArithmeticOpResult {
        result,
        carry: wide > u64::from(u32::MAX),
        overflow: ((first ^ result) & (second ^ result)).get_bit(31),
        sign: result.get_bit(31),
        zero: result == 0,
    }
}

#[must_use]
pub fn sbc(first: u32, second: u32, carry_in: bool) -> ArithmeticOpResult {
    let borrow = u64::from(!carry_in);
    let result = first.wrapping_sub(second).wrapping_sub(!carry_in as u32);
    ArithmeticOpResult {
        result,
        carry: u64::from(first) >= u64::from(second) + borrow,
        overflow: ((first ^ second) & (first ^ result)).get_bit(31),
        sign: result.get_bit(31),
        zero: result == 0,
    }
}
