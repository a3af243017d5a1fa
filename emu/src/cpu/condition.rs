//! ARM condition codes (bits 31-28 of every ARM instruction).
//!
//! | Code | Suffix | Holds when          |
//! |------|--------|---------------------|
//! | 0x0  | EQ     | Z                   |
//! | 0x1  | NE     | !Z                  |
//! | 0x2  | CS     | C                   |
//! | 0x3  | CC     | !C                  |
//! | 0x4  | MI     | N                   |
//! | 0x5  | PL     | !N                  |
//! | 0x6  | VS     | V                   |
//! | 0x7  | VC     | !V                  |
//! | 0x8  | HI     | C && !Z             |
//! | 0x9  | LS     | !C \|\| Z           |
//! | 0xA  | GE     | N == V              |
//! | 0xB  | LT     | N != V              |
//! | 0xC  | GT     | !Z && N == V        |
//! | 0xD  | LE     | Z \|\| N != V       |
//! | 0xE  | AL     | always              |
//! | 0xF  | NV     | reserved, never     |
//!
//! `NV` opens a second opcode namespace on `ARMv5` (BLX, PLD); on this
//! `ARMv4T` core it decodes as an undefined instruction.

use serde::{Deserialize, Serialize};

#[derive(Debug, Eq, PartialEq, Copy, Clone, Serialize, Deserialize)]
pub enum Condition {
    EQ = 0x0,
    NE = 0x1,
    CS = 0x2,
    CC = 0x3,
    MI = 0x4,
    PL = 0x5,
    VS = 0x6,
    VC = 0x7,
    HI = 0x8,
    LS = 0x9,
    GE = 0xA,
    LT = 0xB,
    GT = 0xC,
    LE = 0xD,
    AL = 0xE,
    NV = 0xF,
}

impl From<u8> for Condition {
    fn from(bits: u8) -> Self {
        match bits & 0xF {
            0x0 => Self::EQ,
            0x1 => Self::NE,
            0x2 => Self::CS,
            0x3 => Self::CC,
            0x4 => Self::MI,
            0x5 => Self::PL,
            0x6 => Self::VS,
            0x7 => Self::VC,
            0x8 => Self::HI,
            0x9 => Self::LS,
            0xA => Self::GE,
            0xB => Self::LT,
            0xC => Self::GT,
            0xD => Self::LE,
            0xE => Self::AL,
            _ => Self::NV,
        }
    }
}
