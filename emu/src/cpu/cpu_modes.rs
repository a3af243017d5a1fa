//! ARM7TDMI operating modes (CPSR bits 4-0).

use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Mode {
    /// The normal program execution state.
    User = 0b10000,

    /// Fast interrupt; banks R8-R14 for low-latency handlers.
    Fiq = 0b10001,

    /// General-purpose interrupt handling.
    Irq = 0b10010,

    /// Protected mode, entered by SWI and reset.
    Supervisor = 0b10011,

    /// Entered after a data or instruction prefetch abort.
    Abort = 0b10111,

    /// Entered when an undefined instruction is executed.
    Undefined = 0b11011,

    /// Privileged mode sharing the User register bank.
    System = 0b11111,
}

impl From<Mode> for u32 {
    fn from(mode: Mode) -> Self {
        mode as Self
    }
}

impl TryFrom<u32> for Mode {
    type Error = u32;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits & 0b11111 {
            0b10000 => Ok(Self::User),
            0b10001 => Ok(Self::Fiq),
            0b10010 => Ok(Self::Irq),
            0b10011 => Ok(Self::Supervisor),
            0b10111 => Ok(Self::Abort),
            0b11011 => Ok(Self::Undefined),
            0b11111 => Ok(Self::System),
            invalid => Err(invalid),
        }
    }
}
