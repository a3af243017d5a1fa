//! Program status registers (CPSR/SPSR).
//!
//! ```text
//! 31 30 29 28 27 26      8 7 6 5 4   0
//! ┌──┬──┬──┬──┬──┬────────┬─┬─┬─┬─────┐
//! │N │Z │C │V │Q │Reserved│I│F│T│Mode │
//! └──┴──┴──┴──┴──┴────────┴─┴─┴─┴─────┘
//! ```
//!
//! `Psr` is a transparent wrapper over the raw word stored in the register
//! file; both the CPSR and every banked SPSR use it.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::cpu::condition::Condition;
use crate::cpu::cpu_modes::Mode;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Psr(u32);

impl Psr {
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Evaluates an ARM condition against the N/Z/C/V flags.
    #[must_use]
    pub fn check_condition(self, condition: Condition) -> bool {
        use Condition::{AL, CC, CS, EQ, GE, GT, HI, LE, LS, LT, MI, NE, NV, PL, VC, VS};
        match condition {
            EQ => self.zero_flag(),
            NE => !self.zero_flag(),
            CS => self.carry_flag(),
            CC => !self.carry_flag(),
            MI => self.sign_flag(),
            PL => !self.sign_flag(),
            VS => self.overflow_flag(),
            VC => !self.overflow_flag(),
            HI => self.carry_flag() && !self.zero_flag(),
            LS => !self.carry_flag() || self.zero_flag(),
            GE => self.sign_flag() == self.overflow_flag(),
            LT => self.sign_flag() != self.overflow_flag(),
            GT => !self.zero_flag() && (self.sign_flag() == self.overflow_flag()),
            LE => self.zero_flag() || (self.sign_flag() != self.overflow_flag()),
            AL => true,
            NV => false,
        }
    }

    /// N, bit 31.
    #[must_use]
    pub fn sign_flag(self) -> bool {
        self.0.get_bit(31)
    }

    /// Z, bit 30.
    #[must_use]
    pub fn zero_flag(self) -> bool {
        self.0.get_bit(30)
    }

    /// C, bit 29. After a subtraction this is the complement of borrow.
    #[must_use]
    pub fn carry_flag(self) -> bool {
        self.0.get_bit(29)
    }

    /// V, bit 28.
    #[must_use]
    pub fn overflow_flag(self) -> bool {
        self.0.get_bit(28)
    }

    /// I, bit 7 (1 = IRQs disabled).
    #[must_use]
    pub fn irq_disable(self) -> bool {
        self.0.get_bit(7)
    }

    /// F, bit 6 (1 = FIQs disabled).
    #[must_use]
    pub fn fiq_disable(self) -> bool {
        self.0.get_bit(6)
    }

    /// T, bit 5 (0 = ARM, 1 = THUMB).
    #[must_use]
    pub fn state_bit(self) -> bool {
        self.0.get_bit(5)
    }

    #[must_use]
    pub fn cpu_state(self) -> CpuState {
        if self.state_bit() { CpuState::Thumb } else { CpuState::Arm }
    }

    /// M4-M0. The BIOS occasionally leaves invalid mode bits in an SPSR;
    /// those fall back to Supervisor rather than aborting the host.
    #[must_use]
    pub fn mode(self) -> Mode {
        Mode::try_from(self.0).unwrap_or_else(|bits| {
            tracing::debug!("invalid mode bits {bits:#07b} in PSR {:#010X}", self.0);
            Mode::Supervisor
        })
    }

    pub fn set_sign_flag(&mut self, value: bool) {
        self.0.set_bit(31, value);
    }

    pub fn set_zero_flag(&mut self, value: bool) {
        self.0.set_bit(30, value);
    }

    pub fn set_carry_flag(&mut self, value: bool) {
        self.0.set_bit(29, value);
    }

    pub fn set_overflow_flag(&mut self, value: bool) {
        self.0.set_bit(28, value);
    }

    pub fn set_irq_disable(&mut self, value: bool) {
        self.0.set_bit(7, value);
    }

    pub fn set_fiq_disable(&mut self, value: bool) {
        self.0.set_bit(6, value);
    }

    pub fn set_cpu_state(&mut self, state: CpuState) {
        self.0.set_bit(5, matches!(state, CpuState::Thumb));
    }

    pub const fn set_mode(&mut self, mode: Mode) {
        self.0 = (self.0 & !0b11111) | mode as u32;
    }
}

impl From<Mode> for Psr {
    fn from(mode: Mode) -> Self {
        Self(mode as u32)
    }
}

/// The instruction-set state selected by the T bit.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CpuState {
    Arm,
    Thumb,
}
