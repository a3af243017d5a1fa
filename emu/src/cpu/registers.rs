//! The register file: 37 physical registers behind 16 logical names.
//!
//! Layout of the flat array:
//!
//! ```text
//! index  0..=15   R0..R15 (User/System bank)
//! index  16       CPSR
//! index  17..=23  R8_fiq..R14_fiq
//! index  24       SPSR_fiq
//! index  25..=27  R13_svc, R14_svc, SPSR_svc
//! index  28..=30  R13_abt, R14_abt, SPSR_abt
//! index  31..=33  R13_irq, R14_irq, SPSR_irq
//! index  34..=36  R13_und, R14_und, SPSR_und
//! ```
//!
//! Every access maps `(mode, logical register)` to a physical index, so a
//! mode switch copies nothing: the User bank's registers that the new mode
//! does not shadow stay visible through the same physical slots.
//!
//! R15 is the program counter. The execution core keeps it at the executing
//! instruction's address plus the prefetch offset (ARM +8, THUMB +4), which
//! is exactly the value guest software observes when it reads PC.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::cpu::cpu_modes::Mode;
use crate::cpu::psr::Psr;

pub const REG_SP: u32 = 13;
pub const REG_LR: u32 = 14;
pub const REG_PC: u32 = 15;

const CPSR_INDEX: usize = 16;
const PHYSICAL_COUNT: usize = 37;

const fn physical_index(mode: Mode, register: u32) -> usize {
    let register = register as usize;
    match (mode, register) {
        (Mode::Fiq, 8..=14) => 17 + (register - 8),
        (Mode::Supervisor, 13 | 14) => 25 + (register - 13),
        (Mode::Abort, 13 | 14) => 28 + (register - 13),
        (Mode::Irq, 13 | 14) => 31 + (register - 13),
        (Mode::Undefined, 13 | 14) => 34 + (register - 13),
        _ => register,
    }
}

const fn spsr_index(mode: Mode) -> Option<usize> {
    match mode {
        Mode::Fiq => Some(24),
        Mode::Supervisor => Some(27),
        Mode::Abort => Some(30),
        Mode::Irq => Some(33),
        Mode::Undefined => Some(36),
        Mode::User | Mode::System => None,
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct RegisterFile {
    #[serde_as(as = "[_; 37]")]
    regs: [u32; PHYSICAL_COUNT],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            regs: [0; PHYSICAL_COUNT],
        }
    }
}

impl RegisterFile {
    #[must_use]
    pub const fn read(&self, mode: Mode, register: u32) -> u32 {
        self.regs[physical_index(mode, register)]
    }

    pub const fn write(&mut self, mode: Mode, register: u32, value: u32) {
        self.regs[physical_index(mode, register)] = value;
    }

    /// Reads a register as the User bank sees it, whatever the current
    /// mode. Used by `LDM`/`STM` with the S bit.
    #[must_use]
    pub const fn read_user(&self, register: u32) -> u32 {
        self.regs[register as usize]
    }

    pub const fn write_user(&mut self, register: u32, value: u32) {
        self.regs[register as usize] = value;
    }

    #[must_use]
    pub const fn cpsr(&self) -> Psr {
        Psr::from_raw(self.regs[CPSR_INDEX])
    }

    pub const fn set_cpsr(&mut self, psr: Psr) {
        self.regs[CPSR_INDEX] = psr.raw();
    }

    /// The current mode's SPSR. User and System have none; reads fall back
    /// to the CPSR (the hardware result is unpredictable, this one is total).
    #[must_use]
    pub fn spsr(&self, mode: Mode) -> Psr {
        match spsr_index(mode) {
            Some(index) => Psr::from_raw(self.regs[index]),
            None => self.cpsr(),
        }
    }

    /// Writes the mode's SPSR; dropped in User/System, which have none.
    pub fn set_spsr(&mut self, mode: Mode, psr: Psr) {
        match spsr_index(mode) {
            Some(index) => self.regs[index] = psr.raw(),
            None => tracing::debug!("dropped SPSR write in {mode:?} mode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mapping_is_identity_for_user_and_system() {
        for register in 0..16 {
            assert_eq!(physical_index(Mode::User, register), register as usize);
            assert_eq!(physical_index(Mode::System, register), register as usize);
        }
    }

    #[test]
    fn fiq_shadows_r8_to_r14() {
        let mut file = RegisterFile::default();
        for register in 0..16 {
            file.write(Mode::User, register, 100 + register);
        }

        // the FIQ bank starts zeroed; User values are shadowed, not lost
        for register in 8..=14 {
            assert_eq!(file.read(Mode::Fiq, register), 0);
            file.write(Mode::Fiq, register, 200 + register);
        }

        // unshadowed registers are shared
        assert_eq!(file.read(Mode::Fiq, 3), 103);
        assert_eq!(file.read(Mode::Fiq, 15), 115);

        // switching back exposes the untouched User bank, R8-R12 included
        for register in 0..16 {
            assert_eq!(file.read(Mode::User, register), 100 + register);
        }
    }

    #[test]
    fn exception_modes_shadow_sp_and_lr_only() {
        let mut file = RegisterFile::default();
        file.write(Mode::User, REG_SP, 0x0300_7F00);
        file.write(Mode::User, REG_LR, 0x0800_1234);
        file.write(Mode::User, 12, 0xDEAD);

        file.write(Mode::Irq, REG_SP, 0x0300_7FA0);
        file.write(Mode::Supervisor, REG_SP, 0x0300_7FE0);

        assert_eq!(file.read(Mode::User, REG_SP), 0x0300_7F00);
        assert_eq!(file.read(Mode::Irq, REG_SP), 0x0300_7FA0);
        assert_eq!(file.read(Mode::Supervisor, REG_SP), 0x0300_7FE0);
        // R12 is not banked outside FIQ
        assert_eq!(file.read(Mode::Irq, 12), 0xDEAD);
        assert_eq!(file.read(Mode::Irq, REG_LR), 0);
    }

    #[test]
    fn spsr_slots_are_per_mode() {
        let mut file = RegisterFile::default();
        file.set_spsr(Mode::Irq, Psr::from_raw(0x1234_5678));
        file.set_spsr(Mode::Fiq, Psr::from_raw(0x9ABC_DEF0));

        assert_eq!(file.spsr(Mode::Irq).raw(), 0x1234_5678);
        assert_eq!(file.spsr(Mode::Fiq).raw(), 0x9ABC_DEF0);
        assert_eq!(file.spsr(Mode::Supervisor).raw(), 0);
    }

    #[test]
    fn user_mode_spsr_reads_fall_back_to_cpsr() {
        let mut file = RegisterFile::default();
        file.set_cpsr(Psr::from_raw(0x6000_001F));
        assert_eq!(file.spsr(Mode::System).raw(), 0x6000_001F);

        // and writes are dropped
        file.set_spsr(Mode::System, Psr::from_raw(0xFFFF_FFFF));
        assert_eq!(file.cpsr().raw(), 0x6000_001F);
    }

    #[test]
    fn user_bank_access_ignores_current_mode() {
        let mut file = RegisterFile::default();
        file.write(Mode::User, REG_SP, 0x1111);
        file.write(Mode::Irq, REG_SP, 0x2222);

        assert_eq!(file.read_user(REG_SP), 0x1111);
        file.write_user(REG_SP, 0x3333);
        assert_eq!(file.read(Mode::User, REG_SP), 0x3333);
        assert_eq!(file.read(Mode::Irq, REG_SP), 0x2222);
    }
}
