//! The ARM7TDMI execution core.
//!
//! # Program counter model
//!
//! The 3-stage pipeline is modeled by its only observable effect: R15 always
//! holds the executing instruction's address plus the prefetch offset (+8 in
//! ARM state, +4 in THUMB). Each step fetches at `R15 - offset`, executes,
//! and advances R15 by the instruction size unless the handler branched.
//! [`Arm7tdmi::branch_to`] re-establishes the invariant at the target and
//! doubles as the pipeline flush.
//!
//! # Exceptions
//!
//! | Exception | Vector | Mode       |
//! |-----------|--------|------------|
//! | Reset     | `0x00` | Supervisor |
//! | Undefined | `0x04` | Undefined  |
//! | SWI       | `0x08` | Supervisor |
//! | IRQ       | `0x18` | IRQ        |
//!
//! Entry saves CPSR into the target mode's SPSR, banks in its R13/R14 (by
//! remapping, not copying), masks IRQs, drops to ARM state, and jumps to the
//! vector. `MOVS PC, LR` and `LDM ..^` restore CPSR from SPSR on the way
//! out. Prefetch/data aborts never fire: the bus makes every access total.
//!
//! # Cycle accounting
//!
//! Costs are per instruction class (data processing 1, loads 3, stores 2,
//! taken branches 3, multiplies 4+, block transfers n+2), not per bus wait
//! state. The scheduler only needs a monotonic simulated clock with
//! plausible ratios.

use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::cpu::arm::ArmInstruction;
use crate::cpu::condition::Condition;
use crate::cpu::cpu_modes::Mode;
use crate::cpu::psr::{CpuState, Psr};
use crate::cpu::registers::{REG_LR, REG_PC, RegisterFile};
use crate::cpu::thumb::ThumbInstruction;

#[derive(Serialize, Deserialize)]
pub struct Arm7tdmi {
    pub bus: Bus,
    pub registers: RegisterFile,
    /// Set by `branch_to`; suppresses the post-execute PC advance.
    branched: bool,
}

#[derive(Copy, Clone, Debug)]
pub(crate) enum Exception {
    Undefined,
    SoftwareInterrupt,
    Irq,
}

impl Exception {
    const fn vector(self) -> u32 {
        match self {
            Self::Undefined => 0x04,
            Self::SoftwareInterrupt => 0x08,
            Self::Irq => 0x18,
        }
    }

    const fn mode(self) -> Mode {
        match self {
            Self::Undefined => Mode::Undefined,
            Self::SoftwareInterrupt => Mode::Supervisor,
            Self::Irq => Mode::Irq,
        }
    }

    /// The value for the target mode's LR, from the executing instruction's
    /// address. IRQ biases by 4 in both states so the handler's
    /// `SUBS PC, LR, #4` re-executes the interrupted instruction.
    const fn return_address(self, state: CpuState, executing: u32) -> u32 {
        match (self, state) {
            (Self::Irq, _) | (Self::Undefined | Self::SoftwareInterrupt, CpuState::Arm) => {
                executing.wrapping_add(4)
            }
            (Self::Undefined | Self::SoftwareInterrupt, CpuState::Thumb) => {
                executing.wrapping_add(2)
            }
        }
    }
}

impl Arm7tdmi {
    #[must_use]
    pub fn new(bus: Bus) -> Self {
        let mut cpu = Self {
            bus,
            registers: RegisterFile::default(),
            branched: false,
        };
        cpu.reset();
        cpu
    }

    /// Hardware reset: Supervisor mode, ARM state, interrupts masked,
    /// execution from the reset vector.
    pub fn reset(&mut self) {
        let mut cpsr = Psr::from(Mode::Supervisor);
        cpsr.set_irq_disable(true);
        cpsr.set_fiq_disable(true);
        self.registers.set_cpsr(cpsr);
        self.branch_to(0x0000_0000);
    }

    /// Puts the machine in the state the BIOS leaves it in before jumping to
    /// the cartridge, for running without a BIOS image.
    pub fn boot_from_gamepak(&mut self) {
        self.registers.write(Mode::User, 13, 0x0300_7F00);
        self.registers.write(Mode::Irq, 13, 0x0300_7FA0);
        self.registers.write(Mode::Supervisor, 13, 0x0300_7FE0);
        let mut cpsr = Psr::from(Mode::System);
        cpsr.set_irq_disable(false);
        cpsr.set_fiq_disable(false);
        self.registers.set_cpsr(cpsr);
        self.branch_to(0x0800_0000);
    }

    #[must_use]
    pub fn cpsr(&self) -> Psr {
        self.registers.cpsr()
    }

    pub(crate) fn set_cpsr(&mut self, psr: Psr) {
        self.registers.set_cpsr(psr);
    }

    #[must_use]
    pub(crate) fn mode(&self) -> Mode {
        self.cpsr().mode()
    }

    const fn prefetch_offset(state: CpuState) -> u32 {
        match state {
            CpuState::Arm => 8,
            CpuState::Thumb => 4,
        }
    }

    /// The address of the instruction the next `step` will execute.
    #[must_use]
    pub fn execution_address(&self) -> u32 {
        let state = self.cpsr().cpu_state();
        self.registers
            .read(self.mode(), REG_PC)
            .wrapping_sub(Self::prefetch_offset(state))
    }

    /// Raw R15: the execution address plus the pipeline offset, which is
    /// what guest reads of PC observe.
    #[must_use]
    pub fn program_counter(&self) -> u32 {
        self.registers.read(self.mode(), REG_PC)
    }

    #[must_use]
    pub(crate) fn reg(&self, register: u32) -> u32 {
        self.registers.read(self.mode(), register)
    }

    /// Register write; R15 becomes a branch.
    pub(crate) fn set_reg(&mut self, register: u32, value: u32) {
        if register == REG_PC {
            self.branch_to(value);
        } else {
            self.registers.write(self.mode(), register, value);
        }
    }

    /// Branches to `target`, aligning it for the current state and
    /// re-establishing the R15 pipeline invariant (the flush).
    pub(crate) fn branch_to(&mut self, target: u32) {
        let state = self.cpsr().cpu_state();
        let aligned = match state {
            CpuState::Arm => target & !3,
            CpuState::Thumb => target & !1,
        };
        let mode = self.mode();
        self.registers
            .write(mode, REG_PC, aligned.wrapping_add(Self::prefetch_offset(state)));
        self.branched = true;
    }

    pub(crate) fn handle_exception(&mut self, exception: Exception) {
        let old_cpsr = self.cpsr();
        let return_address =
            exception.return_address(old_cpsr.cpu_state(), self.execution_address());
        let target_mode = exception.mode();

        let mut cpsr = old_cpsr;
        cpsr.set_mode(target_mode);
        cpsr.set_cpu_state(CpuState::Arm);
        cpsr.set_irq_disable(true);
        self.set_cpsr(cpsr);

        self.registers.set_spsr(target_mode, old_cpsr);
        self.registers.write(target_mode, REG_LR, return_address);
        self.branch_to(exception.vector());
    }

    /// Takes the IRQ vector. The scheduler calls this when the interrupt
    /// controller reports a pending line and CPSR.I is clear.
    pub fn raise_irq(&mut self) {
        self.handle_exception(Exception::Irq);
    }

    #[must_use]
    pub fn irq_ready(&self) -> bool {
        !self.cpsr().irq_disable()
    }

    /// Executes one instruction; returns the cycles it consumed.
    pub fn step(&mut self) -> u32 {
        self.branched = false;
        match self.cpsr().cpu_state() {
            CpuState::Arm => self.step_arm(),
            CpuState::Thumb => self.step_thumb(),
        }
    }

    fn step_arm(&mut self) -> u32 {
        let executing = self.program_counter().wrapping_sub(8) & !3;
        self.bus.set_current_pc(executing);
        let opcode = self.bus.read_word(executing);
        self.bus.record_prefetch(executing, opcode);

        let condition = Condition::from((opcode >> 28) as u8);
        let cycles = if condition == Condition::NV {
            // the 0xF space is ARMv5 territory (BLX/PLD); this core is v4T
            tracing::debug!("cond=NV opcode {opcode:#010X} at {executing:#010X}");
            self.handle_exception(Exception::Undefined);
            3
        } else if self.cpsr().check_condition(condition) {
            let instruction = ArmInstruction::from(opcode);
            self.execute_arm(instruction)
        } else {
            1
        };

        if !self.branched {
            let mode = self.mode();
            let pc = self.registers.read(mode, REG_PC);
            self.registers.write(mode, REG_PC, pc.wrapping_add(4));
        }
        cycles
    }

    fn step_thumb(&mut self) -> u32 {
        let executing = self.program_counter().wrapping_sub(4) & !1;
        self.bus.set_current_pc(executing);
        let opcode = self.bus.read_half_word(executing);
        self.bus
            .record_prefetch(executing, u32::from(opcode) | (u32::from(opcode) << 16));

        let instruction = ThumbInstruction::from(opcode);
        let cycles = self.execute_thumb(instruction);

        if !self.branched {
            let mode = self.mode();
            let pc = self.registers.read(mode, REG_PC);
            self.registers.write(mode, REG_PC, pc.wrapping_add(2));
        }
        cycles
    }

    // -------------------------------------------------------------------
    // Memory access helpers shared by both instruction sets
    // -------------------------------------------------------------------

    /// `LDR`: the bus rotates unaligned words into place.
    pub(crate) fn load_word(&mut self, address: u32) -> u32 {
        self.bus.read_word(address)
    }

    /// `LDRH`: an odd address rotates the halfword right by 8 within the
    /// destination register.
    pub(crate) fn load_half_word(&mut self, address: u32) -> u32 {
        let value = u32::from(self.bus.read_half_word(address & !1));
        value.rotate_right((address & 1) * 8)
    }

    /// `LDRSH`: an odd address degrades to a sign-extended byte load.
    pub(crate) fn load_signed_half_word(&mut self, address: u32) -> u32 {
        if address & 1 == 0 {
            crate::bitwise::sign_extend(u32::from(self.bus.read_half_word(address)), 16)
        } else {
            self.load_signed_byte(address)
        }
    }

    pub(crate) fn load_signed_byte(&mut self, address: u32) -> u32 {
        crate::bitwise::sign_extend(u32::from(self.bus.read_byte(address)), 8)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cartridge::GamePak;
    use crate::cartridge::header::tests::rom_with_header;
    use pretty_assertions::assert_eq;

    /// A CPU over a ROM whose payload starts at `0x0800_00C0`.
    pub(crate) fn cpu_with_program(words: &[u32]) -> Arm7tdmi {
        let mut rom = rom_with_header("CPUTEST");
        rom.resize(0xC0 + words.len() * 4 + 0x40, 0);
        for (i, word) in words.iter().enumerate() {
            rom[0xC0 + i * 4..0xC0 + i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        let bus = Bus::new(&[0; 0x4000], GamePak::new(&rom).unwrap());
        let mut cpu = Arm7tdmi::new(bus);
        cpu.boot_from_gamepak();
        cpu.branch_to(0x0800_00C0);
        cpu
    }

    #[test]
    fn reset_enters_supervisor_arm_at_the_vector() {
        let rom = rom_with_header("CPUTEST");
        let bus = Bus::new(&[0; 0x4000], GamePak::new(&rom).unwrap());
        let cpu = Arm7tdmi::new(bus);

        assert_eq!(cpu.mode(), Mode::Supervisor);
        assert_eq!(cpu.cpsr().cpu_state(), CpuState::Arm);
        assert!(cpu.cpsr().irq_disable());
        assert!(cpu.cpsr().fiq_disable());
        assert_eq!(cpu.execution_address(), 0);
        assert_eq!(cpu.program_counter(), 8, "R15 runs two instructions ahead");
    }

    #[test]
    fn swi_banks_lr_and_spsr_and_masks_irqs() {
        // MOV R0, #1 ; SWI 0
        let mut cpu = cpu_with_program(&[0xE3A0_0001, 0xEF00_0000]);
        cpu.step();
        let cpsr_before = cpu.cpsr();
        cpu.step();

        assert_eq!(cpu.mode(), Mode::Supervisor);
        assert_eq!(cpu.execution_address(), 0x08);
        assert!(cpu.cpsr().irq_disable());
        assert_eq!(cpu.registers.read(Mode::Supervisor, REG_LR), 0x0800_00C8);
        assert_eq!(cpu.registers.spsr(Mode::Supervisor), cpsr_before);
        // the User-bank LR is untouched
        assert_eq!(cpu.registers.read(Mode::User, REG_LR), 0);
    }

    #[test]
    fn irq_return_address_biases_by_four() {
        let mut cpu = cpu_with_program(&[0xE3A0_0001]);
        let executing = cpu.execution_address();
        cpu.raise_irq();

        assert_eq!(cpu.mode(), Mode::Irq);
        assert_eq!(cpu.execution_address(), 0x18);
        assert_eq!(
            cpu.registers.read(Mode::Irq, REG_LR),
            executing.wrapping_add(4)
        );
    }

    #[test]
    fn condition_failing_instruction_is_a_one_cycle_skip() {
        // MOVEQ R0, #5 with Z clear
        let mut cpu = cpu_with_program(&[0x03A0_0005]);
        let cycles = cpu.step();

        assert_eq!(cycles, 1);
        assert_eq!(cpu.reg(0), 0);
        assert_eq!(cpu.execution_address(), 0x0800_00C4);
    }

    #[test]
    fn nv_condition_raises_undefined() {
        let mut cpu = cpu_with_program(&[0xF3A0_0005]);
        cpu.step();

        assert_eq!(cpu.mode(), Mode::Undefined);
        assert_eq!(cpu.execution_address(), 0x04);
    }

    #[test]
    fn ldrh_rotates_on_odd_address() {
        let mut cpu = cpu_with_program(&[]);
        cpu.bus.write_half_word(0x0300_0000, 0xABCD);

        assert_eq!(cpu.load_half_word(0x0300_0000), 0xABCD);
        assert_eq!(
            cpu.load_half_word(0x0300_0001),
            0x0000_ABCDu32.rotate_right(8)
        );
    }

    #[test]
    fn ldrsh_on_odd_address_degrades_to_signed_byte() {
        let mut cpu = cpu_with_program(&[]);
        cpu.bus.write_half_word(0x0300_0000, 0x80FF);

        assert_eq!(cpu.load_signed_half_word(0x0300_0000), 0xFFFF_80FF);
        assert_eq!(cpu.load_signed_half_word(0x0300_0001), 0xFFFF_FF80);
    }
}
