//! ARM (32-bit) instruction decoding and execution.
//!
//! Decoding is a pattern match ordered by how many bits each format pins
//! down, so overlapping encodings resolve the way the ARM ARM intends:
//! BX, then SWP, the multiplies, halfword transfers, SWI, the coprocessor
//! space (which this core traps as undefined), block transfers, branches,
//! single data transfers, PSR transfers, and finally data processing.
//!
//! The condition field is evaluated by the step loop before decode; handlers
//! here never see a failed condition.

use serde::{Deserialize, Serialize};

use crate::bitwise::{Bits, sign_extend};
use crate::cpu::alu::{self, ArithmeticOpResult, ShiftKind};
use crate::cpu::arm7tdmi::{Arm7tdmi, Exception};
use crate::cpu::cpu_modes::Mode;
use crate::cpu::psr::{CpuState, Psr};
use crate::cpu::registers::REG_PC;

/// The 16 data-processing operations, bits 24-21.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum AluOpcode {
    And = 0x0,
    Eor = 0x1,
    Sub = 0x2,
    Rsb = 0x3,
    Add = 0x4,
    Adc = 0x5,
    Sbc = 0x6,
    Rsc = 0x7,
    Tst = 0x8,
    Teq = 0x9,
    Cmp = 0xA,
    Cmn = 0xB,
    Orr = 0xC,
    Mov = 0xD,
    Bic = 0xE,
    Mvn = 0xF,
}

impl AluOpcode {
    /// Test operations set flags but never write a destination.
    #[must_use]
    pub const fn is_test(self) -> bool {
        matches!(self, Self::Tst | Self::Teq | Self::Cmp | Self::Cmn)
    }

    /// Arithmetic operations take C and V from the ALU; logical ones take C
    /// from the barrel shifter and leave V alone.
    #[must_use]
    pub const fn is_arithmetic(self) -> bool {
        matches!(
            self,
            Self::Sub
                | Self::Rsb
                | Self::Add
                | Self::Adc
                | Self::Sbc
                | Self::Rsc
                | Self::Cmp
                | Self::Cmn
        )
    }
}

impl From<u32> for AluOpcode {
    fn from(bits: u32) -> Self {
        match bits & 0xF {
            0x0 => Self::And,
            0x1 => Self::Eor,
            0x2 => Self::Sub,
            0x3 => Self::Rsb,
            0x4 => Self::Add,
            0x5 => Self::Adc,
            0x6 => Self::Sbc,
            0x7 => Self::Rsc,
            0x8 => Self::Tst,
            0x9 => Self::Teq,
            0xA => Self::Cmp,
            0xB => Self::Cmn,
            0xC => Self::Orr,
            0xD => Self::Mov,
            0xE => Self::Bic,
            _ => Self::Mvn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShiftAmount {
    Immediate(u32),
    Register(u32),
}

/// The flexible second operand of data-processing and MSR instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecondOperand {
    /// An 8-bit immediate rotated right by an even amount.
    Immediate { value: u32, rotate: u32 },
    /// A register fed through the barrel shifter.
    Register {
        rm: u32,
        shift_kind: ShiftKind,
        amount: ShiftAmount,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HalfwordOffset {
    Immediate(u32),
    Register(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOffset {
    Immediate(u32),
    Register {
        rm: u32,
        shift_kind: ShiftKind,
        amount: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArmInstruction {
    DataProcessing {
        opcode: AluOpcode,
        set_flags: bool,
        rn: u32,
        rd: u32,
        operand2: SecondOperand,
    },
    Mrs {
        rd: u32,
        use_spsr: bool,
    },
    Msr {
        use_spsr: bool,
        field_mask: u32,
        operand: SecondOperand,
    },
    Multiply {
        accumulate: bool,
        set_flags: bool,
        rd: u32,
        rn: u32,
        rs: u32,
        rm: u32,
    },
    MultiplyLong {
        signed: bool,
        accumulate: bool,
        set_flags: bool,
        rd_hi: u32,
        rd_lo: u32,
        rs: u32,
        rm: u32,
    },
    SingleDataSwap {
        byte: bool,
        rn: u32,
        rd: u32,
        rm: u32,
    },
    BranchAndExchange {
        rm: u32,
    },
    HalfwordTransfer {
        load: bool,
        signed: bool,
        halfword: bool,
        pre_index: bool,
        up: bool,
        write_back: bool,
        rn: u32,
        rd: u32,
        offset: HalfwordOffset,
    },
    SingleDataTransfer {
        load: bool,
        byte: bool,
        pre_index: bool,
        up: bool,
        write_back: bool,
        rn: u32,
        rd: u32,
        offset: TransferOffset,
    },
    BlockDataTransfer {
        load: bool,
        pre_index: bool,
        up: bool,
        psr_user_bank: bool,
        write_back: bool,
        rn: u32,
        register_list: u16,
    },
    Branch {
        link: bool,
        offset: u32,
    },
    SoftwareInterrupt,
    Undefined,
}

impl From<u32> for ArmInstruction {
    #[allow(clippy::too_many_lines)]
    fn from(op: u32) -> Self {
        if op.get_bits(4..=27) == 0b0001_0010_1111_1111_1111_0001 {
            Self::BranchAndExchange {
                rm: op.get_bits(0..=3),
            }
        } else if op.get_bits(23..=27) == 0b00010
            && op.get_bits(20..=21) == 0b00
            && op.get_bits(4..=11) == 0b0000_1001
        {
            Self::SingleDataSwap {
                byte: op.get_bit(22),
                rn: op.get_bits(16..=19),
                rd: op.get_bits(12..=15),
                rm: op.get_bits(0..=3),
            }
        } else if op.get_bits(23..=27) == 0b00001 && op.get_bits(4..=7) == 0b1001 {
            Self::MultiplyLong {
                signed: op.get_bit(22),
                accumulate: op.get_bit(21),
                set_flags: op.get_bit(20),
                rd_hi: op.get_bits(16..=19),
                rd_lo: op.get_bits(12..=15),
                rs: op.get_bits(8..=11),
                rm: op.get_bits(0..=3),
            }
        } else if op.get_bits(22..=27) == 0 && op.get_bits(4..=7) == 0b1001 {
            Self::Multiply {
                accumulate: op.get_bit(21),
                set_flags: op.get_bit(20),
                rd: op.get_bits(16..=19),
                rn: op.get_bits(12..=15),
                rs: op.get_bits(8..=11),
                rm: op.get_bits(0..=3),
            }
        } else if op.get_bits(25..=27) == 0 && op.get_bit(7) && op.get_bit(4) {
            // halfword and signed transfers; SH = 00 belongs to the multiply
            // and swap space already matched above
            let sh = op.get_bits(5..=6);
            if sh == 0 {
                return Self::Undefined;
            }
            Self::HalfwordTransfer {
                load: op.get_bit(20),
                signed: sh & 0b10 != 0,
                halfword: sh & 0b01 != 0,
                pre_index: op.get_bit(24),
                up: op.get_bit(23),
                write_back: op.get_bit(21),
                rn: op.get_bits(16..=19),
                rd: op.get_bits(12..=15),
                offset: if op.get_bit(22) {
                    HalfwordOffset::Immediate((op.get_bits(8..=11) << 4) | op.get_bits(0..=3))
                } else {
                    HalfwordOffset::Register(op.get_bits(0..=3))
                },
            }
        } else if op.get_bits(25..=27) == 0b011 && op.get_bit(4) {
            Self::Undefined
        } else if op.get_bits(24..=27) == 0b1111 {
            Self::SoftwareInterrupt
        } else if op.get_bits(25..=27) == 0b110 || op.get_bits(24..=27) == 0b1110 {
            // no coprocessor on the GBA: CDP/LDC/STC/MCR/MRC all trap
            Self::Undefined
        } else if op.get_bits(25..=27) == 0b100 {
            Self::BlockDataTransfer {
                load: op.get_bit(20),
                pre_index: op.get_bit(24),
                up: op.get_bit(23),
                psr_user_bank: op.get_bit(22),
                write_back: op.get_bit(21),
                rn: op.get_bits(16..=19),
                register_list: op.get_bits(0..=15) as u16,
            }
        } else if op.get_bits(25..=27) == 0b101 {
            Self::Branch {
                link: op.get_bit(24),
                offset: op.get_bits(0..=23) << 2,
            }
        } else if op.get_bits(26..=27) == 0b01 {
            Self::SingleDataTransfer {
                load: op.get_bit(20),
                byte: op.get_bit(22),
                pre_index: op.get_bit(24),
                up: op.get_bit(23),
                write_back: op.get_bit(21),
                rn: op.get_bits(16..=19),
                rd: op.get_bits(12..=15),
                offset: if op.get_bit(25) {
                    TransferOffset::Register {
                        rm: op.get_bits(0..=3),
                        shift_kind: ShiftKind::from(op.get_bits(5..=6)),
                        amount: op.get_bits(7..=11),
                    }
                } else {
                    TransferOffset::Immediate(op.get_bits(0..=11))
                },
            }
        } else {
            let opcode = AluOpcode::from(op.get_bits(21..=24));
            let set_flags = op.get_bit(20);

            // a test opcode without S is the PSR-transfer space
            if opcode.is_test() && !set_flags {
                if op.get_bits(23..=24) == 0b10
                    && op.get_bits(16..=21) == 0b00_1111
                    && op.get_bits(0..=11) == 0
                {
                    return Self::Mrs {
                        rd: op.get_bits(12..=15),
                        use_spsr: op.get_bit(22),
                    };
                }
                if op.get_bits(23..=24) == 0b10
                    && op.get_bits(20..=21) == 0b10
                    && op.get_bits(12..=15) == 0b1111
                {
                    return Self::Msr {
                        use_spsr: op.get_bit(22),
                        field_mask: op.get_bits(16..=19),
                        operand: if op.get_bit(25) {
                            SecondOperand::Immediate {
                                value: op.get_bits(0..=7),
                                rotate: op.get_bits(8..=11) * 2,
                            }
                        } else {
                            SecondOperand::Register {
                                rm: op.get_bits(0..=3),
                                shift_kind: ShiftKind::Lsl,
                                amount: ShiftAmount::Immediate(0),
                            }
                        },
                    };
                }
                // a stray test-without-S executes as a flagless no-op below
            }

            Self::DataProcessing {
                opcode,
                set_flags,
                rn: op.get_bits(16..=19),
                rd: op.get_bits(12..=15),
                operand2: if op.get_bit(25) {
                    SecondOperand::Immediate {
                        value: op.get_bits(0..=7),
                        rotate: op.get_bits(8..=11) * 2,
                    }
                } else {
                    SecondOperand::Register {
                        rm: op.get_bits(0..=3),
                        shift_kind: ShiftKind::from(op.get_bits(5..=6)),
                        amount: if op.get_bit(4) {
                            ShiftAmount::Register(op.get_bits(8..=11))
                        } else {
                            ShiftAmount::Immediate(op.get_bits(7..=11))
                        },
                    }
                },
            }
        }
    }
}

impl Arm7tdmi {
    pub(crate) fn execute_arm(&mut self, instruction: ArmInstruction) -> u32 {
        match instruction {
            ArmInstruction::DataProcessing {
                opcode,
                set_flags,
                rn,
                rd,
                operand2,
            } => self.data_processing(opcode, set_flags, rn, rd, operand2),
            ArmInstruction::Mrs { rd, use_spsr } => {
                let psr = if use_spsr {
                    self.registers.spsr(self.mode())
                } else {
                    self.cpsr()
                };
                self.set_reg(rd, psr.raw());
                1
            }
            ArmInstruction::Msr {
                use_spsr,
                field_mask,
                operand,
            } => self.psr_transfer_write(use_spsr, field_mask, operand),
            ArmInstruction::Multiply {
                accumulate,
                set_flags,
                rd,
                rn,
                rs,
                rm,
            } => self.multiply(accumulate, set_flags, rd, rn, rs, rm),
            ArmInstruction::MultiplyLong {
                signed,
                accumulate,
                set_flags,
                rd_hi,
                rd_lo,
                rs,
                rm,
            } => self.multiply_long(signed, accumulate, set_flags, rd_hi, rd_lo, rs, rm),
            ArmInstruction::SingleDataSwap { byte, rn, rd, rm } => {
                let address = self.reg(rn);
                let source = self.reg(rm);
                let old = if byte {
                    let old = u32::from(self.bus.read_byte(address));
                    self.bus.write_byte(address, source as u8);
                    old
                } else {
                    let old = self.load_word(address);
                    self.bus.write_word(address & !3, source);
                    old
                };
                self.set_reg(rd, old);
                4
            }
            ArmInstruction::BranchAndExchange { rm } => {
                let target = self.reg(rm);
                let mut cpsr = self.cpsr();
                cpsr.set_cpu_state(if target.get_bit(0) {
                    CpuState::Thumb
                } else {
                    CpuState::Arm
                });
                self.set_cpsr(cpsr);
                self.branch_to(target);
                3
            }
            ArmInstruction::HalfwordTransfer {
                load,
                signed,
                halfword,
                pre_index,
                up,
                write_back,
                rn,
                rd,
                offset,
            } => self.halfword_transfer(
                load, signed, halfword, pre_index, up, write_back, rn, rd, offset,
            ),
            ArmInstruction::SingleDataTransfer {
                load,
                byte,
                pre_index,
                up,
                write_back,
                rn,
                rd,
                offset,
            } => self.single_data_transfer(load, byte, pre_index, up, write_back, rn, rd, offset),
            ArmInstruction::BlockDataTransfer {
                load,
                pre_index,
                up,
                psr_user_bank,
                write_back,
                rn,
                register_list,
            } => self.block_data_transfer(
                load,
                pre_index,
                up,
                psr_user_bank,
                write_back,
                rn,
                register_list,
            ),
            ArmInstruction::Branch { link, offset } => {
                let pc = self.reg(REG_PC);
                if link {
                    self.set_reg(14, pc.wrapping_sub(4));
                }
                self.branch_to(pc.wrapping_add(sign_extend(offset, 26)));
                3
            }
            ArmInstruction::SoftwareInterrupt => {
                self.handle_exception(Exception::SoftwareInterrupt);
                3
            }
            ArmInstruction::Undefined => {
                tracing::debug!(
                    "undefined ARM instruction at {:#010X}",
                    self.execution_address()
                );
                self.handle_exception(Exception::Undefined);
                3
            }
        }
    }

    /// Evaluates a flexible second operand, yielding the value and the
    /// barrel shifter's carry-out.
    fn second_operand(&self, operand: SecondOperand) -> (u32, bool) {
        let carry = self.cpsr().carry_flag();
        match operand {
            SecondOperand::Immediate { value, rotate } => {
                if rotate == 0 {
                    (value, carry)
                } else {
                    let rotated = value.rotate_right(rotate);
                    (rotated, rotated.get_bit(31))
                }
            }
            SecondOperand::Register {
                rm,
                shift_kind,
                amount,
            } => {
                let value = self.reg(rm);
                let out = match amount {
                    ShiftAmount::Immediate(amount) => alu::shift(shift_kind, amount, value, carry),
                    ShiftAmount::Register(rs) => {
                        alu::shift_by_register(shift_kind, self.reg(rs) & 0xFF, value, carry)
                    }
                };
                (out.result, out.carry)
            }
        }
    }

    fn data_processing(
        &mut self,
        opcode: AluOpcode,
        set_flags: bool,
        rn: u32,
        rd: u32,
        operand2: SecondOperand,
    ) -> u32 {
        use AluOpcode::{Adc, Add, And, Bic, Cmn, Cmp, Eor, Mov, Mvn, Orr, Rsb, Rsc, Sbc, Sub, Teq, Tst};

        let (op2, shifter_carry) = self.second_operand(operand2);
        let rn_value = self.reg(rn);
        let carry_in = self.cpsr().carry_flag();

        let out: ArithmeticOpResult = match opcode {
            And | Tst => alu::and(rn_value, op2, shifter_carry),
            Eor | Teq => alu::eor(rn_value, op2, shifter_carry),
            Sub | Cmp => alu::sub(rn_value, op2),
            Rsb => alu::sub(op2, rn_value),
            Add | Cmn => alu::add(rn_value, op2),
            Adc => alu::adc(rn_value, op2, carry_in),
            Sbc => alu::sbc(rn_value, op2, carry_in),
            Rsc => alu::sbc(op2, rn_value, carry_in),
            Orr => alu::orr(rn_value, op2, shifter_carry),
            Mov => alu::orr(op2, op2, shifter_carry),
            Bic => alu::and(rn_value, !op2, shifter_carry),
            Mvn => alu::orr(!op2, !op2, shifter_carry),
        };

        if set_flags {
            if rd == REG_PC && !opcode.is_test() {
                // MOVS PC / SUBS PC: exception return, CPSR comes back from
                // the SPSR before the branch below uses the restored state
                let spsr = self.registers.spsr(self.mode());
                self.set_cpsr(spsr);
            } else {
                let mut cpsr = self.cpsr();
                cpsr.set_sign_flag(out.sign);
                cpsr.set_zero_flag(out.zero);
                cpsr.set_carry_flag(out.carry);
                if opcode.is_arithmetic() {
                    cpsr.set_overflow_flag(out.overflow);
                }
                self.set_cpsr(cpsr);
            }
        }

        if !opcode.is_test() {
            self.set_reg(rd, out.result);
        }
        if rd == REG_PC && !opcode.is_test() { 3 } else { 1 }
    }

    fn psr_transfer_write(&mut self, use_spsr: bool, field_mask: u32, operand: SecondOperand) -> u32 {
        let (value, _) = self.second_operand(operand);

        let mut mask = 0u32;
        for (bit, bits) in [
            (0, 0x0000_00FFu32),
            (1, 0x0000_FF00),
            (2, 0x00FF_0000),
            (3, 0xFF00_0000),
        ] {
            if field_mask.get_bit(bit) {
                mask |= bits;
            }
        }
        // User mode may only touch the flag byte of the CPSR
        if !use_spsr && self.mode() == Mode::User {
            mask &= 0xFF00_0000;
        }

        if use_spsr {
            let mode = self.mode();
            let old = self.registers.spsr(mode).raw();
            self.registers
                .set_spsr(mode, Psr::from_raw((old & !mask) | (value & mask)));
        } else {
            let old = self.cpsr().raw();
            self.set_cpsr(Psr::from_raw((old & !mask) | (value & mask)));
        }
        1
    }

    fn multiply(
        &mut self,
        accumulate: bool,
        set_flags: bool,
        rd: u32,
        rn: u32,
        rs: u32,
        rm: u32,
    ) -> u32 {
        let mut result = self.reg(rm).wrapping_mul(self.reg(rs));
        if accumulate {
            result = result.wrapping_add(self.reg(rn));
        }
        self.set_reg(rd, result);

        if set_flags {
            // N and Z only; C and V are left untouched on this core
            let mut cpsr = self.cpsr();
            cpsr.set_sign_flag(result.get_bit(31));
            cpsr.set_zero_flag(result == 0);
            self.set_cpsr(cpsr);
        }
        4
    }

    #[allow(clippy::too_many_arguments)]
    fn multiply_long(
        &mut self,
        signed: bool,
        accumulate: bool,
        set_flags: bool,
        rd_hi: u32,
        rd_lo: u32,
        rs: u32,
        rm: u32,
    ) -> u32 {
        let mut result = if signed {
            (i64::from(self.reg(rm) as i32) * i64::from(self.reg(rs) as i32)) as u64
        } else {
            u64::from(self.reg(rm)) * u64::from(self.reg(rs))
        };
        if accumulate {
            let existing = (u64::from(self.reg(rd_hi)) << 32) | u64::from(self.reg(rd_lo));
            result = result.wrapping_add(existing);
        }
        self.set_reg(rd_lo, result as u32);
        self.set_reg(rd_hi, (result >> 32) as u32);

        if set_flags {
            let mut cpsr = self.cpsr();
            cpsr.set_sign_flag(result.get_bit(63));
            cpsr.set_zero_flag(result == 0);
            self.set_cpsr(cpsr);
        }
        5
    }

    #[allow(clippy::too_many_arguments)]
    fn halfword_transfer(
        &mut self,
        load: bool,
        signed: bool,
        halfword: bool,
        pre_index: bool,
        up: bool,
        write_back: bool,
        rn: u32,
        rd: u32,
        offset: HalfwordOffset,
    ) -> u32 {
        let offset_value = match offset {
            HalfwordOffset::Immediate(value) => value,
            HalfwordOffset::Register(rm) => self.reg(rm),
        };
        let base = self.reg(rn);
        let stepped = if up {
            base.wrapping_add(offset_value)
        } else {
            base.wrapping_sub(offset_value)
        };
        let address = if pre_index { stepped } else { base };

        if load {
            let value = match (signed, halfword) {
                (false, _) => self.load_half_word(address),
                (true, false) => self.load_signed_byte(address),
                (true, true) => self.load_signed_half_word(address),
            };
            // post-index always writes back; a loaded base wins over it
            if (!pre_index || write_back) && rd != rn {
                self.set_reg(rn, stepped);
            }
            self.set_reg(rd, value);
        } else {
            self.bus.write_half_word(address & !1, self.reg(rd) as u16);
            if !pre_index || write_back {
                self.set_reg(rn, stepped);
            }
        }
        if load { 3 } else { 2 }
    }

    #[allow(clippy::too_many_arguments)]
    fn single_data_transfer(
        &mut self,
        load: bool,
        byte: bool,
        pre_index: bool,
        up: bool,
        write_back: bool,
        rn: u32,
        rd: u32,
        offset: TransferOffset,
    ) -> u32 {
        let offset_value = match offset {
            TransferOffset::Immediate(value) => value,
            TransferOffset::Register {
                rm,
                shift_kind,
                amount,
            } => alu::shift(shift_kind, amount, self.reg(rm), self.cpsr().carry_flag()).result,
        };
        let base = self.reg(rn);
        let stepped = if up {
            base.wrapping_add(offset_value)
        } else {
            base.wrapping_sub(offset_value)
        };
        let address = if pre_index { stepped } else { base };

        if load {
            let value = if byte {
                u32::from(self.bus.read_byte(address))
            } else {
                self.load_word(address)
            };
            if (!pre_index || write_back) && rd != rn {
                self.set_reg(rn, stepped);
            }
            self.set_reg(rd, value);
        } else {
            // a stored PC reads 12 ahead of the instruction, one word past
            // the usual prefetch offset
            let value = if rd == REG_PC {
                self.reg(rd).wrapping_add(4)
            } else {
                self.reg(rd)
            };
            if byte {
                self.bus.write_byte(address, value as u8);
            } else {
                self.bus.write_word(address & !3, value);
            }
            if !pre_index || write_back {
                self.set_reg(rn, stepped);
            }
        }
        if load { 3 } else { 2 }
    }

    #[allow(clippy::too_many_arguments)]
    fn block_data_transfer(
        &mut self,
        load: bool,
        pre_index: bool,
        up: bool,
        psr_user_bank: bool,
        write_back: bool,
        rn: u32,
        register_list: u16,
    ) -> u32 {
        let base = self.reg(rn);

        // an empty list transfers R15 alone and steps the base by 0x40
        let (list, span) = if register_list == 0 {
            (0x8000u16, 0x40u32)
        } else {
            (register_list, register_list.count_ones() * 4)
        };

        let (start, final_base) = match (pre_index, up) {
            (false, true) => (base, base.wrapping_add(span)),
            (true, true) => (base.wrapping_add(4), base.wrapping_add(span)),
            (false, false) => (
                base.wrapping_sub(span).wrapping_add(4),
                base.wrapping_sub(span),
            ),
            (true, false) => (base.wrapping_sub(span), base.wrapping_sub(span)),
        };

        // S without R15 in an LDM means the User bank is transferred
        let user_bank = psr_user_bank && !(load && list.get_bit(15));
        let lowest = list.trailing_zeros();

        let mut address = start & !3;
        for register in 0..16u32 {
            if !list.get_bit(register as u8) {
                continue;
            }
            if load {
                let value = self.bus.read_word(address);
                if register == REG_PC && psr_user_bank {
                    // LDM ..^ with PC: restore CPSR first so the branch
                    // lands in the right state
                    let spsr = self.registers.spsr(self.mode());
                    self.set_cpsr(spsr);
                }
                if user_bank && register != REG_PC {
                    self.registers.write_user(register, value);
                } else {
                    self.set_reg(register, value);
                }
            } else {
                let value = if register == rn {
                    // storing the base: the old value goes out only if the
                    // base is the first register in the list
                    if register == lowest { base } else { final_base }
                } else if register == REG_PC {
                    self.reg(REG_PC).wrapping_add(4)
                } else if user_bank {
                    self.registers.read_user(register)
                } else {
                    self.reg(register)
                };
                self.bus.write_word(address, value);
            }
            address = address.wrapping_add(4);
        }

        if write_back && !(load && list.get_bit(rn as u8)) {
            self.set_reg(rn, final_base);
        }
        list.count_ones() + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::arm7tdmi::tests::cpu_with_program;
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_covers_the_major_formats() {
        assert!(matches!(
            ArmInstruction::from(0xE12F_FF11),
            ArmInstruction::BranchAndExchange { rm: 1 }
        ));
        assert!(matches!(
            ArmInstruction::from(0xE100_1092),
            ArmInstruction::SingleDataSwap { byte: false, .. }
        ));
        assert!(matches!(
            ArmInstruction::from(0xE083_0291),
            ArmInstruction::MultiplyLong { signed: false, .. }
        ));
        assert!(matches!(
            ArmInstruction::from(0xE003_0291),
            ArmInstruction::Multiply { .. }
        ));
        assert!(matches!(
            ArmInstruction::from(0xE1D0_20B4),
            ArmInstruction::HalfwordTransfer {
                load: true,
                halfword: true,
                signed: false,
                ..
            }
        ));
        assert!(matches!(
            ArmInstruction::from(0xE8BD_8010),
            ArmInstruction::BlockDataTransfer { load: true, .. }
        ));
        assert!(matches!(
            ArmInstruction::from(0xEA00_0000),
            ArmInstruction::Branch { link: false, .. }
        ));
        assert!(matches!(
            ArmInstruction::from(0xEF00_0000),
            ArmInstruction::SoftwareInterrupt
        ));
        assert!(matches!(
            ArmInstruction::from(0xE10F_0000),
            ArmInstruction::Mrs {
                rd: 0,
                use_spsr: false
            }
        ));
        assert!(matches!(
            ArmInstruction::from(0xE129_F000),
            ArmInstruction::Msr { use_spsr: false, .. }
        ));
        // coprocessor space traps
        assert!(matches!(
            ArmInstruction::from(0xEE00_0000),
            ArmInstruction::Undefined
        ));
        assert!(matches!(
            ArmInstruction::from(0xE3A0_0001),
            ArmInstruction::DataProcessing {
                opcode: AluOpcode::Mov,
                ..
            }
        ));
    }

    #[test]
    fn branch_forward_lands_two_words_ahead() {
        use crate::bus::Bus;
        use crate::cartridge::GamePak;
        use crate::cartridge::header::tests::rom_with_header;

        // B with a zero offset at the cartridge entry branches to PC+8
        let mut rom = rom_with_header("BRANCH");
        rom[0..4].copy_from_slice(&0xEA00_0000u32.to_le_bytes());
        let bus = Bus::new(&[0; 0x4000], GamePak::new(&rom).unwrap());
        let mut cpu = Arm7tdmi::new(bus);
        cpu.boot_from_gamepak();

        cpu.step();

        assert_eq!(cpu.execution_address(), 0x0800_0008);
        assert_eq!(cpu.program_counter(), 0x0800_0010);
    }

    #[test]
    fn branch_with_link_saves_the_return_address() {
        let mut cpu = cpu_with_program(&[0xEB00_0010]); // BL +0x40
        cpu.step();

        assert_eq!(cpu.execution_address(), 0x0800_00C8 + 0x40);
        assert_eq!(cpu.reg(14), 0x0800_00C4);
    }

    #[test]
    fn backward_branch_sign_extends() {
        let mut cpu = cpu_with_program(&[0xE3A0_0001, 0xEAFF_FFFD]); // MOV; B -4
        cpu.step();
        cpu.step();
        assert_eq!(cpu.execution_address(), 0x0800_00C0);
    }

    #[test]
    fn adds_sets_the_arithmetic_flags() {
        // MOV R0, #0xFF000000 ; ADDS R1, R0, R0
        let mut cpu = cpu_with_program(&[0xE3A0_04FF, 0xE090_1000]);
        cpu.step();
        assert_eq!(cpu.reg(0), 0xFF00_0000);
        cpu.step();

        assert_eq!(cpu.reg(1), 0xFE00_0000);
        let cpsr = cpu.cpsr();
        assert!(cpsr.sign_flag());
        assert!(!cpsr.zero_flag());
        assert!(cpsr.carry_flag());
        assert!(!cpsr.overflow_flag());
    }

    #[test]
    fn logical_ops_take_carry_from_the_shifter() {
        // MOV R0, #3 ; MOVS R1, R0, LSR #1
        let mut cpu = cpu_with_program(&[0xE3A0_0003, 0xE1B0_10A0]);
        cpu.step();
        cpu.step();

        assert_eq!(cpu.reg(1), 1);
        assert!(cpu.cpsr().carry_flag(), "bit shifted out lands in C");
        assert!(!cpu.cpsr().zero_flag());
    }

    #[test]
    fn register_shift_by_register_amount() {
        // MOV R0, #1 ; MOV R2, #4 ; MOV R1, R0, LSL R2
        let mut cpu = cpu_with_program(&[0xE3A0_0001, 0xE3A0_2004, 0xE1A0_1210]);
        cpu.step();
        cpu.step();
        cpu.step();
        assert_eq!(cpu.reg(1), 0x10);
    }

    #[test]
    fn reading_pc_yields_the_prefetch_address() {
        // MOV R0, PC at 0x0800_00C0 reads 0x0800_00C8
        let mut cpu = cpu_with_program(&[0xE1A0_000F]);
        cpu.step();
        assert_eq!(cpu.reg(0), 0x0800_00C8);
    }

    #[test]
    fn ldr_rotates_unaligned_words() {
        // MOV R0, #0x03000000 ; LDR R1, [R0, #1]
        let mut cpu = cpu_with_program(&[0xE3A0_0403, 0xE590_1001]);
        cpu.bus.write_word(0x0300_0000, 0x1122_3344);
        cpu.step();
        cpu.step();

        assert_eq!(cpu.reg(1), 0x1122_3344u32.rotate_right(8));
    }

    #[test]
    fn str_then_ldr_round_trips() {
        // MOV R0, #0x03000000 ; MOV R1, #0x2A ; STR R1, [R0, #8] ; LDR R2, [R0, #8]
        let mut cpu = cpu_with_program(&[
            0xE3A0_0403,
            0xE3A0_102A,
            0xE580_1008,
            0xE590_2008,
        ]);
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.reg(2), 0x2A);
    }

    #[test]
    fn post_index_writes_back_the_base() {
        // MOV R0, #0x03000000 ; LDR R1, [R0], #4
        let mut cpu = cpu_with_program(&[0xE3A0_0403, 0xE490_1004]);
        cpu.bus.write_word(0x0300_0000, 7);
        cpu.step();
        cpu.step();

        assert_eq!(cpu.reg(1), 7);
        assert_eq!(cpu.reg(0), 0x0300_0004);
    }

    #[test]
    fn stm_ldm_round_trip_with_writeback() {
        // MOV R0,#0x03000000; MOV R1,#1; MOV R2,#2; STMIA R0!,{R1,R2};
        // MOV R1,#0; MOV R2,#0; SUB R0,R0,#8; LDMIA R0!,{R1,R2}
        let mut cpu = cpu_with_program(&[
            0xE3A0_0403,
            0xE3A0_1001,
            0xE3A0_2002,
            0xE8A0_0006,
            0xE3A0_1000,
            0xE3A0_2000,
            0xE240_0008,
            0xE8B0_0006,
        ]);
        for _ in 0..8 {
            cpu.step();
        }

        assert_eq!(cpu.reg(1), 1);
        assert_eq!(cpu.reg(2), 2);
        assert_eq!(cpu.reg(0), 0x0300_0008);
    }

    #[test]
    fn stmdb_matches_full_descending_stack_layout() {
        // MOV R0,#0x03000000; ORR R0,R0,#0x40; MOV R1,#0x11; MOV R2,#0x22;
        // STMDB R0!,{R1,R2}
        let mut cpu = cpu_with_program(&[
            0xE3A0_0403,
            0xE380_0040,
            0xE3A0_1011,
            0xE3A0_2022,
            0xE920_0006,
        ]);
        for _ in 0..5 {
            cpu.step();
        }

        assert_eq!(cpu.reg(0), 0x0300_0038);
        assert_eq!(cpu.bus.read_word(0x0300_0038), 0x11);
        assert_eq!(cpu.bus.read_word(0x0300_003C), 0x22);
    }

    #[test]
    fn bx_switches_to_thumb_on_odd_targets() {
        // MOV R0, #0x03000001 ; BX R0
        let mut cpu = cpu_with_program(&[0xE3A0_0403, 0xE280_0001, 0xE12F_FF10]);
        cpu.step();
        cpu.step();
        cpu.step();

        assert_eq!(cpu.cpsr().cpu_state(), CpuState::Thumb);
        assert_eq!(cpu.execution_address(), 0x0300_0000);
        assert_eq!(cpu.program_counter(), 0x0300_0004);
    }

    #[test]
    fn swp_exchanges_memory_and_register() {
        // MOV R0,#0x03000000; MOV R1,#5; SWP R2, R1, [R0]
        let mut cpu = cpu_with_program(&[0xE3A0_0403, 0xE3A0_1005, 0xE100_2091]);
        cpu.bus.write_word(0x0300_0000, 9);
        for _ in 0..3 {
            cpu.step();
        }

        assert_eq!(cpu.reg(2), 9);
        assert_eq!(cpu.bus.read_word(0x0300_0000), 5);
    }

    #[test]
    fn mul_and_mla_set_nz_only() {
        // MOV R1,#3; MOV R2,#4; MULS R0, R1, R2
        let mut cpu = cpu_with_program(&[0xE3A0_1003, 0xE3A0_2004, 0xE010_0291]);
        let mut cpsr = cpu.cpsr();
        cpsr.set_carry_flag(true);
        cpsr.set_overflow_flag(true);
        cpu.set_cpsr(cpsr);
        for _ in 0..3 {
            cpu.step();
        }

        assert_eq!(cpu.reg(0), 12);
        assert!(!cpu.cpsr().sign_flag());
        assert!(!cpu.cpsr().zero_flag());
        assert!(cpu.cpsr().carry_flag(), "C untouched by multiplies");
        assert!(cpu.cpsr().overflow_flag(), "V untouched by multiplies");
    }

    #[test]
    fn umull_produces_a_64_bit_product() {
        // MVN R1,#0 (0xFFFFFFFF); MOV R2,#2; UMULL R3, R4, R1, R2
        let mut cpu = cpu_with_program(&[0xE3E0_1000, 0xE3A0_2002, 0xE084_3291]);
        for _ in 0..3 {
            cpu.step();
        }

        assert_eq!(cpu.reg(3), 0xFFFF_FFFE);
        assert_eq!(cpu.reg(4), 1);
    }

    #[test]
    fn smull_sign_extends_the_operands() {
        // MVN R1,#0 (-1); MOV R2,#3; SMULL R3, R4, R1, R2
        let mut cpu = cpu_with_program(&[0xE3E0_1000, 0xE3A0_2003, 0xE0C4_3291]);
        for _ in 0..3 {
            cpu.step();
        }

        assert_eq!(cpu.reg(3), -3i32 as u32);
        assert_eq!(cpu.reg(4), 0xFFFF_FFFF);
    }

    #[test]
    fn mrs_reads_and_msr_writes_the_flag_byte() {
        // MSR CPSR_f, #0xF0000000 ; MRS R0, CPSR
        let mut cpu = cpu_with_program(&[0xE328_F4FF, 0xE10F_0000]);
        cpu.step();
        assert!(cpu.cpsr().sign_flag());
        assert!(cpu.cpsr().zero_flag());
        assert!(cpu.cpsr().carry_flag());
        assert!(cpu.cpsr().overflow_flag());

        cpu.step();
        assert_eq!(cpu.reg(0) >> 28, 0xF);
    }

    #[test]
    fn msr_control_field_switches_mode() {
        // MSR CPSR_c, #0x12 (IRQ mode)
        let mut cpu = cpu_with_program(&[0xE321_F012]);
        cpu.step();
        assert_eq!(cpu.mode(), Mode::Irq);
    }

    #[test]
    fn strh_and_ldrsh_round_trip_signed() {
        // MOV R0,#0x03000000; MVN R1,#0x7F (0xFFFFFF80); STRH R1,[R0]; LDRSH R2,[R0]
        let mut cpu = cpu_with_program(&[
            0xE3A0_0403,
            0xE3E0_107F,
            0xE1C0_10B0,
            0xE1D0_20F0,
        ]);
        for _ in 0..4 {
            cpu.step();
        }

        assert_eq!(cpu.bus.read_half_word(0x0300_0000), 0xFF80);
        assert_eq!(cpu.reg(2), 0xFFFF_FF80);
    }

    #[test]
    fn movs_pc_restores_cpsr_from_spsr() {
        // SWI #0 enters Supervisor; at the vector, MOVS PC, LR returns
        let mut cpu = cpu_with_program(&[0xEF00_0000]);
        let user_cpsr = cpu.cpsr();
        cpu.step();
        assert_eq!(cpu.mode(), Mode::Supervisor);

        // plant MOVS PC, LR at the SWI vector (WRAM is not executable at
        // 0x08 on this bus path, but the BIOS region is read-only: run the
        // return from the current position instead)
        let lr = cpu.registers.read(Mode::Supervisor, 14);
        assert_eq!(lr, 0x0800_00C4);
        cpu.execute_arm(ArmInstruction::from(0xE1B0_F00E)); // MOVS PC, LR

        assert_eq!(cpu.mode(), user_cpsr.mode());
        assert_eq!(cpu.execution_address(), lr);
    }
}
