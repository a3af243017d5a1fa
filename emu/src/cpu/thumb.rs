//! THUMB (16-bit) instruction decoding and execution.
//!
//! The 19 THUMB formats compress the most common ARM operations into
//! halfwords over R0-R7, with escape hatches to the high registers (format
//! 5), SP-relative addressing, and the two-halfword long branch-with-link.
//! Only conditional branches carry a condition; everything else always
//! executes.

use serde::{Deserialize, Serialize};

use crate::bitwise::{Bits, sign_extend};
use crate::cpu::alu::{self, ShiftKind};
use crate::cpu::arm7tdmi::{Arm7tdmi, Exception};
use crate::cpu::condition::Condition;
use crate::cpu::psr::CpuState;
use crate::cpu::registers::{REG_LR, REG_PC, REG_SP};

/// Format 3 operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImmediateOperation {
    Mov,
    Cmp,
    Add,
    Sub,
}

impl From<u16> for ImmediateOperation {
    fn from(bits: u16) -> Self {
        match bits & 0b11 {
            0 => Self::Mov,
            1 => Self::Cmp,
            2 => Self::Add,
            _ => Self::Sub,
        }
    }
}

/// Format 4 ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AluOperation {
    And = 0x0,
    Eor = 0x1,
    Lsl = 0x2,
    Lsr = 0x3,
    Asr = 0x4,
    Adc = 0x5,
    Sbc = 0x6,
    Ror = 0x7,
    Tst = 0x8,
    Neg = 0x9,
    Cmp = 0xA,
    Cmn = 0xB,
    Orr = 0xC,
    Mul = 0xD,
    Bic = 0xE,
    Mvn = 0xF,
}

impl From<u16> for AluOperation {
    fn from(bits: u16) -> Self {
        match bits & 0xF {
            0x0 => Self::And,
            0x1 => Self::Eor,
            0x2 => Self::Lsl,
            0x3 => Self::Lsr,
            0x4 => Self::Asr,
            0x5 => Self::Adc,
            0x6 => Self::Sbc,
            0x7 => Self::Ror,
            0x8 => Self::Tst,
            0x9 => Self::Neg,
            0xA => Self::Cmp,
            0xB => Self::Cmn,
            0xC => Self::Orr,
            0xD => Self::Mul,
            0xE => Self::Bic,
            _ => Self::Mvn,
        }
    }
}

/// Format 5 operations over the full register range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HiOperation {
    Add,
    Cmp,
    Mov,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThumbInstruction {
    MoveShifted {
        shift_kind: ShiftKind,
        amount: u32,
        rs: u32,
        rd: u32,
    },
    AddSubtract {
        subtract: bool,
        immediate: bool,
        operand: u32,
        rs: u32,
        rd: u32,
    },
    MoveCompareAddSubImm {
        operation: ImmediateOperation,
        rd: u32,
        value: u32,
    },
    AluOp {
        operation: AluOperation,
        rs: u32,
        rd: u32,
    },
    HiRegisterOp {
        operation: HiOperation,
        rs: u32,
        rd: u32,
    },
    BranchExchange {
        rs: u32,
    },
    PcRelativeLoad {
        rd: u32,
        offset: u32,
    },
    LoadStoreRegister {
        load: bool,
        byte: bool,
        ro: u32,
        rb: u32,
        rd: u32,
    },
    LoadStoreSignExtended {
        halfword: bool,
        sign: bool,
        ro: u32,
        rb: u32,
        rd: u32,
    },
    LoadStoreImmediate {
        load: bool,
        byte: bool,
        offset: u32,
        rb: u32,
        rd: u32,
    },
    LoadStoreHalfword {
        load: bool,
        offset: u32,
        rb: u32,
        rd: u32,
    },
    SpRelativeLoadStore {
        load: bool,
        rd: u32,
        offset: u32,
    },
    LoadAddress {
        from_sp: bool,
        rd: u32,
        offset: u32,
    },
    AddOffsetSp {
        negative: bool,
        offset: u32,
    },
    PushPop {
        load: bool,
        link: bool,
        register_list: u8,
    },
    MultipleLoadStore {
        load: bool,
        rb: u32,
        register_list: u8,
    },
    ConditionalBranch {
        condition: Condition,
        offset: u32,
    },
    SoftwareInterrupt,
    UnconditionalBranch {
        offset: u32,
    },
    LongBranchLink {
        high: bool,
        offset: u32,
    },
    Undefined,
}

impl From<u16> for ThumbInstruction {
    #[allow(clippy::too_many_lines)]
    fn from(op: u16) -> Self {
        let rd = u32::from(op.get_bits(0..=2));
        let rs = u32::from(op.get_bits(3..=5));

        if op.get_bits(8..=15) == 0b1101_1111 {
            Self::SoftwareInterrupt
        } else if op.get_bits(11..=15) == 0b00011 {
            Self::AddSubtract {
                subtract: op.get_bit(9),
                immediate: op.get_bit(10),
                operand: u32::from(op.get_bits(6..=8)),
                rs,
                rd,
            }
        } else if op.get_bits(13..=15) == 0b000 {
            Self::MoveShifted {
                shift_kind: ShiftKind::from(u32::from(op.get_bits(11..=12))),
                amount: u32::from(op.get_bits(6..=10)),
                rs,
                rd,
            }
        } else if op.get_bits(13..=15) == 0b001 {
            Self::MoveCompareAddSubImm {
                operation: ImmediateOperation::from(op.get_bits(11..=12)),
                rd: u32::from(op.get_bits(8..=10)),
                value: u32::from(op.get_bits(0..=7)),
            }
        } else if op.get_bits(10..=15) == 0b010000 {
            Self::AluOp {
                operation: AluOperation::from(op.get_bits(6..=9)),
                rs,
                rd,
            }
        } else if op.get_bits(10..=15) == 0b010001 {
            // format 5: H bits widen the register fields to R0-R15
            let rd = rd | (u32::from(op.get_bit(7)) << 3);
            let rs = u32::from(op.get_bits(3..=6));
            match op.get_bits(8..=9) {
                0b00 => Self::HiRegisterOp {
                    operation: HiOperation::Add,
                    rs,
                    rd,
                },
                0b01 => Self::HiRegisterOp {
                    operation: HiOperation::Cmp,
                    rs,
                    rd,
                },
                0b10 => Self::HiRegisterOp {
                    operation: HiOperation::Mov,
                    rs,
                    rd,
                },
                _ => Self::BranchExchange { rs },
            }
        } else if op.get_bits(11..=15) == 0b01001 {
            Self::PcRelativeLoad {
                rd: u32::from(op.get_bits(8..=10)),
                offset: u32::from(op.get_bits(0..=7)) << 2,
            }
        } else if op.get_bits(12..=15) == 0b0101 && op.is_bit_off(9) {
            Self::LoadStoreRegister {
                load: op.get_bit(11),
                byte: op.get_bit(10),
                ro: u32::from(op.get_bits(6..=8)),
                rb: rs,
                rd,
            }
        } else if op.get_bits(12..=15) == 0b0101 {
            Self::LoadStoreSignExtended {
                halfword: op.get_bit(11),
                sign: op.get_bit(10),
                ro: u32::from(op.get_bits(6..=8)),
                rb: rs,
                rd,
            }
        } else if op.get_bits(13..=15) == 0b011 {
            let byte = op.get_bit(12);
            let offset5 = u32::from(op.get_bits(6..=10));
            Self::LoadStoreImmediate {
                load: op.get_bit(11),
                byte,
                offset: if byte { offset5 } else { offset5 << 2 },
                rb: rs,
                rd,
            }
        } else if op.get_bits(12..=15) == 0b1000 {
            Self::LoadStoreHalfword {
                load: op.get_bit(11),
                offset: u32::from(op.get_bits(6..=10)) << 1,
                rb: rs,
                rd,
            }
        } else if op.get_bits(12..=15) == 0b1001 {
            Self::SpRelativeLoadStore {
                load: op.get_bit(11),
                rd: u32::from(op.get_bits(8..=10)),
                offset: u32::from(op.get_bits(0..=7)) << 2,
            }
        } else if op.get_bits(12..=15) == 0b1010 {
            Self::LoadAddress {
                from_sp: op.get_bit(11),
                rd: u32::from(op.get_bits(8..=10)),
                offset: u32::from(op.get_bits(0..=7)) << 2,
            }
        } else if op.get_bits(8..=15) == 0b1011_0000 {
            Self::AddOffsetSp {
                negative: op.get_bit(7),
                offset: u32::from(op.get_bits(0..=6)) << 2,
            }
        } else if op.get_bits(12..=15) == 0b1011 && op.get_bits(9..=10) == 0b10 {
            Self::PushPop {
                load: op.get_bit(11),
                link: op.get_bit(8),
                register_list: op.get_bits(0..=7) as u8,
            }
        } else if op.get_bits(12..=15) == 0b1100 {
            Self::MultipleLoadStore {
                load: op.get_bit(11),
                rb: u32::from(op.get_bits(8..=10)),
                register_list: op.get_bits(0..=7) as u8,
            }
        } else if op.get_bits(12..=15) == 0b1101 {
            // condition 0xF became SWI above; 0xE is undefined
            let condition = op.get_bits(8..=11) as u8;
            if condition == 0xE {
                Self::Undefined
            } else {
                Self::ConditionalBranch {
                    condition: Condition::from(condition),
                    offset: u32::from(op.get_bits(0..=7)) << 1,
                }
            }
        } else if op.get_bits(11..=15) == 0b11100 {
            Self::UnconditionalBranch {
                offset: u32::from(op.get_bits(0..=10)) << 1,
            }
        } else if op.get_bits(12..=15) == 0b1111 {
            Self::LongBranchLink {
                high: op.get_bit(11),
                offset: u32::from(op.get_bits(0..=10)),
            }
        } else {
            Self::Undefined
        }
    }
}

impl Arm7tdmi {
    #[allow(clippy::too_many_lines)]
    pub(crate) fn execute_thumb(&mut self, instruction: ThumbInstruction) -> u32 {
        match instruction {
            ThumbInstruction::MoveShifted {
                shift_kind,
                amount,
                rs,
                rd,
            } => {
                let out = alu::shift(shift_kind, amount, self.reg(rs), self.cpsr().carry_flag());
                let mut cpsr = self.cpsr();
                cpsr.set_sign_flag(out.sign);
                cpsr.set_zero_flag(out.zero);
                cpsr.set_carry_flag(out.carry);
                self.set_cpsr(cpsr);
                self.set_reg(rd, out.result);
                1
            }
            ThumbInstruction::AddSubtract {
                subtract,
                immediate,
                operand,
                rs,
                rd,
            } => {
                let value = if immediate { operand } else { self.reg(operand) };
                let out = if subtract {
                    alu::sub(self.reg(rs), value)
                } else {
                    alu::add(self.reg(rs), value)
                };
                self.apply_arithmetic_flags(&out);
                self.set_reg(rd, out.result);
                1
            }
            ThumbInstruction::MoveCompareAddSubImm {
                operation,
                rd,
                value,
            } => {
                match operation {
                    ImmediateOperation::Mov => {
                        let mut cpsr = self.cpsr();
                        cpsr.set_sign_flag(false);
                        cpsr.set_zero_flag(value == 0);
                        self.set_cpsr(cpsr);
                        self.set_reg(rd, value);
                    }
                    ImmediateOperation::Cmp => {
                        let out = alu::sub(self.reg(rd), value);
                        self.apply_arithmetic_flags(&out);
                    }
                    ImmediateOperation::Add => {
                        let out = alu::add(self.reg(rd), value);
                        self.apply_arithmetic_flags(&out);
                        self.set_reg(rd, out.result);
                    }
                    ImmediateOperation::Sub => {
                        let out = alu::sub(self.reg(rd), value);
                        self.apply_arithmetic_flags(&out);
                        self.set_reg(rd, out.result);
                    }
                }
                1
            }
            ThumbInstruction::AluOp { operation, rs, rd } => self.thumb_alu(operation, rs, rd),
            ThumbInstruction::HiRegisterOp { operation, rs, rd } => {
                match operation {
                    HiOperation::Add => {
                        let result = self.reg(rd).wrapping_add(self.reg(rs));
                        self.set_reg(rd, result);
                    }
                    HiOperation::Cmp => {
                        let out = alu::sub(self.reg(rd), self.reg(rs));
                        self.apply_arithmetic_flags(&out);
                    }
                    HiOperation::Mov => {
                        let value = self.reg(rs);
                        self.set_reg(rd, value);
                    }
                }
                if rd == REG_PC { 3 } else { 1 }
            }
            ThumbInstruction::BranchExchange { rs } => {
                let target = self.reg(rs);
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
            ThumbInstruction::PcRelativeLoad { rd, offset } => {
                let base = self.reg(REG_PC) & !2;
                let value = self.load_word(base.wrapping_add(offset));
                self.set_reg(rd, value);
                3
            }
            ThumbInstruction::LoadStoreRegister {
                load,
                byte,
                ro,
                rb,
                rd,
            } => {
                let address = self.reg(rb).wrapping_add(self.reg(ro));
                self.transfer_word_or_byte(load, byte, address, rd);
                if load { 3 } else { 2 }
            }
            ThumbInstruction::LoadStoreSignExtended {
                halfword,
                sign,
                ro,
                rb,
                rd,
            } => {
                let address = self.reg(rb).wrapping_add(self.reg(ro));
                match (sign, halfword) {
                    (false, false) => {
                        let value = self.reg(rd) as u16;
                        self.bus.write_half_word(address & !1, value);
                    }
                    (false, true) => {
                        let value = self.load_half_word(address);
                        self.set_reg(rd, value);
                    }
                    (true, false) => {
                        let value = self.load_signed_byte(address);
                        self.set_reg(rd, value);
                    }
                    (true, true) => {
                        let value = self.load_signed_half_word(address);
                        self.set_reg(rd, value);
                    }
                }
                if sign || halfword { 3 } else { 2 }
            }
            ThumbInstruction::LoadStoreImmediate {
                load,
                byte,
                offset,
                rb,
                rd,
            } => {
                let address = self.reg(rb).wrapping_add(offset);
                self.transfer_word_or_byte(load, byte, address, rd);
                if load { 3 } else { 2 }
            }
            ThumbInstruction::LoadStoreHalfword {
                load,
                offset,
                rb,
                rd,
            } => {
                let address = self.reg(rb).wrapping_add(offset);
                if load {
                    let value = self.load_half_word(address);
                    self.set_reg(rd, value);
                } else {
                    let value = self.reg(rd) as u16;
                    self.bus.write_half_word(address & !1, value);
                }
                if load { 3 } else { 2 }
            }
            ThumbInstruction::SpRelativeLoadStore { load, rd, offset } => {
                let address = self.reg(REG_SP).wrapping_add(offset);
                self.transfer_word_or_byte(load, false, address, rd);
                if load { 3 } else { 2 }
            }
            ThumbInstruction::LoadAddress {
                from_sp,
                rd,
                offset,
            } => {
                let base = if from_sp {
                    self.reg(REG_SP)
                } else {
                    self.reg(REG_PC) & !2
                };
                self.set_reg(rd, base.wrapping_add(offset));
                1
            }
            ThumbInstruction::AddOffsetSp { negative, offset } => {
                let sp = self.reg(REG_SP);
                let sp = if negative {
                    sp.wrapping_sub(offset)
                } else {
                    sp.wrapping_add(offset)
                };
                self.set_reg(REG_SP, sp);
                1
            }
            ThumbInstruction::PushPop {
                load,
                link,
                register_list,
            } => self.push_pop(load, link, register_list),
            ThumbInstruction::MultipleLoadStore {
                load,
                rb,
                register_list,
            } => self.thumb_multiple_load_store(load, rb, register_list),
            ThumbInstruction::ConditionalBranch { condition, offset } => {
                if self.cpsr().check_condition(condition) {
                    let target = self.reg(REG_PC).wrapping_add(sign_extend(offset, 9));
                    self.branch_to(target);
                    3
                } else {
                    1
                }
            }
            ThumbInstruction::SoftwareInterrupt => {
                self.handle_exception(Exception::SoftwareInterrupt);
                3
            }
            ThumbInstruction::UnconditionalBranch { offset } => {
                let target = self.reg(REG_PC).wrapping_add(sign_extend(offset, 12));
                self.branch_to(target);
                3
            }
            ThumbInstruction::LongBranchLink { high, offset } => {
                if high {
                    // second half: jump and leave the return address (with
                    // the THUMB bit) in LR
                    let target = self.reg(REG_LR).wrapping_add(offset << 1);
                    let return_address = (self.reg(REG_PC).wrapping_sub(2)) | 1;
                    self.set_reg(REG_LR, return_address);
                    self.branch_to(target);
                    3
                } else {
                    // first half: stage the upper offset bits into LR
                    let lr = self
                        .reg(REG_PC)
                        .wrapping_add(sign_extend(offset, 11) << 12);
                    self.set_reg(REG_LR, lr);
                    1
                }
            }
            ThumbInstruction::Undefined => {
                tracing::debug!(
                    "undefined THUMB instruction at {:#010X}",
                    self.execution_address()
                );
                self.handle_exception(Exception::Undefined);
                3
            }
        }
    }

    fn apply_arithmetic_flags(&mut self, out: &alu::ArithmeticOpResult) {
        let mut cpsr = self.cpsr();
        cpsr.set_sign_flag(out.sign);
        cpsr.set_zero_flag(out.zero);
        cpsr.set_carry_flag(out.carry);
        cpsr.set_overflow_flag(out.overflow);
        self.set_cpsr(cpsr);
    }

    fn apply_logical_flags(&mut self, result: u32) {
        let mut cpsr = self.cpsr();
        cpsr.set_sign_flag(result.get_bit(31));
        cpsr.set_zero_flag(result == 0);
        self.set_cpsr(cpsr);
    }

    fn transfer_word_or_byte(&mut self, load: bool, byte: bool, address: u32, rd: u32) {
        if load {
            let value = if byte {
                u32::from(self.bus.read_byte(address))
            } else {
                self.load_word(address)
            };
            self.set_reg(rd, value);
        } else {
            let value = self.reg(rd);
            if byte {
                self.bus.write_byte(address, value as u8);
            } else {
                self.bus.write_word(address & !3, value);
            }
        }
    }

    fn thumb_alu(&mut self, operation: AluOperation, rs: u32, rd: u32) -> u32 {
        use AluOperation::{
            Adc, And, Asr, Bic, Cmn, Cmp, Eor, Lsl, Lsr, Mul, Mvn, Neg, Orr, Ror, Sbc, Tst,
        };

        let rd_value = self.reg(rd);
        let rs_value = self.reg(rs);
        let carry = self.cpsr().carry_flag();

        match operation {
            And => {
                let result = rd_value & rs_value;
                self.apply_logical_flags(result);
                self.set_reg(rd, result);
            }
            Eor => {
                let result = rd_value ^ rs_value;
                self.apply_logical_flags(result);
                self.set_reg(rd, result);
            }
            Orr => {
                let result = rd_value | rs_value;
                self.apply_logical_flags(result);
                self.set_reg(rd, result);
            }
            Bic => {
                let result = rd_value & !rs_value;
                self.apply_logical_flags(result);
                self.set_reg(rd, result);
            }
            Mvn => {
                let result = !rs_value;
                self.apply_logical_flags(result);
                self.set_reg(rd, result);
            }
            Tst => self.apply_logical_flags(rd_value & rs_value),
            Lsl | Lsr | Asr | Ror => {
                let kind = match operation {
                    Lsl => ShiftKind::Lsl,
                    Lsr => ShiftKind::Lsr,
                    Asr => ShiftKind::Asr,
                    _ => ShiftKind::Ror,
                };
                let out = alu::shift_by_register(kind, rs_value & 0xFF, rd_value, carry);
                let mut cpsr = self.cpsr();
                cpsr.set_sign_flag(out.sign);
                cpsr.set_zero_flag(out.zero);
                cpsr.set_carry_flag(out.carry);
                self.set_cpsr(cpsr);
                self.set_reg(rd, out.result);
            }
            Adc => {
                let out = alu::adc(rd_value, rs_value, carry);
                self.apply_arithmetic_flags(&out);
                self.set_reg(rd, out.result);
            }
            Sbc => {
                let out = alu::sbc(rd_value, rs_value, carry);
                self.apply_arithmetic_flags(&out);
                self.set_reg(rd, out.result);
            }
            Neg => {
                let out = alu::sub(0, rs_value);
                self.apply_arithmetic_flags(&out);
                self.set_reg(rd, out.result);
            }
            Cmp => {
                let out = alu::sub(rd_value, rs_value);
                self.apply_arithmetic_flags(&out);
            }
            Cmn => {
                let out = alu::add(rd_value, rs_value);
                self.apply_arithmetic_flags(&out);
            }
            Mul => {
                let result = rd_value.wrapping_mul(rs_value);
                // N and Z only, matching the ARM-side multiply policy
                self.apply_logical_flags(result);
                self.set_reg(rd, result);
            }
        }
        if operation == Mul { 4 } else { 1 }
    }

    fn push_pop(&mut self, load: bool, link: bool, register_list: u8) -> u32 {
        let count = u32::from(register_list.count_ones()) + u32::from(link);

        if load {
            // POP {rlist} / POP {rlist, PC}
            let mut address = self.reg(REG_SP);
            for register in 0..8u32 {
                if register_list.get_bit(register as u8) {
                    let value = self.bus.read_word(address);
                    self.set_reg(register, value);
                    address = address.wrapping_add(4);
                }
            }
            if link {
                let target = self.bus.read_word(address);
                address = address.wrapping_add(4);
                self.branch_to(target);
            }
            self.set_reg(REG_SP, address);
        } else {
            // PUSH {rlist} / PUSH {rlist, LR}
            let mut address = self.reg(REG_SP).wrapping_sub(count * 4);
            self.set_reg(REG_SP, address);
            for register in 0..8u32 {
                if register_list.get_bit(register as u8) {
                    let value = self.reg(register);
                    self.bus.write_word(address & !3, value);
                    address = address.wrapping_add(4);
                }
            }
            if link {
                let value = self.reg(REG_LR);
                self.bus.write_word(address & !3, value);
            }
        }
        count + 2
    }

    fn thumb_multiple_load_store(&mut self, load: bool, rb: u32, register_list: u8) -> u32 {
        let base = self.reg(rb);

        // the empty-list quirk transfers R15 and steps the base by 0x40
        if register_list == 0 {
            if load {
                let value = self.bus.read_word(base);
                self.branch_to(value);
            } else {
                let value = self.reg(REG_PC).wrapping_add(2);
                self.bus.write_word(base & !3, value);
            }
            self.set_reg(rb, base.wrapping_add(0x40));
            return 3;
        }

        let span = u32::from(register_list.count_ones()) * 4;
        let lowest = register_list.trailing_zeros();
        let mut address = base;

        for register in 0..8u32 {
            if !register_list.get_bit(register as u8) {
                continue;
            }
            if load {
                let value = self.bus.read_word(address);
                self.set_reg(register, value);
            } else {
                let value = if register == rb {
                    if register == lowest {
                        base
                    } else {
                        base.wrapping_add(span)
                    }
                } else {
                    self.reg(register)
                };
                self.bus.write_word(address & !3, value);
            }
            address = address.wrapping_add(4);
        }

        if !(load && register_list.get_bit(rb as u8)) {
            self.set_reg(rb, base.wrapping_add(span));
        }
        u32::from(register_list.count_ones()) + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::arm7tdmi::tests::cpu_with_program;
    use pretty_assertions::assert_eq;

    /// A CPU in THUMB state executing halfwords placed in chip WRAM.
    fn thumb_cpu(halfwords: &[u16]) -> Arm7tdmi {
        let mut cpu = cpu_with_program(&[]);
        for (i, half) in halfwords.iter().enumerate() {
            cpu.bus
                .write_half_word(0x0300_0000 + (i as u32) * 2, *half);
        }
        let mut cpsr = cpu.cpsr();
        cpsr.set_cpu_state(CpuState::Thumb);
        cpu.set_cpsr(cpsr);
        cpu.branch_to(0x0300_0000);
        cpu
    }

    #[test]
    fn decode_covers_every_format() {
        assert!(matches!(
            ThumbInstruction::from(0x0088), // LSL R0, R1, #2
            ThumbInstruction::MoveShifted { .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x1888), // ADD R0, R1, R2
            ThumbInstruction::AddSubtract { subtract: false, immediate: false, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x2005), // MOV R0, #5
            ThumbInstruction::MoveCompareAddSubImm { operation: ImmediateOperation::Mov, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x4048), // EOR R0, R1
            ThumbInstruction::AluOp { operation: AluOperation::Eor, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x4470), // ADD hi
            ThumbInstruction::HiRegisterOp { operation: HiOperation::Add, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x4738), // BX R7
            ThumbInstruction::BranchExchange { rs: 7 }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x4801), // LDR R0, [PC, #4]
            ThumbInstruction::PcRelativeLoad { rd: 0, offset: 4 }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x5088), // STR R0, [R1, R2]
            ThumbInstruction::LoadStoreRegister { load: false, byte: false, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x5E88), // LDRSH R0, [R1, R2]
            ThumbInstruction::LoadStoreSignExtended { halfword: true, sign: true, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x6888), // LDR R0, [R1, #8]
            ThumbInstruction::LoadStoreImmediate { load: true, byte: false, offset: 8, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x8888), // LDRH R0, [R1, #4]
            ThumbInstruction::LoadStoreHalfword { load: true, offset: 4, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0x9801), // LDR R0, [SP, #4]
            ThumbInstruction::SpRelativeLoadStore { load: true, offset: 4, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xA801), // ADD R0, SP, #4
            ThumbInstruction::LoadAddress { from_sp: true, offset: 4, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xB081), // SUB SP, #4... ADD SP with sign
            ThumbInstruction::AddOffsetSp { negative: true, offset: 4 }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xB510), // PUSH {R4, LR}
            ThumbInstruction::PushPop { load: false, link: true, register_list: 0x10 }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xC101), // STMIA R1!, {R0}
            ThumbInstruction::MultipleLoadStore { load: false, rb: 1, register_list: 1 }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xD0FE), // BEQ .
            ThumbInstruction::ConditionalBranch { condition: Condition::EQ, .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xDF00),
            ThumbInstruction::SoftwareInterrupt
        ));
        assert!(matches!(
            ThumbInstruction::from(0xE002), // B +4
            ThumbInstruction::UnconditionalBranch { .. }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xF000),
            ThumbInstruction::LongBranchLink { high: false, offset: 0 }
        ));
        assert!(matches!(
            ThumbInstruction::from(0xF801),
            ThumbInstruction::LongBranchLink { high: true, offset: 1 }
        ));
    }

    #[test]
    fn long_branch_link_pair() {
        // BL +6 split into its two halves, placed at 0x0300_0000
        let mut cpu = thumb_cpu(&[0xF000, 0xF801]);
        cpu.step();
        assert_eq!(cpu.reg(REG_LR), 0x0300_0004);

        cpu.step();
        assert_eq!(cpu.reg(REG_LR), 0x0300_0005, "return address with T bit");
        assert_eq!(cpu.execution_address(), 0x0300_0006);
        assert_eq!(cpu.program_counter(), 0x0300_000A);
    }

    #[test]
    fn long_branch_link_pair_at_the_cartridge_entry() {
        use crate::bus::Bus;
        use crate::cartridge::GamePak;
        use crate::cartridge::header::tests::rom_with_header;
        use crate::cpu::cpu_modes::Mode;
        use crate::cpu::psr::Psr;

        // the BL halves at 0x0800_0000, executed in User/THUMB state
        let mut rom = rom_with_header("THUMBBL");
        rom[0..2].copy_from_slice(&0xF000u16.to_le_bytes());
        rom[2..4].copy_from_slice(&0xF801u16.to_le_bytes());
        let bus = Bus::new(&[0; 0x4000], GamePak::new(&rom).unwrap());
        let mut cpu = Arm7tdmi::new(bus);
        let mut cpsr = Psr::from(Mode::User);
        cpsr.set_cpu_state(CpuState::Thumb);
        cpu.set_cpsr(cpsr);
        cpu.branch_to(0x0800_0000);

        cpu.step();
        cpu.step();

        assert_eq!(cpu.reg(REG_LR), 0x0800_0005, "return address with T bit");
        // execution resumes at 0x0800_0006; raw R15 runs one prefetch offset
        // ahead of it (see DESIGN.md on the branch scenarios' PC conventions)
        assert_eq!(cpu.execution_address(), 0x0800_0006);
        assert_eq!(cpu.program_counter(), 0x0800_000A);
    }

    #[test]
    fn move_shifted_sets_flags() {
        // MOV R1, #0x80 ; LSL R0, R1, #24
        let mut cpu = thumb_cpu(&[0x2180, 0x0608]);
        cpu.step();
        cpu.step();

        assert_eq!(cpu.reg(0), 0x8000_0000);
        assert!(cpu.cpsr().sign_flag());
        assert!(!cpu.cpsr().zero_flag());
    }

    #[test]
    fn add_subtract_register_and_immediate() {
        // MOV R1, #7 ; MOV R2, #3 ; ADD R0, R1, R2 ; SUB R0, R0, #1
        let mut cpu = thumb_cpu(&[0x2107, 0x2203, 0x1888, 0x1E40]);
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.reg(0), 9);
        assert!(cpu.cpsr().carry_flag(), "no borrow on SUB");
    }

    #[test]
    fn alu_op_carry_behavior() {
        // MOV R0, #1 ; MOV R1, #1 ; LSR R0, R1
        let mut cpu = thumb_cpu(&[0x2001, 0x2101, 0x40C8]);
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.reg(0), 0);
        assert!(cpu.cpsr().zero_flag());
        assert!(cpu.cpsr().carry_flag());
    }

    #[test]
    fn hi_register_add_reaches_high_registers() {
        // MOV R0, #4 ; ADD SP, R0 (format 5: ADD R13, R0)
        let mut cpu = thumb_cpu(&[0x2004, 0x4485]);
        let sp = cpu.reg(REG_SP);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.reg(REG_SP), sp.wrapping_add(4));
    }

    #[test]
    fn push_pop_round_trip() {
        // MOV R0,#0x11 ; MOV R1,#0x22 ; PUSH {R0,R1} ; MOV R0,#0 ; MOV R1,#0 ;
        // POP {R0,R1}
        let mut cpu = thumb_cpu(&[0x2011, 0x2122, 0xB403, 0x2000, 0x2100, 0xBC03]);
        let sp = cpu.reg(REG_SP);
        for _ in 0..6 {
            cpu.step();
        }

        assert_eq!(cpu.reg(0), 0x11);
        assert_eq!(cpu.reg(1), 0x22);
        assert_eq!(cpu.reg(REG_SP), sp);
    }

    #[test]
    fn pop_pc_returns() {
        // PUSH {LR} ; POP {PC} with LR staged beforehand
        let mut cpu = thumb_cpu(&[0xB500, 0xBD00]);
        cpu.set_reg(REG_LR, 0x0300_0021);
        // set_reg on LR must not disturb the pipeline
        cpu.step();
        cpu.step();

        assert_eq!(cpu.execution_address(), 0x0300_0020);
    }

    #[test]
    fn conditional_branch_follows_flags() {
        // CMP R0, #0 ; BEQ +2
        let mut cpu = thumb_cpu(&[0x2800, 0xD001]);
        cpu.step();
        assert!(cpu.cpsr().zero_flag());
        cpu.step();
        // target = (0x0300_0002 + 4) + 2
        assert_eq!(cpu.execution_address(), 0x0300_0008);
    }

    #[test]
    fn conditional_branch_falls_through() {
        // CMP R0, #1 ; BEQ +2
        let mut cpu = thumb_cpu(&[0x2801, 0xD001]);
        cpu.step();
        cpu.step();
        assert_eq!(cpu.execution_address(), 0x0300_0004);
    }

    #[test]
    fn sp_relative_store_and_load() {
        // ADD SP, #-8 ; MOV R0, #9 ; STR R0, [SP, #4] ; LDR R1, [SP, #4]
        let mut cpu = thumb_cpu(&[0xB082, 0x2009, 0x9001, 0x9901]);
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.reg(1), 9);
    }

    #[test]
    fn pc_relative_load_reads_the_literal_pool() {
        // LDR R0, [PC, #4]: base is (0x0300_0000 + 4) & !2, pool at +4
        let mut cpu = thumb_cpu(&[0x4801, 0, 0xBEEF, 0x1234]);
        cpu.bus.write_word(0x0300_0008, 0xCAFE_F00D);
        cpu.step();
        assert_eq!(cpu.reg(0), 0xCAFE_F00D);
    }

    #[test]
    fn multiple_load_store_advances_base() {
        // MOV R1,#0x11 ; MOV R2,#0x22 ; STMIA R0!, {R1,R2} with R0 staged
        let mut cpu = thumb_cpu(&[0x2111, 0x2222, 0xC006]);
        cpu.set_reg(0, 0x0300_0040);
        for _ in 0..3 {
            cpu.step();
        }

        assert_eq!(cpu.reg(0), 0x0300_0048);
        assert_eq!(cpu.bus.read_word(0x0300_0040), 0x11);
        assert_eq!(cpu.bus.read_word(0x0300_0044), 0x22);
    }

    #[test]
    fn thumb_swi_enters_supervisor_in_arm_state() {
        let mut cpu = thumb_cpu(&[0xDF05]);
        cpu.step();

        assert_eq!(cpu.cpsr().cpu_state(), CpuState::Arm);
        assert_eq!(cpu.execution_address(), 0x08);
        assert_eq!(
            cpu.registers
                .read(crate::cpu::cpu_modes::Mode::Supervisor, REG_LR),
            0x0300_0002
        );
    }
}
