//! The system bus: address decoding, open bus, and the DMA runner.
//!
//! The top byte of the 32-bit address selects the region:
//!
//! | High byte | Region          | Size    | Mirror mask  |
//! |-----------|-----------------|---------|--------------|
//! | `0x00`    | BIOS            | 16 KiB  | `0x3FFF`     |
//! | `0x02`    | Board WRAM      | 256 KiB | `0x3FFFF`    |
//! | `0x03`    | Chip WRAM       | 32 KiB  | `0x7FFF`     |
//! | `0x04`    | I/O registers   | 1 KiB   | (no mirror)  |
//! | `0x05`    | Palette RAM     | 1 KiB   | `0x3FF`      |
//! | `0x06`    | VRAM            | 96 KiB  | folded       |
//! | `0x07`    | OAM             | 1 KiB   | `0x3FF`      |
//! | `0x08+`   | Game Pak        | —       | `0x1FFFFFF`  |
//!
//! VRAM mirrors on a 128 KiB stride; offsets whose low 17 bits land above
//! `0x17FFF` reflect back into the upper 32 KiB bank.
//!
//! Everything unmapped reads as **open bus**: the last-prefetched instruction
//! word, lane-selected by the low address bits. Writes to unmapped or
//! read-only space are dropped.
//!
//! Hardware quirks carried here: BIOS is only readable while the program
//! counter is inside it (other reads return the last opcode fetched from
//! BIOS); byte writes to Palette/VRAM are duplicated into the halfword; byte
//! writes to OAM are ignored.
//!
//! The bus also owns the [`Devices`] bundle and runs the DMA engine, since
//! DMA is the one device that masters the bus itself.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::cartridge::GamePak;
use crate::hardware::display::BeamEvents;
use crate::hardware::dma::{self, StartTiming};
use crate::hardware::interrupt_control::{IE_OFFSET, Interrupt};
use crate::hardware::{self, Devices, SOUNDCNT_H_OFFSET};
use crate::io_registers::IoRegisters;
use crate::memory::MemoryRegion;

pub const BIOS_LEN: usize = 0x4000;
const BOARD_WRAM_LEN: usize = 0x4_0000;
const CHIP_WRAM_LEN: usize = 0x8000;
const PALETTE_LEN: usize = 0x400;
const VRAM_LEN: usize = 0x1_8000;
const OAM_LEN: usize = 0x400;

#[derive(Serialize, Deserialize)]
pub struct Bus {
    bios: MemoryRegion,
    board_wram: MemoryRegion,
    chip_wram: MemoryRegion,
    palette_ram: MemoryRegion,
    video_ram: MemoryRegion,
    object_attributes: MemoryRegion,
    pub io: IoRegisters,
    pub devices: Devices,
    pub gamepak: GamePak,
    /// The last-prefetched instruction word; what open-bus reads float to.
    last_prefetch: u32,
    /// The last opcode fetched from inside the BIOS, for read protection.
    last_bios_fetch: u32,
    /// Where the CPU is currently executing, for BIOS read protection.
    current_pc: u32,
    cycle_count: u64,
}

impl Bus {
    #[must_use]
    pub fn new(bios_image: &[u8], gamepak: GamePak) -> Self {
        let mut bios = MemoryRegion::read_only(BIOS_LEN, BIOS_LEN - 1);
        bios.load(bios_image);

        let mut io = IoRegisters::default();
        hardware::install_hooks(&mut io);

        Self {
            bios,
            board_wram: MemoryRegion::new(BOARD_WRAM_LEN, BOARD_WRAM_LEN - 1),
            chip_wram: MemoryRegion::new(CHIP_WRAM_LEN, CHIP_WRAM_LEN - 1),
            palette_ram: MemoryRegion::new(PALETTE_LEN, PALETTE_LEN - 1),
            video_ram: MemoryRegion::new(VRAM_LEN, 0x1_FFFF),
            object_attributes: MemoryRegion::new(OAM_LEN, OAM_LEN - 1),
            io,
            devices: Devices::default(),
            gamepak,
            last_prefetch: 0,
            last_bios_fetch: 0,
            current_pc: 0,
            cycle_count: 0,
        }
    }

    /// Re-registers the I/O observers. Required after deserializing a
    /// snapshot: hook tables are function pointers and are not persisted.
    pub fn reinstall_hooks(&mut self) {
        self.io.clear_hooks();
        hardware::install_hooks(&mut self.io);
    }

    /// Called by the CPU on every fetch: feeds open bus and BIOS protection.
    pub fn record_prefetch(&mut self, pc: u32, opcode: u32) {
        self.current_pc = pc;
        self.last_prefetch = opcode;
        if pc < BIOS_LEN as u32 {
            self.last_bios_fetch = opcode;
        }
    }

    pub const fn set_current_pc(&mut self, pc: u32) {
        self.current_pc = pc;
    }

    #[must_use]
    pub const fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// VRAM mirrors in 128 KiB strides of which the last 32 KiB fold back
    /// onto the 64 KiB..96 KiB bank.
    fn vram_offset(address: u32) -> usize {
        let offset = (address as usize) & 0x1_FFFF;
        if offset >= VRAM_LEN { offset - 0x8000 } else { offset }
    }

    fn open_bus(&self, address: u32) -> u32 {
        tracing::debug!("open-bus read at {address:#010X}");
        self.last_prefetch
    }

    const fn io_offset(address: u32) -> Option<usize> {
        let offset = (address & 0x00FF_FFFF) as usize;
        if offset < 0x400 { Some(offset) } else { None }
    }

    #[must_use]
    pub fn read_byte(&mut self, address: u32) -> u8 {
        let lane = ((address & 3) * 8) as u32;
        match address >> 24 {
            0x00 if (address & 0x00FF_FFFF) < BIOS_LEN as u32 => {
                if self.current_pc < BIOS_LEN as u32 {
                    self.bios.read_byte(address as usize)
                } else {
                    (self.last_bios_fetch >> lane) as u8
                }
            }
            0x02 => self.board_wram.read_byte(address as usize),
            0x03 => self.chip_wram.read_byte(address as usize),
            0x04 => match Self::io_offset(address) {
                Some(offset) => self.io.read(&mut self.devices, offset, 1) as u8,
                None => (self.open_bus(address) >> lane) as u8,
            },
            0x05 => self.palette_ram.read_byte(address as usize),
            0x06 => self.video_ram.read_byte(Self::vram_offset(address)),
            0x07 => self.object_attributes.read_byte(address as usize),
            0x08..=0x0F => self
                .gamepak
                .read_byte(address)
                .unwrap_or_else(|| (self.open_bus(address) >> lane) as u8),
            _ => (self.open_bus(address) >> lane) as u8,
        }
    }

    #[must_use]
    pub fn read_half_word(&mut self, address: u32) -> u16 {
        let lane = ((address & 2) * 8) as u32;
        match address >> 24 {
            0x00 if (address & 0x00FF_FFFF) < BIOS_LEN as u32 => {
                if self.current_pc < BIOS_LEN as u32 {
                    self.bios.read_half_word(address as usize)
                } else {
                    (self.last_bios_fetch >> lane) as u16
                }
            }
            0x02 => self.board_wram.read_half_word(address as usize),
            0x03 => self.chip_wram.read_half_word(address as usize),
            0x04 => match Self::io_offset(address) {
                Some(offset) => self.io.read(&mut self.devices, offset & !1, 2) as u16,
                None => (self.open_bus(address) >> lane) as u16,
            },
            0x05 => self.palette_ram.read_half_word(address as usize),
            0x06 => self.video_ram.read_half_word(Self::vram_offset(address & !1)),
            0x07 => self.object_attributes.read_half_word(address as usize),
            0x08..=0x0F => self
                .gamepak
                .read_half_word(address)
                .unwrap_or_else(|| (self.open_bus(address) >> lane) as u16),
            _ => (self.open_bus(address) >> lane) as u16,
        }
    }

    /// 32-bit read. Unaligned addresses return the aligned word rotated
    /// right by `(address & 3) * 8`, in every region.
    #[must_use]
    pub fn read_word(&mut self, address: u32) -> u32 {
        let rotation = (address & 3) * 8;
        match address >> 24 {
            0x00 if (address & 0x00FF_FFFF) < BIOS_LEN as u32 => {
                if self.current_pc < BIOS_LEN as u32 {
                    self.bios.read_word(address as usize)
                } else {
                    self.last_bios_fetch.rotate_right(rotation)
                }
            }
            0x02 => self.board_wram.read_word(address as usize),
            0x03 => self.chip_wram.read_word(address as usize),
            0x04 => match Self::io_offset(address) {
                Some(offset) => self
                    .io
                    .read(&mut self.devices, offset & !3, 4)
                    .rotate_right(rotation),
                None => self.open_bus(address).rotate_right(rotation),
            },
            0x05 => self.palette_ram.read_word(address as usize),
            0x06 => self
                .video_ram
                .read_word(Self::vram_offset(address & !3))
                .rotate_right(rotation),
            0x07 => self.object_attributes.read_word(address as usize),
            0x08..=0x0F => self
                .gamepak
                .read_word(address)
                .map_or_else(|| self.open_bus(address), |value| value)
                .rotate_right(rotation),
            _ => self.open_bus(address).rotate_right(rotation),
        }
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        match address >> 24 {
            0x00 => self.bios.write_byte(address as usize, value),
            0x02 => self.board_wram.write_byte(address as usize, value),
            0x03 => self.chip_wram.write_byte(address as usize, value),
            0x04 => {
                if let Some(offset) = Self::io_offset(address) {
                    self.io.write(&mut self.devices, offset, u32::from(value), 1);
                    self.after_io_write();
                }
            }
            // byte writes to palette and VRAM land duplicated on the halfword
            0x05 => self
                .palette_ram
                .write_half_word((address & !1) as usize, u16::from_le_bytes([value, value])),
            0x06 => self.video_ram.write_half_word(
                Self::vram_offset(address & !1),
                u16::from_le_bytes([value, value]),
            ),
            // byte writes to OAM are ignored by the hardware
            0x07 => tracing::debug!("dropped OAM byte write at {address:#010X}"),
            0x08..=0x0F => self.gamepak.write_byte(address, value),
            _ => tracing::debug!("dropped write to unmapped {address:#010X}"),
        }
    }

    pub fn write_half_word(&mut self, address: u32, value: u16) {
        match address >> 24 {
            0x00 => self.bios.write_half_word(address as usize, value),
            0x02 => self.board_wram.write_half_word(address as usize, value),
            0x03 => self.chip_wram.write_half_word(address as usize, value),
            0x04 => {
                if let Some(offset) = Self::io_offset(address) {
                    self.io
                        .write(&mut self.devices, offset & !1, u32::from(value), 2);
                    self.after_io_write();
                }
            }
            0x05 => self.palette_ram.write_half_word(address as usize, value),
            0x06 => self
                .video_ram
                .write_half_word(Self::vram_offset(address & !1), value),
            0x07 => self.object_attributes.write_half_word(address as usize, value),
            0x08..=0x0F => self.gamepak.write_half_word(address, value),
            _ => tracing::debug!("dropped write to unmapped {address:#010X}"),
        }
    }

    pub fn write_word(&mut self, address: u32, value: u32) {
        match address >> 24 {
            0x00 => self.bios.write_word(address as usize, value),
            0x02 => self.board_wram.write_word(address as usize, value),
            0x03 => self.chip_wram.write_word(address as usize, value),
            0x04 => {
                if let Some(offset) = Self::io_offset(address) {
                    self.io.write(&mut self.devices, offset & !3, value, 4);
                    self.after_io_write();
                }
            }
            0x05 => self.palette_ram.write_word(address as usize, value),
            0x06 => self
                .video_ram
                .write_word(Self::vram_offset(address & !3), value),
            0x07 => self.object_attributes.write_word(address as usize, value),
            0x08..=0x0F => self.gamepak.write_word(address, value),
            _ => tracing::debug!("dropped write to unmapped {address:#010X}"),
        }
    }

    /// Post-store bookkeeping: an acknowledge or IE write may have satisfied
    /// the halt wake-up condition.
    fn after_io_write(&mut self) {
        if self.devices.halted && self.devices.interrupt_control.halt_wake_pending() {
            self.devices.halted = false;
        }
    }

    pub fn request_interrupt(&mut self, source: Interrupt) {
        self.devices.interrupt_control.request(source);
        // keep the stored IF half observable through raw word reads
        let word = self.devices.interrupt_control.ie_if_word();
        self.io.set_word(IE_OFFSET, word);
        if self.devices.halted && self.devices.interrupt_control.halt_wake_pending() {
            self.devices.halted = false;
        }
    }

    /// Advances timers and the display beam by `cycles`, routing overflow
    /// IRQs, blanking IRQs, and DMA triggers.
    pub fn step_devices(&mut self, cycles: u32) -> BeamEvents {
        self.cycle_count += u64::from(cycles);

        let overflows = self.devices.timers.step(cycles);
        let soundcnt_h = (self.io.word(SOUNDCNT_H_OFFSET) >> 16) as u16;
        for timer in 0..4 {
            if overflows.0[timer] == 0 {
                continue;
            }
            if self.devices.timers.irq_enabled(timer) {
                self.request_interrupt(Interrupt::timer(timer));
            }
            if timer < 2 {
                // sound FIFO DMA rides on timer 0/1 overflow, selected per
                // FIFO by SOUNDCNT_H bits 10 and 14
                if usize::from(soundcnt_h.get_bit(10)) == timer {
                    self.devices.dma.trigger_fifo(1);
                }
                if usize::from(soundcnt_h.get_bit(14)) == timer {
                    self.devices.dma.trigger_fifo(2);
                }
            }
        }

        let dispstat = self.io.word(hardware::display::DISPSTAT_OFFSET) as u16;
        let events = self.devices.display.step(cycles, dispstat >> 8);

        if events.hblanks > 0 {
            if dispstat.get_bit(4) {
                self.request_interrupt(Interrupt::HBlank);
            }
            self.devices.dma.trigger(StartTiming::HBlank);
        }
        if events.capture_hblanks > 0 {
            self.devices.dma.trigger_video_capture();
        }
        if events.vblank_start {
            if dispstat.get_bit(3) {
                self.request_interrupt(Interrupt::VBlank);
            }
            self.devices.dma.trigger(StartTiming::VBlank);
        }
        if events.vcount_matches > 0 && dispstat.get_bit(5) {
            self.request_interrupt(Interrupt::VCount);
        }

        events
    }

    // -----------------------------------------------------------------------
    // DMA runner
    // -----------------------------------------------------------------------

    /// Whether a pending DMA channel should preempt the CPU.
    #[must_use]
    pub fn dma_pending(&self) -> bool {
        self.devices.dma.highest_pending().is_some()
    }

    /// Drains all pending DMA channels in priority order. Returns the cycles
    /// the engine consumed mastering the bus.
    pub fn run_dma(&mut self, stop: &AtomicBool) -> u32 {
        let mut cycles = 0;
        while let Some(channel) = self.devices.dma.highest_pending() {
            cycles += self.run_dma_channel(channel, stop);
            if stop.load(Ordering::Relaxed) {
                break;
            }
        }
        cycles
    }

    fn run_dma_channel(&mut self, k: usize, stop: &AtomicBool) -> u32 {
        use crate::hardware::dma::AddressControl;

        let channel = &mut self.devices.dma.channels[k];
        channel.pending = false;

        let timing = channel.timing();
        let fifo = timing == StartTiming::Special && (k == 1 || k == 2);
        let word_transfer = fifo || channel.word_transfer();
        let unit: u32 = if word_transfer { 4 } else { 2 };
        let count = if fifo { 4 } else { channel.count };
        let source_control = channel.source_control();
        let destination_control = if fifo {
            AddressControl::Fixed
        } else {
            channel.destination_control()
        };
        let repeat = channel.repeat();
        let irq_on_end = channel.irq_on_end();
        let mut source = channel.source;
        let mut destination = channel.destination;

        let mut cycles = 2;
        let mut transferred = 0;
        while transferred < count {
            // a higher-priority channel armed mid-transfer wins the bus
            if let Some(higher) = self.devices.dma.highest_pending()
                && higher < k
            {
                cycles += self.run_dma_channel(higher, stop);
                continue;
            }
            if stop.load(Ordering::Relaxed) {
                break;
            }

            if word_transfer {
                let value = self.read_word(source & !3);
                self.write_word(destination & !3, value);
            } else {
                let value = self.read_half_word(source & !1);
                self.write_half_word(destination & !1, value);
            }

            source = step_address(source, source_control, unit);
            destination = step_address(destination, destination_control, unit);
            cycles += 2;
            transferred += 1;
        }

        let channel = &mut self.devices.dma.channels[k];
        channel.source = source;
        channel.destination = destination;

        let still_enabled = channel.enabled();
        if repeat && timing != StartTiming::Immediate && still_enabled {
            // refresh the count (and the destination, for inc-reload) from
            // the register bank for the next trigger
            let raw_count = self.io.word(dma::cnt_offset(k));
            self.devices.dma.channels[k].count = dma::effective_count(k, raw_count);
            if destination_control == AddressControl::IncrementReload {
                let raw_destination = self.io.word(dma::dad_offset(k));
                self.devices.dma.channels[k].destination =
                    raw_destination & dma::destination_mask(k);
            }
        } else {
            self.devices.dma.channels[k].control.set_bit_off(15);
            self.devices.dma.channels[k].pending = false;
            let cnt = self.io.word(dma::cnt_offset(k));
            self.io.set_word(dma::cnt_offset(k), cnt & !0x8000_0000);
        }

        if irq_on_end {
            self.request_interrupt(Interrupt::dma(k));
        }

        cycles
    }
}

const fn step_address(address: u32, control: dma::AddressControl, unit: u32) -> u32 {
    use crate::hardware::dma::AddressControl;
    match control {
        AddressControl::Increment | AddressControl::IncrementReload => address.wrapping_add(unit),
        AddressControl::Decrement => address.wrapping_sub(unit),
        AddressControl::Fixed => address,
    }
}
