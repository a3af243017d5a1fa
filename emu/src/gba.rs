//! The assembled machine and its scheduler.
//!
//! [`Gba`] is a plain value: it owns the CPU, which owns the bus, which owns
//! every memory region and device. An outer loop drives it through
//! [`Gba::run_frame`] and talks to the world through three collaborator
//! traits:
//!
//! - [`FrameSink`] receives the 240×160 frame buffer once per V-blank;
//! - [`AudioSink`] receives interleaved stereo samples (this core synthesizes
//!   none — there is no sound DSP — but frontends program against the trait);
//! - [`InputSource`] is polled at each V-blank for the button bitfield and
//!   the quick-save request.
//!
//! One scheduler tick:
//!
//! 1. Pending DMA preempts the CPU and runs to completion (priority order).
//! 2. Otherwise the CPU takes the IRQ vector if the interrupt controller has
//!    a pending enabled line, then executes one instruction; a halted CPU
//!    burns a small cycle quantum instead.
//! 3. Timers and the display beam advance by the same delta, which can arm
//!    DMA channels and raise interrupts for the next tick.
//!
//! Because I/O observers run inside the triggering store, a store that
//! enables an immediate DMA channel is followed by the DMA transfer before
//! the CPU's next instruction.
//!
//! The [`stop handle`](Gba::stop_handle) is checked between instructions
//! (and between DMA units) for prompt cooperative shutdown from another
//! thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bus::Bus;
use crate::cartridge::GamePak;
use crate::cartridge::header::CartridgeHeader;
use crate::cartridge::save::SaveBackend;
use crate::cpu::arm7tdmi::Arm7tdmi;
use crate::error::{BIOS_SIZE, CoreError};
use crate::hardware::display::BeamEvents;
use crate::hardware::interrupt_control::Interrupt;

pub const DISPLAY_WIDTH: usize = 240;
pub const DISPLAY_HEIGHT: usize = 160;
pub const FRAME_PIXELS: usize = DISPLAY_WIDTH * DISPLAY_HEIGHT;

/// Cycles a halted CPU skips per scheduler tick while waiting for a wake-up.
const HALT_QUANTUM: u32 = 32;

/// Button bits of the [`InputState::keys`] bitfield.
pub mod keys {
    pub const A: u16 = 1 << 0;
    pub const B: u16 = 1 << 1;
    pub const SELECT: u16 = 1 << 2;
    pub const START: u16 = 1 << 3;
    pub const RIGHT: u16 = 1 << 4;
    pub const LEFT: u16 = 1 << 5;
    pub const UP: u16 = 1 << 6;
    pub const DOWN: u16 = 1 << 7;
    pub const R: u16 = 1 << 8;
    pub const L: u16 = 1 << 9;
}

pub trait FrameSink {
    /// Called once per V-blank with the completed frame.
    fn vblank(&mut self, frame: &[u16; FRAME_PIXELS]);
}

pub trait AudioSink {
    /// Interleaved stereo samples. Backpressure by dropping is acceptable.
    fn push_samples(&mut self, samples: &[i16]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InputState {
    /// Pressed buttons, 1 = down, per [`keys`].
    pub keys: u16,
    pub quick_save: bool,
}

pub trait InputSource {
    fn poll(&mut self) -> InputState;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameEvents {
    pub quick_save_requested: bool,
}

pub struct Gba {
    pub cpu: Arm7tdmi,
    frame: Box<[u16; FRAME_PIXELS]>,
    stop: Arc<AtomicBool>,
}

impl Gba {
    /// Builds the machine around a 16 KiB BIOS image and a cartridge ROM.
    /// Execution starts at the reset vector, like the hardware.
    pub fn new(bios: &[u8], rom: &[u8]) -> Result<Self, CoreError> {
        if bios.len() != BIOS_SIZE {
            return Err(CoreError::BiosSize(bios.len()));
        }
        let gamepak = GamePak::new(rom)?;
        Ok(Self {
            cpu: Arm7tdmi::new(Bus::new(bios, gamepak)),
            frame: Box::new([0; FRAME_PIXELS]),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Like [`Gba::new`], restoring the save memory from a save-file
    /// container instead of detecting an empty backend.
    pub fn with_save_data(bios: &[u8], rom: &[u8], save: &[u8]) -> Result<Self, CoreError> {
        if bios.len() != BIOS_SIZE {
            return Err(CoreError::BiosSize(bios.len()));
        }
        let gamepak = GamePak::with_save_data(rom, save)?;
        Ok(Self {
            cpu: Arm7tdmi::new(Bus::new(bios, gamepak)),
            frame: Box::new([0; FRAME_PIXELS]),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Skips the BIOS boot sequence and starts at the cartridge entry.
    pub fn boot_from_gamepak(&mut self) {
        self.cpu.boot_from_gamepak();
    }

    #[must_use]
    pub fn header(&self) -> &CartridgeHeader {
        self.cpu.bus.gamepak.header()
    }

    /// A handle another thread can set to stop [`Gba::run_frame`] promptly.
    #[must_use]
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Serializes the save memory into its container for persistence.
    #[must_use]
    pub fn save_data(&self) -> Vec<u8> {
        self.cpu.bus.gamepak.save.to_save_bytes()
    }

    pub fn restore_save_data(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.cpu.bus.gamepak.save = SaveBackend::from_save_bytes(bytes)?;
        Ok(())
    }

    /// One scheduler tick: DMA, or one CPU instruction, or a halt quantum;
    /// then device catch-up.
    pub fn step(&mut self) -> BeamEvents {
        let cycles = if self.cpu.bus.dma_pending() {
            self.cpu.bus.run_dma(&self.stop)
        } else if self.cpu.bus.devices.halted {
            HALT_QUANTUM
        } else {
            let irq_pending = self.cpu.bus.devices.interrupt_control.irq_pending();
            if irq_pending && self.cpu.irq_ready() {
                self.cpu.raise_irq();
            }
            self.cpu.step()
        };

        let events = self.cpu.bus.step_devices(cycles);

        // halt wake-up: any enabled pending flag, IME and CPSR.I regardless
        if self.cpu.bus.devices.halted
            && self.cpu.bus.devices.interrupt_control.halt_wake_pending()
        {
            self.cpu.bus.devices.halted = false;
        }
        events
    }

    /// Runs the machine for one video frame (228 scanlines).
    pub fn run_frame(
        &mut self,
        sink: &mut dyn FrameSink,
        input: &mut dyn InputSource,
    ) -> FrameEvents {
        let mut frame_events = FrameEvents::default();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let events = self.step();
            if events.vblank_start {
                let state = input.poll();
                self.cpu.bus.devices.keypad.set_pressed(state.keys);
                if self.cpu.bus.devices.keypad.irq_condition_met() {
                    self.cpu.bus.request_interrupt(Interrupt::Keypad);
                }
                frame_events.quick_save_requested |= state.quick_save;
                sink.vblank(&self.frame);
            }
            if events.frame_complete {
                break;
            }
        }
        frame_events
    }
}
