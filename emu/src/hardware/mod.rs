//! Hardware behind the I/O register window.
//!
//! Each component owns the state a register bank cannot hold (latches,
//! counters, accumulated time) and contributes observers to the
//! [`IoRegisters`](crate::io_registers::IoRegisters) fabric. The bundle is a
//! plain struct so observers can borrow all of it mutably while the fabric
//! holds the word bank.
//!
//! | Module                | Registers observed                          |
//! |-----------------------|---------------------------------------------|
//! | [`display`]           | DISPSTAT/VCOUNT (read)                      |
//! | [`dma`]               | DMAxCNT (post-write)                        |
//! | [`timers`]            | TMxCNT (read + post-write)                  |
//! | [`keypad`]            | KEYINPUT (read), KEYCNT (post-write)        |
//! | [`interrupt_control`] | IE/IF (read + pre-write), IME, HALTCNT      |

pub mod display;
pub mod dma;
pub mod interrupt_control;
pub mod keypad;
pub mod timers;

use serde::{Deserialize, Serialize};

use crate::io_registers::IoRegisters;

use self::display::DisplayBeam;
use self::dma::Dma;
use self::interrupt_control::InterruptControl;
use self::keypad::Keypad;
use self::timers::Timers;

/// I/O offset of SOUNDCNT_H; bits 10 and 14 select the timer driving each
/// sound FIFO. The sound registers themselves are plain words (no DSP).
pub const SOUNDCNT_H_OFFSET: usize = 0x082;

#[derive(Default, Serialize, Deserialize)]
pub struct Devices {
    pub display: DisplayBeam,
    pub dma: Dma,
    pub timers: Timers,
    pub keypad: Keypad,
    pub interrupt_control: InterruptControl,
    /// Set by a HALTCNT write; cleared when an enabled interrupt flag rises.
    pub halted: bool,
}

/// Registers every device observer. Called at construction and again after
/// a snapshot restore (hook tables are not serialized).
pub fn install_hooks(io: &mut IoRegisters) {
    display::install_hooks(io);
    dma::install_hooks(io);
    timers::install_hooks(io);
    keypad::install_hooks(io);
    interrupt_control::install_hooks(io);
}
