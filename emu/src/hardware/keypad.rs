//! Keypad input: KEYINPUT and KEYCNT.
//!
//! KEYINPUT is active-low (1 = released). The snapshot is refreshed once per
//! V-blank from the frontend's input source; guest reads go through an
//! on-read observer so the stored word never holds stale state. KEYCNT can
//! raise the keypad interrupt on a logical-OR or logical-AND button match.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::io_registers::{IoAccess, IoRegisters, IoWords};

use super::Devices;

/// I/O offset of the KEYINPUT/KEYCNT word.
pub const KEYINPUT_OFFSET: usize = 0x130;

/// All ten button bits.
pub const BUTTON_MASK: u16 = 0x03FF;

#[derive(Serialize, Deserialize)]
pub struct Keypad {
    /// KEYINPUT: 0 = pressed, 1 = released.
    pub key_input: u16,
    /// KEYCNT: interrupt mask and mode.
    pub control: u16,
}

impl Default for Keypad {
    fn default() -> Self {
        Self {
            key_input: BUTTON_MASK,
            control: 0,
        }
    }
}

impl Keypad {
    /// Updates the snapshot from a pressed-buttons bitfield (1 = pressed).
    pub fn set_pressed(&mut self, pressed: u16) {
        self.key_input = !pressed & BUTTON_MASK;
    }

    /// KEYCNT condition: bit 14 enables the interrupt, bit 15 selects AND
    /// (all selected buttons down) over OR (any selected button down).
    #[must_use]
    pub fn irq_condition_met(&self) -> bool {
        if self.control.is_bit_off(14) {
            return false;
        }
        let selected = self.control & BUTTON_MASK;
        let pressed = !self.key_input & BUTTON_MASK;
        if self.control.get_bit(15) {
            selected != 0 && pressed & selected == selected
        } else {
            pressed & selected != 0
        }
    }
}

pub(super) fn install_hooks(io: &mut IoRegisters) {
    io.on_read(KEYINPUT_OFFSET, keyinput_read);
    io.on_post_write(KEYINPUT_OFFSET, keycnt_post_write);
}

fn keyinput_read(devices: &mut Devices, _: IoAccess, value: &mut u32) {
    *value = (*value & 0xFFFF_0000) | u32::from(devices.keypad.key_input);
}

fn keycnt_post_write(devices: &mut Devices, _: &mut IoWords, access: IoAccess, _: u32, new: u32) {
    if access.mask & 0xFFFF_0000 != 0 {
        devices.keypad.control = (new >> 16) as u16;
    }
}
