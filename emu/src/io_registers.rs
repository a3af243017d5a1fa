//! The monitored I/O register fabric at `0x0400_0000`.
//!
//! The 1 KiB register bank is stored as 256 aligned 32-bit words. Every
//! access, whatever its width, is normalized to a 32-bit read or
//! read-modify-write of the containing word:
//!
//! ```text
//! aligned = A & !3
//! shift   = (A & (4 - W)) * 8        W = access width in bytes
//! mask    = ((1 << W*8) - 1) << shift
//! ```
//!
//! Each word may carry up to three observers, registered once at wiring time:
//!
//! - **on-read** patches the live value before extraction (timer counters,
//!   VCOUNT, KEYINPUT, IF are computed, not stored);
//! - **pre-write** may consume the write entirely (write-1-to-clear IF,
//!   read-only words);
//! - **post-write** reacts to the committed value (DMA enable latching,
//!   timer control, IME, HALTCNT).
//!
//! Observers are plain `fn` pointers so the fabric stays agnostic of device
//! semantics; they receive the [`Devices`] bundle and the raw word bank,
//! which is all the hardware behind this bus window ever needs. The hook
//! tables are not serialized; [`Bus`](crate::bus::Bus) re-installs them after
//! a snapshot restore.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::hardware::Devices;

/// Number of 32-bit words in the I/O bank (1 KiB).
pub const IO_WORD_COUNT: usize = 256;

/// Byte size of the I/O window; offsets are taken modulo this.
pub const IO_SIZE: usize = IO_WORD_COUNT * 4;

pub type IoWords = [u32; IO_WORD_COUNT];

/// Normalized description of one access: the word index plus the shift and
/// mask selecting the accessed lanes within that word.
#[derive(Clone, Copy, Debug)]
pub struct IoAccess {
    pub index: usize,
    pub shift: u32,
    pub mask: u32,
}

impl IoAccess {
    #[must_use]
    pub fn new(offset: usize, width: usize) -> Self {
        debug_assert!(matches!(width, 1 | 2 | 4));
        let offset = offset & (IO_SIZE - 1);
        let shift = ((offset & (4 - width)) as u32) * 8;
        let mask = (width_mask(width)) << shift;
        Self {
            index: offset >> 2,
            shift,
            mask,
        }
    }
}

const fn width_mask(width: usize) -> u32 {
    match width {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => 0xFFFF_FFFF,
    }
}

pub type ReadHook = fn(&mut Devices, IoAccess, &mut u32);
pub type PreWriteHook = fn(&mut Devices, &mut IoWords, IoAccess, u32) -> bool;
pub type PostWriteHook = fn(&mut Devices, &mut IoWords, IoAccess, u32, u32);

pub struct IoHooks {
    on_read: [Option<ReadHook>; IO_WORD_COUNT],
    pre_write: [Option<PreWriteHook>; IO_WORD_COUNT],
    post_write: [Option<PostWriteHook>; IO_WORD_COUNT],
}

impl Default for IoHooks {
    fn default() -> Self {
        Self {
            on_read: [None; IO_WORD_COUNT],
            pre_write: [None; IO_WORD_COUNT],
            post_write: [None; IO_WORD_COUNT],
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct IoRegisters {
    #[serde_as(as = "Box<[_; 256]>")]
    words: Box<IoWords>,
    #[serde(skip)]
    hooks: IoHooks,
}

impl Default for IoRegisters {
    fn default() -> Self {
        Self {
            words: Box::new([0; IO_WORD_COUNT]),
            hooks: IoHooks::default(),
        }
    }
}

impl IoRegisters {
    /// Drops every registered observer. Used before re-wiring after a
    /// snapshot restore.
    pub fn clear_hooks(&mut self) {
        self.hooks = IoHooks::default();
    }

    /// Registers the on-read observer for the word containing `offset`.
    /// At most one observer per word per role.
    pub fn on_read(&mut self, offset: usize, hook: ReadHook) {
        let slot = &mut self.hooks.on_read[(offset & (IO_SIZE - 1)) >> 2];
        debug_assert!(slot.is_none());
        *slot = Some(hook);
    }

    pub fn on_pre_write(&mut self, offset: usize, hook: PreWriteHook) {
        let slot = &mut self.hooks.pre_write[(offset & (IO_SIZE - 1)) >> 2];
        debug_assert!(slot.is_none());
        *slot = Some(hook);
    }

    pub fn on_post_write(&mut self, offset: usize, hook: PostWriteHook) {
        let slot = &mut self.hooks.post_write[(offset & (IO_SIZE - 1)) >> 2];
        debug_assert!(slot.is_none());
        *slot = Some(hook);
    }

    /// Raw stored word, no observers. Used by devices latching sibling
    /// registers (DMA source/destination/count) and by tests.
    #[must_use]
    pub fn word(&self, offset: usize) -> u32 {
        self.words[(offset & (IO_SIZE - 1)) >> 2]
    }

    /// Raw store, no observers. Used by devices that publish state into the
    /// bank (DMA clearing its enable bit, interrupt flags).
    pub fn set_word(&mut self, offset: usize, value: u32) {
        self.words[(offset & (IO_SIZE - 1)) >> 2] = value;
    }

    /// A `width`-byte read at `offset`, returned zero-extended.
    pub fn read(&self, devices: &mut Devices, offset: usize, width: usize) -> u32 {
        let access = IoAccess::new(offset, width);
        let mut value = self.words[access.index];
        if let Some(hook) = self.hooks.on_read[access.index] {
            hook(devices, access, &mut value);
        }
        (value & access.mask) >> access.shift
    }

    /// A `width`-byte write of (zero-extended) `value` at `offset`.
    ///
    /// Bytes of the containing word outside the access mask are never
    /// disturbed. A pre-write observer returning `false` consumes the write.
    pub fn write(&mut self, devices: &mut Devices, offset: usize, value: u32, width: usize) {
        let access = IoAccess::new(offset, width);
        let shifted = (value & width_mask(width)) << access.shift;

        if let Some(hook) = self.hooks.pre_write[access.index]
            && !hook(devices, &mut self.words, access, shifted)
        {
            return;
        }

        let old = self.words[access.index];
        let new = (old & !access.mask) | (shifted & access.mask);
        self.words[access.index] = new;

        if let Some(hook) = self.hooks.post_write[access.index] {
            hook(devices, &mut self.words, access, old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_word_writes_assemble_a_word() {
        let mut io = IoRegisters::default();
        let mut devices = Devices::default();

        io.write(&mut devices, 0x14, 0xA1, 1);
        io.write(&mut devices, 0x15, 0xB2, 1);
        io.write(&mut devices, 0x16, 0xC3, 1);
        io.write(&mut devices, 0x17, 0xD4, 1);

        assert_eq!(io.read(&mut devices, 0x14, 4), 0xD4C3_B2A1);
    }

    #[test]
    fn byte_write_preserves_siblings() {
        let mut io = IoRegisters::default();
        let mut devices = Devices::default();
        io.set_word(0x0, 0x1122_3344);

        io.write(&mut devices, 0x1, 0xAA, 1);

        assert_eq!(io.word(0x0), 0x1122_AA44);
    }

    #[test]
    fn half_word_access_uses_lane_shift() {
        let mut io = IoRegisters::default();
        let mut devices = Devices::default();

        io.write(&mut devices, 0x22, 0xBEEF, 2);

        assert_eq!(io.word(0x20), 0xBEEF_0000);
        assert_eq!(io.read(&mut devices, 0x22, 2), 0xBEEF);
        assert_eq!(io.read(&mut devices, 0x20, 2), 0);
    }

    #[test]
    fn on_read_hook_patches_live_value() {
        fn live_counter(_: &mut Devices, _: IoAccess, value: &mut u32) {
            *value = (*value & 0xFFFF_0000) | 0x1234;
        }

        let mut io = IoRegisters::default();
        let mut devices = Devices::default();
        io.set_word(0x100, 0xABCD_0000);
        io.on_read(0x100, live_counter);

        assert_eq!(io.read(&mut devices, 0x100, 2), 0x1234);
        assert_eq!(io.read(&mut devices, 0x102, 2), 0xABCD);
        // the stored word is untouched
        assert_eq!(io.word(0x100), 0xABCD_0000);
    }

    #[test]
    fn pre_write_hook_can_consume_the_write() {
        fn read_only(_: &mut Devices, _: &mut IoWords, _: IoAccess, _: u32) -> bool {
            false
        }

        let mut io = IoRegisters::default();
        let mut devices = Devices::default();
        io.set_word(0x6, 0x5555_5555);
        io.on_pre_write(0x6, read_only);

        io.write(&mut devices, 0x6, 0xFFFF, 2);

        assert_eq!(io.word(0x6), 0x5555_5555);
    }

    #[test]
    fn post_write_hook_sees_old_and_new() {
        fn capture(devices: &mut Devices, _: &mut IoWords, _: IoAccess, old: u32, new: u32) {
            // the keypad snapshot doubles as a scratch cell for this test
            devices.keypad.key_input = (old >> 16) as u16 ^ new as u16;
        }

        let mut io = IoRegisters::default();
        let mut devices = Devices::default();
        io.set_word(0x40, 0xFFFF_0000);
        io.on_post_write(0x40, capture);

        io.write(&mut devices, 0x40, 0x00FF, 2);

        assert_eq!(io.word(0x40), 0xFFFF_00FF);
        assert_eq!(devices.keypad.key_input, 0xFFFF ^ 0x00FF);
    }
}
