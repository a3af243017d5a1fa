//! DMA channel state and the trigger bus.
//!
//! Register block per channel `k` (stride 12 bytes from `0xB0`):
//!
//! | Offset        | Register                                  |
//! |---------------|-------------------------------------------|
//! | `0xB0 + 12k`  | source address (27 bits, 28 on 1-3)       |
//! | `0xB4 + 12k`  | destination address (27 bits, 28 on 3)    |
//! | `0xB8 + 12k`  | word count (14 bits, 16 on 3) + control   |
//!
//! Control bits: 5-6 destination step, 7-8 source step, 9 repeat, 10 transfer
//! size, 12-13 start timing, 14 end IRQ, 15 enable.
//!
//! When the enable bit rises, the channel latches source, destination, and
//! effective count (0 means full range) from the register bank; an immediate
//! channel becomes pending on the spot — the post-write observer runs inside
//! the enabling store, so the CPU is already paused for the very next cycle.
//! Triggered timings ([`Dma::trigger`]) set the pending bit when their event
//! fires. The runner in [`Bus`](crate::bus::Bus) drains pending channels in
//! priority order (0 highest).

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::io_registers::{IoAccess, IoRegisters, IoWords};

use super::Devices;

/// I/O offset of DMA0SAD, the start of the DMA register block.
pub const DMA0SAD_OFFSET: usize = 0xB0;

pub const CHANNEL_COUNT: usize = 4;

#[must_use]
pub const fn sad_offset(channel: usize) -> usize {
    DMA0SAD_OFFSET + channel * 12
}

#[must_use]
pub const fn dad_offset(channel: usize) -> usize {
    DMA0SAD_OFFSET + 4 + channel * 12
}

#[must_use]
pub const fn cnt_offset(channel: usize) -> usize {
    DMA0SAD_OFFSET + 8 + channel * 12
}

/// Destination/source address stepping, control bits 5-6 and 7-8.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AddressControl {
    Increment,
    Decrement,
    Fixed,
    /// Increment during the transfer, reload the latch when a repeating
    /// transfer completes. Destination only.
    IncrementReload,
}

impl From<u16> for AddressControl {
    fn from(bits: u16) -> Self {
        match bits & 0b11 {
            0 => Self::Increment,
            1 => Self::Decrement,
            2 => Self::Fixed,
            _ => Self::IncrementReload,
        }
    }
}

/// Start timing, control bits 12-13. `Special` is sound FIFO on channels 1
/// and 2 and video capture on channel 3.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StartTiming {
    Immediate,
    VBlank,
    HBlank,
    Special,
}

impl From<u16> for StartTiming {
    fn from(bits: u16) -> Self {
        match bits & 0b11 {
            0 => Self::Immediate,
            1 => Self::VBlank,
            2 => Self::HBlank,
            _ => Self::Special,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Channel {
    pub control: u16,
    /// Latched at the enable edge; stepped during transfers.
    pub source: u32,
    pub destination: u32,
    /// Latched effective unit count (0 in the register means full range).
    pub count: u32,
    pub pending: bool,
}

impl Channel {
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.control.get_bit(15)
    }

    #[must_use]
    pub fn repeat(&self) -> bool {
        self.control.get_bit(9)
    }

    #[must_use]
    pub fn word_transfer(&self) -> bool {
        self.control.get_bit(10)
    }

    #[must_use]
    pub fn irq_on_end(&self) -> bool {
        self.control.get_bit(14)
    }

    #[must_use]
    pub fn timing(&self) -> StartTiming {
        StartTiming::from(self.control.get_bits(12..=13))
    }

    #[must_use]
    pub fn destination_control(&self) -> AddressControl {
        AddressControl::from(self.control.get_bits(5..=6))
    }

    #[must_use]
    pub fn source_control(&self) -> AddressControl {
        // inc-and-reload is not a source encoding; hardware treats it as inc
        match AddressControl::from(self.control.get_bits(7..=8)) {
            AddressControl::IncrementReload => AddressControl::Increment,
            control => control,
        }
    }
}

#[must_use]
pub(crate) const fn source_mask(channel: usize) -> u32 {
    if channel == 0 { 0x07FF_FFFF } else { 0x0FFF_FFFF }
}

#[must_use]
pub(crate) const fn destination_mask(channel: usize) -> u32 {
    if channel == 3 { 0x0FFF_FFFF } else { 0x07FF_FFFF }
}

/// Maps a raw register count to the effective unit count.
#[must_use]
pub const fn effective_count(channel: usize, raw: u32) -> u32 {
    let (mask, full) = if channel == 3 {
        (0xFFFF, 0x1_0000)
    } else {
        (0x3FFF, 0x4000)
    };
    let count = raw & mask;
    if count == 0 { full } else { count }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Dma {
    pub channels: [Channel; CHANNEL_COUNT],
}

impl Dma {
    /// The highest-priority pending channel, if any. Channel 0 wins.
    #[must_use]
    pub fn highest_pending(&self) -> Option<usize> {
        (0..CHANNEL_COUNT).find(|&k| self.channels[k].pending)
    }

    /// V-blank / H-blank edges from the display beam.
    pub fn trigger(&mut self, timing: StartTiming) {
        for channel in &mut self.channels {
            if channel.enabled() && channel.timing() == timing {
                channel.pending = true;
            }
        }
    }

    /// Sound FIFO request for channel 1 or 2 (timer overflow driven).
    pub fn trigger_fifo(&mut self, channel: usize) {
        debug_assert!(channel == 1 || channel == 2);
        let channel = &mut self.channels[channel];
        if channel.enabled() && channel.timing() == StartTiming::Special {
            channel.pending = true;
        }
    }

    /// Video capture request for channel 3, once per captured scanline.
    pub fn trigger_video_capture(&mut self) {
        let channel = &mut self.channels[3];
        if channel.enabled() && channel.timing() == StartTiming::Special {
            channel.pending = true;
        }
    }
}

pub(super) fn install_hooks(io: &mut IoRegisters) {
    for k in 0..CHANNEL_COUNT {
        io.on_post_write(cnt_offset(k), control_post_write);
    }
}

const DMA0CNT_INDEX: usize = cnt_offset(0) / 4;

/// Classifies the channel after every control-word write and latches the
/// transfer registers on the enable edge.
fn control_post_write(devices: &mut Devices, words: &mut IoWords, access: IoAccess, old: u32, new: u32) {
    let k = (access.index - DMA0CNT_INDEX) / 3;

    let was_enabled = (old >> 16).get_bit(15);
    let channel = &mut devices.dma.channels[k];
    channel.control = (new >> 16) as u16;

    if channel.enabled() && !was_enabled {
        channel.source = words[sad_offset(k) / 4] & source_mask(k);
        channel.destination = words[dad_offset(k) / 4] & destination_mask(k);
        channel.count = effective_count(k, new);
        if channel.timing() == StartTiming::Immediate {
            channel.pending = true;
        }
        tracing::debug!(
            "DMA{k} armed: {:#010X} -> {:#010X} x{} ({:?})",
            channel.source,
            channel.destination,
            channel.count,
            channel.timing(),
        );
    }
    if !channel.enabled() {
        channel.pending = false;
    }
}
