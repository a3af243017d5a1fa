//! LCD beam timing: scanlines, H-blank/V-blank edges, VCOUNT.
//!
//! No pixels are produced here; the beam exists because the rest of the
//! machine is clocked off it. A dot takes 4 CPU cycles; a scanline is 240
//! visible dots plus 68 H-blank dots; a frame is 160 visible scanlines plus
//! 68 V-blank scanlines:
//!
//! ```text
//! |<------- 960 cycles ------->|<-- 272 -->|
//! |        visible dots        |  H-blank  |   x 228 lines (160 visible)
//! ```
//!
//! DISPSTAT (`0x004`): bit 0 V-blank flag, bit 1 H-blank flag, bit 2 V-count
//! match flag (all patched on read), bits 3-5 the matching IRQ enables, bits
//! 8-15 the V-count match target. VCOUNT (`0x006`) reads the live scanline.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::io_registers::{IoAccess, IoRegisters};

use super::Devices;

/// I/O offset of the DISPSTAT/VCOUNT word.
pub const DISPSTAT_OFFSET: usize = 0x004;

pub const CYCLES_PER_SCANLINE: u32 = 1232;
pub const VISIBLE_CYCLES_PER_SCANLINE: u32 = 960;
pub const SCANLINES_PER_FRAME: u16 = 228;
pub const VISIBLE_SCANLINES: u16 = 160;

/// Edges produced by one beam step. A long delta (a DMA burst) can cross
/// several scanlines, so H-blank style edges are counts, not flags.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct BeamEvents {
    pub hblanks: u32,
    /// H-blanks inside the video-capture window (scanlines 2..=161).
    pub capture_hblanks: u32,
    pub vblank_start: bool,
    pub vcount_matches: u32,
    pub frame_complete: bool,
}

#[derive(Default, Serialize, Deserialize)]
pub struct DisplayBeam {
    scanline: u16,
    cycle_in_line: u32,
    in_hblank: bool,
}

impl DisplayBeam {
    #[must_use]
    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    #[must_use]
    pub fn in_vblank(&self) -> bool {
        self.scanline >= VISIBLE_SCANLINES
    }

    #[must_use]
    pub fn in_hblank(&self) -> bool {
        self.in_hblank
    }

    /// Advances the beam by `cycles`, reporting every edge crossed.
    pub fn step(&mut self, cycles: u32, vcount_target: u16) -> BeamEvents {
        let mut events = BeamEvents::default();
        self.cycle_in_line += cycles;

        loop {
            if !self.in_hblank && self.cycle_in_line >= VISIBLE_CYCLES_PER_SCANLINE {
                self.in_hblank = true;
                events.hblanks += 1;
                if (2..=161).contains(&self.scanline) {
                    events.capture_hblanks += 1;
                }
            }
            if self.cycle_in_line < CYCLES_PER_SCANLINE {
                break;
            }

            self.cycle_in_line -= CYCLES_PER_SCANLINE;
            self.in_hblank = false;
            self.scanline += 1;
            if self.scanline == VISIBLE_SCANLINES {
                events.vblank_start = true;
            }
            if self.scanline == SCANLINES_PER_FRAME {
                self.scanline = 0;
                events.frame_complete = true;
            }
            if self.scanline == vcount_target {
                events.vcount_matches += 1;
            }
        }
        events
    }
}

pub(super) fn install_hooks(io: &mut IoRegisters) {
    io.on_read(DISPSTAT_OFFSET, dispstat_vcount_read);
}

/// Patches the DISPSTAT status bits and the VCOUNT half with live beam state.
fn dispstat_vcount_read(devices: &mut Devices, _: IoAccess, value: &mut u32) {
    let beam = &devices.display;
    let mut dispstat = (*value & 0xFFF8) as u16;
    let vcount_target = dispstat >> 8;
    dispstat.set_bit(0, beam.in_vblank() && beam.scanline() != SCANLINES_PER_FRAME - 1);
    dispstat.set_bit(1, beam.in_hblank());
    dispstat.set_bit(2, beam.scanline() == vcount_target);
    *value = u32::from(dispstat) | (u32::from(beam.scanline()) << 16);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hblank_edge_at_visible_end() {
        let mut beam = DisplayBeam::default();

        let events = beam.step(959, 0xFF);
        assert_eq!(events.hblanks, 0);
        assert!(!beam.in_hblank());

        let events = beam.step(1, 0xFF);
        assert_eq!(events.hblanks, 1);
        assert!(beam.in_hblank());
    }

    #[test]
    fn scanline_advances_every_1232_cycles() {
        let mut beam = DisplayBeam::default();
        beam.step(CYCLES_PER_SCANLINE * 3, 0xFF);
        assert_eq!(beam.scanline(), 3);
        assert!(!beam.in_hblank());
    }

    #[test]
    fn vblank_starts_at_line_160() {
        let mut beam = DisplayBeam::default();
        let events = beam.step(CYCLES_PER_SCANLINE * u32::from(VISIBLE_SCANLINES), 0xFF);
        assert!(events.vblank_start);
        assert!(beam.in_vblank());
        assert_eq!(events.hblanks, u32::from(VISIBLE_SCANLINES));
    }

    #[test]
    fn frame_wraps_after_228_lines() {
        let mut beam = DisplayBeam::default();
        let events = beam.step(CYCLES_PER_SCANLINE * u32::from(SCANLINES_PER_FRAME), 0xFF);
        assert!(events.frame_complete);
        assert_eq!(beam.scanline(), 0);
    }

    #[test]
    fn vcount_match_reported_per_target_line() {
        let mut beam = DisplayBeam::default();
        let events = beam.step(CYCLES_PER_SCANLINE * 10, 7);
        assert_eq!(events.vcount_matches, 1);
    }

    #[test]
    fn capture_window_excludes_first_lines() {
        let mut beam = DisplayBeam::default();
        let events = beam.step(CYCLES_PER_SCANLINE * 4, 0xFF);
        // h-blanks on lines 0..=3; capture window covers lines 2 and 3
        assert_eq!(events.hblanks, 4);
        assert_eq!(events.capture_hblanks, 2);
    }

    #[test]
    fn dispstat_read_reflects_beam_state() {
        let mut io = IoRegisters::default();
        install_hooks(&mut io);
        let mut devices = Devices::default();

        io.set_word(DISPSTAT_OFFSET, 0x0500); // vcount target 5
        devices.display.step(CYCLES_PER_SCANLINE * 5, 5);

        let dispstat = io.read(&mut devices, DISPSTAT_OFFSET, 2);
        assert_eq!(dispstat & 0b111, 0b100, "vcount match only");
        assert_eq!(io.read(&mut devices, DISPSTAT_OFFSET + 2, 2), 5);
    }
}
