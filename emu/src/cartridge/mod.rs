//! The Game Pak: ROM, cartridge header, and save memory.
//!
//! The pak answers the bus for the `0x08..=0x0F` high bytes:
//!
//! - `0x08..=0x0D`: ROM, masked to the 32 MiB window. Reads past the loaded
//!   image return `None` — the Game Pak bus floats and the
//!   [`Bus`](crate::bus::Bus) substitutes its open-bus value.
//! - `0x0D`, 16-bit accesses: the EEPROM trigger window when an EEPROM is
//!   present (the whole mirror on small ROMs, the top 256 bytes on ROMs
//!   larger than 16 MiB).
//! - `0x0E..=0x0F`: SRAM/Flash on an 8-bit port; wider accesses see the
//!   addressed byte duplicated into every lane.

pub mod header;
pub mod save;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, MAX_ROM_SIZE};

use header::CartridgeHeader;
use save::SaveBackend;

/// ROM offsets wrap through the 32 MiB Game Pak window.
pub const ROM_MASK: u32 = 0x01FF_FFFF;

/// ROMs above this size shrink the EEPROM trigger window to the top of the
/// `0x0D` mirror.
const LARGE_ROM_THRESHOLD: usize = 0x0100_0000;

#[derive(Serialize, Deserialize)]
pub struct GamePak {
    rom: Vec<u8>,
    header: CartridgeHeader,
    pub save: SaveBackend,
}

impl GamePak {
    pub fn new(rom: &[u8]) -> Result<Self, CoreError> {
        if rom.len() > MAX_ROM_SIZE {
            return Err(CoreError::RomOversize(rom.len()));
        }
        let header = CartridgeHeader::parse(rom)?;
        let save = SaveBackend::detect(rom);
        tracing::debug!(
            "loaded \"{}\" ({}), save backend: {}",
            header.game_title,
            header.game_code,
            save.kind_name(),
        );

        Ok(Self {
            rom: rom.to_vec(),
            header,
            save,
        })
    }

    /// Builds the pak and restores the save memory from a save-file
    /// container, overriding signature detection.
    pub fn with_save_data(rom: &[u8], save_bytes: &[u8]) -> Result<Self, CoreError> {
        let mut pak = Self::new(rom)?;
        pak.save = SaveBackend::from_save_bytes(save_bytes)?;
        Ok(pak)
    }

    #[must_use]
    pub fn header(&self) -> &CartridgeHeader {
        &self.header
    }

    #[must_use]
    pub fn rom(&self) -> &[u8] {
        &self.rom
    }

    fn rom_offset(address: u32) -> usize {
        (address & ROM_MASK) as usize
    }

    /// 16-bit accesses here talk to the EEPROM instead of the ROM.
    fn in_eeprom_window(&self, address: u32) -> bool {
        if !matches!(self.save, SaveBackend::Eeprom(_)) || address >> 24 != 0x0D {
            return false;
        }
        self.rom.len() <= LARGE_ROM_THRESHOLD || address & 0x00FF_FFFF >= 0x00FF_FF00
    }

    /// `None` is an out-of-ROM read: open bus, filled in by the caller.
    #[must_use]
    pub fn read_byte(&self, address: u32) -> Option<u8> {
        match address >> 24 {
            0x08..=0x0D => self.rom.get(Self::rom_offset(address)).copied(),
            0x0E | 0x0F => Some(self.save.read_byte((address & 0xFFFF) as usize)),
            _ => None,
        }
    }

    #[must_use]
    pub fn read_half_word(&mut self, address: u32) -> Option<u16> {
        if self.in_eeprom_window(address) {
            if let SaveBackend::Eeprom(eeprom) = &mut self.save {
                return Some(eeprom.read_half_word());
            }
        }
        match address >> 24 {
            0x0E | 0x0F => {
                let byte = self.save.read_byte((address & 0xFFFF) as usize);
                Some(u16::from_le_bytes([byte, byte]))
            }
            _ => {
                let offset = Self::rom_offset(address) & !1;
                let low = *self.rom.get(offset)?;
                let high = *self.rom.get(offset + 1)?;
                Some(u16::from_le_bytes([low, high]))
            }
        }
    }

    /// Only 16-bit accesses reach the EEPROM window; a word read there is a
    /// plain ROM access and must not disturb the serial stream.
    #[must_use]
    pub fn read_word(&self, address: u32) -> Option<u32> {
        if address >> 24 == 0x0E || address >> 24 == 0x0F {
            let byte = self.save.read_byte((address & 0xFFFF) as usize);
            return Some(u32::from_le_bytes([byte; 4]));
        }
        let offset = Self::rom_offset(address) & !3;
        let mut value = 0;
        for lane in (0..4).rev() {
            value = (value << 8) | u32::from(*self.rom.get(offset + lane)?);
        }
        Some(value)
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        match address >> 24 {
            0x0E | 0x0F => self.save.write_byte((address & 0xFFFF) as usize, value),
            _ => tracing::debug!("dropped byte write to ROM at {address:#010X}"),
        }
    }

    pub fn write_half_word(&mut self, address: u32, value: u16) {
        if self.in_eeprom_window(address) {
            if let SaveBackend::Eeprom(eeprom) = &mut self.save {
                eeprom.write_half_word(value);
                return;
            }
        }
        match address >> 24 {
            // 8-bit port: the lane matching the address is stored
            0x0E | 0x0F => self.save.write_byte(
                (address & 0xFFFF) as usize,
                (value >> ((address & 1) * 8)) as u8,
            ),
            _ => tracing::debug!("dropped halfword write to ROM at {address:#010X}"),
        }
    }

    pub fn write_word(&mut self, address: u32, value: u32) {
        match address >> 24 {
            0x0E | 0x0F => self.save.write_byte(
                (address & 0xFFFF) as usize,
                (value >> ((address & 3) * 8)) as u8,
            ),
            _ => tracing::debug!("dropped word write to ROM at {address:#010X}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_rom(len: usize) -> Vec<u8> {
        let mut rom = crate::cartridge::header::tests::rom_with_header("GAMEPAK");
        rom.resize(len, 0);
        for (i, byte) in rom.iter_mut().enumerate().skip(0xC0) {
            *byte = (i & 0xFF) as u8;
        }
        rom
    }

    #[test]
    fn rom_reads_mirror_across_wait_state_regions() {
        let mut pak = GamePak::new(&test_rom(0x1000)).unwrap();

        assert_eq!(pak.read_byte(0x0800_0123), Some(0x23));
        assert_eq!(pak.read_byte(0x0A00_0123), Some(0x23));
        assert_eq!(pak.read_byte(0x0C00_0123), Some(0x23));
        assert_eq!(
            pak.read_half_word(0x0800_0124),
            Some(u16::from_le_bytes([0x24, 0x25]))
        );
    }

    #[test]
    fn out_of_rom_reads_are_open_bus() {
        let pak = GamePak::new(&test_rom(0x1000)).unwrap();

        assert_eq!(pak.read_byte(0x0800_2000), None);
        assert_eq!(pak.read_word(0x0900_0000), None);
    }

    #[test]
    fn rom_writes_are_dropped() {
        let mut pak = GamePak::new(&test_rom(0x1000)).unwrap();
        pak.write_word(0x0800_0100, 0xFFFF_FFFF);
        assert_eq!(pak.read_byte(0x0800_0100), Some(0x00));
    }

    #[test]
    fn sram_window_duplicates_bytes_on_wide_reads() {
        let mut pak = GamePak::new(&test_rom(0x1000)).unwrap();
        pak.write_byte(0x0E00_0010, 0x7E);

        assert_eq!(pak.read_half_word(0x0E00_0010), Some(0x7E7E));
        assert_eq!(pak.read_word(0x0E00_0010), Some(0x7E7E_7E7E));
    }

    #[test]
    fn oversize_rom_is_rejected() {
        let rom = vec![0; MAX_ROM_SIZE + 1];
        assert!(matches!(
            GamePak::new(&rom),
            Err(CoreError::RomOversize(_))
        ));
    }

    #[test]
    fn eeprom_window_spans_the_mirror_on_small_roms() {
        let mut rom = test_rom(0x1000);
        rom[0x200..0x208].copy_from_slice(b"EEPROM_V");
        let pak = GamePak::new(&rom).unwrap();

        assert!(pak.in_eeprom_window(0x0D00_0000));
        assert!(pak.in_eeprom_window(0x0DFF_FFFE));
        assert!(!pak.in_eeprom_window(0x0C00_0000));
    }

    #[test]
    fn eeprom_idle_reads_report_ready() {
        let mut rom = test_rom(0x1000);
        rom[0x200..0x208].copy_from_slice(b"EEPROM_V");
        let mut pak = GamePak::new(&rom).unwrap();

        assert_eq!(pak.read_half_word(0x0D00_0000), Some(1));
    }

    #[test]
    fn word_reads_in_the_eeprom_window_do_not_touch_the_eeprom() {
        let mut rom = test_rom(0x1000);
        rom[0x200..0x208].copy_from_slice(b"EEPROM_V");
        let mut pak = GamePak::new(&rom).unwrap();

        // queue a read command (start, read, 6-bit address 0, terminator)
        // so the serial stream has a position to lose
        for bit in [1u16, 1, 0, 0, 0, 0, 0, 0, 0] {
            pak.write_half_word(0x0D00_0000, bit);
        }

        // a stray word fetch in the window is a ROM access (past the image
        // here, so open bus), never an EEPROM access
        assert_eq!(pak.read_word(0x0D00_0100), None);
        assert_eq!(pak.read_byte(0x0D00_0100), None);

        // the queued command is intact: the turnaround still sees all four
        // leading dummy bits
        for _ in 0..4 {
            assert_eq!(pak.read_half_word(0x0D00_0000), Some(0));
        }
    }
}
