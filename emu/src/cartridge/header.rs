//! Cartridge header parsing.
//!
//! The first 192 bytes of a Game Pak hold the entry branch, the Nintendo
//! logo bitmap, and the game identification block. Only the identification
//! fields matter to the core; the header complement check is verified the
//! way the BIOS does it (a bad checksum is reported, not fatal — homebrew
//! rarely bothers).

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Size of the header block at the start of every ROM.
pub const HEADER_SIZE: usize = 0xC0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartridgeHeader {
    /// Uppercase ASCII, up to 12 characters.
    pub game_title: String,
    /// Uppercase ASCII, 4 characters (UTTD code).
    pub game_code: String,
    /// Uppercase ASCII, 2 characters.
    pub maker_code: String,
    /// Must be `0x96` on licensed cartridges.
    pub fixed_value: u8,
    pub software_version: u8,
    /// Whether the header complement check matched.
    pub checksum_valid: bool,
}

impl CartridgeHeader {
    pub fn parse(rom: &[u8]) -> Result<Self, CoreError> {
        if rom.len() < HEADER_SIZE {
            return Err(CoreError::RomTruncated(rom.len()));
        }

        let checksum_valid = complement_check(rom) == rom[0xBD];
        if !checksum_valid {
            tracing::warn!("cartridge header complement check failed");
        }

        Ok(Self {
            game_title: ascii_field(&rom[0xA0..=0xAB]),
            game_code: ascii_field(&rom[0xAC..=0xAF]),
            maker_code: ascii_field(&rom[0xB0..=0xB1]),
            fixed_value: rom[0xB2],
            software_version: rom[0xBC],
            checksum_valid,
        })
    }
}

/// The BIOS checksum: the identification block bytes subtracted from `-0x19`.
fn complement_check(rom: &[u8]) -> u8 {
    rom[0xA0..0xBD]
        .iter()
        .fold(0u8, |acc, &byte| acc.wrapping_sub(byte))
        .wrapping_sub(0x19)
}

fn ascii_field(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| char::from(b))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A minimal ROM image with a coherent header.
    pub(crate) fn rom_with_header(title: &str) -> Vec<u8> {
        let mut rom = vec![0; 0x100];
        rom[0xA0..0xA0 + title.len()].copy_from_slice(title.as_bytes());
        rom[0xAC..=0xAF].copy_from_slice(b"AXXE");
        rom[0xB0..=0xB1].copy_from_slice(b"01");
        rom[0xB2] = 0x96;
        rom[0xBD] = complement_check(&rom);
        rom
    }

    #[test]
    fn parses_identification_fields() {
        let rom = rom_with_header("TESTGAME");
        let header = CartridgeHeader::parse(&rom).unwrap();

        assert_eq!(header.game_title, "TESTGAME");
        assert_eq!(header.game_code, "AXXE");
        assert_eq!(header.maker_code, "01");
        assert_eq!(header.fixed_value, 0x96);
        assert!(header.checksum_valid);
    }

    #[test]
    fn bad_checksum_is_reported_not_fatal() {
        let mut rom = rom_with_header("TESTGAME");
        rom[0xBD] ^= 0xFF;

        let header = CartridgeHeader::parse(&rom).unwrap();
        assert!(!header.checksum_valid);
    }

    #[test]
    fn truncated_rom_is_rejected() {
        assert_eq!(
            CartridgeHeader::parse(&[0; 16]),
            Err(CoreError::RomTruncated(16))
        );
    }
}
