//! Setup-time error taxonomy.
//!
//! These errors are only produced while building a [`Gba`](crate::gba::Gba)
//! from ROM/BIOS/save images. Once the machine runs, guest-visible faults are
//! routed through the CPU exception model instead of the host error path.

use std::fmt::{self, Display, Formatter};

/// Maximum cartridge ROM size: 32 MiB.
pub const MAX_ROM_SIZE: usize = 0x0200_0000;

/// Expected BIOS image size: 16 KiB.
pub const BIOS_SIZE: usize = 0x4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The ROM image is larger than the 32 MiB Game Pak address space.
    RomOversize(usize),
    /// The ROM image is too small to contain a cartridge header.
    RomTruncated(usize),
    /// The BIOS image is not exactly 16 KiB.
    BiosSize(usize),
    /// The save file container is corrupt or belongs to a different backend.
    SaveLoad(String),
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::RomOversize(size) => {
                write!(f, "ROM is {size} bytes, larger than the 32 MiB Game Pak space")
            }
            Self::RomTruncated(size) => {
                write!(f, "ROM is {size} bytes, too small for a cartridge header")
            }
            Self::BiosSize(size) => {
                write!(f, "BIOS image is {size} bytes, expected 16 KiB")
            }
            Self::SaveLoad(message) => write!(f, "cannot restore save data: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}
