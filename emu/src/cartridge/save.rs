//! Cartridge save memories: SRAM, Flash (64/128 KiB), EEPROM.
//!
//! The backend is a closed sum selected by scanning the ROM for the library
//! signature strings Nintendo's SDK embeds (`SRAM_V`, `FLASH_V`,
//! `FLASH512_V`, `FLASH1M_V`, `EEPROM_V`). Among SRAM/Flash the last match
//! in ROM order wins; an EEPROM signature takes precedence over the rest
//! (real cartridges carry a single save memory). No match defaults to SRAM.
//!
//! # Flash command protocol
//!
//! Commands are keyed by the unlock sequence `AA @ 0x5555`, `55 @ 0x2AAA`,
//! then a command byte at `0x5555`:
//!
//! | Command | Effect                                               |
//! |---------|------------------------------------------------------|
//! | `0x90`  | enter ID mode (reads of 0/1 return the device ID)    |
//! | `0xF0`  | leave ID mode                                        |
//! | `0x80`  | arm erase; a second unlock then `0x10 @ 0x5555`      |
//! |         | erases the chip, `0x30 @ sector<<12` a 4 KiB sector  |
//! | `0xA0`  | program one byte (can only clear bits)               |
//! | `0xB0`  | bank switch, 128 KiB parts only                      |
//!
//! Erase and program are timed on hardware; here they complete immediately,
//! so the guest's status poll (reading `0xFF` back) succeeds on its first
//! iteration.
//!
//! # EEPROM serial protocol
//!
//! The EEPROM sits behind a 16-bit port where only bit 0 matters. Incoming
//! bits are buffered until the host turns around to read; the buffered
//! length then identifies the command: 9/17 bits is a read request (6/14
//! address bits), 73/81 a write (address plus 64 data bits and a zero
//! terminator). The first finalized command fixes the device size. Reads
//! stream 4 zero bits, then the addressed 8-byte row MSB-first as the
//! byte-reversed 64-bit word.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Backup variants, closed by design: the dispatch surface is tiny and the
/// hardware set is fixed.
#[derive(Serialize, Deserialize)]
pub enum SaveBackend {
    Sram(Sram),
    Flash64(Flash),
    Flash128(Flash),
    Eeprom(Eeprom),
}

impl SaveBackend {
    /// Scans the ROM for SDK signatures and builds the matching backend.
    #[must_use]
    pub fn detect(rom: &[u8]) -> Self {
        if find_signature(rom, b"EEPROM_V").is_some() {
            return Self::Eeprom(Eeprom::default());
        }

        let mut chosen: Option<(usize, SaveKind)> = None;
        for (signature, kind) in [
            (b"SRAM_V".as_slice(), SaveKind::Sram),
            (b"FLASH_V".as_slice(), SaveKind::Flash64),
            (b"FLASH512_V".as_slice(), SaveKind::Flash64),
            (b"FLASH1M_V".as_slice(), SaveKind::Flash128),
        ] {
            if let Some(position) = find_signature(rom, signature)
                && chosen.is_none_or(|(previous, _)| position > previous)
            {
                chosen = Some((position, kind));
            }
        }

        match chosen.map(|(_, kind)| kind) {
            Some(SaveKind::Flash64) => Self::Flash64(Flash::new_64k()),
            Some(SaveKind::Flash128) => Self::Flash128(Flash::new_128k()),
            _ => Self::Sram(Sram::default()),
        }
    }

    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Sram(_) => "SRAM",
            Self::Flash64(_) => "Flash 64K",
            Self::Flash128(_) => "Flash 128K",
            Self::Eeprom(_) => "EEPROM",
        }
    }

    /// 8-bit read in the `0x0E00_0000` backup window.
    #[must_use]
    pub fn read_byte(&self, offset: usize) -> u8 {
        match self {
            Self::Sram(sram) => sram.read(offset),
            Self::Flash64(flash) | Self::Flash128(flash) => flash.read(offset),
            Self::Eeprom(_) => 0xFF,
        }
    }

    /// 8-bit write in the backup window.
    pub fn write_byte(&mut self, offset: usize, value: u8) {
        match self {
            Self::Sram(sram) => sram.write(offset, value),
            Self::Flash64(flash) | Self::Flash128(flash) => flash.write(offset, value),
            Self::Eeprom(_) => {}
        }
    }

    /// Serializes the backend into the save-file container.
    #[must_use]
    pub fn to_save_bytes(&self) -> Vec<u8> {
        let (tag, payload): (u8, &[u8]) = match self {
            Self::Sram(sram) => (0, &sram.data),
            Self::Flash64(flash) => (1, &flash.data),
            Self::Flash128(flash) => (2, &flash.data),
            Self::Eeprom(eeprom) => (3, &eeprom.data),
        };
        let mut bytes = Vec::with_capacity(payload.len() + 5);
        bytes.extend_from_slice(SAVE_MAGIC);
        bytes.push(tag);
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Restores a backend from the save-file container: the stored variant
    /// and its bytes, verbatim.
    pub fn from_save_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        if bytes.len() < 5 || &bytes[..4] != SAVE_MAGIC {
            return Err(CoreError::SaveLoad("bad container magic".into()));
        }
        let payload = &bytes[5..];
        match bytes[4] {
            0 => Ok(Self::Sram(Sram::from_bytes(payload))),
            1 => Ok(Self::Flash64(Flash::restore_64k(payload))),
            2 => Ok(Self::Flash128(Flash::restore_128k(payload))),
            3 => Ok(Self::Eeprom(Eeprom::from_bytes(payload)?)),
            tag => Err(CoreError::SaveLoad(format!("unknown backend tag {tag}"))),
        }
    }
}

const SAVE_MAGIC: &[u8; 4] = b"AGBS";

#[derive(Clone, Copy)]
enum SaveKind {
    Sram,
    Flash64,
    Flash128,
}

fn find_signature(rom: &[u8], signature: &[u8]) -> Option<usize> {
    rom.windows(signature.len())
        .rposition(|window| window == signature)
}

// ---------------------------------------------------------------------------
// SRAM
// ---------------------------------------------------------------------------

pub const SRAM_SIZE: usize = 0x8000;

#[derive(Serialize, Deserialize)]
pub struct Sram {
    data: Vec<u8>,
}

impl Default for Sram {
    fn default() -> Self {
        Self {
            data: vec![0xFF; SRAM_SIZE],
        }
    }
}

impl Sram {
    fn from_bytes(bytes: &[u8]) -> Self {
        let mut sram = Self::default();
        let len = bytes.len().min(SRAM_SIZE);
        sram.data[..len].copy_from_slice(&bytes[..len]);
        sram
    }

    #[must_use]
    pub fn read(&self, offset: usize) -> u8 {
        self.data[offset % SRAM_SIZE]
    }

    pub fn write(&mut self, offset: usize, value: u8) {
        self.data[offset % SRAM_SIZE] = value;
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

const FLASH_BANK_SIZE: usize = 0x1_0000;
const FLASH_SECTOR_SIZE: usize = 0x1000;

/// Where the command state machine currently is. ID mode is a separate
/// sticky flag so a `0xF0` reset can leave it from any state.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FlashState {
    #[default]
    Ready,
    Unlock1,
    Unlock2,
    EraseArmed,
    EraseUnlock1,
    EraseUnlock2,
    Program,
    BankSelect,
}

#[derive(Serialize, Deserialize)]
pub struct Flash {
    data: Vec<u8>,
    device_id: [u8; 2],
    banked: bool,
    bank: u8,
    state: FlashState,
    id_mode: bool,
}

impl Flash {
    /// Panasonic MN63F805MNP, 64 KiB.
    #[must_use]
    pub fn new_64k() -> Self {
        Self {
            data: vec![0xFF; FLASH_BANK_SIZE],
            device_id: [0x32, 0x1B],
            banked: false,
            bank: 0,
            state: FlashState::Ready,
            id_mode: false,
        }
    }

    /// Sanyo LE26FV10N1TS, 128 KiB, two banks.
    #[must_use]
    pub fn new_128k() -> Self {
        Self {
            data: vec![0xFF; 2 * FLASH_BANK_SIZE],
            device_id: [0x62, 0x13],
            banked: true,
            ..Self::new_64k()
        }
    }

    fn restore_64k(bytes: &[u8]) -> Self {
        let mut flash = Self::new_64k();
        let len = bytes.len().min(flash.data.len());
        flash.data[..len].copy_from_slice(&bytes[..len]);
        flash
    }

    fn restore_128k(bytes: &[u8]) -> Self {
        let mut flash = Self::new_128k();
        let len = bytes.len().min(flash.data.len());
        flash.data[..len].copy_from_slice(&bytes[..len]);
        flash
    }

    fn banked_offset(&self, offset: usize) -> usize {
        usize::from(self.bank) * FLASH_BANK_SIZE + (offset & 0xFFFF)
    }

    #[must_use]
    pub fn read(&self, offset: usize) -> u8 {
        let offset = offset & 0xFFFF;
        if self.id_mode && offset < 2 {
            return self.device_id[offset];
        }
        self.data[self.banked_offset(offset)]
    }

    pub fn write(&mut self, offset: usize, value: u8) {
        let offset = offset & 0xFFFF;
        self.state = match self.state {
            FlashState::Ready => match (offset, value) {
                (0x5555, 0xAA) => FlashState::Unlock1,
                (_, 0xF0) => {
                    self.id_mode = false;
                    FlashState::Ready
                }
                _ => FlashState::Ready,
            },
            FlashState::Unlock1 => {
                if (offset, value) == (0x2AAA, 0x55) {
                    FlashState::Unlock2
                } else {
                    FlashState::Ready
                }
            }
            FlashState::Unlock2 => match (offset, value) {
                (0x5555, 0x90) => {
                    self.id_mode = true;
                    FlashState::Ready
                }
                (0x5555, 0xF0) => {
                    self.id_mode = false;
                    FlashState::Ready
                }
                (0x5555, 0x80) => FlashState::EraseArmed,
                (0x5555, 0xA0) => FlashState::Program,
                (0x5555, 0xB0) if self.banked => FlashState::BankSelect,
                _ => {
                    tracing::debug!("flash: unknown command {value:#04X} at {offset:#06X}");
                    FlashState::Ready
                }
            },
            FlashState::EraseArmed => {
                if (offset, value) == (0x5555, 0xAA) {
                    FlashState::EraseUnlock1
                } else {
                    FlashState::Ready
                }
            }
            FlashState::EraseUnlock1 => {
                if (offset, value) == (0x2AAA, 0x55) {
                    FlashState::EraseUnlock2
                } else {
                    FlashState::Ready
                }
            }
            FlashState::EraseUnlock2 => {
                match (offset, value) {
                    (0x5555, 0x10) => {
                        tracing::debug!("flash: chip erase");
                        self.data.fill(0xFF);
                    }
                    (_, 0x30) => {
                        let base = usize::from(self.bank) * FLASH_BANK_SIZE
                            + (offset & !(FLASH_SECTOR_SIZE - 1));
                        tracing::debug!("flash: sector erase at {base:#07X}");
                        self.data[base..base + FLASH_SECTOR_SIZE].fill(0xFF);
                    }
                    _ => {}
                }
                FlashState::Ready
            }
            FlashState::Program => {
                // programming can only clear bits; erase brings them back
                let target = self.banked_offset(offset);
                self.data[target] &= value;
                FlashState::Ready
            }
            FlashState::BankSelect => {
                if offset == 0 {
                    self.bank = value & 1;
                }
                FlashState::Ready
            }
        };
    }
}

// ---------------------------------------------------------------------------
// EEPROM
// ---------------------------------------------------------------------------

/// An in-flight read stream: 4 dummy zero bits, then the 64 row bits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ReadStream {
    row: u64,
    bits_left: u8,
}

#[derive(Default, Serialize, Deserialize)]
pub struct Eeprom {
    /// Row storage; empty until the first command fixes the device size.
    data: Vec<u8>,
    /// 6 (512 B part) or 14 (8 KiB part); `None` until detected.
    address_bits: Option<u8>,
    command_bits: Vec<bool>,
    read_stream: Option<ReadStream>,
}

impl Eeprom {
    fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        let address_bits = match bytes.len() {
            0 => None,
            0x200 => Some(6),
            0x2000 => Some(14),
            len => {
                return Err(CoreError::SaveLoad(format!("EEPROM size {len} is not 512 or 8192")));
            }
        };
        Ok(Self {
            data: bytes.to_vec(),
            address_bits,
            command_bits: Vec::new(),
            read_stream: None,
        })
    }

    fn ensure_size(&mut self, address_bits: u8) {
        if self.address_bits.is_none() {
            let size = if address_bits == 6 { 0x200 } else { 0x2000 };
            tracing::debug!("EEPROM sized to {size} bytes ({address_bits}-bit addressing)");
            self.data = vec![0xFF; size];
            self.address_bits = Some(address_bits);
        }
    }

    /// Host write: one serial bit per 16-bit store.
    pub fn write_half_word(&mut self, value: u16) {
        // a new command cancels any read still streaming
        self.read_stream = None;
        if self.command_bits.len() < 0x80 {
            self.command_bits.push(value & 1 != 0);
        }
    }

    /// Host read: finalizes a buffered command on the turnaround, then
    /// streams the response. Idle reads return 1 ("ready").
    pub fn read_half_word(&mut self) -> u16 {
        if !self.command_bits.is_empty() {
            self.finalize_command();
        }
        match &mut self.read_stream {
            Some(stream) => {
                stream.bits_left -= 1;
                let bit = if stream.bits_left >= 64 {
                    0
                } else {
                    ((stream.row >> stream.bits_left) & 1) as u16
                };
                if stream.bits_left == 0 {
                    self.read_stream = None;
                }
                bit
            }
            None => 1,
        }
    }

    fn finalize_command(&mut self) {
        let bits = std::mem::take(&mut self.command_bits);

        let address_bits: u8 = match bits.len() {
            9 | 73 => 6,
            17 | 81 => 14,
            len => {
                tracing::debug!("EEPROM: discarding malformed {len}-bit command");
                return;
            }
        };
        if !bits[0] {
            tracing::debug!("EEPROM: command without start bit");
            return;
        }
        self.ensure_size(address_bits);

        let address_field = &bits[2..2 + usize::from(address_bits)];
        let address = address_field
            .iter()
            .fold(0usize, |acc, &bit| (acc << 1) | usize::from(bit));
        // large parts address 1024 rows through 14 bits; only 10 are decoded
        let row = (address & 0x3FF) % (self.data.len() / 8);

        let is_read = bits[1];
        if is_read {
            let row_bytes: [u8; 8] = self.data[row * 8..row * 8 + 8].try_into().unwrap();
            self.read_stream = Some(ReadStream {
                row: u64::from_le_bytes(row_bytes),
                bits_left: 68,
            });
        } else {
            let data_field = &bits[2 + usize::from(address_bits)..bits.len() - 1];
            let value = data_field
                .iter()
                .fold(0u64, |acc, &bit| (acc << 1) | u64::from(bit));
            self.data[row * 8..row * 8 + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
}
