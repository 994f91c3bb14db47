//! Constants and wire formats from the SD Specifications, SPI mode.
//!
//! Command numbers and token values follow the SD Physical Layer Simplified
//! Specification, as popularised by Bill Greiman's SdFat library.

use byteorder::{BigEndian, ByteOrder};

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// SEND_CID - read the Card Identification register
pub const CMD10: u8 = 0x0A;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// READ_MULTIPLE_BLOCK - read a multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SET_WR_BLK_ERASE_COUNT - number of blocks to pre-erase before a
/// multi-block write
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

// Command arguments

/// CMD8 argument: VHS = 0b0001 (2.7V to 3.6V), check pattern 0xAA
pub const CMD8_ARG: u32 = 0x1AA;
/// What a v2 card echoes back in R7 for [`CMD8_ARG`]
pub const CMD8_R7_ECHO: [u8; 4] = [0x00, 0x00, 0x01, 0xAA];
/// ACMD41 argument with the HCS (host capacity support) bit set
pub const ACMD41_ARG_HCS: u32 = 0x4000_0000;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// mask that accepts both the idle and the ready state
pub const R1_IDLE_OR_READY_MASK: u8 = 0xFE;

/// start data token for read single or multiple block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// the card holds MISO low while it is busy
pub const BUSY_BYTE: u8 = 0x00;

/// idle bus level, clocked out whenever we only want to listen
pub const SYNC_BYTE: u8 = 0xFF;

/// stuff byte sent in place of a CRC once the card is in SPI mode
pub const STUFF_CRC: u8 = 0x01;

/// 20 bytes of 0xFF gives 160 clocks, comfortably over the 74 required
pub const NUM_OF_PWR_UP_CLK_BYTES: usize = 20;

/// Length of [`FILLER`]
pub const FILLER_LEN: usize = 520;

/// Idle bytes to clock out while waiting for, or reading from, the card.
pub static FILLER: [u8; FILLER_LEN] = [SYNC_BYTE; FILLER_LEN];

//==============================================================================

/// A command frame, as sent on MOSI.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command index (0..=63)
    pub index: u8,
    /// The 32-bit argument
    pub arg: u32,
}

impl Command {
    /// Make a new command frame.
    pub const fn new(index: u8, arg: u32) -> Command {
        Command { index, arg }
    }

    /// CMD0 and CMD8 are sent before the card knows it is in SPI mode, so
    /// they are the only ones that need a correct CRC.
    pub const fn needs_crc(&self) -> bool {
        self.index == CMD0 || self.index == CMD8
    }

    /// Encode to the six bytes on the wire: start and transmission bits,
    /// command index, big-endian argument, then CRC7 and end bit.
    pub fn encode(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];
        buf[0] = 0x40 | (self.index & 0x3F);
        BigEndian::write_u32(&mut buf[1..5], self.arg);
        buf[5] = if self.needs_crc() {
            crc7(&buf[0..5])
        } else {
            STUFF_CRC
        };
        buf
    }
}

/// What the card must answer to a [`Command`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Response {
    /// Bits of the R1 byte we care about
    pub mask: u8,
    /// Value the masked R1 byte must have
    pub expected_r1: u8,
    /// R1b: wait for the card to release MISO after R1
    pub busy: bool,
    /// Bytes following R1 (0, 1 for R2, 4 for R3/R7)
    pub long_len: usize,
    /// If set, the first `long_len` bytes must match this
    pub long_expected: Option<[u8; 4]>,
}

impl Response {
    /// An R1 response that must equal `expected_r1` exactly.
    pub const fn r1(expected_r1: u8) -> Response {
        Response {
            mask: 0xFF,
            expected_r1,
            busy: false,
            long_len: 0,
            long_expected: None,
        }
    }

    /// Only compare the bits of R1 in `mask`.
    pub const fn with_mask(self, mask: u8) -> Response {
        Response { mask, ..self }
    }

    /// Turn this into an R1b response.
    pub const fn with_busy(self) -> Response {
        Response { busy: true, ..self }
    }

    /// Clock in `len` more bytes after R1. Anything over 4 is clamped.
    pub const fn with_long(self, len: usize) -> Response {
        let long_len = if len > 4 { 4 } else { len };
        Response { long_len, ..self }
    }

    /// Require the bytes after R1 to match `pattern`.
    pub const fn expecting(self, pattern: [u8; 4]) -> Response {
        Response {
            long_expected: Some(pattern),
            ..self
        }
    }
}

//==============================================================================

/// The Operating Conditions Register, as returned by CMD58.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Ocr(pub u32);

impl Ocr {
    /// Build from the four bytes that follow R1.
    pub fn from_bytes(bytes: [u8; 4]) -> Ocr {
        Ocr(u32::from_be_bytes(bytes))
    }

    /// Card power up status bit - the card has finished initialising
    pub fn power_up_complete(&self) -> bool {
        (self.0 & (1 << 31)) != 0
    }

    /// Card Capacity Status - set for SDHC/SDXC (block addressed) cards.
    /// Only valid once [`Ocr::power_up_complete`] is set.
    pub fn high_capacity(&self) -> bool {
        (self.0 & (1 << 30)) != 0
    }

    /// The supported voltage window, bits 15 (2.7V) through 23 (3.6V)
    pub fn voltage_window(&self) -> u16 {
        ((self.0 >> 15) & 0x1FF) as u16
    }
}

/// Card Specific Data, version 1
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Csd {
    /// A version 1 CSD (standard capacity)
    V1(CsdV1),
    /// A version 2 CSD (SDHC and SDXC)
    V2(CsdV2),
}

impl Csd {
    /// Pick the right layout from the CSD_STRUCTURE bits. The two reserved
    /// versions give `None`.
    pub fn from_bytes(data: [u8; 16]) -> Option<Csd> {
        match data[0] >> 6 {
            0 => Some(Csd::V1(CsdV1 { data })),
            1 => Some(Csd::V2(CsdV2 { data })),
            _ => None,
        }
    }

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_bytes(),
            Csd::V2(csd) => csd.card_capacity_bytes(),
        }
    }

    /// Returns the card capacity in 512-byte blocks, or `None` if the
    /// register describes something that does not fit.
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Can this card erase single blocks?
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }
}

impl CsdV1 {
    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks, or `None` if the blocks
    /// would be smaller than 512 bytes.
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        let multiplier = (self.device_size_multiplier() + self.read_block_length())
            .checked_sub(7)?;
        Some((self.device_size() + 1) << multiplier)
    }
}

impl CsdV2 {
    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(max_data_transfer_rate, u8, 3, 0, 8);
    define_field!(card_command_classes, u16, [(4, 0, 8), (5, 4, 4)]);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);
    define_field!(temporary_write_protection, bool, 14, 4);
    define_field!(permanent_write_protection, bool, 14, 5);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks, or `None` past 2 TiB.
    pub fn card_capacity_blocks(&self) -> Option<u32> {
        (self.device_size() + 1).checked_mul(1024)
    }
}

/// Card Identification register, as returned by CMD10
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Cid {
    /// The 16-bytes of data in this Card Identification block
    pub data: [u8; 16],
}

impl Cid {
    define_field!(manufacturer_id, u8, 0);
    define_field!(oem_id, u16, 1);
    define_field!(product_revision, u8, 8);
    define_field!(product_serial_number, u32, 9);
    define_field!(manufacturing_year_offset, u8, [(13, 0, 4), (14, 4, 4)]);
    define_field!(manufacturing_month, u8, 14, 0, 4);

    /// The five character product name, if it is ASCII
    pub fn product_name(&self) -> Option<&str> {
        core::str::from_utf8(&self.data[3..8])
            .ok()
            .filter(|s| s.is_ascii())
    }

    /// Calendar year of manufacture
    pub fn manufacturing_year(&self) -> u16 {
        2000 + u16::from(self.manufacturing_year_offset())
    }
}

/// Perform the 7-bit CRC used on the SD card
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
