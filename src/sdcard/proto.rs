//! Constants from the SD Specifications, SPI mode.
//!
//! Commands, R1 status bits, data tokens and register layouts for driving
//! an SD memory card over SPI. Only the mandatory SPI-mode command set is
//! listed. Wire-level CRC is left in its default-off state, so command
//! packets carry fixed trailers and data CRCs are dummy bytes.

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in SPI mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition
pub const CMD8: u8 = 0x08;
/// SEND_CSD - read the Card Specific Data (CSD register)
pub const CMD9: u8 = 0x09;
/// STOP_TRANSMISSION - end multiple block read sequence
pub const CMD12: u8 = 0x0C;
/// SEND_STATUS - read the card status register
pub const CMD13: u8 = 0x0D;
/// SET_BLOCKLEN - set the block length for standard capacity cards
pub const CMD16: u8 = 0x10;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// READ_MULTIPLE_BLOCK - read multiple data blocks from the card
pub const CMD18: u8 = 0x12;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// WRITE_MULTIPLE_BLOCK - write blocks of data until a STOP_TRANSMISSION
pub const CMD25: u8 = 0x19;
/// ERASE_WR_BLK_START_ADDR - set the first write block to be erased
pub const CMD32: u8 = 0x20;
/// ERASE_WR_BLK_END_ADDR - set the last write block to be erased
pub const CMD33: u8 = 0x21;
/// ERASE - erase all previously selected write blocks
pub const CMD38: u8 = 0x26;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// CRC_ON_OFF - enable or disable CRC checking
pub const CMD59: u8 = 0x3B;
/// SD_STATUS - read the SD status register
pub const ACMD13: u8 = 0x0D;
/// SEND_NUM_WR_BLOCKS - read the number of well-written write blocks
pub const ACMD22: u8 = 0x16;
/// SET_WR_BLK_ERASE_COUNT - pre-erase blocks before a multiple block write
pub const ACMD23: u8 = 0x17;
/// SD_SEND_OP_COND - send host capacity support and start the card's
/// initialization process
pub const ACMD41: u8 = 0x29;

//==============================================================================

// R1 response

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;
/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;
/// status bit for erase reset
pub const R1_ERASE_RESET: u8 = 0x02;
/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;
/// status bit for communication CRC error
pub const R1_COM_CRC_ERROR: u8 = 0x08;
/// status bit for erase sequence error
pub const R1_ERASE_SEQUENCE_ERROR: u8 = 0x10;
/// status bit for misaligned address
pub const R1_ADDRESS_ERROR: u8 = 0x20;
/// status bit for bad parameter
pub const R1_PARAMETER_ERROR: u8 = 0x40;
/// the card never drove the response; the bus idles high
pub const R1_NO_RESPONSE: u8 = 0xFF;

//==============================================================================

// Data tokens

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;
/// stop token for write multiple blocks
pub const STOP_TRAN_TOKEN: u8 = 0xFD;
/// start data token for write multiple blocks
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;
/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;
/// write data rejected, CRC error
pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
/// write data rejected, write error
pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;
/// the byte clocked out whenever the host only wants to receive
pub const FILL_BYTE: u8 = 0xFF;

//==============================================================================

// OCR register (R3 payload)

/// card supports the 3.3 V range
pub const OCR_3_3V: u32 = 1 << 20;
/// Host Capacity Support / Card Capacity Status bit
pub const OCR_HCS_CCS: u32 = 1 << 30;

/// CMD8 argument: 2.7-3.6 V supply range plus the 0xAA check pattern,
/// echoed back in the low 12 bits of the R7 payload
pub const CMD8_IF_COND_ARG: u32 = 0x0000_01AA;
/// mask selecting the voltage + pattern echo in the R7 payload
pub const CMD8_PATTERN_MASK: u32 = 0xFFF;

//==============================================================================

// Protocol timing

/// deadline for R1b busy signalling and the ACMD41 init loop, in ms
pub const COMMAND_TIMEOUT_MS: u32 = 5000;
/// deadline for the 0xFE data start token, in ms
pub const DATA_TOKEN_TIMEOUT_MS: u32 = 300;
/// attempts at CMD0 before deciding no card is present
pub const CMD0_RETRIES: u32 = 5;
/// whole-command retries when the R1 poll comes back empty
pub const CMD_RETRIES: u32 = 3;
/// R1 poll length: the response arrives within 0 to 8 bytes, 16 is ample
pub const R1_POLL_TRIES: u32 = 16;
/// re-issues of a read command whose first data token never arrived
pub const READ_RETRIES: u32 = 3;

/// Builds the 6-byte SPI command packet for the given opcode and argument.
///
/// CRC is off for every command we send after reset, but CMD0 is executed
/// while the card is still in SD mode and CMD8 always checks its CRC, so
/// those two carry their well-known pre-computed trailers. Everything else
/// just needs the end bit set.
pub fn command_packet(cmd: u8, arg: u32) -> [u8; 6] {
    let trailer = match cmd {
        CMD0 => 0x95,
        CMD8 => 0x87,
        _ => 0xFF,
    };
    [
        0x40 | (cmd & 0x3F),
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        trailer,
    ]
}

/// Card Specific Data, version 1
#[derive(Default)]
pub struct CsdV1 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data, version 2
#[derive(Default)]
pub struct CsdV2 {
    /// The 16-bytes of data in this Card Specific Data block
    pub data: [u8; 16],
}

/// Card Specific Data
pub enum Csd {
    /// A version 1 CSD
    V1(CsdV1),
    /// A version 2 CSD
    V2(CsdV2),
}

impl Csd {
    /// Interpret a raw CSD register by its CSD_STRUCTURE field.
    ///
    /// Returns `None` for structure versions we do not understand.
    pub fn parse(data: [u8; 16]) -> Option<Csd> {
        match data[0] >> 6 {
            0 => Some(Csd::V1(CsdV1 { data })),
            1 => Some(Csd::V2(CsdV2 { data })),
            _ => None,
        }
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u64 {
        match self {
            Csd::V1(csd) => csd.card_capacity_blocks(),
            Csd::V2(csd) => csd.card_capacity_blocks(),
        }
    }

    /// Returns the erase granularity in bytes
    pub fn erase_size_bytes(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.erase_size_bytes(),
            Csd::V2(csd) => csd.erase_size_bytes(),
        }
    }
}

impl CsdV1 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() - 7;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Returns the erase granularity in bytes.
    ///
    /// With ERASE_BLK_EN set the card erases in single 512-byte blocks.
    /// Otherwise the SECTOR_SIZE field applies, floored at one block.
    pub fn erase_size_bytes(&self) -> u32 {
        if self.erase_single_block_enabled() {
            512
        } else {
            u32::from(self.erase_sector_size()).max(512)
        }
    }
}

impl CsdV2 {
    /// Create a new, empty, CSD
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    define_field!(csd_ver, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(7, 0, 6), (8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);
    define_field!(erase_sector_size, u8, [(10, 0, 6), (11, 7, 1)]);

    /// Returns the card capacity in bytes
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 512 * 1024
    }

    /// Returns the card capacity in 512-byte blocks
    pub fn card_capacity_blocks(&self) -> u64 {
        (u64::from(self.device_size()) + 1) * 1024
    }

    /// Returns the erase granularity in bytes.
    ///
    /// High capacity cards always erase in 512-byte units.
    pub fn erase_size_bytes(&self) -> u32 {
        512
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
