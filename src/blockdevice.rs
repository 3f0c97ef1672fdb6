//! Traits and types for working with Block Devices.
//!
//! Generic code for handling block devices: the byte-addressed
//! `BlockDevice` trait this crate's SD card driver implements, and types
//! for working with fixed 512-byte blocks.

/// A standard 512 byte block (also known as a sector).
///
/// IBM PC formatted 5.25" and 3.5" floppy disks, IDE/SATA Hard Drives up to
/// about 2 TiB, and almost all SD/MMC cards have 512 byte blocks.
///
/// This library does not support devices with a block size other than 512
/// bytes.
pub type Block = [u8; BLOCK_LEN];

/// All our blocks are a fixed length of 512 bytes. We do not support
/// 'Advanced Format' Hard Drives with 4 KiB blocks, nor weird old
/// pre-3.5-inch floppy disk formats.
pub const BLOCK_LEN: usize = 512;

/// Sometimes we want `LEN` as a `u32` and the casts don't look nice.
pub const BLOCK_LEN_U32: u32 = 512;

/// Sometimes we want `LEN` as a `u64` and the casts don't look nice.
pub const BLOCK_LEN_U64: u64 = 512;

/// A device which can read, program and erase whole 512-byte blocks,
/// addressed by byte offset from the start of the device.
///
/// Addresses and lengths handed to the data-path methods must be multiples
/// of [`BLOCK_LEN`]; implementations reject anything else. Blocks must be
/// erased before they are programmed, although SD cards handle that
/// internally and accept `program` on any block.
pub trait BlockDevice {
    /// The errors this block device can raise.
    type Error: core::fmt::Debug;

    /// Initialize the device, bringing it to a state where the data-path
    /// methods may be used.
    fn init(&self) -> Result<(), Self::Error>;

    /// Deinitialize the device. Calling this twice is harmless.
    fn deinit(&self);

    /// Read `buffer.len()` bytes starting at the given byte address.
    fn read(&self, buffer: &mut [u8], address: u64) -> Result<(), Self::Error>;

    /// Program (write) `buffer.len()` bytes starting at the given byte
    /// address.
    fn program(&self, buffer: &[u8], address: u64) -> Result<(), Self::Error>;

    /// Erase `length` bytes starting at the given byte address.
    fn erase(&self, address: u64, length: u64) -> Result<(), Self::Error>;

    /// Mark a region as no longer in use.
    ///
    /// A hint that the region may be erased without side effects, letting
    /// the device schedule the work when it is idle.
    fn trim(&self, address: u64, length: u64) -> Result<(), Self::Error> {
        self.erase(address, length)
    }

    /// The size of a readable block in bytes.
    fn read_size(&self) -> u64 {
        BLOCK_LEN_U64
    }

    /// The size of a programmable block in bytes.
    fn program_size(&self) -> u64 {
        BLOCK_LEN_U64
    }

    /// The size of an erasable region in bytes.
    fn erase_size(&self) -> u64;

    /// The total size of the device in bytes.
    fn size(&self) -> u64;
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
