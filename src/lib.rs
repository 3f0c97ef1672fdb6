//! # embedded-sdspi
//!
//! > An SD/SDHC/SDXC block device driver for SPI, written in Embedded Rust
//!
//! This crate drives an SD memory card over a plain SPI bus and exposes it
//! as a uniform, byte-addressed block device with a fixed 512-byte block
//! size. It is written in pure-Rust, is `#![no_std]` and does not use
//! `alloc`. It is designed for readability and debugability over raw
//! performance: the card is driven one bus transaction at a time, exactly
//! as Chapter 7 ("SPI Mode") of the SD Physical Layer Simplified
//! Specification lays the protocol out.
//!
//! The driver covers the whole SPI-mode contract: the
//! CMD0/CMD8/CMD58/ACMD41 initialization handshake (including the v1.x /
//! v2.x / high-capacity negotiation), CSD capacity decoding, and the
//! single- and multi-block read, write and erase data paths with their
//! token framing and busy-wait discipline. Wire-level CRC stays disabled
//! after initialization, as is the SPI-mode default.
//!
//! ## Using the crate
//!
//! You need an [`embedded_hal::spi::SpiBus`] configured for SPI mode 0 and
//! 8-bit words, a chip-select [`embedded_hal::digital::OutputPin`], and an
//! [`embedded_hal::delay::DelayNs`]. Because initialization must run with
//! a slow clock (100 kHz) before switching up to the transfer rate, the
//! bus type also implements the small [`BusClock`] trait — usually a thin
//! newtype over your HAL's SPI driver.
//!
//! ```rust,ignore
//! use embedded_sdspi::SdBlockDevice;
//!
//! let sd = SdBlockDevice::new(spi, cs, delay);
//! sd.init()?;
//! defmt::info!("Card size is {} bytes", sd.size());
//! let mut block = [0u8; 512];
//! sd.read(&mut block, 0)?;
//! sd.program(&block, 512)?;
//! sd.deinit();
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log`
//!   crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over
//!   defmt instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod sdcard;

pub use crate::blockdevice::{Block, BlockDevice, BLOCK_LEN, BLOCK_LEN_U32, BLOCK_LEN_U64};
pub use crate::sdcard::{BusClock, CardType, Error, Options, SdBlockDevice};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
