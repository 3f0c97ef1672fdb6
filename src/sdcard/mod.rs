//! The SD Card SPI protocol.
//!
//! Drives an SD/SDHC/SDXC memory card over a generic SPI bus and presents
//! it as a byte-addressed block device. This is currently optimised for
//! readability and debugability, not performance.

pub mod proto;

mod spi;

use core::cell::RefCell;

use embedded_hal::{delay::DelayNs, digital::OutputPin, spi::SpiBus};

use crate::blockdevice::{BlockDevice, BLOCK_LEN_U64};
use crate::debug;
use spi::SdSpiInner;

/// The highest SCK rate the default speed class permits, in Hz.
///
/// Requests above this are clamped and reported as [`Error::Unsupported`].
pub const MAX_TRANSFER_FREQUENCY: u32 = 25_000_000;

/// Spacing between busy polls against the card, in microseconds.
const POLL_PERIOD_US: u32 = 10;

/// An SPI bus whose clock rate can be changed at runtime.
///
/// The SD initialization handshake must run at a low rate (100 kHz by
/// default) before the bus is switched up to the transfer rate, so the
/// driver needs control over SCK. `embedded-hal` has no trait for this;
/// implement this one on (a newtype over) your HAL's SPI driver.
pub trait BusClock {
    /// Reconfigure the SCK rate to the given frequency in Hz.
    fn set_frequency(&mut self, hz: u32);
}

/// Represents an SD Card on an SPI bus.
///
/// Built from an SPI bus, a Chip Select pin and a delay implementation. We
/// need Chip Select to be separate so we can clock out some bytes without
/// Chip Select asserted (which puts the card into SPI mode).
///
/// All the APIs take `&self` - mutability is handled using an inner
/// `RefCell`, which also serializes callers in the single-threaded
/// scheduling model this driver targets.
pub struct SdBlockDevice<BUS, CS, D>
where
    BUS: SpiBus<u8> + BusClock,
    CS: OutputPin,
    D: DelayNs,
{
    inner: RefCell<SdSpiInner<BUS, CS, D>>,
}

impl<BUS, CS, D> SdBlockDevice<BUS, CS, D>
where
    BUS: SpiBus<u8> + BusClock,
    CS: OutputPin,
    D: DelayNs,
{
    /// Create a new SD Card driver using a raw SPI bus.
    ///
    /// Uses the default options. The bus must be configured for SPI mode 0
    /// and 8-bit words.
    pub fn new(bus: BUS, cs: CS, delayer: D) -> SdBlockDevice<BUS, CS, D> {
        Self::new_with_options(bus, cs, delayer, Options::default())
    }

    /// Construct a new SD Card driver, using a raw SPI bus and the given
    /// options.
    pub fn new_with_options(
        bus: BUS,
        cs: CS,
        delayer: D,
        options: Options,
    ) -> SdBlockDevice<BUS, CS, D> {
        SdBlockDevice {
            inner: RefCell::new(SdSpiInner::new(bus, cs, delayer, options)),
        }
    }

    /// Initialize the card.
    ///
    /// Runs the SPI-mode handshake at the init clock rate, decodes the
    /// card's geometry, then raises the clock to the transfer rate. May be
    /// called again to re-initialize a swapped card.
    pub fn init(&self) -> Result<(), Error> {
        self.inner.borrow_mut().init()
    }

    /// Deinitialize the card.
    ///
    /// Calling this twice is harmless; the second call is a no-op.
    pub fn deinit(&self) {
        self.inner.borrow_mut().deinit()
    }

    /// Read bytes from the card, starting at the given byte address.
    ///
    /// `address` and `buffer.len()` must be multiples of 512.
    pub fn read(&self, buffer: &mut [u8], address: u64) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_transfer(address, buffer.len() as u64)?;
        if buffer.is_empty() {
            return Ok(());
        }
        debug!("Read {} bytes @ {}", buffer.len(), address);
        inner.read(buffer, address)
    }

    /// Program (write) bytes to the card, starting at the given byte
    /// address.
    ///
    /// `address` and `buffer.len()` must be multiples of 512.
    pub fn program(&self, buffer: &[u8], address: u64) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_transfer(address, buffer.len() as u64)?;
        if buffer.is_empty() {
            return Ok(());
        }
        debug!("Program {} bytes @ {}", buffer.len(), address);
        inner.program(buffer, address)
    }

    /// Erase a range of the card.
    ///
    /// `address` and `length` must be multiples of 512.
    pub fn erase(&self, address: u64, length: u64) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.check_transfer(address, length)?;
        if length == 0 {
            return Ok(());
        }
        debug!("Erase {} bytes @ {}", length, address);
        inner.erase(address, length)
    }

    /// Mark a range of the card as no longer in use.
    ///
    /// SD cards have no separate trim operation; this is an alias of
    /// [`SdBlockDevice::erase`].
    pub fn trim(&self, address: u64, length: u64) -> Result<(), Error> {
        self.erase(address, length)
    }

    /// The size of a readable block in bytes. Always 512.
    pub fn read_size(&self) -> u64 {
        BLOCK_LEN_U64
    }

    /// The size of a programmable block in bytes. Always 512.
    pub fn program_size(&self) -> u64 {
        BLOCK_LEN_U64
    }

    /// The erase granularity in bytes, as decoded from the card's CSD.
    pub fn erase_size(&self) -> u64 {
        u64::from(self.inner.borrow().erase_size())
    }

    /// Return the usable size of this SD card in bytes.
    ///
    /// Returns 0 before a successful `init`.
    pub fn size(&self) -> u64 {
        self.inner.borrow().size_bytes()
    }

    /// Set the transfer clock rate.
    ///
    /// Rates above 25 MHz are clamped to 25 MHz and reported as
    /// [`Error::Unsupported`]; the bus is reconfigured either way.
    pub fn frequency(&self, hz: u32) -> Result<(), Error> {
        self.inner.borrow_mut().set_frequency(hz)
    }

    /// Enable or disable per-command debug tracing.
    pub fn debug(&self, enabled: bool) {
        self.inner.borrow_mut().set_verbose(enabled)
    }

    /// Get the card type, if a card has been negotiated.
    pub fn card_type(&self) -> Option<CardType> {
        self.inner.borrow().card_type()
    }

    /// Release the peripherals this driver owns.
    pub fn free(self) -> (BUS, CS, D) {
        self.inner.into_inner().free()
    }
}

impl<BUS, CS, D> BlockDevice for SdBlockDevice<BUS, CS, D>
where
    BUS: SpiBus<u8> + BusClock,
    CS: OutputPin,
    D: DelayNs,
{
    type Error = Error;

    fn init(&self) -> Result<(), Self::Error> {
        SdBlockDevice::init(self)
    }

    fn deinit(&self) {
        SdBlockDevice::deinit(self)
    }

    fn read(&self, buffer: &mut [u8], address: u64) -> Result<(), Self::Error> {
        SdBlockDevice::read(self, buffer, address)
    }

    fn program(&self, buffer: &[u8], address: u64) -> Result<(), Self::Error> {
        SdBlockDevice::program(self, buffer, address)
    }

    fn erase(&self, address: u64, length: u64) -> Result<(), Self::Error> {
        SdBlockDevice::erase(self, address, length)
    }

    fn erase_size(&self) -> u64 {
        SdBlockDevice::erase_size(self)
    }

    fn size(&self) -> u64 {
        SdBlockDevice::size(self)
    }
}

/// Options for driving the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// SCK rate during the initialization handshake. Cards must be brought
    /// up between 100 and 400 kHz.
    pub init_hz: u32,
    /// SCK rate for data transfer after initialization, applied at the end
    /// of `init`. Values above 25 MHz are clamped.
    pub transfer_hz: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            init_hz: 100_000,
            transfer_hz: 1_000_000,
        }
    }
}

/// The possible errors this crate can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// Reserved for hosts that cannot complete an operation immediately.
    /// This driver is synchronous and never returns it.
    WouldBlock,
    /// The card rejected a command as illegal, or the requested clock rate
    /// was above the 25 MHz ceiling.
    Unsupported,
    /// A misaligned address, a bad length, or the card flagged an
    /// address/parameter error.
    Parameter,
    /// Operation issued before a successful `init`.
    NotInitialized,
    /// The card never responded to CMD0; it is missing or not connected.
    NoDevice,
    /// The card is unusable: it does not support 3.3 V, or its CMD8 echo
    /// did not match.
    Unusable,
    /// A response or data token did not arrive within its deadline.
    NoResponse,
    /// The card reported a command CRC error.
    Crc,
    /// The card reported an erase-sequence or erase-reset error.
    Erase,
    /// A data block was rejected by the card during a write.
    Write,
    /// The card's CSD could not be decoded, or the block length could not
    /// be set.
    DeviceError,
    /// The SPI peripheral failed an exchange.
    Transport,
    /// The chip-select pin could not be driven.
    Gpio,
}

/// The different types of card we support.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// A standard-capacity SD Card supporting v1.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD1,
    /// A standard-capacity SD Card supporting v2.x of the standard.
    ///
    /// Uses byte-addressing internally, so limited to 2GiB in size.
    SD2,
    /// A high-capacity 'SDHC' or 'SDXC' Card.
    ///
    /// Uses block-addressing internally to support capacities above 2GiB.
    SDHC,
    /// A card was detected but could not be identified or negotiated.
    Unknown,
}

/// Bounded busy-wait against the card.
///
/// Polls are spaced [`POLL_PERIOD_US`] apart; the deadline is expressed in
/// milliseconds when the `Delay` is built.
pub(crate) struct Delay {
    retries: u32,
}

impl Delay {
    /// A deadline of the given number of milliseconds from now.
    pub(crate) fn from_ms(timeout_ms: u32) -> Delay {
        Delay {
            retries: timeout_ms * (1000 / POLL_PERIOD_US),
        }
    }

    /// The 5000 ms deadline used for command responses and busy draining.
    pub(crate) fn new_command() -> Delay {
        Delay::from_ms(proto::COMMAND_TIMEOUT_MS)
    }

    /// The 300 ms deadline used for the data start token.
    pub(crate) fn new_token() -> Delay {
        Delay::from_ms(proto::DATA_TOKEN_TIMEOUT_MS)
    }

    /// Wait one poll period, or fail with the given error once the
    /// deadline has passed.
    pub(crate) fn delay<D: DelayNs>(&mut self, delayer: &mut D, err: Error) -> Result<(), Error> {
        if self.retries == 0 {
            Err(err)
        } else {
            delayer.delay_us(POLL_PERIOD_US);
            self.retries -= 1;
            Ok(())
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
