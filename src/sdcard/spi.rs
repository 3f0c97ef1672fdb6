//! Implements the SD Card protocol on a raw SPI bus.
//!
//! Everything in here is sequential and synchronous: commands are six-byte
//! packets, responses and data tokens are found by polling the bus with
//! 0xFF fill bytes, and busy periods are drained by waiting for the card
//! to release the data line high. Deadlines come from the physical-layer
//! specification: 5000 ms for commands and busy, 300 ms for data tokens.

use embedded_hal::{delay::DelayNs, digital::OutputPin, spi::SpiBus};

use super::proto::*;
use super::{BusClock, CardType, Delay, Error, Options, MAX_TRANSFER_FREQUENCY};
use crate::blockdevice::{BLOCK_LEN, BLOCK_LEN_U32, BLOCK_LEN_U64};
use crate::{debug, trace, warn};

/// An R1 status byte plus whatever payload bytes the opcode carries,
/// assembled MSB-first.
struct Response {
    r1: u8,
    payload: u32,
}

/// Inner details for the SD Card driver.
///
/// All the APIs require `&mut self`.
pub(crate) struct SdSpiInner<BUS, CS, D>
where
    BUS: SpiBus<u8> + BusClock,
    CS: OutputPin,
    D: DelayNs,
{
    bus: BUS,
    cs: CS,
    delayer: D,
    card_type: Option<CardType>,
    initialized: bool,
    sectors: u64,
    erase_size: u32,
    init_hz: u32,
    transfer_hz: u32,
    verbose: bool,
}

impl<BUS, CS, D> SdSpiInner<BUS, CS, D>
where
    BUS: SpiBus<u8> + BusClock,
    CS: OutputPin,
    D: DelayNs,
{
    /// Construct a new raw SPI transport for an SD Card.
    pub(crate) fn new(bus: BUS, cs: CS, delayer: D, options: Options) -> Self {
        SdSpiInner {
            bus,
            cs,
            delayer,
            card_type: None,
            initialized: false,
            sectors: 0,
            erase_size: 0,
            init_hz: options.init_hz,
            transfer_hz: options.transfer_hz,
            verbose: false,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the card up: negotiate SPI mode, voltage and capacity class,
    /// decode the geometry, then switch to the transfer clock.
    pub(crate) fn init(&mut self) -> Result<(), Error> {
        debug!("Acquiring card");
        self.initialized = false;
        self.card_type = None;
        self.initialise_card()?;

        let csd = self.read_csd()?;
        let blocks = csd.card_capacity_blocks();
        if blocks == 0 {
            return Err(Error::DeviceError);
        }
        self.sectors = blocks;
        self.erase_size = csd.erase_size_bytes();
        debug!(
            "Card has {} sectors, erase size {} bytes",
            self.sectors, self.erase_size
        );

        // Standard capacity cards may power up with another block length.
        self.card_command(CMD16, BLOCK_LEN_U32)
            .map_err(|_| Error::DeviceError)?;

        self.initialized = true;
        self.apply_transfer_frequency()
    }

    /// Forget the initialized state. The card itself is left alone.
    pub(crate) fn deinit(&mut self) {
        self.initialized = false;
    }

    pub(crate) fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    pub(crate) fn erase_size(&self) -> u32 {
        if self.initialized {
            self.erase_size
        } else {
            0
        }
    }

    /// The usable card size in bytes, 0 before `init`.
    pub(crate) fn size_bytes(&self) -> u64 {
        if self.initialized {
            self.sectors * BLOCK_LEN_U64
        } else {
            0
        }
    }

    pub(crate) fn set_verbose(&mut self, enabled: bool) {
        self.verbose = enabled;
    }

    /// Reject transfers that are misaligned, out of range, or issued
    /// before `init`.
    pub(crate) fn check_transfer(&self, address: u64, length: u64) -> Result<(), Error> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        if address % BLOCK_LEN_U64 != 0 || length % BLOCK_LEN_U64 != 0 {
            return Err(Error::Parameter);
        }
        let end = address.checked_add(length).ok_or(Error::Parameter)?;
        if end > self.sectors * BLOCK_LEN_U64 {
            return Err(Error::Parameter);
        }
        Ok(())
    }

    /// Set the transfer clock rate, applying it to the bus immediately.
    pub(crate) fn set_frequency(&mut self, hz: u32) -> Result<(), Error> {
        self.transfer_hz = hz;
        self.apply_transfer_frequency()
    }

    /// Release the peripherals.
    pub(crate) fn free(self) -> (BUS, CS, D) {
        (self.bus, self.cs, self.delayer)
    }

    /// Apply the configured transfer rate, clamped at the 25 MHz ceiling
    /// of the default speed class.
    fn apply_transfer_frequency(&mut self) -> Result<(), Error> {
        if self.transfer_hz <= MAX_TRANSFER_FREQUENCY {
            self.bus.set_frequency(self.transfer_hz);
            Ok(())
        } else {
            warn!("Transfer rate clamped to {} Hz", MAX_TRANSFER_FREQUENCY);
            self.transfer_hz = MAX_TRANSFER_FREQUENCY;
            self.bus.set_frequency(self.transfer_hz);
            Err(Error::Unsupported)
        }
    }

    // =========================================================================
    // Initialization state machine
    // =========================================================================

    /// The SPI-mode initialization flow, figure 7-2 of the physical layer
    /// specification: CMD0, CMD8, CMD58, ACMD41 until ready, CMD58 again
    /// for the capacity class.
    fn initialise_card(&mut self) -> Result<(), Error> {
        // The card powers up in SD mode. Clocking is configured slow and
        // at least 74 clock cycles are supplied with CS deasserted before
        // the first command; many cards never enter SPI mode without this.
        self.bus.set_frequency(self.init_hz);
        self.cs.set_high().map_err(|_| Error::Gpio)?;
        self.bus
            .write(&[FILL_BYTE; 10])
            .map_err(|_| Error::Transport)?;
        self.bus.flush().map_err(|_| Error::Transport)?;

        self.go_idle_state()?;
        self.check_interface_condition()?;

        // The SPI default is CRC off; this makes it explicit. Errors are
        // ignored.
        let _ = self.card_command(CMD59, 0);

        let ocr = self.card_command(CMD58, 0)?;
        if ocr.payload & OCR_3_3V == 0 {
            warn!("Card does not support 3.3V");
            self.card_type = Some(CardType::Unknown);
            return Err(Error::Unusable);
        }

        // The card clears the idle bit once its own initialization is
        // done; HCS tells it we can handle block addressing.
        let arg = if self.card_type == Some(CardType::SD2) {
            OCR_HCS_CCS
        } else {
            0
        };
        let mut delay = Delay::new_command();
        loop {
            let response = self.card_acmd(ACMD41, arg)?;
            if response.r1 & R1_IDLE_STATE == 0 {
                break;
            }
            if delay.delay(&mut self.delayer, Error::NoResponse).is_err() {
                warn!("Timed out waiting for card to leave idle");
                self.card_type = Some(CardType::Unknown);
                return Err(Error::NoResponse);
            }
        }

        if self.card_type == Some(CardType::SD2) {
            // CCS distinguishes standard from high capacity.
            let ocr = self.card_command(CMD58, 0)?;
            if ocr.payload & OCR_HCS_CCS != 0 {
                self.card_type = Some(CardType::SDHC);
                debug!("Card initialized: high capacity");
            } else {
                debug!("Card initialized: standard capacity, version 2.x");
            }
        } else {
            self.card_type = Some(CardType::SD1);
            debug!("Card initialized: version 1.x");
        }
        Ok(())
    }

    /// Move the card into the SPI-mode idle state with CMD0.
    ///
    /// Resetting the MCU SPI master may not reset the card, in which case
    /// the first CMD0 is not interpreted as a command and gets lost.
    /// Retrying the command recovers those cards.
    fn go_idle_state(&mut self) -> Result<(), Error> {
        for _attempt in 0..CMD0_RETRIES {
            trace!("Enter SPI mode, attempt {}", _attempt + 1);
            match self.card_command(CMD0, 0) {
                Ok(response) if response.r1 == R1_IDLE_STATE => return Ok(()),
                Ok(_response) => {
                    warn!("Unexpected CMD0 response {:x}, retrying", _response.r1);
                }
                // Anything else is just a failed attempt; only the verdict
                // after the last retry matters.
                Err(_) => {}
            }
            self.delayer.delay_ms(1);
        }
        Err(Error::NoDevice)
    }

    /// CMD8 tells v1.x and v2.x cards apart: v1.x cards reject it as
    /// illegal, v2.x cards echo the voltage range and check pattern.
    fn check_interface_condition(&mut self) -> Result<(), Error> {
        match self.card_command(CMD8, CMD8_IF_COND_ARG) {
            Ok(response) => {
                if response.payload & CMD8_PATTERN_MASK != CMD8_IF_COND_ARG {
                    warn!("CMD8 pattern mismatch: {:x}", response.payload);
                    self.card_type = Some(CardType::Unknown);
                    return Err(Error::Unusable);
                }
                Ok(())
            }
            // A v1.x card; settled for good after ACMD41 converges.
            Err(Error::Unsupported) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Capacity decoding
    // =========================================================================

    /// Read the 'card specific data' register.
    fn read_csd(&mut self) -> Result<Csd, Error> {
        let response = self.card_command(CMD9, 0)?;
        if response.r1 != R1_READY_STATE {
            return Err(Error::DeviceError);
        }
        let mut data = [FILL_BYTE; 16];
        self.read_data(&mut data)?;
        Csd::parse(data).ok_or_else(|| {
            warn!("Unsupported CSD structure");
            Error::DeviceError
        })
    }

    // =========================================================================
    // Block I/O
    // =========================================================================

    /// Read one or more blocks, starting at the given byte address.
    pub(crate) fn read(&mut self, buffer: &mut [u8], address: u64) -> Result<(), Error> {
        let arg = self.block_address(address);
        let block_count = buffer.len() / BLOCK_LEN;
        let cmd = if block_count > 1 { CMD18 } else { CMD17 };

        let (first, rest) = buffer.split_at_mut(BLOCK_LEN);
        let mut arrived = false;
        for _ in 0..READ_RETRIES {
            self.card_command(cmd, arg)?;
            // A missing start token on the first block means the command
            // was lost; re-issuing the read recovers it.
            match self.read_data(first) {
                Err(Error::NoResponse) => {
                    debug!("Start token missing, re-issuing read");
                }
                other => {
                    other?;
                    arrived = true;
                    break;
                }
            }
        }
        if !arrived {
            return Err(Error::NoResponse);
        }

        let mut status = Ok(());
        for block in rest.chunks_mut(BLOCK_LEN) {
            if let Err(e) = self.read_data(block) {
                status = Err(e);
                break;
            }
        }

        if block_count > 1 {
            // Stop the stream; its result only overrides a clean status.
            let stop = self.card_command(CMD12, 0).map(|_| ());
            if status.is_ok() {
                status = stop;
            }
        }
        status
    }

    /// Program one or more blocks, starting at the given byte address.
    pub(crate) fn program(&mut self, buffer: &[u8], address: u64) -> Result<(), Error> {
        let arg = self.block_address(address);
        let block_count = buffer.len() / BLOCK_LEN;

        if block_count == 1 {
            self.card_command(CMD24, arg)?;
            let response = self.write_data(DATA_START_BLOCK, buffer)?;
            let mut status = Ok(());
            if response == DATA_RES_CRC_ERROR || response == DATA_RES_WRITE_ERROR {
                debug!("Single block write rejected: {:x}", response);
                status = Err(Error::Write);
            }
            // The programming outcome is checked with SEND_STATUS; its
            // result only overrides a clean status.
            let sent = self.card_command(CMD13, 0).map(|_| ());
            if status.is_ok() {
                status = sent;
            }
            status
        } else {
            // Pre-erase hint; some cards are faster when told the block
            // count up front. Errors are ignored.
            let _ = self.card_acmd(ACMD23, block_count as u32);

            self.card_command(CMD25, arg)?;
            let mut response = DATA_RES_ACCEPTED;
            for block in buffer.chunks(BLOCK_LEN) {
                response = self.write_data(WRITE_MULTIPLE_TOKEN, block)?;
                if response != DATA_RES_ACCEPTED {
                    debug!("Multiple block write rejected: {:x}", response);
                    break;
                }
            }

            // The stream ends with the stop-tran token where the next
            // start token would go; then the card drains its buffers.
            self.select()?;
            let sent = self.write_bytes(&[STOP_TRAN_TOKEN]);
            let deselected = self.deselect();
            sent?;
            deselected?;
            if self.wait_ready(Delay::new_command()).is_err() {
                debug!("Card still busy after stop tran");
            }

            if response == DATA_RES_ACCEPTED {
                Ok(())
            } else {
                if response == DATA_RES_WRITE_ERROR {
                    self.report_well_written_blocks();
                }
                Err(Error::Write)
            }
        }
    }

    /// Erase a range of blocks. The card treats the end address as
    /// inclusive, so the last block is at `address + length - 512`.
    pub(crate) fn erase(&mut self, address: u64, length: u64) -> Result<(), Error> {
        let mut start = address;
        let mut span = length - BLOCK_LEN_U64;
        if self.card_type == Some(CardType::SDHC) {
            start /= BLOCK_LEN_U64;
            span /= BLOCK_LEN_U64;
        }
        self.card_command(CMD32, start as u32)?;
        self.card_command(CMD33, (start + span) as u32)?;
        // R1b busy handling for CMD38 lives in the command engine.
        self.card_command(CMD38, 0)?;
        Ok(())
    }

    /// After a write error in a multiple block stream, ask the card how
    /// many blocks actually made it. Diagnostic only.
    fn report_well_written_blocks(&mut self) {
        if self.card_acmd(ACMD22, 0).is_err() {
            return;
        }
        let mut count = [FILL_BYTE; 4];
        if self.read_data(&mut count).is_ok() {
            debug!(
                "Blocks written without errors: {}",
                u32::from_be_bytes(count)
            );
        }
    }

    /// SDSC cards take byte addresses on the wire; SDHC and SDXC cards
    /// take 512-byte block addresses.
    fn block_address(&self, address: u64) -> u32 {
        if self.card_type == Some(CardType::SDHC) {
            (address / BLOCK_LEN_U64) as u32
        } else {
            address as u32
        }
    }

    // =========================================================================
    // Command engine
    // =========================================================================

    /// Perform a command, collecting the full response for its opcode.
    fn card_command(&mut self, cmd: u8, arg: u32) -> Result<Response, Error> {
        self.card_command_inner(cmd, arg, false)
    }

    /// Perform an application-specific command (CMD55 prefix).
    fn card_acmd(&mut self, cmd: u8, arg: u32) -> Result<Response, Error> {
        self.card_command_inner(cmd, arg, true)
    }

    fn card_command_inner(&mut self, cmd: u8, arg: u32, is_acmd: bool) -> Result<Response, Error> {
        self.select()?;
        let result = self.selected_command(cmd, arg, is_acmd);
        let deselected = self.deselect();
        let response = result?;
        deselected?;
        Ok(response)
    }

    /// The body of a command sequence, run with the card selected.
    fn selected_command(&mut self, cmd: u8, arg: u32, is_acmd: bool) -> Result<Response, Error> {
        // A previous operation may still be programming. Give it time,
        // but attempt the command regardless if the card never lets go.
        if self.wait_ready(Delay::new_command()).is_err() {
            debug!("Card not ready before CMD{}", cmd);
        }

        // A card that keeps state across a host reset can swallow a
        // packet; the whole command, CMD55 prefix included, is retried.
        let mut r1 = R1_NO_RESPONSE;
        for _ in 0..CMD_RETRIES {
            if is_acmd {
                self.send_packet(CMD55, 0)?;
            }
            r1 = self.send_packet(cmd, arg)?;
            if r1 != R1_NO_RESPONSE {
                break;
            }
            debug!("No response to CMD{}, retrying", cmd);
        }

        if r1 == R1_NO_RESPONSE {
            return Err(Error::NoDevice);
        }
        if r1 & R1_COM_CRC_ERROR != 0 {
            warn!("CRC error on CMD{}", cmd);
            return Err(Error::Crc);
        }
        if r1 & R1_ILLEGAL_COMMAND != 0 {
            debug!("Illegal command CMD{}", cmd);
            if cmd == CMD8 {
                // Either a v1.x card or not an SD card at all.
                self.card_type = Some(CardType::Unknown);
            }
            return Err(Error::Unsupported);
        }

        if self.verbose {
            debug!("CMD{} arg {:x} R1 {:x}", cmd, arg, r1);
        }

        // Erase and parameter complaints are recorded, but must not skip
        // the response framing that follows.
        let mut status = Ok(());
        if r1 & (R1_ERASE_RESET | R1_ERASE_SEQUENCE_ERROR) != 0 {
            status = Err(Error::Erase);
        } else if r1 & (R1_ADDRESS_ERROR | R1_PARAMETER_ERROR) != 0 {
            status = Err(Error::Parameter);
        }

        let mut payload = 0u32;
        match cmd {
            CMD8 | CMD58 => {
                if cmd == CMD8 {
                    // Responding to CMD8 at all makes this a v2.x card.
                    self.card_type = Some(CardType::SD2);
                }
                // R3/R7: four payload bytes follow R1.
                let mut buffer = [FILL_BYTE; 4];
                self.transfer_bytes(&mut buffer)?;
                payload = u32::from_be_bytes(buffer);
                if self.verbose {
                    debug!("R3/R7 payload {:x}", payload);
                }
            }
            CMD12 | CMD38 => {
                // R1b: the card holds DO low until the operation is done.
                self.wait_ready(Delay::new_command())?;
            }
            _ if is_acmd && cmd == ACMD13 => {
                // R2: one more status byte follows R1.
                payload = u32::from(self.transfer_byte(FILL_BYTE)?);
            }
            _ => {}
        }

        status.map(|_| Response { r1, payload })
    }

    /// Send one 6-byte command packet and poll for its R1 response.
    ///
    /// Returns `R1_NO_RESPONSE` if the card never drove the bus.
    fn send_packet(&mut self, cmd: u8, arg: u32) -> Result<u8, Error> {
        let packet = command_packet(cmd, arg);
        self.write_bytes(&packet)?;

        // The byte right after CMD12 is a stuff byte; drop it before
        // looking for the response.
        if cmd == CMD12 {
            let _ = self.transfer_byte(FILL_BYTE)?;
        }

        // The response arrives within 0 to 8 bytes; the first byte with
        // the top bit clear is R1.
        for _ in 0..R1_POLL_TRIES {
            let byte = self.transfer_byte(FILL_BYTE)?;
            if byte & 0x80 == 0 {
                return Ok(byte);
            }
        }
        Ok(R1_NO_RESPONSE)
    }

    // =========================================================================
    // Data packets
    // =========================================================================

    /// Receive one data packet: wait for the start token, clock the
    /// payload in, and discard the trailing CRC.
    fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.select()?;
        let result = self.read_data_selected(buffer);
        let deselected = self.deselect();
        result?;
        deselected
    }

    fn read_data_selected(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.wait_token(DATA_START_BLOCK, Delay::new_token())?;
        buffer.fill(FILL_BYTE);
        self.transfer_bytes(buffer)?;
        // Two CRC bytes are always clocked; with CRC off they are junk.
        let mut crc = [FILL_BYTE; 2];
        self.transfer_bytes(&mut crc)?;
        Ok(())
    }

    /// Send one data packet and collect the data-response token, masked
    /// to its low five bits.
    fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<u8, Error> {
        self.select()?;
        let result = self.write_data_selected(token, buffer);
        let deselected = self.deselect();
        let response = result?;
        deselected?;
        Ok(response)
    }

    fn write_data_selected(&mut self, token: u8, buffer: &[u8]) -> Result<u8, Error> {
        // Checking busy before the packet instead of after lets the card
        // program the previous block while we line this one up.
        if self.wait_ready(Delay::new_command()).is_err() {
            debug!("Card not ready before data packet");
        }
        self.write_bytes(&[token])?;
        self.write_bytes(buffer)?;
        // Dummy CRC; the card ignores it with CRC off.
        self.write_bytes(&[FILL_BYTE, FILL_BYTE])?;
        Ok(self.transfer_byte(FILL_BYTE)? & DATA_RES_MASK)
    }

    // =========================================================================
    // Serial framing
    // =========================================================================

    fn select(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(|_| Error::Gpio)
    }

    fn deselect(&mut self) -> Result<(), Error> {
        // Finish any in-flight words before releasing the card.
        self.bus.flush().map_err(|_| Error::Transport)?;
        self.cs.set_high().map_err(|_| Error::Gpio)
    }

    /// Send one byte and return the byte clocked in simultaneously.
    fn transfer_byte(&mut self, out: u8) -> Result<u8, Error> {
        let mut buffer = [out];
        self.bus
            .transfer_in_place(&mut buffer)
            .map_err(|_| Error::Transport)?;
        Ok(buffer[0])
    }

    /// Send multiple bytes and ignore what comes back.
    fn write_bytes(&mut self, out: &[u8]) -> Result<(), Error> {
        self.bus.write(out).map_err(|_| Error::Transport)
    }

    /// Send multiple bytes and replace them with what comes back.
    fn transfer_bytes(&mut self, in_out: &mut [u8]) -> Result<(), Error> {
        self.bus
            .transfer_in_place(in_out)
            .map_err(|_| Error::Transport)
    }

    /// Spin until the card releases DO high, or the deadline passes.
    fn wait_ready(&mut self, mut delay: Delay) -> Result<(), Error> {
        loop {
            if self.transfer_byte(FILL_BYTE)? == FILL_BYTE {
                return Ok(());
            }
            delay.delay(&mut self.delayer, Error::NoResponse)?;
        }
    }

    /// Spin until the card sends the given token, or the deadline passes.
    fn wait_token(&mut self, token: u8, mut delay: Delay) -> Result<(), Error> {
        loop {
            if self.transfer_byte(FILL_BYTE)? == token {
                return Ok(());
            }
            delay.delay(&mut self.delayer, Error::NoResponse)?;
        }
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
