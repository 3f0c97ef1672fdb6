//! Useful library code for tests.
//!
//! Wire traffic is scripted transaction-by-transaction with
//! `embedded-hal-mock`; the helpers below build the byte streams for whole
//! protocol episodes (a command with its select/deselect bracket, a data
//! packet, an initialization handshake) so the test bodies stay readable.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use embedded_hal::spi::{ErrorType, SpiBus};
use embedded_hal_mock::eh1::delay::NoopDelay;
use embedded_hal_mock::eh1::digital::{
    Mock as PinMock, State as PinState, Transaction as PinTransaction,
};
use embedded_hal_mock::eh1::spi::{Mock as SpiMock, Transaction as SpiTransaction};
use hex_literal::hex;

use embedded_sdspi::sdcard::proto::{command_packet, CMD12};
use embedded_sdspi::{BusClock, Options, SdBlockDevice};

/// A real CSD register from a 4 GB SDHC card: 7,710,720 blocks.
pub const CSD_V2: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");
/// Capacity encoded in [`CSD_V2`], in bytes.
pub const CSD_V2_BYTES: u64 = 3_947_888_640;

/// A real CSD register from a 1 GB v1.x card: 1,984,000 blocks.
pub const CSD_V1: [u8; 16] = hex!("00 26 00 32 5F 59 83 C8 AD DB CF FF D2 40 40 A5");
/// Capacity encoded in [`CSD_V1`], in bytes.
pub const CSD_V1_BYTES: u64 = 1_015_808_000;

/// Polls performed before a 300 ms data-token wait gives up
/// (one poll every 10 µs, plus the poll that trips the deadline).
pub const TOKEN_TIMEOUT_POLLS: usize = 30_001;

/// An `SpiBus` mock that also records [`BusClock`] reconfigurations.
pub struct ClockedSpi {
    spi: SpiMock<u8>,
    frequencies: Rc<RefCell<Vec<u32>>>,
}

impl ClockedSpi {
    /// Wrap a scripted SPI mock; returns the shared frequency log.
    pub fn new(expectations: &[SpiTransaction<u8>]) -> (ClockedSpi, Rc<RefCell<Vec<u32>>>) {
        let frequencies = Rc::new(RefCell::new(Vec::new()));
        (
            ClockedSpi {
                spi: SpiMock::new(expectations),
                frequencies: frequencies.clone(),
            },
            frequencies,
        )
    }

    pub fn done(&mut self) {
        self.spi.done();
    }
}

impl ErrorType for ClockedSpi {
    type Error = <SpiMock<u8> as ErrorType>::Error;
}

impl SpiBus<u8> for ClockedSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.read(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.spi.write(words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.spi.transfer(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.spi.transfer_in_place(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.spi.flush()
    }
}

impl BusClock for ClockedSpi {
    fn set_frequency(&mut self, hz: u32) {
        self.frequencies.borrow_mut().push(hz);
    }
}

/// Everything a scripted driver test needs in one place.
pub struct Rig {
    pub sd: SdBlockDevice<ClockedSpi, PinMock, NoopDelay>,
    pub frequencies: Rc<RefCell<Vec<u32>>>,
}

impl Rig {
    pub fn new(script: &Script) -> Rig {
        Self::with_options(script, Options::default())
    }

    pub fn with_options(script: &Script, options: Options) -> Rig {
        let (spi, frequencies) = ClockedSpi::new(&script.spi);
        let cs = PinMock::new(&script.pin);
        let sd = SdBlockDevice::new_with_options(spi, cs, NoopDelay::new(), options);
        Rig { sd, frequencies }
    }

    /// Check every scripted transaction was consumed.
    pub fn done(self) {
        let (mut spi, mut cs, _delay) = self.sd.free();
        spi.done();
        cs.done();
    }
}

/// What follows R1 on the wire for a particular opcode.
pub enum Resp {
    /// Nothing; R1 is the whole response.
    R1,
    /// R3/R7: four payload bytes, big-endian.
    Payload(u32),
    /// R1b: this many busy bytes, then the line releases high.
    Busy(usize),
}

/// A paired SPI + CS expectation script.
#[derive(Default)]
pub struct Script {
    pub spi: Vec<SpiTransaction<u8>>,
    pub pin: Vec<PinTransaction>,
}

fn xfer(response: u8) -> SpiTransaction<u8> {
    SpiTransaction::transfer_in_place(vec![0xFF], vec![response])
}

impl Script {
    pub fn new() -> Script {
        Script::default()
    }

    fn select(&mut self) {
        self.pin.push(PinTransaction::set(PinState::Low));
        // Pre-command busy check; an idle card answers 0xFF at once.
        self.spi.push(xfer(0xFF));
    }

    fn deselect(&mut self) {
        self.spi.push(SpiTransaction::flush());
        self.pin.push(PinTransaction::set(PinState::High));
    }

    /// The power-up ritual: CS high, ten idle bytes.
    pub fn prime(&mut self) {
        self.pin.push(PinTransaction::set(PinState::High));
        self.spi
            .push(SpiTransaction::write_vec(vec![0xFF; 10]));
        self.spi.push(SpiTransaction::flush());
    }

    fn packet(&mut self, opcode: u8, arg: u32, r1: u8) {
        self.spi
            .push(SpiTransaction::write_vec(command_packet(opcode, arg).to_vec()));
        if opcode == CMD12 {
            // Stuff byte.
            self.spi.push(xfer(0xFF));
        }
        self.spi.push(xfer(r1));
    }

    fn resp(&mut self, resp: Resp) {
        match resp {
            Resp::R1 => {}
            Resp::Payload(value) => {
                self.spi.push(SpiTransaction::transfer_in_place(
                    vec![0xFF; 4],
                    value.to_be_bytes().to_vec(),
                ));
            }
            Resp::Busy(busy) => {
                for _ in 0..busy {
                    self.spi.push(xfer(0x00));
                }
                self.spi.push(xfer(0xFF));
            }
        }
    }

    /// One command episode: select, busy check, packet, response,
    /// deselect.
    pub fn cmd(&mut self, opcode: u8, arg: u32, r1: u8, resp: Resp) {
        self.select();
        self.packet(opcode, arg, r1);
        self.resp(resp);
        self.deselect();
    }

    /// One application command episode: the CMD55 prefix rides in the
    /// same selected region.
    pub fn acmd(&mut self, opcode: u8, arg: u32, r55: u8, r1: u8) {
        self.select();
        self.packet(55, 0, r55);
        self.packet(opcode, arg, r1);
        self.deselect();
    }

    /// A command episode where the card never drives a response: the
    /// driver polls 16 times per attempt and retries the packet 3 times.
    pub fn cmd_no_response(&mut self, opcode: u8, arg: u32) {
        self.select();
        for _ in 0..3 {
            self.spi
                .push(SpiTransaction::write_vec(command_packet(opcode, arg).to_vec()));
            for _ in 0..16 {
                self.spi.push(xfer(0xFF));
            }
        }
        self.deselect();
    }

    /// One data-reception episode: 0xFE token after `token_misses` fill
    /// bytes, then the payload, then two junk CRC bytes.
    pub fn data_read(&mut self, token_misses: usize, payload: &[u8]) {
        self.pin.push(PinTransaction::set(PinState::Low));
        for _ in 0..token_misses {
            self.spi.push(xfer(0xFF));
        }
        self.spi.push(xfer(0xFE));
        self.spi.push(SpiTransaction::transfer_in_place(
            vec![0xFF; payload.len()],
            payload.to_vec(),
        ));
        self.spi
            .push(SpiTransaction::transfer_in_place(vec![0xFF; 2], vec![0xAA, 0xBB]));
        self.deselect();
    }

    /// A data-reception episode whose start token never arrives.
    pub fn data_read_timeout(&mut self) {
        self.pin.push(PinTransaction::set(PinState::Low));
        for _ in 0..TOKEN_TIMEOUT_POLLS {
            self.spi.push(xfer(0xFF));
        }
        self.deselect();
    }

    /// One data-transmission episode: busy check, start token, payload,
    /// dummy CRC, data-response token.
    pub fn data_write(&mut self, token: u8, payload: &[u8], response: u8) {
        self.select();
        self.spi.push(SpiTransaction::write_vec(vec![token]));
        self.spi
            .push(SpiTransaction::write_vec(payload.to_vec()));
        self.spi
            .push(SpiTransaction::write_vec(vec![0xFF, 0xFF]));
        self.spi.push(xfer(response));
        self.deselect();
    }

    /// The stop-tran token that ends a multiple block write, followed by
    /// the busy drain the card performs after deselection.
    pub fn stop_tran(&mut self, busy: usize) {
        self.pin.push(PinTransaction::set(PinState::Low));
        self.spi.push(SpiTransaction::write_vec(vec![0xFD]));
        self.deselect();
        for _ in 0..busy {
            self.spi.push(xfer(0x00));
        }
        self.spi.push(xfer(0xFF));
    }

    /// The full handshake for a v2.x high-capacity card, up to and
    /// including the switch to the transfer clock.
    pub fn init_v2hc(&mut self) {
        self.prime();
        self.cmd(0, 0, 0x01, Resp::R1);
        self.cmd(8, 0x1AA, 0x01, Resp::Payload(0x0000_01AA));
        self.cmd(59, 0, 0x01, Resp::R1);
        self.cmd(58, 0, 0x01, Resp::Payload(0xC0FF_8000));
        self.acmd(41, 0x4000_0000, 0x01, 0x01);
        self.acmd(41, 0x4000_0000, 0x01, 0x01);
        self.acmd(41, 0x4000_0000, 0x01, 0x00);
        self.cmd(58, 0, 0x00, Resp::Payload(0xC0FF_8000));
        self.cmd(9, 0, 0x00, Resp::R1);
        self.data_read(0, &CSD_V2);
        self.cmd(16, 512, 0x00, Resp::R1);
    }

    /// The full handshake for a v1.x standard-capacity card: CMD8 is
    /// rejected as illegal and the capacity class is never queried.
    pub fn init_v1(&mut self) {
        self.prime();
        self.cmd(0, 0, 0x01, Resp::R1);
        self.cmd(8, 0x1AA, 0x05, Resp::R1);
        self.cmd(59, 0, 0x01, Resp::R1);
        self.cmd(58, 0, 0x01, Resp::Payload(0x00FF_8000));
        self.acmd(41, 0, 0x01, 0x01);
        self.acmd(41, 0, 0x01, 0x00);
        self.cmd(9, 0, 0x00, Resp::R1);
        self.data_read(0, &CSD_V1);
        self.cmd(16, 512, 0x00, Resp::R1);
    }
}

/// A block of test data where every byte derives from its offset.
pub fn patterned_block(seed: u8) -> Vec<u8> {
    (0..512).map(|i| (i as u8).wrapping_add(seed)).collect()
}
