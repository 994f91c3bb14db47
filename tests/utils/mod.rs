//! Useful library code for tests

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use alx_sd::{proto, BlockTransport, Clock, SdCard, SdCardOptions, TransportError, BLOCK_LEN};
use embedded_hal::delay::DelayNs;

/// A v2 CSD for a 3.9 GB card (7,710,720 blocks).
pub static CSD_V2: [u8; 16] = [
    0x40, 0x0E, 0x00, 0x32, 0x5B, 0x59, 0x00, 0x00, 0x1D, 0x69, 0x7F, 0x80, 0x0A, 0x40, 0x00, 0x8B,
];

/// A SanDisk "SU08G" CID, made in December 2016.
pub static CID: [u8; 16] = [
    0x03, 0x53, 0x44, 0x53, 0x55, 0x30, 0x38, 0x47, 0x80, 0x12, 0x34, 0x56, 0x78, 0x01, 0x0C, 0x3F,
];

/// What the card is doing with the bytes it is given.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    /// Waiting for a command frame
    Command,
    /// Streaming blocks after CMD18
    Reading { block: u32 },
    /// Taking blocks after CMD25. `data` is `Some` between a start token and
    /// the end of the block.
    Writing { block: u32, data: Option<Vec<u8>> },
}

/// An SD card in SPI mode, simulated in RAM.
///
/// It only understands the commands the driver sends, answers every
/// command after one NCR byte, and clocks out 0xFF when it has nothing to
/// say.
pub struct SimCard {
    // The card
    blocks: HashMap<u32, Vec<u8>>,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub high_capacity: bool,
    ready: bool,
    app_cmd: bool,
    mode: Mode,
    frame: Vec<u8>,
    miso: VecDeque<u8>,
    cs_low: bool,

    // Faults
    /// ACMD41 reports "idle" this many times before "ready"
    pub acmd41_busy_polls: u32,
    /// Ignore the next N frames of the given command
    pub unresponsive: HashMap<u8, usize>,
    /// Fail the next N bus operations
    pub fail_bus_ops: usize,
    /// Answer every data block with "write error"
    pub reject_writes: bool,
    /// Never send a start token after CMD18
    pub stall_reads: bool,
    /// R2 for CMD13
    pub r2_status: u8,
    pub fail_transport_init: bool,
    pub fail_transport_deinit: bool,

    // Accounting
    /// Every command frame seen, as (index, argument)
    pub commands: Vec<(u8, u32)>,
    pub power_up_sequences: usize,
    pub cs_asserts: usize,
    pub cs_deasserts: usize,
    /// Asserts while already asserted, and deasserts while already released
    pub cs_violations: usize,
    pub bus_ops: usize,
    pub transport_inits: usize,
    pub transport_deinits: usize,
}

impl Default for SimCard {
    fn default() -> Self {
        SimCard {
            blocks: HashMap::new(),
            csd: CSD_V2,
            cid: CID,
            high_capacity: true,
            ready: false,
            app_cmd: false,
            mode: Mode::Command,
            frame: Vec::new(),
            miso: VecDeque::new(),
            cs_low: false,
            acmd41_busy_polls: 3,
            unresponsive: HashMap::new(),
            fail_bus_ops: 0,
            reject_writes: false,
            stall_reads: false,
            r2_status: 0x00,
            fail_transport_init: false,
            fail_transport_deinit: false,
            commands: Vec::new(),
            power_up_sequences: 0,
            cs_asserts: 0,
            cs_deasserts: 0,
            cs_violations: 0,
            bus_ops: 0,
            transport_inits: 0,
            transport_deinits: 0,
        }
    }
}

impl SimCard {
    pub fn new() -> SimCard {
        SimCard::default()
    }

    /// The contents of a block. Blocks never written read as zeros.
    pub fn block(&self, idx: u32) -> Vec<u8> {
        self.blocks
            .get(&idx)
            .cloned()
            .unwrap_or_else(|| vec![0u8; BLOCK_LEN])
    }

    pub fn set_block(&mut self, idx: u32, data: &[u8]) {
        assert_eq!(data.len(), BLOCK_LEN);
        self.blocks.insert(idx, data.to_vec());
    }

    pub fn blocks_written(&self) -> usize {
        self.blocks.len()
    }

    /// Just the command indices, in order.
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|(idx, _)| *idx).collect()
    }

    pub fn count_commands(&self, index: u8) -> usize {
        self.commands.iter().filter(|(idx, _)| *idx == index).count()
    }

    pub fn cs_asserted(&self) -> bool {
        self.cs_low
    }

    /// Every assert was matched by a deassert, and CS is released now.
    pub fn cs_balanced(&self) -> bool {
        !self.cs_low && self.cs_violations == 0 && self.cs_asserts == self.cs_deasserts
    }

    fn bus_op(&mut self) -> Result<(), TransportError> {
        self.bus_ops += 1;
        if self.fail_bus_ops > 0 {
            self.fail_bus_ops -= 1;
            Err(TransportError::Spi)
        } else {
            Ok(())
        }
    }

    fn power_up(&mut self) {
        self.power_up_sequences += 1;
        self.ready = false;
        self.app_cmd = false;
        self.mode = Mode::Command;
        self.frame.clear();
        self.miso.clear();
    }

    /// One byte each way.
    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.cs_low {
            return 0xFF;
        }
        let miso = self.next_miso();
        self.accept(mosi);
        miso
    }

    fn next_miso(&mut self) -> u8 {
        if self.miso.is_empty() && !self.stall_reads {
            if let Mode::Reading { block } = self.mode {
                let data = self.block(block);
                self.miso
                    .extend([0xFF, 0xFF, 0xFF, proto::DATA_START_BLOCK]);
                self.miso.extend(data);
                self.miso.extend([0x00, 0x00]);
                self.mode = Mode::Reading { block: block + 1 };
            }
        }
        self.miso.pop_front().unwrap_or(0xFF)
    }

    fn accept(&mut self, mosi: u8) {
        if !self.frame.is_empty() {
            self.frame.push(mosi);
            if self.frame.len() == 6 {
                let frame = std::mem::take(&mut self.frame);
                self.execute(&frame);
            }
            return;
        }
        match std::mem::replace(&mut self.mode, Mode::Command) {
            Mode::Writing {
                block,
                data: Some(mut data),
            } => {
                data.push(mosi);
                if data.len() == BLOCK_LEN + 2 {
                    self.finish_block(block, &data[..BLOCK_LEN]);
                } else {
                    self.mode = Mode::Writing {
                        block,
                        data: Some(data),
                    };
                }
            }
            Mode::Writing { block, data: None } => match mosi {
                proto::WRITE_MULTIPLE_TOKEN => {
                    self.mode = Mode::Writing {
                        block,
                        data: Some(Vec::with_capacity(BLOCK_LEN + 2)),
                    };
                }
                proto::STOP_TRAN_TOKEN => {
                    // One byte, then busy for a bit
                    self.miso.extend([0xFF, 0x00, 0x00, 0xFF]);
                }
                b if is_frame_start(b) => self.start_frame(b),
                _ => self.mode = Mode::Writing { block, data: None },
            },
            other => {
                if is_frame_start(mosi) {
                    self.start_frame(mosi);
                } else {
                    self.mode = other;
                }
            }
        }
    }

    fn start_frame(&mut self, first: u8) {
        self.miso.clear();
        self.frame.push(first);
    }

    fn finish_block(&mut self, block: u32, data: &[u8]) {
        if self.reject_writes {
            self.miso.push_back(0x0D);
            self.mode = Mode::Writing { block, data: None };
        } else {
            self.blocks.insert(block, data.to_vec());
            self.miso.extend([0xE5, 0x00, 0x00, 0xFF]);
            self.mode = Mode::Writing {
                block: block + 1,
                data: None,
            };
        }
    }

    fn block_of(&self, address: u32) -> u32 {
        if self.high_capacity {
            address
        } else {
            address / BLOCK_LEN as u32
        }
    }

    /// Queue an answer, after one NCR byte.
    fn respond(&mut self, bytes: &[u8]) {
        self.miso.push_back(0xFF);
        self.miso.extend(bytes.iter().copied());
    }

    fn respond_packet(&mut self, data: &[u8]) {
        self.miso
            .extend([0xFF, 0xFF, 0xFF, proto::DATA_START_BLOCK]);
        self.miso.extend(data.iter().copied());
        self.miso.extend([0x00, 0x00]);
    }

    fn execute(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let crc = frame[5];
        let app = std::mem::take(&mut self.app_cmd);
        self.commands.push((index, arg));

        if let Some(count) = self.unresponsive.get_mut(&index) {
            if *count > 0 {
                *count -= 1;
                return;
            }
        }

        let status = if self.ready {
            proto::R1_READY_STATE
        } else {
            proto::R1_IDLE_STATE
        };
        match (app, index) {
            (_, proto::CMD0) => {
                if crc == 0x95 {
                    self.ready = false;
                    self.respond(&[proto::R1_IDLE_STATE]);
                } else {
                    // COM CRC error
                    self.respond(&[status | 0x08]);
                }
            }
            (false, proto::CMD8) => {
                if crc == 0x87 {
                    self.respond(&[status, 0x00, 0x00, ((arg >> 8) & 0x0F) as u8, arg as u8]);
                } else {
                    self.respond(&[status | 0x08]);
                }
            }
            (false, proto::CMD58) => {
                let ocr_top = match (self.ready, self.high_capacity) {
                    (false, _) => 0x00,
                    (true, false) => 0x80,
                    (true, true) => 0xC0,
                };
                self.respond(&[status, ocr_top, 0xFF, 0x80, 0x00]);
            }
            (false, proto::CMD55) => {
                self.app_cmd = true;
                self.respond(&[status]);
            }
            (true, proto::ACMD41) => {
                if self.acmd41_busy_polls > 0 {
                    self.acmd41_busy_polls -= 1;
                    self.respond(&[proto::R1_IDLE_STATE]);
                } else {
                    self.ready = true;
                    self.respond(&[proto::R1_READY_STATE]);
                }
            }
            (false, proto::CMD9) if self.ready => {
                self.respond(&[status]);
                let csd = self.csd;
                self.respond_packet(&csd);
            }
            (false, proto::CMD10) if self.ready => {
                self.respond(&[status]);
                let cid = self.cid;
                self.respond_packet(&cid);
            }
            (false, proto::CMD18) if self.ready => {
                self.respond(&[status]);
                self.mode = Mode::Reading {
                    block: self.block_of(arg),
                };
            }
            (false, proto::CMD12) => {
                // R1b
                self.respond(&[status, 0x00, 0x00, 0xFF]);
            }
            (true, proto::ACMD23) if self.ready => {
                self.respond(&[status]);
            }
            (false, proto::CMD25) if self.ready => {
                self.respond(&[status]);
                self.mode = Mode::Writing {
                    block: self.block_of(arg),
                    data: None,
                };
            }
            (false, proto::CMD13) => {
                let r2 = self.r2_status;
                self.respond(&[status, r2]);
            }
            _ => {
                self.respond(&[status | proto::R1_ILLEGAL_COMMAND]);
            }
        }
    }
}

fn is_frame_start(byte: u8) -> bool {
    byte & 0xC0 == 0x40
}

impl BlockTransport for SimCard {
    fn assert_cs(&mut self) {
        if self.cs_low {
            self.cs_violations += 1;
        }
        self.cs_low = true;
        self.cs_asserts += 1;
    }

    fn deassert_cs(&mut self) {
        if !self.cs_low {
            self.cs_violations += 1;
        }
        self.cs_low = false;
        self.cs_deasserts += 1;
    }

    fn write(&mut self, data: &[u8], _: u8, _: u16) -> Result<(), TransportError> {
        self.bus_op()?;
        if !self.cs_low && data.len() >= 10 && data.iter().all(|&b| b == 0xFF) {
            self.power_up();
        }
        for &b in data {
            self.exchange(b);
        }
        Ok(())
    }

    fn read(&mut self, data: &mut [u8], _: u8, _: u16) -> Result<(), TransportError> {
        self.bus_op()?;
        for b in data.iter_mut() {
            *b = self.exchange(0xFF);
        }
        Ok(())
    }

    fn write_read(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        _: u8,
        _: u16,
    ) -> Result<(), TransportError> {
        self.bus_op()?;
        if tx.len() != rx.len() {
            return Err(TransportError::Length);
        }
        for (t, r) in tx.iter().zip(rx.iter_mut()) {
            *r = self.exchange(*t);
        }
        Ok(())
    }

    fn init(&mut self) -> Result<(), TransportError> {
        if self.fail_transport_init {
            return Err(TransportError::Spi);
        }
        self.transport_inits += 1;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), TransportError> {
        if self.fail_transport_deinit {
            return Err(TransportError::Spi);
        }
        self.transport_deinits += 1;
        Ok(())
    }
}

/// A clock that moves on by 1 ms every time it is read, and by however long
/// the [`TestDelay`] sleeps.
#[derive(Clone, Default)]
pub struct TestClock {
    now: Rc<Cell<u64>>,
}

impl TestClock {
    pub fn now(&self) -> u64 {
        self.now.get()
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.set(self.now.get() + 1);
        self.now.get()
    }
}

/// Records every millisecond delay, and counts poll pauses.
#[derive(Clone)]
pub struct TestDelay {
    now: Rc<Cell<u64>>,
    waits: Rc<RefCell<Vec<u32>>>,
    polls: Rc<Cell<usize>>,
}

impl TestDelay {
    pub fn new(clock: &TestClock) -> TestDelay {
        TestDelay {
            now: clock.now.clone(),
            waits: Rc::new(RefCell::new(Vec::new())),
            polls: Rc::new(Cell::new(0)),
        }
    }

    /// Every `delay_ms` so far, in order.
    pub fn waits(&self) -> Vec<u32> {
        self.waits.borrow().clone()
    }

    pub fn polls(&self) -> usize {
        self.polls.get()
    }
}

impl DelayNs for TestDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.now.set(self.now.get() + u64::from(ns / 1_000_000));
    }

    fn delay_us(&mut self, _us: u32) {
        self.polls.set(self.polls.get() + 1);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.waits.borrow_mut().push(ms);
        self.now.set(self.now.get() + u64::from(ms));
    }
}

pub type TestSdCard = SdCard<SimCard, TestDelay, TestClock>;

/// Options with short timeouts, so failing tests fail quickly.
pub fn fast_options() -> SdCardOptions {
    SdCardOptions {
        cmd_resp_timeout_ms: 20,
        acmd41_timeout_ms: 50,
        block_read_start_token_timeout_ms: 20,
        block_write_start_token_timeout_ms: 20,
        block_write_stop_token_timeout_ms: 20,
        ..Default::default()
    }
}

/// Build a driver around `card`, returning a handle on its delayer.
pub fn make_sdcard(card: SimCard, options: SdCardOptions) -> (TestSdCard, TestDelay) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = TestClock::default();
    let delay = TestDelay::new(&clock);
    let sdcard = SdCard::new_with_options(card, delay.clone(), clock, options);
    (sdcard, delay)
}

/// A driver around a fresh card that has already been initialised.
pub fn ready_sdcard() -> (TestSdCard, TestDelay) {
    let (sdcard, delay) = make_sdcard(SimCard::new(), fast_options());
    sdcard.init(1, 0).expect("init simulated card");
    (sdcard, delay)
}

/// Some recognisable data for `num_blocks` blocks.
pub fn pattern(num_blocks: usize, seed: u8) -> Vec<u8> {
    (0..num_blocks * BLOCK_LEN)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ ((i / BLOCK_LEN) as u8))
        .collect()
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
