//! The SD Card driver
//!
//! Implements the SD SPI-mode protocol on top of a [`BlockTransport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod proto;

mod block_io;
mod command;
mod init;
mod transport;

pub use transport::*;

use core::cell::RefCell;

use embedded_hal::delay::DelayNs;
use proto::{Cid, Csd, Ocr};

use crate::{debug, warn, Block, BlockCount, BlockDevice, BlockIdx, Clock, BLOCK_LEN};

// =============================================================================
// Types and Implementations
// =============================================================================

/// Represents an SD Card on a [`BlockTransport`].
///
/// Built from a transport, something that can pause for a while, and a
/// millisecond clock for the timeouts.
///
/// All the APIs take `&self` - mutability is handled using an inner `RefCell`.
pub struct SdCard<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    inner: RefCell<SdCardInner<T, D, C>>,
}

impl<T, D, C> SdCard<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    /// Create a new SD Card driver.
    ///
    /// Uses the default options. Nothing is sent to the card until you call
    /// [`SdCard::init`].
    pub fn new(transport: T, delayer: D, clock: C) -> SdCard<T, D, C> {
        Self::new_with_options(transport, delayer, clock, SdCardOptions::default())
    }

    /// Create a new SD Card driver using the given options.
    pub fn new_with_options(
        transport: T,
        delayer: D,
        clock: C,
        options: SdCardOptions,
    ) -> SdCard<T, D, C> {
        SdCard {
            inner: RefCell::new(SdCardInner {
                transport,
                delayer,
                clock,
                options,
                card_info: None,
            }),
        }
    }

    /// Bring the card up: power-up clocks, CMD0, CMD8, CMD58, ACMD41, CMD58,
    /// CMD9 and CMD10.
    ///
    /// Waits `new_try_wait_time_ms` before each of the `num_of_tries`
    /// attempts. A failure at any step throws the attempt away and the next
    /// one starts again from the power-up clocks.
    pub fn init(&self, num_of_tries: u8, new_try_wait_time_ms: u16) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.init(num_of_tries, new_try_wait_time_ms)
    }

    /// Put the card back in the idle state (power-up clocks and CMD0) and
    /// release the transport.
    pub fn deinit(&self, num_of_tries: u8, new_try_wait_time_ms: u16) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.deinit(num_of_tries, new_try_wait_time_ms)
    }

    /// Read `num_of_blocks` blocks starting at `start_address` into `buffer`,
    /// which must be exactly `num_of_blocks * 512` bytes long.
    ///
    /// `start_address` goes to the card as-is: a block number for SDHC/SDXC
    /// cards, a byte offset for standard capacity cards.
    pub fn read_block(
        &self,
        num_of_blocks: u32,
        start_address: u32,
        buffer: &mut [u8],
        num_of_tries: u8,
        new_try_wait_time_ms: u16,
    ) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.read_block(
            num_of_blocks,
            start_address,
            buffer,
            num_of_tries,
            new_try_wait_time_ms,
        )
    }

    /// Write `num_of_blocks` blocks from `buffer` starting at
    /// `start_address`. Same addressing and length rules as
    /// [`SdCard::read_block`].
    pub fn write_block(
        &self,
        num_of_blocks: u32,
        start_address: u32,
        buffer: &[u8],
        num_of_tries: u8,
        new_try_wait_time_ms: u16,
    ) -> Result<(), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.write_block(
            num_of_blocks,
            start_address,
            buffer,
            num_of_tries,
            new_try_wait_time_ms,
        )
    }

    /// Has [`SdCard::init`] succeeded (and [`SdCard::deinit`] not been called
    /// since)?
    pub fn is_initialised(&self) -> bool {
        self.inner.borrow().card_info.is_some()
    }

    /// The registers read during the last successful [`SdCard::init`].
    pub fn card_info(&self) -> Option<CardInfo> {
        self.inner.borrow().card_info
    }

    /// The options this driver was built with.
    pub fn options(&self) -> SdCardOptions {
        self.inner.borrow().options
    }

    /// Return the usable size of this SD card in bytes.
    pub fn num_bytes(&self) -> Result<u64, Error> {
        let inner = self.inner.borrow();
        inner
            .card_info()
            .map(|info| u64::from(info.num_blocks.0) * BLOCK_LEN as u64)
    }

    /// Get a temporary borrow on the underlying transport. Useful if you
    /// need to re-clock the SPI.
    pub fn spi<R, F>(&self, func: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut inner = self.inner.borrow_mut();
        func(&mut inner.transport)
    }

    /// Destroy the driver and give back the transport, delayer and clock.
    pub fn free(self) -> (T, D, C) {
        let inner = self.inner.into_inner();
        (inner.transport, inner.delayer, inner.clock)
    }
}

impl<T, D, C> BlockDevice for SdCard<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    ///
    /// Does not initialise the card for you.
    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        debug!("Read {} blocks @ {}", blocks.len(), start_block_idx.0);
        let start_address = inner.card_address(start_block_idx)?;
        let num_of_blocks = u32::try_from(blocks.len()).map_err(|_| Error::BadBufferLength)?;
        let SdCardOptions {
            block_num_of_tries,
            block_new_try_wait_time_ms,
            ..
        } = inner.options;
        inner.read_block(
            num_of_blocks,
            start_address,
            blocks.as_flattened_mut(),
            block_num_of_tries,
            block_new_try_wait_time_ms,
        )
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut inner = self.inner.borrow_mut();
        debug!("Writing {} blocks @ {}", blocks.len(), start_block_idx.0);
        let start_address = inner.card_address(start_block_idx)?;
        let num_of_blocks = u32::try_from(blocks.len()).map_err(|_| Error::BadBufferLength)?;
        let SdCardOptions {
            block_num_of_tries,
            block_new_try_wait_time_ms,
            ..
        } = inner.options;
        inner.write_block(
            num_of_blocks,
            start_address,
            blocks.as_flattened(),
            block_num_of_tries,
            block_new_try_wait_time_ms,
        )
    }

    /// Determine how many blocks this device can hold.
    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        let inner = self.inner.borrow();
        inner
            .card_info()
            .map(|info| info.num_blocks)
    }
}

/// Represents an SD Card on a transport.
///
/// All the APIs required `&mut self`.
struct SdCardInner<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    transport: T,
    delayer: D,
    clock: C,
    options: SdCardOptions,
    card_info: Option<CardInfo>,
}

/// When the wait between attempts happens.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Backoff {
    /// Before every attempt, including the first (init and deinit).
    BeforeEveryTry,
    /// Only after a failed attempt (block transfers).
    BetweenTries,
}

impl<T, D, C> SdCardInner<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    fn card_info(&self) -> Result<CardInfo, Error> {
        self.card_info.ok_or(Error::NotInitialised)
    }

    /// Check the card is initialised.
    fn check_init(&self) -> Result<(), Error> {
        self.card_info().map(|_| ())
    }

    /// Turn a block index into the address the card expects.
    fn card_address(&self, idx: BlockIdx) -> Result<u32, Error> {
        if self.card_info()?.ocr.high_capacity() {
            Ok(idx.0)
        } else {
            idx.into_bytes().ok_or(Error::AddressOutOfRange)
        }
    }

    /// Run `attempt` up to `num_of_tries` times, pausing
    /// `new_try_wait_time_ms` according to `backoff`.
    fn retry<R, F>(
        &mut self,
        _what: &str,
        num_of_tries: u8,
        new_try_wait_time_ms: u16,
        backoff: Backoff,
        mut attempt: F,
    ) -> Result<R, Error>
    where
        F: FnMut(&mut Self) -> Result<R, AttemptError>,
    {
        let mut last = None;
        for try_no in 1..=num_of_tries {
            if backoff == Backoff::BeforeEveryTry || try_no > 1 {
                self.pause_ms(new_try_wait_time_ms);
            }
            match attempt(self) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "{} attempt {}/{} failed: {:?}",
                        _what,
                        try_no,
                        num_of_tries,
                        e
                    );
                    last = Some(e);
                }
            }
        }
        Err(Error::NumOfTries {
            tries: num_of_tries,
            last,
        })
    }

    fn pause_ms(&mut self, ms: u16) {
        if ms != 0 {
            self.delayer.delay_ms(u32::from(ms));
        }
    }
}

/// Options for talking to the card.
///
/// Timeouts are in milliseconds and are measured with the [`Clock`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SdCardOptions {
    /// How many times the transport retries each bus operation
    pub spi_num_of_tries: u8,
    /// Budget for each bus operation
    pub spi_timeout_ms: u16,
    /// How long to wait for R1 (and for R1b busy to clear)
    pub cmd_resp_timeout_ms: u16,
    /// How long ACMD41 may keep reporting the idle state
    pub acmd41_timeout_ms: u16,
    /// How long to wait for the 0xFE token before each block (or register)
    pub block_read_start_token_timeout_ms: u16,
    /// How long to wait for the data response after each written block
    pub block_write_start_token_timeout_ms: u16,
    /// How long the card may stay busy after each written block, and after
    /// the stop token
    pub block_write_stop_token_timeout_ms: u16,
    /// Pause between polls of the bus, in microseconds. 0 busy-polls.
    pub poll_interval_us: u32,
    /// Check the CMD8 echo and the OCR power-up bit. Some cards get these
    /// wrong, so it is off by default.
    pub check_long_responses: bool,
    /// Tries used by the [`BlockDevice`] impl
    pub block_num_of_tries: u8,
    /// Wait between tries used by the [`BlockDevice`] impl
    pub block_new_try_wait_time_ms: u16,
}

impl Default for SdCardOptions {
    fn default() -> Self {
        SdCardOptions {
            spi_num_of_tries: 3,
            spi_timeout_ms: 100,
            cmd_resp_timeout_ms: 100,
            acmd41_timeout_ms: 1000,
            block_read_start_token_timeout_ms: 100,
            block_write_start_token_timeout_ms: 100,
            block_write_stop_token_timeout_ms: 250,
            poll_interval_us: 0,
            check_long_responses: false,
            block_num_of_tries: 3,
            block_new_try_wait_time_ms: 0,
        }
    }
}

/// What we learnt about the card while initialising it.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardInfo {
    /// The OCR, read once the card left the idle state
    pub ocr: Ocr,
    /// The Card Specific Data
    pub csd: Csd,
    /// The capacity the CSD describes
    pub num_blocks: BlockCount,
    /// The Card Identification
    pub cid: Cid,
}

/// Why a single attempt at an operation failed.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// We got an error from the transport
    Transport(TransportError),
    /// We didn't get the expected R1 when executing this command
    TimeoutCommand(u8),
    /// The card stayed busy after this R1b command
    TimeoutBusy(u8),
    /// The card didn't leave the idle state for this application-specific
    /// command
    TimeoutACommand(u8),
    /// We didn't get a start token when reading data from the card
    TimeoutReadToken,
    /// We didn't get an accepted data response after writing a block
    TimeoutDataResponse,
    /// The card stayed busy after writing
    TimeoutWriteBusy,
    /// The bytes after R1 for this command were not what we expected
    ResponseMismatch(u8),
}

impl From<TransportError> for AttemptError {
    fn from(value: TransportError) -> Self {
        AttemptError::Transport(value)
    }
}

/// The possible errors this crate can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// The transport failed to open or close
    Transport(TransportError),
    /// Every attempt failed. Holds the number of attempts and why the last
    /// one failed.
    NumOfTries {
        /// How many attempts were made
        tries: u8,
        /// The failure of the last attempt, if there was one
        last: Option<AttemptError>,
    },
    /// Called `init` on a card that is already initialised
    AlreadyInitialised,
    /// The card must be initialised first
    NotInitialised,
    /// The buffer was empty or not `num_of_blocks * 512` bytes long
    BadBufferLength,
    /// The block index cannot be expressed as a byte address
    AddressOutOfRange,
}

/// Check the caller's buffer holds exactly `num_of_blocks` blocks.
fn check_buffer_len(num_of_blocks: u32, len: usize) -> Result<(), Error> {
    let expected = usize::try_from(num_of_blocks)
        .ok()
        .and_then(|n| n.checked_mul(BLOCK_LEN));
    match expected {
        Some(expected) if num_of_blocks != 0 && expected == len => Ok(()),
        _ => Err(Error::BadBufferLength),
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
