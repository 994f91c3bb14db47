//! # alx-sd
//!
//! > An SD card block driver for SPI mode, written in Embedded Rust
//!
//! This crate drives an SD card over SPI: it runs the power-up handshake
//! (CMD0, CMD8, CMD58, ACMD41, CMD58, CMD9, CMD10) and then moves 512-byte
//! blocks to and from the card with the multi-block read and write commands.
//! It is `#![no_std]`, does not use `alloc`, and every call is blocking: the
//! driver busy-polls the bus until the card answers or a deadline passes.
//!
//! Every public operation is all-or-nothing. If any step of an attempt fails,
//! the whole sequence is started again from the top, up to the number of
//! tries you ask for.
//!
//! ## Using the crate
//!
//! You need three things:
//!
//! * something that implements [`BlockTransport`] - usually a
//!   [`SpiTransport`] built from an `embedded-hal` SPI bus and chip-select
//!   pin;
//! * something that implements [`embedded_hal::delay::DelayNs`];
//! * something that implements [`Clock`] - a closure returning milliseconds
//!   since boot will do.
//!
//! ```rust
//! use alx_sd::{Error, SdCard, SpiTransport, BLOCK_LEN};
//!
//! fn example<BUS, CS, D>(bus: BUS, cs: CS, delay: D, millis: fn() -> u64) -> Result<(), Error>
//! where
//!     BUS: embedded_hal::spi::SpiBus,
//!     CS: embedded_hal::digital::OutputPin,
//!     D: embedded_hal::delay::DelayNs,
//! {
//!     let sdcard = SdCard::new(SpiTransport::new(bus, cs), delay, millis);
//!     sdcard.init(5, 10)?;
//!     let mut buffer = [0u8; 2 * BLOCK_LEN];
//!     sdcard.read_block(2, 0, &mut buffer, 3, 0)?;
//!     sdcard.write_block(2, 100, &buffer, 3, 0)?;
//!     sdcard.deinit(5, 10)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//! * `embassy-sync-06`: Enabled by default. Provides
//!   `EmbassyMutexSpiTransport`, which shares an SPI bus through an
//!   `embassy-sync` blocking mutex.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod clock;
pub mod sdcard;

#[doc(inline)]
pub use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx, BLOCK_LEN};

#[doc(inline)]
pub use crate::clock::Clock;

#[doc(inline)]
pub use crate::sdcard::{
    proto, AttemptError, BlockTransport, CardInfo, Error, RefCellSpiTransport, SdCard,
    SdCardOptions, SpiTransport, TransportError,
};

#[doc(inline)]
pub use crate::sdcard::proto::{Cid, Csd, CsdV1, CsdV2, Ocr};

#[cfg(feature = "embassy-sync-06")]
#[doc(inline)]
pub use crate::sdcard::EmbassyMutexSpiTransport;

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
