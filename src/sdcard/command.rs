//! Framing commands and polling for responses.

use embedded_hal::delay::DelayNs;

use super::proto::*;
use super::{AttemptError, BlockTransport, SdCardInner};
use crate::clock::Deadline;
use crate::{trace, Clock};

/// What the card said back to a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    /// The R1 byte that matched
    pub(crate) r1: u8,
    /// Any bytes that followed R1. Only the first `long_len` are valid.
    pub(crate) long: [u8; 4],
}

/// How [`SdCardInner::wait_byte`] compares the masked byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Until {
    Equal,
    NotEqual,
}

impl<T, D, C> SdCardInner<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    /// Perform a function that might error with the chipselect low.
    /// Always releases the chipselect, even if the function errors.
    ///
    /// A sync byte is clocked out after asserting, and another one before
    /// releasing if the function succeeded.
    pub(crate) fn with_chip_select<F, R>(&mut self, func: F) -> Result<R, AttemptError>
    where
        F: FnOnce(&mut Self) -> Result<R, AttemptError>,
    {
        self.transport.assert_cs();
        let f = |s: &mut Self| {
            s.write_sync_byte()?;
            let value = func(s)?;
            s.write_sync_byte()?;
            Ok(value)
        };
        let result = f(self);
        self.transport.deassert_cs();
        result
    }

    /// Send a command and check the response.
    ///
    /// The whole exchange happens inside one chip select.
    pub(crate) fn send_command(
        &mut self,
        command: Command,
        response: Response,
    ) -> Result<Reply, AttemptError> {
        trace!("CMD{} arg=0x{:x}", command.index, command.arg);
        let frame = command.encode();
        self.with_chip_select(|s| {
            s.write_bytes(&frame)?;
            s.write_sync_byte()?;
            let r1 = s.wait_byte(
                response.mask,
                response.expected_r1,
                Until::Equal,
                s.options.cmd_resp_timeout_ms,
                AttemptError::TimeoutCommand(command.index),
            )?;
            if response.busy {
                s.wait_byte(
                    0xFF,
                    BUSY_BYTE,
                    Until::NotEqual,
                    s.options.cmd_resp_timeout_ms,
                    AttemptError::TimeoutBusy(command.index),
                )?;
            }
            let mut long = [0u8; 4];
            let long_len = response.long_len.min(long.len());
            if long_len > 0 {
                s.clock_in(&mut long[..long_len])?;
                if let Some(pattern) = response.long_expected {
                    if long[..long_len] != pattern[..long_len] {
                        return Err(AttemptError::ResponseMismatch(command.index));
                    }
                }
            }
            trace!("CMD{} R1=0x{:x} long={:?}", command.index, r1, long);
            Ok(Reply { r1, long })
        })
    }

    /// Perform an application-specific command: CMD55, then `command`.
    ///
    /// CMD55 must give the same R1 as the command itself.
    pub(crate) fn send_app_command(
        &mut self,
        command: Command,
        response: Response,
    ) -> Result<Reply, AttemptError> {
        let app_cmd_response = Response::r1(response.expected_r1).with_mask(response.mask);
        self.send_command(Command::new(CMD55, 0), app_cmd_response)?;
        self.send_command(command, response)
    }

    /// Clock bytes in until `byte & mask` compares to `value` as asked, or
    /// `timeout_ms` passes. Returns the matching byte.
    ///
    /// The deadline is only checked after a miss, so at least one byte is
    /// always read.
    pub(crate) fn wait_byte(
        &mut self,
        mask: u8,
        value: u8,
        until: Until,
        timeout_ms: u16,
        on_timeout: AttemptError,
    ) -> Result<u8, AttemptError> {
        let deadline = Deadline::start(&self.clock, timeout_ms);
        loop {
            let byte = self.receive()?;
            let hit = match until {
                Until::Equal => byte & mask == value,
                Until::NotEqual => byte & mask != value,
            };
            if hit {
                return Ok(byte);
            }
            if deadline.is_expired(&self.clock) {
                return Err(on_timeout);
            }
            self.poll_pause();
        }
    }

    /// Spin until the card releases MISO after a write.
    pub(crate) fn wait_not_busy(&mut self) -> Result<u8, AttemptError> {
        self.wait_byte(
            0xFF,
            BUSY_BYTE,
            Until::NotEqual,
            self.options.block_write_stop_token_timeout_ms,
            AttemptError::TimeoutWriteBusy,
        )
    }

    /// Read a data packet: wait for the start token, fill `buffer`, then
    /// clock the CRC in and drop it.
    pub(crate) fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), AttemptError> {
        self.wait_byte(
            0xFF,
            DATA_START_BLOCK,
            Until::Equal,
            self.options.block_read_start_token_timeout_ms,
            AttemptError::TimeoutReadToken,
        )?;
        self.clock_in(buffer)?;
        let mut crc = [0u8; 2];
        self.clock_in(&mut crc)?;
        Ok(())
    }

    /// Call the poll hook, if there is one.
    pub(crate) fn poll_pause(&mut self) {
        if self.options.poll_interval_us != 0 {
            self.delayer.delay_us(self.options.poll_interval_us);
        }
    }

    pub(crate) fn write_sync_byte(&mut self) -> Result<(), AttemptError> {
        self.write_bytes(&FILLER[..1])
    }

    pub(crate) fn write_bytes(&mut self, data: &[u8]) -> Result<(), AttemptError> {
        self.transport.write(
            data,
            self.options.spi_num_of_tries,
            self.options.spi_timeout_ms,
        )?;
        Ok(())
    }

    /// Fill `buffer` from the card, clocking out 0xFF.
    pub(crate) fn clock_in(&mut self, buffer: &mut [u8]) -> Result<(), AttemptError> {
        for chunk in buffer.chunks_mut(FILLER_LEN) {
            self.transport.write_read(
                &FILLER[..chunk.len()],
                chunk,
                self.options.spi_num_of_tries,
                self.options.spi_timeout_ms,
            )?;
        }
        Ok(())
    }

    /// Receive a byte from the SD card by clocking out an 0xFF byte.
    fn receive(&mut self) -> Result<u8, AttemptError> {
        let mut byte = [0u8; 1];
        self.clock_in(&mut byte)?;
        Ok(byte[0])
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
