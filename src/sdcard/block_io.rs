//! Multi-block reads and writes.

use embedded_hal::delay::DelayNs;

use super::command::Until;
use super::proto::*;
use super::{check_buffer_len, AttemptError, Backoff, BlockTransport, Error, SdCardInner};
use crate::{debug, Clock, BLOCK_LEN};

impl<T, D, C> SdCardInner<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    /// Read blocks with CMD18, retrying the whole transfer on failure.
    pub(crate) fn read_block(
        &mut self,
        num_of_blocks: u32,
        start_address: u32,
        buffer: &mut [u8],
        num_of_tries: u8,
        new_try_wait_time_ms: u16,
    ) -> Result<(), Error> {
        self.check_init()?;
        check_buffer_len(num_of_blocks, buffer.len())?;
        debug!("Read {} blocks @ {}", num_of_blocks, start_address);
        self.retry(
            "read",
            num_of_tries,
            new_try_wait_time_ms,
            Backoff::BetweenTries,
            |s| s.read_attempt(start_address, buffer),
        )
    }

    /// Write blocks with ACMD23 + CMD25, retrying the whole transfer on
    /// failure.
    pub(crate) fn write_block(
        &mut self,
        num_of_blocks: u32,
        start_address: u32,
        buffer: &[u8],
        num_of_tries: u8,
        new_try_wait_time_ms: u16,
    ) -> Result<(), Error> {
        self.check_init()?;
        check_buffer_len(num_of_blocks, buffer.len())?;
        debug!("Write {} blocks @ {}", num_of_blocks, start_address);
        self.retry(
            "write",
            num_of_tries,
            new_try_wait_time_ms,
            Backoff::BetweenTries,
            |s| s.write_attempt(num_of_blocks, start_address, buffer),
        )
    }

    fn read_attempt(&mut self, start_address: u32, buffer: &mut [u8]) -> Result<(), AttemptError> {
        // Start a multi-block read
        self.send_command(
            Command::new(CMD18, start_address),
            Response::r1(R1_READY_STATE),
        )?;
        self.with_chip_select(|s| {
            for block in buffer.chunks_exact_mut(BLOCK_LEN) {
                s.read_data(block)?;
            }
            Ok(())
        })?;
        // Stop the read
        self.send_command(
            Command::new(CMD12, 0),
            Response::r1(R1_READY_STATE).with_busy(),
        )?;
        Ok(())
    }

    fn write_attempt(
        &mut self,
        num_of_blocks: u32,
        start_address: u32,
        buffer: &[u8],
    ) -> Result<(), AttemptError> {
        let ready = Response::r1(R1_READY_STATE);
        // Pre-erase, then start a multi-block write
        self.send_app_command(Command::new(ACMD23, num_of_blocks), ready)?;
        self.send_command(Command::new(CMD25, start_address), ready)?;
        self.with_chip_select(|s| {
            for block in buffer.chunks_exact(BLOCK_LEN) {
                s.write_bytes(&[WRITE_MULTIPLE_TOKEN])?;
                s.write_bytes(block)?;
                // CRC is off in SPI mode
                s.write_bytes(&FILLER[..2])?;
                s.wait_byte(
                    DATA_RES_MASK,
                    DATA_RES_ACCEPTED,
                    Until::Equal,
                    s.options.block_write_start_token_timeout_ms,
                    AttemptError::TimeoutDataResponse,
                )?;
                s.wait_not_busy()?;
            }
            // Stop the write
            s.write_bytes(&[STOP_TRAN_TOKEN])?;
            s.write_sync_byte()?;
            s.wait_not_busy()?;
            Ok(())
        })?;
        // R2 must be all clear
        self.send_command(
            Command::new(CMD13, 0),
            ready.with_long(1).expecting([0x00; 4]),
        )?;
        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
