//! Bringing the card up, and putting it back down.

use embedded_hal::delay::DelayNs;

use super::proto::*;
use super::{AttemptError, Backoff, BlockTransport, CardInfo, Error, SdCardInner};
use crate::clock::Deadline;
use crate::{debug, trace, BlockCount, Clock};

/// How far through the power-on handshake an attempt has got.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum InitState {
    /// Power-up clocks sent
    Idle,
    /// CMD0 put the card in the idle state
    Reset,
    /// CMD8 accepted
    InterfaceConditionsChecked,
    /// CMD58 read the OCR while idle
    VoltageWindowRead,
    /// ACMD41 polling finished
    Initializing,
    /// CMD58 read the OCR after power-up
    Ready,
    /// CMD9 read the CSD
    CsdRead,
    /// CMD10 read the CID
    CidRead,
}

impl<T, D, C> SdCardInner<T, D, C>
where
    T: BlockTransport,
    D: DelayNs,
    C: Clock,
{
    pub(crate) fn init(&mut self, num_of_tries: u8, new_try_wait_time_ms: u16) -> Result<(), Error> {
        if self.card_info.is_some() {
            return Err(Error::AlreadyInitialised);
        }
        debug!("Initialising card with opts: {:?}", self.options);
        self.transport.init().map_err(Error::Transport)?;
        match self.retry(
            "init",
            num_of_tries,
            new_try_wait_time_ms,
            Backoff::BeforeEveryTry,
            Self::acquire,
        ) {
            Ok(card_info) => {
                debug!("Card info: {:?}", card_info);
                self.card_info = Some(card_info);
                Ok(())
            }
            Err(e) => {
                self.transport.deinit().map_err(Error::Transport)?;
                Err(e)
            }
        }
    }

    pub(crate) fn deinit(
        &mut self,
        num_of_tries: u8,
        new_try_wait_time_ms: u16,
    ) -> Result<(), Error> {
        self.check_init()?;
        debug!("De-initialising card");
        self.retry(
            "deinit",
            num_of_tries,
            new_try_wait_time_ms,
            Backoff::BeforeEveryTry,
            |s| {
                s.send_power_up_clocks()?;
                s.send_command(Command::new(CMD0, 0), Response::r1(R1_IDLE_STATE))?;
                Ok(())
            },
        )?;
        self.transport.deinit().map_err(Error::Transport)?;
        self.card_info = None;
        Ok(())
    }

    /// One pass through the power-on handshake, from the power-up clocks to
    /// reading the CID.
    fn acquire(&mut self) -> Result<CardInfo, AttemptError> {
        let mut state = InitState::Idle;
        let mut ocr = Ocr::default();
        let mut csd = Csd::V2(CsdV2::default());
        let mut num_blocks = 0;
        let mut cid = [0u8; 16];
        self.send_power_up_clocks()?;
        loop {
            trace!("Init state: {:?}", state);
            state = match state {
                InitState::Idle => {
                    self.send_command(Command::new(CMD0, 0), Response::r1(R1_IDLE_STATE))?;
                    InitState::Reset
                }
                InitState::Reset => {
                    let mut response = Response::r1(R1_IDLE_STATE).with_long(4);
                    if self.options.check_long_responses {
                        response = response.expecting(CMD8_R7_ECHO);
                    }
                    self.send_command(Command::new(CMD8, CMD8_ARG), response)?;
                    InitState::InterfaceConditionsChecked
                }
                InitState::InterfaceConditionsChecked => {
                    let _idle = self.send_command(
                        Command::new(CMD58, 0),
                        Response::r1(R1_IDLE_STATE).with_long(4),
                    )?;
                    trace!(
                        "Voltage window: 0x{:x}",
                        Ocr::from_bytes(_idle.long).voltage_window()
                    );
                    InitState::VoltageWindowRead
                }
                InitState::VoltageWindowRead => {
                    self.wait_card_ready()?;
                    InitState::Initializing
                }
                InitState::Initializing => {
                    let reply = self.send_command(
                        Command::new(CMD58, 0),
                        Response::r1(R1_READY_STATE).with_long(4),
                    )?;
                    ocr = Ocr::from_bytes(reply.long);
                    if self.options.check_long_responses && !ocr.power_up_complete() {
                        return Err(AttemptError::ResponseMismatch(CMD58));
                    }
                    InitState::Ready
                }
                InitState::Ready => {
                    let data = self.read_register(CMD9)?;
                    csd = Csd::from_bytes(data).ok_or(AttemptError::ResponseMismatch(CMD9))?;
                    num_blocks = csd
                        .card_capacity_blocks()
                        .ok_or(AttemptError::ResponseMismatch(CMD9))?;
                    InitState::CsdRead
                }
                InitState::CsdRead => {
                    cid = self.read_register(CMD10)?;
                    InitState::CidRead
                }
                InitState::CidRead => {
                    return Ok(CardInfo {
                        ocr,
                        csd,
                        num_blocks: BlockCount(num_blocks),
                        cid: Cid { data: cid },
                    });
                }
            };
        }
    }

    /// Supply a minimum of 74 clock cycles without CS asserted.
    ///
    /// CS is high here: transports release it when they are built, and every
    /// chip select bracket releases it on the way out.
    fn send_power_up_clocks(&mut self) -> Result<(), AttemptError> {
        trace!("Power-up clocks");
        self.write_bytes(&FILLER[..NUM_OF_PWR_UP_CLK_BYTES])
    }

    /// Send CMD55 + ACMD41 until the card leaves the idle state.
    fn wait_card_ready(&mut self) -> Result<(), AttemptError> {
        let deadline = Deadline::start(&self.clock, self.options.acmd41_timeout_ms);
        let response = Response::r1(R1_READY_STATE).with_mask(R1_IDLE_OR_READY_MASK);
        loop {
            let reply = self.send_app_command(Command::new(ACMD41, ACMD41_ARG_HCS), response)?;
            if reply.r1 == R1_READY_STATE {
                return Ok(());
            }
            if deadline.is_expired(&self.clock) {
                return Err(AttemptError::TimeoutACommand(ACMD41));
            }
            self.poll_pause();
        }
    }

    /// Read a 16 byte register (CSD or CID), which arrives as a data packet.
    fn read_register(&mut self, command: u8) -> Result<[u8; 16], AttemptError> {
        self.send_command(Command::new(command, 0), Response::r1(R1_READY_STATE))?;
        let mut data = [0u8; 16];
        self.with_chip_select(|s| s.read_data(&mut data))?;
        Ok(data)
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
