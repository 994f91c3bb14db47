//! The byte pipe the driver talks to, and implementations over `embedded-hal`.

use core::cell::{RefCell, RefMut};

use embedded_hal::{digital::OutputPin, spi::SpiBus};

use super::proto::SYNC_BYTE;

/// A full-duplex byte pipe to an SD card, with a separately controlled Chip
/// Select line.
///
/// The driver brackets every command in [`BlockTransport::assert_cs`] and
/// [`BlockTransport::deassert_cs`], and needs to clock bytes out with CS
/// released during power-up, which is why this is not an
/// [`embedded_hal::spi::SpiDevice`].
pub trait BlockTransport {
    /// Drive Chip Select active (low).
    ///
    /// This cannot fail here. Implementations on fallible GPIO remember the
    /// fault and return [`TransportError::Cs`] from the next bus operation.
    fn assert_cs(&mut self);

    /// Drive Chip Select inactive (high).
    ///
    /// The `embedded-hal` transports then clock one 0xFF so the card lets go
    /// of MISO.
    fn deassert_cs(&mut self);

    /// Clock out `data`, discarding whatever comes back.
    fn write(&mut self, data: &[u8], num_of_tries: u8, timeout_ms: u16)
        -> Result<(), TransportError>;

    /// Clock in `data.len()` bytes, sending 0xFF for each one.
    fn read(&mut self, data: &mut [u8], num_of_tries: u8, timeout_ms: u16)
        -> Result<(), TransportError>;

    /// Clock out `tx` while clocking in `rx`. Both must be the same length.
    fn write_read(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        num_of_tries: u8,
        timeout_ms: u16,
    ) -> Result<(), TransportError>;

    /// Open the underlying peripheral.
    fn init(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the underlying peripheral.
    fn deinit(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T> BlockTransport for &mut T
where
    T: BlockTransport + ?Sized,
{
    fn assert_cs(&mut self) {
        T::assert_cs(self)
    }

    fn deassert_cs(&mut self) {
        T::deassert_cs(self)
    }

    fn write(
        &mut self,
        data: &[u8],
        num_of_tries: u8,
        timeout_ms: u16,
    ) -> Result<(), TransportError> {
        T::write(self, data, num_of_tries, timeout_ms)
    }

    fn read(
        &mut self,
        data: &mut [u8],
        num_of_tries: u8,
        timeout_ms: u16,
    ) -> Result<(), TransportError> {
        T::read(self, data, num_of_tries, timeout_ms)
    }

    fn write_read(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        num_of_tries: u8,
        timeout_ms: u16,
    ) -> Result<(), TransportError> {
        T::write_read(self, tx, rx, num_of_tries, timeout_ms)
    }

    fn init(&mut self) -> Result<(), TransportError> {
        T::init(self)
    }

    fn deinit(&mut self) -> Result<(), TransportError> {
        T::deinit(self)
    }
}

/// Errors that can occur when using a [`BlockTransport`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[non_exhaustive]
pub enum TransportError {
    /// An operation on the inner SPI bus failed.
    Spi,
    /// Setting the value of the Chip Select (CS) pin failed.
    Cs,
    /// The transmit and receive buffers were different lengths.
    Length,
    /// A shared bus was already borrowed by someone else.
    Busy,
}

/// A Chip Select pin that remembers it failed to switch.
///
/// The pin is driven high (inactive) as soon as it is wrapped.
struct ChipSelect<CS> {
    pin: CS,
    fault: Option<TransportError>,
}

impl<CS> ChipSelect<CS>
where
    CS: OutputPin,
{
    fn new(pin: CS) -> Self {
        let mut cs = Self { pin, fault: None };
        cs.deassert();
        cs
    }

    fn assert(&mut self) {
        if self.pin.set_low().is_err() {
            self.latch(TransportError::Cs);
        }
    }

    fn deassert(&mut self) {
        if self.pin.set_high().is_err() {
            self.latch(TransportError::Cs);
        }
    }

    /// Keep the first fault until the next bus operation reports it.
    fn latch(&mut self, error: TransportError) {
        self.fault.get_or_insert(error);
    }

    /// Report (and clear) a fault from an earlier CS edge.
    fn check(&mut self) -> Result<(), TransportError> {
        match self.fault.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Raise CS, then clock one 0xFF so the card lets go of MISO.
    fn release<BUS>(&mut self, bus: &mut BUS)
    where
        BUS: SpiBus,
    {
        self.deassert();
        if let Err(error) = bus_write(bus, &[SYNC_BYTE]) {
            self.latch(error);
        }
    }

    fn free(self) -> CS {
        self.pin
    }
}

/// An owned SPI bus and CS pin.
pub struct SpiTransport<BUS, CS> {
    bus: BUS,
    cs: ChipSelect<CS>,
}

impl<BUS, CS> SpiTransport<BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    /// Create a new `SpiTransport`, with CS released.
    pub fn new(bus: BUS, cs: CS) -> Self {
        Self {
            bus,
            cs: ChipSelect::new(cs),
        }
    }

    /// Get a temporary borrow on the SPI bus. Useful if you need to re-clock
    /// the SPI after initialisation.
    pub fn bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut BUS) -> T,
    {
        func(&mut self.bus)
    }

    /// Give back the bus and the pin.
    pub fn free(self) -> (BUS, CS) {
        (self.bus, self.cs.free())
    }
}

impl<BUS, CS> BlockTransport for SpiTransport<BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn assert_cs(&mut self) {
        self.cs.assert();
    }

    fn deassert_cs(&mut self) {
        self.cs.release(&mut self.bus);
    }

    fn write(
        &mut self,
        data: &[u8],
        num_of_tries: u8,
        _timeout_ms: u16,
    ) -> Result<(), TransportError> {
        self.cs.check()?;
        with_tries(num_of_tries, || bus_write(&mut self.bus, data))
    }

    fn read(
        &mut self,
        data: &mut [u8],
        num_of_tries: u8,
        _timeout_ms: u16,
    ) -> Result<(), TransportError> {
        self.cs.check()?;
        with_tries(num_of_tries, || bus_read(&mut self.bus, data))
    }

    fn write_read(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        num_of_tries: u8,
        _timeout_ms: u16,
    ) -> Result<(), TransportError> {
        self.cs.check()?;
        check_lengths(tx, rx)?;
        with_tries(num_of_tries, || bus_write_read(&mut self.bus, tx, rx))
    }
}

/// A wrapper around a SPI bus and a CS pin, using a `RefCell`.
///
/// This allows sharing the bus within the same thread. The bus stays
/// borrowed from [`BlockTransport::assert_cs`] until
/// [`BlockTransport::deassert_cs`], so nothing else can clock it while the
/// card is selected. If the bus is already borrowed when CS would go low, CS
/// stays high and the next operation fails with [`TransportError::Busy`].
pub struct RefCellSpiTransport<'a, BUS, CS> {
    bus: &'a RefCell<BUS>,
    claimed: Option<RefMut<'a, BUS>>,
    cs: ChipSelect<CS>,
}

impl<'a, BUS, CS> RefCellSpiTransport<'a, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    /// Create a new `RefCellSpiTransport`, with CS released.
    pub fn new(bus: &'a RefCell<BUS>, cs: CS) -> Self {
        Self {
            bus,
            claimed: None,
            cs: ChipSelect::new(cs),
        }
    }

    /// Give back the pin.
    pub fn free(self) -> CS {
        self.cs.free()
    }

    /// Run `func` on the bus we hold, or on a fresh borrow outside a bracket.
    fn with_bus<F>(&mut self, func: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut BUS) -> Result<(), TransportError>,
    {
        match self.claimed.as_mut() {
            Some(bus) => func(&mut **bus),
            None => {
                let mut bus = self
                    .bus
                    .try_borrow_mut()
                    .map_err(|_| TransportError::Busy)?;
                func(&mut *bus)
            }
        }
    }
}

impl<BUS, CS> BlockTransport for RefCellSpiTransport<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn assert_cs(&mut self) {
        if self.claimed.is_none() {
            match self.bus.try_borrow_mut() {
                Ok(bus) => self.claimed = Some(bus),
                Err(_) => {
                    self.cs.latch(TransportError::Busy);
                    return;
                }
            }
        }
        self.cs.assert();
    }

    fn deassert_cs(&mut self) {
        match self.claimed.take() {
            Some(mut bus) => self.cs.release(&mut *bus),
            None => match self.bus.try_borrow_mut() {
                Ok(mut bus) => self.cs.release(&mut *bus),
                Err(_) => self.cs.deassert(),
            },
        }
    }

    fn write(
        &mut self,
        data: &[u8],
        num_of_tries: u8,
        _timeout_ms: u16,
    ) -> Result<(), TransportError> {
        self.cs.check()?;
        self.with_bus(|bus| with_tries(num_of_tries, || bus_write(&mut *bus, data)))
    }

    fn read(
        &mut self,
        data: &mut [u8],
        num_of_tries: u8,
        _timeout_ms: u16,
    ) -> Result<(), TransportError> {
        self.cs.check()?;
        self.with_bus(|bus| with_tries(num_of_tries, || bus_read(&mut *bus, data)))
    }

    fn write_read(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        num_of_tries: u8,
        _timeout_ms: u16,
    ) -> Result<(), TransportError> {
        self.cs.check()?;
        check_lengths(tx, rx)?;
        self.with_bus(|bus| with_tries(num_of_tries, || bus_write_read(&mut *bus, tx, rx)))
    }
}

#[cfg(feature = "embassy-sync-06")]
mod embassy_sync_06 {
    use core::cell::RefCell;

    use ::embassy_sync_06::blocking_mutex;

    use super::*;

    /// A wrapper around a SPI bus and a CS pin, using an `embassy-sync` blocking mutex.
    ///
    /// This allows sharing the bus with according to the `embassy-sync` mutex model.
    /// See [`blocking_mutex::Mutex`] for more details.
    ///
    /// The mutex is held for each bus operation and for each CS edge (the
    /// trailing 0xFF after CS goes high included), but it cannot be held for
    /// the whole time CS is low. Other users of the bus must not clock it
    /// while a card operation is in progress, for example by only touching
    /// the bus from the same task as the [`crate::SdCard`].
    pub struct EmbassyMutexSpiTransport<'a, BUS, CS, M> {
        bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>,
        cs: ChipSelect<CS>,
    }

    impl<'a, BUS, CS, M> EmbassyMutexSpiTransport<'a, BUS, CS, M>
    where
        BUS: SpiBus,
        CS: OutputPin,
        M: blocking_mutex::raw::RawMutex,
    {
        /// Create a new `EmbassyMutexSpiTransport`, with CS released.
        pub fn new(bus: &'a blocking_mutex::Mutex<M, RefCell<BUS>>, cs: CS) -> Self {
            let cs = bus.lock(|_| ChipSelect::new(cs));
            Self { bus, cs }
        }

        /// Give back the pin.
        pub fn free(self) -> CS {
            self.cs.free()
        }
    }

    impl<CS, BUS, M> BlockTransport for EmbassyMutexSpiTransport<'_, BUS, CS, M>
    where
        CS: OutputPin,
        BUS: SpiBus,
        M: blocking_mutex::raw::RawMutex,
    {
        fn assert_cs(&mut self) {
            let cs = &mut self.cs;
            self.bus.lock(|_| cs.assert());
        }

        fn deassert_cs(&mut self) {
            let cs = &mut self.cs;
            self.bus.lock(|bus| match bus.try_borrow_mut() {
                Ok(mut bus) => cs.release(&mut *bus),
                Err(_) => cs.deassert(),
            });
        }

        fn write(
            &mut self,
            data: &[u8],
            num_of_tries: u8,
            _timeout_ms: u16,
        ) -> Result<(), TransportError> {
            self.cs.check()?;
            self.bus.lock(|bus| {
                let mut bus = bus.try_borrow_mut().map_err(|_| TransportError::Busy)?;
                with_tries(num_of_tries, || bus_write(&mut *bus, data))
            })
        }

        fn read(
            &mut self,
            data: &mut [u8],
            num_of_tries: u8,
            _timeout_ms: u16,
        ) -> Result<(), TransportError> {
            self.cs.check()?;
            self.bus.lock(|bus| {
                let mut bus = bus.try_borrow_mut().map_err(|_| TransportError::Busy)?;
                with_tries(num_of_tries, || bus_read(&mut *bus, data))
            })
        }

        fn write_read(
            &mut self,
            tx: &[u8],
            rx: &mut [u8],
            num_of_tries: u8,
            _timeout_ms: u16,
        ) -> Result<(), TransportError> {
            self.cs.check()?;
            check_lengths(tx, rx)?;
            self.bus.lock(|bus| {
                let mut bus = bus.try_borrow_mut().map_err(|_| TransportError::Busy)?;
                with_tries(num_of_tries, || bus_write_read(&mut *bus, tx, rx))
            })
        }
    }
}

#[cfg(feature = "embassy-sync-06")]
pub use embassy_sync_06::*;

/// Run `op` until it succeeds, at most `num_of_tries` times (but always at
/// least once).
fn with_tries<F>(num_of_tries: u8, mut op: F) -> Result<(), TransportError>
where
    F: FnMut() -> Result<(), TransportError>,
{
    let mut result = op();
    for _ in 1..num_of_tries {
        if result.is_ok() {
            break;
        }
        result = op();
    }
    result
}

fn check_lengths(tx: &[u8], rx: &[u8]) -> Result<(), TransportError> {
    if tx.len() == rx.len() {
        Ok(())
    } else {
        Err(TransportError::Length)
    }
}

fn bus_write<BUS>(bus: &mut BUS, data: &[u8]) -> Result<(), TransportError>
where
    BUS: SpiBus,
{
    let write_res = bus.write(data);

    // On failure, it's important to still flush.
    let flush_res = bus.flush();

    write_res.map_err(|_| TransportError::Spi)?;
    flush_res.map_err(|_| TransportError::Spi)
}

fn bus_read<BUS>(bus: &mut BUS, data: &mut [u8]) -> Result<(), TransportError>
where
    BUS: SpiBus,
{
    // `SpiBus::read` may clock out anything, but the card wants to see 0xFF.
    data.fill(SYNC_BYTE);
    let read_res = bus.transfer_in_place(data);
    let flush_res = bus.flush();

    read_res.map_err(|_| TransportError::Spi)?;
    flush_res.map_err(|_| TransportError::Spi)
}

fn bus_write_read<BUS>(bus: &mut BUS, tx: &[u8], rx: &mut [u8]) -> Result<(), TransportError>
where
    BUS: SpiBus,
{
    let transfer_res = bus.transfer(rx, tx);
    let flush_res = bus.flush();

    transfer_res.map_err(|_| TransportError::Spi)?;
    flush_res.map_err(|_| TransportError::Spi)
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
