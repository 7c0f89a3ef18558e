//! Driver core
//!
//! [`Can`] owns the hardware and dependency collaborators and carves the
//! controller's physical mailboxes into three regions: `reserved_mailboxes`
//! leading mailboxes that stay unused, `RX` mailboxes owned by receive
//! filters, and `TX` mailboxes forming the transmit pool. Allocation ids
//! follow the same order, `0..RX` for filters and `RX..RX + TX` for
//! transmissions.

use crate::config::{BitTiming, CanConfig, ModeFlags, TimingLimits};
use crate::filter::{Filter, RawFilter, RxHandler, RxSlot};
use crate::hardware::{Dependencies, ErrorCounters, Hardware, StatusFlags};
use crate::mailbox::Arena;
use crate::state::{classify, BusState, ErrorStats, Monitor, StateListener};
use crate::tx::TxBank;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::Mutex;
use fugit::HertzU32;

#[cfg(feature = "manual-recovery")]
use crate::mailbox::{TimeBudget, Timeout};

/// Largest number of physical mailboxes any controller instance implements
pub const MAX_MAILBOXES: usize = 64;

/// Errors reported by the driver
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A parameter or mode is invalid or unsupported
    Config,
    /// All mailboxes of the requested kind are in use
    ResourceExhausted,
    /// The operation is not allowed in the current driver state
    Busy,
    /// The operation did not finish within its time budget
    Timeout,
    /// The driver is stopped
    LinkDown,
    /// The controller is bus-off
    LinkUnreachable,
    /// The hardware rejected or failed a transfer
    Io,
    /// A collaborator is not ready, e.g. the protocol clock is not running
    NotReady,
}

/// Convenience alias for driver results
pub type Result<T> = core::result::Result<T, Error>;

/// Observer for finished transmissions
///
/// Called from interrupt context; implementations must not block.
pub trait TxDone: Sync {
    /// The transmission with allocation id `allocation` finished
    fn on_tx_done(&self, allocation: u8, result: Result<()>);
}

/// CAN controller driver
///
/// `RX` is the number of mailboxes available to receive filters, `TX` the
/// size of the transmit pool. Together with the reserved region they must
/// fit the controller's physical mailbox count.
///
/// All methods take `&self`; the driver is designed to be shared between
/// the foreground and the platform ISR, e.g. as a `static`.
pub struct Can<H, D, const RX: usize, const TX: usize> {
    pub(crate) hw: H,
    pub(crate) deps: D,
    reserved: u8,
    started: AtomicBool,
    mode: Mutex<Cell<ModeFlags>>,
    nominal: Mutex<Cell<BitTiming>>,
    data_phase: Mutex<Cell<Option<BitTiming>>>,
    pub(crate) tx: TxBank<TX>,
    pub(crate) rx: Arena<RxSlot, RX>,
    pub(crate) monitor: Monitor,
}

impl<H: Hardware, D: Dependencies, const RX: usize, const TX: usize> Can<H, D, RX, TX> {
    /// Takes ownership of the controller and brings it into freeze mode
    ///
    /// Validates the mailbox partitioning and the configured timings against
    /// the hardware, but does not join the bus; call [`start`](Self::start)
    /// for that.
    pub fn new(hw: H, deps: D, config: CanConfig) -> Result<Self> {
        if deps.can_clock().to_Hz() == 0 {
            return Err(Error::NotReady);
        }
        let total = usize::from(config.reserved_mailboxes) + RX + TX;
        if total > usize::from(hw.mailbox_count()) || total > MAX_MAILBOXES || TX == 0 {
            return Err(Error::Config);
        }
        if config.data_timing.is_some() && !hw.fd_capable() {
            return Err(Error::Config);
        }
        config.nominal_timing.verify(&TimingLimits::NOMINAL)?;
        if let Some(data) = &config.data_timing {
            data.verify(&TimingLimits::DATA)?;
        }

        hw.enter_freeze();
        Ok(Self {
            hw,
            deps,
            reserved: config.reserved_mailboxes,
            started: AtomicBool::new(false),
            mode: Mutex::new(Cell::new(ModeFlags::default())),
            nominal: Mutex::new(Cell::new(config.nominal_timing)),
            data_phase: Mutex::new(Cell::new(config.data_timing)),
            tx: TxBank::new(),
            rx: Arena::new(),
            monitor: Monitor::new(),
        })
    }

    /// Joins the bus
    ///
    /// Powers the transceiver, resets the error counters and commits the
    /// configured timing, which takes the controller out of freeze mode.
    pub fn start(&self) -> Result<()> {
        if self.is_started() {
            return Err(Error::Busy);
        }
        self.deps.enable_transceiver()?;
        self.hw.clear_error_counters();
        let nominal = self.timing();
        let data = self.timing_data();
        self.hw.apply_timing(&nominal, data.as_ref());
        self.started.store(true, Ordering::Release);
        // Driver-initiated transition; the listener only reports bus events.
        let _ = self.monitor.update(classify(&self.hw.status()));
        Ok(())
    }

    /// Leaves the bus
    ///
    /// Fails every in-flight transmission with [`Error::LinkDown`], halts
    /// the controller in freeze mode and powers down the transceiver.
    /// Receive filters stay registered.
    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            return Err(Error::Busy);
        }
        self.fail_all_tx(Error::LinkDown);
        self.hw.enter_freeze();
        self.deps.disable_transceiver();
        let _ = self.monitor.update(BusState::Stopped);
        Ok(())
    }

    /// Whether the driver is started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Sets the operating mode; only allowed while stopped
    ///
    /// Transceiver delay compensation is enabled together with FD mode
    /// unless loopback is selected, where the measured loop delay would be
    /// meaningless.
    pub fn set_mode(&self, mode: ModeFlags) -> Result<()> {
        if self.is_started() {
            return Err(Error::Busy);
        }
        if mode.raw() & !ModeFlags::KNOWN != 0 {
            return Err(Error::Config);
        }
        if mode.fd() && !self.hw.fd_capable() {
            return Err(Error::Config);
        }
        critical_section::with(|cs| self.mode.borrow(cs).set(mode));
        self.hw.apply_mode(mode, mode.fd() && !mode.loopback());
        Ok(())
    }

    /// The current operating mode
    pub fn mode(&self) -> ModeFlags {
        critical_section::with(|cs| self.mode.borrow(cs).get())
    }

    /// Sets the nominal phase timing; only allowed while stopped
    ///
    /// A `sjw` of `None` keeps the currently configured jump width. The new
    /// timing takes effect on the next [`start`](Self::start).
    pub fn set_timing(&self, timing: BitTiming) -> Result<()> {
        if self.is_started() {
            return Err(Error::Busy);
        }
        timing.verify(&TimingLimits::NOMINAL)?;
        critical_section::with(|cs| {
            let stored = self.nominal.borrow(cs);
            let merged = BitTiming {
                sjw: timing.sjw.or(stored.get().sjw),
                ..timing
            };
            stored.set(merged);
        });
        Ok(())
    }

    /// Sets the FD data phase timing; only allowed while stopped
    pub fn set_timing_data(&self, timing: BitTiming) -> Result<()> {
        if self.is_started() {
            return Err(Error::Busy);
        }
        if !self.hw.fd_capable() {
            return Err(Error::Config);
        }
        timing.verify(&TimingLimits::DATA)?;
        critical_section::with(|cs| {
            let stored = self.data_phase.borrow(cs);
            let merged = BitTiming {
                sjw: timing.sjw.or(stored.get().and_then(|t| t.sjw)),
                ..timing
            };
            stored.set(Some(merged));
        });
        Ok(())
    }

    /// The configured nominal phase timing
    pub fn timing(&self) -> BitTiming {
        critical_section::with(|cs| self.nominal.borrow(cs).get())
    }

    /// The configured FD data phase timing, if any
    pub fn timing_data(&self) -> Option<BitTiming> {
        critical_section::with(|cs| self.data_phase.borrow(cs).get())
    }

    /// Frequency of the clock feeding the protocol engine
    pub fn core_clock(&self) -> HertzU32 {
        self.deps.can_clock()
    }

    /// Highest bitrate the hardware supports
    pub fn max_bitrate(&self) -> HertzU32 {
        self.hw.max_bitrate()
    }

    /// Number of receive filters this instance can hold
    pub fn max_filters(&self) -> usize {
        RX
    }

    /// Mode flags this instance supports
    pub fn capabilities(&self) -> ModeFlags {
        let mut caps = ModeFlags::default();
        caps.set_loopback(true);
        caps.set_listen_only(true);
        caps.set_triple_sampling(true);
        caps.set_fd(self.hw.fd_capable());
        caps
    }

    /// Registers a receive filter, claiming one receive mailbox
    ///
    /// Frames accepted by the filter are delivered to `handler` from the
    /// ISR. Returns the filter's allocation id.
    pub fn add_rx_filter(
        &self,
        filter: &Filter,
        handler: &'static dyn RxHandler,
    ) -> Result<u8> {
        if filter.fd && !self.hw.fd_capable() {
            return Err(Error::Config);
        }
        let slot = self
            .rx
            .allocate(RxSlot { handler })
            .ok_or(Error::ResourceExhausted)?;
        let mailbox = self.rx_mailbox(slot);

        // Acceptance registers are only writable in freeze mode.
        let raw = RawFilter::from(*filter);
        self.hw.enter_freeze();
        self.hw.configure_receive(mailbox, &raw);
        if self.is_started() {
            self.hw.exit_freeze();
        }

        if let Err(e) = self.hw.receive(mailbox) {
            self.hw.deconfigure(mailbox);
            let _ = self.rx.take(slot);
            return Err(e);
        }
        Ok(slot as u8)
    }

    /// Removes a receive filter, releasing its mailbox
    ///
    /// Removing an unknown or already removed filter is a no-op.
    pub fn remove_rx_filter(&self, id: u8) {
        let slot = usize::from(id);
        if slot >= RX {
            log::warn!("filter id {} out of range", id);
            return;
        }
        if self.rx.take(slot).is_some() {
            let mailbox = self.rx_mailbox(slot);
            self.hw.abort(mailbox);
            self.hw.deconfigure(mailbox);
        } else {
            log::debug!("filter id {} already removed", id);
        }
    }

    /// Registers the bus state listener, replacing any previous one
    pub fn set_state_listener(&self, listener: Option<&'static dyn StateListener>) {
        self.monitor.set_listener(listener);
    }

    /// The current bus state and hardware error counters
    ///
    /// Re-derives the state from a fresh status word, so a transition the
    /// error interrupt has not reported yet is still observed (and the
    /// listener notified) here.
    pub fn state(&self) -> (BusState, ErrorCounters) {
        if !self.is_started() {
            return (BusState::Stopped, self.hw.error_counters());
        }
        self.refresh_state(&self.hw.status());
        (self.bus_state(), self.hw.error_counters())
    }

    /// Accumulated error statistics
    pub fn error_stats(&self) -> ErrorStats {
        self.monitor.stats()
    }

    /// Recovers from bus-off by hand
    ///
    /// Lifts the recovery inhibit, waits for the controller to rejoin the
    /// bus for up to `timeout`, and re-arms the inhibit either way. Returns
    /// [`Error::Timeout`] when the controller is still bus-off afterwards.
    #[cfg(feature = "manual-recovery")]
    pub fn recover(&self, timeout: Timeout) -> Result<()> {
        if !self.is_started() {
            return Err(Error::LinkDown);
        }
        if classify(&self.hw.status()) != BusState::BusOff {
            return Ok(());
        }
        self.hw.set_recovery_inhibit(false);
        let mut budget = TimeBudget::new(timeout);
        let result = loop {
            let flags = self.hw.status();
            if classify(&flags) != BusState::BusOff {
                self.refresh_state(&flags);
                break Ok(());
            }
            if budget.expired() {
                break Err(Error::Timeout);
            }
            budget.tick(&self.deps);
        };
        self.hw.set_recovery_inhibit(true);
        result
    }

    /// Returns the hardware and dependencies, abandoning the driver state
    pub fn release(self) -> (H, D) {
        self.hw.enter_freeze();
        (self.hw, self.deps)
    }

    pub(crate) fn bus_state(&self) -> BusState {
        self.monitor.current()
    }

    /// Folds a fresh status word into the tracked bus state
    pub(crate) fn refresh_state(&self, flags: &StatusFlags) {
        if !self.is_started() {
            return;
        }
        self.apply_state(classify(flags));
    }

    /// Commits a bus state and runs the transition side effects
    ///
    /// Entering bus-off fails the whole TX pool before the listener runs,
    /// so a listener already observes the settled pool.
    fn apply_state(&self, new: BusState) {
        if let Some(listener) = self.monitor.update(new) {
            if new == BusState::BusOff {
                self.fail_all_tx(Error::LinkUnreachable);
            }
            if let Some(listener) = listener {
                listener.on_state_change(new, self.hw.error_counters());
            }
        }
    }

    /// Physical mailbox of a receive filter slot
    pub(crate) fn rx_mailbox(&self, slot: usize) -> u8 {
        self.reserved + slot as u8
    }

    /// Physical mailbox of a TX pool slot
    pub(crate) fn tx_mailbox(&self, slot: usize) -> u8 {
        self.reserved + (RX + slot) as u8
    }

    /// Maps a physical mailbox back to its receive filter slot
    pub(crate) fn rx_slot_of(&self, mailbox: u8) -> Option<usize> {
        let offset = mailbox.checked_sub(self.reserved)?;
        let offset = usize::from(offset);
        (offset < RX).then_some(offset)
    }

    /// Maps a physical mailbox back to its TX pool slot
    pub(crate) fn tx_slot_of(&self, mailbox: u8) -> Option<usize> {
        let offset = usize::from(mailbox.checked_sub(self.reserved)?);
        let slot = offset.checked_sub(RX)?;
        (slot < TX).then_some(slot)
    }
}
