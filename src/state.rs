//! Fault confinement state tracking
//!
//! The controller reports its fault confinement state and error flags in the
//! status word; [`Monitor`] folds those into the driver's notion of bus
//! state, accumulates per-class error statistics and drives the registered
//! state change listener.

use crate::hardware::{ErrorCounters, StatusFlags};
use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};
use critical_section::Mutex;

/// Fault confinement state of the controller
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusState {
    /// Normal participation, errors are signaled actively
    ErrorActive,
    /// An error counter passed the warning limit
    ErrorWarning,
    /// Errors are only signaled passively
    ErrorPassive,
    /// The controller has removed itself from the bus
    BusOff,
    /// The driver is not started
    Stopped,
}

/// Observer for bus state transitions
///
/// Called from interrupt context; implementations must not block.
pub trait StateListener: Sync {
    /// A state transition was observed
    fn on_state_change(&self, state: BusState, counters: ErrorCounters);
}

/// Accumulated per-class error statistics
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorStats {
    /// Stuff errors seen
    pub stuff_errors: u32,
    /// Form errors seen
    pub form_errors: u32,
    /// CRC errors seen
    pub crc_errors: u32,
    /// Acknowledge errors seen
    pub ack_errors: u32,
    /// Dominant-sent, recessive-read errors seen
    pub bit0_errors: u32,
    /// Recessive-sent, dominant-read errors seen
    pub bit1_errors: u32,
    /// Receive mailbox overruns seen
    pub rx_overruns: u32,
}

/// Derives the bus state from a status word
pub(crate) fn classify(flags: &StatusFlags) -> BusState {
    match flags.fault_confinement() {
        0b00 => {
            if flags.tx_warning() || flags.rx_warning() {
                BusState::ErrorWarning
            } else {
                BusState::ErrorActive
            }
        }
        0b01 => BusState::ErrorPassive,
        _ => BusState::BusOff,
    }
}

pub(crate) struct Monitor {
    state: Mutex<Cell<BusState>>,
    listener: Mutex<Cell<Option<&'static dyn StateListener>>>,
    stuff_errors: AtomicU32,
    form_errors: AtomicU32,
    crc_errors: AtomicU32,
    ack_errors: AtomicU32,
    bit0_errors: AtomicU32,
    bit1_errors: AtomicU32,
    rx_overruns: AtomicU32,
}

impl Monitor {
    pub(crate) const fn new() -> Self {
        Self {
            state: Mutex::new(Cell::new(BusState::Stopped)),
            listener: Mutex::new(Cell::new(None)),
            stuff_errors: AtomicU32::new(0),
            form_errors: AtomicU32::new(0),
            crc_errors: AtomicU32::new(0),
            ack_errors: AtomicU32::new(0),
            bit0_errors: AtomicU32::new(0),
            bit1_errors: AtomicU32::new(0),
            rx_overruns: AtomicU32::new(0),
        }
    }

    pub(crate) fn current(&self) -> BusState {
        critical_section::with(|cs| self.state.borrow(cs).get())
    }

    /// Commits a new state; on a transition, returns the listener to notify
    ///
    /// The returned listener option is resolved inside the same critical
    /// section as the state change, so a racing `set_listener` cannot be
    /// missed for this transition.
    pub(crate) fn update(
        &self,
        new: BusState,
    ) -> Option<Option<&'static dyn StateListener>> {
        critical_section::with(|cs| {
            let state = self.state.borrow(cs);
            if state.get() == new {
                None
            } else {
                state.set(new);
                Some(self.listener.borrow(cs).get())
            }
        })
    }

    pub(crate) fn set_listener(&self, listener: Option<&'static dyn StateListener>) {
        critical_section::with(|cs| self.listener.borrow(cs).set(listener));
    }

    /// Accumulates the error flags set in a status word
    pub(crate) fn count_errors(&self, flags: &StatusFlags) {
        for (set, counter) in [
            (flags.stuff_error(), &self.stuff_errors),
            (flags.form_error(), &self.form_errors),
            (flags.crc_error(), &self.crc_errors),
            (flags.ack_error(), &self.ack_errors),
            (flags.bit0_error(), &self.bit0_errors),
            (flags.bit1_error(), &self.bit1_errors),
        ] {
            if set {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn note_overrun(&self) {
        self.rx_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> ErrorStats {
        ErrorStats {
            stuff_errors: self.stuff_errors.load(Ordering::Relaxed),
            form_errors: self.form_errors.load(Ordering::Relaxed),
            crc_errors: self.crc_errors.load(Ordering::Relaxed),
            ack_errors: self.ack_errors.load(Ordering::Relaxed),
            bit0_errors: self.bit0_errors.load(Ordering::Relaxed),
            bit1_errors: self.bit1_errors.load(Ordering::Relaxed),
            rx_overruns: self.rx_overruns.load(Ordering::Relaxed),
        }
    }
}
