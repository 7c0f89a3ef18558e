//! Mailbox bookkeeping primitives
//!
//! The controller hands completions to an ISR while the foreground keeps
//! allocating and releasing mailboxes, so all bookkeeping here is shared
//! state: a critical-section guarded slot arena and an atomic counting
//! semaphore, plus the time budget that paces blocking waits.

use crate::bus::{Error, Result};
use crate::hardware::Dependencies;
use core::cell::RefCell;
use core::convert::Infallible;
use core::sync::atomic::{AtomicUsize, Ordering};
use critical_section::{CriticalSection, Mutex};
use fugit::MicrosDurationU32;

/// Poll period for blocking waits
pub(crate) const POLL_INTERVAL_US: u32 = 100;

/// How long a blocking call may wait
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Fail immediately instead of waiting
    NoWait,
    /// Wait without bound
    Forever,
    /// Wait at most this long
    Duration(MicrosDurationU32),
}

/// Remaining wait time for one blocking call
pub(crate) struct TimeBudget {
    remaining: Option<u32>,
}

impl TimeBudget {
    pub(crate) fn new(timeout: Timeout) -> Self {
        let remaining = match timeout {
            Timeout::NoWait => Some(0),
            Timeout::Forever => None,
            Timeout::Duration(d) => Some(d.to_micros()),
        };
        Self { remaining }
    }

    pub(crate) fn expired(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Burns one poll interval off the budget
    pub(crate) fn tick<D: Dependencies>(&mut self, deps: &D) {
        let step = match self.remaining {
            None => POLL_INTERVAL_US,
            Some(left) => left.min(POLL_INTERVAL_US),
        };
        deps.delay_us(step);
        if let Some(left) = &mut self.remaining {
            *left = left.saturating_sub(step);
        }
    }
}

/// Fixed pool of mailbox slots, indexed by allocation id
///
/// Slots are taken and released from both the foreground and the ISR; every
/// access happens inside a critical section. A release of an already free
/// slot reports `None` so callers can tell who lost the race.
pub(crate) struct Arena<T: Copy, const N: usize> {
    slots: Mutex<RefCell<[Option<T>; N]>>,
}

impl<T: Copy, const N: usize> Arena<T, N> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Mutex::new(RefCell::new([None; N])),
        }
    }

    /// Claims the lowest free slot
    pub(crate) fn allocate(&self, payload: T) -> Option<usize> {
        critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            let index = slots.iter().position(|slot| slot.is_none())?;
            slots[index] = Some(payload);
            Some(index)
        })
    }

    /// Releases a slot, returning its payload if it was occupied
    pub(crate) fn take(&self, index: usize) -> Option<T> {
        critical_section::with(|cs| self.take_with(cs, index))
    }

    /// [`take`](Self::take) inside an already held critical section
    pub(crate) fn take_with(&self, cs: CriticalSection, index: usize) -> Option<T> {
        self.slots.borrow_ref_mut(cs).get_mut(index)?.take()
    }

    /// Copies the payload of a slot without releasing it
    pub(crate) fn get(&self, index: usize) -> Option<T> {
        critical_section::with(|cs| self.get_with(cs, index))
    }

    /// [`get`](Self::get) inside an already held critical section
    pub(crate) fn get_with(&self, cs: CriticalSection, index: usize) -> Option<T> {
        *self.slots.borrow_ref(cs).get(index)?
    }

    /// Number of occupied slots
    #[cfg(test)]
    pub(crate) fn occupied(&self) -> usize {
        critical_section::with(|cs| {
            self.slots
                .borrow_ref(cs)
                .iter()
                .filter(|slot| slot.is_some())
                .count()
        })
    }
}

/// Counting semaphore over the free mailbox budget
pub(crate) struct Semaphore {
    count: AtomicUsize,
}

impl Semaphore {
    pub(crate) const fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
        }
    }

    /// Takes one unit if any is free
    pub(crate) fn try_take(&self) -> nb::Result<(), Infallible> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map(|_| ())
            .map_err(|_| nb::Error::WouldBlock)
    }

    /// Takes one unit, polling until the budget runs out
    pub(crate) fn take<D: Dependencies>(&self, deps: &D, budget: &mut TimeBudget) -> Result<()> {
        loop {
            match self.try_take() {
                Ok(()) => return Ok(()),
                Err(nb::Error::WouldBlock) => {
                    if budget.expired() {
                        return Err(Error::Timeout);
                    }
                    budget.tick(deps);
                }
            }
        }
    }

    /// Returns one unit
    pub(crate) fn give(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of free units
    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}
