//! Transmission path
//!
//! TX mailboxes form a pool guarded by a counting semaphore. A send claims
//! one unit and one arena slot, arms the mailbox, and either returns the
//! allocation id immediately (callback completion) or polls a per-slot
//! signal the ISR raises (blocking completion). Callback slots are released
//! by the ISR together with their semaphore unit; a blocking slot is only
//! ever released by the sender that claimed it, after it has read its
//! signal, so a completed-but-unread outcome can never be clobbered by a
//! new claimant reusing the slot.

use crate::bus::{Can, Error, Result, TxDone};
use crate::hardware::{Dependencies, Hardware};
use crate::mailbox::{Arena, Semaphore, TimeBudget, Timeout};
use crate::message::Frame;
use crate::state::BusState;
use core::sync::atomic::{AtomicU8, Ordering};

/// How a finished transmission is reported
#[derive(Copy, Clone)]
pub(crate) enum Completion {
    /// Invoke a callback from the ISR
    Callback(&'static dyn TxDone),
    /// Raise the slot's signal for a blocked sender
    Signal,
}

#[derive(Copy, Clone)]
pub(crate) struct TxSlot {
    pub(crate) completion: Completion,
}

const SIGNAL_PENDING: u8 = 0;
const SIGNAL_OK: u8 = 1;
const SIGNAL_IO: u8 = 2;
const SIGNAL_UNREACHABLE: u8 = 3;
const SIGNAL_DOWN: u8 = 4;

fn signal_code(result: &Result<()>) -> u8 {
    match result {
        Ok(()) => SIGNAL_OK,
        Err(Error::LinkUnreachable) => SIGNAL_UNREACHABLE,
        Err(Error::LinkDown) => SIGNAL_DOWN,
        Err(_) => SIGNAL_IO,
    }
}

fn signal_result(code: u8) -> Result<()> {
    match code {
        SIGNAL_OK => Ok(()),
        SIGNAL_UNREACHABLE => Err(Error::LinkUnreachable),
        SIGNAL_DOWN => Err(Error::LinkDown),
        _ => Err(Error::Io),
    }
}

/// Outcome of settling a slot, resolved inside a critical section
enum Settled {
    Callback(&'static dyn TxDone),
    Signal,
    Vacant,
}

pub(crate) struct TxBank<const TX: usize> {
    pub(crate) arena: Arena<TxSlot, TX>,
    pub(crate) sem: Semaphore,
    signals: [AtomicU8; TX],
}

impl<const TX: usize> TxBank<TX> {
    pub(crate) const fn new() -> Self {
        const SIGNAL_INIT: AtomicU8 = AtomicU8::new(SIGNAL_PENDING);
        Self {
            arena: Arena::new(),
            sem: Semaphore::new(TX),
            signals: [SIGNAL_INIT; TX],
        }
    }
}

impl<H: Hardware, D: Dependencies, const RX: usize, const TX: usize> Can<H, D, RX, TX> {
    /// Queues a frame for transmission
    ///
    /// Blocks for up to `timeout` while all TX mailboxes are busy. With a
    /// completion callback, returns the allocation id as soon as the mailbox
    /// is armed and the callback fires from the ISR; without one, blocks
    /// until the frame made it onto the bus (aborting on budget overrun).
    pub fn send(
        &self,
        frame: &Frame,
        timeout: Timeout,
        done: Option<&'static dyn TxDone>,
    ) -> Result<u8> {
        if frame.is_fd() && !self.mode().fd() {
            return Err(Error::Config);
        }
        if !self.is_started() {
            return Err(Error::LinkDown);
        }
        if self.bus_state() == BusState::BusOff {
            return Err(Error::LinkUnreachable);
        }

        let mut budget = TimeBudget::new(timeout);
        self.tx.sem.take(&self.deps, &mut budget)?;

        let completion = match done {
            Some(cb) => Completion::Callback(cb),
            None => Completion::Signal,
        };
        let slot = match self.tx.arena.allocate(TxSlot { completion }) {
            Some(slot) => slot,
            None => {
                self.tx.sem.give();
                return Err(Error::ResourceExhausted);
            }
        };
        self.tx.signals[slot].store(SIGNAL_PENDING, Ordering::Release);

        let mailbox = self.tx_mailbox(slot);
        let raw = frame.to_mailbox();
        let armed = critical_section::with(|cs| {
            self.hw.write_mailbox(mailbox, &raw);
            match self.hw.transmit(mailbox) {
                Ok(()) => Ok(()),
                Err(e) => {
                    let _ = self.tx.arena.take_with(cs, slot);
                    Err(e)
                }
            }
        });
        if let Err(e) = armed {
            self.tx.sem.give();
            return Err(e);
        }

        let id = (RX + slot) as u8;
        if done.is_some() {
            return Ok(id);
        }
        self.wait_tx_done(slot, mailbox, &mut budget).map(|()| id)
    }

    /// Polls the slot signal until the ISR settles the transfer
    ///
    /// The slot stays allocated until this function releases it, so the
    /// signal cannot be reset by a new claimant before it is read here.
    fn wait_tx_done(&self, slot: usize, mailbox: u8, budget: &mut TimeBudget) -> Result<()> {
        loop {
            match self.tx.signals[slot].load(Ordering::Acquire) {
                SIGNAL_PENDING => {
                    if budget.expired() {
                        return self.abort_tx_wait(slot, mailbox);
                    }
                    budget.tick(&self.deps);
                }
                code => {
                    let _ = self.tx.arena.take(slot);
                    self.tx.sem.give();
                    return signal_result(code);
                }
            }
        }
    }

    /// Gives up on a blocked send
    ///
    /// The ISR may settle the transfer concurrently; the signal is re-read
    /// inside the critical section that releases the slot, so a completion
    /// that slipped in before the abort is still honored.
    fn abort_tx_wait(&self, slot: usize, mailbox: u8) -> Result<()> {
        self.hw.abort(mailbox);
        let code = critical_section::with(|cs| {
            let code = self.tx.signals[slot].load(Ordering::Acquire);
            let _ = self.tx.arena.take_with(cs, slot);
            code
        });
        self.tx.sem.give();
        if code == SIGNAL_PENDING {
            Err(Error::Timeout)
        } else {
            signal_result(code)
        }
    }

    /// Settles a finished transmission on a physical TX mailbox
    pub(crate) fn complete_tx(&self, mailbox: u8, result: Result<()>) {
        let Some(slot) = self.tx_slot_of(mailbox) else {
            log::warn!("tx completion on unknown mailbox {}", mailbox);
            return;
        };
        let settled = critical_section::with(|cs| match self.tx.arena.get_with(cs, slot) {
            Some(TxSlot {
                completion: Completion::Callback(cb),
            }) => {
                let _ = self.tx.arena.take_with(cs, slot);
                Settled::Callback(cb)
            }
            Some(TxSlot {
                completion: Completion::Signal,
            }) => {
                self.tx.signals[slot].store(signal_code(&result), Ordering::Release);
                Settled::Signal
            }
            None => Settled::Vacant,
        });
        match settled {
            Settled::Callback(cb) => {
                cb.on_tx_done((RX + slot) as u8, result);
                self.tx.sem.give();
            }
            // Slot and semaphore unit are returned by the blocked sender.
            Settled::Signal => {}
            Settled::Vacant => log::debug!("spurious tx completion on mailbox {}", mailbox),
        }
    }

    /// Fails every in-flight transmission with `err`
    pub(crate) fn fail_all_tx(&self, err: Error) {
        for slot in 0..TX {
            let settled = critical_section::with(|cs| match self.tx.arena.get_with(cs, slot) {
                Some(TxSlot {
                    completion: Completion::Callback(cb),
                }) => {
                    let _ = self.tx.arena.take_with(cs, slot);
                    Settled::Callback(cb)
                }
                Some(TxSlot {
                    completion: Completion::Signal,
                }) => {
                    self.tx.signals[slot].store(signal_code(&Err(err)), Ordering::Release);
                    Settled::Signal
                }
                None => Settled::Vacant,
            });
            match settled {
                Settled::Callback(cb) => {
                    self.hw.abort(self.tx_mailbox(slot));
                    cb.on_tx_done((RX + slot) as u8, Err(err));
                    self.tx.sem.give();
                }
                Settled::Signal => self.hw.abort(self.tx_mailbox(slot)),
                Settled::Vacant => {}
            }
        }
    }
}
