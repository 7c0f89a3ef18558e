//! Interrupt event dispatch
//!
//! The platform ISR reads the controller's transfer status, maps it to an
//! [`Event`] and hands it over here. Dispatch never blocks and never
//! propagates errors; problems on the interrupt path are logged and the
//! affected mailbox is put back into a usable state where possible.

use crate::bus::Can;
use crate::hardware::{Dependencies, Event, Hardware, StatusFlags};
use crate::message::Frame;

impl<H: Hardware, D: Dependencies, const RX: usize, const TX: usize> Can<H, D, RX, TX> {
    /// Dispatches one interrupt event
    ///
    /// Call from the platform ISR, once per demultiplexed event.
    pub fn on_interrupt(&self, event: Event) {
        match event {
            Event::TxIdle { mailbox } => self.complete_tx(mailbox, Ok(())),
            Event::TxSwitchToRx { mailbox } => {
                // Remote frame answered; the hardware flipped the mailbox to
                // receive. Reclaim it for the TX pool before settling.
                self.hw.abort(mailbox);
                self.complete_tx(mailbox, Ok(()));
            }
            Event::RxIdle { mailbox } => self.receive_ready(mailbox),
            Event::RxOverflow { mailbox } => {
                self.monitor.note_overrun();
                self.receive_ready(mailbox);
            }
            Event::ErrorStatus { flags } | Event::Unhandled { flags } => {
                self.handle_error(StatusFlags::new(flags));
            }
        }
    }

    fn handle_error(&self, flags: StatusFlags) {
        self.monitor.count_errors(&flags);
        self.refresh_state(&flags);
    }

    /// Drains a receive mailbox and re-arms it
    fn receive_ready(&self, mailbox: u8) {
        let Some(slot) = self.rx_slot_of(mailbox) else {
            log::warn!("rx completion on unknown mailbox {}", mailbox);
            return;
        };
        let Some(rx) = self.rx.get(slot) else {
            log::debug!("rx completion on removed filter {}", slot);
            return;
        };
        match self.hw.read_mailbox(mailbox) {
            Ok(raw) => {
                let frame = Frame::from_mailbox(&raw);
                rx.handler.on_frame(slot as u8, &frame);
            }
            Err(e) => log::warn!("rx mailbox {} read failed: {:?}", mailbox, e),
        }
        if let Err(e) = self.hw.receive(mailbox) {
            log::warn!("rx mailbox {} re-arm failed: {:?}", mailbox, e);
        }
    }
}
