//! Platform integration traits
//!
//! The driver never touches registers directly. A platform-specific HAL
//! implements [`Hardware`] on top of the controller's register block and
//! [`Dependencies`] on top of its clock tree and (optional) transceiver, and
//! the ISR translates the controller's transfer status into an [`Event`]
//! which it feeds to [`Can::on_interrupt`].
//!
//! [`Can::on_interrupt`]: crate::bus::Can::on_interrupt

use crate::bus::Result;
use crate::config::{BitTiming, ModeFlags};
use crate::filter::RawFilter;
use crate::message::RawMailbox;
use bitfield::bitfield;
use fugit::HertzU32;

bitfield! {
    /// Controller status word
    ///
    /// A snapshot of the controller's error and status register, also carried
    /// verbatim by [`Event::ErrorStatus`].
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct StatusFlags(u64);

    /// Stuff error detected on the bus
    pub stuff_error, set_stuff_error: 0;
    /// Form error detected on the bus
    pub form_error, set_form_error: 1;
    /// CRC error detected on the bus
    pub crc_error, set_crc_error: 2;
    /// Acknowledge error detected on the bus
    pub ack_error, set_ack_error: 3;
    /// Dominant bit transmitted, recessive bit received
    pub bit0_error, set_bit0_error: 4;
    /// Recessive bit transmitted, dominant bit received
    pub bit1_error, set_bit1_error: 5;
    /// TX error counter has reached the warning limit
    pub tx_warning, set_tx_warning: 8;
    /// RX error counter has reached the warning limit
    pub rx_warning, set_rx_warning: 9;
    /// Fault confinement state; `0b00` error active, `0b01` error passive,
    /// `0b1x` bus-off
    pub u8, fault_confinement, set_fault_confinement: 13, 12;
}

impl StatusFlags {
    /// Wraps a raw status word
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Status word with no flags set
    pub fn empty() -> Self {
        Self(0)
    }

    /// The raw status word
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for StatusFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StatusFlags")
            .field("raw", &self.0)
            .field("fault_confinement", &self.fault_confinement())
            .finish()
    }
}

/// Hardware TX/RX error counters
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Transmit error counter
    pub tx: u8,
    /// Receive error counter
    pub rx: u8,
}

/// Transfer completion event demultiplexed by the platform ISR
///
/// Each variant carries exactly the payload the dispatch path needs: the
/// physical mailbox index for per-mailbox completions, or the raw status word
/// for error events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The controller reported one or more bus errors
    ErrorStatus {
        /// Raw status word sampled by the ISR
        flags: u64,
    },
    /// A remote transmission completed and the mailbox was switched to
    /// receive by the hardware
    TxSwitchToRx {
        /// Physical mailbox index
        mailbox: u8,
    },
    /// A transmission completed and the mailbox returned to idle
    TxIdle {
        /// Physical mailbox index
        mailbox: u8,
    },
    /// A frame was received into a mailbox that still held unread data
    RxOverflow {
        /// Physical mailbox index
        mailbox: u8,
    },
    /// A frame was received and the mailbox returned to idle
    RxIdle {
        /// Physical mailbox index
        mailbox: u8,
    },
    /// A status the ISR does not recognize
    Unhandled {
        /// Raw status word sampled by the ISR
        flags: u64,
    },
}

/// Controller register block, consumed as an opaque interface
///
/// Implementations wrap the memory-mapped register block and expose the
/// non-blocking transfer primitives the driver builds on. All methods take
/// `&self`; the driver serializes multi-step programming sequences itself.
pub trait Hardware {
    /// Number of physical mailboxes implemented by this instance
    fn mailbox_count(&self) -> u8;

    /// Whether this instance supports CAN FD frames
    fn fd_capable(&self) -> bool;

    /// Highest bitrate supported by this instance
    fn max_bitrate(&self) -> HertzU32;

    /// Enters freeze mode, halting bus participation
    ///
    /// Timing and mailbox-configuration registers may only be written in
    /// freeze mode.
    fn enter_freeze(&self);

    /// Leaves freeze mode and resumes bus participation
    fn exit_freeze(&self);

    /// Writes the bit timing registers
    ///
    /// Hardware quirk: committing the timing implicitly leaves freeze mode,
    /// so a successful call leaves the controller running.
    fn apply_timing(&self, nominal: &BitTiming, data: Option<&BitTiming>);

    /// Writes the operating mode control bits
    ///
    /// `tdc` selects transceiver delay compensation; the driver never
    /// enables it together with loopback.
    fn apply_mode(&self, mode: ModeFlags, tdc: bool);

    /// Resets the TX/RX error counters
    fn clear_error_counters(&self);

    /// Reads the current status word
    fn status(&self) -> StatusFlags;

    /// Reads the current TX/RX error counters
    fn error_counters(&self) -> ErrorCounters;

    /// Copies an encoded frame into a mailbox
    fn write_mailbox(&self, mailbox: u8, raw: &RawMailbox);

    /// Reads a mailbox back, locking and releasing it as required
    fn read_mailbox(&self, mailbox: u8) -> Result<RawMailbox>;

    /// Writes the id/mask acceptance configuration of a receive mailbox
    ///
    /// Only legal in freeze mode.
    fn configure_receive(&self, mailbox: u8, filter: &RawFilter);

    /// Returns a mailbox to the inactive state
    fn deconfigure(&self, mailbox: u8);

    /// Issues a non-blocking transmit on a previously written mailbox
    fn transmit(&self, mailbox: u8) -> Result<()>;

    /// Arms a non-blocking receive on a previously configured mailbox
    fn receive(&self, mailbox: u8) -> Result<()>;

    /// Aborts the in-flight transfer on a mailbox, if any
    fn abort(&self, mailbox: u8);

    /// Sets or clears the bus-off recovery inhibit bit
    #[cfg(feature = "manual-recovery")]
    fn set_recovery_inhibit(&self, inhibit: bool);
}

/// Clock and transceiver collaborators
///
/// Everything the driver needs from the surrounding platform that is not
/// the register block itself.
pub trait Dependencies {
    /// Frequency of the clock feeding the CAN protocol engine
    fn can_clock(&self) -> HertzU32;

    /// Busy-waits for `us` microseconds
    ///
    /// Paces the driver's bounded poll loops; never called from the
    /// interrupt path.
    fn delay_us(&self, us: u32);

    /// Powers up the bus transceiver, if one is under driver control
    fn enable_transceiver(&self) -> Result<()> {
        Ok(())
    }

    /// Powers down the bus transceiver, if one is under driver control
    fn disable_transceiver(&self) {}
}
