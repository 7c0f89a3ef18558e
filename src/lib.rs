#![no_std]
#![warn(missing_docs)]
//! # FlexCAN
//!
//! ## Overview
//! This crate provides a platform-agnostic driver core for mailbox-based
//! FlexCAN controllers.
//!
//! It provides the following features:
//!
//! - classical CAN and CAN FD with bitrate switching support
//! - bit timing calculation from a requested bitrate and sample point
//! - a transmit mailbox pool with blocking and callback completion
//! - id/mask receive filters, one per receive mailbox
//! - bus state tracking with error statistics and a state change listener
//! - manual bus-off recovery (behind the default `manual-recovery` feature)
//!
//! The controller is embedded in the MCU like all other peripherals. The
//! driver stays portable by going through two traits the platform-specific
//! HAL implements: [`Hardware`] wraps the register block behind word-level
//! mailbox and transfer primitives, and [`Dependencies`] supplies the
//! protocol clock, a microsecond delay and optional transceiver control.
//! The platform ISR demultiplexes the controller's transfer status into
//! [`Event`] values and feeds them to [`Can::on_interrupt`].
//!
//! To use the driver, instantiate [`Can`] with the desired mailbox
//! partitioning, configure mode and timing while stopped, and [`start`] it.
//! [`Can`] is `&self` throughout and meant to be shared with the ISR, for
//! example as a `static`.
//!
//! ```no_run
//! # fn example<H: flexcan::Hardware, D: flexcan::Dependencies>(
//! #     hw: H,
//! #     deps: D,
//! # ) -> flexcan::Result<()> {
//! use flexcan::config::{calc_timing, CanConfig};
//! use flexcan::mailbox::Timeout;
//! use flexcan::message::Frame;
//! use flexcan::embedded_can::StandardId;
//! use fugit::RateExtU32;
//!
//! let timing = calc_timing(deps.can_clock(), 500_u32.kHz(), 875)?;
//! let can: flexcan::Can<_, _, 8, 5> = flexcan::Can::new(hw, deps, CanConfig::new(timing))?;
//! can.start()?;
//!
//! let id = StandardId::new(0x123).ok_or(flexcan::Error::Config)?;
//! let frame = Frame::new(id, &[1, 2, 3]).map_err(|_| flexcan::Error::Config)?;
//! can.send(&frame, Timeout::Forever, None)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`start`]: Can::start
//! [`Hardware`]: crate::hardware::Hardware
//! [`Dependencies`]: crate::hardware::Dependencies
//! [`Event`]: crate::hardware::Event
//! [`Can::on_interrupt`]: crate::bus::Can::on_interrupt

pub use embedded_can;

pub mod bus;
pub mod config;
pub mod filter;
pub mod hardware;
mod interrupt;
pub mod mailbox;
pub mod message;
pub mod state;
mod tx;

pub use bus::{Can, Error, Result, TxDone};
pub use hardware::{Dependencies, Event, Hardware};
