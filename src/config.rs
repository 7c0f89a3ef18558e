//! Controller configuration
//!
//! Bit timing parameters with per-phase range validation, a best-effort
//! timing calculator, and the operating mode flag set.

use crate::bus::{Error, Result};
use bitfield::bitfield;
use core::ops::RangeInclusive;
use fugit::HertzU32;

/// Bit timing parameters for one bit rate phase
///
/// Field values are in "real" units, not register encodings: a prescaler of
/// `1` divides by one, a phase segment of `3` lasts three time quanta.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BitTiming {
    /// Clock prescaler; a time quantum is `prescaler` protocol clock cycles
    pub prescaler: u16,
    /// Propagation segment, in time quanta
    pub prop_seg: u8,
    /// Phase segment 1, in time quanta
    pub phase_seg_1: u8,
    /// Phase segment 2, in time quanta
    pub phase_seg_2: u8,
    /// (Re)synchronization jump width, in time quanta
    ///
    /// `None` keeps the jump width already programmed in hardware.
    pub sjw: Option<u8>,
}

impl BitTiming {
    /// Total length of one bit in time quanta, including the sync segment
    pub fn time_quanta_per_bit(&self) -> u32 {
        1 + u32::from(self.prop_seg) + u32::from(self.phase_seg_1) + u32::from(self.phase_seg_2)
    }

    /// Bit rate these parameters produce from the given protocol clock
    ///
    /// A zero prescaler (rejected by [`verify`](Self::verify)) is treated
    /// as one.
    pub fn bitrate(&self, clock: HertzU32) -> HertzU32 {
        let prescaler = u32::from(self.prescaler).max(1);
        HertzU32::from_raw(clock.to_Hz() / prescaler / self.time_quanta_per_bit())
    }

    /// Sample point location in per mille of the bit length
    pub fn sample_point_permille(&self) -> u16 {
        let sampled = 1 + u32::from(self.prop_seg) + u32::from(self.phase_seg_1);
        (sampled * 1000 / self.time_quanta_per_bit()) as u16
    }

    /// Checks every field against the given hardware limits
    pub fn verify(&self, limits: &TimingLimits) -> Result<()> {
        let ok = limits.prescaler.contains(&self.prescaler)
            && limits.prop_seg.contains(&self.prop_seg)
            && limits.phase_seg_1.contains(&self.phase_seg_1)
            && limits.phase_seg_2.contains(&self.phase_seg_2)
            && limits
                .time_quanta_per_bit
                .contains(&self.time_quanta_per_bit())
            && self
                .sjw
                .map_or(true, |sjw| limits.sjw.contains(&sjw) && sjw <= self.phase_seg_2);
        if ok {
            Ok(())
        } else {
            Err(Error::Config)
        }
    }
}

/// Valid ranges for each [`BitTiming`] field
pub struct TimingLimits {
    /// Valid prescaler values
    pub prescaler: RangeInclusive<u16>,
    /// Valid propagation segment lengths
    pub prop_seg: RangeInclusive<u8>,
    /// Valid phase segment 1 lengths
    pub phase_seg_1: RangeInclusive<u8>,
    /// Valid phase segment 2 lengths
    pub phase_seg_2: RangeInclusive<u8>,
    /// Valid jump widths
    pub sjw: RangeInclusive<u8>,
    /// Valid total bit lengths in time quanta
    pub time_quanta_per_bit: RangeInclusive<u32>,
}

impl TimingLimits {
    /// Limits for the nominal (arbitration) phase
    pub const NOMINAL: Self = Self {
        prescaler: 1..=256,
        prop_seg: 1..=8,
        phase_seg_1: 1..=8,
        phase_seg_2: 2..=8,
        sjw: 1..=4,
        time_quanta_per_bit: 8..=25,
    };

    /// Limits for the FD data phase
    pub const DATA: Self = Self {
        prescaler: 1..=256,
        prop_seg: 0..=31,
        phase_seg_1: 1..=8,
        phase_seg_2: 2..=8,
        sjw: 1..=8,
        time_quanta_per_bit: 5..=48,
    };
}

/// Finds nominal phase timing for a requested bit rate and sample point
///
/// `sample_point` is in per mille of the bit length. Prefers long bits (many
/// time quanta) and picks the candidate whose achievable sample point is
/// closest to the request. Only exact bit rate divisions are considered.
pub fn calc_timing(
    clock: HertzU32,
    bitrate: HertzU32,
    sample_point: u16,
) -> Result<BitTiming> {
    calc_timing_with_limits(clock, bitrate, sample_point, &TimingLimits::NOMINAL)
}

/// Finds FD data phase timing for a requested bit rate and sample point
pub fn calc_timing_data(
    clock: HertzU32,
    bitrate: HertzU32,
    sample_point: u16,
) -> Result<BitTiming> {
    calc_timing_with_limits(clock, bitrate, sample_point, &TimingLimits::DATA)
}

fn calc_timing_with_limits(
    clock: HertzU32,
    bitrate: HertzU32,
    sample_point: u16,
    limits: &TimingLimits,
) -> Result<BitTiming> {
    let clock = clock.to_Hz();
    let bitrate = bitrate.to_Hz();
    if clock == 0 || bitrate == 0 || clock < bitrate {
        return Err(Error::Config);
    }

    let mut best: Option<(u16, BitTiming)> = None;
    let mut tq = *limits.time_quanta_per_bit.end();
    while tq >= *limits.time_quanta_per_bit.start() {
        let candidate = timing_for_quanta(clock, bitrate, sample_point, tq, limits);
        if let Some(timing) = candidate {
            let error = timing.sample_point_permille().abs_diff(sample_point);
            if best.as_ref().map_or(true, |(e, _)| error < *e) {
                best = Some((error, timing));
            }
        }
        tq -= 1;
    }
    best.map(|(_, timing)| timing).ok_or(Error::Config)
}

fn timing_for_quanta(
    clock: u32,
    bitrate: u32,
    sample_point: u16,
    tq: u32,
    limits: &TimingLimits,
) -> Option<BitTiming> {
    if clock % (bitrate * tq) != 0 {
        return None;
    }
    let prescaler = clock / (bitrate * tq);
    if prescaler > u32::from(*limits.prescaler.end())
        || prescaler < u32::from(*limits.prescaler.start())
    {
        return None;
    }

    // Place phase segment 2 so that the sample point lands as close to the
    // request as the segment limits allow.
    let sampled = (tq * u32::from(sample_point) + 500) / 1000;
    let phase_seg_2 = tq
        .saturating_sub(sampled)
        .max(u32::from(*limits.phase_seg_2.start()))
        .min(u32::from(*limits.phase_seg_2.end()));
    // Sync segment takes one quantum; the rest goes to prop + phase 1.
    let seg1 = tq.checked_sub(1 + phase_seg_2)?;
    let prop_seg = seg1
        .checked_sub(u32::from(*limits.phase_seg_1.start()))?
        .min(u32::from(*limits.prop_seg.end()));
    let phase_seg_1 = seg1 - prop_seg;
    if !limits.prop_seg.contains(&(prop_seg as u8))
        || !limits.phase_seg_1.contains(&(phase_seg_1 as u8))
    {
        return None;
    }

    let sjw = (phase_seg_2 as u8).min(*limits.sjw.end()).max(*limits.sjw.start());
    Some(BitTiming {
        prescaler: prescaler as u16,
        prop_seg: prop_seg as u8,
        phase_seg_1: phase_seg_1 as u8,
        phase_seg_2: phase_seg_2 as u8,
        sjw: Some(sjw),
    })
}

bitfield! {
    /// Operating mode flag set
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct ModeFlags(u8);

    /// Internal loopback, frames are reflected without touching the bus
    pub loopback, set_loopback: 0;
    /// Listen-only, the controller never drives a dominant bit
    pub listen_only, set_listen_only: 1;
    /// Sample each bit three times instead of once
    pub triple_sampling, set_triple_sampling: 2;
    /// Accept and transmit CAN FD frames
    pub fd, set_fd: 3;
}

impl core::fmt::Debug for ModeFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModeFlags")
            .field("loopback", &self.loopback())
            .field("listen_only", &self.listen_only())
            .field("triple_sampling", &self.triple_sampling())
            .field("fd", &self.fd())
            .finish()
    }
}

impl ModeFlags {
    /// Mask of all flags this driver understands
    pub const KNOWN: u8 = 0x0F;

    /// Wraps a raw flag byte
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// The raw flag byte
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Initial driver configuration
#[derive(Copy, Clone, Debug)]
pub struct CanConfig {
    /// Timing for the nominal (arbitration) phase
    pub nominal_timing: BitTiming,
    /// Timing for the FD data phase; `None` for classic-only operation
    pub data_timing: Option<BitTiming>,
    /// Number of leading physical mailboxes left unused
    ///
    /// Some controller revisions corrupt the first mailbox under bus-off
    /// conditions; reserving it sidesteps the erratum at the cost of one
    /// mailbox.
    pub reserved_mailboxes: u8,
}

impl CanConfig {
    /// Classic-CAN configuration with no reserved mailboxes
    pub fn new(nominal_timing: BitTiming) -> Self {
        Self {
            nominal_timing,
            data_timing: None,
            reserved_mailboxes: 0,
        }
    }
}
