//! CAN frames and their mailbox representation
//!
//! [`Frame`] is the driver's owned frame type; [`RawMailbox`] is the
//! word-level layout a frame occupies in controller message RAM. The codec
//! lives here so the hardware trait only ever moves opaque words.

use embedded_can::{ExtendedId, Id, StandardId};

/// Error returned when a payload exceeds what the frame format allows
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TooMuchData;

/// Word-level image of one message buffer
///
/// Layout matches the controller: a control/status word, an id word and up
/// to 64 payload bytes packed big-endian into data words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct RawMailbox {
    /// Control and status word (EDL/BRS/SRR/IDE/RTR/DLC)
    pub control: u32,
    /// Arbitration id word
    pub id: u32,
    /// Payload words, most significant byte first
    pub data: [u32; 16],
}

const CTRL_EDL: u32 = 1 << 31;
const CTRL_BRS: u32 = 1 << 30;
const CTRL_SRR: u32 = 1 << 22;
const CTRL_IDE: u32 = 1 << 21;
const CTRL_RTR: u32 = 1 << 20;
const CTRL_DLC_SHIFT: u32 = 16;
const CTRL_DLC_MASK: u32 = 0xF << CTRL_DLC_SHIFT;

const ID_STD_SHIFT: u32 = 18;
const ID_EXT_MASK: u32 = 0x1FFF_FFFF;

impl RawMailbox {
    /// An all-zero mailbox image
    pub const fn empty() -> Self {
        Self {
            control: 0,
            id: 0,
            data: [0; 16],
        }
    }
}

/// Converts a data length code to a length in bytes
pub fn dlc_to_len(dlc: u8, fd: bool) -> u8 {
    match dlc {
        0..=8 => dlc,
        _ if !fd => 8,
        9 => 12,
        10 => 16,
        11 => 20,
        12 => 24,
        13 => 32,
        14 => 48,
        _ => 64,
    }
}

/// Converts a length in bytes to the smallest data length code that fits
fn len_to_dlc(len: u8, fd: bool) -> Result<u8, TooMuchData> {
    match len {
        0..=8 => Ok(len),
        _ if !fd => Err(TooMuchData),
        9..=12 => Ok(9),
        13..=16 => Ok(10),
        17..=20 => Ok(11),
        21..=24 => Ok(12),
        25..=32 => Ok(13),
        33..=48 => Ok(14),
        49..=64 => Ok(15),
        _ => Err(TooMuchData),
    }
}

/// An owned classic or FD CAN frame
///
/// FD payload lengths are quantized to a valid data length code at
/// construction time, so the stored length always matches what goes on the
/// wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    id: Id,
    remote: bool,
    fd: bool,
    brs: bool,
    len: u8,
    data: [u8; 64],
}

impl Frame {
    /// Creates a classic data frame; at most 8 payload bytes
    pub fn new(id: impl Into<Id>, data: &[u8]) -> Result<Self, TooMuchData> {
        if data.len() > 8 {
            return Err(TooMuchData);
        }
        let mut bytes = [0; 64];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            id: id.into(),
            remote: false,
            fd: false,
            brs: false,
            len: data.len() as u8,
            data: bytes,
        })
    }

    /// Creates a classic remote frame requesting `len` bytes
    pub fn new_remote(id: impl Into<Id>, len: usize) -> Result<Self, TooMuchData> {
        if len > 8 {
            return Err(TooMuchData);
        }
        Ok(Self {
            id: id.into(),
            remote: true,
            fd: false,
            brs: false,
            len: len as u8,
            data: [0; 64],
        })
    }

    /// Creates an FD data frame; at most 64 payload bytes
    ///
    /// `brs` requests the higher data phase bit rate. The payload is padded
    /// up to the next valid FD length.
    pub fn new_fd(id: impl Into<Id>, data: &[u8], brs: bool) -> Result<Self, TooMuchData> {
        if data.len() > 64 {
            return Err(TooMuchData);
        }
        let len = dlc_to_len(len_to_dlc(data.len() as u8, true)?, true);
        let mut bytes = [0; 64];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            id: id.into(),
            remote: false,
            fd: true,
            brs,
            len,
            data: bytes,
        })
    }

    /// Arbitration id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Whether this is a remote frame
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Whether this is an FD frame
    pub fn is_fd(&self) -> bool {
        self.fd
    }

    /// Whether the data phase uses the higher bit rate
    pub fn bit_rate_switched(&self) -> bool {
        self.brs
    }

    /// Payload bytes; empty for remote frames
    pub fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..usize::from(self.len)]
        }
    }

    /// Payload length in bytes; for remote frames, the requested length
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    /// Whether the frame carries no payload
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Encodes the frame into a mailbox image
    ///
    /// The transfer code bits stay zero; arming the mailbox is the hardware
    /// layer's job.
    pub fn to_mailbox(&self) -> RawMailbox {
        let mut raw = RawMailbox::empty();

        let dlc = match len_to_dlc(self.len, self.fd) {
            Ok(dlc) => u32::from(dlc),
            // Unreachable, constructors cap the length.
            Err(TooMuchData) => 0xF,
        };
        raw.control = dlc << CTRL_DLC_SHIFT;
        if self.fd {
            raw.control |= CTRL_EDL;
        }
        if self.brs {
            raw.control |= CTRL_BRS;
        }
        if self.remote {
            raw.control |= CTRL_RTR;
        }
        match self.id {
            Id::Standard(id) => {
                raw.id = u32::from(id.as_raw()) << ID_STD_SHIFT;
            }
            Id::Extended(id) => {
                raw.control |= CTRL_IDE | CTRL_SRR;
                raw.id = id.as_raw() & ID_EXT_MASK;
            }
        }
        for (k, byte) in self.data[..usize::from(self.len)].iter().enumerate() {
            raw.data[k / 4] |= u32::from(*byte) << ((3 - k % 4) * 8);
        }
        raw
    }

    /// Decodes a received mailbox image
    pub fn from_mailbox(raw: &RawMailbox) -> Self {
        let fd = raw.control & CTRL_EDL != 0;
        let remote = !fd && raw.control & CTRL_RTR != 0;
        let dlc = ((raw.control & CTRL_DLC_MASK) >> CTRL_DLC_SHIFT) as u8;
        let len = dlc_to_len(dlc, fd);

        let id = if raw.control & CTRL_IDE != 0 {
            // Masked to 29 bits, cannot exceed ExtendedId::MAX.
            match ExtendedId::new(raw.id & ID_EXT_MASK) {
                Some(id) => Id::Extended(id),
                None => Id::Extended(ExtendedId::ZERO),
            }
        } else {
            match StandardId::new(((raw.id >> ID_STD_SHIFT) & 0x7FF) as u16) {
                Some(id) => Id::Standard(id),
                None => Id::Standard(StandardId::ZERO),
            }
        };

        let mut data = [0; 64];
        if !remote {
            for (k, byte) in data[..usize::from(len)].iter_mut().enumerate() {
                *byte = (raw.data[k / 4] >> ((3 - k % 4) * 8)) as u8;
            }
        }
        Self {
            id,
            remote,
            fd,
            brs: fd && raw.control & CTRL_BRS != 0,
            len,
            data,
        }
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Frame::new(id, data).ok()
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        Frame::new_remote(id, dlc).ok()
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        usize::from(self.len)
    }

    fn data(&self) -> &[u8] {
        Frame::data(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_id(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    fn ext_id(raw: u32) -> Id {
        Id::Extended(ExtendedId::new(raw).unwrap())
    }

    #[test]
    fn classic_standard_round_trip() {
        let frame = Frame::new(std_id(0x123), &[0xDE, 0xAD, 0xBE, 0xEF, 0x01]).unwrap();
        let raw = frame.to_mailbox();
        assert_eq!(raw.id, 0x123 << 18);
        assert_eq!(raw.control & CTRL_IDE, 0);
        assert_eq!((raw.control & CTRL_DLC_MASK) >> CTRL_DLC_SHIFT, 5);
        assert_eq!(Frame::from_mailbox(&raw), frame);
    }

    #[test]
    fn classic_extended_round_trip() {
        let frame = Frame::new(ext_id(0x1ABC_DEF0), &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let raw = frame.to_mailbox();
        assert_eq!(raw.id, 0x1ABC_DEF0);
        assert_ne!(raw.control & CTRL_IDE, 0);
        assert_ne!(raw.control & CTRL_SRR, 0);
        assert_eq!(Frame::from_mailbox(&raw), frame);
    }

    #[test]
    fn payload_is_packed_big_endian() {
        let frame = Frame::new(std_id(1), &[0x11, 0x22, 0x33, 0x44, 0x55]).unwrap();
        let raw = frame.to_mailbox();
        assert_eq!(raw.data[0], 0x1122_3344);
        assert_eq!(raw.data[1], 0x5500_0000);
    }

    #[test]
    fn remote_frame_carries_length_but_no_data() {
        let frame = Frame::new_remote(std_id(0x7FF), 4).unwrap();
        assert!(frame.is_remote());
        assert_eq!(frame.len(), 4);
        assert!(frame.data().is_empty());

        let raw = frame.to_mailbox();
        assert_ne!(raw.control & CTRL_RTR, 0);
        assert_eq!(raw.data, [0; 16]);
        assert_eq!(Frame::from_mailbox(&raw), frame);
    }

    #[test]
    fn fd_length_is_quantized_at_construction() {
        let frame = Frame::new_fd(std_id(2), &[0xAA; 13], true).unwrap();
        assert!(frame.is_fd());
        assert!(frame.bit_rate_switched());
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame.data()[..13], &[0xAA; 13]);
        assert_eq!(&frame.data()[13..], &[0; 3]);

        let raw = frame.to_mailbox();
        assert_ne!(raw.control & CTRL_EDL, 0);
        assert_ne!(raw.control & CTRL_BRS, 0);
        assert_eq!(Frame::from_mailbox(&raw), frame);
    }

    #[test]
    fn empty_payload_round_trip() {
        let classic = Frame::new(std_id(0x20), &[]).unwrap();
        assert!(classic.is_empty());
        let raw = classic.to_mailbox();
        assert_eq!((raw.control & CTRL_DLC_MASK) >> CTRL_DLC_SHIFT, 0);
        assert_eq!(Frame::from_mailbox(&raw), classic);

        let fd = Frame::new_fd(std_id(0x20), &[], false).unwrap();
        assert!(fd.is_empty());
        assert_eq!(Frame::from_mailbox(&fd.to_mailbox()), fd);
    }

    #[test]
    fn fd_full_payload_round_trip() {
        let mut payload = [0; 64];
        for (k, byte) in payload.iter_mut().enumerate() {
            *byte = k as u8;
        }
        let frame = Frame::new_fd(ext_id(0x42), &payload, false).unwrap();
        assert_eq!(frame.len(), 64);
        assert_eq!(Frame::from_mailbox(&frame.to_mailbox()), frame);
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        assert_eq!(Frame::new(std_id(1), &[0; 9]), Err(TooMuchData));
        assert_eq!(Frame::new_remote(std_id(1), 9), Err(TooMuchData));
        assert_eq!(Frame::new_fd(std_id(1), &[0; 65], false), Err(TooMuchData));
    }

    #[test]
    fn classic_dlc_above_eight_decodes_as_eight_bytes() {
        let mut raw = Frame::new(std_id(1), &[0xFF; 8]).unwrap().to_mailbox();
        raw.control = (raw.control & !CTRL_DLC_MASK) | (0xC << CTRL_DLC_SHIFT);
        let frame = Frame::from_mailbox(&raw);
        assert!(!frame.is_fd());
        assert_eq!(frame.len(), 8);
    }
}
