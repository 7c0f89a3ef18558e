//! Receive filters
//!
//! Each registered filter owns one physical receive mailbox. [`Filter`] is
//! the user-facing id/mask description; [`RawFilter`] is the register-level
//! encoding handed to the hardware layer.

use crate::message::Frame;
use embedded_can::Id;

/// Id/mask acceptance filter
///
/// A received frame matches when its id bits agree with `id` on every bit
/// set in `mask`, and its frame type matches `remote` and `fd`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    /// Id to compare against
    pub id: Id,
    /// Id bits that take part in the comparison
    pub mask: u32,
    /// Match remote frames instead of data frames
    pub remote: bool,
    /// Match FD frames; the receive mailbox is set up for 64-byte payloads
    pub fd: bool,
}

impl Filter {
    /// Filter matching exactly one data frame id
    pub fn exact(id: impl Into<Id>) -> Self {
        let id = id.into();
        let mask = match id {
            Id::Standard(_) => 0x7FF,
            Id::Extended(_) => 0x1FFF_FFFF,
        };
        Self {
            id,
            mask,
            remote: false,
            fd: false,
        }
    }

    /// Filter accepting every frame with the same id format
    pub fn accept_all(id: impl Into<Id>) -> Self {
        Self {
            mask: 0,
            ..Self::exact(id)
        }
    }
}

const MASK_RTR: u32 = 1 << 31;
const MASK_IDE: u32 = 1 << 30;
const CTRL_IDE: u32 = 1 << 21;
const CTRL_RTR: u32 = 1 << 20;
const ID_STD_SHIFT: u32 = 18;
const ID_EXT_MASK: u32 = 0x1FFF_FFFF;

/// Register-level encoding of a receive filter
///
/// The id and control words use the mailbox layout; the mask word always
/// compares the IDE and RTR bits so a filter never matches the wrong frame
/// type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RawFilter {
    /// Id word to compare against
    pub id: u32,
    /// Acceptance mask word
    pub mask: u32,
    /// Control word carrying the expected IDE/RTR bits
    pub control: u32,
}

impl From<Filter> for RawFilter {
    fn from(filter: Filter) -> Self {
        let (id, mask) = match filter.id {
            Id::Standard(id) => (
                u32::from(id.as_raw()) << ID_STD_SHIFT,
                (filter.mask & 0x7FF) << ID_STD_SHIFT,
            ),
            Id::Extended(id) => (id.as_raw() & ID_EXT_MASK, filter.mask & ID_EXT_MASK),
        };
        let mut control = 0;
        if matches!(filter.id, Id::Extended(_)) {
            control |= CTRL_IDE;
        }
        if filter.remote {
            control |= CTRL_RTR;
        }
        Self {
            id,
            mask: mask | MASK_IDE | MASK_RTR,
            control,
        }
    }
}

/// Consumer of frames accepted by a receive filter
///
/// Called from interrupt context with the filter's allocation id;
/// implementations must not block.
pub trait RxHandler: Sync {
    /// A frame matching filter `filter` arrived
    fn on_frame(&self, filter: u8, frame: &Frame);
}

/// Bookkeeping payload of one registered filter
#[derive(Copy, Clone)]
pub(crate) struct RxSlot {
    pub(crate) handler: &'static dyn RxHandler,
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::{ExtendedId, StandardId};

    #[test]
    fn standard_filter_encodes_shifted_id_and_mask() {
        let raw: RawFilter = Filter {
            id: Id::Standard(StandardId::new(0x123).unwrap()),
            mask: 0x700,
            remote: false,
            fd: false,
        }
        .into();
        assert_eq!(raw.id, 0x123 << 18);
        assert_eq!(raw.mask, (0x700 << 18) | MASK_IDE | MASK_RTR);
        assert_eq!(raw.control, 0);
    }

    #[test]
    fn extended_remote_filter_sets_control_bits() {
        let raw: RawFilter = Filter {
            id: Id::Extended(ExtendedId::new(0x1ABC_DEF0).unwrap()),
            mask: 0x1FFF_FFFF,
            remote: true,
            fd: false,
        }
        .into();
        assert_eq!(raw.id, 0x1ABC_DEF0);
        assert_eq!(raw.mask, 0x1FFF_FFFF | MASK_IDE | MASK_RTR);
        assert_eq!(raw.control, CTRL_IDE | CTRL_RTR);
    }

    #[test]
    fn exact_and_accept_all_helpers() {
        let exact = Filter::exact(StandardId::new(0x42).unwrap());
        assert_eq!(exact.mask, 0x7FF);
        assert!(!exact.remote);

        let all = Filter::accept_all(ExtendedId::new(0).unwrap());
        assert_eq!(all.mask, 0);
    }
}
