//! Linux capability management for privilege minimization.
//!
//! The daemon only ever keeps `CAP_SYS_NICE`. Everything here is thin
//! wrappers over `capget(2)`/`capset(2)` and `prctl(2)`.

mod sets;

pub use sets::{drop_all_capabilities, effective_capabilities, restrict_to, set_keep_caps};

/// Capability number newtype for type safety.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CapabilityNumber(u32);

impl CapabilityNumber {
    pub const MAX_CAP: u32 = 63;

    /// Permits raising scheduling priority and selecting real-time policies
    pub const SYS_NICE: CapabilityNumber = CapabilityNumber(23);

    pub fn new(cap: u32) -> Option<Self> {
        if cap <= Self::MAX_CAP {
            Some(Self(cap))
        } else {
            None
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

/// Bitmask over the 64 capability slots of the v3 ABI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityMask(u64);

impl CapabilityMask {
    pub const EMPTY: CapabilityMask = CapabilityMask(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn only(cap: CapabilityNumber) -> Self {
        Self(1u64 << cap.value())
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, cap: CapabilityNumber) -> bool {
        self.0 & (1u64 << cap.value()) != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

pub(crate) const PR_SET_KEEPCAPS: libc::c_int = 8;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_number_validates_range() {
        assert!(CapabilityNumber::new(0).is_some());
        assert!(CapabilityNumber::new(63).is_some());
        assert!(CapabilityNumber::new(64).is_none());
    }

    #[test]
    fn mask_tracks_single_capability() {
        let mask = CapabilityMask::only(CapabilityNumber::SYS_NICE);
        assert!(mask.contains(CapabilityNumber::SYS_NICE));
        assert!(!mask.contains(CapabilityNumber::new(0).unwrap()));
        assert_eq!(mask.count(), 1);
        assert_eq!(mask.bits(), 1 << 23);
        assert!(CapabilityMask::EMPTY.is_empty());
    }
}
