//! Entity Handles
//!
//! Handle-based identity instead of references: stable to store in maps,
//! queues and cookies, and safely invalidated when the slot is reused.
//! Packed into 64 bits as `generation << 32 | index`. Index 0 and
//! generation 0 are reserved invalid sentinels.

/// Opaque capability identifying an entity in a [`SlotMap`](super::SlotMap).
///
/// A handle is only meaningful to the store that issued it. Every
/// dereference goes through the store's checked accessors, which reject
/// handles whose slot has since been freed and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// The invalid sentinel. Never live in any store.
    pub const INVALID: Handle = Handle(0);

    pub fn new(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    pub fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }

    /// Raw 64-bit value, for storage in integer-keyed maps.
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_bits(bits: u64) -> Self {
        Handle(bits)
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::INVALID
    }
}
