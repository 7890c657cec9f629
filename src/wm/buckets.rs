//! Event Buckets
//!
//! One cycle's worth of deduplicated events. Kinds where ordering matters
//! (lifecycle, input, client messages) go into append-only queues; kinds
//! where later data supersedes or merges with earlier data go into keyed
//! maps. A single instance lives on the server and is reset, capacity
//! intact, at the top of every cycle.

use crate::core::{OpenHash, SmallVec};
use crate::transport::{ConfigureMask, ConfigureValues};
use crate::wm::client::{Rect, Region};

/// Merged view of repeated configure requests for one window: the union of
/// the field masks with the latest value of each field.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingGeometry {
    pub mask: ConfigureMask,
    pub values: ConfigureValues,
}

impl PendingGeometry {
    pub fn new(mask: ConfigureMask, values: ConfigureValues) -> Self {
        PendingGeometry { mask, values }
    }

    /// Fold a later request in. Unmasked fields keep their prior values;
    /// masked ones take the newer event's.
    pub fn merge(&mut self, mask: ConfigureMask, values: ConfigureValues) {
        if mask.contains(ConfigureMask::X) {
            self.values.x = values.x;
        }
        if mask.contains(ConfigureMask::Y) {
            self.values.y = values.y;
        }
        if mask.contains(ConfigureMask::WIDTH) {
            self.values.width = values.width;
        }
        if mask.contains(ConfigureMask::HEIGHT) {
            self.values.height = values.height;
        }
        if mask.contains(ConfigureMask::BORDER_WIDTH) {
            self.values.border_width = values.border_width;
        }
        if mask.contains(ConfigureMask::SIBLING) {
            self.values.sibling = values.sibling;
        }
        if mask.contains(ConfigureMask::STACK_MODE) {
            self.values.stack_mode = values.stack_mode;
        }
        self.mask |= mask;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ButtonEvent {
    pub window: u32,
    pub detail: u8,
    pub state: u16,
    pub root_x: i16,
    pub root_y: i16,
    pub pressed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMessageEvent {
    pub window: u32,
    pub message_type: u32,
    pub format: u8,
    pub data: [u32; 5],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MotionEvent {
    pub root_x: i16,
    pub root_y: i16,
    pub state: u16,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PropertyEvent {
    pub window: u32,
    pub atom: u32,
    pub deleted: bool,
}

#[derive(Debug, Default)]
pub struct EventBuckets {
    // Arrival order preserved.
    pub map_requests: SmallVec<u32>,
    pub unmap_notifies: SmallVec<u32>,
    pub destroy_notifies: SmallVec<u32>,
    pub create_notifies: SmallVec<(u32, bool)>,
    pub key_presses: SmallVec<(u8, u16)>,
    pub button_events: SmallVec<ButtonEvent>,
    pub client_messages: SmallVec<ClientMessageEvent>,

    // Keyed by window; later events merge or replace.
    pub configure_requests: OpenHash<PendingGeometry>,
    pub configure_notifies: OpenHash<Rect>,
    pub expose_regions: OpenHash<Region>,
    pub damage_regions: OpenHash<Region>,
    pub motion_notifies: OpenHash<MotionEvent>,
    /// Keyed by `window << 32 | atom`.
    pub property_notifies: OpenHash<PropertyEvent>,
    /// Windows destroyed this cycle; lifecycle stages consult this to skip
    /// work on windows that no longer exist.
    pub destroyed: OpenHash<()>,

    // Latest wins.
    pub pointer_enter: Option<(u32, i16, i16)>,
    pub pointer_leave: Option<u32>,
    pub screen_change: Option<(u16, u16)>,

    pub ingested: u32,
    pub coalesced: u32,
}

impl EventBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty every container, keeping allocated capacity for the next
    /// cycle.
    pub fn reset(&mut self) {
        self.map_requests.clear();
        self.unmap_notifies.clear();
        self.destroy_notifies.clear();
        self.create_notifies.clear();
        self.key_presses.clear();
        self.button_events.clear();
        self.client_messages.clear();
        self.configure_requests.clear();
        self.configure_notifies.clear();
        self.expose_regions.clear();
        self.damage_regions.clear();
        self.motion_notifies.clear();
        self.property_notifies.clear();
        self.destroyed.clear();
        self.pointer_enter = None;
        self.pointer_leave = None;
        self.screen_change = None;
        self.ingested = 0;
        self.coalesced = 0;
    }

    pub fn property_key(window: u32, atom: u32) -> u64 {
        (u64::from(window) << 32) | u64::from(atom)
    }
}
