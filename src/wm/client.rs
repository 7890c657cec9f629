//! Per-client model: geometry, dirty bits, and the hot/cold payloads
//! stored in the entity slot map.

use bitflags::bitflags;

use crate::core::{Handle, OpenHash, SmallVec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub w: u16,
    pub h: u16,
}

impl Rect {
    pub fn new(x: i16, y: i16, w: u16, h: u16) -> Self {
        Rect { x, y, w, h }
    }
}

/// Bounding-box accumulator for exposure and damage rectangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub x: i16,
    pub y: i16,
    pub w: u16,
    pub h: u16,
    pub valid: bool,
}

impl Region {
    pub fn from_rect(x: i16, y: i16, w: u16, h: u16) -> Self {
        Region { x, y, w, h, valid: w > 0 && h > 0 }
    }

    pub fn reset(&mut self) {
        *self = Region::default();
    }

    /// Grow to the bounding box of self and the given rectangle.
    pub fn union_rect(&mut self, x: i16, y: i16, w: u16, h: u16) {
        let src = Region::from_rect(x, y, w, h);
        if !src.valid {
            return;
        }
        if !self.valid {
            *self = src;
            return;
        }
        let x1 = i32::from(self.x).min(i32::from(src.x));
        let y1 = i32::from(self.y).min(i32::from(src.y));
        let x2 = (i32::from(self.x) + i32::from(self.w))
            .max(i32::from(src.x) + i32::from(src.w));
        let y2 = (i32::from(self.y) + i32::from(self.h))
            .max(i32::from(src.y) + i32::from(src.h));
        // A union wider than the protocol can express clamps to the
        // maximum extent; the repaint stays pending, just oversized.
        self.x = x1 as i16;
        self.y = y1 as i16;
        self.w = (x2 - x1).min(i32::from(u16::MAX)) as u16;
        self.h = (y2 - y1).min(i32::from(u16::MAX)) as u16;
    }
}

bitflags! {
    /// Per-entity deferred work, consumed by the flush phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirtyFlags: u32 {
        const GEOM  = 1 << 0;
        const STACK = 1 << 1;
        const FRAME = 1 << 2;
        const PROPS = 1 << 3;
    }
}

bitflags! {
    /// Root-window properties needing republication.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RootDirty: u32 {
        const CLIENT_LIST          = 1 << 0;
        const CLIENT_LIST_STACKING = 1 << 1;
        const ACTIVE_WINDOW        = 1 << 2;
        const WORKAREA             = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Unmanaged,
    /// Allocated, waiting for the initial attribute/geometry replies.
    New,
    Mapped,
    Unmapped,
    Unmanaging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(usize)]
pub enum Layer {
    Desktop = 0,
    Below,
    #[default]
    Normal,
    Above,
    Fullscreen,
    Overlay,
}

impl Layer {
    pub const COUNT: usize = 6;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// State touched every cycle.
#[derive(Debug, Clone, Default)]
pub struct ClientHot {
    pub xid: u32,
    pub frame: u32,
    /// Geometry the server last confirmed.
    pub server: Rect,
    /// Geometry we want; flushed when it diverges from `server`.
    pub desired: Rect,
    /// Geometry sent but not yet confirmed.
    pub pending: Rect,
    pub dirty: DirtyFlags,
    pub state: ClientState,
    pub layer: Layer,
    pub pending_replies: u8,
    /// Unmaps to swallow (reparenting generates synthetic ones).
    pub ignore_unmap: u8,
    pub override_redirect: bool,
    pub manage_aborted: bool,
    pub colormap: u32,
    pub frame_damage: Region,
    pub last_pointer: (i16, i16),
    /// Atoms whose values changed this cycle; refetched at flush.
    pub changed_atoms: SmallVec<u64>,
}

/// Property value stored opaquely; the core never interprets the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyValue {
    pub format: u8,
    pub ty: u32,
    pub data: Vec<u8>,
}

/// State touched rarely (property cache, adoption record).
#[derive(Debug, Default)]
pub struct ClientCold {
    /// Cached property bytes keyed by atom.
    pub properties: OpenHash<PropertyValue>,
    pub map_state_at_adopt: u8,
}

/// Per-client handle plus the layer stacks the flush phase restacks from.
#[derive(Debug, Default)]
pub struct Stacking {
    /// Bottom-to-top order within each layer.
    pub layers: [SmallVec<Handle>; Layer::COUNT],
}

impl Stacking {
    pub fn push(&mut self, layer: Layer, handle: Handle) {
        self.layers[layer.index()].push(handle);
    }

    pub fn remove(&mut self, layer: Layer, handle: Handle) -> bool {
        self.layers[layer.index()].remove_item(&handle)
    }

    /// All handles bottom-to-top across layers, lowest layer first.
    pub fn iter_bottom_up(&self) -> impl Iterator<Item = Handle> + '_ {
        self.layers.iter().flat_map(|l| l.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_union_is_bounding_box() {
        let mut r = Region::from_rect(0, 0, 10, 10);
        r.union_rect(5, 5, 10, 10);
        assert_eq!(r, Region { x: 0, y: 0, w: 15, h: 15, valid: true });
    }

    #[test]
    fn region_union_clamps_oversized_extent() {
        let mut r = Region::from_rect(i16::MIN, 0, 10, 10);
        r.union_rect(i16::MAX - 5, 0, 10, 10);
        assert!(r.valid);
        assert_eq!(r.x, i16::MIN);
        assert_eq!(r.w, u16::MAX);
        assert_eq!(r.h, 10);
    }

    #[test]
    fn region_union_ignores_empty_rects() {
        let mut r = Region::default();
        r.union_rect(3, 4, 0, 7);
        assert!(!r.valid);
        r.union_rect(3, 4, 5, 7);
        assert_eq!(r, Region { x: 3, y: 4, w: 5, h: 7, valid: true });
        r.union_rect(0, 0, 0, 0);
        assert_eq!(r.w, 5);
    }

    #[test]
    fn stacking_remove_is_identity_based() {
        let mut stacking = Stacking::default();
        let a = Handle::new(1, 1);
        let b = Handle::new(2, 1);
        stacking.push(Layer::Normal, a);
        stacking.push(Layer::Normal, b);
        stacking.push(Layer::Overlay, a);

        assert!(stacking.remove(Layer::Normal, a));
        assert!(!stacking.remove(Layer::Normal, a));
        let order: Vec<_> = stacking.iter_bottom_up().collect();
        assert_eq!(order, vec![b, a]);
    }
}
