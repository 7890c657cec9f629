//! Slot Map
//!
//! The authoritative registry of managed entities. Storage is split into
//! parallel arrays: headers (generation + free list), a "hot" payload
//! touched every cycle, and a "cold" payload for rarely-touched data.
//! Freed slots are recycled through a free list; each reuse bumps the
//! slot's generation, so a stale [`Handle`] can never resolve to the new
//! occupant. Index 0 is permanently reserved for the invalid handle.

use super::Handle;

struct SlotHeader {
    generation: u32,
    next_free: u32,
    live: bool,
}

pub struct SlotMap<H, C> {
    headers: Vec<SlotHeader>,
    hot: Vec<H>,
    cold: Vec<C>,
    free_head: u32,
    live_count: u32,
}

fn bump_generation(generation: u32) -> u32 {
    let next = generation.wrapping_add(1);
    // Generation 0 is the invalid sentinel; skip it on wraparound.
    if next == 0 { 1 } else { next }
}

impl<H: Default, C: Default> SlotMap<H, C> {
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(2);
        let mut map = SlotMap {
            headers: Vec::new(),
            hot: Vec::new(),
            cold: Vec::new(),
            free_head: 0,
            live_count: 0,
        };
        // Slot 0 stays dead forever.
        map.headers.push(SlotHeader {
            generation: 0,
            next_free: 0,
            live: false,
        });
        map.hot.push(H::default());
        map.cold.push(C::default());
        map.grow_to(capacity);
        map
    }

    pub fn capacity(&self) -> u32 {
        self.headers.len() as u32
    }

    pub fn len(&self) -> u32 {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Allocate a slot, growing the map if the free list is exhausted.
    /// Payloads start at their default (zeroed) state. Existing handles
    /// stay valid across growth.
    pub fn alloc(&mut self) -> (Handle, &mut H, &mut C) {
        if self.free_head == 0 {
            let cap = self.capacity();
            self.grow_to(cap * 2);
        }

        let idx = self.free_head;
        let header = &mut self.headers[idx as usize];
        self.free_head = header.next_free;
        header.live = true;
        header.next_free = 0;
        self.live_count += 1;

        let handle = Handle::new(idx, header.generation);
        self.hot[idx as usize] = H::default();
        self.cold[idx as usize] = C::default();
        (handle, &mut self.hot[idx as usize], &mut self.cold[idx as usize])
    }

    /// Release a slot. Stale or invalid handles are a no-op.
    pub fn free(&mut self, handle: Handle) {
        let idx = handle.index();
        if idx == 0 || idx >= self.capacity() {
            return;
        }
        let header = &mut self.headers[idx as usize];
        if !header.live || header.generation != handle.generation() {
            return;
        }
        header.live = false;
        header.generation = bump_generation(header.generation);
        header.next_free = self.free_head;
        self.free_head = idx;
        self.live_count -= 1;
    }

    pub fn is_live(&self, handle: Handle) -> bool {
        let idx = handle.index();
        if idx == 0 || idx >= self.capacity() {
            return false;
        }
        let header = &self.headers[idx as usize];
        header.live && header.generation == handle.generation()
    }

    pub fn hot(&self, handle: Handle) -> Option<&H> {
        self.is_live(handle).then(|| &self.hot[handle.index() as usize])
    }

    pub fn hot_mut(&mut self, handle: Handle) -> Option<&mut H> {
        self.is_live(handle)
            .then(|| &mut self.hot[handle.index() as usize])
    }

    pub fn cold(&self, handle: Handle) -> Option<&C> {
        self.is_live(handle)
            .then(|| &self.cold[handle.index() as usize])
    }

    pub fn cold_mut(&mut self, handle: Handle) -> Option<&mut C> {
        self.is_live(handle)
            .then(|| &mut self.cold[handle.index() as usize])
    }

    /// Both payloads of a live slot at once.
    pub fn pair_mut(&mut self, handle: Handle) -> Option<(&mut H, &mut C)> {
        if !self.is_live(handle) {
            return None;
        }
        let idx = handle.index() as usize;
        Some((&mut self.hot[idx], &mut self.cold[idx]))
    }

    /// Visit live slots in ascending index order. Structural mutation
    /// (alloc/free) during the walk is ruled out by the exclusive borrow.
    pub fn for_each_live(&mut self, mut visit: impl FnMut(Handle, &mut H, &mut C)) {
        for idx in 1..self.headers.len() {
            let header = &self.headers[idx];
            if !header.live {
                continue;
            }
            let handle = Handle::new(idx as u32, header.generation);
            visit(handle, &mut self.hot[idx], &mut self.cold[idx]);
        }
    }

    /// Handles of all live slots, ascending.
    pub fn live_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.headers.iter().enumerate().skip(1).filter_map(|(idx, h)| {
            h.live.then(|| Handle::new(idx as u32, h.generation))
        })
    }

    fn grow_to(&mut self, new_capacity: u32) {
        let old = self.headers.len() as u32;
        let new_capacity = new_capacity.max(2);
        if new_capacity <= old {
            return;
        }
        for idx in old..new_capacity {
            let next = if idx + 1 < new_capacity { idx + 1 } else { self.free_head };
            self.headers.push(SlotHeader {
                generation: 1,
                next_free: next,
                live: false,
            });
            self.hot.push(H::default());
            self.cold.push(C::default());
        }
        self.free_head = old;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Clone, Copy, PartialEq, Debug)]
    struct Hot {
        value: u32,
    }

    #[derive(Default)]
    struct Cold {
        name: Option<String>,
    }

    #[test]
    fn live_exactly_until_free() {
        let mut map: SlotMap<Hot, Cold> = SlotMap::new(4);
        let (h, hot, _) = map.alloc();
        hot.value = 9;
        assert!(map.is_live(h));
        assert_eq!(map.hot(h), Some(&Hot { value: 9 }));

        map.free(h);
        assert!(!map.is_live(h));
        assert_eq!(map.hot(h), None);
        // Double free is a no-op.
        map.free(h);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn stale_handle_never_matches_reused_slot() {
        let mut map: SlotMap<Hot, Cold> = SlotMap::new(2);
        let (first, _, _) = map.alloc();
        map.free(first);

        let (second, hot, _) = map.alloc();
        hot.value = 1;
        assert_eq!(second.index(), first.index());
        assert_ne!(second.generation(), first.generation());
        assert!(!map.is_live(first));
        assert!(map.is_live(second));
        assert_eq!(map.hot(first), None);
    }

    #[test]
    fn reused_slot_payload_is_reset() {
        let mut map: SlotMap<Hot, Cold> = SlotMap::new(2);
        let (h, hot, cold) = map.alloc();
        hot.value = 42;
        cold.name = Some("w".into());
        map.free(h);

        let (h2, hot, cold) = map.alloc();
        assert_eq!(hot.value, 0);
        assert!(cold.name.is_none());
        assert!(map.is_live(h2));
    }

    #[test]
    fn growth_preserves_existing_handles() {
        let mut map: SlotMap<Hot, Cold> = SlotMap::new(2);
        let mut handles = Vec::new();
        for i in 0..50u32 {
            let (h, hot, _) = map.alloc();
            hot.value = i;
            handles.push(h);
        }
        for (i, &h) in handles.iter().enumerate() {
            assert_eq!(map.hot(h), Some(&Hot { value: i as u32 }));
        }
        assert!(map.capacity() >= 51);
    }

    #[test]
    fn for_each_live_ascending() {
        let mut map: SlotMap<Hot, Cold> = SlotMap::new(8);
        let a = map.alloc().0;
        let b = map.alloc().0;
        let c = map.alloc().0;
        map.free(b);

        let mut seen = Vec::new();
        map.for_each_live(|h, _, _| seen.push(h));
        assert_eq!(seen, vec![a, c]);
        let iter: Vec<_> = map.live_handles().collect();
        assert_eq!(iter, seen);
    }

    #[test]
    fn generation_wrap_skips_sentinel() {
        assert_eq!(bump_generation(1), 2);
        assert_eq!(bump_generation(u32::MAX), 1);
    }
}
