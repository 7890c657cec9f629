//! Small Vector
//!
//! Ordered vector with 8 inline slots before spilling to the heap. Backs
//! the per-cycle event queues and the per-layer stacking lists: iteration
//! order matters, removal by value is rare and may reorder.

pub const INLINE_CAP: usize = 8;

#[derive(Clone, Debug)]
pub struct SmallVec<T: Copy + Default> {
    inline: [T; INLINE_CAP],
    heap: Vec<T>,
    len: usize,
    spilled: bool,
}

impl<T: Copy + Default> SmallVec<T> {
    pub fn new() -> Self {
        SmallVec {
            inline: [T::default(); INLINE_CAP],
            heap: Vec::new(),
            len: 0,
            spilled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        if !self.spilled {
            if self.len < INLINE_CAP {
                self.inline[self.len] = value;
                self.len += 1;
                return;
            }
            // Spill once; the heap buffer is retained from then on.
            self.heap.extend_from_slice(&self.inline);
            self.spilled = true;
        }
        self.heap.push(value);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        if self.spilled {
            self.heap.pop()
        } else {
            Some(self.inline[self.len])
        }
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.as_slice().get(idx)
    }

    pub fn as_slice(&self) -> &[T] {
        if self.spilled {
            &self.heap
        } else {
            &self.inline[..self.len]
        }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        if self.spilled {
            &mut self.heap
        } else {
            &mut self.inline[..self.len]
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    /// Drop all elements, retaining heap capacity.
    pub fn clear(&mut self) {
        self.len = 0;
        self.heap.clear();
    }

    /// O(1) removal by index; the last element takes the removed slot.
    pub fn swap_remove(&mut self, idx: usize) -> T {
        assert!(idx < self.len);
        let slice = self.as_mut_slice();
        let value = slice[idx];
        slice[idx] = slice[slice.len() - 1];
        self.len -= 1;
        if self.spilled {
            self.heap.pop();
        }
        value
    }
}

impl<T: Copy + Default + PartialEq> SmallVec<T> {
    /// Remove the first element equal to `value` by swapping the tail in.
    /// Returns whether anything was removed.
    pub fn remove_item(&mut self, value: &T) -> bool {
        match self.as_slice().iter().position(|v| v == value) {
            Some(idx) => {
                self.swap_remove(idx);
                true
            }
            None => false,
        }
    }
}

impl<T: Copy + Default> Default for SmallVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_preserves_order_across_spill() {
        let mut v = SmallVec::new();
        for i in 0..20u64 {
            v.push(i);
        }
        assert_eq!(v.len(), 20);
        let collected: Vec<u64> = v.iter().copied().collect();
        assert_eq!(collected, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn pop_inline_and_spilled() {
        let mut v = SmallVec::new();
        for i in 0..3u32 {
            v.push(i);
        }
        assert_eq!(v.pop(), Some(2));
        for i in 0..12u32 {
            v.push(i);
        }
        assert_eq!(v.pop(), Some(11));
        assert_eq!(v.len(), 13);
    }

    #[test]
    fn remove_item_swaps_tail() {
        let mut v = SmallVec::new();
        for i in 0..5u32 {
            v.push(i);
        }
        assert!(v.remove_item(&1));
        assert!(!v.remove_item(&1));
        assert_eq!(v.as_slice(), &[0, 4, 2, 3]);
    }

    #[test]
    fn clear_keeps_working_after_spill() {
        let mut v = SmallVec::new();
        for i in 0..30u32 {
            v.push(i);
        }
        v.clear();
        assert!(v.is_empty());
        v.push(7);
        assert_eq!(v.get(0), Some(&7));
    }
}
