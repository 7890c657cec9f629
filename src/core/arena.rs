//! Tick Arena
//!
//! Bump allocator for cycle-scoped temporaries. Allocation is a pointer
//! bump; `reset` rewinds to the first block and reuses every block already
//! owned, so steady-state cycles allocate nothing from the system.
//! Everything handed out is invalidated by `reset`, which ownership
//! enforces: the typed accessor borrows the arena mutably.

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// All arena allocations are aligned to this.
const ARENA_ALIGN: usize = 8;

struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

impl Block {
    fn new(size: usize) -> Block {
        // Allocation failure here is fatal: the arena backs the hot path
        // where partial failure cannot be recovered from.
        let layout = Layout::from_size_align(size, ARENA_ALIGN).expect("arena block layout");
        let raw = unsafe { alloc(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        Block { ptr, size }
    }
}

pub struct Arena {
    blocks: Vec<Block>,
    current: usize,
    pos: usize,
    block_size: usize,
}

impl Arena {
    pub fn new(block_size: usize) -> Arena {
        Arena {
            blocks: Vec::new(),
            current: 0,
            pos: 0,
            block_size: block_size.max(ARENA_ALIGN),
        }
    }

    /// Bump-allocate `size` bytes, 8-byte aligned.
    ///
    /// Zero-size requests return the current cursor: a valid pointer into
    /// an owned block, never null. The pointer is valid until the next
    /// `reset`.
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        let size = (size + (ARENA_ALIGN - 1)) & !(ARENA_ALIGN - 1);

        if self.blocks.is_empty() {
            self.add_block(size);
        }

        while self.pos + size > self.blocks[self.current].size {
            if self.current + 1 < self.blocks.len() {
                self.current += 1;
                self.pos = 0;
            } else {
                self.add_block(size);
            }
        }

        let block = &self.blocks[self.current];
        // In bounds: the loop above guarantees pos + size <= block.size.
        let ptr = unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(self.pos)) };
        self.pos += size;
        ptr
    }

    /// Allocate a zero-initialized slice of `len` values of `T`.
    ///
    /// The returned slice borrows the arena, so it cannot outlive the next
    /// allocation or `reset`.
    pub fn alloc_slice<T: Copy + Default>(&mut self, len: usize) -> &mut [T] {
        debug_assert!(std::mem::align_of::<T>() <= ARENA_ALIGN);
        let bytes = len * std::mem::size_of::<T>();
        let ptr = self.alloc(bytes).cast::<T>();
        unsafe {
            for i in 0..len {
                ptr.as_ptr().add(i).write(T::default());
            }
            std::slice::from_raw_parts_mut(ptr.as_ptr(), len)
        }
    }

    /// Rewind to the first block. Already-owned blocks are reused in order
    /// by subsequent allocations; nothing is returned to the system.
    pub fn reset(&mut self) {
        self.current = 0;
        self.pos = 0;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn add_block(&mut self, min_size: usize) {
        let size = self.block_size.max(min_size);
        self.blocks.push(Block::new(size));
        self.current = self.blocks.len() - 1;
        self.pos = 0;
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        for block in &self.blocks {
            let layout =
                Layout::from_size_align(block.size, ARENA_ALIGN).expect("arena block layout");
            unsafe { dealloc(block.ptr.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_reuses_blocks_in_order() {
        let mut arena = Arena::new(128);
        let sizes = [16usize, 40, 8, 64, 100, 24];

        let first: Vec<_> = sizes.iter().map(|&s| arena.alloc(s)).collect();
        let blocks = arena.block_count();

        arena.reset();
        let second: Vec<_> = sizes.iter().map(|&s| arena.alloc(s)).collect();

        assert_eq!(first, second);
        assert_eq!(arena.block_count(), blocks);
    }

    #[test]
    fn grows_without_invalidating_prior_allocations() {
        let mut arena = Arena::new(64);
        let a = arena.alloc(48);
        unsafe { a.as_ptr().write(0xAB) };

        // Forces a second block.
        let _b = arena.alloc(48);
        assert!(arena.block_count() >= 2);
        assert_eq!(unsafe { a.as_ptr().read() }, 0xAB);
    }

    #[test]
    fn oversized_request_gets_own_block() {
        let mut arena = Arena::new(64);
        let p = arena.alloc(1000);
        unsafe { p.as_ptr().add(999).write(1) };
    }

    #[test]
    fn zero_size_returns_valid_pointer() {
        let mut arena = Arena::new(64);
        let p = arena.alloc(0);
        let q = arena.alloc(8);
        // No advance for the zero-size request.
        assert_eq!(p, q);
    }

    #[test]
    fn alloc_slice_is_zeroed() {
        let mut arena = Arena::new(64);
        let s: &mut [u32] = arena.alloc_slice(9);
        assert!(s.iter().all(|&v| v == 0));
        s[8] = 42;
    }
}
