//! Allocation and lookup primitives shared by the rest of the server.
//! None of these touch the X connection; they are plain data structures
//! tuned for the per-cycle churn the event loop produces.

pub mod arena;
pub mod handle;
pub mod hash;
pub mod slotmap;
pub mod small_vec;

pub use arena::Arena;
pub use handle::Handle;
pub use hash::OpenHash;
pub use slotmap::SlotMap;
pub use small_vec::SmallVec;
