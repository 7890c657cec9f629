//! Cookie Jar
//!
//! Correlates asynchronous query replies with the entity that asked.
//! Every async request registers a slot keyed by its sequence number;
//! when the reply (or error) arrives, the slot is consumed exactly once
//! and dispatched against a closed set of reply kinds. Slots whose owner
//! handle has gone stale are dropped without dispatch, which is also how
//! in-flight work is cancelled.
//!
//! Storage is a power-of-two open-addressed table with linear probing and
//! backward-shift deletion, plus a wrap-around cursor so timeout sweeps
//! can be bounded per cycle.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::warn;

use crate::core::hash::hash_key;
use crate::core::Handle;

/// What to do with a reply, matched exhaustively at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Attributes of a window being managed.
    WindowAttributes,
    /// Geometry of a window being managed.
    Geometry,
    /// Value of one property, refetched after a change notification.
    Property { atom: u32 },
    /// Pointer position during an interactive move or resize.
    Pointer,
    /// Children of the root, queried once at startup.
    AdoptionScan,
    /// Attributes of a pre-existing window considered for adoption.
    AdoptionProbe { window: u32 },
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CookieFlags: u32 {
        /// Part of the initial manage query pair; decrements
        /// `pending_replies` when consumed.
        const INITIAL = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CookieSlot {
    pub sequence: u64,
    pub kind: ReplyKind,
    /// Entity the reply concerns; `Handle::INVALID` for unowned cookies
    /// (adoption scan and probes), which always dispatch.
    pub owner: Handle,
    pub flags: CookieFlags,
    pub txn_id: u64,
    pub issued_at: Instant,
}

pub struct CookieJar {
    slots: Vec<Option<CookieSlot>>,
    len: usize,
    /// Where the next expiry sweep resumes.
    cursor: usize,
}

const INITIAL_CAP: usize = 64;

impl CookieJar {
    pub fn new() -> Self {
        CookieJar {
            slots: Vec::new(),
            len: 0,
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a pending reply. Rejects sequence 0 (a failed submit) and
    /// duplicate sequences.
    pub fn push(
        &mut self,
        sequence: u64,
        kind: ReplyKind,
        owner: Handle,
        flags: CookieFlags,
        txn_id: u64,
        now: Instant,
    ) -> bool {
        if sequence == 0 {
            warn!("Refusing cookie for failed request (kind {:?})", kind);
            return false;
        }
        if (self.len + 1) * 10 > self.slots.len() * 7 {
            let new_cap = if self.slots.is_empty() {
                INITIAL_CAP
            } else {
                self.slots.len() * 2
            };
            self.resize(new_cap);
        }

        let mask = self.slots.len() - 1;
        let mut idx = hash_key(sequence) as usize & mask;
        loop {
            match &self.slots[idx] {
                Some(s) if s.sequence == sequence => {
                    warn!("Duplicate cookie for sequence {}, dropping", sequence);
                    return false;
                }
                Some(_) => idx = (idx + 1) & mask,
                None => {
                    self.slots[idx] = Some(CookieSlot {
                        sequence,
                        kind,
                        owner,
                        flags,
                        txn_id,
                        issued_at: now,
                    });
                    self.len += 1;
                    return true;
                }
            }
        }
    }

    /// Consume the slot for a completed sequence, if one is registered.
    pub fn take(&mut self, sequence: u64) -> Option<CookieSlot> {
        let idx = self.probe(sequence)?;
        self.remove_at(idx)
    }

    /// Sweep up to `budget` table positions from the cursor, consuming
    /// slots older than `timeout`. Returned slots are dispatched by the
    /// caller with a timed-out result.
    pub fn expire(&mut self, now: Instant, timeout: Duration, budget: usize) -> Vec<CookieSlot> {
        let mut expired = Vec::new();
        if self.slots.is_empty() || self.len == 0 {
            return expired;
        }
        let mask = self.slots.len() - 1;
        self.cursor &= mask;
        for _ in 0..budget.min(self.slots.len()) {
            let deadline_hit = match &self.slots[self.cursor] {
                Some(s) => now.duration_since(s.issued_at) >= timeout,
                None => false,
            };
            if deadline_hit {
                // Backshift may pull a later entry into this position, so
                // re-examine it before advancing.
                if let Some(slot) = self.remove_at(self.cursor) {
                    expired.push(slot);
                }
            } else {
                self.cursor = (self.cursor + 1) & mask;
            }
        }
        expired
    }

    fn probe(&self, sequence: u64) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut idx = hash_key(sequence) as usize & mask;
        while let Some(s) = &self.slots[idx] {
            if s.sequence == sequence {
                return Some(idx);
            }
            idx = (idx + 1) & mask;
        }
        None
    }

    fn remove_at(&mut self, idx: usize) -> Option<CookieSlot> {
        let removed = self.slots[idx].take()?;
        self.len -= 1;

        let mask = self.slots.len() - 1;
        let mut hole = idx;
        let mut j = (hole + 1) & mask;
        while let Some(s) = &self.slots[j] {
            let home = hash_key(s.sequence) as usize & mask;
            let should_move = if home <= j {
                home <= hole && hole < j
            } else {
                hole < j || home <= hole
            };
            if should_move {
                self.slots[hole] = self.slots[j].take();
                hole = j;
            }
            j = (j + 1) & mask;
        }

        Some(removed)
    }

    fn resize(&mut self, new_cap: usize) {
        debug_assert!(new_cap.is_power_of_two());
        let old = std::mem::replace(&mut self.slots, Vec::new());
        self.slots.resize_with(new_cap, || None);
        let mask = new_cap - 1;
        for slot in old {
            let Some(s) = slot else { continue };
            let mut idx = hash_key(s.sequence) as usize & mask;
            while self.slots[idx].is_some() {
                idx = (idx + 1) & mask;
            }
            self.slots[idx] = Some(s);
        }
        self.cursor = 0;
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(jar: &mut CookieJar, seq: u64, now: Instant) -> bool {
        jar.push(seq, ReplyKind::Geometry, Handle::new(1, 1), CookieFlags::empty(), 0, now)
    }

    #[test]
    fn take_consumes_exactly_once() {
        let now = Instant::now();
        let mut jar = CookieJar::new();
        assert!(push(&mut jar, 7, now));

        let slot = jar.take(7);
        assert!(slot.is_some());
        assert_eq!(slot.map(|s| s.sequence), Some(7));
        assert!(jar.take(7).is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn unknown_sequence_is_none() {
        let now = Instant::now();
        let mut jar = CookieJar::new();
        push(&mut jar, 3, now);
        assert!(jar.take(4).is_none());
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn duplicate_and_zero_sequences_rejected() {
        let now = Instant::now();
        let mut jar = CookieJar::new();
        assert!(push(&mut jar, 5, now));
        assert!(!push(&mut jar, 5, now));
        assert!(!push(&mut jar, 0, now));
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn expire_sweeps_only_old_slots() {
        let start = Instant::now();
        let timeout = Duration::from_secs(5);
        let mut jar = CookieJar::new();
        for seq in 1..=20u64 {
            push(&mut jar, seq, start);
        }
        let late = start + Duration::from_secs(3);
        for seq in 21..=30u64 {
            push(&mut jar, seq, late);
        }

        // At start+6s the first twenty are past the timeout, the rest not.
        let now = start + Duration::from_secs(6);
        let mut expired: Vec<u64> = Vec::new();
        for _ in 0..8 {
            expired.extend(jar.expire(now, timeout, 64).iter().map(|s| s.sequence));
        }
        expired.sort_unstable();
        assert_eq!(expired, (1..=20u64).collect::<Vec<_>>());
        assert_eq!(jar.len(), 10);
    }

    #[test]
    fn survives_growth_and_churn() {
        let now = Instant::now();
        let mut jar = CookieJar::new();
        for seq in 1..=500u64 {
            assert!(push(&mut jar, seq, now));
        }
        for seq in (2..=500u64).step_by(2) {
            assert!(jar.take(seq).is_some());
        }
        for seq in (1..=500u64).step_by(2) {
            assert_eq!(jar.take(seq).map(|s| s.sequence), Some(seq));
        }
        assert!(jar.is_empty());
    }
}
