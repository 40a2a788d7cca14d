//! Bounded queue of unsolicited messages waiting for a push clearance.
//!
//! Slots age: a pending entry older than [`PUSH_QUEUE_TIMEOUT_MS`] is
//! invisible to the sender and its slot counts as free again. Delivery
//! order is FIFO by enqueue time among the live entries, with the lowest
//! slot index winning ties.

use crate::config::{MAX_PUSH_ENTRIES, PUSH_QUEUE_TIMEOUT_MS};
use crate::frame::Payload;

#[derive(Debug, Clone, Default)]
pub struct PushEntry {
    pub pending: bool,
    pub commit_receive: bool,
    pub enqueued_at: u32,
    pub service: u8,
    pub subservice: u8,
    pub payload: Payload,
}

impl PushEntry {
    fn expired(&self, now: u32) -> bool {
        now.wrapping_sub(self.enqueued_at) > PUSH_QUEUE_TIMEOUT_MS
    }

    fn live(&self, now: u32) -> bool {
        self.pending && !self.expired(now)
    }
}

#[derive(Debug)]
pub struct PushQueue {
    slots: [PushEntry; MAX_PUSH_ENTRIES],
}

impl PushQueue {
    pub fn new() -> Self {
        PushQueue {
            slots: core::array::from_fn(|_| PushEntry::default()),
        }
    }

    /// First slot that is not pending, or whose pending entry has aged out.
    pub fn next_free(&self, now: u32) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.live(now))
    }

    /// Oldest live entry, ties broken by slot index.
    pub fn next_to_send(&self, now: u32) -> Option<usize> {
        let mut best: Option<(usize, u32)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.live(now) {
                continue;
            }
            let age = now.wrapping_sub(slot.enqueued_at);
            match best {
                Some((_, best_age)) if age <= best_age => {}
                _ => best = Some((index, age)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// True when `slot` no longer holds a live entry.
    pub fn reusable(&self, slot: usize, now: u32) -> bool {
        !self.slots[slot].live(now)
    }

    pub fn store(
        &mut self,
        slot: usize,
        service: u8,
        subservice: u8,
        payload: &[u8],
        commit_receive: bool,
        now: u32,
    ) {
        let entry = &mut self.slots[slot];
        entry.pending = true;
        entry.commit_receive = commit_receive;
        entry.enqueued_at = now;
        entry.service = service;
        entry.subservice = subservice;
        entry.payload.clear();
        entry
            .payload
            .try_extend_from_slice(payload)
            .expect("BUG: push payload exceeds slot capacity");
    }

    pub fn entry(&self, slot: usize) -> &PushEntry {
        &self.slots[slot]
    }

    pub fn set_pending(&mut self, slot: usize, pending: bool) {
        self.slots[slot].pending = pending;
    }
}

impl Default for PushQueue {
    fn default() -> Self {
        Self::new()
    }
}
