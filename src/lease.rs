//! Lease records and the per-pool lease table.
//!
//! The table is a fixed arena with one optional slot per pool offset, so
//! "at most one lease per address" holds by construction. A slot counts as
//! free when it is empty or its lease has expired; expired leases are left
//! in place until something overwrites or purges them.

use std::net::Ipv4Addr;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use crate::packet::HardwareAddr;

/// A binding between a client hardware address and a pool address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub client_id: HardwareAddr,

    /// When the lease was created or last renewed.
    pub requested_at: DateTime<Utc>,

    pub requested_address: Ipv4Addr,

    /// After this instant the address may be handed to anyone.
    pub expires_at: DateTime<Utc>,

    /// Client-provided hostname (Option 12), sanitized.
    pub host_name: Option<String>,
}

impl Lease {
    pub fn new(
        client_id: HardwareAddr,
        requested_address: Ipv4Addr,
        now: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Self {
        Self {
            client_id,
            requested_at: now,
            requested_address,
            expires_at: now + duration,
            host_name: None,
        }
    }

    pub fn with_host_name(mut self, host_name: Option<String>) -> Self {
        self.host_name = host_name;
        self
    }

    /// Strictly after `expires_at`; a lease is still live at its expiry instant.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Leases of one address pool, indexed by offset from the pool start.
#[derive(Debug, Clone)]
pub struct LeaseTable {
    slots: Vec<Option<Lease>>,
}

impl LeaseTable {
    /// Creates an empty table with `size` slots.
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, offset: usize) -> Option<&Lease> {
        self.slots.get(offset).and_then(Option::as_ref)
    }

    /// Offset of the client's unexpired lease, if any.
    pub fn live_offset_of(&self, client: &HardwareAddr, now: DateTime<Utc>) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|lease| lease.client_id == *client && !lease.is_expired(now))
        })
    }

    /// True when the slot is empty or holds an expired lease.
    ///
    /// Offsets outside the table are never free.
    pub fn is_free(&self, offset: usize, now: DateTime<Utc>) -> bool {
        match self.slots.get(offset) {
            Some(None) => true,
            Some(Some(lease)) => lease.is_expired(now),
            None => false,
        }
    }

    /// Finds a free offset starting from a uniformly random position.
    ///
    /// Scans `start..len` and then wraps to `0..start`, returning the first
    /// free slot. `None` only when every slot holds a live lease.
    pub fn free_offset<R: Rng>(&self, rng: &mut R, now: DateTime<Utc>) -> Option<usize> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }

        let start = rng.gen_range(0..len);
        (start..len)
            .chain(0..start)
            .find(|&offset| self.is_free(offset, now))
    }

    /// Stores `lease` at `offset`, dropping any other slot the same client
    /// holds so a client never owns two addresses.
    ///
    /// Returns the lease previously stored at `offset`. Out-of-range offsets
    /// are ignored.
    pub fn commit(&mut self, offset: usize, lease: Lease) -> Option<Lease> {
        if offset >= self.slots.len() {
            return None;
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if index != offset
                && slot
                    .as_ref()
                    .is_some_and(|held| held.client_id == lease.client_id)
            {
                *slot = None;
            }
        }

        self.slots[offset].replace(lease)
    }

    /// Removes every lease held by `client`, live or expired.
    pub fn release(&mut self, client: &HardwareAddr) -> usize {
        let mut removed = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|lease| lease.client_id == *client) {
                *slot = None;
                removed += 1;
            }
        }
        removed
    }

    /// Clears expired slots and returns how many were dropped.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|lease| lease.is_expired(now)) {
                *slot = None;
                purged += 1;
            }
        }
        purged
    }

    pub fn live_count(&self, now: DateTime<Utc>) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|lease| !lease.is_expired(now))
            .count()
    }

    /// Occupied slots, including expired ones, as `(offset, lease)`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Lease)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(offset, slot)| slot.as_ref().map(|lease| (offset, lease)))
    }
}
