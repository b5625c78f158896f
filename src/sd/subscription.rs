//! Subscriber slot table for a single event handler.
//!
//! Each event handler owns a fixed-capacity table of slots, one per
//! concurrently subscribed consumer. A slot is identified by the remote's
//! unicast endpoint (the address a Subscribe's IPv4 endpoint option named).
//! Looking a Subscribe up in the table is a two-pass operation: first look
//! for a slot already bound to this endpoint (a re-subscribe, or a refresh
//! before the TTL expires), and only if none matches, claim the first free
//! slot.

use std::net::SocketAddr;

use crate::header::SessionId;
use crate::error::{Result, SomeIpError};

use super::flags::Flags;

/// One subscriber's state within an event handler's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberSlot {
    /// The subscriber's unicast endpoint, as carried in the Subscribe's
    /// IPv4 endpoint option. `None` means the slot is free.
    pub remote_addr: Option<SocketAddr>,
    /// Port the subscriber wants events delivered to (may differ from
    /// `remote_addr`'s port if a second option run named a response port).
    pub response_port: u16,
    /// Counter of the Subscribe this slot last accepted (carried in the
    /// low nibble of a `SessionId` so the table doesn't need a separate
    /// field), echoed back in the matching SubscribeEventgroupAck/Nack.
    pub session_id: SessionId,
    /// Remaining TTL in ticks. `SD_DEFAULT_TTL` in ticks means "never
    /// expires"; `0` means the slot is free / unsubscribed.
    pub ttl_ticks: u32,
    /// Flags for this slot (`SUBSCRIBED`, `PENDING_EVENT_GROUP_ACK`).
    pub flags: Flags,
}

impl SubscriberSlot {
    const fn empty() -> Self {
        Self {
            remote_addr: None,
            response_port: 0,
            session_id: SessionId(0),
            ttl_ticks: 0,
            flags: Flags::new(),
        }
    }

    /// A free slot has no bound endpoint.
    pub fn is_free(&self) -> bool {
        self.remote_addr.is_none()
    }
}

/// Fixed-capacity subscriber table for one event handler.
#[derive(Debug, Clone)]
pub struct SubscriptionTable {
    slots: Vec<SubscriberSlot>,
}

impl SubscriptionTable {
    /// Create a table with `capacity` slots, all initially free.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![SubscriberSlot::empty(); capacity],
        }
    }

    /// Total slot capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// All currently occupied (subscribed or pending) slots.
    pub fn occupied(&self) -> impl Iterator<Item = &SubscriberSlot> {
        self.slots.iter().filter(|s| !s.is_free())
    }

    /// Look up the slot for `remote_addr`, first by matching endpoint, then
    /// by claiming a free slot. Returns the slot's index, or
    /// [`SomeIpError::NoFreeSlot`] if neither pass finds one.
    ///
    /// This mirrors the original's matching order exactly: a resubscribe
    /// from an endpoint already in the table must reuse that slot rather
    /// than exhaust the table with duplicates left by a client that never
    /// unsubscribes cleanly.
    pub fn lookup_or_allocate(&mut self, remote_addr: SocketAddr) -> Result<usize> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|s| s.remote_addr == Some(remote_addr))
        {
            return Ok(index);
        }

        self.slots
            .iter()
            .position(SubscriberSlot::is_free)
            .ok_or(SomeIpError::NoFreeSlot)
    }

    /// Bind a slot to a subscribe request, overwriting whatever was there.
    pub fn bind(
        &mut self,
        index: usize,
        remote_addr: SocketAddr,
        response_port: u16,
        session_id: SessionId,
        ttl_ticks: u32,
    ) {
        let slot = &mut self.slots[index];
        slot.remote_addr = Some(remote_addr);
        slot.response_port = response_port;
        slot.session_id = session_id;
        slot.ttl_ticks = ttl_ticks;
    }

    /// Free a slot (stop-subscribe, TTL expiry, or reboot invalidation).
    pub fn free(&mut self, index: usize) {
        self.slots[index] = SubscriberSlot::empty();
    }

    /// Free every slot bound to `remote_addr`, used when a reboot is
    /// detected for that endpoint.
    pub fn free_by_addr(&mut self, remote_addr: SocketAddr) {
        for slot in &mut self.slots {
            if slot.remote_addr == Some(remote_addr) {
                *slot = SubscriberSlot::empty();
            }
        }
    }

    /// Advance every occupied slot's TTL by one tick, freeing any that
    /// expire. Slots with `ttl_ticks == u32::MAX` (the "never expires"
    /// sentinel in ticks) are left untouched.
    pub fn tick(&mut self) {
        for slot in &mut self.slots {
            if slot.is_free() || slot.ttl_ticks == u32::MAX {
                continue;
            }
            slot.ttl_ticks -= 1;
            if slot.ttl_ticks == 0 {
                *slot = SubscriberSlot::empty();
            }
        }
    }

    /// Mutable access to a slot by index, for the dispatcher and packer.
    pub fn slot_mut(&mut self, index: usize) -> &mut SubscriberSlot {
        &mut self.slots[index]
    }

    /// Immutable access to a slot by index.
    pub fn slot(&self, index: usize) -> &SubscriberSlot {
        &self.slots[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("192.168.1.10:{port}").parse().unwrap()
    }

    #[test]
    fn test_lookup_allocates_first_free_slot() {
        let mut table = SubscriptionTable::new(2);
        let index = table.lookup_or_allocate(addr(1)).unwrap();
        assert_eq!(index, 0);
        table.bind(index, addr(1), 1, SessionId(1), 100);

        let index2 = table.lookup_or_allocate(addr(2)).unwrap();
        assert_eq!(index2, 1);
    }

    #[test]
    fn test_lookup_reuses_existing_endpoint_slot() {
        let mut table = SubscriptionTable::new(2);
        let index = table.lookup_or_allocate(addr(1)).unwrap();
        table.bind(index, addr(1), 1, SessionId(1), 100);

        let reused = table.lookup_or_allocate(addr(1)).unwrap();
        assert_eq!(reused, index);
    }

    #[test]
    fn test_table_full_returns_no_free_slot() {
        let mut table = SubscriptionTable::new(1);
        let index = table.lookup_or_allocate(addr(1)).unwrap();
        table.bind(index, addr(1), 1, SessionId(1), 100);

        let result = table.lookup_or_allocate(addr(2));
        assert!(matches!(result, Err(SomeIpError::NoFreeSlot)));
    }

    #[test]
    fn test_tick_expires_slot_at_zero() {
        let mut table = SubscriptionTable::new(1);
        let index = table.lookup_or_allocate(addr(1)).unwrap();
        table.bind(index, addr(1), 1, SessionId(1), 1);

        table.tick();
        assert!(table.slot(0).is_free());
    }

    #[test]
    fn test_tick_leaves_never_expiring_slot_alone() {
        let mut table = SubscriptionTable::new(1);
        let index = table.lookup_or_allocate(addr(1)).unwrap();
        table.bind(index, addr(1), 1, SessionId(1), u32::MAX);

        table.tick();
        assert!(!table.slot(0).is_free());
    }

    #[test]
    fn test_free_by_addr_clears_matching_slot() {
        let mut table = SubscriptionTable::new(2);
        let index = table.lookup_or_allocate(addr(1)).unwrap();
        table.bind(index, addr(1), 1, SessionId(1), 100);

        table.free_by_addr(addr(1));
        assert!(table.slot(index).is_free());
    }
}
