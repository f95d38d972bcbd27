//! LE_ARP cache entry.

use crate::endpoint::Endpoint;
use crate::timer::EntryTimer;
use crate::types::{AtmAddress, CircuitId, EntryFlags, EntryStatus, Frame, MacAddress};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Frames held per entry while no circuit is usable.
pub const PENDING_QUEUE_CAPACITY: usize = 8;

/// Identity of an entry for the lifetime of the client.
///
/// Ids are handed out in increasing order, so they double as the insertion
/// sequence of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntryId(pub(crate) u64);

/// One MAC → ATM binding with its protocol state.
pub struct Entry {
    pub(crate) id: EntryId,
    pub(crate) mac: MacAddress,
    pub(crate) atm: AtmAddress,
    pub(crate) status: EntryStatus,
    pub(crate) flags: EntryFlags,
    pub(crate) direct: Option<Endpoint>,
    pub(crate) receive: Option<Endpoint>,
    pending: VecDeque<Frame>,
    pub(crate) retry_count: u32,
    pub(crate) flood_count: u32,
    pub(crate) flush_tran_id: u32,
    pub(crate) last_used: Instant,
    /// Last LE_ARP / flood-window reset, or the moment flushing started
    pub(crate) timestamp: Instant,
    pub(crate) is_rdesc: bool,
    pub(crate) tlvs: Vec<u8>,
    pub(crate) timer: Option<EntryTimer>,
}

impl Entry {
    pub(crate) fn new(id: EntryId, mac: MacAddress) -> Self {
        let now = Instant::now();
        Self {
            id,
            mac,
            atm: AtmAddress::ZERO,
            status: EntryStatus::Unknown,
            flags: EntryFlags::default(),
            direct: None,
            receive: None,
            pending: VecDeque::with_capacity(PENDING_QUEUE_CAPACITY),
            retry_count: 0,
            flood_count: 0,
            flush_tran_id: 0,
            last_used: now,
            timestamp: now,
            is_rdesc: false,
            tlvs: Vec::new(),
            timer: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn atm(&self) -> AtmAddress {
        self.atm
    }

    pub fn status(&self) -> EntryStatus {
        self.status
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn direct(&self) -> Option<&Endpoint> {
        self.direct.as_ref()
    }

    pub fn receive(&self) -> Option<&Endpoint> {
        self.receive.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Move to `next`. Backward moves are refused and logged.
    pub(crate) fn advance(&mut self, next: EntryStatus) -> bool {
        if self.status == next && next != EntryStatus::ArpPending {
            return true;
        }
        if !self.status.can_advance_to(next) {
            warn!(
                mac = %self.mac,
                from = %self.status,
                to = %next,
                "Refusing backward LE_ARP state change"
            );
            return false;
        }
        debug!(mac = %self.mac, from = %self.status, to = %next, "LE_ARP state change");
        self.status = next;
        true
    }

    /// Queue a frame for later transmission; a full queue drops it.
    pub(crate) fn enqueue(&mut self, frame: Frame) -> bool {
        if self.pending.len() >= PENDING_QUEUE_CAPACITY {
            return false;
        }
        self.pending.push_back(frame);
        true
    }

    /// Take every queued frame, oldest first.
    pub(crate) fn take_pending(&mut self) -> VecDeque<Frame> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn clear_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Send queued frames on the data direct circuit in FIFO order.
    ///
    /// Returns the number of frames handed to the circuit.
    pub(crate) fn drain_onto_direct(&mut self) -> usize {
        let Some(endpoint) = self.direct.clone() else {
            return 0;
        };
        let mut sent = 0;
        for frame in self.take_pending() {
            match endpoint.send(frame) {
                Ok(()) => sent += 1,
                Err(e) => warn!(mac = %self.mac, error = %e, "Dropping queued frame"),
            }
        }
        sent
    }

    /// Does this entry use `circuit` for transmit or receive?
    pub(crate) fn uses_circuit(&self, circuit: CircuitId) -> bool {
        self.direct.as_ref().is_some_and(|e| e.id() == circuit)
            || self.receive.as_ref().is_some_and(|e| e.id() == circuit)
    }

    pub(crate) fn cancel_timer(&mut self) {
        self.timer = None;
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            mac: self.mac,
            atm: self.atm,
            status: self.status,
            flags: self.flags,
            direct: self.direct.as_ref().map(Endpoint::id),
            receive: self.receive.as_ref().map(Endpoint::id),
            queued: self.pending.len(),
            retry_count: self.retry_count,
            flood_count: self.flood_count,
            flush_tran_id: self.flush_tran_id,
            capabilities: self.tlvs.len(),
        }
    }
}

/// Read-only copy of an entry's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub mac: MacAddress,
    pub atm: AtmAddress,
    pub status: EntryStatus,
    pub flags: EntryFlags,
    pub direct: Option<CircuitId>,
    pub receive: Option<CircuitId>,
    pub queued: usize,
    pub retry_count: u32,
    pub flood_count: u32,
    pub flush_tran_id: u32,
    /// Size of the stored capability blob
    pub capabilities: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::ChannelCircuit;

    fn frame(tag: u8) -> Frame {
        Frame::build(1, MacAddress([2, 0, 0, 0, 0, 2]), MacAddress::ZERO, 0x0800, &[tag])
    }

    #[tokio::test]
    async fn test_queue_is_bounded() {
        let mut entry = Entry::new(EntryId(1), MacAddress([2, 0, 0, 0, 0, 2]));
        for i in 0..PENDING_QUEUE_CAPACITY {
            assert!(entry.enqueue(frame(i as u8)));
        }
        assert!(!entry.enqueue(frame(99)));
        assert_eq!(entry.pending_len(), PENDING_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_drain_preserves_order() {
        let (circuit, mut rx) = ChannelCircuit::new(CircuitId::new(0, 40), 16);
        let mut entry = Entry::new(EntryId(1), MacAddress([2, 0, 0, 0, 0, 2]));
        for i in 0..3 {
            entry.enqueue(frame(i));
        }
        entry.direct = Some(Endpoint::new(circuit));

        assert_eq!(entry.drain_onto_direct(), 3);
        assert_eq!(entry.pending_len(), 0);
        assert_eq!(rx.drain(), vec![frame(0), frame(1), frame(2)]);
    }

    #[tokio::test]
    async fn test_advance_refuses_backward_moves() {
        let mut entry = Entry::new(EntryId(1), MacAddress([2, 0, 0, 0, 0, 2]));
        assert!(entry.advance(EntryStatus::ArpPending));
        assert!(entry.advance(EntryStatus::ArpPending));
        assert!(entry.advance(EntryStatus::VcPending));
        assert!(!entry.advance(EntryStatus::ArpPending));
        assert_eq!(entry.status(), EntryStatus::VcPending);
        assert!(entry.advance(EntryStatus::ForwardDirect));
        assert!(entry.advance(EntryStatus::ForwardDirect));
    }
}
