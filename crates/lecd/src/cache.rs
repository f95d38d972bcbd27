//! LE_ARP cache.
//!
//! Resolved and resolving entries are keyed by MAC address. Three side lists
//! hold circuits that have no usable MAC yet:
//!
//! - `pending_unknown`: data direct circuits opened by a peer before we
//!   learned which MAC sits behind them
//! - `excluded`: circuits the cache must not transmit on (receive-only
//!   circuits and the losing side of a simultaneous setup)
//! - `multicast_forwarders`: receive sides of BUS multicast forward circuits
//!
//! The cache owns the release rule for shared endpoints: an endpoint is torn
//! down when the last entry referencing it leaves the cache.

use crate::endpoint::Endpoint;
use crate::entry::{Entry, EntryId, EntrySnapshot};
use crate::error::{LecError, Result};
use crate::types::{AtmAddress, CircuitId, EntryStatus, MacAddress};
use std::collections::HashMap;
use tracing::debug;

/// Side list holding entries without a learned MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachedList {
    PendingUnknown,
    Excluded,
    MulticastForwarders,
}

#[derive(Default)]
pub struct AddressCache {
    by_mac: HashMap<MacAddress, Entry>,
    pending_unknown: Vec<Entry>,
    excluded: Vec<Entry>,
    multicast_forwarders: Vec<Entry>,
    pub(crate) default_multicast: Option<Endpoint>,
    next_id: u64,
}

impl AddressCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh entry with the next id. It is not in the cache yet.
    pub(crate) fn allocate(&mut self, mac: MacAddress) -> Entry {
        self.next_id += 1;
        Entry::new(EntryId(self.next_id), mac)
    }

    pub fn find(&self, mac: &MacAddress) -> Option<&Entry> {
        self.by_mac.get(mac)
    }

    pub(crate) fn find_mut(&mut self, mac: &MacAddress) -> Option<&mut Entry> {
        self.by_mac.get_mut(mac)
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.by_mac.contains_key(mac)
    }

    pub fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }

    /// Insert `entry`; an entry already cached under the same MAC is
    /// retired first.
    pub(crate) fn insert(&mut self, entry: Entry) {
        if let Some(old) = self.by_mac.insert(entry.mac, entry) {
            self.retire(old);
        }
    }

    /// Remove the entry for `mac`, cancel its timer, drop its queued frames
    /// and release circuits no other entry uses.
    pub fn remove(&mut self, mac: &MacAddress) -> Result<()> {
        let entry = self
            .by_mac
            .remove(mac)
            .ok_or(LecError::EntryNotFound(*mac))?;
        self.retire(entry);
        Ok(())
    }

    /// MAC addresses in insertion order.
    pub fn ordered_macs(&self) -> Vec<MacAddress> {
        let mut keyed: Vec<(EntryId, MacAddress)> =
            self.by_mac.values().map(|e| (e.id, e.mac)).collect();
        keyed.sort_unstable();
        keyed.into_iter().map(|(_, mac)| mac).collect()
    }

    /// Entries in insertion order.
    pub fn iter_ordered(&self) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = self.by_mac.values().collect();
        entries.sort_unstable_by_key(|e| e.id);
        entries
    }

    /// MACs of the entries bound to `atm`, in insertion order.
    pub fn macs_for_atm(&self, atm: &AtmAddress) -> Vec<MacAddress> {
        if atm.is_zero() {
            return Vec::new();
        }
        self.iter_ordered()
            .into_iter()
            .filter(|e| e.atm == *atm)
            .map(|e| e.mac)
            .collect()
    }

    /// MACs of the entries transmitting on `circuit`, in insertion order.
    pub(crate) fn macs_using(&self, circuit: CircuitId) -> Vec<MacAddress> {
        self.iter_ordered()
            .into_iter()
            .filter(|e| e.direct.as_ref().is_some_and(|d| d.id() == circuit))
            .map(|e| e.mac)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.iter_ordered()
            .into_iter()
            .map(Entry::snapshot)
            .collect()
    }

    fn list(&self, list: DetachedList) -> &Vec<Entry> {
        match list {
            DetachedList::PendingUnknown => &self.pending_unknown,
            DetachedList::Excluded => &self.excluded,
            DetachedList::MulticastForwarders => &self.multicast_forwarders,
        }
    }

    fn list_mut(&mut self, list: DetachedList) -> &mut Vec<Entry> {
        match list {
            DetachedList::PendingUnknown => &mut self.pending_unknown,
            DetachedList::Excluded => &mut self.excluded,
            DetachedList::MulticastForwarders => &mut self.multicast_forwarders,
        }
    }

    pub fn detached(&self, list: DetachedList) -> &[Entry] {
        self.list(list)
    }

    pub(crate) fn push_detached(&mut self, list: DetachedList, entry: Entry) {
        debug!(?list, atm = %entry.atm, "Parking circuit without MAC");
        self.list_mut(list).push(entry);
    }

    /// Take the first entry of `list` matching `pred` out of the cache
    /// without releasing anything.
    pub(crate) fn take_detached(
        &mut self,
        list: DetachedList,
        pred: impl Fn(&Entry) -> bool,
    ) -> Option<Entry> {
        let entries = self.list_mut(list);
        let pos = entries.iter().position(pred)?;
        Some(entries.remove(pos))
    }

    /// Find a detached entry by id, in any list.
    pub(crate) fn find_detached_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        self.pending_unknown
            .iter_mut()
            .chain(self.excluded.iter_mut())
            .chain(self.multicast_forwarders.iter_mut())
            .find(|e| e.id == id)
    }

    /// Remove a detached entry by id and release its circuits.
    pub(crate) fn remove_detached(&mut self, id: EntryId) -> Result<()> {
        for list in [
            DetachedList::PendingUnknown,
            DetachedList::Excluded,
            DetachedList::MulticastForwarders,
        ] {
            if let Some(entry) = self.take_detached(list, |e| e.id == id) {
                self.retire(entry);
                return Ok(());
            }
        }
        Err(LecError::EntryNotFound(MacAddress::ZERO))
    }

    /// Remove every detached entry using `circuit`; returns the endpoints
    /// they held.
    pub(crate) fn detach_circuit(&mut self, circuit: CircuitId) -> Vec<Endpoint> {
        let mut endpoints = Vec::new();
        for list in [
            DetachedList::PendingUnknown,
            DetachedList::Excluded,
            DetachedList::MulticastForwarders,
        ] {
            while let Some(mut entry) = self.take_detached(list, |e| e.uses_circuit(circuit)) {
                entry.cancel_timer();
                endpoints.extend(entry.direct.take());
                endpoints.extend(entry.receive.take());
            }
        }
        endpoints
    }

    /// Is the circuit one the BUS delivers on?
    pub(crate) fn is_bus_circuit(&self, circuit: CircuitId) -> bool {
        self.default_multicast
            .as_ref()
            .is_some_and(|e| e.id() == circuit)
            || self
                .multicast_forwarders
                .iter()
                .any(|e| e.uses_circuit(circuit))
    }

    /// Is the circuit parked on the excluded list?
    pub(crate) fn is_excluded_circuit(&self, circuit: CircuitId) -> bool {
        self.excluded.iter().any(|e| e.uses_circuit(circuit))
    }

    /// Does anything still in the cache hold `endpoint`?
    pub(crate) fn references(&self, endpoint: &Endpoint) -> bool {
        let holds = |e: &Entry| {
            e.direct.as_ref().is_some_and(|d| d.same_as(endpoint))
                || e.receive.as_ref().is_some_and(|r| r.same_as(endpoint))
        };
        self.default_multicast
            .as_ref()
            .is_some_and(|d| d.same_as(endpoint))
            || self.by_mac.values().any(holds)
            || self.pending_unknown.iter().any(holds)
            || self.excluded.iter().any(holds)
            || self.multicast_forwarders.iter().any(holds)
    }

    /// Release `endpoint` unless some entry still uses it.
    pub(crate) fn release_if_unused(&self, endpoint: Endpoint) {
        if !self.references(&endpoint) && endpoint.release() {
            debug!(circuit = %endpoint.id(), "Released circuit");
        }
    }

    /// Tear down an entry that has already left the cache.
    pub(crate) fn retire(&mut self, mut entry: Entry) {
        entry.cancel_timer();
        let dropped = entry.clear_pending();
        if dropped > 0 {
            debug!(mac = %entry.mac, dropped, "Purged queued frames");
        }
        if let Some(endpoint) = entry.direct.take() {
            self.release_if_unused(endpoint);
        }
        if let Some(endpoint) = entry.receive.take() {
            self.release_if_unused(endpoint);
        }
    }

    /// Cap the flood counters of unresolved entries at `max`.
    ///
    /// Returns the number of entries changed.
    pub(crate) fn clamp_flood_counts(&mut self, max: u32) -> usize {
        let mut clamped = 0;
        for entry in self.by_mac.values_mut() {
            if entry.status != EntryStatus::ForwardDirect && entry.flood_count > max {
                entry.flood_count = max;
                clamped += 1;
            }
        }
        clamped
    }

    /// Drop every entry and release every endpoint exactly once.
    pub fn clear(&mut self) {
        let mut endpoints: Vec<Endpoint> = Vec::new();
        let mut collect = |mut entry: Entry| {
            entry.cancel_timer();
            entry.clear_pending();
            endpoints.extend(entry.direct.take());
            endpoints.extend(entry.receive.take());
        };
        self.by_mac.drain().for_each(|(_, e)| collect(e));
        self.pending_unknown.drain(..).for_each(&mut collect);
        self.excluded.drain(..).for_each(&mut collect);
        self.multicast_forwarders.drain(..).for_each(&mut collect);
        endpoints.extend(self.default_multicast.take());

        for endpoint in endpoints {
            endpoint.release();
        }
    }
}

impl Drop for AddressCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ChannelCircuit, CircuitReceiver};

    fn mac(last: u8) -> MacAddress {
        MacAddress([2, 0, 0, 0, 0, last])
    }

    fn atm(last: u8) -> AtmAddress {
        let mut bytes = [0x47; 20];
        bytes[19] = last;
        AtmAddress(bytes)
    }

    fn endpoint(vci: u16) -> (Endpoint, CircuitReceiver) {
        let (circuit, rx) = ChannelCircuit::new(CircuitId::new(0, vci), 8);
        (Endpoint::new(circuit), rx)
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let mut cache = AddressCache::new();
        let err = cache.remove(&mac(1)).unwrap_err();
        assert!(matches!(err, LecError::EntryNotFound(m) if m == mac(1)));
    }

    #[tokio::test]
    async fn test_ordered_iteration_follows_insertion() {
        let mut cache = AddressCache::new();
        for last in [9, 3, 7] {
            let entry = cache.allocate(mac(last));
            cache.insert(entry);
        }
        assert_eq!(cache.ordered_macs(), vec![mac(9), mac(3), mac(7)]);
    }

    #[tokio::test]
    async fn test_shared_endpoint_released_with_last_entry() {
        let mut cache = AddressCache::new();
        let (ep, rx) = endpoint(50);
        for last in [1, 2] {
            let mut entry = cache.allocate(mac(last));
            entry.atm = atm(1);
            entry.status = EntryStatus::ForwardDirect;
            entry.direct = Some(ep.clone());
            cache.insert(entry);
        }

        cache.remove(&mac(1)).unwrap();
        assert!(!rx.is_closed());
        assert_eq!(cache.macs_for_atm(&atm(1)), vec![mac(2)]);

        cache.remove(&mac(2)).unwrap();
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn test_clamp_flood_counts_skips_resolved_entries() {
        let mut cache = AddressCache::new();
        for (last, status) in [(1, EntryStatus::ArpPending), (2, EntryStatus::ForwardDirect)] {
            let mut entry = cache.allocate(mac(last));
            entry.status = status;
            entry.flood_count = 4;
            cache.insert(entry);
        }

        assert_eq!(cache.clamp_flood_counts(1), 1);
        assert_eq!(cache.find(&mac(1)).unwrap().flood_count, 1);
        assert_eq!(cache.find(&mac(2)).unwrap().flood_count, 4);
    }

    #[tokio::test]
    async fn test_clear_releases_everything_once() {
        let mut cache = AddressCache::new();
        let (bus, bus_rx) = endpoint(32);
        let (parked, parked_rx) = endpoint(33);
        cache.default_multicast = Some(bus.clone());
        let mut fwd = cache.allocate(MacAddress::BROADCAST);
        fwd.receive = Some(bus);
        cache.push_detached(DetachedList::MulticastForwarders, fwd);
        let mut unknown = cache.allocate(MacAddress::ZERO);
        unknown.direct = Some(parked);
        cache.push_detached(DetachedList::PendingUnknown, unknown);

        cache.clear();
        assert!(bus_rx.is_closed());
        assert!(parked_rx.is_closed());
        assert!(cache.detached(DetachedList::PendingUnknown).is_empty());
        assert!(cache.default_multicast.is_none());
    }

    #[tokio::test]
    async fn test_detach_circuit_returns_endpoints() {
        let mut cache = AddressCache::new();
        let (ep, _rx) = endpoint(60);
        let mut entry = cache.allocate(MacAddress::ZERO);
        entry.direct = Some(ep);
        cache.push_detached(DetachedList::Excluded, entry);

        assert!(cache.is_excluded_circuit(CircuitId::new(0, 60)));
        let endpoints = cache.detach_circuit(CircuitId::new(0, 60));
        assert_eq!(endpoints.len(), 1);
        assert!(!cache.is_excluded_circuit(CircuitId::new(0, 60)));
    }
}
