//! Flush protocol bookkeeping.
//!
//! While an entry is `FlushPending` its frames wait on the entry so that
//! nothing overtakes traffic still in flight through the BUS. A flush
//! confirmation, or the path switching delay, moves it to `ForwardDirect`
//! and drains the queue onto the new circuit.

use crate::client::ClientState;
use crate::entry::Entry;
use crate::types::{AtmAddress, EntryStatus};
use tokio::time::Instant;
use tracing::{debug, info};

/// Switch a `FlushPending` entry to its data direct circuit.
///
/// Returns the number of queued frames sent.
pub(crate) fn promote(entry: &mut Entry, now: Instant) -> usize {
    if !entry.advance(EntryStatus::ForwardDirect) {
        return 0;
    }
    entry.last_used = now;
    entry.drain_onto_direct()
}

impl ClientState {
    /// Record the transaction id of the flush request sent towards `atm`.
    ///
    /// Returns the number of entries updated.
    pub(crate) fn set_flush_tran_id(&mut self, atm: AtmAddress, tran_id: u32) -> usize {
        let mut updated = 0;
        for mac in self.cache.macs_for_atm(&atm) {
            if let Some(entry) = self.cache.find_mut(&mac) {
                entry.flush_tran_id = tran_id;
                updated += 1;
            }
        }
        debug!(%atm, tran_id, updated, "Set flush transaction id");
        updated
    }

    /// Flush confirmation arrived for `tran_id`.
    ///
    /// Returns the number of entries promoted.
    pub(crate) fn flush_complete(&mut self, tran_id: u32) -> usize {
        let now = Instant::now();
        let mut promoted = 0;
        for mac in self.cache.ordered_macs() {
            let Some(entry) = self.cache.find_mut(&mac) else {
                continue;
            };
            if entry.status != EntryStatus::FlushPending || entry.flush_tran_id != tran_id {
                continue;
            }
            let sent = promote(entry, now);
            info!(%mac, tran_id, sent, "Flush complete, forwarding direct");
            promoted += 1;
        }
        promoted
    }
}
