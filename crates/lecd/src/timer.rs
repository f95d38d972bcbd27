//! Per-entry timers.
//!
//! Each armed timer is a tokio task that sleeps, then takes the client lock
//! and hands its (entry id, token) pair to the state machine. An entry keeps
//! the [`EntryTimer`] of its current timer; dropping it aborts the task. A
//! callback that is already waiting on the lock when its entry is removed or
//! re-armed finds no entry with a matching token and does nothing.

use crate::client::Shared;
use crate::entry::EntryId;
use crate::types::MacAddress;
use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Delay between LE_ARP retransmissions.
pub const ARP_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Retransmit the LE_ARP request for an entry in the cache
    ArpRetry(MacAddress),
    /// Tear down a circuit whose owner never showed up
    CircuitIdle,
}

/// Handle to an armed timer; aborts the task when dropped.
#[derive(Debug)]
pub(crate) struct EntryTimer {
    token: u64,
    handle: JoinHandle<()>,
}

impl EntryTimer {
    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for EntryTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns timer tasks on the client's runtime.
pub(crate) struct Scheduler {
    runtime: Handle,
    shared: Weak<Shared>,
    next_token: u64,
}

impl Scheduler {
    pub(crate) fn new(runtime: Handle, shared: Weak<Shared>) -> Self {
        Self {
            runtime,
            shared,
            next_token: 0,
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn arm(&mut self, id: EntryId, kind: TimerKind, delay: Duration) -> EntryTimer {
        self.next_token += 1;
        let token = self.next_token;
        let shared = self.shared.clone();
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.fire(id, token, kind);
            }
        });
        EntryTimer { token, handle }
    }
}
