//! Periodic aging sweep over the LE_ARP cache.

use crate::client::{ClientState, Shared};
use crate::codec::LecMessage;
use crate::flush::promote;
use crate::gateway::notify;
use crate::types::EntryStatus;
use serde::Serialize;
use std::sync::Weak;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries aged out
    pub removed: usize,
    /// Pending entries whose flood window was reset
    pub flood_resets: usize,
    /// Circuit setup requests sent again
    pub setups_reissued: usize,
    /// Entries promoted after the path switching delay
    pub promoted: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ClientState {
    /// Age out idle entries and advance stalled ones.
    #[instrument(skip_all)]
    pub(crate) fn sweep(&mut self) -> SweepReport {
        let now = Instant::now();
        let mut report = SweepReport::default();
        let mut expired = Vec::new();

        for mac in self.cache.ordered_macs() {
            let Some(entry) = self.cache.find_mut(&mac) else {
                continue;
            };
            let limit = if entry.flags.remote && self.topology_change {
                self.config.forward_delay_time
            } else {
                self.config.aging_time
            };

            if now.duration_since(entry.last_used) > limit
                && !entry.flags.permanent
                && !mac.is_multicast()
            {
                expired.push(mac);
                continue;
            }

            match entry.status {
                EntryStatus::ArpPending | EntryStatus::VcPending
                    if now.duration_since(entry.timestamp)
                        >= self.config.max_unknown_frame_time =>
                {
                    entry.timestamp = now;
                    entry.flood_count = 0;
                    report.flood_resets += 1;
                    if entry.status == EntryStatus::VcPending {
                        debug!(%mac, atm = %entry.atm, "Reissuing circuit setup");
                        notify(
                            self.gateway.as_ref(),
                            LecMessage::SvcSetup {
                                mac,
                                atm: entry.atm,
                            },
                        );
                        report.setups_reissued += 1;
                    }
                }
                EntryStatus::FlushPending
                    if now.duration_since(entry.timestamp) >= self.config.path_switching_delay =>
                {
                    let sent = promote(entry, now);
                    info!(%mac, sent, "Path switching delay elapsed, forwarding direct");
                    report.promoted += 1;
                }
                _ => {}
            }
        }

        for mac in expired {
            if self.cache.remove(&mac).is_ok() {
                debug!(%mac, "Aged out LE_ARP entry");
                report.removed += 1;
            }
        }
        report
    }
}

/// Background task running [`ClientState::sweep`] every refresh interval.
pub(crate) struct AgingSweeper;

impl AgingSweeper {
    pub(crate) fn spawn(runtime: &Handle, shared: Weak<Shared>, period: Duration) -> JoinHandle<()> {
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let report = shared.state.lock().sweep();
                if !report.is_empty() {
                    debug!(
                        removed = report.removed,
                        flood_resets = report.flood_resets,
                        setups_reissued = report.setups_reissued,
                        promoted = report.promoted,
                        "Aging sweep"
                    );
                }
            }
        })
    }
}
