//! Destination resolution for outbound frames.
//!
//! Each lookup yields one of three decisions: send on a data direct
//! circuit, flood to the BUS, or hold the frame on the entry until a circuit
//! is ready. A miss creates an `ArpPending` entry, asks the LE service for
//! the binding and arms the retry timer.

use crate::client::ClientState;
use crate::codec::LecMessage;
use crate::endpoint::Endpoint;
use crate::entry::EntryId;
use crate::gateway::notify;
use crate::timer::{ARP_RETRY_INTERVAL, TimerKind};
use crate::types::{EntryStatus, LaneVersion, MacAddress};
use tokio::time::Instant;
use tracing::{debug, instrument};

/// Where an outbound frame should go.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Data direct circuit is ready
    Direct(Endpoint),
    /// Flood through the BUS; `None` when no BUS circuit is attached
    Flood(Option<Endpoint>),
    /// Hold the frame on the entry
    Queue,
}

fn arp_request(mac: MacAddress, is_rdesc: bool) -> LecMessage {
    if is_rdesc {
        LecMessage::RouteDescriptorArpRequest { target: mac }
    } else {
        LecMessage::ArpRequest {
            target: Some(mac),
            tlvs: Vec::new(),
        }
    }
}

impl ClientState {
    /// Resolve `mac` for transmission.
    #[instrument(skip_all, fields(mac = %mac))]
    pub(crate) fn resolve(&mut self, mac: MacAddress, is_rdesc: bool) -> Resolution {
        let bus = self.cache.default_multicast.clone();

        if mac.is_multicast() {
            match self.config.lane_version {
                LaneVersion::V1 => return Resolution::Flood(bus),
                LaneVersion::V2 if mac.is_broadcast() => return Resolution::Flood(bus),
                // LANEv2 resolves selective multicast like unicast
                LaneVersion::V2 => {}
            }
        }

        let now = Instant::now();
        let max_flood = self.config.maximum_unknown_frame_count;

        if let Some(entry) = self.cache.find_mut(&mac) {
            if entry.status == EntryStatus::ForwardDirect {
                entry.last_used = now;
                return match entry.direct.clone() {
                    Some(endpoint) => Resolution::Direct(endpoint),
                    // permanent binding whose circuit went away
                    None => Resolution::Queue,
                };
            }
            if entry.status == EntryStatus::ArpPending {
                entry.retry_count = 0;
            }
            if entry.status != EntryStatus::FlushPending && entry.flood_count < max_flood {
                entry.flood_count += 1;
                return Resolution::Flood(bus);
            }
            return Resolution::Queue;
        }

        let mut entry = self.cache.allocate(mac);
        entry.advance(EntryStatus::ArpPending);
        entry.flood_count = u32::from(max_flood > 0);
        entry.retry_count = 1;
        entry.is_rdesc = is_rdesc;
        entry.last_used = now;
        entry.timestamp = now;
        notify(self.gateway.as_ref(), arp_request(mac, is_rdesc));
        entry.timer = Some(self.scheduler.arm(
            entry.id,
            TimerKind::ArpRetry(mac),
            ARP_RETRY_INTERVAL,
        ));
        debug!("Created LE_ARP entry");
        self.cache.insert(entry);

        if max_flood > 0 {
            Resolution::Flood(bus)
        } else {
            Resolution::Queue
        }
    }

    /// Retry timer for an `ArpPending` entry went off.
    pub(crate) fn arp_retry_expired(&mut self, mac: MacAddress, id: EntryId, token: u64) {
        let Some(entry) = self.cache.find_mut(&mac) else {
            return;
        };
        if entry.id != id || entry.timer.as_ref().map(|t| t.token()) != Some(token) {
            return;
        }
        if entry.status != EntryStatus::ArpPending {
            entry.timer = None;
            return;
        }

        if entry.retry_count <= u32::from(self.config.max_retry_count) {
            debug!(%mac, retry = entry.retry_count, "Retransmitting LE_ARP request");
            notify(self.gateway.as_ref(), arp_request(mac, entry.is_rdesc));
            entry.retry_count += 1;
        }
        entry.timer = Some(self.scheduler.arm(id, TimerKind::ArpRetry(mac), ARP_RETRY_INTERVAL));
    }
}
