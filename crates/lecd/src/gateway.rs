//! Control channel to the LE service daemon.
//!
//! Outbound requests go through a [`ControlGateway`]; a gateway that cannot
//! take a message only costs us the message, and the client keeps working in
//! flood-only mode. Inbound indications are applied to the cache by
//! [`ClientState::dispatch`].

use crate::cache::DetachedList;
use crate::client::{ClientState, LecClient};
use crate::codec::{self, ArpUpdate, LecMessage};
use crate::endpoint::Endpoint;
use crate::entry::EntryId;
use crate::error::{LecError, Result};
use crate::flush::promote;
use crate::timer::TimerKind;
use crate::types::{AtmAddress, CircuitId, EntryStatus, MacAddress};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Sink for requests to the LE service daemon.
pub trait ControlGateway: Send + Sync {
    /// Hand a message to the daemon. Must not block.
    fn send(&self, msg: LecMessage) -> Result<()>;
}

/// Gateway backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    tx: mpsc::Sender<LecMessage>,
}

impl ChannelGateway {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LecMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ControlGateway for ChannelGateway {
    fn send(&self, msg: LecMessage) -> Result<()> {
        self.tx
            .try_send(msg)
            .map_err(|e| LecError::ControlChannel(e.to_string()))
    }
}

/// Send `msg`, logging instead of failing.
pub(crate) fn notify(gateway: &dyn ControlGateway, msg: LecMessage) {
    let kind = msg.kind();
    if let Err(e) = gateway.send(msg) {
        warn!(kind, error = %e, "Dropping control message");
    }
}

/// How a circuit opened by the substrate is to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    /// Data direct circuit we set up in answer to an SVC setup request
    Outgoing,
    /// Data direct circuit a peer client set up to us
    Incoming,
    /// Circuit we only ever receive on
    ReceiveOnly,
    /// Multicast forward circuit from the BUS
    MulticastForward,
}

impl ClientState {
    /// Apply one message from the LE service daemon.
    #[instrument(skip_all, fields(kind = msg.kind()))]
    pub(crate) fn dispatch(&mut self, msg: LecMessage) -> Result<()> {
        match msg {
            LecMessage::SetMacAddress(mac) => {
                info!(%mac, "Local MAC address set");
                self.local_mac = Some(mac);
            }
            LecMessage::DeleteMacAddress(mac) => {
                if self.local_mac == Some(mac) {
                    info!(%mac, "Local MAC address removed");
                    self.local_mac = None;
                }
            }
            LecMessage::AddressDelete { atm, permanent } => {
                self.address_delete(atm, permanent)?;
            }
            LecMessage::TopologyChange(on) => {
                info!(on, "Topology change");
                self.topology_change = on;
            }
            LecMessage::FlushComplete { tran_id } => {
                self.flush_complete(tran_id);
            }
            LecMessage::ArpUpdate(update) => self.arp_update(update),
            LecMessage::NarpRequest { update, no_source } => self.narp(update, no_source),
            LecMessage::Config(config) => {
                self.config.apply(&config)?;
                let clamped = self
                    .cache
                    .clamp_flood_counts(self.config.maximum_unknown_frame_count);
                info!(
                    clamped,
                    max_unknown_frame_count = self.config.maximum_unknown_frame_count,
                    aging_time = self.config.aging_time.as_secs(),
                    lane_version = self.config.lane_version.as_u32(),
                    "Applied LE configuration"
                );
            }
            LecMessage::FlushTransactionId { atm, tran_id } => {
                self.set_flush_tran_id(atm, tran_id);
            }
            LecMessage::SetLecId(id) => {
                info!(lec_id = id, "LECID assigned");
                self.lec_id = id;
            }
            LecMessage::AssociateIndication { mac, tlvs } => match self.cache.find_mut(&mac) {
                Some(entry) => entry.tlvs = tlvs,
                None => debug!(%mac, "Capabilities for unknown MAC ignored"),
            },
            LecMessage::ShouldBridge { mac } => {
                // bridging decisions belong to the forwarding layer
                debug!(%mac, "Bridge query passed on");
            }
            LecMessage::SvcSetup { .. }
            | LecMessage::ArpRequest { .. }
            | LecMessage::RouteDescriptorArpRequest { .. }
            | LecMessage::AssociateRequest { .. }
            | LecMessage::FlushRequest { .. } => {
                return Err(LecError::UnexpectedMessage(msg.kind()));
            }
        }
        Ok(())
    }

    /// Learn or refresh a MAC → ATM binding.
    #[instrument(skip_all, fields(mac = %update.mac, atm = %update.atm))]
    pub(crate) fn arp_update(&mut self, update: ArpUpdate) {
        let ArpUpdate {
            mac,
            atm,
            remote,
            targetless,
            permanent,
            tlvs,
        } = update;
        let now = Instant::now();

        if targetless && !self.cache.contains(&mac) {
            debug!("Targetless LE_ARP for unknown MAC ignored");
            return;
        }

        // a peer already opened a circuit from this ATM address
        if let Some(mut learned) = self
            .cache
            .take_detached(DetachedList::PendingUnknown, |e| e.atm == atm)
        {
            learned.cancel_timer();
            let circuit = learned.direct.take();
            match self.cache.find_mut(&mac) {
                Some(entry) => {
                    entry.cancel_timer();
                    entry.atm = atm;
                    let previous = std::mem::replace(&mut entry.direct, circuit);
                    if entry.status < EntryStatus::VcPending {
                        entry.advance(EntryStatus::VcPending);
                    }
                    entry.advance(EntryStatus::ForwardDirect);
                    entry.flags.remote = remote;
                    entry.flags.permanent |= permanent;
                    if !tlvs.is_empty() {
                        entry.tlvs = tlvs;
                    }
                    let sent = promote(entry, now);
                    debug!(sent, "Adopted peer circuit");
                    if let Some(previous) = previous {
                        self.cache.release_if_unused(previous);
                    }
                }
                None => {
                    learned.mac = mac;
                    learned.direct = circuit;
                    learned.advance(EntryStatus::ForwardDirect);
                    learned.last_used = now;
                    learned.flags.remote = remote;
                    learned.flags.permanent = permanent;
                    learned.tlvs = tlvs;
                    debug!("Bound peer circuit to MAC");
                    self.cache.insert(learned);
                }
            }
            return;
        }

        if !self.cache.contains(&mac) {
            let entry = self.cache.allocate(mac);
            self.cache.insert(entry);
        }

        // another entry may already have (or be opening) a circuit to `atm`
        let peer = self
            .cache
            .iter_ordered()
            .into_iter()
            .find(|e| e.mac != mac && e.atm == atm && !atm.is_zero())
            .map(|e| (e.status, e.direct.clone(), e.flush_tran_id));

        let Some(entry) = self.cache.find_mut(&mac) else {
            return;
        };
        entry.cancel_timer();
        entry.atm = atm;
        entry.flags.remote = remote;
        entry.flags.permanent |= permanent;
        if !tlvs.is_empty() {
            entry.tlvs = tlvs;
        }

        match peer {
            Some((status, Some(direct), tran_id)) if status.has_circuit() => {
                if entry.status < EntryStatus::VcPending {
                    entry.advance(EntryStatus::VcPending);
                }
                if entry.status == EntryStatus::VcPending {
                    entry.direct = Some(direct);
                    entry.advance(status);
                    if status == EntryStatus::FlushPending {
                        entry.timestamp = now;
                        entry.flush_tran_id = tran_id;
                    } else {
                        entry.drain_onto_direct();
                    }
                    debug!(%status, "Sharing existing circuit");
                }
            }
            Some((EntryStatus::VcPending, _, _)) => {
                if entry.status < EntryStatus::VcPending {
                    entry.advance(EntryStatus::VcPending);
                }
            }
            _ => {
                if matches!(entry.status, EntryStatus::Unknown | EntryStatus::ArpPending) {
                    entry.advance(EntryStatus::VcPending);
                    notify(self.gateway.as_ref(), LecMessage::SvcSetup { mac, atm });
                }
            }
        }
    }

    /// LANE2 negative LE_ARP: forget the binding, then apply whatever the
    /// message still carries.
    pub(crate) fn narp(&mut self, update: ArpUpdate, no_source: bool) {
        let mac = update.mac;
        if self.cache.remove(&mac).is_ok() {
            debug!(%mac, "Binding withdrawn");
        }
        if !no_source {
            self.arp_update(update);
        }
    }

    /// Drop every binding to `atm`. Permanent bindings survive unless
    /// `permanent` is set.
    ///
    /// Returns the number of entries removed.
    pub(crate) fn address_delete(&mut self, atm: AtmAddress, permanent: bool) -> Result<usize> {
        let macs = self.cache.macs_for_atm(&atm);
        if macs.is_empty() {
            return Err(LecError::AtmAddressNotFound(atm));
        }
        let mut removed = 0;
        for mac in macs {
            let keep = self
                .cache
                .find(&mac)
                .is_some_and(|e| e.flags.permanent && !permanent);
            if keep {
                continue;
            }
            self.cache.remove(&mac)?;
            removed += 1;
        }
        info!(%atm, removed, "Deleted bindings for ATM address");
        Ok(removed)
    }

    /// Park a circuit on a side list and arm its idle timer.
    fn park(&mut self, list: DetachedList, atm: AtmAddress, endpoint: Endpoint) {
        let mut entry = self.cache.allocate(MacAddress::ZERO);
        entry.atm = atm;
        entry.direct = Some(endpoint);
        entry.timer = Some(self.scheduler.arm(
            entry.id,
            TimerKind::CircuitIdle,
            self.config.vcc_timeout_period,
        ));
        self.cache.push_detached(list, entry);
    }

    /// A circuit to `atm` came up.
    #[instrument(skip_all, fields(atm = %atm, circuit = %endpoint.id(), ?kind))]
    pub(crate) fn circuit_attached(&mut self, atm: AtmAddress, kind: AttachKind, endpoint: Endpoint) {
        match kind {
            AttachKind::MulticastForward => {
                let mut entry = self.cache.allocate(MacAddress::BROADCAST);
                entry.atm = atm;
                entry.receive = Some(endpoint);
                self.cache
                    .push_detached(DetachedList::MulticastForwarders, entry);
                return;
            }
            AttachKind::ReceiveOnly => {
                self.park(DetachedList::Excluded, atm, endpoint);
                return;
            }
            AttachKind::Outgoing => endpoint.set_outgoing(true),
            AttachKind::Incoming => endpoint.set_outgoing(false),
        }

        let macs = self.cache.macs_for_atm(&atm);
        if macs.is_empty() {
            debug!("Circuit from unknown peer, waiting for first frame");
            self.park(DetachedList::PendingUnknown, atm, endpoint);
            return;
        }

        let now = Instant::now();
        let max_flood = self.config.maximum_unknown_frame_count;
        // the circuit placed by the lower ATM address wins on both sides
        let winner_outgoing = self.config.local_atm_address.map(|local| local < atm);
        let replaces = |existing: &Endpoint| {
            winner_outgoing.is_some_and(|outgoing| {
                endpoint.is_outgoing() == outgoing && existing.is_outgoing() != outgoing
            })
        };
        let mut superseded: Vec<Endpoint> = Vec::new();
        let mut refused = false;

        for mac in macs {
            let Some(entry) = self.cache.find_mut(&mac) else {
                continue;
            };
            entry.cancel_timer();

            match entry.direct.clone() {
                None => {
                    if entry.status < EntryStatus::VcPending {
                        entry.advance(EntryStatus::VcPending);
                    }
                    entry.direct = Some(endpoint.clone());
                    match entry.status {
                        EntryStatus::VcPending if max_flood == 0 => {
                            entry.advance(EntryStatus::ForwardDirect);
                            entry.drain_onto_direct();
                        }
                        EntryStatus::VcPending => {
                            entry.timestamp = now;
                            entry.advance(EntryStatus::FlushPending);
                            if self.config.emit_flush_request {
                                notify(self.gateway.as_ref(), LecMessage::FlushRequest { atm });
                            }
                        }
                        // permanent binding getting its circuit back
                        EntryStatus::ForwardDirect => {
                            entry.drain_onto_direct();
                        }
                        _ => {}
                    }
                    debug!(%mac, status = %entry.status, "Circuit attached");
                }
                Some(existing) if existing.same_as(&endpoint) => {}
                Some(existing) => {
                    if !replaces(&existing) {
                        refused = true;
                    } else {
                        entry.direct = Some(endpoint.clone());
                        if !superseded.iter().any(|e| e.same_as(&existing)) {
                            superseded.push(existing);
                        }
                    }
                }
            }
        }

        if refused {
            info!("Simultaneous setup, keeping established circuit");
            self.park(DetachedList::Excluded, atm, endpoint);
        }
        for old in superseded {
            info!(old = %old.id(), "Simultaneous setup, switching to winning circuit");
            self.park(DetachedList::Excluded, atm, old);
        }
    }

    /// The BUS multicast send circuit came up.
    pub(crate) fn bus_attached(&mut self, atm: AtmAddress, endpoint: Endpoint) {
        info!(circuit = %endpoint.id(), "BUS circuit attached");
        self.cache.default_multicast = Some(endpoint.clone());
        let mut entry = self.cache.allocate(MacAddress::BROADCAST);
        entry.atm = atm;
        entry.receive = Some(endpoint);
        self.cache
            .push_detached(DetachedList::MulticastForwarders, entry);
    }

    /// The substrate closed `circuit`.
    #[instrument(skip_all, fields(circuit = %circuit))]
    pub(crate) fn circuit_closed(&mut self, circuit: CircuitId) {
        let mut endpoints = Vec::new();
        for mac in self.cache.macs_using(circuit) {
            let Some(entry) = self.cache.find_mut(&mac) else {
                continue;
            };
            if entry.flags.permanent {
                endpoints.extend(entry.direct.take());
                debug!(%mac, "Permanent binding lost its circuit");
                continue;
            }
            if let Err(e) = self.cache.remove(&mac) {
                warn!(%mac, error = %e, "Failed to drop binding");
            }
        }
        endpoints.extend(self.cache.detach_circuit(circuit));
        if self
            .cache
            .default_multicast
            .as_ref()
            .is_some_and(|e| e.id() == circuit)
        {
            endpoints.extend(self.cache.default_multicast.take());
        }

        for endpoint in endpoints {
            self.cache.release_if_unused(endpoint);
        }
    }

    /// Idle timer of a parked circuit went off.
    pub(crate) fn circuit_idle_expired(&mut self, id: EntryId, token: u64) {
        let current = self
            .cache
            .find_detached_mut(id)
            .is_some_and(|e| e.timer.as_ref().map(|t| t.token()) == Some(token));
        if !current {
            return;
        }
        info!(entry = id.0, "Tearing down circuit nobody claimed");
        if let Err(e) = self.cache.remove_detached(id) {
            warn!(error = %e, "Failed to drop parked circuit");
        }
    }

    /// First frame on a circuit a peer opened tells us who is behind it.
    pub(crate) fn learn_from_frame(&mut self, circuit: CircuitId, src: MacAddress) {
        let Some(mut learned) = self
            .cache
            .take_detached(DetachedList::PendingUnknown, |e| e.uses_circuit(circuit))
        else {
            return;
        };
        learned.cancel_timer();
        learned.mac = src;
        learned.advance(EntryStatus::ForwardDirect);
        learned.last_used = Instant::now();
        info!(mac = %src, %circuit, "Learned MAC of peer circuit");
        // replaces and retires any stale binding for `src`
        self.cache.insert(learned);
    }
}

/// Feed messages from `rx` into the client until the channel closes.
pub async fn run_control_loop(client: LecClient, mut rx: mpsc::Receiver<LecMessage>) {
    while let Some(msg) = rx.recv().await {
        let kind = msg.kind();
        if let Err(e) = client.handle_message(msg) {
            warn!(kind, error = %e, "Failed to apply control message");
        }
    }
    debug!("Control channel closed");
}

/// Decode messages from a byte stream and apply them to the client.
///
/// Returns when the stream ends cleanly; a truncated or undecodable stream
/// is an error.
pub async fn read_control_stream<R>(client: &LecClient, mut reader: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::with_capacity(codec::MESSAGE_LEN * 4);
    let mut chunk = vec![0u8; 4096];
    loop {
        while let Some((msg, used)) = codec::decode(&buf)? {
            buf.drain(..used);
            let kind = msg.kind();
            if let Err(e) = client.handle_message(msg) {
                warn!(kind, error = %e, "Failed to apply control message");
            }
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(());
            }
            return Err(LecError::Codec(format!(
                "stream ended inside a message ({} bytes pending)",
                buf.len()
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Encode messages from `rx` onto a byte stream until the channel closes.
pub async fn write_control_stream<W>(mut rx: mpsc::Receiver<LecMessage>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        match codec::encode(&msg) {
            Ok(bytes) => writer.write_all(&bytes).await?,
            Err(e) => warn!(kind = msg.kind(), error = %e, "Dropping unencodable message"),
        }
    }
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_gateway_rejects_message() {
        let (gateway, mut rx) = ChannelGateway::new(1);
        gateway.send(LecMessage::TopologyChange(true)).unwrap();

        let err = gateway
            .send(LecMessage::TopologyChange(false))
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rx.recv().await, Some(LecMessage::TopologyChange(true)));
    }

    #[tokio::test]
    async fn test_notify_swallows_failures() {
        let (gateway, rx) = ChannelGateway::new(1);
        drop(rx);
        notify(&gateway, LecMessage::SetLecId(1));
    }

    #[tokio::test]
    async fn test_control_loop_applies_messages() {
        let (gateway, _requests) = ChannelGateway::new(4);
        let client = LecClient::new(Default::default(), std::sync::Arc::new(gateway)).unwrap();
        let (tx, rx) = mpsc::channel(4);

        tx.send(LecMessage::SetLecId(9)).await.unwrap();
        tx.send(LecMessage::FlushRequest {
            atm: AtmAddress::ZERO,
        })
        .await
        .unwrap();
        drop(tx);

        run_control_loop(client.clone(), rx).await;
        assert_eq!(client.lec_id(), 9);
    }
}
