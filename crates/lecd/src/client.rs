//! LE client: the cache, its timers and the data path behind one lock.
//!
//! Every operation, whether it comes from the data path, a control message
//! or a timer, takes the same [`parking_lot::Mutex`] and never awaits while
//! holding it.

use crate::aging::{AgingSweeper, SweepReport};
use crate::cache::AddressCache;
use crate::codec::{LecMessage, MAX_TLV_LEN};
use crate::config::LecConfig;
use crate::endpoint::Endpoint;
use crate::entry::{EntryId, EntrySnapshot};
use crate::error::{LecError, Result};
use crate::gateway::{AttachKind, ControlGateway, notify};
use crate::resolver::Resolution;
use crate::timer::{Scheduler, TimerKind};
use crate::types::{AtmAddress, CircuitId, Frame, LEC_HEADER_LEN, MacAddress};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace};

/// 802.3 header following the LECID.
const ETH_HEADER_LEN: usize = 14;

/// What happened to an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Sent on a data direct circuit
    Direct,
    /// Sent to the BUS
    Flooded,
    /// Held until the destination's circuit is ready
    Queued,
    /// Discarded
    Dropped,
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Hand the frame to the host stack
    Delivered,
    /// Unicast for someone else
    Filtered,
    /// Our own frame echoed by the BUS
    OwnEcho,
    /// Too short to carry a LE header
    Malformed,
}

pub(crate) struct ClientState {
    pub(crate) config: LecConfig,
    pub(crate) cache: AddressCache,
    pub(crate) topology_change: bool,
    pub(crate) lec_id: u16,
    pub(crate) local_mac: Option<MacAddress>,
    pub(crate) local_tlvs: Vec<u8>,
    pub(crate) gateway: Arc<dyn ControlGateway>,
    pub(crate) scheduler: Scheduler,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<ClientState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    /// Timer callback entry point.
    pub(crate) fn fire(&self, id: EntryId, token: u64, kind: TimerKind) {
        let mut state = self.state.lock();
        match kind {
            TimerKind::ArpRetry(mac) => state.arp_retry_expired(mac, id, token),
            TimerKind::CircuitIdle => state.circuit_idle_expired(id, token),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// Handle to one LAN emulation client. Clones share the same cache.
#[derive(Clone)]
pub struct LecClient {
    shared: Arc<Shared>,
}

impl LecClient {
    /// Create a client. Must be called from within a tokio runtime, which
    /// then runs the client's timers.
    pub fn new(config: LecConfig, gateway: Arc<dyn ControlGateway>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| LecError::Runtime(e.to_string()))?;
        let shared = Arc::new_cyclic(|weak| Shared {
            state: Mutex::new(ClientState {
                config,
                cache: AddressCache::new(),
                topology_change: false,
                lec_id: 0,
                local_mac: None,
                local_tlvs: Vec::new(),
                gateway,
                scheduler: Scheduler::new(runtime, weak.clone()),
            }),
            sweeper: Mutex::new(None),
        });
        Ok(Self { shared })
    }

    /// Start the periodic aging sweep. Calling it again is a no-op.
    pub fn start_aging(&self) {
        let mut sweeper = self.shared.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let (runtime, period) = {
            let state = self.shared.state.lock();
            (
                state.scheduler.runtime().clone(),
                state.config.aging_refresh_interval,
            )
        };
        *sweeper = Some(AgingSweeper::spawn(
            &runtime,
            Arc::downgrade(&self.shared),
            period,
        ));
        info!(period_secs = period.as_secs(), "Aging sweep started");
    }

    pub fn config(&self) -> LecConfig {
        self.shared.state.lock().config.clone()
    }

    pub fn lec_id(&self) -> u16 {
        self.shared.state.lock().lec_id
    }

    pub fn local_mac(&self) -> Option<MacAddress> {
        self.shared.state.lock().local_mac
    }

    pub fn topology_change(&self) -> bool {
        self.shared.state.lock().topology_change
    }

    /// Decide where a frame for `mac` goes, creating the entry on a miss.
    pub fn resolve(&self, mac: MacAddress, is_rdesc: bool) -> Resolution {
        self.shared.state.lock().resolve(mac, is_rdesc)
    }

    /// Send a data frame towards its destination.
    pub fn transmit(&self, frame: Frame) -> Result<TxOutcome> {
        let dst = frame
            .destination()
            .ok_or_else(|| LecError::MalformedFrame(format!("{} bytes", frame.len())))?;

        let mut state = self.shared.state.lock();
        let max_len = state.config.mtu as usize + LEC_HEADER_LEN + ETH_HEADER_LEN;
        if frame.len() > max_len {
            debug!(%dst, len = frame.len(), max_len, "Frame exceeds MTU");
            return Ok(TxOutcome::Dropped);
        }

        let outcome = match state.resolve(dst, false) {
            Resolution::Direct(endpoint) => {
                // anything held back goes first
                if let Some(entry) = state.cache.find_mut(&dst) {
                    entry.drain_onto_direct();
                }
                send_or_drop(&endpoint, frame, TxOutcome::Direct)
            }
            Resolution::Flood(Some(bus)) => send_or_drop(&bus, frame, TxOutcome::Flooded),
            Resolution::Flood(None) => {
                debug!(%dst, "No BUS circuit, dropping frame");
                TxOutcome::Dropped
            }
            Resolution::Queue => match state.cache.find_mut(&dst).map(|e| e.enqueue(frame)) {
                Some(true) => TxOutcome::Queued,
                _ => {
                    debug!(%dst, "Pending queue full, dropping frame");
                    TxOutcome::Dropped
                }
            },
        };
        trace!(%dst, ?outcome, "Transmit");
        Ok(outcome)
    }

    /// Filter and learn from a frame that arrived on `circuit`.
    pub fn receive(&self, circuit: CircuitId, frame: &Frame) -> RxOutcome {
        let (Some(lec_id), Some(dst), Some(src)) =
            (frame.lec_id(), frame.destination(), frame.source())
        else {
            return RxOutcome::Malformed;
        };

        let mut state = self.shared.state.lock();
        if state.lec_id != 0 && lec_id == state.lec_id {
            return RxOutcome::OwnEcho;
        }

        let data_direct =
            !state.cache.is_bus_circuit(circuit) && !state.cache.is_excluded_circuit(circuit);
        if data_direct {
            let stale = state
                .cache
                .find(&src)
                .is_some_and(|e| e.direct.as_ref().map(Endpoint::id) != Some(circuit));
            if stale && state.cache.remove(&src).is_ok() {
                debug!(mac = %src, %circuit, "Source moved to another circuit");
            }
        }

        if dst.is_unicast() && !state.config.is_proxy && state.local_mac != Some(dst) {
            return RxOutcome::Filtered;
        }

        if data_direct {
            state.learn_from_frame(circuit, src);
        }
        RxOutcome::Delivered
    }

    /// Apply a message from the LE service daemon.
    pub fn handle_message(&self, msg: LecMessage) -> Result<()> {
        self.shared.state.lock().dispatch(msg)
    }

    /// A circuit to `atm` is ready for use.
    pub fn attach_circuit(&self, atm: AtmAddress, kind: AttachKind, endpoint: Endpoint) {
        self.shared
            .state
            .lock()
            .circuit_attached(atm, kind, endpoint);
    }

    /// The multicast send circuit to the BUS is ready.
    pub fn attach_bus(&self, atm: AtmAddress, endpoint: Endpoint) {
        self.shared.state.lock().bus_attached(atm, endpoint);
    }

    /// The substrate closed `circuit`.
    pub fn close_circuit(&self, circuit: CircuitId) {
        self.shared.state.lock().circuit_closed(circuit);
    }

    /// Run one aging sweep now.
    pub fn sweep(&self) -> SweepReport {
        self.shared.state.lock().sweep()
    }

    /// Capability blob learned for `mac`, if any.
    pub fn capabilities(&self, mac: MacAddress) -> Option<Vec<u8>> {
        self.shared
            .state
            .lock()
            .cache
            .find(&mac)
            .filter(|e| !e.tlvs.is_empty())
            .map(|e| e.tlvs.clone())
    }

    /// Ask the LE service for the binding and capabilities of `mac`.
    pub fn request_capabilities(&self, mac: MacAddress) {
        let state = self.shared.state.lock();
        notify(
            state.gateway.as_ref(),
            LecMessage::ArpRequest {
                target: Some(mac),
                tlvs: Vec::new(),
            },
        );
    }

    /// Register our own capability blob with the LE service.
    #[instrument(skip_all, fields(len = tlvs.len()))]
    pub fn associate(&self, tlvs: Vec<u8>) -> Result<()> {
        if tlvs.len() > MAX_TLV_LEN {
            return Err(LecError::Codec(format!(
                "capability blob of {} bytes exceeds {}",
                tlvs.len(),
                MAX_TLV_LEN
            )));
        }
        let mut state = self.shared.state.lock();
        state.local_tlvs = tlvs.clone();
        state
            .gateway
            .send(LecMessage::AssociateRequest { tlvs })
    }

    pub fn local_capabilities(&self) -> Vec<u8> {
        self.shared.state.lock().local_tlvs.clone()
    }

    pub fn entry(&self, mac: MacAddress) -> Option<EntrySnapshot> {
        self.shared.state.lock().cache.find(&mac).map(|e| e.snapshot())
    }

    /// All resolved and resolving entries, oldest first.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.shared.state.lock().cache.snapshot()
    }

    /// Stop the sweep, cancel every timer and release every circuit.
    pub fn shutdown(&self) {
        if let Some(handle) = self.shared.sweeper.lock().take() {
            handle.abort();
        }
        self.shared.state.lock().cache.clear();
        info!("LE client shut down");
    }
}

fn send_or_drop(endpoint: &Endpoint, frame: Frame, sent: TxOutcome) -> TxOutcome {
    match endpoint.send(frame) {
        Ok(()) => sent,
        Err(e) => {
            debug!(circuit = %endpoint.id(), error = %e, "Circuit refused frame");
            TxOutcome::Dropped
        }
    }
}
