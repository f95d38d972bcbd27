//! Transmit/receive endpoints on the ATM substrate.
//!
//! The substrate itself (signalling, segmentation) lives outside this crate
//! and is reached through the [`Circuit`] trait. The cache holds circuits as
//! [`Endpoint`] handles: several entries resolving to the same ATM address
//! share one handle, and the cache releases it once the last of them is gone.

use crate::error::{LecError, Result};
use crate::types::{CircuitId, Frame};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// A virtual circuit provided by the substrate.
pub trait Circuit: Send + Sync {
    /// VPI/VCI of the circuit.
    fn id(&self) -> CircuitId;

    /// Queue a frame for transmission. Must not block.
    fn send(&self, frame: Frame) -> Result<()>;

    /// Tear the circuit down. Called at most once per circuit.
    fn close(&self);
}

struct EndpointInner {
    circuit: Box<dyn Circuit>,
    released: AtomicBool,
    outgoing: AtomicBool,
}

/// Shared handle to a circuit.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn new(circuit: impl Circuit + 'static) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                circuit: Box::new(circuit),
                released: AtomicBool::new(false),
                outgoing: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> CircuitId {
        self.inner.circuit.id()
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        if self.is_released() {
            return Err(LecError::circuit(self.id(), "released"));
        }
        self.inner.circuit.send(frame)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// True if this side placed the call that opened the circuit.
    pub fn is_outgoing(&self) -> bool {
        self.inner.outgoing.load(Ordering::Acquire)
    }

    pub(crate) fn set_outgoing(&self, outgoing: bool) {
        self.inner.outgoing.store(outgoing, Ordering::Release);
    }

    /// Same underlying circuit handle.
    pub fn same_as(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Close the circuit. Returns false if it was already released.
    pub(crate) fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.circuit.close();
        true
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id())
            .field("released", &self.is_released())
            .field("outgoing", &self.is_outgoing())
            .finish()
    }
}

/// Circuit backed by a bounded tokio channel.
///
/// The receiving half stands in for the substrate's transmit queue; a full
/// queue rejects the frame instead of blocking the forwarding path.
pub struct ChannelCircuit {
    id: CircuitId,
    tx: mpsc::Sender<Frame>,
    closed: Arc<AtomicBool>,
}

impl ChannelCircuit {
    pub fn new(id: CircuitId, capacity: usize) -> (Self, CircuitReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let circuit = Self {
            id,
            tx,
            closed: closed.clone(),
        };
        (circuit, CircuitReceiver { rx, closed })
    }
}

impl Circuit for ChannelCircuit {
    fn id(&self) -> CircuitId {
        self.id
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .try_send(frame)
            .map_err(|e| LecError::circuit(self.id, e.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Substrate side of a [`ChannelCircuit`].
pub struct CircuitReceiver {
    rx: mpsc::Receiver<Frame>,
    closed: Arc<AtomicBool>,
}

impl CircuitReceiver {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Drain everything transmitted so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// True once the client has torn the circuit down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MacAddress;

    fn frame(tag: u8) -> Frame {
        Frame::build(1, MacAddress([2, 0, 0, 0, 0, 2]), MacAddress::ZERO, 0x0800, &[tag])
    }

    #[test]
    fn test_release_happens_once() {
        let (circuit, rx) = ChannelCircuit::new(CircuitId::new(0, 100), 4);
        let endpoint = Endpoint::new(circuit);
        let shared = endpoint.clone();

        assert!(shared.same_as(&endpoint));
        assert!(endpoint.release());
        assert!(!shared.release());
        assert!(rx.is_closed());
        assert!(shared.send(frame(1)).is_err());
    }

    #[test]
    fn test_full_channel_rejects_frame() {
        let (circuit, mut rx) = ChannelCircuit::new(CircuitId::new(0, 101), 1);
        let endpoint = Endpoint::new(circuit);

        endpoint.send(frame(1)).unwrap();
        let err = endpoint.send(frame(2)).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rx.drain(), vec![frame(1)]);
    }

    #[test]
    fn test_distinct_handles_are_not_same() {
        let (a, _ra) = ChannelCircuit::new(CircuitId::new(0, 1), 1);
        let (b, _rb) = ChannelCircuit::new(CircuitId::new(0, 1), 1);
        assert!(!Endpoint::new(a).same_as(&Endpoint::new(b)));
    }
}
