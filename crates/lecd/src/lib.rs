//! LAN Emulation Client for SONiC
//!
//! This crate implements the address resolution side of an ATM LAN
//! emulation client: the LE_ARP cache mapping MAC addresses to ATM
//! addresses, the per-entry state machine driving resolution, data direct
//! circuit setup and the flush protocol, and the data path decisions made
//! for every frame.
//!
//! Signalling and the circuits themselves belong to the ATM substrate
//! ([`Circuit`]); requests to the LE service daemon go through a
//! [`ControlGateway`].
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AU-3 | Content of Audit Records | Structured logging with MAC/ATM details |
//! | AU-12 | Audit Record Generation | Binding changes and circuit teardown logged |
//! | CM-6 | Configuration Settings | Validated TOML and LE configuration messages |
//! | SC-5 | Denial of Service Protection | Bounded flooding and pending queues |
//! | SC-7 | Boundary Protection | Unicast filtering of received frames |
//! | SI-10 | Information Input Validation | Control messages and frames checked on decode |
//!
//! # Architecture
//!
//! ```text
//!   host stack            LecClient                   LE service daemon
//!  ─────────────     ┌─────────────────────┐        ─────────────────────
//!   transmit() ────▶ │ resolver            │ ─────▶  ARP_XMT / SVC_SETUP
//!   receive()  ────▶ │ AddressCache        │ ◀─────  ARP_UPDATE / CONFIG
//!                    │ flush / aging       │          FLUSH_COMPLETE ...
//!                    └─────────┬───────────┘
//!                              ▼
//!                   Endpoint (data direct / BUS)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sonic_lecd::{ChannelGateway, LecClient, LecConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> sonic_lecd::Result<()> {
//! let (gateway, _requests) = ChannelGateway::new(64);
//! let client = LecClient::new(LecConfig::default(), Arc::new(gateway))?;
//! client.start_aging();
//! # Ok(())
//! # }
//! ```

pub mod aging;
pub mod cache;
pub mod client;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod entry;
pub mod error;
mod flush;
pub mod gateway;
pub mod resolver;
mod timer;
pub mod types;

pub use aging::SweepReport;
pub use cache::{AddressCache, DetachedList};
pub use client::{LecClient, RxOutcome, TxOutcome};
pub use codec::{ArpUpdate, LecMessage};
pub use config::{ConfigMessage, LecConfig};
pub use endpoint::{ChannelCircuit, Circuit, CircuitReceiver, Endpoint};
pub use entry::{Entry, EntryId, EntrySnapshot};
pub use error::{LecError, Result};
pub use gateway::{
    AttachKind, ChannelGateway, ControlGateway, read_control_stream, run_control_loop,
    write_control_stream,
};
pub use resolver::Resolution;
pub use timer::ARP_RETRY_INTERVAL;
pub use types::{AtmAddress, CircuitId, EntryFlags, EntryStatus, Frame, LaneVersion, MacAddress};
