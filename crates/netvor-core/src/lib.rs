//! Netvor core - share-link import and tunnel session supervision
//!
//! Imports `vless://` share-links, compiles them into proxy engine
//! documents, and runs a device-wide tunnel session out of two supervised
//! subprocesses bound to a virtual interface.
//!
//! # Architecture
//!
//! ```text
//!   share-link ──▶ link::parse ──▶ translate ──▶ ProfileStore (configs/, config.json)
//!                                                      │
//!                                                      ▼ active document
//! ┌──────────────────────── SessionOrchestrator ─────────────────────────┐
//! │                                                                      │
//! │  TUN fd ◀── InterfaceProvider                                        │
//! │    │                                                                 │
//! │    ▼                                                                 │
//! │  tun2socks ──socks5──▶ 127.0.0.1:10808 ──▶ xray ──vless──▶ server    │
//! │    │                                        │                        │
//! │    └──────── output lines ──────────────────┴──▶ StatusBus ◀── stats │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Deterministic compile**: the same link always yields the same bytes
//! - **Atomic persistence**: documents and the active slot are replaced by rename
//! - **Paired subprocesses**: the engine never outlives a failed relay launch
//! - **Live status**: latest-value status channel and a replaying log channel

pub mod bus;
pub mod config;
pub mod error;
pub mod interface;
pub mod link;
pub mod process;
pub mod provision;
pub mod session;
pub mod stats;
pub mod store;
pub mod translate;

pub use bus::{LogSubscription, SessionStatus, StatusBus};
pub use config::{Settings, StatsSettings};
pub use error::{Error, Result};
pub use interface::{
    FdInterfaceProvider, InterfaceHandle, InterfaceProvider, InterfaceSettings, LinuxTunProvider,
};
pub use link::ConnectionProfile;
pub use process::{LaunchSpec, PairState, ProcessPair};
pub use provision::{BinaryProvider, LocalBinary};
pub use session::{SessionOrchestrator, SessionParts, SessionState, StartOutcome};
pub use stats::{InterfaceCounters, StatsSampler, TrafficSource, TrafficTotals};
pub use store::ProfileStore;
pub use translate::EngineConfig;
