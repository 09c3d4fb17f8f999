//! WolfRelay - MariaDB Protocol Proxy and Binlog Relay
//!
//! A Rust-based MariaDB/MySQL protocol reverse proxy and binary log
//! replication hub. Clients and replica servers speak the MySQL wire
//! protocol; WolfRelay authenticates them, opens matching backend
//! connections chosen by its cluster monitor, and either routes queries
//! transparently or fans a master's binlog stream out to any number of
//! subscribed replicas.
//!
//! # Architecture
//!
//! All socket I/O runs on a fixed pool of routing workers. Each worker is
//! a single-owner event loop: a connection (DCB) is registered with one
//! worker and only ever touched there, with cross-worker work posted as
//! commands. On top of that sit three largely independent subsystems:
//!
//! - the cluster monitor, which probes servers, classifies replication
//!   roles and publishes status bits routers read lock-free
//! - the transparent query proxy, pairing each client with a backend
//! - the binlog router, which ingests a master's binlog into local files
//!   and streams them to registered replicas with transaction-safe pacing
//!
//! # Features
//!
//! - Edge-style readiness dispatch with watermark-based backpressure
//! - Monitor recovery journal and state-change script hooks
//! - Binlog storage with CRC verification and optional at-rest encryption
//! - GTID index for placing replicas by global transaction id
//! - Semi-sync acknowledgement towards the master

pub mod buffer;
pub mod config;
pub mod dcb;
pub mod endpoint;
pub mod error;
pub mod binlog;
pub mod monitor;
pub mod proxy;
pub mod server;
pub mod session;
pub mod tuning;
pub mod worker;

pub use config::WolfRelayConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::binlog::{Router, RouterSettings};
    pub use crate::buffer::Buffer;
    pub use crate::config::WolfRelayConfig;
    pub use crate::dcb::{Dcb, DcbHandler, DcbLimits, DcbRole};
    pub use crate::error::{Error, Result};
    pub use crate::monitor::{Monitor, ServerClaims};
    pub use crate::server::{Server, ServerSet};
    pub use crate::session::Session;
    pub use crate::worker::{DcbRemote, WorkerPool};
}
