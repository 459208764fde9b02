// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # HMESH - Peer-to-peer reliable messaging mesh
//!
//! A reliable-messaging layer for a small set of networked peers that
//! discover each other through a platform association layer, perform a
//! hello handshake, and exchange heartbeats, chat payloads and arbitrary
//! application messages over UDP. Selective reliability is implemented
//! from scratch: framing, sequence ids, ACK-on-request, duplicate and
//! out-of-order rejection, retry-until-acknowledged.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hmesh::{MeshConfig, MeshCoordinator, MeshEvent, PeerAddress};
//! use hmesh::association::loopback::LoopbackNetwork;
//!
//! fn main() -> hmesh::Result<()> {
//!     let network = LoopbackNetwork::new();
//!     let template = network.template(PeerAddress::new("127.0.0.1:7801".parse().unwrap()));
//!     let mesh = MeshCoordinator::new(MeshConfig::new(1, "Console One"), template)?;
//!
//!     let peer = mesh.connect_to(PeerAddress::new("127.0.0.1:7802".parse().unwrap()), "two")?;
//!
//!     for event in mesh.events().iter() {
//!         match event {
//!             MeshEvent::PostHandshake(conn) => {
//!                 mesh.send_chat(&conn, b"hello", true)?;
//!             }
//!             MeshEvent::Chat { from, payload } => {
//!                 println!("{}: {} bytes", from.name(), payload.len());
//!             }
//!             _ => {}
//!         }
//!     }
//!     let _ = peer;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            Application                             |
//! +--------------------------------------------------------------------+
//! |  MeshCoordinator   connection records, auto-connect, heartbeat,    |
//! |                    reconciliation, public event stream             |
//! +--------------------------------------------------------------------+
//! |  PacketTransport   framing, sequence ids, ACK reliability,         |
//! |                    order filter, send/receive workers, telemetry   |
//! +--------------------------------------------------------------------+
//! |  Association layer (external)   discovery, NAT traversal,          |
//! |                                 encryption, address resolution     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Five OS threads at most: auto-connect, heartbeat/hello, socket send,
//! socket receive (all [`worker::PeriodicWorker`]s) plus the application
//! thread. No async runtime.
//!
//! Congestion control, flow control, ordering guarantees beyond
//! best-effort sequencing and encryption are out of scope; encryption and
//! peer discovery belong to the association layer behind
//! [`association::AssociationTemplate`].

/// Boundary traits to the platform association layer, plus the in-process
/// loopback provider.
pub mod association;
/// Mesh-wide constants.
pub mod config;
/// Mesh coordinator, connection records and public events.
pub mod mesh;
/// Packet telemetry counters.
pub mod telemetry;
/// UDP packet transport with selective reliability.
pub mod transport;
/// Wire header and payload codecs.
pub mod wire;
/// Periodic worker threads.
pub mod worker;

pub use association::{Association, AssociationState, AssociationTemplate, PeerAddress};
pub use mesh::connection::{ConnectionStatus, PeerConnection, UserRecord};
pub use mesh::{MeshConfig, MeshCoordinator, MeshEvent};
pub use telemetry::{HeartbeatTimes, PacketStatistics, TypeCounters};
pub use transport::PacketTransport;
pub use wire::{MessageType, PacketHeader};
pub use worker::{PeriodicWorker, WorkerOptions, WorkerPriority, PERIOD_WAKE_ONLY};

/// Errors returned by mesh operations.
///
/// Only caller misuse and construction failures surface as errors;
/// transient transport and association failures are logged, reported on
/// the [`MeshEvent::Debug`] stream and retried or dropped as documented
/// per operation.
#[derive(Debug)]
pub enum Error {
    /// Invalid argument to a public operation; fails fast, never retried.
    InvalidArgument(String),
    /// The target connection has no live association.
    NotConnected,
    /// Failed to bind the transport socket.
    BindFailed(String),
    /// The association layer rejected or failed an operation.
    AssociationFailed(String),
    /// I/O error with underlying cause.
    IoError(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::NotConnected => write!(f, "connection has no live association"),
            Error::BindFailed(msg) => write!(f, "failed to bind socket: {msg}"),
            Error::AssociationFailed(msg) => write!(f, "association layer failure: {msg}"),
            Error::IoError(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

/// Result alias for mesh operations.
pub type Result<T> = std::result::Result<T, Error>;
