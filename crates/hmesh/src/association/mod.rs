// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Boundary to the platform peer-association layer.
//!
//! The mesh core does not implement NAT traversal, encryption or peer
//! discovery. It requires a provider of *associations* - authenticated
//! peer-to-peer channel handles - behind the traits in this module:
//! asynchronous create/destroy, enumeration of live associations,
//! remote-address resolution, state-change notification per association,
//! and delivery of associations offered by remote peers.
//!
//! Completion callbacks run on an arbitrary provider thread and must take
//! the core's locks themselves; the core never holds a lock across a call
//! into this boundary's async operations.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub mod loopback;

/// Address of a remote peer as resolved by the association layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// Socket address datagrams to this peer are sent to.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

/// Lifecycle state reported by an association.
///
/// The core reacts to the three teardown states by force-disconnecting the
/// owning connection; everything else is provider-internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Connected,
    LocalDestroying,
    RemoteDestroying,
    Invalid,
}

impl AssociationState {
    /// True for the states that end the association.
    #[must_use]
    pub fn is_teardown(self) -> bool {
        !matches!(self, AssociationState::Connected)
    }
}

/// Token returned by [`Association::add_state_listener`], used to detach.
pub type ListenerToken = u64;

/// State-change listener installed on one association.
pub type StateListener = Box<dyn Fn(AssociationState) + Send + Sync>;

/// Completion for [`AssociationTemplate::create_async`].
pub type CreateCompletion = Box<dyn FnOnce(crate::Result<Arc<dyn Association>>) + Send>;

/// Completion for [`Association::destroy_async`].
pub type DestroyCompletion = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Handler for associations offered by remote peers.
pub type IncomingHandler = Box<dyn Fn(Arc<dyn Association>) + Send + Sync>;

/// One live peer-to-peer channel handle.
pub trait Association: Send + Sync {
    /// Remote peer address this association resolves to.
    fn remote_address(&self) -> PeerAddress;

    /// Install a state-change listener; the token detaches it again.
    fn add_state_listener(&self, listener: StateListener) -> ListenerToken;

    /// Detach a previously installed listener. Unknown tokens are ignored.
    fn remove_state_listener(&self, token: ListenerToken);

    /// Tear the association down. The completion runs on an arbitrary
    /// provider thread once the teardown has finished.
    fn destroy_async(&self, completion: DestroyCompletion);
}

/// Factory and registry for associations of one local endpoint.
pub trait AssociationTemplate: Send + Sync {
    /// Local port the transport socket must bind to.
    fn bound_port(&self) -> u16;

    /// Address remote peers reach this endpoint under.
    fn local_address(&self) -> PeerAddress;

    /// Request an association to `remote`. The completion runs on an
    /// arbitrary provider thread with the new association or the failure.
    fn create_async(&self, remote: PeerAddress, completion: CreateCompletion);

    /// All currently live associations created from this template.
    fn associations(&self) -> Vec<Arc<dyn Association>>;

    /// Install the handler invoked when a remote peer offers an
    /// association. Replaces any previous handler.
    fn on_incoming(&self, handler: IncomingHandler);

    /// Remove the incoming-association handler.
    fn clear_incoming(&self);
}
