// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process association provider.
//!
//! Implements the [`super`] boundary over a shared registry of local
//! endpoints: creating an association to a registered peer yields a linked
//! pair of handles, delivers the peer's end through its template's
//! incoming handler, and propagates destroy as `LocalDestroying` /
//! `RemoteDestroying` state changes to both ends. Used by the integration
//! tests and for running several endpoints inside one process; it performs
//! no encryption or NAT traversal.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use super::{
    Association, AssociationState, AssociationTemplate, CreateCompletion, DestroyCompletion,
    IncomingHandler, ListenerToken, PeerAddress, StateListener,
};
use crate::Error;

type TemplateRegistry = Mutex<HashMap<PeerAddress, Arc<LoopbackTemplate>>>;

/// Registry linking the in-process endpoints that can reach each other.
#[derive(Default)]
pub struct LoopbackNetwork {
    templates: Arc<TemplateRegistry>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local endpoint and return its template.
    pub fn template(&self, local: PeerAddress) -> Arc<LoopbackTemplate> {
        let template = Arc::new_cyclic(|self_weak| LoopbackTemplate {
            local,
            registry: Arc::clone(&self.templates),
            associations: Mutex::new(Vec::new()),
            incoming: Mutex::new(None),
            self_weak: self_weak.clone(),
        });
        self.templates.lock().insert(local, Arc::clone(&template));
        template
    }
}

/// Association factory for one in-process endpoint.
pub struct LoopbackTemplate {
    local: PeerAddress,
    registry: Arc<TemplateRegistry>,
    associations: Mutex<Vec<Arc<LoopbackAssociation>>>,
    incoming: Mutex<Option<IncomingHandler>>,
    self_weak: Weak<LoopbackTemplate>,
}

impl LoopbackTemplate {
    fn attach(&self, association: &Arc<LoopbackAssociation>) {
        self.associations.lock().push(Arc::clone(association));
    }

    fn detach(&self, association: &LoopbackAssociation) {
        self.associations
            .lock()
            .retain(|a| !std::ptr::eq(a.as_ref(), association));
    }

    fn notify_incoming(&self, association: Arc<dyn Association>) {
        let guard = self.incoming.lock();
        if let Some(handler) = guard.as_ref() {
            handler(association);
        } else {
            log::debug!(
                "[loopback] incoming association at {} dropped: no handler installed",
                self.local
            );
        }
    }
}

impl AssociationTemplate for LoopbackTemplate {
    fn bound_port(&self) -> u16 {
        self.local.socket_addr().port()
    }

    fn local_address(&self) -> PeerAddress {
        self.local
    }

    fn create_async(&self, remote: PeerAddress, completion: CreateCompletion) {
        let peer_template = self.registry.lock().get(&remote).cloned();
        let Some(peer_template) = peer_template else {
            spawn_provider_thread(move || {
                completion(Err(Error::AssociationFailed(format!(
                    "no endpoint registered at {remote}"
                ))));
            });
            return;
        };

        let local_end = LoopbackAssociation::new(remote, self.self_weak.clone());
        let remote_end = LoopbackAssociation::new(self.local, peer_template.self_weak.clone());
        *local_end.peer.lock() = Arc::downgrade(&remote_end);
        *remote_end.peer.lock() = Arc::downgrade(&local_end);

        self.attach(&local_end);
        peer_template.attach(&remote_end);

        log::debug!("[loopback] association pair {} <-> {}", self.local, remote);

        spawn_provider_thread(move || {
            peer_template.notify_incoming(remote_end as Arc<dyn Association>);
            completion(Ok(local_end as Arc<dyn Association>));
        });
    }

    fn associations(&self) -> Vec<Arc<dyn Association>> {
        self.associations
            .lock()
            .iter()
            .map(|a| Arc::clone(a) as Arc<dyn Association>)
            .collect()
    }

    fn on_incoming(&self, handler: IncomingHandler) {
        *self.incoming.lock() = Some(handler);
    }

    fn clear_incoming(&self) {
        *self.incoming.lock() = None;
    }
}

/// One end of a linked in-process association pair.
pub struct LoopbackAssociation {
    remote: PeerAddress,
    owner: Weak<LoopbackTemplate>,
    peer: Mutex<Weak<LoopbackAssociation>>,
    listeners: Mutex<Vec<(ListenerToken, StateListener)>>,
    next_token: AtomicU64,
    destroyed: AtomicBool,
    self_weak: Weak<LoopbackAssociation>,
}

impl LoopbackAssociation {
    fn new(remote: PeerAddress, owner: Weak<LoopbackTemplate>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            remote,
            owner,
            peer: Mutex::new(Weak::new()),
            listeners: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        })
    }

    /// Fire every listener once with `state` and detach them all; the
    /// association is finished after a teardown notification.
    fn notify_teardown(&self, state: AssociationState) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (_, listener) in listeners {
            listener(state);
        }
    }

    fn detach_from_owner(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.detach(self);
        }
    }
}

impl Association for LoopbackAssociation {
    fn remote_address(&self) -> PeerAddress {
        self.remote
    }

    fn add_state_listener(&self, listener: StateListener) -> ListenerToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((token, listener));
        token
    }

    fn remove_state_listener(&self, token: ListenerToken) {
        self.listeners.lock().retain(|(t, _)| *t != token);
    }

    fn destroy_async(&self, completion: DestroyCompletion) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            spawn_provider_thread(move || completion(Ok(())));
            return;
        }

        let this = self.self_weak.upgrade();
        let peer = self.peer.lock().upgrade();
        spawn_provider_thread(move || {
            if let Some(this) = this {
                this.notify_teardown(AssociationState::LocalDestroying);
                this.detach_from_owner();
            }
            if let Some(peer) = peer {
                if !peer.destroyed.swap(true, Ordering::SeqCst) {
                    peer.notify_teardown(AssociationState::RemoteDestroying);
                    peer.detach_from_owner();
                }
            }
            completion(Ok(()));
        });
    }
}

fn spawn_provider_thread<F>(run: F)
where
    F: FnOnce() + Send + 'static,
{
    #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
    thread::Builder::new()
        .name("hmesh-assoc".into())
        .spawn(run)
        .expect("failed to spawn association provider thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn create_pair(
        network: &LoopbackNetwork,
        a: PeerAddress,
        b: PeerAddress,
    ) -> (Arc<dyn Association>, Arc<dyn Association>) {
        let ta = network.template(a);
        let tb = network.template(b);

        let (incoming_tx, incoming_rx) = channel::bounded(1);
        tb.on_incoming(Box::new(move |association| {
            let _ = incoming_tx.send(association);
        }));

        let (done_tx, done_rx) = channel::bounded(1);
        ta.create_async(b, Box::new(move |result| {
            let _ = done_tx.send(result);
        }));

        let ab = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("create completion")
            .expect("create should succeed");
        let ba = incoming_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("incoming delivery");
        (ab, ba)
    }

    #[test]
    fn test_create_links_both_templates() {
        let network = LoopbackNetwork::new();
        let (ab, ba) = create_pair(&network, addr(4001), addr(4002));

        assert_eq!(ab.remote_address(), addr(4002));
        assert_eq!(ba.remote_address(), addr(4001));

        let ta = network.templates.lock().get(&addr(4001)).cloned().expect("ta");
        let tb = network.templates.lock().get(&addr(4002)).cloned().expect("tb");
        assert_eq!(ta.associations().len(), 1);
        assert_eq!(tb.associations().len(), 1);
    }

    #[test]
    fn test_create_to_unknown_peer_fails() {
        let network = LoopbackNetwork::new();
        let ta = network.template(addr(4010));

        let (done_tx, done_rx) = channel::bounded(1);
        ta.create_async(addr(4999), Box::new(move |result| {
            let _ = done_tx.send(result);
        }));

        let result = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("completion");
        assert!(result.is_err(), "unknown peer must fail the create");
    }

    #[test]
    fn test_destroy_notifies_both_ends_and_detaches() {
        let network = LoopbackNetwork::new();
        let (ab, ba) = create_pair(&network, addr(4021), addr(4022));

        let (state_tx, state_rx) = channel::unbounded();
        let local_tx = state_tx.clone();
        ab.add_state_listener(Box::new(move |state| {
            let _ = local_tx.send(("local", state));
        }));
        ba.add_state_listener(Box::new(move |state| {
            let _ = state_tx.send(("remote", state));
        }));

        let (done_tx, done_rx) = channel::bounded(1);
        ab.destroy_async(Box::new(move |result| {
            let _ = done_tx.send(result);
        }));
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("destroy completion")
            .expect("destroy should succeed");

        let mut states = Vec::new();
        while let Ok(state) = state_rx.recv_timeout(Duration::from_millis(500)) {
            states.push(state);
            if states.len() == 2 {
                break;
            }
        }
        assert!(states.contains(&("local", AssociationState::LocalDestroying)));
        assert!(states.contains(&("remote", AssociationState::RemoteDestroying)));

        let ta = network.templates.lock().get(&addr(4021)).cloned().expect("ta");
        let tb = network.templates.lock().get(&addr(4022)).cloned().expect("tb");
        assert!(ta.associations().is_empty(), "destroyed end detached");
        assert!(tb.associations().is_empty(), "peer end detached");
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let network = LoopbackNetwork::new();
        let (ab, _ba) = create_pair(&network, addr(4031), addr(4032));

        let (state_tx, state_rx) = channel::unbounded();
        let token = ab.add_state_listener(Box::new(move |state| {
            let _ = state_tx.send(state);
        }));
        ab.remove_state_listener(token);

        let (done_tx, done_rx) = channel::bounded(1);
        ab.destroy_async(Box::new(move |result| {
            let _ = done_tx.send(result);
        }));
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("destroy completion")
            .expect("destroy should succeed");

        assert!(
            state_rx.recv_timeout(Duration::from_millis(200)).is_err(),
            "detached listener must stay silent"
        );
    }
}
