// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-peer connection record.
//!
//! Pure state holder behind one mutex; every accessor takes the lock. The
//! record has no transition logic of its own - the coordinator mutates
//! status and flags, and association state changes are forwarded opaquely
//! through [`AssociationStateSink`].

use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::association::{Association, AssociationState, ListenerToken, PeerAddress};
use crate::config::CONSOLE_ID_UNKNOWN;

/// Connection lifecycle status.
///
/// Terminal state for the record itself is removal from the coordinator's
/// collection, not a status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Pending,
    Connected,
    /// Both peers have exchanged at least one hello.
    PostHandshake,
}

/// Per-application-user sub-record.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserRecord {
    pub ack_received: bool,
}

/// Receiver of opaque association state-change notifications.
pub(crate) trait AssociationStateSink: Send + Sync {
    fn on_association_state(&self, association: &Arc<dyn Association>, state: AssociationState);
}

struct ConnectionState {
    console_id: u8,
    name: String,
    custom_property: Option<Arc<dyn Any + Send + Sync>>,
    status: ConnectionStatus,
    incoming: bool,
    in_progress: bool,
    destroying: bool,
    found_in_template: bool,
    retry_attempts: u32,
    last_heartbeat: Option<Instant>,
    association: Option<Arc<dyn Association>>,
    listener_token: Option<ListenerToken>,
    users: HashMap<String, UserRecord>,
}

/// One remote peer tracked by the mesh coordinator.
pub struct PeerConnection {
    address: PeerAddress,
    sink: Weak<dyn AssociationStateSink>,
    state: Mutex<ConnectionState>,
}

impl PeerConnection {
    pub(crate) fn new(address: PeerAddress, sink: Weak<dyn AssociationStateSink>) -> Self {
        Self {
            address,
            sink,
            state: Mutex::new(ConnectionState {
                console_id: CONSOLE_ID_UNKNOWN,
                name: String::new(),
                custom_property: None,
                status: ConnectionStatus::Disconnected,
                incoming: false,
                in_progress: false,
                destroying: false,
                found_in_template: false,
                retry_attempts: 0,
                last_heartbeat: None,
                association: None,
                listener_token: None,
                users: HashMap::new(),
            }),
        }
    }

    /// Peer address this record was created for. Unique per record.
    #[must_use]
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    #[must_use]
    pub fn console_id(&self) -> u8 {
        self.state.lock().console_id
    }

    pub fn set_console_id(&self, console_id: u8) {
        self.state.lock().console_id = console_id;
    }

    /// Display name; `"n/a"` until a name is learned.
    #[must_use]
    pub fn name(&self) -> String {
        let state = self.state.lock();
        if state.name.is_empty() {
            "n/a".to_owned()
        } else {
            state.name.clone()
        }
    }

    pub fn set_name(&self, name: &str) {
        self.state.lock().name = name.to_owned();
    }

    /// Opaque application-defined property.
    #[must_use]
    pub fn custom_property(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state.lock().custom_property.clone()
    }

    pub fn set_custom_property(&self, property: Option<Arc<dyn Any + Send + Sync>>) {
        self.state.lock().custom_property = property;
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.state.lock().status = status;
    }

    /// True if the association was offered by the peer rather than
    /// initiated locally.
    #[must_use]
    pub fn is_incoming(&self) -> bool {
        self.state.lock().incoming
    }

    pub fn set_incoming(&self, incoming: bool) {
        self.state.lock().incoming = incoming;
    }

    /// True while an association-create operation is outstanding.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.state.lock().in_progress
    }

    pub fn set_in_progress(&self, in_progress: bool) {
        self.state.lock().in_progress = in_progress;
    }

    /// True once teardown has started.
    #[must_use]
    pub fn is_destroying(&self) -> bool {
        self.state.lock().destroying
    }

    pub fn set_destroying(&self, destroying: bool) {
        self.state.lock().destroying = destroying;
    }

    /// Reconciliation marker, valid only within one reconciliation pass.
    #[must_use]
    pub fn found_in_template(&self) -> bool {
        self.state.lock().found_in_template
    }

    pub fn set_found_in_template(&self, found: bool) {
        self.state.lock().found_in_template = found;
    }

    #[must_use]
    pub fn retry_attempts(&self) -> u32 {
        self.state.lock().retry_attempts
    }

    pub fn record_retry_attempt(&self) {
        self.state.lock().retry_attempts += 1;
    }

    /// When the last heartbeat from this peer was handled.
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.state.lock().last_heartbeat
    }

    pub fn mark_heartbeat_received(&self) {
        self.state.lock().last_heartbeat = Some(Instant::now());
    }

    #[must_use]
    pub fn association(&self) -> Option<Arc<dyn Association>> {
        self.state.lock().association.clone()
    }

    /// Replace the association handle.
    ///
    /// The state-change listener is detached from the previous association
    /// before one is installed on the new association, so a replaced
    /// handle can neither leak notifications nor deliver them twice.
    pub fn set_association(&self, association: Option<Arc<dyn Association>>) {
        let mut state = self.state.lock();

        if let Some(old) = state.association.take() {
            if let Some(token) = state.listener_token.take() {
                old.remove_state_listener(token);
            }
        }

        if let Some(association) = association {
            let sink = self.sink.clone();
            let handle = Arc::clone(&association);
            let token = association.add_state_listener(Box::new(move |new_state| {
                // Owner gone is a no-op.
                if let Some(sink) = sink.upgrade() {
                    sink.on_association_state(&handle, new_state);
                }
            }));
            state.listener_token = Some(token);
            state.association = Some(association);
        }
    }

    /// Create the sub-record for an application user if absent.
    pub fn add_user(&self, user_id: &str) {
        self.state
            .lock()
            .users
            .entry(user_id.to_owned())
            .or_default();
    }

    #[must_use]
    pub fn user(&self, user_id: &str) -> Option<UserRecord> {
        self.state.lock().users.get(user_id).copied()
    }

    /// Flag an ACK as received for a user. Returns false if the user has
    /// no sub-record.
    pub fn set_user_ack(&self, user_id: &str, ack_received: bool) -> bool {
        match self.state.lock().users.get_mut(user_id) {
            Some(record) => {
                record.ack_received = ack_received;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.state.lock().users.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::loopback::LoopbackNetwork;
    use crate::association::AssociationTemplate;
    use crossbeam::channel;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingSink {
        notifications: AtomicUsize,
    }

    impl AssociationStateSink for CountingSink {
        fn on_association_state(&self, _association: &Arc<dyn Association>, _state: AssociationState) {
            self.notifications.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn weak_sink(sink: &Arc<CountingSink>) -> Weak<dyn AssociationStateSink> {
        let weak = Arc::downgrade(sink);
        weak
    }

    fn association_pair(
        network: &LoopbackNetwork,
        a: PeerAddress,
        b: PeerAddress,
    ) -> Arc<dyn Association> {
        let ta = network.template(a);
        let _tb = network.template(b);
        let (tx, rx) = channel::bounded(1);
        ta.create_async(b, Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.recv_timeout(Duration::from_secs(2))
            .expect("create completion")
            .expect("create should succeed")
    }

    #[test]
    fn test_defaults() {
        let sink = Arc::new(CountingSink {
            notifications: AtomicUsize::new(0),
        });
        let conn = PeerConnection::new(addr(5001), weak_sink(&sink));

        assert_eq!(conn.console_id(), CONSOLE_ID_UNKNOWN);
        assert_eq!(conn.name(), "n/a");
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert!(!conn.is_incoming());
        assert!(!conn.is_destroying());
        assert!(conn.association().is_none());
        assert_eq!(conn.retry_attempts(), 0);
    }

    #[test]
    fn test_association_replacement_detaches_old_listener() {
        let network = LoopbackNetwork::new();
        let sink = Arc::new(CountingSink {
            notifications: AtomicUsize::new(0),
        });
        let conn = PeerConnection::new(addr(5011), weak_sink(&sink));

        let first = association_pair(&network, addr(5011), addr(5012));
        conn.set_association(Some(Arc::clone(&first)));

        let second = association_pair(&network, addr(5013), addr(5014));
        conn.set_association(Some(second));

        // Destroying the replaced association must not reach the sink.
        let (tx, rx) = channel::bounded(1);
        first.destroy_async(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.recv_timeout(Duration::from_secs(2))
            .expect("destroy completion")
            .expect("destroy should succeed");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            sink.notifications.load(Ordering::SeqCst),
            0,
            "listener on a replaced association must be detached"
        );
    }

    #[test]
    fn test_association_state_reaches_sink() {
        let network = LoopbackNetwork::new();
        let sink = Arc::new(CountingSink {
            notifications: AtomicUsize::new(0),
        });
        let conn = PeerConnection::new(addr(5021), weak_sink(&sink));

        let association = association_pair(&network, addr(5021), addr(5022));
        conn.set_association(Some(Arc::clone(&association)));

        let (tx, rx) = channel::bounded(1);
        association.destroy_async(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        rx.recv_timeout(Duration::from_secs(2))
            .expect("destroy completion")
            .expect("destroy should succeed");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.notifications.load(Ordering::SeqCst) == 0
            && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sink.notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_user_records() {
        let sink = Arc::new(CountingSink {
            notifications: AtomicUsize::new(0),
        });
        let conn = PeerConnection::new(addr(5031), weak_sink(&sink));

        assert!(conn.user("u1").is_none());
        assert!(!conn.set_user_ack("u1", true), "no record yet");

        conn.add_user("u1");
        assert!(!conn.user("u1").expect("record exists").ack_received);

        assert!(conn.set_user_ack("u1", true));
        assert!(conn.user("u1").expect("record exists").ack_received);

        conn.add_user("u1");
        assert!(
            conn.user("u1").expect("record exists").ack_received,
            "re-adding an existing user must not reset the flag"
        );
        assert_eq!(conn.user_ids(), vec!["u1".to_owned()]);
    }
}
