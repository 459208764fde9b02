// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh coordinator: the connection collection and its lifecycle machine.
//!
//! Owns the [`PacketTransport`] and two more periodic workers. The
//! auto-connect worker requests an association for every disconnected
//! outbound peer once per second and drives the reliable-retry tick; the
//! heartbeat worker reconciles the local view against the association
//! layer, keeps the hello handshake going and heartbeats every
//! post-handshake peer.
//!
//! Connection status walks `Disconnected -> Connected -> PostHandshake`
//! (`Pending` is reserved for an offered-but-unaccepted association), with
//! an orthogonal destroying flag. The coordinator never deletes a record
//! on its own: losing an association only forces `Disconnected` and emits
//! an event; the application must call [`MeshCoordinator::destroy_connection`].
//!
//! All public events arrive on one enum-tagged channel, see [`MeshEvent`].

pub mod connection;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::association::{
    Association, AssociationState, AssociationTemplate, PeerAddress,
};
use crate::config::{AUTO_CONNECT_PERIOD_MS, CONSOLE_ID_MAX, CONSOLE_ID_UNKNOWN, DEFAULT_HEARTBEAT_PERIOD_MS};
use crate::telemetry::PacketStatistics;
use crate::transport::{PacketEvent, PacketTransport, TransportHost};
use crate::worker::{PeriodicWorker, WorkerOptions};
use crate::{Error, Result};

use self::connection::{AssociationStateSink, ConnectionStatus, PeerConnection};

/// Connection-lifecycle and payload events delivered to the application.
pub enum MeshEvent {
    /// The connection lost its association and was forced `Disconnected`.
    /// The record stays in the collection until explicitly destroyed.
    Disconnected(Arc<PeerConnection>),
    /// Both sides have exchanged hellos; fired once per handshake.
    PostHandshake(Arc<PeerConnection>),
    Heartbeat(Arc<PeerConnection>),
    Chat {
        from: Arc<PeerConnection>,
        payload: Vec<u8>,
    },
    Custom {
        from: Arc<PeerConnection>,
        subtype: u8,
        payload: Vec<u8>,
    },
    /// Diagnostic stream; `code` 0 is informational, anything else is an
    /// error indication from the failing layer.
    Debug { message: String, code: i32 },
}

/// Construction parameters for [`MeshCoordinator`].
pub struct MeshConfig {
    /// Local console id, 0 to 254.
    pub local_console_id: u8,
    /// Local display name sent in hellos.
    pub local_name: String,
    /// Enable the duplicate/out-of-order filter.
    pub drop_out_of_order: bool,
    /// Heartbeat/hello worker period in milliseconds.
    pub heartbeat_period_ms: u32,
}

impl MeshConfig {
    #[must_use]
    pub fn new(local_console_id: u8, local_name: &str) -> Self {
        Self {
            local_console_id,
            local_name: local_name.to_owned(),
            drop_out_of_order: false,
            heartbeat_period_ms: DEFAULT_HEARTBEAT_PERIOD_MS,
        }
    }
}

/// Coordinates peer connections over one association template.
pub struct MeshCoordinator {
    local_console_id: u8,
    local_name: Mutex<String>,
    template: Arc<dyn AssociationTemplate>,
    transport: PacketTransport,
    connections: Mutex<Vec<Arc<PeerConnection>>>,
    events_tx: Sender<MeshEvent>,
    events_rx: Receiver<MeshEvent>,
    auto_connect_worker: Mutex<Option<PeriodicWorker>>,
    heartbeat_worker: Mutex<Option<PeriodicWorker>>,
    shut_down: AtomicBool,
    /// Handed to workers, records and the transport as a non-owning
    /// back-reference; an upgrade failure means the owner is gone and the
    /// call becomes a no-op.
    self_weak: Weak<MeshCoordinator>,
}

impl MeshCoordinator {
    /// Build the coordinator, bind the transport to the template's port
    /// and start the auto-connect and heartbeat workers.
    pub fn new(config: MeshConfig, template: Arc<dyn AssociationTemplate>) -> Result<Arc<Self>> {
        if config.local_console_id > CONSOLE_ID_MAX {
            return Err(Error::InvalidArgument(format!(
                "console id {} is reserved ({CONSOLE_ID_UNKNOWN} means unknown)",
                config.local_console_id
            )));
        }

        let transport = PacketTransport::new(
            config.local_console_id,
            template.bound_port(),
            config.drop_out_of_order,
        )?;
        let (events_tx, events_rx) = channel::unbounded();

        let coordinator = Arc::new_cyclic(|self_weak| Self {
            local_console_id: config.local_console_id,
            local_name: Mutex::new(config.local_name),
            template,
            transport,
            connections: Mutex::new(Vec::new()),
            events_tx,
            events_rx,
            auto_connect_worker: Mutex::new(None),
            heartbeat_worker: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            self_weak: self_weak.clone(),
        });

        let host_weak = Arc::downgrade(&coordinator);
        let host: Weak<dyn TransportHost> = host_weak;
        coordinator.transport.set_host(host);

        let weak = Arc::downgrade(&coordinator);
        coordinator.template.on_incoming(Box::new(move |association| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.handle_incoming_association(association);
            }
        }));

        let weak = Arc::downgrade(&coordinator);
        let auto_connect = PeriodicWorker::spawn(
            "mesh-connect",
            WorkerOptions::with_period(AUTO_CONNECT_PERIOD_MS),
            move || {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.auto_connect_tick();
                }
            },
        );
        *coordinator.auto_connect_worker.lock() = Some(auto_connect);

        let weak = Arc::downgrade(&coordinator);
        let heartbeat = PeriodicWorker::spawn(
            "mesh-heartbeat",
            WorkerOptions::with_period(config.heartbeat_period_ms),
            move || {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.heartbeat_tick();
                }
            },
        );
        *coordinator.heartbeat_worker.lock() = Some(heartbeat);

        log::debug!(
            "[mesh] coordinator up as {}",
            coordinator.local_display_name()
        );
        Ok(coordinator)
    }

    // ===== Public surface =====

    /// Event stream. Each event is consumed by a single receiver; clone
    /// the receiver for competing consumers.
    #[must_use]
    pub fn events(&self) -> &Receiver<MeshEvent> {
        &self.events_rx
    }

    #[must_use]
    pub fn local_console_id(&self) -> u8 {
        self.local_console_id
    }

    #[must_use]
    pub fn local_name(&self) -> String {
        self.local_name.lock().clone()
    }

    pub fn set_local_name(&self, name: &str) {
        *self.local_name.lock() = name.to_owned();
    }

    /// Name peers see in hellos: `"{name} [{console id}]"`.
    #[must_use]
    pub fn local_display_name(&self) -> String {
        format!("{} [{}]", self.local_name(), self.local_console_id)
    }

    /// Telemetry shared with the transport.
    #[must_use]
    pub fn statistics(&self) -> Arc<PacketStatistics> {
        self.transport.statistics()
    }

    /// The packet transport owned by this coordinator.
    #[must_use]
    pub fn transport(&self) -> &PacketTransport {
        &self.transport
    }

    #[must_use]
    pub fn heartbeat_period_ms(&self) -> u32 {
        self.heartbeat_worker
            .lock()
            .as_ref()
            .map_or(0, PeriodicWorker::period_ms)
    }

    pub fn set_heartbeat_period_ms(&self, period_ms: u32) {
        if let Some(worker) = self.heartbeat_worker.lock().as_ref() {
            worker.set_period_ms(period_ms);
        }
    }

    /// Heartbeat padding payload size (bytes).
    #[must_use]
    pub fn heartbeat_size(&self) -> usize {
        self.transport.heartbeat_size()
    }

    pub fn set_heartbeat_size(&self, size: usize) {
        self.transport.set_heartbeat_size(size);
    }

    /// Toggle the duplicate/out-of-order filter at runtime.
    pub fn set_drop_out_of_order(&self, enabled: bool) {
        self.transport.set_drop_out_of_order(enabled);
    }

    /// Track a peer and keep requesting an association until one exists.
    ///
    /// Returns the new record, or the existing one if the address is
    /// already tracked (at most one record per address). Connecting to the
    /// local endpoint is refused.
    pub fn connect_to(&self, address: PeerAddress, debug_name: &str) -> Result<Arc<PeerConnection>> {
        if address == self.template.local_address() {
            return Err(Error::InvalidArgument(
                "cannot connect to the local endpoint".into(),
            ));
        }

        self.debug(format!("connect_to: {debug_name} at {address}"), 0);
        let (conn, created) =
            self.add_connection(address, None, false, ConnectionStatus::Disconnected);
        if created {
            // Placeholder until the handshake learns the real name.
            conn.set_name(debug_name);
        }
        Ok(conn)
    }

    /// All tracked connections, optionally filtered by status.
    #[must_use]
    pub fn connections(&self, status: Option<ConnectionStatus>) -> Vec<Arc<PeerConnection>> {
        let connections = self.connections.lock();
        match status {
            None => connections.clone(),
            Some(status) => connections
                .iter()
                .filter(|c| c.status() == status)
                .cloned()
                .collect(),
        }
    }

    #[must_use]
    pub fn connection_by_address(&self, address: PeerAddress) -> Option<Arc<PeerConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.address() == address)
            .cloned()
    }

    #[must_use]
    pub fn connection_by_console_id(&self, console_id: u8) -> Option<Arc<PeerConnection>> {
        self.connections
            .lock()
            .iter()
            .find(|c| c.console_id() == console_id)
            .cloned()
    }

    /// Connection owning an association, matched by remote address.
    #[must_use]
    pub fn connection_by_association(
        &self,
        association: &Arc<dyn Association>,
    ) -> Option<Arc<PeerConnection>> {
        self.connection_by_address(association.remote_address())
    }

    /// Send a chat payload to a peer.
    pub fn send_chat(
        &self,
        conn: &Arc<PeerConnection>,
        payload: &[u8],
        reliable: bool,
    ) -> Result<()> {
        let association = conn.association().ok_or(Error::NotConnected)?;
        self.transport.send_chat(&association, payload, reliable)
    }

    /// Send an application-defined payload (subtype 0..=191) to a peer.
    pub fn send_custom(
        &self,
        conn: &Arc<PeerConnection>,
        subtype: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<()> {
        let association = conn.association().ok_or(Error::NotConnected)?;
        self.transport
            .send_custom(&association, subtype, payload, reliable)
    }

    /// Tear down a connection's association, wait for the teardown and
    /// remove the record.
    ///
    /// If teardown is already underway (a previous destroy call or a
    /// remote-side state change), the association-destroy request is
    /// skipped and only the local cleanup runs; a repeat call on an
    /// already-removed connection is a no-op.
    pub fn destroy_connection(&self, conn: &Arc<PeerConnection>) {
        if let Some(association) = conn.association() {
            if !conn.is_destroying() {
                conn.set_destroying(true);
                let (done_tx, done_rx) = channel::bounded(1);
                association.destroy_async(Box::new(move |result| {
                    let _ = done_tx.send(result);
                }));
                match done_rx.recv() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        self.debug(format!("destroy of {} failed: {err}", conn.name()), -1);
                    }
                    Err(_) => {
                        self.debug(
                            format!("destroy of {} never completed", conn.name()),
                            -1,
                        );
                    }
                }
            }
            self.transport.discard_pending_for(&association);
            conn.set_association(None);
        }

        self.remove_connection(conn);
        self.debug(format!("destroyed connection to {}", conn.name()), 0);
    }

    /// Destroy every connection and clear the whole pending-ACK table.
    pub fn destroy_and_disconnect_all(&self) {
        for conn in self.connections(None) {
            self.destroy_connection(&conn);
        }
        self.connections.lock().clear();
        self.transport.clear_pending();
    }

    /// Stop the mesh workers, detach from the association layer and shut
    /// the transport down. Idempotent; teardown order is fixed: timed
    /// workers first, socket workers last.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("[mesh] coordinator shutting down");

        if let Some(worker) = self.auto_connect_worker.lock().take() {
            worker.shutdown();
        }
        if let Some(worker) = self.heartbeat_worker.lock().take() {
            worker.shutdown();
        }
        self.template.clear_incoming();
        self.transport.shutdown();
    }

    // ===== Worker ticks =====

    fn auto_connect_tick(&self) {
        self.transport.retry_unacknowledged();

        for conn in self.connections(Some(ConnectionStatus::Disconnected)) {
            // Peers that connected to us reconnect from their side; a
            // second association would race the first.
            if conn.is_incoming() || conn.is_in_progress() || conn.association().is_some() {
                continue;
            }

            conn.set_in_progress(true);
            conn.record_retry_attempt();
            self.debug(format!("auto-connect: requesting association to {}", conn.name()), 0);

            let weak = self.self_weak.clone();
            let pending = Arc::clone(&conn);
            self.template.create_async(
                conn.address(),
                Box::new(move |result| {
                    match weak.upgrade() {
                        Some(coordinator) => coordinator.finish_outbound_connect(&pending, result),
                        None => pending.set_in_progress(false),
                    }
                }),
            );
        }
    }

    fn finish_outbound_connect(
        &self,
        conn: &Arc<PeerConnection>,
        result: Result<Arc<dyn Association>>,
    ) {
        match result {
            Ok(association) => {
                // Prefer the current record for this address in case ours
                // was destroyed while the create was in flight.
                let target = self
                    .connection_by_address(association.remote_address())
                    .unwrap_or_else(|| Arc::clone(conn));
                target.set_association(Some(association));
                target.set_status(ConnectionStatus::Connected);
                self.debug(format!("association created for {}", target.name()), 0);
            }
            Err(err) => {
                // Stays Disconnected; the next tick retries.
                self.debug(
                    format!("association to {} failed: {err}", conn.name()),
                    -1,
                );
            }
        }
        conn.set_in_progress(false);
    }

    fn heartbeat_tick(&self) {
        self.refresh_connections();

        let display_name = self.local_display_name();
        for conn in self.connections(Some(ConnectionStatus::Connected)) {
            // Hello until the handshake completes; the peer's reply moves
            // the record to PostHandshake.
            if let Some(association) = conn.association() {
                if let Err(err) = self.transport.send_hello(&association, &display_name, false) {
                    log::debug!("[mesh] hello to {} failed: {err}", conn.name());
                }
            }
        }

        for conn in self.connections(Some(ConnectionStatus::PostHandshake)) {
            if let Some(association) = conn.association() {
                if let Err(err) = self.transport.send_heartbeat(&association, conn.console_id()) {
                    log::debug!("[mesh] heartbeat to {} failed: {err}", conn.name());
                }
            }
        }
    }

    /// Reconcile the local collection against the association layer's
    /// enumeration.
    fn refresh_connections(&self) {
        for conn in self.connections(None) {
            conn.set_found_in_template(false);
        }

        for association in self.template.associations() {
            match self.connection_by_association(&association) {
                Some(conn) => {
                    conn.set_found_in_template(true);
                    let status = conn.status();
                    if status != ConnectionStatus::Connected
                        && status != ConnectionStatus::PostHandshake
                    {
                        // Should not happen: the layer knows an association
                        // we never created or accepted. Adopt it.
                        log::error!(
                            "[mesh] association for {} present without a tracked create",
                            association.remote_address()
                        );
                        self.debug(
                            format!(
                                "consistency error: adopting untracked association for {}",
                                association.remote_address()
                            ),
                            -1,
                        );
                        conn.set_status(ConnectionStatus::Connected);
                        conn.set_association(Some(association));
                    }
                }
                None => {
                    log::error!(
                        "[mesh] association for {} has no connection record",
                        association.remote_address()
                    );
                    self.debug(
                        format!(
                            "consistency error: association for {} not in connection list",
                            association.remote_address()
                        ),
                        -1,
                    );
                }
            }
        }

        for conn in self.connections(None) {
            if !conn.found_in_template()
                && conn.status() != ConnectionStatus::Pending
                && conn.status() != ConnectionStatus::Disconnected
            {
                // Force Disconnected and tell the application; the record
                // stays until an explicit destroy.
                self.debug(
                    format!("{} vanished from the association layer", conn.name()),
                    0,
                );
                conn.set_status(ConnectionStatus::Disconnected);
                self.emit(MeshEvent::Disconnected(conn));
            }
        }
    }

    // ===== Packet handling =====

    fn handle_incoming_association(&self, association: Arc<dyn Association>) {
        let address = association.remote_address();
        self.debug(format!("incoming association from {address}"), 0);
        let (_, created) = self.add_connection(
            address,
            Some(association),
            true,
            ConnectionStatus::Connected,
        );
        if created {
            self.refresh_connections();
        }
    }

    fn handle_hello(
        &self,
        sender: &Arc<PeerConnection>,
        console_id: u8,
        name: &str,
        is_reply: bool,
    ) {
        let Some(association) = sender.association() else {
            return;
        };
        self.debug(
            format!("hello from {name} (console {console_id}, reply={is_reply})"),
            0,
        );

        if console_id != CONSOLE_ID_UNKNOWN {
            sender.set_console_id(console_id);
        }
        if !name.is_empty() {
            sender.set_name(name);
        }

        // One bounded round: an original hello earns a reply, a reply
        // earns nothing.
        if !is_reply {
            if let Err(err) =
                self.transport
                    .send_hello(&association, &self.local_display_name(), true)
            {
                log::debug!("[mesh] hello reply failed: {err}");
            }
        }

        if sender.status() != ConnectionStatus::PostHandshake {
            sender.set_status(ConnectionStatus::PostHandshake);
            self.debug(format!("handshake complete with {}", sender.name()), 0);
            self.emit(MeshEvent::PostHandshake(Arc::clone(sender)));
        }
    }

    // ===== Internals =====

    fn add_connection(
        &self,
        address: PeerAddress,
        association: Option<Arc<dyn Association>>,
        incoming: bool,
        status: ConnectionStatus,
    ) -> (Arc<PeerConnection>, bool) {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.iter().find(|c| c.address() == address) {
            return (Arc::clone(existing), false);
        }

        let sink: Weak<dyn AssociationStateSink> = self.self_weak.clone();
        let conn = Arc::new(PeerConnection::new(address, sink));
        conn.set_incoming(incoming);
        conn.set_status(status);
        conn.set_association(association);
        connections.push(Arc::clone(&conn));
        (conn, true)
    }

    fn remove_connection(&self, conn: &Arc<PeerConnection>) {
        self.connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, conn));
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events_tx.send(event);
    }

    fn debug(&self, message: String, code: i32) {
        log::debug!("[mesh] {message}");
        self.emit(MeshEvent::Debug { message, code });
    }
}

impl Drop for MeshCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TransportHost for MeshCoordinator {
    fn connection_by_console_id(&self, console_id: u8) -> Option<Arc<PeerConnection>> {
        MeshCoordinator::connection_by_console_id(self, console_id)
    }

    fn connection_by_socket_addr(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
        self.connection_by_address(PeerAddress::new(addr))
    }

    fn on_packet_event(&self, event: PacketEvent) {
        match event {
            PacketEvent::Heartbeat { sender } => {
                sender.mark_heartbeat_received();
                self.emit(MeshEvent::Heartbeat(sender));
            }
            PacketEvent::Hello {
                sender,
                console_id,
                name,
                is_reply,
            } => {
                self.handle_hello(&sender, console_id, &name, is_reply);
            }
            PacketEvent::Chat { sender, payload } => {
                self.emit(MeshEvent::Chat {
                    from: sender,
                    payload,
                });
            }
            PacketEvent::Ack { sender, message_id } => {
                // The transport already cleared the pending entry.
                log::debug!(
                    "[mesh] ack {} from {}",
                    message_id,
                    sender.name()
                );
            }
            PacketEvent::Custom {
                sender,
                subtype,
                payload,
            } => {
                self.emit(MeshEvent::Custom {
                    from: sender,
                    subtype,
                    payload,
                });
            }
            PacketEvent::Debug { message, code } => {
                self.emit(MeshEvent::Debug { message, code });
            }
        }
    }
}

impl AssociationStateSink for MeshCoordinator {
    fn on_association_state(&self, association: &Arc<dyn Association>, state: AssociationState) {
        if !state.is_teardown() {
            return;
        }

        let Some(conn) = self.connection_by_association(association) else {
            log::debug!(
                "[mesh] state change {state:?} for unknown association {}",
                association.remote_address()
            );
            return;
        };

        self.debug(
            format!("{} is disconnecting ({state:?})", conn.name()),
            0,
        );
        conn.set_destroying(true);
        conn.set_status(ConnectionStatus::Disconnected);
        self.emit(MeshEvent::Disconnected(conn));
    }
}
