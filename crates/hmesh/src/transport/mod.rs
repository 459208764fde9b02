// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet transport: one UDP socket, a send queue, a pending-ACK table and
//! two worker threads.
//!
//! The send worker is wake-driven: every enqueue signals it, so reliable
//! and latency-sensitive sends are not delayed by timer scheduling, and it
//! drains the whole queue per wake. The receive worker polls the
//! non-blocking socket as fast as possible; each datagram may carry
//! several back-to-back packets and is walked on `message_size`.
//!
//! Reliable delivery: the sender sets the top id bit and keeps the framed
//! packet in the pending table until the matching ACK returns; the
//! receiver answers any reliable packet with an immediate ACK. Retries are
//! wholesale re-sends of the whole table on a >= 1 s cadence driven by the
//! owning coordinator. Transport-level failures are logged and dropped -
//! the workers never stop over a single bad packet.

pub mod filter;
pub(crate) mod pending;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::association::Association;
use crate::config::{
    CUSTOM_SUBTYPE_MAX, DEFAULT_HEARTBEAT_SIZE, HEADER_LEN, RECV_BUFFER_SIZE, RETRY_INTERVAL_MS,
};
use crate::mesh::connection::{ConnectionStatus, PeerConnection};
use crate::telemetry::PacketStatistics;
use crate::wire::{self, MessageType, PacketHeader, PacketWalker};
use crate::worker::{PeriodicWorker, WakeHandle, WorkerOptions, PERIOD_WAKE_ONLY};
use crate::{Error, Result};

use self::pending::{PendingAckTable, PendingPacket};

/// Typed packet event raised toward the owning coordinator.
pub(crate) enum PacketEvent {
    Heartbeat {
        sender: Arc<PeerConnection>,
    },
    Hello {
        sender: Arc<PeerConnection>,
        console_id: u8,
        name: String,
        is_reply: bool,
    },
    Chat {
        sender: Arc<PeerConnection>,
        payload: Vec<u8>,
    },
    Ack {
        sender: Arc<PeerConnection>,
        message_id: u16,
    },
    Custom {
        sender: Arc<PeerConnection>,
        subtype: u8,
        payload: Vec<u8>,
    },
    Debug {
        message: String,
        code: i32,
    },
}

/// Non-owning view of the coordinator, resolved at call time.
pub(crate) trait TransportHost: Send + Sync {
    fn connection_by_console_id(&self, console_id: u8) -> Option<Arc<PeerConnection>>;
    fn connection_by_socket_addr(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>>;
    fn on_packet_event(&self, event: PacketEvent);
}

struct OutboundPacket {
    association: Arc<dyn Association>,
    bytes: Vec<u8>,
}

struct TransportInner {
    socket: UdpSocket,
    local_console_id: u8,
    next_message_id: AtomicU32,
    previous_id: Mutex<u16>,
    drop_out_of_order: AtomicBool,
    heartbeat_size: AtomicUsize,
    queue: Mutex<VecDeque<OutboundPacket>>,
    pending: PendingAckTable,
    last_retry: Mutex<Option<Instant>>,
    stats: Arc<PacketStatistics>,
    host: Mutex<Option<Weak<dyn TransportHost>>>,
    send_wake: OnceLock<WakeHandle>,
}

/// Owns the socket, the outbound queue, the pending-ACK table and the
/// send/receive workers.
pub struct PacketTransport {
    inner: Arc<TransportInner>,
    send_worker: PeriodicWorker,
    recv_worker: PeriodicWorker,
    shut_down: AtomicBool,
}

impl PacketTransport {
    /// Bind the socket and start both workers.
    pub(crate) fn new(local_console_id: u8, port: u16, drop_out_of_order: bool) -> Result<Self> {
        let socket = bind_socket(port)?;
        log::debug!(
            "[pkt] transport bound to {:?} console_id={} drop_out_of_order={}",
            socket.local_addr().ok(),
            local_console_id,
            drop_out_of_order
        );

        let inner = Arc::new(TransportInner {
            socket,
            local_console_id,
            next_message_id: AtomicU32::new(0),
            previous_id: Mutex::new(0),
            drop_out_of_order: AtomicBool::new(drop_out_of_order),
            heartbeat_size: AtomicUsize::new(DEFAULT_HEARTBEAT_SIZE),
            queue: Mutex::new(VecDeque::new()),
            pending: PendingAckTable::new(),
            last_retry: Mutex::new(None),
            stats: Arc::new(PacketStatistics::new()),
            host: Mutex::new(None),
            send_wake: OnceLock::new(),
        });

        let send_inner = Arc::clone(&inner);
        let send_worker = PeriodicWorker::spawn(
            "pkt-send",
            WorkerOptions::with_period(PERIOD_WAKE_ONLY),
            move || send_inner.drain_send_queue(),
        );
        let _ = inner.send_wake.set(send_worker.wake_handle());

        let recv_inner = Arc::clone(&inner);
        let mut recv_buffer = vec![0u8; RECV_BUFFER_SIZE];
        let recv_worker = PeriodicWorker::spawn("pkt-recv", WorkerOptions::with_period(0), move || {
            recv_inner.receive_once(&mut recv_buffer);
        });

        Ok(Self {
            inner,
            send_worker,
            recv_worker,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Attach the owning coordinator. Events are dropped until set.
    pub(crate) fn set_host(&self, host: Weak<dyn TransportHost>) {
        *self.inner.host.lock() = Some(host);
    }

    #[must_use]
    pub fn local_console_id(&self) -> u8 {
        self.inner.local_console_id
    }

    /// Shared telemetry for this transport.
    #[must_use]
    pub fn statistics(&self) -> Arc<PacketStatistics> {
        Arc::clone(&self.inner.stats)
    }

    /// Toggle the duplicate/out-of-order filter.
    pub fn set_drop_out_of_order(&self, enabled: bool) {
        self.inner.drop_out_of_order.store(enabled, Ordering::Relaxed);
    }

    /// Heartbeat padding payload size in bytes.
    #[must_use]
    pub fn heartbeat_size(&self) -> usize {
        self.inner.heartbeat_size.load(Ordering::Relaxed)
    }

    pub fn set_heartbeat_size(&self, size: usize) {
        self.inner.heartbeat_size.store(size, Ordering::Relaxed);
    }

    /// Id of the most recently accepted incoming packet (diagnostics).
    #[must_use]
    pub fn previous_message_id(&self) -> u16 {
        *self.inner.previous_id.lock()
    }

    /// Reliable packets still awaiting an ACK.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    pub(crate) fn send_hello(
        &self,
        association: &Arc<dyn Association>,
        name: &str,
        is_reply: bool,
    ) -> Result<()> {
        let payload = wire::encode_hello(name, is_reply);
        self.queue_packet(association, MessageType::Hello, &payload, false)
    }

    pub(crate) fn send_heartbeat(
        &self,
        association: &Arc<dyn Association>,
        console_id: u8,
    ) -> Result<()> {
        let padding = vec![0u8; self.heartbeat_size()];
        self.queue_packet(association, MessageType::Heartbeat, &padding, false)?;
        self.inner.stats.mark_heartbeat_sent(console_id);
        Ok(())
    }

    pub(crate) fn send_chat(
        &self,
        association: &Arc<dyn Association>,
        payload: &[u8],
        reliable: bool,
    ) -> Result<()> {
        self.queue_packet(association, MessageType::Chat, payload, reliable)
    }

    pub(crate) fn send_custom(
        &self,
        association: &Arc<dyn Association>,
        subtype: u8,
        payload: &[u8],
        reliable: bool,
    ) -> Result<()> {
        if subtype > CUSTOM_SUBTYPE_MAX {
            return Err(Error::InvalidArgument(format!(
                "custom subtype {subtype} exceeds maximum {CUSTOM_SUBTYPE_MAX}"
            )));
        }
        self.queue_packet(association, MessageType::Custom(subtype), payload, reliable)
    }

    fn queue_packet(
        &self,
        association: &Arc<dyn Association>,
        ty: MessageType,
        payload: &[u8],
        reliable: bool,
    ) -> Result<()> {
        if payload.len() > u16::MAX as usize - HEADER_LEN {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes does not fit one packet",
                payload.len()
            )));
        }

        let id = self.inner.next_id();
        let bytes = wire::frame(id, ty, self.inner.local_console_id, reliable, payload);

        if reliable {
            // No-op if an entry with this id is already pending.
            self.inner.pending.insert(Arc::new(PendingPacket {
                message_id: id,
                association: Arc::clone(association),
                bytes: bytes.clone(),
            }));
        }

        self.inner.enqueue(OutboundPacket {
            association: Arc::clone(association),
            bytes,
        });
        Ok(())
    }

    /// Re-enqueue every pending reliable packet, wholesale.
    ///
    /// Expected roughly once per second from the coordinator's timer; an
    /// internal gate absorbs faster callers. No backoff, no retry cap -
    /// entries persist until ACKed or their connection is torn down.
    pub(crate) fn retry_unacknowledged(&self) {
        {
            let mut last = self.inner.last_retry.lock();
            let due = match *last {
                Some(at) => at.elapsed() >= Duration::from_millis(RETRY_INTERVAL_MS),
                None => true,
            };
            if !due {
                return;
            }
            *last = Some(Instant::now());
        }

        let pending = self.inner.pending.snapshot();
        if pending.is_empty() {
            return;
        }
        log::debug!("[pkt] re-sending {} unacknowledged packets", pending.len());
        for packet in pending {
            self.inner.enqueue(OutboundPacket {
                association: Arc::clone(&packet.association),
                bytes: packet.bytes.clone(),
            });
        }
    }

    /// Drop pending entries addressed to a torn-down association.
    pub(crate) fn discard_pending_for(&self, association: &Arc<dyn Association>) {
        let discarded = self.inner.pending.discard_for(association);
        if discarded > 0 {
            log::debug!(
                "[pkt] discarded {} pending packets for {}",
                discarded,
                association.remote_address()
            );
        }
    }

    pub(crate) fn clear_pending(&self) {
        self.inner.pending.clear();
    }

    /// Stop both workers, send before receive, ahead of socket release.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("[pkt] transport shutting down");
        self.send_worker.shutdown();
        self.recv_worker.shutdown();
    }
}

impl Drop for PacketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TransportInner {
    /// Next sequence id from the shared counter, wrapping mod 65536 with
    /// the reliable bit kept clear.
    fn next_id(&self) -> u16 {
        (self.next_message_id.fetch_add(1, Ordering::Relaxed) as u16).wrapping_add(1)
            & !crate::config::RELIABLE_BIT
    }

    fn enqueue(&self, packet: OutboundPacket) {
        self.queue.lock().push_back(packet);
        if let Some(wake) = self.send_wake.get() {
            wake.wake();
        }
    }

    fn host(&self) -> Option<Arc<dyn TransportHost>> {
        self.host.lock().as_ref().and_then(Weak::upgrade)
    }

    fn emit_debug(&self, message: String, code: i32) {
        log::debug!("[pkt] {message}");
        if let Some(host) = self.host() {
            host.on_packet_event(PacketEvent::Debug { message, code });
        }
    }

    fn drain_send_queue(&self) {
        loop {
            let packet = self.queue.lock().pop_front();
            let Some(packet) = packet else { break };
            self.process_send(&packet);
        }
    }

    fn process_send(&self, packet: &OutboundPacket) {
        let Some(header) = PacketHeader::parse(&packet.bytes) else {
            self.emit_debug("dropping outbound packet without a header".into(), -1);
            return;
        };

        let dest = packet.association.remote_address().socket_addr();
        self.stats.record_packet(&header, true);

        match self.socket.send_to(&packet.bytes, dest) {
            Ok(sent) if sent != packet.bytes.len() => {
                self.emit_debug(
                    format!(
                        "short send to {dest}: {sent} of {} bytes",
                        packet.bytes.len()
                    ),
                    -1,
                );
            }
            Ok(_) => {}
            Err(err) => {
                self.emit_debug(
                    format!("send_to {dest} failed: {err}"),
                    err.raw_os_error().unwrap_or(-1),
                );
            }
        }
    }

    fn receive_once(&self, buf: &mut [u8]) {
        let (len, sender_addr) = match self.socket.recv_from(buf) {
            Ok((0, _)) => return,
            Ok(received) => received,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Nothing queued; yield instead of spinning the core.
                thread::sleep(Duration::from_millis(1));
                return;
            }
            Err(err) => {
                log::debug!("[pkt] recv_from failed: {err}");
                return;
            }
        };

        let Some(host) = self.host() else { return };
        let data = &buf[..len];

        let Some(first) = PacketHeader::parse(data) else {
            self.emit_debug(format!("runt datagram ({len} bytes) from {sender_addr}"), -1);
            return;
        };

        // Fast O(1) lookup by the sender's console id, falling back to the
        // source socket address when the sender did not stamp one.
        let sender = if first.sender_unknown() {
            None
        } else {
            host.connection_by_console_id(first.console_id)
        }
        .or_else(|| host.connection_by_socket_addr(sender_addr));

        let Some(sender) = sender else {
            // Expected transiently when a packet beats the incoming-
            // association event; the peer re-sends next tick.
            self.emit_debug(format!("datagram from unknown peer {sender_addr}"), -1);
            return;
        };

        match sender.status() {
            ConnectionStatus::Disconnected | ConnectionStatus::Pending => {
                self.emit_debug(
                    format!("datagram from not-yet-connected peer {}", sender.name()),
                    -1,
                );
                return;
            }
            ConnectionStatus::Connected | ConnectionStatus::PostHandshake => {}
        }

        let mut walker = PacketWalker::new(data);
        while let Some((header, payload)) = walker.next_packet() {
            self.process_packet(&host, &sender, header, payload);
        }
        if walker.truncated() {
            self.emit_debug(format!("malformed packet in datagram from {sender_addr}"), -1);
        }
    }

    fn process_packet(
        &self,
        host: &Arc<dyn TransportHost>,
        sender: &Arc<PeerConnection>,
        header: PacketHeader,
        payload: &[u8],
    ) {
        let reliable = header.is_reliable();
        let header = PacketHeader {
            message_id: header.logical_id(),
            ..header
        };
        let id = header.message_id;

        if reliable {
            // Answer before any filtering: the sender keeps retrying until
            // this ACK arrives, duplicates included.
            match sender.association() {
                Some(association) => self.send_ack(&association, id),
                None => self.emit_debug(
                    format!("cannot ACK {}: no association for {}", id, sender.name()),
                    -1,
                ),
            }
        }

        // An ACK's id names the packet being acknowledged, so the order
        // filter and cursor must ignore it.
        if header.message_type != MessageType::Ack.to_wire() {
            let verdict = {
                let mut previous = self.previous_id.lock();
                let verdict = if self.drop_out_of_order.load(Ordering::Relaxed) {
                    filter::judge(*previous, id)
                } else {
                    filter::Verdict::Accept {
                        skipped: filter::forward_gap(*previous, id),
                    }
                };
                if let filter::Verdict::Accept { .. } = verdict {
                    *previous = id;
                }
                verdict
            };

            self.stats.record_packet(&header, false);
            match verdict {
                filter::Verdict::Drop => {
                    self.stats.record_dropped(header.message_type, 1);
                    return;
                }
                filter::Verdict::Accept { skipped } if skipped > 0 => {
                    self.stats.record_skipped(header.message_type, u64::from(skipped));
                }
                filter::Verdict::Accept { .. } => {}
            }
        }

        match MessageType::from_wire(header.message_type) {
            Some(MessageType::Heartbeat) => {
                host.on_packet_event(PacketEvent::Heartbeat {
                    sender: Arc::clone(sender),
                });
            }
            Some(MessageType::Hello) => match wire::decode_hello(payload) {
                Some(hello) => {
                    host.on_packet_event(PacketEvent::Hello {
                        sender: Arc::clone(sender),
                        console_id: header.console_id,
                        name: hello.name,
                        is_reply: hello.is_reply,
                    });
                }
                None => self.emit_debug(format!("malformed hello from {}", sender.name()), -1),
            },
            Some(MessageType::Chat) => {
                host.on_packet_event(PacketEvent::Chat {
                    sender: Arc::clone(sender),
                    payload: payload.to_vec(),
                });
            }
            Some(MessageType::Ack) => {
                // Unknown ids are a no-op: the entry may already be gone
                // from an earlier duplicate ACK.
                self.pending.remove(id);
                host.on_packet_event(PacketEvent::Ack {
                    sender: Arc::clone(sender),
                    message_id: id,
                });
            }
            Some(MessageType::Custom(subtype)) => {
                host.on_packet_event(PacketEvent::Custom {
                    sender: Arc::clone(sender),
                    subtype,
                    payload: payload.to_vec(),
                });
            }
            None => {
                self.emit_debug(
                    format!("invalid packet type {} from {}", header.message_type, sender.name()),
                    -1,
                );
            }
        }
    }

    /// ACK overloads the header id as "id being acknowledged" and has no
    /// payload or sequence id of its own.
    fn send_ack(&self, association: &Arc<dyn Association>, message_id_to_ack: u16) {
        let bytes = wire::frame(
            message_id_to_ack,
            MessageType::Ack,
            self.local_console_id,
            false,
            &[],
        );
        self.enqueue(OutboundPacket {
            association: Arc::clone(association),
            bytes,
        });
    }
}

fn bind_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket
        .bind(&bind_addr.into())
        .map_err(|err| Error::BindFailed(format!("{bind_addr}: {err}")))?;
    Ok(socket.into())
}
