// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Table of reliable packets awaiting an ACK.
//!
//! Entries are keyed by the logical sequence id (reliable bit cleared);
//! insertion is a no-op when the id is already present, and an ACK for an
//! unknown id is a no-op rather than an error. The retry path re-sends
//! every entry wholesale; entries disappear only on ACK or when their
//! connection is torn down.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::association::Association;

/// One reliable packet awaiting acknowledgement.
pub(crate) struct PendingPacket {
    /// Logical id (reliable bit cleared) used for ACK matching.
    pub message_id: u16,
    /// Destination; resolved again on every retry.
    pub association: Arc<dyn Association>,
    /// Fully framed bytes, reliable bit set, resent verbatim.
    pub bytes: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct PendingAckTable {
    entries: Mutex<Vec<Arc<PendingPacket>>>,
}

impl PendingAckTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an entry with this id already exists.
    /// Returns true if the packet was inserted.
    pub fn insert(&self, packet: Arc<PendingPacket>) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|p| p.message_id == packet.message_id) {
            return false;
        }
        entries.push(packet);
        true
    }

    /// Remove the entry acknowledged by `message_id`, if present.
    pub fn remove(&self, message_id: u16) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|p| p.message_id != message_id);
        entries.len() != before
    }

    /// Copy of all entries, for a retry round.
    pub fn snapshot(&self) -> Vec<Arc<PendingPacket>> {
        self.entries.lock().clone()
    }

    /// Drop every entry addressed to `association`. Returns the count.
    pub fn discard_for(&self, association: &Arc<dyn Association>) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|p| !Arc::ptr_eq(&p.association, association));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::loopback::LoopbackNetwork;
    use crate::association::{AssociationTemplate, PeerAddress};
    use crossbeam::channel;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn test_association(port_a: u16, port_b: u16) -> Arc<dyn Association> {
        let network = LoopbackNetwork::new();
        let a = PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], port_a)));
        let b = PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], port_b)));
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

    fn packet(id: u16, association: &Arc<dyn Association>) -> Arc<PendingPacket> {
        Arc::new(PendingPacket {
            message_id: id,
            association: Arc::clone(association),
            bytes: vec![0; 8],
        })
    }

    #[test]
    fn test_insert_is_idempotent_per_id() {
        let table = PendingAckTable::new();
        let association = test_association(5101, 5102);

        assert!(table.insert(packet(7, &association)));
        assert!(!table.insert(packet(7, &association)), "same id, no-op");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ack_removes_entry() {
        let table = PendingAckTable::new();
        let association = test_association(5111, 5112);

        table.insert(packet(1, &association));
        table.insert(packet(2, &association));

        assert!(table.remove(1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].message_id, 2);
    }

    #[test]
    fn test_ack_for_unknown_id_is_noop() {
        let table = PendingAckTable::new();
        let association = test_association(5121, 5122);
        table.insert(packet(1, &association));

        assert!(!table.remove(99));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_discard_for_association() {
        let table = PendingAckTable::new();
        let first = test_association(5131, 5132);
        let second = test_association(5133, 5134);

        table.insert(packet(1, &first));
        table.insert(packet(2, &second));
        table.insert(packet(3, &first));

        assert_eq!(table.discard_for(&first), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.snapshot()[0].message_id, 2);
    }

    #[test]
    fn test_clear() {
        let table = PendingAckTable::new();
        let association = test_association(5141, 5142);
        table.insert(packet(1, &association));
        table.clear();
        assert_eq!(table.len(), 0);
    }
}
