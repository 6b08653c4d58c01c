//! Per-host outbound channel with resync on reconnect.
//!
//! Packets for a host are queued while its primary connection is down or
//! dirty, and replayed in order once a fresh connection has been resynced.
//!
//! ## Link State
//!
//! ```text
//! Disconnected --bind(0)--> ConnectedDirty --resync--> ConnectedClean
//!      ^                                                     |
//!      +-------------------- unbind(0) ----------------------+
//! ```
//!
//! Only a clean primary connection carries packets directly. Every other
//! state appends to the pending queue.

use std::collections::{BTreeMap, VecDeque};

use subfleet_proto::{Packet, RequestId, WorkerSpec};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Slot index of the primary connection.
pub const PRIMARY_SLOT: u32 = 0;

/// Reason carried by the one-time reset sent on the first resync.
pub const RESET_REASON: &str = "Prevent Desync";

/// Identifies one accepted connection.
pub type ConnectionId = u64;

/// Sending side of a bound connection.
///
/// Packets pushed here are written to the socket by the connection's writer
/// task in the order they were sent.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Packet>,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Packet>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Hand a packet to the writer. Returns it back if the writer is gone.
    fn send(&self, packet: Packet) -> Result<(), Packet> {
        self.tx.send(packet).map_err(|e| e.0)
    }
}

/// State of the primary connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Bound, but the host's view has not been rebuilt yet.
    ConnectedDirty,
    ConnectedClean,
}

/// Result of [`HostChannel::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The connection now occupies the slot. `resync` is set for the primary
    /// slot, where the caller must run [`HostChannel::resync`] next.
    Bound { resync: bool },
    /// The primary slot is already occupied.
    AlreadyLinked,
}

/// A worker as it is replayed to a freshly bound host.
#[derive(Debug, Clone)]
pub struct ResyncEntry {
    pub spec: WorkerSpec,
    /// Live log address, set for running workers.
    pub log_address: Option<Uuid>,
    /// Id the host acks the add with.
    pub request_id: Option<RequestId>,
}

impl ResyncEntry {
    fn into_packet(self) -> Packet {
        Packet::AddWorker {
            request_id: self.request_id,
            spec: self.spec,
            log_address: self.log_address,
        }
    }
}

/// Outbound state for one host.
#[derive(Debug)]
pub struct HostChannel {
    host: String,
    slots: BTreeMap<u32, Option<Connection>>,
    state: LinkState,
    pending: VecDeque<Packet>,
    reset_sent: bool,
    max_pending: Option<usize>,
}

impl HostChannel {
    /// New channel with an empty primary slot. `max_pending` bounds the
    /// queue; when full the oldest packet is dropped.
    pub fn new(host: impl Into<String>, max_pending: Option<usize>) -> Self {
        let mut slots = BTreeMap::new();
        slots.insert(PRIMARY_SLOT, None);
        Self {
            host: host.into(),
            slots,
            state: LinkState::Disconnected,
            pending: VecDeque::new(),
            reset_sent: false,
            max_pending,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn link_state(&self) -> LinkState {
        self.state
    }

    /// True when packets go straight to the host.
    pub fn is_available(&self) -> bool {
        self.state == LinkState::ConnectedClean
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the one-time reset has already been sent.
    pub fn reset_sent(&self) -> bool {
        self.reset_sent
    }

    /// Request ids of queued packets that have not reached the host yet.
    pub fn queued_request_ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.pending.iter().filter_map(Packet::request_id)
    }

    /// Slot indices and the connection occupying each, sorted by index.
    pub fn slots(&self) -> Vec<(u32, Option<ConnectionId>)> {
        self.slots
            .iter()
            .map(|(index, conn)| (*index, conn.as_ref().map(Connection::id)))
            .collect()
    }

    /// Deliver now if the primary link is clean, otherwise queue.
    pub fn enqueue(&mut self, packet: Packet) {
        if self.state != LinkState::ConnectedClean {
            self.push_pending(packet);
            return;
        }
        if let Err(packet) = self.deliver(packet) {
            self.primary_lost();
            self.push_pending(packet);
        }
    }

    /// Attach a connection to a slot.
    ///
    /// The primary slot refuses a second connection. Auxiliary slots are
    /// created on demand and replaced on rebind.
    pub fn bind(&mut self, slot: u32, connection: Connection) -> BindOutcome {
        if slot != PRIMARY_SLOT {
            if let Some(Some(old)) = self.slots.insert(slot, Some(connection)) {
                debug!(host = %self.host, slot, replaced = old.id(), "Replaced auxiliary connection");
            }
            return BindOutcome::Bound { resync: false };
        }

        if matches!(self.slots.get(&PRIMARY_SLOT), Some(Some(_))) {
            warn!(host = %self.host, "Primary slot already linked, refusing connection");
            return BindOutcome::AlreadyLinked;
        }

        info!(host = %self.host, connection = connection.id(), "Primary connection bound");
        self.slots.insert(PRIMARY_SLOT, Some(connection));
        self.state = LinkState::ConnectedDirty;
        BindOutcome::Bound { resync: true }
    }

    /// Rebuild the host's view and flush the queue.
    ///
    /// Sends the one-time reset (first resync only), one add per worker in
    /// `snapshot`, then every pending packet in order. Returns false if the
    /// link was not dirty or dropped part way; whatever was not sent stays
    /// queued for the next bind.
    pub fn resync(&mut self, snapshot: Vec<ResyncEntry>) -> bool {
        if self.state != LinkState::ConnectedDirty {
            return false;
        }

        if !self.reset_sent {
            let reset = Packet::Reset {
                reason: RESET_REASON.to_string(),
            };
            if self.deliver(reset).is_err() {
                self.primary_lost();
                return false;
            }
            self.reset_sent = true;
        }

        let workers = snapshot.len();
        for entry in snapshot {
            if self.deliver(entry.into_packet()).is_err() {
                self.primary_lost();
                return false;
            }
        }

        let flushed = self.pending.len();
        while let Some(packet) = self.pending.pop_front() {
            if let Err(packet) = self.deliver(packet) {
                self.pending.push_front(packet);
                self.primary_lost();
                return false;
            }
        }

        self.state = LinkState::ConnectedClean;
        info!(host = %self.host, workers, flushed, "Host resynced");
        true
    }

    /// Detach a connection from whichever slot holds it.
    ///
    /// Returns the slot it occupied, if any.
    pub fn unbind(&mut self, connection: ConnectionId) -> Option<u32> {
        let slot = self
            .slots
            .iter()
            .find(|(_, conn)| conn.as_ref().map(Connection::id) == Some(connection))
            .map(|(index, _)| *index)?;

        if slot == PRIMARY_SLOT {
            self.slots.insert(PRIMARY_SLOT, None);
            self.state = LinkState::Disconnected;
            info!(host = %self.host, connection, pending = self.pending.len(), "Primary connection unbound");
        } else {
            self.slots.remove(&slot);
            debug!(host = %self.host, slot, connection, "Auxiliary connection unbound");
        }
        Some(slot)
    }

    fn deliver(&self, packet: Packet) -> Result<(), Packet> {
        match self.slots.get(&PRIMARY_SLOT) {
            Some(Some(conn)) => conn.send(packet),
            _ => Err(packet),
        }
    }

    /// The writer behind the primary slot went away without an unbind.
    fn primary_lost(&mut self) {
        warn!(host = %self.host, "Primary connection writer closed");
        self.slots.insert(PRIMARY_SLOT, None);
        self.state = LinkState::Disconnected;
    }

    fn push_pending(&mut self, packet: Packet) {
        if let Some(max) = self.max_pending {
            while self.pending.len() >= max.max(1) {
                if let Some(dropped) = self.pending.pop_front() {
                    warn!(
                        host = %self.host,
                        kind = dropped.kind(),
                        worker = dropped.worker_name().unwrap_or(""),
                        "Pending queue full, dropped oldest packet"
                    );
                }
            }
        }
        self.pending.push_back(packet);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn add(name: &str) -> Packet {
        Packet::AddWorker {
            request_id: None,
            spec: WorkerSpec::new(name, "./start.sh", "stop"),
            log_address: None,
        }
    }

    fn entry(name: &str) -> ResyncEntry {
        ResyncEntry {
            spec: WorkerSpec::new(name, "./start.sh", "stop"),
            log_address: None,
            request_id: None,
        }
    }

    fn connection(id: ConnectionId) -> (Connection, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new(id, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            out.push(packet);
        }
        out
    }

    fn names(packets: &[Packet]) -> Vec<String> {
        packets
            .iter()
            .map(|p| match p {
                Packet::Reset { .. } => "reset".to_string(),
                other => other.worker_name().unwrap_or("").to_string(),
            })
            .collect()
    }

    #[test]
    fn test_new_channel_has_empty_primary_slot() {
        let channel = HostChannel::new("alpha", None);
        assert_eq!(channel.slots(), vec![(0, None)]);
        assert_eq!(channel.link_state(), LinkState::Disconnected);
        assert!(!channel.is_available());
    }

    #[test]
    fn test_resync_sends_reset_snapshot_then_queue() {
        let mut channel = HostChannel::new("alpha", None);
        channel.enqueue(add("a"));
        channel.enqueue(add("b"));
        assert_eq!(channel.pending_len(), 2);

        let (conn, mut rx) = connection(1);
        assert_eq!(channel.bind(0, conn), BindOutcome::Bound { resync: true });
        assert_eq!(channel.link_state(), LinkState::ConnectedDirty);
        assert!(drain(&mut rx).is_empty());

        assert!(channel.resync(vec![entry("c")]));
        let sent = drain(&mut rx);
        assert_eq!(names(&sent), vec!["reset", "c", "a", "b"]);
        assert_eq!(
            sent[0],
            Packet::Reset {
                reason: "Prevent Desync".to_string()
            }
        );
        assert!(channel.is_available());
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn test_reset_is_sent_only_once() {
        let mut channel = HostChannel::new("alpha", None);
        let (conn, mut rx) = connection(1);
        channel.bind(0, conn);
        channel.resync(vec![entry("c")]);
        assert_eq!(names(&drain(&mut rx)), vec!["reset", "c"]);

        assert_eq!(channel.unbind(1), Some(0));
        channel.enqueue(add("d"));

        let (conn, mut rx) = connection(2);
        channel.bind(0, conn);
        channel.resync(vec![entry("c")]);
        assert_eq!(names(&drain(&mut rx)), vec!["c", "d"]);
        assert!(channel.reset_sent());
    }

    #[test]
    fn test_clean_channel_delivers_in_order() {
        let mut channel = HostChannel::new("alpha", None);
        let (conn, mut rx) = connection(1);
        channel.bind(0, conn);
        channel.resync(Vec::new());
        drain(&mut rx);

        channel.enqueue(Packet::StartWorker {
            request_id: 1,
            name: "a".to_string(),
            log_address: None,
        });
        channel.enqueue(Packet::StopWorker {
            request_id: 2,
            name: "a".to_string(),
            force: false,
        });
        let sent = drain(&mut rx);
        assert_eq!(
            sent.iter().map(|p| p.request_id()).collect::<Vec<_>>(),
            vec![Some(1), Some(2)]
        );
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn test_dirty_channel_queues() {
        let mut channel = HostChannel::new("alpha", None);
        let (conn, mut rx) = connection(1);
        channel.bind(0, conn);

        channel.enqueue(add("a"));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(channel.pending_len(), 1);
    }

    #[test]
    fn test_primary_slot_refuses_second_connection() {
        let mut channel = HostChannel::new("alpha", None);
        let (first, _rx1) = connection(1);
        let (second, _rx2) = connection(2);

        assert_eq!(channel.bind(0, first), BindOutcome::Bound { resync: true });
        assert_eq!(channel.bind(0, second), BindOutcome::AlreadyLinked);
        assert_eq!(channel.slots(), vec![(0, Some(1))]);
    }

    #[test]
    fn test_auxiliary_slots() {
        let mut channel = HostChannel::new("alpha", None);
        let (aux, _rx) = connection(7);
        assert_eq!(channel.bind(2, aux), BindOutcome::Bound { resync: false });
        assert_eq!(channel.slots(), vec![(0, None), (2, Some(7))]);
        assert_eq!(channel.link_state(), LinkState::Disconnected);

        assert_eq!(channel.unbind(7), Some(2));
        assert_eq!(channel.slots(), vec![(0, None)]);
        assert_eq!(channel.unbind(7), None);
    }

    #[test]
    fn test_unbind_unknown_connection_is_noop() {
        let mut channel = HostChannel::new("alpha", None);
        let (conn, _rx) = connection(1);
        channel.bind(0, conn);
        channel.resync(Vec::new());

        assert_eq!(channel.unbind(99), None);
        assert!(channel.is_available());
    }

    #[test]
    fn test_resync_without_bind_does_nothing() {
        let mut channel = HostChannel::new("alpha", None);
        channel.enqueue(add("a"));
        assert!(!channel.resync(vec![entry("c")]));
        assert_eq!(channel.pending_len(), 1);
        assert!(!channel.reset_sent());
    }

    #[test]
    fn test_dropped_writer_keeps_packets_queued() {
        let mut channel = HostChannel::new("alpha", None);
        let (conn, rx) = connection(1);
        channel.bind(0, conn);
        channel.resync(Vec::new());
        drop(rx);

        channel.enqueue(add("a"));
        assert_eq!(channel.link_state(), LinkState::Disconnected);
        assert_eq!(channel.pending_len(), 1);
        assert_eq!(channel.slots(), vec![(0, None)]);
    }

    #[test]
    fn test_resync_interrupted_keeps_queue_for_next_bind() {
        let mut channel = HostChannel::new("alpha", None);
        channel.enqueue(add("a"));
        let (conn, rx) = connection(1);
        channel.bind(0, conn);
        drop(rx);

        assert!(!channel.resync(vec![entry("c")]));
        assert_eq!(channel.pending_len(), 1);
        assert!(!channel.reset_sent());

        let (conn, mut rx) = connection(2);
        channel.bind(0, conn);
        channel.resync(vec![entry("c")]);
        assert_eq!(names(&drain(&mut rx)), vec!["reset", "c", "a"]);
    }

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let mut channel = HostChannel::new("alpha", Some(2));
        channel.enqueue(add("a"));
        channel.enqueue(add("b"));
        channel.enqueue(add("c"));
        assert_eq!(channel.pending_len(), 2);

        let (conn, mut rx) = connection(1);
        channel.bind(0, conn);
        channel.resync(Vec::new());
        assert_eq!(names(&drain(&mut rx)), vec!["reset", "b", "c"]);
    }

    #[test]
    fn test_resync_entries_carry_log_address_and_request_id() {
        let mut channel = HostChannel::new("alpha", None);
        let (conn, mut rx) = connection(1);
        channel.bind(0, conn);
        let address = Uuid::new_v4();
        channel.resync(vec![ResyncEntry {
            spec: WorkerSpec::new("lobby", "./start.sh", "stop"),
            log_address: Some(address),
            request_id: Some(42),
        }]);

        let sent = drain(&mut rx);
        match &sent[1] {
            Packet::AddWorker {
                request_id,
                log_address,
                ..
            } => {
                assert_eq!(*request_id, Some(42));
                assert_eq!(*log_address, Some(address));
            }
            other => panic!("expected add, got {other:?}"),
        }
    }

    // -------------------------------------------------------------------------
    // Delivery order under arbitrary link churn
    // -------------------------------------------------------------------------

    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue,
        Bind,
        Resync,
        Unbind,
        /// The writer task dies without an unbind.
        DropWriter,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Enqueue),
            1 => Just(Op::Bind),
            1 => Just(Op::Resync),
            1 => Just(Op::Unbind),
            1 => Just(Op::DropWriter),
        ]
    }

    fn start(request_id: RequestId) -> Packet {
        Packet::StartWorker {
            request_id,
            name: "lobby".to_string(),
            log_address: None,
        }
    }

    type Primary = (ConnectionId, Option<mpsc::UnboundedReceiver<Packet>>);

    fn close(channel: &mut HostChannel, current: &mut Option<Primary>, received: &mut Vec<Packet>) {
        if let Some((id, rx)) = current.take() {
            if let Some(mut rx) = rx {
                received.extend(drain(&mut rx));
            }
            channel.unbind(id);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_enqueued_packets_arrive_once_in_order(ops in proptest::collection::vec(op(), 0..64)) {
            let mut channel = HostChannel::new("alpha", None);
            let mut received = Vec::new();
            let mut current: Option<Primary> = None;
            let mut next_connection: ConnectionId = 1;
            let mut next_request: RequestId = 0;

            for op in ops {
                match op {
                    Op::Enqueue => {
                        channel.enqueue(start(next_request));
                        next_request += 1;
                    }
                    Op::Bind => {
                        let (conn, rx) = connection(next_connection);
                        if channel.bind(PRIMARY_SLOT, conn) == (BindOutcome::Bound { resync: true }) {
                            current = Some((next_connection, Some(rx)));
                        }
                        next_connection += 1;
                    }
                    Op::Resync => {
                        channel.resync(Vec::new());
                    }
                    Op::Unbind => close(&mut channel, &mut current, &mut received),
                    Op::DropWriter => {
                        if let Some((_, rx)) = current.as_mut() {
                            if let Some(mut rx) = rx.take() {
                                received.extend(drain(&mut rx));
                            }
                        }
                    }
                }
            }

            close(&mut channel, &mut current, &mut received);
            let (conn, mut rx) = connection(next_connection);
            prop_assert_eq!(channel.bind(PRIMARY_SLOT, conn), BindOutcome::Bound { resync: true });
            prop_assert!(channel.resync(Vec::new()));
            received.extend(drain(&mut rx));

            let ids: Vec<RequestId> = received
                .iter()
                .filter_map(|p| match p {
                    Packet::StartWorker { request_id, .. } => Some(*request_id),
                    _ => None,
                })
                .collect();
            let resets = received
                .iter()
                .filter(|p| matches!(p, Packet::Reset { .. }))
                .count();

            prop_assert_eq!(ids, (0..next_request).collect::<Vec<_>>());
            prop_assert_eq!(resets, 1);
            prop_assert_eq!(channel.pending_len(), 0);
            prop_assert!(channel.is_available());
        }
    }
}
