// Connection registry and room index.
//
// The registry is the single owner of every live connection's
// transport handle and of the room membership maps. Both maps live
// under one RwLock so each operation keeps the bidirectional
// invariant atomically: a connection is in a room's member set iff
// the room is in the connection's own room set.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use beacon_common::protocol::ws::ServerEvent;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames the registry pushes into a connection's socket task.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// A pre-serialized event envelope, shared across recipients.
    Event(Arc<str>),
    /// Ask the socket task to emit a transport-level ping.
    Probe,
    /// Ask the socket task to close the transport and exit.
    Close,
}

#[derive(Debug)]
struct ConnectionRecord {
    user_id: Uuid,
    email: String,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    rooms: HashSet<String>,
    last_seen: Instant,
}

/// Room name -> member connection ids. Entries are created lazily on
/// first subscription and deleted once empty, so one-off rooms never
/// accumulate.
#[derive(Debug, Default)]
pub(crate) struct RoomIndex {
    rooms: HashMap<String, HashSet<Uuid>>,
}

impl RoomIndex {
    fn insert(&mut self, room: &str, connection_id: Uuid) -> bool {
        self.rooms.entry(room.to_string()).or_default().insert(connection_id)
    }

    fn remove(&mut self, room: &str, connection_id: Uuid) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }

    pub(crate) fn members_of(&self, room: &str) -> Option<&HashSet<Uuid>> {
        self.rooms.get(room)
    }

    fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &HashSet<Uuid>)> {
        self.rooms.iter()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<Uuid, ConnectionRecord>,
    rooms: RoomIndex,
}

/// Registry snapshot served by the stats endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub total_connections: usize,
    pub total_rooms: usize,
    pub members_per_room: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    /// Register a connection under a caller-supplied id and send the
    /// handshake acknowledgment through its outbound channel.
    ///
    /// A colliding id evicts the prior entry: its room memberships are
    /// torn down and its transport asked to close before the new
    /// record is inserted.
    pub async fn register(
        &self,
        connection_id: Uuid,
        outbound: mpsc::UnboundedSender<ClientFrame>,
        user_id: Uuid,
        email: String,
    ) {
        let mut inner = self.inner.write().await;

        if let Some(previous) = inner.connections.remove(&connection_id) {
            warn!(
                connection_id = %connection_id,
                user_id = %previous.user_id,
                "connection id collision, evicting prior connection"
            );
            for room in &previous.rooms {
                inner.rooms.remove(room, connection_id);
            }
            let _ = previous.outbound.send(ClientFrame::Close);
        }

        let ack = ServerEvent::connection_ack(user_id, &email);
        match ack.encode() {
            Ok(raw) => {
                let _ = outbound.send(ClientFrame::Event(Arc::from(raw)));
            }
            Err(error) => {
                warn!(connection_id = %connection_id, ?error, "failed to encode connection ack");
            }
        }

        inner.connections.insert(
            connection_id,
            ConnectionRecord {
                user_id,
                email,
                outbound,
                rooms: HashSet::new(),
                last_seen: Instant::now(),
            },
        );

        info!(connection_id = %connection_id, user_id = %user_id, "connection registered");
    }

    /// Unsubscribe the connection from every room and drop it.
    /// No-op on an unknown id.
    pub async fn remove(&self, connection_id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.connections.remove(&connection_id) else {
            return;
        };

        for room in &record.rooms {
            inner.rooms.remove(room, connection_id);
        }

        info!(connection_id = %connection_id, user_id = %record.user_id, "connection removed");
    }

    /// Close every connection and clear both maps. Shutdown path.
    pub async fn close_all(&self) {
        let mut inner = self.inner.write().await;
        for record in inner.connections.values() {
            let _ = record.outbound.send(ClientFrame::Close);
        }
        let closed = inner.connections.len();
        inner.connections.clear();
        inner.rooms = RoomIndex::default();
        if closed > 0 {
            info!(closed, "closed all connections on shutdown");
        }
    }

    /// Best-effort single-recipient delivery; drops silently (with a
    /// debug log) when the transport is gone.
    pub async fn send_to_connection(&self, connection_id: Uuid, event: &ServerEvent) {
        let raw: Arc<str> = match event.encode() {
            Ok(raw) => Arc::from(raw),
            Err(error) => {
                warn!(?error, "failed to encode server event");
                return;
            }
        };

        let inner = self.inner.read().await;
        match inner.connections.get(&connection_id) {
            Some(record) => {
                if record.outbound.send(ClientFrame::Event(raw)).is_err() {
                    debug!(connection_id = %connection_id, "dropped message to closed transport");
                }
            }
            None => {
                debug!(connection_id = %connection_id, "dropped message to unknown connection");
            }
        }
    }

    /// Deliver to every registered connection of one user (a user may
    /// hold several simultaneous sessions). Returns deliveries made.
    pub async fn send_to_identity(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let raw: Arc<str> = match event.encode() {
            Ok(raw) => Arc::from(raw),
            Err(error) => {
                warn!(?error, "failed to encode server event");
                return 0;
            }
        };

        let inner = self.inner.read().await;
        let mut delivered = 0;
        for (connection_id, record) in &inner.connections {
            if record.user_id != user_id {
                continue;
            }
            if record.outbound.send(ClientFrame::Event(Arc::clone(&raw))).is_ok() {
                delivered += 1;
            } else {
                debug!(connection_id = %connection_id, "dropped message to closed transport");
            }
        }
        delivered
    }

    /// Record that the connection answered a probe (or sent any
    /// ping-equivalent signal).
    pub async fn record_liveness(&self, connection_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.connections.get_mut(&connection_id) {
            record.last_seen = Instant::now();
        }
    }

    /// Add the connection to each room, creating rooms lazily.
    /// Idempotent under duplicate subscription. False on unknown id.
    pub async fn subscribe(&self, connection_id: Uuid, rooms: &[String]) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(&connection_id) {
            return false;
        }

        for room in rooms {
            inner.rooms.insert(room, connection_id);
            if let Some(record) = inner.connections.get_mut(&connection_id) {
                record.rooms.insert(room.clone());
            }
        }

        debug!(connection_id = %connection_id, rooms = ?rooms, "subscribed");
        true
    }

    /// Symmetric removal; rooms whose member set empties are deleted.
    pub async fn unsubscribe(&self, connection_id: Uuid, rooms: &[String]) -> bool {
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(&connection_id) {
            return false;
        }

        for room in rooms {
            inner.rooms.remove(room, connection_id);
            if let Some(record) = inner.connections.get_mut(&connection_id) {
                record.rooms.remove(room);
            }
        }

        debug!(connection_id = %connection_id, rooms = ?rooms, "unsubscribed");
        true
    }

    pub async fn rooms_of(&self, connection_id: Uuid) -> Option<Vec<String>> {
        self.inner.read().await.connections.get(&connection_id).map(|record| {
            let mut rooms = record.rooms.iter().cloned().collect::<Vec<_>>();
            rooms.sort();
            rooms
        })
    }

    /// Read-only snapshot of a room's member set for fan-out.
    pub async fn members_of(&self, room: &str) -> Vec<Uuid> {
        let inner = self.inner.read().await;
        let mut members = inner
            .rooms
            .members_of(room)
            .map(|set| set.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Serialize once and fan out to a single room.
    pub async fn broadcast_to_room(&self, room: &str, event: &ServerEvent) -> usize {
        let raw: Arc<str> = match event.encode() {
            Ok(raw) => Arc::from(raw),
            Err(error) => {
                warn!(?error, "failed to encode server event");
                return 0;
            }
        };
        let rooms = [room.to_string()];
        self.fan_out(&rooms, &raw).await
    }

    /// Fan an already-serialized envelope out to every current member
    /// of the given rooms. A connection subscribed to several of the
    /// rooms receives the envelope once. A member with a closed
    /// transport is skipped and logged; delivery to the others
    /// proceeds.
    pub(crate) async fn fan_out(&self, rooms: &[String], raw: &Arc<str>) -> usize {
        let recipients = {
            let inner = self.inner.read().await;
            let mut seen = HashSet::new();
            let mut recipients = Vec::new();
            for room in rooms {
                let Some(members) = inner.rooms.members_of(room) else {
                    continue;
                };
                for connection_id in members {
                    if !seen.insert(*connection_id) {
                        continue;
                    }
                    if let Some(record) = inner.connections.get(connection_id) {
                        recipients.push((*connection_id, record.outbound.clone()));
                    }
                }
            }
            recipients
        };

        let mut delivered = 0;
        for (connection_id, recipient) in recipients {
            if recipient.send(ClientFrame::Event(Arc::clone(raw))).is_ok() {
                delivered += 1;
            } else {
                debug!(
                    connection_id = %connection_id,
                    "skipped closed transport during fan-out"
                );
            }
        }
        delivered
    }

    /// One liveness pass: evict connections silent for longer than
    /// `timeout`, probe the rest. Returns the evicted ids.
    pub(crate) async fn liveness_sweep(&self, now: Instant, timeout: Duration) -> Vec<Uuid> {
        let mut inner = self.inner.write().await;

        let mut evicted = Vec::new();
        for (connection_id, record) in &inner.connections {
            if now.saturating_duration_since(record.last_seen) > timeout {
                evicted.push(*connection_id);
            } else {
                let _ = record.outbound.send(ClientFrame::Probe);
            }
        }

        for connection_id in &evicted {
            if let Some(record) = inner.connections.remove(connection_id) {
                let _ = record.outbound.send(ClientFrame::Close);
                for room in &record.rooms {
                    inner.rooms.remove(room, *connection_id);
                }
                info!(
                    connection_id = %connection_id,
                    user_id = %record.user_id,
                    "evicted unresponsive connection"
                );
            }
        }

        evicted
    }

    pub async fn stats(&self) -> RealtimeStats {
        let inner = self.inner.read().await;
        RealtimeStats {
            total_connections: inner.connections.len(),
            total_rooms: inner.rooms.room_count(),
            members_per_room: inner
                .rooms
                .iter()
                .map(|(room, members)| (room.clone(), members.len()))
                .collect(),
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn email_of(&self, connection_id: Uuid) -> Option<String> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|record| record.email.clone())
    }

    #[cfg(test)]
    pub(crate) async fn set_last_seen_for_tests(&self, connection_id: Uuid, last_seen: Instant) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.connections.get_mut(&connection_id) {
            record.last_seen = last_seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientFrame, ConnectionRegistry};
    use beacon_common::protocol::ws::{EventKind, ServerEvent};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;
    use uuid::Uuid;

    async fn register(
        registry: &ConnectionRegistry,
    ) -> (Uuid, Uuid, mpsc::UnboundedReceiver<ClientFrame>) {
        let connection_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        registry.register(connection_id, sender, user_id, "user@example.com".into()).await;
        // Drain the handshake ack so tests observe only their own frames.
        let ack = receiver.recv().await.expect("registration should send an ack");
        assert!(matches!(ack, ClientFrame::Event(_)));
        (connection_id, user_id, receiver)
    }

    fn rooms(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn event() -> ServerEvent {
        ServerEvent::new(EventKind::IssueUpdated, json!({ "id": "42" }), None)
    }

    #[tokio::test]
    async fn subscribe_creates_bidirectional_membership() {
        let registry = ConnectionRegistry::default();
        let (connection_id, _, _receiver) = register(&registry).await;

        assert!(registry.subscribe(connection_id, &rooms(&["issue:42"])).await);

        assert_eq!(
            registry.rooms_of(connection_id).await,
            Some(vec!["issue:42".to_string()])
        );
        assert_eq!(registry.members_of("issue:42").await, vec![connection_id]);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let (connection_id, _, _receiver) = register(&registry).await;

        registry.subscribe(connection_id, &rooms(&["issue:42"])).await;
        registry.subscribe(connection_id, &rooms(&["issue:42"])).await;

        assert_eq!(registry.members_of("issue:42").await.len(), 1);
        assert_eq!(registry.rooms_of(connection_id).await.map(|r| r.len()), Some(1));
    }

    #[tokio::test]
    async fn unsubscribe_deletes_emptied_rooms() {
        let registry = ConnectionRegistry::default();
        let (connection_id, _, _receiver) = register(&registry).await;

        registry.subscribe(connection_id, &rooms(&["team:7"])).await;
        registry.unsubscribe(connection_id, &rooms(&["team:7"])).await;

        assert!(registry.members_of("team:7").await.is_empty());
        assert_eq!(registry.rooms_of(connection_id).await, Some(Vec::new()));
        // The room is gone from the index, not merely empty.
        assert_eq!(registry.stats().await.total_rooms, 0);
    }

    #[tokio::test]
    async fn subscribe_to_unknown_connection_is_refused() {
        let registry = ConnectionRegistry::default();
        assert!(!registry.subscribe(Uuid::new_v4(), &rooms(&["issue:42"])).await);
        assert_eq!(registry.stats().await.total_rooms, 0);
    }

    #[tokio::test]
    async fn remove_clears_every_membership() {
        let registry = ConnectionRegistry::default();
        let (connection_id, _, _receiver) = register(&registry).await;
        let (other_id, _, _other_receiver) = register(&registry).await;

        registry.subscribe(connection_id, &rooms(&["issue:42", "team:7"])).await;
        registry.subscribe(other_id, &rooms(&["team:7"])).await;

        registry.remove(connection_id).await;

        assert_eq!(registry.rooms_of(connection_id).await, None);
        assert!(registry.members_of("issue:42").await.is_empty());
        assert_eq!(registry.members_of("team:7").await, vec![other_id]);
        // issue:42 emptied and was garbage collected.
        assert_eq!(registry.stats().await.total_rooms, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::default();
        let (connection_id, _, _receiver) = register(&registry).await;

        registry.remove(connection_id).await;
        registry.remove(connection_id).await;

        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn register_sends_connection_ack_with_identity() {
        let registry = ConnectionRegistry::default();
        let connection_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let (sender, mut receiver) = mpsc::unbounded_channel();

        registry.register(connection_id, sender, user_id, "ada@example.com".into()).await;

        let ClientFrame::Event(raw) = receiver.recv().await.expect("ack should arrive") else {
            panic!("first frame should be the handshake ack");
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&raw).expect("ack should be valid json");
        assert_eq!(parsed["type"], "connection.ack");
        assert_eq!(parsed["payload"]["userId"], serde_json::json!(user_id));
        assert_eq!(parsed["payload"]["email"], "ada@example.com");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn register_evicts_prior_connection_with_same_id() {
        let registry = ConnectionRegistry::default();
        let connection_id = Uuid::new_v4();
        let (old_sender, mut old_receiver) = mpsc::unbounded_channel();
        registry
            .register(connection_id, old_sender, Uuid::new_v4(), "old@example.com".into())
            .await;
        let _ = old_receiver.recv().await; // ack
        registry.subscribe(connection_id, &rooms(&["issue:42"])).await;

        let (new_sender, mut new_receiver) = mpsc::unbounded_channel();
        registry
            .register(connection_id, new_sender, Uuid::new_v4(), "new@example.com".into())
            .await;

        // The evicted transport was asked to close.
        let close = old_receiver.recv().await.expect("old transport should get a frame");
        assert!(matches!(close, ClientFrame::Close));
        // The prior memberships are gone; the new record starts clean.
        assert!(registry.members_of("issue:42").await.is_empty());
        assert_eq!(registry.rooms_of(connection_id).await, Some(Vec::new()));
        assert_eq!(registry.email_of(connection_id).await.as_deref(), Some("new@example.com"));
        assert!(matches!(new_receiver.recv().await, Some(ClientFrame::Event(_))));
    }

    #[tokio::test]
    async fn fan_out_skips_closed_transports() {
        let registry = ConnectionRegistry::default();
        let (c1, _, mut r1) = register(&registry).await;
        let (c2, _, r2) = register(&registry).await;
        let (c3, _, mut r3) = register(&registry).await;

        for connection_id in [c1, c2, c3] {
            registry.subscribe(connection_id, &rooms(&["team:7"])).await;
        }

        drop(r2); // c2's transport is gone

        let delivered = registry.broadcast_to_room("team:7", &event()).await;

        assert_eq!(delivered, 2);
        assert!(matches!(r1.recv().await, Some(ClientFrame::Event(_))));
        assert!(matches!(r3.recv().await, Some(ClientFrame::Event(_))));
    }

    #[tokio::test]
    async fn broadcast_to_unknown_room_delivers_nothing() {
        let registry = ConnectionRegistry::default();
        assert_eq!(registry.broadcast_to_room("issue:404", &event()).await, 0);
    }

    #[tokio::test]
    async fn send_to_identity_reaches_every_session_of_the_user() {
        let registry = ConnectionRegistry::default();
        let user_id = Uuid::new_v4();

        let mut receivers = Vec::new();
        for _ in 0..2 {
            let connection_id = Uuid::new_v4();
            let (sender, mut receiver) = mpsc::unbounded_channel();
            registry.register(connection_id, sender, user_id, "ada@example.com".into()).await;
            let _ = receiver.recv().await; // ack
            receivers.push(receiver);
        }
        let (_, _, _other) = register(&registry).await;

        let delivered = registry.send_to_identity(user_id, &event()).await;

        assert_eq!(delivered, 2);
        for receiver in &mut receivers {
            assert!(matches!(receiver.recv().await, Some(ClientFrame::Event(_))));
        }
    }

    #[tokio::test]
    async fn liveness_sweep_probes_live_and_evicts_stale() {
        let registry = ConnectionRegistry::default();
        let (_live_id, _, mut live_receiver) = register(&registry).await;
        let (stale_id, _, mut stale_receiver) = register(&registry).await;
        registry.subscribe(stale_id, &rooms(&["issue:42"])).await;

        let timeout = Duration::from_secs(60);
        registry
            .set_last_seen_for_tests(stale_id, Instant::now() - Duration::from_secs(61))
            .await;

        let evicted = registry.liveness_sweep(Instant::now(), timeout).await;

        assert_eq!(evicted, vec![stale_id]);
        assert_eq!(registry.rooms_of(stale_id).await, None);
        assert!(registry.members_of("issue:42").await.is_empty());
        assert!(matches!(live_receiver.recv().await, Some(ClientFrame::Probe)));
        assert!(matches!(stale_receiver.recv().await, Some(ClientFrame::Close)));
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = ConnectionRegistry::default();
        let (c1, _, mut r1) = register(&registry).await;
        registry.subscribe(c1, &rooms(&["team:7"])).await;

        registry.close_all().await;

        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.stats().await.total_rooms, 0);
        assert!(matches!(r1.recv().await, Some(ClientFrame::Close)));
    }

    #[tokio::test]
    async fn stats_counts_rooms_and_members() {
        let registry = ConnectionRegistry::default();
        let (c1, _, _r1) = register(&registry).await;
        let (c2, _, _r2) = register(&registry).await;
        registry.subscribe(c1, &rooms(&["team:7", "issue:42"])).await;
        registry.subscribe(c2, &rooms(&["team:7"])).await;

        let stats = registry.stats().await;

        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.total_rooms, 2);
        assert_eq!(stats.members_per_room["team:7"], 2);
        assert_eq!(stats.members_per_room["issue:42"], 1);

        let value = serde_json::to_value(&stats).expect("stats should serialize");
        assert!(value.get("totalConnections").is_some());
        assert!(value.get("membersPerRoom").is_some());
    }
}
