//! Connection tracking
//!
//! A [`Connection`] is one peer-to-peer call leg. The [`ConnectionRegistry`]
//! holds every leg that has not been closed yet, so "everything we are
//! currently sending to" is always the registry's contents.

use crate::identity::PeerId;
use crate::transport::{PeerTransport, TransportError};
use crate::types::{ConnectionId, ConnectionState, Direction};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Registry invariant violations
///
/// Normal call flow never produces these; seeing one means a transport was
/// handed to the registry twice.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DuplicateError {
    /// Connection id already registered
    #[error("Connection already registered: {0}")]
    Connection(ConnectionId),

    /// Transport handle already registered under another connection
    #[error("Transport handle already registered: {0}")]
    Transport(String),
}

/// One peer-to-peer call leg
pub struct Connection {
    id: ConnectionId,
    remote_peer: Option<PeerId>,
    direction: Direction,
    transport: Box<dyn PeerTransport>,
    streams: Vec<String>,
    state: ConnectionState,
    created_at: DateTime<Utc>,
    opened_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_peer", &self.remote_peer)
            .field("direction", &self.direction)
            .field("transport", &self.transport.transport_id())
            .field("streams", &self.streams)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// Create a pending connection
    #[must_use]
    pub fn new(
        id: ConnectionId,
        remote_peer: Option<PeerId>,
        direction: Direction,
        transport: Box<dyn PeerTransport>,
    ) -> Self {
        Self {
            id,
            remote_peer,
            direction,
            transport,
            streams: Vec::new(),
            state: ConnectionState::Pending,
            created_at: Utc::now(),
            opened_at: None,
        }
    }

    /// Connection identifier
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote peer, if known
    #[must_use]
    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.remote_peer.as_ref()
    }

    /// Who opened the connection
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Lifecycle state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection is still pending or open
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &dyn PeerTransport {
        self.transport.as_ref()
    }

    /// Remote streams received on this connection
    #[must_use]
    pub fn stream_ids(&self) -> &[String] {
        &self.streams
    }

    /// When the connection was created
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// How long media has been flowing
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.opened_at.map(|start| Utc::now() - start)
    }

    /// Record a remote stream, opening the connection
    ///
    /// Returns `false` if the stream was already recorded or the connection
    /// is closed.
    pub(crate) fn attach_stream(&mut self, stream_id: &str) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        if self.state == ConnectionState::Pending {
            self.state = ConnectionState::Open;
            self.opened_at = Some(Utc::now());
            tracing::debug!(
                connection_id = %self.id,
                old_state = ?ConnectionState::Pending,
                new_state = ?ConnectionState::Open,
                "Connection state transition"
            );
        }
        if self.streams.iter().any(|s| s == stream_id) {
            return false;
        }
        self.streams.push(stream_id.to_string());
        true
    }

    /// Close the connection and its transport
    ///
    /// Drops every remote stream reference. Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the transport's teardown failure; the connection is Closed
    /// either way
    pub fn close(&mut self) -> Result<(), TransportError> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.state = ConnectionState::Closed;
        self.streams.clear();
        self.transport.close()
    }
}

/// Outcome of [`ConnectionRegistry::close_all`]
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Connections whose transport closed cleanly
    pub closed: usize,
    /// Connections whose transport failed to close
    pub failed: Vec<(ConnectionId, TransportError)>,
}

/// Set of connections that are not closed
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    ///
    /// # Errors
    ///
    /// Returns error if the id or the transport handle is already registered
    pub fn register(&mut self, connection: Connection) -> Result<(), DuplicateError> {
        if self.connections.contains_key(&connection.id) {
            return Err(DuplicateError::Connection(connection.id));
        }
        let transport_id = connection.transport.transport_id();
        if self
            .connections
            .values()
            .any(|c| c.transport.transport_id() == transport_id)
        {
            return Err(DuplicateError::Transport(transport_id.to_string()));
        }
        tracing::debug!(
            connection_id = %connection.id,
            direction = ?connection.direction,
            transport = %transport_id,
            "Connection registered"
        );
        self.connections.insert(connection.id, connection);
        Ok(())
    }

    /// Remove a connection; no-op if absent
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if removed.is_some() {
            tracing::debug!(connection_id = %id, "Connection unregistered");
        }
        removed
    }

    /// Look up a connection
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Whether a connection is registered
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Record a remote stream on a registered connection
    ///
    /// Returns `None` if the connection is not registered, otherwise whether
    /// the stream was new.
    pub fn attach_stream(&mut self, id: ConnectionId, stream_id: &str) -> Option<bool> {
        self.connections
            .get_mut(&id)
            .map(|connection| connection.attach_stream(stream_id))
    }

    /// Apply `f` to every pending or open connection
    pub fn for_each_live(&self, mut f: impl FnMut(&Connection)) {
        self.connections
            .values()
            .filter(|connection| connection.is_live())
            .for_each(|connection| f(connection));
    }

    /// Close every connection and clear the registry
    ///
    /// A connection whose transport fails to close is logged and skipped so
    /// the rest are still torn down.
    pub fn close_all(&mut self) -> CloseReport {
        let mut report = CloseReport::default();
        for (id, mut connection) in self.connections.drain() {
            match connection.close() {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %id, error = %e, "Failed to close connection");
                    report.failed.push((id, e));
                }
            }
        }
        tracing::info!(
            closed = report.closed,
            failed = report.failed.len(),
            "Closed all connections"
        );
        report
    }

    /// Number of registered connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether any connection has media flowing
    #[must_use]
    pub fn has_open(&self) -> bool {
        self.connections
            .values()
            .any(|connection| connection.state == ConnectionState::Open)
    }

    /// Registered connection ids
    #[must_use]
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;
    use crate::types::MediaKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubTransport {
        id: String,
        fail_close: bool,
        closes: Arc<AtomicUsize>,
    }

    impl StubTransport {
        fn boxed(id: &str, fail_close: bool, closes: &Arc<AtomicUsize>) -> Box<dyn PeerTransport> {
            Box::new(Self {
                id: id.to_string(),
                fail_close,
                closes: closes.clone(),
            })
        }
    }

    impl PeerTransport for StubTransport {
        fn transport_id(&self) -> &str {
            &self.id
        }

        fn has_sender(&self, _kind: MediaKind) -> bool {
            true
        }

        fn replace_outgoing_track(
            &self,
            _kind: MediaKind,
            _track: &MediaTrack,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                Err(TransportError::Rejected("socket already gone".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn connection(transport: Box<dyn PeerTransport>) -> Connection {
        Connection::new(
            ConnectionId::new(),
            Some(PeerId::new("remote")),
            Direction::Outbound,
            transport,
        )
    }

    #[test]
    fn test_register_rejects_duplicate_transport() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new();
        registry
            .register(connection(StubTransport::boxed("t1", false, &closes)))
            .unwrap();

        let err = registry
            .register(connection(StubTransport::boxed("t1", false, &closes)))
            .unwrap_err();
        assert_eq!(err, DuplicateError::Transport("t1".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.unregister(ConnectionId::new()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_attach_stream_opens_and_dedups() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new();
        let conn = connection(StubTransport::boxed("t1", false, &closes));
        let id = conn.id();
        registry.register(conn).unwrap();
        assert!(!registry.has_open());

        assert_eq!(registry.attach_stream(id, "s1"), Some(true));
        assert_eq!(registry.attach_stream(id, "s1"), Some(false));
        assert!(registry.has_open());
        assert_eq!(registry.get(id).unwrap().stream_ids(), ["s1".to_string()]);
        assert!(registry.get(id).unwrap().duration().is_some());

        assert_eq!(registry.attach_stream(ConnectionId::new(), "s2"), None);
    }

    #[test]
    fn test_close_drops_stream_references() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut conn = connection(StubTransport::boxed("t1", false, &closes));
        conn.attach_stream("s1");
        conn.close().unwrap();
        conn.close().unwrap();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.stream_ids().is_empty());
        assert!(!conn.attach_stream("s2"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_all_continues_past_failures() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new();
        registry
            .register(connection(StubTransport::boxed("ok-1", false, &closes)))
            .unwrap();
        registry
            .register(connection(StubTransport::boxed("broken", true, &closes)))
            .unwrap();
        registry
            .register(connection(StubTransport::boxed("ok-2", false, &closes)))
            .unwrap();

        let report = registry.close_all();
        assert_eq!(report.closed, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_for_each_live_visits_every_connection() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectionRegistry::new();
        for i in 0..4 {
            registry
                .register(connection(StubTransport::boxed(
                    &format!("t{i}"),
                    false,
                    &closes,
                )))
                .unwrap();
        }
        let mut seen = Vec::new();
        registry.for_each_live(|c| seen.push(c.id()));
        seen.sort_by_key(|id| id.0);
        let mut ids = registry.ids();
        ids.sort_by_key(|id| id.0);
        assert_eq!(seen, ids);
    }
}
