//! Connection pool: owns connections, matches transfers to reusable ones, closes the rest.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::connection::{
    CloseCallback, Connection, ConnectionId, ConnectionState, Connector, IdentityKey,
};

/// Outcome of `ConnectionPool::acquire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// An idle connection was handed out; its close callback is unchanged.
    Reused(ConnectionId),
    /// A new connection was created and is connecting.
    Created(ConnectionId),
    /// The per-key limit is reached and nothing is idle.
    AtCapacity,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_idle: usize,
    pub max_idle_age: Option<Duration>,
    pub max_per_key: usize,
}

impl From<&EngineConfig> for PoolLimits {
    fn from(c: &EngineConfig) -> Self {
        Self {
            max_idle: c.max_idle_connections,
            max_idle_age: c.max_idle_age(),
            max_per_key: c.max_connections_per_key,
        }
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

pub struct ConnectionPool<C: Connector> {
    connector: C,
    connections: HashMap<ConnectionId, Connection>,
    /// Idle connections, least recently idled at the front.
    idle: VecDeque<ConnectionId>,
    limits: PoolLimits,
    next_id: u64,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, limits: PoolLimits) -> Self {
        Self {
            connector,
            connections: HashMap::new(),
            idle: VecDeque::new(),
            limits,
            next_id: 1,
        }
    }

    /// Reuse an idle connection for `key` or create one. A new connection binds
    /// `close_callback` here, once; a reused one ignores it.
    pub fn acquire(
        &mut self,
        key: &IdentityKey,
        close_callback: Option<&CloseCallback>,
        now: Instant,
    ) -> Result<Acquired, PoolError> {
        self.evict_expired(now);

        // Most recently idled first.
        while let Some(pos) = self
            .idle
            .iter()
            .rposition(|id| self.connections.get(id).is_some_and(|c| c.is_reusable_for(key)))
        {
            let Some(id) = self.idle.remove(pos) else {
                break;
            };
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            if !self.connector.is_alive(conn.fd()) {
                debug!(conn_id = %id, key = %key, "idle connection dead, closing");
                self.close(id);
                continue;
            }
            conn.set_reused();
            debug!(conn_id = %id, key = %key, reuse = conn.reuse_count(), "connection reused");
            return Ok(Acquired::Reused(id));
        }

        if self.limits.max_per_key > 0 && self.live_count(key) >= self.limits.max_per_key {
            trace!(key = %key, limit = self.limits.max_per_key, "per-key connection limit reached");
            return Ok(Acquired::AtCapacity);
        }

        let fd = self.connector.connect(key).map_err(|e| {
            warn!(key = %key, error = %e, "connect failed");
            PoolError::Connect(e)
        })?;
        let id = ConnectionId::new(self.next_id);
        self.next_id += 1;
        self.connections
            .insert(id, Connection::new(id, key.clone(), fd, close_callback.cloned()));
        debug!(conn_id = %id, key = %key, fd, "connection created");
        Ok(Acquired::Created(id))
    }

    /// Non-blocking connect finished.
    pub fn mark_established(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.state() == ConnectionState::Connecting {
                conn.set_established();
                trace!(conn_id = %id, "connection established");
            }
        }
    }

    /// Return a connection. `reusable` parks an established connection as idle; anything
    /// else closes it. Releasing an idle connection as reusable changes nothing.
    pub fn release(&mut self, id: ConnectionId, reusable: bool, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            trace!(conn_id = %id, "release of unknown connection ignored");
            return;
        };
        match (conn.state(), reusable) {
            (ConnectionState::Idle, true) => {}
            (ConnectionState::Established, true) => {
                conn.set_idle(now);
                self.idle.push_back(id);
                trace!(conn_id = %id, idle = self.idle.len(), "connection idle");
                self.enforce_idle_limit();
            }
            _ => self.close(id),
        }
    }

    /// Close and forget one connection, firing its close callback.
    pub fn close(&mut self, id: ConnectionId) {
        self.idle.retain(|&i| i != id);
        if let Some(mut conn) = self.connections.remove(&id) {
            debug!(conn_id = %id, key = %conn.key(), fd = conn.fd(), "closing connection");
            conn.close_with(&mut self.connector);
        }
    }

    /// Teardown: close every connection.
    pub fn close_all(&mut self) {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.close(id);
        }
    }

    /// Close idle connections older than the configured age.
    pub fn evict_expired(&mut self, now: Instant) {
        let Some(max_age) = self.limits.max_idle_age else {
            return;
        };
        let expired: Vec<ConnectionId> = self
            .idle
            .iter()
            .copied()
            .filter(|id| {
                self.connections
                    .get(id)
                    .and_then(|c| c.idle_since())
                    .is_some_and(|since| now.saturating_duration_since(since) >= max_age)
            })
            .collect();
        for id in expired {
            debug!(conn_id = %id, "idle connection expired");
            self.close(id);
        }
    }

    /// When the oldest idle connection ages out, if an age limit is set.
    pub fn next_expiry(&self) -> Option<Instant> {
        let max_age = self.limits.max_idle_age?;
        self.idle
            .iter()
            .filter_map(|id| self.connections.get(id).and_then(Connection::idle_since))
            .min()
            .and_then(|since| since.checked_add(max_age))
    }

    fn enforce_idle_limit(&mut self) {
        while self.idle.len() > self.limits.max_idle {
            let Some(oldest) = self.idle.front().copied() else {
                break;
            };
            debug!(conn_id = %oldest, "idle cache full, evicting oldest");
            self.close(oldest);
        }
    }

    fn live_count(&self, key: &IdentityKey) -> usize {
        self.connections
            .values()
            .filter(|c| c.is_live() && c.key() == key)
            .count()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),
}
