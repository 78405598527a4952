//! Connection entity: identity key, socket, and the close callback it was created with.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::registrar::Fd;

/// (scheme, host, port) used to match transfers to reusable connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    scheme: String,
    host: String,
    port: u16,
}

impl IdentityKey {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    /// Parse `scheme://host[:port][/path]`. Well-known schemes supply their default port.
    pub fn from_url(url: &str) -> Result<Self, KeyError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| KeyError::MissingScheme(url.to_string()))?;
        if scheme.is_empty() {
            return Err(KeyError::MissingScheme(url.to_string()));
        }
        let authority = rest
            .split(&['/', '?', '#'][..])
            .next()
            .unwrap_or_default();
        // Drop userinfo.
        let authority = authority.rsplit('@').next().unwrap_or_default();
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| KeyError::MissingHost(url.to_string()))?;
            let port = match tail {
                "" => None,
                _ => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| KeyError::InvalidPort(tail.to_string()))?,
                ),
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(KeyError::MissingHost(url.to_string()));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| KeyError::InvalidPort(p.to_string()))?,
            None => default_port(scheme)
                .ok_or_else(|| KeyError::UnknownScheme(scheme.to_string()))?,
        };
        Ok(Self::new(scheme, host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("no scheme in {0:?}")]
    MissingScheme(String),
    #[error("no host in {0:?}")]
    MissingHost(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("no default port for scheme {0:?}")]
    UnknownScheme(String),
}

/// Invoked exactly once with the socket handle when the owning connection closes.
/// The callback is responsible for closing the socket.
#[derive(Clone)]
pub struct CloseCallback(Arc<dyn Fn(Fd) + Send + Sync>);

impl CloseCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Fd) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, fd: Fd) {
        (self.0)(fd)
    }

    /// True when both refer to the same callback instance.
    pub fn ptr_eq(&self, other: &CloseCallback) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for CloseCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CloseCallback({:p})", Arc::as_ptr(&self.0))
    }
}

/// Socket primitives the host provides.
pub trait Connector {
    /// Start a non-blocking connect. Completion is signalled by writability.
    fn connect(&mut self, key: &IdentityKey) -> io::Result<Fd>;

    /// Close a socket that has no close callback bound.
    fn close(&mut self, fd: Fd);

    /// Liveness probe for an idle socket before reuse.
    fn is_alive(&mut self, _fd: Fd) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Established,
    Idle,
    Closing,
    Closed,
}

/// A pooled socket. Owned by the pool; the close callback cannot change after construction.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    key: IdentityKey,
    fd: Fd,
    close_callback: Option<CloseCallback>,
    reuse_count: u32,
    state: ConnectionState,
    idle_since: Option<Instant>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        key: IdentityKey,
        fd: Fd,
        close_callback: Option<CloseCallback>,
    ) -> Self {
        Self {
            id,
            key,
            fd,
            close_callback,
            reuse_count: 0,
            state: ConnectionState::Connecting,
            idle_since: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn close_callback(&self) -> Option<&CloseCallback> {
        self.close_callback.as_ref()
    }

    pub fn reuse_count(&self) -> u32 {
        self.reuse_count
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn idle_since(&self) -> Option<Instant> {
        self.idle_since
    }

    pub fn is_reusable_for(&self, key: &IdentityKey) -> bool {
        self.state == ConnectionState::Idle && self.key == *key
    }

    /// Counts toward the per-key connection limit.
    pub(crate) fn is_live(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    pub(crate) fn set_established(&mut self) {
        self.state = ConnectionState::Established;
        self.idle_since = None;
    }

    pub(crate) fn set_reused(&mut self) {
        self.reuse_count = self.reuse_count.saturating_add(1);
        self.set_established();
    }

    pub(crate) fn set_idle(&mut self, now: Instant) {
        self.state = ConnectionState::Idle;
        self.idle_since = Some(now);
    }

    /// Closing -> callback (or connector close) -> Closed. Runs at most once.
    pub(crate) fn close_with(&mut self, connector: &mut dyn Connector) {
        if !self.is_live() {
            return;
        }
        self.state = ConnectionState::Closing;
        match &self.close_callback {
            Some(cb) => cb.call(self.fd),
            None => connector.close(self.fd),
        }
        self.state = ConnectionState::Closed;
        self.idle_since = None;
    }
}
