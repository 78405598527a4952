//! Transfer handles, the protocol-driver seam, and completion records.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::connection::{CloseCallback, ConnectionId, IdentityKey};
use crate::registrar::{Fd, Interest, Readiness};

/// Random 128-bit transfer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId([u8; 16]);

impl TransferId {
    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes(self.0).hyphenated())
    }
}

/// What the exchange wants after handling readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Keep going; wait for this interest next.
    Continue(Interest),
    /// Finished. `keep_alive` lets the connection go back to the pool.
    Done { keep_alive: bool },
    /// Protocol error. `clean` means the connection is still usable.
    Failed { reason: String, clean: bool },
}

/// Protocol-level I/O for one transfer. The engine calls it when the bound socket is ready;
/// it performs non-blocking reads and writes itself and appends response bytes to `sink`.
pub trait Exchange {
    fn on_ready(&mut self, fd: Fd, readiness: Readiness, sink: &mut Vec<u8>) -> Progress;

    /// Interest to register when bound to an already established (reused) connection.
    fn resume_interest(&self) -> Interest {
        Interest::In
    }

    /// Whether the connection could be reused if the exchange stopped right now.
    fn is_clean(&self) -> bool {
        false
    }
}

impl<F> Exchange for F
where
    F: FnMut(Fd, Readiness, &mut Vec<u8>) -> Progress,
{
    fn on_ready(&mut self, fd: Fd, readiness: Readiness, sink: &mut Vec<u8>) -> Progress {
        self(fd, readiness, sink)
    }
}

/// One request/response unit. Owned by the scheduler once submitted.
pub struct Transfer {
    pub(crate) key: IdentityKey,
    pub(crate) close_callback: Option<CloseCallback>,
    pub(crate) exchange: Box<dyn Exchange>,
    pub(crate) timeout: Option<Duration>,
}

impl Transfer {
    pub fn new<E: Exchange + 'static>(key: IdentityKey, exchange: E) -> Self {
        Self {
            key,
            close_callback: None,
            exchange: Box::new(exchange),
            timeout: None,
        }
    }

    /// Only takes effect if this transfer ends up creating the connection.
    pub fn with_close_callback(mut self, cb: CloseCallback) -> Self {
        self.close_callback = Some(cb);
        self
    }

    /// Whole-transfer timeout, overriding the engine default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("key", &self.key)
            .field("close_callback", &self.close_callback)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Successful transfer result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutput {
    pub body: Vec<u8>,
    pub connection: ConnectionId,
    pub reused: bool,
}

/// Terminal record for one transfer.
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub result: Result<TransferOutput, TransferError>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connect to {key} failed: {source}")]
    ConnectFailed {
        key: IdentityKey,
        #[source]
        source: io::Error,
    },
    #[error("connect to {key} failed: {reason}")]
    ConnectAborted { key: IdentityKey, reason: String },
    #[error("transfer failed: {reason}")]
    TransferFailed { reason: String },
    #[error("transfer timed out")]
    TimedOut,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("aborted after a connection failure on {key}")]
    Aborted { key: IdentityKey },
}

impl TransferError {
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectFailed { .. } | TransferError::ConnectAborted { .. }
        )
    }
}
