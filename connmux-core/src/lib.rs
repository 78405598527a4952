//! Multiplexed transfer engine: connection pool, socket event registrar, transfer scheduler.
//! Host-driven: no I/O. The host passes readiness and timeouts, then drains socket events
//! and completions.

pub mod config;
pub mod connection;
pub mod pool;
pub mod registrar;
pub mod scheduler;
pub mod timer;
pub mod transfer;

pub use config::{ConfigError, EngineConfig};
pub use connection::{
    CloseCallback, Connection, ConnectionId, ConnectionState, Connector, IdentityKey, KeyError,
};
pub use pool::{Acquired, ConnectionPool, PoolError, PoolLimits};
pub use registrar::{
    Fd, Interest, Readiness, Registrar, RegistrarError, RegistrationId, SocketAction, SocketEvent,
};
pub use scheduler::Scheduler;
pub use timer::{Clock, SystemClock, TimerDriver};
pub use transfer::{
    Completion, Exchange, Progress, Transfer, TransferError, TransferId, TransferOutput,
};
