//! Socket event registrar: fd -> registration -> interest and caller-owned opaque data.
//! The engine drives ADD / MODIFY / REMOVE transitions; the host drains them as events
//! and attaches its own data with `assign`.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use tracing::{error, trace};

/// OS socket handle as seen by the host.
pub type Fd = i32;

/// Issued once per ADD and never reused, so a recycled fd value never aliases an old registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl RegistrationId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// What the host should wait for on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    In,
    Out,
    InOut,
}

impl Interest {
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::In | Interest::InOut)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Out | Interest::InOut)
    }
}

/// Readiness reported by the host's wait primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
    };
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
    };
    pub const ERROR: Readiness = Readiness {
        readable: false,
        writable: false,
        error: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error)
    }
}

/// One registrar transition. Exactly three variants.
#[derive(Debug, PartialEq, Eq)]
pub enum SocketAction<T> {
    Add(Interest),
    Modify(Interest),
    /// The slot is already cleared when this is queued; `last_data` is handed over for cleanup.
    Remove { last_data: Option<T> },
}

/// Notification for the host: start, change or stop monitoring `fd`.
#[derive(Debug, PartialEq, Eq)]
pub struct SocketEvent<T> {
    pub fd: Fd,
    pub registration: RegistrationId,
    pub action: SocketAction<T>,
}

struct Registration<T> {
    fd: Fd,
    interest: Interest,
    data: Option<T>,
}

/// Owns the fd -> registration mapping and the lifetime of opaque data.
pub struct Registrar<T> {
    by_fd: HashMap<Fd, RegistrationId>,
    entries: HashMap<RegistrationId, Registration<T>>,
    next_id: u64,
    events: VecDeque<SocketEvent<T>>,
}

impl<T> Registrar<T> {
    pub fn new() -> Self {
        Self {
            by_fd: HashMap::new(),
            entries: HashMap::new(),
            next_id: 1,
            events: VecDeque::new(),
        }
    }

    /// Engine side: make sure `fd` is monitored with `interest`.
    /// Queues ADD for a new fd, MODIFY when the interest changed, nothing otherwise.
    pub fn watch(&mut self, fd: Fd, interest: Interest) -> RegistrationId {
        if let Some(&id) = self.by_fd.get(&fd) {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.interest != interest {
                    trace!(fd, registration = %id, ?interest, "socket modify");
                    entry.interest = interest;
                    self.events.push_back(SocketEvent {
                        fd,
                        registration: id,
                        action: SocketAction::Modify(interest),
                    });
                }
                return id;
            }
        }
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        self.by_fd.insert(fd, id);
        self.entries.insert(
            id,
            Registration {
                fd,
                interest,
                data: None,
            },
        );
        trace!(fd, registration = %id, ?interest, "socket add");
        self.events.push_back(SocketEvent {
            fd,
            registration: id,
            action: SocketAction::Add(interest),
        });
        id
    }

    /// Engine side: stop monitoring `fd`. The opaque slot is cleared before the REMOVE
    /// event is queued. Returns false if `fd` was not registered.
    pub fn unwatch(&mut self, fd: Fd) -> bool {
        let Some(id) = self.by_fd.remove(&fd) else {
            return false;
        };
        let last_data = self
            .entries
            .remove(&id)
            .and_then(|mut entry| entry.data.take());
        trace!(fd, registration = %id, had_data = last_data.is_some(), "socket remove");
        self.events.push_back(SocketEvent {
            fd,
            registration: id,
            action: SocketAction::Remove { last_data },
        });
        true
    }

    /// Caller side: attach opaque data to a registered fd. Returns the previous value.
    pub fn assign(&mut self, fd: Fd, data: T) -> Result<Option<T>, RegistrarError> {
        let entry = self.entry_mut(fd)?;
        Ok(entry.data.replace(data))
    }

    /// Caller side: opaque data for a registered fd, `None` if nothing was assigned since ADD.
    pub fn lookup(&self, fd: Fd) -> Result<Option<&T>, RegistrarError> {
        let id = self.by_fd.get(&fd).copied();
        match id.and_then(|id| self.entries.get(&id)) {
            Some(entry) => Ok(entry.data.as_ref()),
            None => {
                error!(fd, "lookup on unregistered socket");
                Err(RegistrarError::InvalidHandle(fd))
            }
        }
    }

    pub fn lookup_mut(&mut self, fd: Fd) -> Result<Option<&mut T>, RegistrarError> {
        let entry = self.entry_mut(fd)?;
        Ok(entry.data.as_mut())
    }

    fn entry_mut(&mut self, fd: Fd) -> Result<&mut Registration<T>, RegistrarError> {
        let id = self.by_fd.get(&fd).copied();
        match id.and_then(|id| self.entries.get_mut(&id)) {
            Some(entry) => Ok(entry),
            None => {
                error!(fd, "opaque data access on unregistered socket");
                Err(RegistrarError::InvalidHandle(fd))
            }
        }
    }

    pub fn is_registered(&self, fd: Fd) -> bool {
        self.by_fd.contains_key(&fd)
    }

    pub fn registration(&self, fd: Fd) -> Option<RegistrationId> {
        self.by_fd.get(&fd).copied()
    }

    pub fn interest(&self, fd: Fd) -> Option<Interest> {
        self.registration(fd)
            .and_then(|id| self.entries.get(&id))
            .map(|e| e.interest)
    }

    /// Current interest set, for the host's wait primitive.
    pub fn watched(&self) -> impl Iterator<Item = (Fd, Interest)> + '_ {
        self.entries.values().map(|e| (e.fd, e.interest))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hand queued transitions to the host, oldest first.
    pub fn drain_events(&mut self) -> Vec<SocketEvent<T>> {
        self.events.drain(..).collect()
    }
}

impl<T> Default for Registrar<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistrarError {
    #[error("socket {0} is not registered")]
    InvalidHandle(Fd),
}
