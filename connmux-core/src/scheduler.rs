//! Transfer scheduler: host passes socket readiness and timeouts, the scheduler advances the
//! implicated transfers and queues socket events and completion records for the host to drain.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::config::EngineConfig;
use crate::connection::{CloseCallback, ConnectionId, Connector, IdentityKey};
use crate::pool::{Acquired, ConnectionPool, PoolError, PoolLimits};
use crate::registrar::{Fd, Interest, Readiness, Registrar, RegistrarError, SocketEvent};
use crate::timer::{Clock, SystemClock, TimerDriver};
use crate::transfer::{
    Completion, Exchange, Progress, Transfer, TransferError, TransferId, TransferOutput,
};

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Waiting for a connection slot for its key.
    Queued,
    Connecting {
        conn: ConnectionId,
        fd: Fd,
        deadline: Option<Instant>,
    },
    Running {
        conn: ConnectionId,
        fd: Fd,
        reused: bool,
    },
}

struct ActiveTransfer {
    key: IdentityKey,
    close_callback: Option<CloseCallback>,
    exchange: Box<dyn Exchange>,
    sink: Vec<u8>,
    phase: Phase,
    /// Whole-transfer deadline.
    deadline: Option<Instant>,
}

impl ActiveTransfer {
    fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Connecting {
                deadline: Some(connect),
                ..
            } => Some(self.deadline.map_or(connect, |d| d.min(connect))),
            _ => self.deadline,
        }
    }
}

/// Single-threaded engine. Never blocks; every call does bounded work and returns.
pub struct Scheduler<C: Connector, T = u64> {
    pool: ConnectionPool<C>,
    registrar: Registrar<T>,
    timer: TimerDriver,
    clock: Box<dyn Clock>,
    config: EngineConfig,
    transfers: HashMap<TransferId, ActiveTransfer>,
    by_fd: HashMap<Fd, TransferId>,
    queued: HashMap<IdentityKey, VecDeque<TransferId>>,
    completions: VecDeque<Completion>,
}

impl<C: Connector, T> Scheduler<C, T> {
    pub fn new(connector: C, config: EngineConfig) -> Self {
        Self::with_clock(connector, config, SystemClock)
    }

    pub fn with_clock<K: Clock + 'static>(connector: C, config: EngineConfig, clock: K) -> Self {
        Self {
            pool: ConnectionPool::new(connector, PoolLimits::from(&config)),
            registrar: Registrar::new(),
            timer: TimerDriver::new(),
            clock: Box::new(clock),
            config,
            transfers: HashMap::new(),
            by_fd: HashMap::new(),
            queued: HashMap::new(),
            completions: VecDeque::new(),
        }
    }

    /// Take ownership of a transfer and start it. A connect that fails synchronously
    /// completes the transfer before this returns.
    pub fn submit(&mut self, transfer: Transfer) -> TransferId {
        let now = self.clock.now();
        let id = TransferId::generate();
        let Transfer {
            key,
            close_callback,
            exchange,
            timeout,
        } = transfer;
        let deadline = timeout
            .or_else(|| self.config.transfer_timeout())
            .and_then(|d| now.checked_add(d));
        debug!(transfer = %id, key = %key, "transfer submitted");
        self.transfers.insert(
            id,
            ActiveTransfer {
                key: key.clone(),
                close_callback,
                exchange,
                sink: Vec::new(),
                phase: Phase::Queued,
                deadline,
            },
        );
        if !self.try_start(id, now) {
            trace!(transfer = %id, key = %key, "transfer queued");
            self.queued.entry(key).or_default().push_back(id);
        }
        self.update_timer(now);
        id
    }

    /// Readiness on `fd`. Only the transfer bound to that socket advances.
    pub fn on_socket_ready(&mut self, fd: Fd, readiness: Readiness) {
        let now = self.clock.now();
        match self.by_fd.get(&fd).copied() {
            Some(id) => self.advance(id, fd, readiness, now),
            None => trace!(fd, "readiness on unowned socket ignored"),
        }
        self.update_timer(now);
    }

    /// Timer fired. Fails every transfer whose deadline has passed and closes expired
    /// idle connections.
    pub fn on_timeout(&mut self) {
        let now = self.clock.now();
        let mut expired: Vec<(Instant, TransferId)> = self
            .transfers
            .iter()
            .filter_map(|(&id, t)| t.next_deadline().filter(|&d| d <= now).map(|d| (d, id)))
            .collect();
        expired.sort_by_key(|&(d, _)| d);
        for (_, id) in expired {
            warn!(transfer = %id, "transfer timed out");
            self.finish(id, Err(TransferError::TimedOut), false, now);
        }
        self.pool.evict_expired(now);
        self.update_timer(now);
    }

    /// Fail a transfer with `Cancelled`. Its connection goes back to the pool only when
    /// established and the exchange reports a clean state. Returns false for unknown ids.
    pub fn cancel(&mut self, id: TransferId) -> bool {
        let now = self.clock.now();
        let Some(t) = self.transfers.get(&id) else {
            return false;
        };
        let reusable = matches!(t.phase, Phase::Running { .. }) && t.exchange.is_clean();
        debug!(transfer = %id, reusable, "transfer cancelled");
        self.finish(id, Err(TransferError::Cancelled), reusable, now);
        self.update_timer(now);
        true
    }

    /// Completion records in completion order.
    pub fn drain_completions(&mut self) -> Vec<Completion> {
        self.completions.drain(..).collect()
    }

    /// Registrar transitions (ADD / MODIFY / REMOVE) in the order they happened.
    pub fn drain_socket_events(&mut self) -> Vec<SocketEvent<T>> {
        self.registrar.drain_events()
    }

    /// How long the host may wait before calling `on_timeout`. `None`: wait on sockets only.
    pub fn timeout(&self) -> Option<Duration> {
        self.timer.remaining(self.clock.now())
    }

    pub fn assign(&mut self, fd: Fd, data: T) -> Result<Option<T>, RegistrarError> {
        self.registrar.assign(fd, data)
    }

    pub fn lookup(&self, fd: Fd) -> Result<Option<&T>, RegistrarError> {
        self.registrar.lookup(fd)
    }

    pub fn watched(&self) -> impl Iterator<Item = (Fd, Interest)> + '_ {
        self.registrar.watched()
    }

    /// Transfers not yet completed, queued ones included.
    pub fn running(&self) -> usize {
        self.transfers.len()
    }

    pub fn queued(&self) -> usize {
        self.queued.values().map(VecDeque::len).sum()
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn registrar(&self) -> &Registrar<T> {
        &self.registrar
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancel everything and close every pooled connection. Each outstanding transfer
    /// gets exactly one `Cancelled` record.
    pub fn shutdown(&mut self) {
        let now = self.clock.now();
        let mut waiting: Vec<TransferId> = Vec::new();
        for (_, q) in self.queued.drain() {
            waiting.extend(q);
        }
        for id in waiting {
            self.finish(id, Err(TransferError::Cancelled), false, now);
        }
        let mut active: Vec<TransferId> = self.transfers.keys().copied().collect();
        active.sort_by_key(|id| *id.as_bytes());
        for id in active {
            self.finish(id, Err(TransferError::Cancelled), false, now);
        }
        self.pool.close_all();
        self.update_timer(now);
        debug!("scheduler shut down");
    }

    /// Acquire a connection for a transfer in the `Queued` phase. False means the per-key
    /// limit is reached and the caller must queue it.
    fn try_start(&mut self, id: TransferId, now: Instant) -> bool {
        let Some(t) = self.transfers.get(&id) else {
            return true;
        };
        let key = t.key.clone();
        let acquired = self.pool.acquire(&key, t.close_callback.as_ref(), now);
        match acquired {
            Ok(Acquired::Created(conn)) => {
                let Some(fd) = self.pool.get(conn).map(|c| c.fd()) else {
                    return true;
                };
                let deadline = now.checked_add(self.config.connect_timeout());
                self.bind(id, Phase::Connecting { conn, fd, deadline }, fd);
                self.registrar.watch(fd, Interest::Out);
                true
            }
            Ok(Acquired::Reused(conn)) => {
                let Some(fd) = self.pool.get(conn).map(|c| c.fd()) else {
                    return true;
                };
                let interest = self
                    .transfers
                    .get(&id)
                    .map_or(Interest::In, |t| t.exchange.resume_interest());
                self.bind(
                    id,
                    Phase::Running {
                        conn,
                        fd,
                        reused: true,
                    },
                    fd,
                );
                self.registrar.watch(fd, interest);
                true
            }
            Ok(Acquired::AtCapacity) => false,
            Err(PoolError::Connect(source)) => {
                self.finish(
                    id,
                    Err(TransferError::ConnectFailed {
                        key: key.clone(),
                        source,
                    }),
                    false,
                    now,
                );
                self.abort_queued(&key, now);
                true
            }
        }
    }

    fn bind(&mut self, id: TransferId, phase: Phase, fd: Fd) {
        if let Some(t) = self.transfers.get_mut(&id) {
            t.phase = phase;
            self.by_fd.insert(fd, id);
        }
    }

    fn advance(&mut self, id: TransferId, fd: Fd, readiness: Readiness, now: Instant) {
        let Some(phase) = self.transfers.get(&id).map(|t| t.phase) else {
            return;
        };
        match phase {
            Phase::Queued => return,
            Phase::Connecting { conn, .. } => {
                if readiness.error {
                    let key = self.transfers.get(&id).map(|t| t.key.clone());
                    if let Some(key) = key {
                        warn!(transfer = %id, fd, key = %key, "connect failed");
                        self.finish(
                            id,
                            Err(TransferError::ConnectAborted {
                                key,
                                reason: "socket error while connecting".to_string(),
                            }),
                            false,
                            now,
                        );
                    }
                    return;
                }
                if !readiness.writable {
                    return;
                }
                self.pool.mark_established(conn);
                if let Some(t) = self.transfers.get_mut(&id) {
                    t.phase = Phase::Running {
                        conn,
                        fd,
                        reused: false,
                    };
                }
                debug!(transfer = %id, conn_id = %conn, fd, "connected");
            }
            Phase::Running { .. } => {}
        }

        let Some(t) = self.transfers.get_mut(&id) else {
            return;
        };
        let progress = t.exchange.on_ready(fd, readiness, &mut t.sink);
        match progress {
            Progress::Continue(interest) => {
                self.registrar.watch(fd, interest);
            }
            Progress::Done { keep_alive } => {
                self.finish(id, Ok(()), keep_alive, now);
            }
            Progress::Failed { reason, clean } => {
                warn!(transfer = %id, fd, clean, reason = %reason, "transfer failed");
                self.finish(id, Err(TransferError::TransferFailed { reason }), clean, now);
            }
        }
    }

    /// Detach a transfer, stop monitoring its socket, release its connection and queue
    /// the completion record. Then serve or abort the transfers queued for the same key.
    fn finish(
        &mut self,
        id: TransferId,
        outcome: Result<(), TransferError>,
        reusable: bool,
        now: Instant,
    ) {
        let Some(t) = self.transfers.remove(&id) else {
            return;
        };
        let bound = match t.phase {
            Phase::Queued => {
                if let Some(q) = self.queued.get_mut(&t.key) {
                    q.retain(|&q_id| q_id != id);
                    if q.is_empty() {
                        self.queued.remove(&t.key);
                    }
                }
                None
            }
            Phase::Connecting { conn, fd, .. } => Some((conn, fd, false)),
            Phase::Running { conn, fd, reused } => Some((conn, fd, reused)),
        };

        let fatal = match &outcome {
            Err(TransferError::TransferFailed { .. }) => !reusable,
            Err(e) => e.is_connect_failure(),
            Ok(()) => false,
        };

        debug_assert!(
            outcome.is_err() || bound.is_some(),
            "transfer {} succeeded without a connection",
            id
        );
        let result = match (outcome, bound) {
            (Ok(()), Some((connection, _, reused))) => Ok(TransferOutput {
                body: t.sink,
                connection,
                reused,
            }),
            (Ok(()), None) => {
                error!(transfer = %id, "transfer succeeded without a connection");
                Err(TransferError::Cancelled)
            }
            (Err(e), _) => Err(e),
        };

        if let Some((conn, fd, _)) = bound {
            self.by_fd.remove(&fd);
            // REMOVE goes out before the socket can be closed and its number recycled.
            self.registrar.unwatch(fd);
            self.pool.release(conn, reusable, now);
        }

        match &result {
            Ok(out) => debug!(
                transfer = %id,
                conn_id = %out.connection,
                reused = out.reused,
                bytes = out.body.len(),
                "transfer done"
            ),
            Err(e) => debug!(transfer = %id, error = %e, "transfer ended"),
        }
        self.completions.push_back(Completion { id, result });

        if bound.is_some() {
            if fatal {
                self.abort_queued(&t.key, now);
            } else {
                self.start_queued(&t.key, now);
            }
        }
    }

    /// A connection slot for `key` may have freed up.
    fn start_queued(&mut self, key: &IdentityKey, now: Instant) {
        while let Some(id) = self.queued.get_mut(key).and_then(VecDeque::pop_front) {
            if !self.try_start(id, now) {
                self.queued.entry(key.clone()).or_default().push_front(id);
                break;
            }
        }
        if self.queued.get(key).is_some_and(VecDeque::is_empty) {
            self.queued.remove(key);
        }
    }

    /// Fail every transfer waiting on `key` after a connection-fatal error.
    fn abort_queued(&mut self, key: &IdentityKey, now: Instant) {
        let Some(waiting) = self.queued.remove(key) else {
            return;
        };
        if !waiting.is_empty() {
            warn!(key = %key, count = waiting.len(), "aborting queued transfers");
        }
        for id in waiting {
            self.finish(id, Err(TransferError::Aborted { key: key.clone() }), false, now);
        }
    }

    /// Overwrite the single timer deadline with the earliest pending one, idle expiry included.
    fn update_timer(&mut self, now: Instant) {
        let next = self
            .transfers
            .values()
            .filter_map(ActiveTransfer::next_deadline)
            .chain(self.pool.next_expiry())
            .min();
        if self.timer.set_deadline(next) {
            let timeout_ms = next.map(|d| d.saturating_duration_since(now).as_millis());
            trace!(timeout_ms = ?timeout_ms, "timer updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    use crate::registrar::SocketAction;

    #[derive(Clone)]
    struct ManualClock(Rc<Cell<Instant>>);

    impl ManualClock {
        fn new() -> Self {
            Self(Rc::new(Cell::new(Instant::now())))
        }
        fn advance(&self, d: Duration) {
            self.0.set(self.0.get() + d);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        next_fd: Fd,
        closed: Rc<RefCell<Vec<Fd>>>,
        refuse: bool,
    }

    impl Connector for FakeConnector {
        fn connect(&mut self, _key: &IdentityKey) -> io::Result<Fd> {
            if self.refuse {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            self.next_fd += 1;
            Ok(self.next_fd + 10)
        }
        fn close(&mut self, fd: Fd) {
            self.closed.borrow_mut().push(fd);
        }
    }

    /// Writes a request, then reads a response of `body`.
    fn request(body: &'static [u8], keep_alive: bool) -> impl Exchange {
        let mut sent = false;
        move |_fd: Fd, r: Readiness, sink: &mut Vec<u8>| {
            if !sent {
                if r.writable {
                    sent = true;
                }
                return Progress::Continue(Interest::In);
            }
            sink.extend_from_slice(body);
            Progress::Done { keep_alive }
        }
    }

    fn key() -> IdentityKey {
        IdentityKey::new("http", "localhost", 8888)
    }

    fn scheduler(config: EngineConfig) -> (Scheduler<FakeConnector>, ManualClock) {
        let clock = ManualClock::new();
        let s = Scheduler::with_clock(FakeConnector::default(), config, clock.clone());
        (s, clock)
    }

    fn fd_of(s: &Scheduler<FakeConnector>, id: TransferId) -> Fd {
        s.by_fd
            .iter()
            .find(|(_, &t)| t == id)
            .map(|(&fd, _)| fd)
            .expect("transfer has no socket")
    }

    fn run_to_done(s: &mut Scheduler<FakeConnector>, id: TransferId) {
        let fd = fd_of(s, id);
        s.on_socket_ready(fd, Readiness::WRITABLE);
        s.on_socket_ready(fd, Readiness::READABLE);
    }

    #[test]
    fn single_transfer_lifecycle() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let id = s.submit(Transfer::new(key(), request(b"Hello\n", true)));
        let fd = fd_of(&s, id);
        assert_eq!(s.registrar().interest(fd), Some(Interest::Out));
        assert!(s.timeout().is_some());

        run_to_done(&mut s, id);
        let done = s.drain_completions();
        assert_eq!(done.len(), 1);
        let out = done[0].result.as_ref().unwrap();
        assert_eq!(out.body, b"Hello\n");
        assert!(!out.reused);
        assert_eq!(s.running(), 0);
        assert_eq!(s.pool().idle_count(), 1);
        // Only the idle connection's expiry is pending.
        assert_eq!(s.timeout(), Some(Duration::from_secs(118)));

        let actions: Vec<_> = s.drain_socket_events().into_iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                SocketAction::Add(Interest::Out),
                SocketAction::Modify(Interest::In),
                SocketAction::Remove { last_data: None },
            ]
        );
    }

    #[test]
    fn second_transfer_reuses_idle_connection() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let first = s.submit(Transfer::new(key(), request(b"a", true)));
        run_to_done(&mut s, first);
        let second = s.submit(Transfer::new(key(), request(b"b", true)));
        let fd = fd_of(&s, second);
        assert_eq!(s.registrar().interest(fd), Some(Interest::In));
        // Reused connection is already established; the exchange still wants to write first.
        s.on_socket_ready(fd, Readiness::WRITABLE);
        s.on_socket_ready(fd, Readiness::READABLE);
        let done = s.drain_completions();
        assert_eq!(done.len(), 2);
        let a = done[0].result.as_ref().unwrap();
        let b = done[1].result.as_ref().unwrap();
        assert_eq!(a.connection, b.connection);
        assert!(b.reused);
    }

    #[test]
    fn completions_follow_completion_order() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let a = s.submit(Transfer::new(key(), request(b"a", true)));
        let b = s.submit(Transfer::new(key(), request(b"b", true)));
        assert_ne!(fd_of(&s, a), fd_of(&s, b));
        run_to_done(&mut s, b);
        run_to_done(&mut s, a);
        let order: Vec<TransferId> = s.drain_completions().into_iter().map(|c| c.id).collect();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn readiness_on_unknown_fd_is_ignored() {
        let (mut s, _) = scheduler(EngineConfig::default());
        s.on_socket_ready(999, Readiness::READABLE);
        assert!(s.drain_completions().is_empty());
    }

    #[test]
    fn synchronous_connect_failure_completes_immediately() {
        let clock = ManualClock::new();
        let connector = FakeConnector {
            refuse: true,
            ..FakeConnector::default()
        };
        let mut s: Scheduler<FakeConnector> =
            Scheduler::with_clock(connector, EngineConfig::default(), clock);
        let id = s.submit(Transfer::new(key(), request(b"x", true)));
        let done = s.drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert!(matches!(
            done[0].result,
            Err(TransferError::ConnectFailed { .. })
        ));
        assert!(s.pool().is_empty());
        assert!(s.drain_socket_events().is_empty());
    }

    #[test]
    fn socket_error_while_connecting_discards_connection() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let closed = s.pool().connector().closed.clone();
        let id = s.submit(Transfer::new(key(), request(b"x", true)));
        let fd = fd_of(&s, id);
        s.on_socket_ready(fd, Readiness::ERROR);
        let done = s.drain_completions();
        assert!(matches!(
            done[0].result,
            Err(TransferError::ConnectAborted { .. })
        ));
        assert!(s.pool().is_empty());
        assert_eq!(*closed.borrow(), vec![fd]);
        assert!(!s.registrar().is_registered(fd));
    }

    #[test]
    fn protocol_failure_respects_clean_flag() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let clean = s.submit(Transfer::new(key(), |_: Fd, _: Readiness, _: &mut Vec<u8>| {
            Progress::Failed {
                reason: "404".into(),
                clean: true,
            }
        }));
        let fd = fd_of(&s, clean);
        s.on_socket_ready(fd, Readiness::WRITABLE);
        assert_eq!(s.pool().idle_count(), 1);

        let dirty = s.submit(Transfer::new(key(), |_: Fd, _: Readiness, _: &mut Vec<u8>| {
            Progress::Failed {
                reason: "garbage".into(),
                clean: false,
            }
        }));
        let fd = fd_of(&s, dirty);
        s.on_socket_ready(fd, Readiness::READABLE);
        assert_eq!(s.pool().len(), 0);
        let done = s.drain_completions();
        assert!(done
            .iter()
            .all(|c| matches!(c.result, Err(TransferError::TransferFailed { .. }))));
    }

    #[test]
    fn connect_timeout_fails_and_closes() {
        let config = EngineConfig {
            connect_timeout_ms: 100,
            ..EngineConfig::default()
        };
        let (mut s, clock) = scheduler(config);
        let id = s.submit(Transfer::new(key(), request(b"x", true)));
        assert_eq!(s.timeout(), Some(Duration::from_millis(100)));
        clock.advance(Duration::from_millis(50));
        s.on_timeout();
        assert!(s.drain_completions().is_empty());
        clock.advance(Duration::from_millis(50));
        s.on_timeout();
        let done = s.drain_completions();
        assert_eq!(done[0].id, id);
        assert!(matches!(done[0].result, Err(TransferError::TimedOut)));
        assert!(s.pool().is_empty());
        assert_eq!(s.timeout(), None);
    }

    #[test]
    fn transfer_timeout_overrides_default() {
        let config = EngineConfig {
            transfer_timeout_ms: 10_000,
            ..EngineConfig::default()
        };
        let (mut s, clock) = scheduler(config);
        let short = s.submit(
            Transfer::new(key(), request(b"x", true)).with_timeout(Duration::from_millis(20)),
        );
        let long = s.submit(Transfer::new(key(), request(b"y", true)));
        // Connect deadline (30 s) is later than the 20 ms transfer timeout.
        assert_eq!(s.timeout(), Some(Duration::from_millis(20)));
        clock.advance(Duration::from_millis(20));
        s.on_timeout();
        let done = s.drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, short);
        assert_eq!(s.running(), 1);
        assert_eq!(s.timeout(), Some(Duration::from_millis(9_980)));
        assert!(s.transfers.contains_key(&long));
    }

    #[test]
    fn cancel_mid_response_closes_connection() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let id = s.submit(Transfer::new(key(), request(b"x", true)));
        let fd = fd_of(&s, id);
        s.on_socket_ready(fd, Readiness::WRITABLE);
        assert!(s.cancel(id));
        assert!(!s.cancel(id));
        let done = s.drain_completions();
        assert!(matches!(done[0].result, Err(TransferError::Cancelled)));
        assert!(s.pool().is_empty());
    }

    struct CleanExchange;

    impl Exchange for CleanExchange {
        fn on_ready(&mut self, _fd: Fd, _r: Readiness, _sink: &mut Vec<u8>) -> Progress {
            Progress::Continue(Interest::In)
        }
        fn is_clean(&self) -> bool {
            true
        }
    }

    #[test]
    fn cancel_in_clean_state_keeps_connection() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let id = s.submit(Transfer::new(key(), CleanExchange));
        let fd = fd_of(&s, id);
        s.on_socket_ready(fd, Readiness::WRITABLE);
        s.cancel(id);
        assert_eq!(s.pool().idle_count(), 1);
    }

    #[test]
    fn cancel_while_connecting_never_pools() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let id = s.submit(Transfer::new(key(), CleanExchange));
        s.cancel(id);
        assert!(s.pool().is_empty());
    }

    #[test]
    fn unrepresentable_deadlines_mean_no_deadline() {
        let (mut s, _) = scheduler(EngineConfig::default());
        s.submit(Transfer::new(key(), request(b"x", true)).with_timeout(Duration::MAX));
        // Only the connect deadline is armed.
        assert_eq!(s.timeout(), Some(Duration::from_secs(30)));

        let config = EngineConfig {
            connect_timeout_ms: u64::MAX,
            max_idle_age_ms: u64::MAX,
            ..EngineConfig::default()
        };
        let (mut s, _) = scheduler(config);
        let id = s.submit(Transfer::new(key(), request(b"y", true)).with_timeout(Duration::MAX));
        run_to_done(&mut s, id);
        assert!(s.drain_completions()[0].result.is_ok());
        s.on_timeout();
        assert_eq!(s.pool().idle_count(), 1);
    }

    #[test]
    fn idle_expiry_drives_the_timer() {
        let config = EngineConfig {
            max_idle_age_ms: 1_000,
            ..EngineConfig::default()
        };
        let (mut s, clock) = scheduler(config);
        let id = s.submit(Transfer::new(key(), request(b"x", true)));
        run_to_done(&mut s, id);
        assert_eq!(s.pool().idle_count(), 1);
        assert_eq!(s.timeout(), Some(Duration::from_secs(1)));

        clock.advance(Duration::from_millis(400));
        assert_eq!(s.timeout(), Some(Duration::from_millis(600)));
        clock.advance(Duration::from_millis(600));
        s.on_timeout();
        assert!(s.pool().is_empty());
        assert_eq!(s.timeout(), None);
        assert_eq!(s.drain_completions().len(), 1);
    }

    #[test]
    fn cancel_queued_transfer_removes_it() {
        let config = EngineConfig {
            max_connections_per_key: 1,
            ..EngineConfig::default()
        };
        let (mut s, _) = scheduler(config);
        let a = s.submit(Transfer::new(key(), request(b"a", true)));
        let b = s.submit(Transfer::new(key(), request(b"b", true)));
        assert_eq!(s.queued(), 1);

        assert!(s.cancel(b));
        assert!(!s.cancel(b));
        assert_eq!(s.queued(), 0);
        let done = s.drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, b);
        assert!(matches!(done[0].result, Err(TransferError::Cancelled)));
        // Never bound, so no socket events beyond a's ADD.
        assert_eq!(s.drain_socket_events().len(), 1);

        run_to_done(&mut s, a);
        let done = s.drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, a);
        assert_eq!(s.running(), 0);
        assert_eq!(s.pool().idle_count(), 1);
        assert!(s.registrar().is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "succeeded without a connection")]
    fn success_without_connection_is_a_logic_error() {
        let config = EngineConfig {
            max_connections_per_key: 1,
            ..EngineConfig::default()
        };
        let (mut s, clock) = scheduler(config);
        s.submit(Transfer::new(key(), request(b"a", true)));
        let b = s.submit(Transfer::new(key(), request(b"b", true)));
        s.finish(b, Ok(()), true, clock.now());
    }

    #[test]
    fn per_key_limit_queues_and_hands_over() {
        let config = EngineConfig {
            max_connections_per_key: 1,
            ..EngineConfig::default()
        };
        let (mut s, _) = scheduler(config);
        let a = s.submit(Transfer::new(key(), request(b"a", true)));
        let b = s.submit(Transfer::new(key(), request(b"b", true)));
        assert_eq!(s.queued(), 1);
        assert_eq!(s.pool().len(), 1);
        run_to_done(&mut s, a);
        // b took over the idle connection.
        assert_eq!(s.queued(), 0);
        let fd = fd_of(&s, b);
        s.on_socket_ready(fd, Readiness::WRITABLE);
        s.on_socket_ready(fd, Readiness::READABLE);
        let done = s.drain_completions();
        assert_eq!(done.len(), 2);
        assert!(done[1].result.as_ref().unwrap().reused);
    }

    #[test]
    fn fatal_failure_aborts_queued_waiters() {
        let config = EngineConfig {
            max_connections_per_key: 1,
            ..EngineConfig::default()
        };
        let (mut s, _) = scheduler(config);
        let a = s.submit(Transfer::new(key(), |_: Fd, _: Readiness, _: &mut Vec<u8>| {
            Progress::Failed {
                reason: "reset".into(),
                clean: false,
            }
        }));
        let b = s.submit(Transfer::new(key(), request(b"b", true)));
        let c = s.submit(Transfer::new(key(), request(b"c", true)));
        let fd = fd_of(&s, a);
        s.on_socket_ready(fd, Readiness::WRITABLE);
        let done = s.drain_completions();
        let ids: Vec<TransferId> = done.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert!(matches!(done[1].result, Err(TransferError::Aborted { .. })));
        assert!(matches!(done[2].result, Err(TransferError::Aborted { .. })));
        assert_eq!(s.running(), 0);
    }

    #[test]
    fn timeout_of_connection_frees_slot_for_queue() {
        let config = EngineConfig {
            max_connections_per_key: 1,
            connect_timeout_ms: 10,
            ..EngineConfig::default()
        };
        let (mut s, clock) = scheduler(config);
        let a = s.submit(Transfer::new(key(), request(b"a", true)));
        let b = s.submit(Transfer::new(key(), request(b"b", true)));
        clock.advance(Duration::from_millis(10));
        s.on_timeout();
        let done = s.drain_completions();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, a);
        // b started on a fresh connection.
        assert_eq!(s.queued(), 0);
        let fd = fd_of(&s, b);
        assert_eq!(s.registrar().interest(fd), Some(Interest::Out));
    }

    #[test]
    fn shutdown_completes_everything_once() {
        let config = EngineConfig {
            max_connections_per_key: 1,
            ..EngineConfig::default()
        };
        let (mut s, _) = scheduler(config);
        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();
        let cb = CloseCallback::new(move |_| *counter.lock().unwrap() += 1);
        s.submit(Transfer::new(key(), request(b"a", true)).with_close_callback(cb));
        s.submit(Transfer::new(key(), request(b"b", true)));
        s.shutdown();
        let done = s.drain_completions();
        assert_eq!(done.len(), 2);
        assert!(done
            .iter()
            .all(|c| matches!(c.result, Err(TransferError::Cancelled))));
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(s.pool().is_empty());
        assert!(s.registrar().is_empty());
        assert_eq!(s.running(), 0);
    }

    #[test]
    fn assign_and_lookup_pass_through() {
        let (mut s, _) = scheduler(EngineConfig::default());
        let id = s.submit(Transfer::new(key(), request(b"a", true)));
        let fd = fd_of(&s, id);
        assert_eq!(s.assign(fd, 42).unwrap(), None);
        assert_eq!(s.lookup(fd).unwrap(), Some(&42));
        run_to_done(&mut s, id);
        assert_eq!(s.lookup(fd), Err(RegistrarError::InvalidHandle(fd)));
        let removed = s
            .drain_socket_events()
            .into_iter()
            .find_map(|e| match e.action {
                SocketAction::Remove { last_data } => Some(last_data),
                _ => None,
            });
        assert_eq!(removed, Some(Some(42)));
    }
}
