//! Connection pool for one cluster.
//!
//! A pool lazily creates connections up to `max_pool_size`, hands them out
//! either sticky (bound to the requesting session) or shared (any session of
//! the cluster), and drains them on shutdown. Every state transition happens
//! under the pool lock; waiters are woken through a [`Notify`] whenever a
//! connection is returned, a reservation is given back, or draining starts.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{OnExhausted, OnStickyMiss, OperationalConfig};
use crate::errors::{BatchError, BatchErrorKind, BatchResult};
use crate::observability::{PoolMetrics, Timer};
use crate::transport::{HandleState, PooledTransport, Transport, TransportFactory};
use crate::types::{ClusterKey, PoolStatus, Session, ShutdownReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Draining,
    Closed,
}

enum Slot {
    Idle(Box<dyn Transport>),
    Borrowed,
    Invalid(Box<dyn Transport>),
    Closed,
}

struct Entry {
    id: u64,
    session: Session,
    sticky: bool,
    slot: Slot,
    created_at: Instant,
    idle_since: Instant,
}

impl Entry {
    fn state(&self) -> HandleState {
        match self.slot {
            Slot::Idle(_) => HandleState::Idle,
            Slot::Borrowed => HandleState::Borrowed,
            Slot::Invalid(_) => HandleState::Invalid,
            Slot::Closed => HandleState::Closed,
        }
    }

    /// Idle -> Borrowed.
    fn checkout(&mut self) -> Option<Box<dyn Transport>> {
        match std::mem::replace(&mut self.slot, Slot::Borrowed) {
            Slot::Idle(transport) => Some(transport),
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// {Idle, Invalid} -> Closed. Borrowed entries are left alone.
    fn retire(&mut self) -> Option<Box<dyn Transport>> {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Idle(transport) | Slot::Invalid(transport) => Some(transport),
            other => {
                self.slot = other;
                None
            }
        }
    }
}

struct PoolState {
    entries: Vec<Entry>,
    pending: usize,
    phase: Phase,
    members: Vec<Session>,
}

impl PoolState {
    fn count(&self, state: HandleState) -> usize {
        self.entries.iter().filter(|e| e.state() == state).count()
    }

    /// Connections counted against capacity.
    fn live(&self) -> usize {
        self.count(HandleState::Idle) + self.count(HandleState::Borrowed) + self.pending
    }

    /// Connections a drain has to wait for.
    fn outstanding(&self) -> usize {
        self.count(HandleState::Borrowed) + self.pending
    }

    /// Sticky claims need the exact session; shared claims take any
    /// connection created from an equivalent one.
    fn find_idle(&self, session: &Session, sticky: bool) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state() == HandleState::Idle)
            .filter(|(_, e)| {
                if sticky {
                    e.session.same_identity(session)
                } else {
                    e.session.is_equivalent(session)
                }
            })
            .max_by_key(|(_, e)| e.idle_since)
            .map(|(index, _)| index)
    }

    fn oldest_idle(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state() == HandleState::Idle)
            .min_by_key(|(_, e)| e.idle_since)
            .map(|(index, _)| index)
    }

    fn prune_closed(&mut self) {
        self.entries.retain(|e| e.state() != HandleState::Closed);
    }
}

enum Claim<'a> {
    Ready(PooledTransport),
    Create(Reservation<'a>),
    Wait,
}

/// Point-in-time view of one pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    /// Pool-assigned handle id.
    pub id: u64,
    /// Lifecycle state.
    pub state: HandleState,
    /// Identity of the session the connection was created from.
    pub session_id: Uuid,
    /// True if created by a sticky acquire.
    pub sticky: bool,
    /// Time since the connection was created.
    pub age: Duration,
}

/// Pool of transports for one cluster key.
pub struct ConnectionPool {
    cluster_key: ClusterKey,
    config: OperationalConfig,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<PoolState>,
    changed: Notify,
    metrics: PoolMetrics,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Creates an empty pool. Connections are created on demand.
    pub fn new(
        cluster_key: ClusterKey,
        config: OperationalConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            cluster_key,
            config,
            factory,
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                pending: 0,
                phase: Phase::Open,
                members: Vec::new(),
            }),
            changed: Notify::new(),
            metrics: PoolMetrics::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the cluster key this pool serves.
    pub fn cluster_key(&self) -> ClusterKey {
        self.cluster_key
    }

    /// Returns the configuration the pool was created with.
    pub fn config(&self) -> &OperationalConfig {
        &self.config
    }

    /// Returns the pool metrics.
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Returns true once shutdown has started.
    pub fn is_draining(&self) -> bool {
        self.state.lock().phase != Phase::Open
    }

    /// Returns true once every idle connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    /// Returns the pool status.
    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let idle = state.count(HandleState::Idle);
        let in_use = state.count(HandleState::Borrowed);
        PoolStatus {
            total: idle + in_use + state.pending,
            idle,
            in_use,
            invalid: state.count(HandleState::Invalid),
            pending: state.pending,
            max_size: self.config.max_pool_size,
            draining: state.phase != Phase::Open,
        }
    }

    /// Returns a snapshot of every tracked connection.
    pub fn handles(&self) -> Vec<HandleInfo> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|e| HandleInfo {
                id: e.id,
                state: e.state(),
                session_id: e.session.id(),
                sticky: e.sticky,
                age: e.created_at.elapsed(),
            })
            .collect()
    }

    /// Records a session as a member of this cluster. Returns false if it already was.
    pub fn add_member(&self, session: &Session) -> bool {
        let mut state = self.state.lock();
        if state.members.iter().any(|m| m.same_identity(session)) {
            return false;
        }
        state.members.push(session.clone());
        true
    }

    /// Returns true if the session was registered to this cluster.
    pub fn has_member(&self, session: &Session) -> bool {
        self.state
            .lock()
            .members
            .iter()
            .any(|m| m.same_identity(session))
    }

    /// Returns the sessions registered to this cluster.
    pub fn members(&self) -> Vec<Session> {
        self.state.lock().members.clone()
    }

    /// Borrows a connection.
    ///
    /// With `sticky` the connection is guaranteed to have been created from
    /// `session`; otherwise any healthy idle connection created from an
    /// equivalent session may be returned. When the pool is at capacity the
    /// call follows the configured [`OnExhausted`] policy.
    ///
    /// Dropping the returned future gives back any capacity it had claimed.
    pub async fn acquire(
        self: &Arc<Self>,
        session: &Session,
        sticky: bool,
    ) -> BatchResult<PooledTransport> {
        let deadline = match self.config.on_exhausted {
            OnExhausted::WaitWithTimeout => Some(Instant::now() + self.config.claim_timeout),
            _ => None,
        };

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let mut retired = Vec::new();
            let claim = self.try_claim(session, sticky, &mut retired);
            self.close_retired(retired).await;

            match claim {
                Ok(Claim::Ready(handle)) => {
                    self.metrics.record_acquisition(true);
                    return Ok(handle);
                }
                Ok(Claim::Create(reservation)) => {
                    return self.create(reservation, session, sticky).await
                }
                Ok(Claim::Wait) => {}
                Err(e) => {
                    self.metrics.record_rejection();
                    return Err(e);
                }
            }

            match self.config.on_exhausted {
                OnExhausted::Reject => {
                    self.metrics.record_rejection();
                    return Err(BatchError::pool(
                        BatchErrorKind::PoolExhausted,
                        format!(
                            "connection pool for cluster {} is at capacity ({})",
                            self.cluster_key, self.config.max_pool_size
                        ),
                    ));
                }
                OnExhausted::Wait => {
                    self.metrics.record_wait();
                    changed.await;
                }
                OnExhausted::WaitWithTimeout => {
                    self.metrics.record_wait();
                    let remaining = deadline
                        .map(|d| d.saturating_duration_since(Instant::now()))
                        .unwrap_or_default();
                    if tokio::time::timeout(remaining, changed).await.is_err() {
                        self.metrics.record_timeout();
                        return Err(BatchError::pool(
                            BatchErrorKind::AcquireTimeout,
                            format!(
                                "timed out after {:?} waiting for a connection in cluster {}",
                                self.config.claim_timeout, self.cluster_key
                            ),
                        ));
                    }
                }
            }
        }
    }

    fn try_claim<'a>(
        self: &'a Arc<Self>,
        session: &Session,
        sticky: bool,
        retired: &mut Vec<Box<dyn Transport>>,
    ) -> BatchResult<Claim<'a>> {
        let mut state = self.state.lock();
        if state.phase != Phase::Open {
            return Err(BatchError::draining(self.cluster_key));
        }

        self.retire_idle(&mut state, retired);

        if let Some(index) = state.find_idle(session, sticky) {
            let entry = &mut state.entries[index];
            if let Some(transport) = entry.checkout() {
                let handle = PooledTransport::new(
                    Arc::clone(self),
                    entry.id,
                    entry.session.clone(),
                    entry.sticky,
                    transport,
                );
                return Ok(Claim::Ready(handle));
            }
        }

        if state.live() < self.config.max_pool_size {
            Self::retire_invalid(&mut state, retired);
            return Ok(Claim::Create(self.reserve(&mut state)));
        }

        // Every idle connection left belongs to a session this claim cannot use.
        let may_evict = !sticky || matches!(self.config.on_sticky_miss, OnStickyMiss::Create);
        if may_evict {
            if let Some(index) = state.oldest_idle() {
                if let Some(transport) = state.entries[index].retire() {
                    retired.push(transport);
                    self.metrics.record_retirements(1);
                    state.prune_closed();
                    Self::retire_invalid(&mut state, retired);
                    return Ok(Claim::Create(self.reserve(&mut state)));
                }
            }
        } else {
            let owns_any = state.entries.iter().any(|e| {
                e.state() == HandleState::Borrowed && e.session.same_identity(session)
            });
            if !owns_any {
                return Err(BatchError::pool(
                    BatchErrorKind::PoolExhausted,
                    format!(
                        "connection pool for cluster {} is full and session {} owns no connection",
                        self.cluster_key,
                        session.id()
                    ),
                ));
            }
        }

        Ok(Claim::Wait)
    }

    /// Holds one unit of capacity for a connection about to be created.
    fn reserve<'a>(&'a self, state: &mut PoolState) -> Reservation<'a> {
        state.pending += 1;
        Reservation {
            pool: self,
            armed: true,
        }
    }

    /// Retires stale idle connections and those idle past `expire_after`
    /// while the pool holds more than `core_pool_size` live connections.
    fn retire_idle(&self, state: &mut PoolState, retired: &mut Vec<Box<dyn Transport>>) {
        let now = Instant::now();
        let mut live = state.live();
        let before = retired.len();

        for entry in state.entries.iter_mut() {
            let stale = match &entry.slot {
                Slot::Idle(transport) => !transport.is_connected(),
                _ => continue,
            };
            let expired = live > self.config.core_pool_size
                && now.duration_since(entry.idle_since) >= self.config.expire_after;
            if stale || expired {
                if let Some(transport) = entry.retire() {
                    retired.push(transport);
                    live -= 1;
                }
            }
        }

        if retired.len() > before {
            self.metrics.record_retirements(retired.len() - before);
            state.prune_closed();
        }
    }

    fn retire_invalid(state: &mut PoolState, retired: &mut Vec<Box<dyn Transport>>) {
        let before = retired.len();
        for entry in state
            .entries
            .iter_mut()
            .filter(|e| e.state() == HandleState::Invalid)
        {
            if let Some(transport) = entry.retire() {
                retired.push(transport);
            }
        }
        if retired.len() > before {
            state.prune_closed();
        }
    }

    /// Closes retired connections on their own task, which runs to the end
    /// even if the acquiring caller is dropped.
    async fn close_retired(self: &Arc<Self>, retired: Vec<Box<dyn Transport>>) {
        if retired.is_empty() {
            return;
        }
        let pool = Arc::clone(self);
        let closing = async move {
            for mut transport in retired {
                let closed = transport.close().await;
                pool.metrics.record_close(closed.is_ok());
                #[cfg(feature = "tracing")]
                if let Err(e) = closed {
                    tracing::warn!(
                        cluster_key = %pool.cluster_key,
                        error = %e,
                        "Failed to close retired connection"
                    );
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let _ = runtime.spawn(closing).await;
            }
            Err(_) => closing.await,
        }
    }

    async fn create(
        self: &Arc<Self>,
        mut reservation: Reservation<'_>,
        session: &Session,
        sticky: bool,
    ) -> BatchResult<PooledTransport> {
        match self.factory.connect(session).await {
            Ok(transport) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                {
                    let mut state = self.state.lock();
                    state.pending -= 1;
                    reservation.armed = false;
                    let now = Instant::now();
                    state.entries.push(Entry {
                        id,
                        session: session.clone(),
                        sticky,
                        slot: Slot::Borrowed,
                        created_at: now,
                        idle_since: now,
                    });
                }
                self.metrics.record_creation(true);
                self.metrics.record_acquisition(false);

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    cluster_key = %self.cluster_key,
                    handle_id = id,
                    sticky,
                    "Created pooled connection"
                );

                Ok(PooledTransport::new(
                    Arc::clone(self),
                    id,
                    session.clone(),
                    sticky,
                    transport,
                ))
            }
            Err(e) => {
                drop(reservation);
                self.metrics.record_creation(false);

                #[cfg(feature = "tracing")]
                tracing::warn!(
                    cluster_key = %self.cluster_key,
                    server = %session.config().address(),
                    error = %e,
                    "Failed to create pooled connection"
                );

                Err(BatchError::connection(format!(
                    "failed to connect to {} for cluster {}",
                    session.config().address(),
                    self.cluster_key
                ))
                .with_cause(e))
            }
        }
    }

    /// Takes a connection back from a borrower.
    pub(crate) fn check_in(&self, id: u64, transport: Box<dyn Transport>, failed: bool) {
        let healthy = !failed && transport.is_connected();
        let orphan = {
            let mut state = self.state.lock();
            let phase = state.phase;
            match state.entries.iter_mut().find(|e| e.id == id) {
                Some(entry) if phase != Phase::Closed => {
                    if healthy {
                        entry.slot = Slot::Idle(transport);
                        entry.idle_since = Instant::now();
                    } else {
                        entry.slot = Slot::Invalid(transport);
                    }
                    None
                }
                Some(entry) => {
                    entry.slot = Slot::Closed;
                    Some(transport)
                }
                None => Some(transport),
            }
        };

        self.metrics.record_check_in(!healthy);
        self.changed.notify_waiters();

        #[cfg(feature = "tracing")]
        tracing::trace!(
            cluster_key = %self.cluster_key,
            handle_id = id,
            healthy,
            "Connection checked in"
        );

        if let Some(transport) = orphan {
            self.close_detached(transport);
        }
    }

    /// Closes a connection in the background on the current runtime.
    fn close_detached(&self, mut transport: Box<dyn Transport>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                #[cfg(feature = "tracing")]
                let cluster_key = self.cluster_key;
                runtime.spawn(async move {
                    let closed = transport.close().await;
                    #[cfg(feature = "tracing")]
                    if let Err(e) = closed {
                        tracing::warn!(%cluster_key, error = %e, "Failed to close late connection");
                    }
                    #[cfg(not(feature = "tracing"))]
                    let _ = closed;
                });
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    cluster_key = %self.cluster_key,
                    "No runtime to close late connection, dropping it"
                );
            }
        }
    }

    /// Stops handing out connections and wakes every waiter.
    ///
    /// Returns false if shutdown had already started.
    pub fn begin_drain(&self) -> bool {
        let started = {
            let mut state = self.state.lock();
            if state.phase == Phase::Open {
                state.phase = Phase::Draining;
                true
            } else {
                false
            }
        };

        if started {
            #[cfg(feature = "tracing")]
            tracing::info!(cluster_key = %self.cluster_key, "Draining connection pool");
            self.changed.notify_waiters();
        }
        started
    }

    /// Closes the pool without waiting for borrowed connections.
    ///
    /// Idle connections are closed in the background, borrowed ones as they
    /// come back. Does nothing once the pool is closed.
    pub(crate) fn abandon(&self) {
        let to_close: Vec<Box<dyn Transport>> = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.entries.iter_mut().filter_map(Entry::retire).collect()
        };
        self.changed.notify_waiters();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            cluster_key = %self.cluster_key,
            closing = to_close.len(),
            "Connection pool abandoned before its drain finished"
        );

        for transport in to_close {
            self.close_detached(transport);
        }
    }

    /// Drains the pool: waits for borrowed connections to come back, then
    /// closes every connection.
    ///
    /// With `timeout` set, connections still borrowed when it expires are
    /// reported as abandoned and closed in the background once released.
    pub async fn drain(&self, timeout: Option<Duration>) -> ShutdownReport {
        let timer = Timer::start("pool_drain");
        self.begin_drain();

        let returned = async {
            loop {
                let changed = self.changed.notified();
                tokio::pin!(changed);
                changed.as_mut().enable();

                let outstanding = self.state.lock().outstanding();
                if outstanding == 0 {
                    break;
                }
                changed.await;
            }
        };

        let mut abandoned = 0;
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, returned).await.is_err() {
                    abandoned = self.state.lock().outstanding();

                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        cluster_key = %self.cluster_key,
                        abandoned,
                        "Drain timeout expired with connections still in use"
                    );
                }
            }
            None => returned.await,
        }

        let to_close: Vec<(u64, Box<dyn Transport>)> = {
            let mut state = self.state.lock();
            state.phase = Phase::Closed;
            state
                .entries
                .iter_mut()
                .filter_map(|e| {
                    let id = e.id;
                    e.retire().map(|transport| (id, transport))
                })
                .collect()
        };
        self.changed.notify_waiters();

        let mut closed = 0;
        let mut close_failures = 0;
        for (id, mut transport) in to_close {
            match transport.close().await {
                Ok(()) => {
                    closed += 1;
                    self.metrics.record_close(true);
                }
                Err(e) => {
                    close_failures += 1;
                    self.metrics.record_close(false);

                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        cluster_key = %self.cluster_key,
                        handle_id = id,
                        error = %e,
                        "Failed to close connection during shutdown"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = (id, e);
                }
            }
        }

        let report = ShutdownReport {
            cluster_key: self.cluster_key,
            closed,
            close_failures,
            abandoned,
            duration: timer.stop(),
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            cluster_key = %self.cluster_key,
            closed = report.closed,
            close_failures = report.close_failures,
            abandoned = report.abandoned,
            "Connection pool closed"
        );

        report
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("cluster_key", &self.cluster_key)
            .field("status", &self.status())
            .finish()
    }
}

/// Capacity held for a connection being created. Returned on drop unless
/// the connection made it into the pool.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.state.lock().pending -= 1;
            self.pool.changed.notify_waiters();
        }
    }
}
