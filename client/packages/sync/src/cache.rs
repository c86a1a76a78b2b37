use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;
use workbench_error::SyncError;

use crate::dispatcher::Subscription;
use crate::invalidation::QueryKey;
use crate::registry::{Connection, ConnectionLease, ConnectionState, ConnectionStatus};
use crate::sdk::OpencodeClient;

pub type Fetcher<T> =
    Arc<dyn Fn(OpencodeClient) -> BoxFuture<'static, Result<T, SyncError>> + Send + Sync>;

/// Computes the next poll delay from the current data; `None` stops polling.
pub type PollPolicy<T> = Arc<dyn Fn(Option<&T>) -> Option<Duration> + Send + Sync>;

/// What a consumer sees for one read.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub error: Option<SyncError>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub connection: ConnectionStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_fetching: false,
            is_stale: false,
            connection: ConnectionStatus::Disconnected,
            updated_at: None,
        }
    }
}

impl<T> QueryState<T> {
    /// The first fetch has not settled, or the owning connection is not up.
    pub fn is_loading(&self) -> bool {
        self.connection != ConnectionStatus::Connected
            || (self.data.is_none() && self.error.is_none())
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Default)]
struct CellInner {
    next_seq: u64,
    applied_seq: u64,
    invalidated_seq: u64,
    in_flight: usize,
    observers: usize,
    loaded: bool,
    stale: bool,
    /// Set when the last observer leaves; cleared when the cache hands the
    /// cell out again.
    idle_since: Option<Instant>,
    poller: Option<JoinHandle<()>>,
}

/// One cached read. The fetch path is its only writer; every fetch carries a
/// sequence number and results older than the last applied result or the
/// last invalidation are dropped.
pub(crate) struct QueryCell<T> {
    key: QueryKey,
    connection: Arc<Connection>,
    fetcher: Fetcher<T>,
    policy: Option<PollPolicy<T>>,
    state_tx: watch::Sender<QueryState<T>>,
    inner: Mutex<CellInner>,
}

impl<T> QueryCell<T> {
    fn lock(&self) -> MutexGuard<'_, CellInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unobserve(&self) {
        let mut inner = self.lock();
        inner.observers = inner.observers.saturating_sub(1);
        if inner.observers == 0 {
            inner.idle_since = Some(Instant::now());
            if let Some(poller) = inner.poller.take() {
                poller.abort();
                debug!(key = %self.key, "poll timer cancelled");
            }
        }
    }

    fn reserve(&self) {
        self.lock().idle_since = None;
    }

    fn idle(&self) -> Option<(Instant, bool)> {
        let inner = self.lock();
        match inner.idle_since {
            Some(since) if inner.observers == 0 => Some((since, inner.stale)),
            _ => None,
        }
    }

    fn stop_polling(&self) {
        if let Some(poller) = self.lock().poller.take() {
            poller.abort();
        }
    }
}

impl<T> QueryCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(
        key: QueryKey,
        connection: Arc<Connection>,
        fetcher: Fetcher<T>,
        policy: Option<PollPolicy<T>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(QueryState::default());
        Self {
            key,
            connection,
            fetcher,
            policy,
            state_tx,
            inner: Mutex::new(CellInner::default()),
        }
    }

    fn begin_fetch(&self, inner: &mut CellInner) -> u64 {
        inner.next_seq += 1;
        inner.in_flight += 1;
        self.state_tx.send_if_modified(|state| {
            let changed = !state.is_fetching;
            state.is_fetching = true;
            changed
        });
        inner.next_seq
    }

    fn launch(self: &Arc<Self>, seq: u64) -> Option<JoinHandle<()>> {
        let cell = self.clone();
        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                let result = (cell.fetcher)(cell.connection.client().clone()).await;
                cell.connection.report_request_result(&result);
                cell.finish(seq, result);
            })),
            Err(_) => {
                self.finish(
                    seq,
                    Err(SyncError::invalid_request("fetch requires a tokio runtime")),
                );
                None
            }
        }
    }

    fn finish(&self, seq: u64, result: Result<T, SyncError>) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        let fetching = inner.in_flight > 0;

        let superseded = seq <= inner.applied_seq.max(inner.invalidated_seq);
        if inner.observers == 0 || superseded {
            debug!(key = %self.key, seq, superseded, "discarding fetch result");
            self.state_tx.send_if_modified(|state| {
                let changed = state.is_fetching != fetching;
                state.is_fetching = fetching;
                changed
            });
            return;
        }

        inner.applied_seq = seq;
        match result {
            Ok(data) => {
                inner.loaded = true;
                inner.stale = false;
                self.state_tx.send_modify(|state| {
                    state.data = Some(data);
                    state.error = None;
                    state.is_stale = false;
                    state.is_fetching = fetching;
                    state.updated_at = Some(Utc::now());
                });
            }
            Err(err) => {
                debug!(key = %self.key, error = %err, "fetch failed");
                self.state_tx.send_modify(|state| {
                    state.error = Some(err);
                    state.is_fetching = fetching;
                });
            }
        }
    }

    fn observe(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.observers += 1;
        if inner.observers == 1 && inner.poller.is_none() {
            inner.poller = self.spawn_poller();
        }
        let needs_fetch = inner.in_flight == 0 && (!inner.loaded || inner.stale);
        if !needs_fetch || self.connection.status() != ConnectionStatus::Connected {
            return;
        }
        let seq = self.begin_fetch(&mut inner);
        drop(inner);
        self.launch(seq);
    }

    fn spawn_poller(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let policy = self.policy.clone()?;
        let handle = Handle::try_current().ok()?;
        Some(handle.spawn(poll_loop(
            Arc::downgrade(self),
            self.state_tx.subscribe(),
            policy,
        )))
    }

    /// First connect: load what has never loaded or went stale while offline.
    fn fetch_if_needed(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.observers == 0 || inner.in_flight > 0 || (inner.loaded && !inner.stale) {
            return;
        }
        let seq = self.begin_fetch(&mut inner);
        drop(inner);
        self.launch(seq);
    }

    /// Marks the entry stale, discards fetches already under way, and
    /// refetches when someone is watching and the connection is up.
    fn invalidate(self: &Arc<Self>) {
        let mut inner = self.lock();
        inner.invalidated_seq = inner.next_seq;
        inner.stale = true;
        self.state_tx.send_if_modified(|state| {
            let changed = !state.is_stale;
            state.is_stale = true;
            changed
        });
        if inner.observers == 0 || self.connection.status() != ConnectionStatus::Connected {
            return;
        }
        let seq = self.begin_fetch(&mut inner);
        drop(inner);
        self.launch(seq);
    }

    fn poll_tick(self: &Arc<Self>) {
        if self.connection.status() != ConnectionStatus::Connected {
            return;
        }
        let mut inner = self.lock();
        if inner.observers == 0 || inner.in_flight > 0 {
            return;
        }
        let seq = self.begin_fetch(&mut inner);
        drop(inner);
        self.launch(seq);
    }

    async fn refetch(self: &Arc<Self>) -> QueryState<T> {
        let seq = {
            let mut inner = self.lock();
            inner.invalidated_seq = inner.next_seq;
            self.begin_fetch(&mut inner)
        };
        if let Some(task) = self.launch(seq) {
            let _ = task.await;
        }
        self.state_tx.borrow().clone()
    }
}

async fn poll_loop<T>(
    cell: Weak<QueryCell<T>>,
    mut rx: watch::Receiver<QueryState<T>>,
    policy: PollPolicy<T>,
) where
    T: Clone + Send + Sync + 'static,
{
    loop {
        let interval = {
            let state = rx.borrow_and_update();
            policy(state.data.as_ref())
        };
        match interval {
            Some(interval) => {
                tokio::select! {
                    _ = sleep(interval) => {
                        let Some(cell) = cell.upgrade() else {
                            return;
                        };
                        cell.poll_tick();
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            None => {
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

trait CacheEntry: Send + Sync {
    fn key(&self) -> &QueryKey;
    fn connection(&self) -> &Arc<Connection>;
    fn invalidate(self: Arc<Self>);
    fn connected(self: Arc<Self>, resumed: bool);
    fn evict(&self);
    /// When the entry has no observers: since when, and whether it is stale.
    fn idle(&self) -> Option<(Instant, bool)>;
    fn reserve(&self);
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> CacheEntry for QueryCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &QueryKey {
        &self.key
    }

    fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn invalidate(self: Arc<Self>) {
        QueryCell::invalidate(&self);
    }

    fn connected(self: Arc<Self>, resumed: bool) {
        if resumed {
            QueryCell::invalidate(&self);
        } else {
            self.fetch_if_needed();
        }
    }

    fn evict(&self) {
        self.stop_polling();
    }

    fn idle(&self) -> Option<(Instant, bool)> {
        QueryCell::idle(self)
    }

    fn reserve(&self) {
        QueryCell::reserve(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub const DEFAULT_IDLE_ENTRY_LIMIT: usize = 128;

type Entries = HashMap<QueryKey, Arc<dyn CacheEntry>>;

/// Every cached read across all workspaces, keyed by `QueryKey`. Entries
/// nobody observes are kept for quick re-display until they go stale or the
/// idle limit pushes the oldest out.
pub struct QueryCache {
    entries: Mutex<Entries>,
    idle_limit: usize,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::with_idle_limit(DEFAULT_IDLE_ENTRY_LIMIT)
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_limit(idle_limit: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_limit,
        }
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching(&self, matches: impl Fn(&dyn CacheEntry) -> bool) -> Vec<Arc<dyn CacheEntry>> {
        self.entries()
            .values()
            .filter(|entry| matches(entry.as_ref()))
            .cloned()
            .collect()
    }

    pub(crate) fn cell<T>(
        &self,
        key: QueryKey,
        connection: &Arc<Connection>,
        fetcher: Fetcher<T>,
        policy: Option<PollPolicy<T>>,
    ) -> Arc<QueryCell<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&key) {
            let same_connection = Arc::ptr_eq(existing.connection(), connection);
            if let Ok(cell) = existing.clone().as_any().downcast::<QueryCell<T>>() {
                if same_connection {
                    cell.reserve();
                    return cell;
                }
            }
            existing.evict();
        }
        let cell = Arc::new(QueryCell::new(key.clone(), connection.clone(), fetcher, policy));
        entries.insert(key, cell.clone());
        self.prune_idle(&mut entries);
        cell
    }

    /// Drops unobserved entries that are stale, then the oldest unobserved
    /// ones beyond the idle limit.
    fn prune_idle(&self, entries: &mut Entries) {
        let mut idle: Vec<(Instant, QueryKey)> = Vec::new();
        let mut removed = Vec::new();
        for (key, entry) in entries.iter() {
            match entry.idle() {
                Some((_, true)) => removed.push(key.clone()),
                Some((since, false)) => idle.push((since, key.clone())),
                None => {}
            }
        }
        if idle.len() > self.idle_limit {
            idle.sort_by_key(|(since, _)| *since);
            let excess = idle.len() - self.idle_limit;
            removed.extend(idle.into_iter().take(excess).map(|(_, key)| key));
        }
        for key in removed {
            if let Some(entry) = entries.remove(&key) {
                debug!(key = %key, "evicting idle cache entry");
                entry.evict();
            }
        }
    }

    /// Invalidates every entry `pattern` covers. Returns how many matched.
    pub fn invalidate(&self, pattern: &QueryKey) -> usize {
        let matched = self.matching(|entry| pattern.covers(entry.key()));
        let count = matched.len();
        for entry in matched {
            entry.invalidate();
        }
        self.prune_idle(&mut self.entries());
        count
    }

    pub fn connected(&self, workspace_id: &str, resumed: bool) {
        let matched = self.matching(|entry| entry.key().workspace_id == workspace_id);
        if resumed {
            debug!(workspace_id = %workspace_id, keys = matched.len(), "refetching after reconnect");
        }
        for entry in matched {
            entry.connected(resumed);
        }
    }

    /// Drops the workspace's entries whose connection has been closed.
    pub fn evict_closed(&self, workspace_id: &str) -> usize {
        let removed: Vec<_> = {
            let mut entries = self.entries();
            let keys: Vec<QueryKey> = entries
                .iter()
                .filter(|(key, entry)| {
                    key.workspace_id == workspace_id && entry.connection().is_closed()
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };
        for entry in &removed {
            entry.evict();
        }
        removed.len()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// A live, observed read. Holding it keeps the workspace connection leased
/// and the entry's poll timer running; dropping it cancels the timer.
pub struct Query<T> {
    cell: Arc<QueryCell<T>>,
    rx: watch::Receiver<QueryState<T>>,
    connection_rx: watch::Receiver<ConnectionState>,
    _lease: ConnectionLease,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(cell: Arc<QueryCell<T>>, lease: ConnectionLease) -> Self {
        cell.observe();
        Self {
            rx: cell.state_tx.subscribe(),
            connection_rx: lease.watch_state(),
            cell,
            _lease: lease,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.cell.key
    }

    pub fn snapshot(&self) -> QueryState<T> {
        let mut state = self.rx.borrow().clone();
        state.connection = self.connection_rx.borrow().status;
        state
    }

    pub fn data(&self) -> Option<T> {
        self.rx.borrow().data.clone()
    }

    /// Resolves on the next change to the data, its flags, or the owning
    /// connection's status.
    pub async fn changed(&mut self) -> Result<(), SyncError> {
        let result = tokio::select! {
            changed = self.rx.changed() => changed,
            changed = self.connection_rx.changed() => changed,
        };
        result.map_err(|_| SyncError::NotConnected {
            workspace_id: self.cell.key.workspace_id.clone(),
        })
    }

    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(&QueryState<T>) -> bool,
    ) -> Result<QueryState<T>, SyncError> {
        loop {
            let state = self.snapshot();
            if predicate(&state) {
                return Ok(state);
            }
            self.changed().await?;
        }
    }

    /// Fetches now, discarding anything already in flight, and returns the
    /// resulting snapshot.
    pub async fn refetch(&self) -> QueryState<T> {
        let mut state = self.cell.refetch().await;
        state.connection = self.connection_rx.borrow().status;
        state
    }

    /// Calls `on_change` with a fresh snapshot after every change until the
    /// returned subscription is dropped.
    pub fn subscribe(
        &self,
        on_change: impl Fn(QueryState<T>) + Send + Sync + 'static,
    ) -> Subscription {
        let mut rx = self.rx.clone();
        let mut connection_rx = self.connection_rx.clone();
        let task = tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    changed = rx.changed() => changed,
                    changed = connection_rx.changed() => changed,
                };
                if result.is_err() {
                    return;
                }
                let mut state = rx.borrow_and_update().clone();
                state.connection = connection_rx.borrow_and_update().status;
                on_change(state);
            }
        });
        Subscription::new(move || task.abort())
    }
}

impl<T> Drop for Query<T> {
    fn drop(&mut self) {
        self.cell.unobserve();
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query").field("key", &self.cell.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;
    use crate::config::SyncConfig;
    use crate::registry::ConnectionRegistry;
    use crate::testing::MockTransportFactory;
    use crate::types::Workspace;

    fn empty_fetcher() -> Fetcher<Vec<String>> {
        Arc::new(|_client: OpencodeClient| {
            futures::future::ready(Ok::<Vec<String>, SyncError>(Vec::new())).boxed()
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn open(cache: &QueryCache, lease: &ConnectionLease, session_id: &str) -> Query<Vec<String>> {
        let cell = cache.cell(
            QueryKey::messages("w1", session_id),
            lease.connection(),
            empty_fetcher(),
            None,
        );
        Query::new(cell, lease.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn unobserved_entries_are_dropped_once_stale() {
        let registry = ConnectionRegistry::new(
            SyncConfig::default(),
            Arc::new(MockTransportFactory::new()),
        );
        let lease = registry.acquire(&Workspace::new("w1", "http://w1.test")).expect("acquire");
        settle().await;
        let cache = QueryCache::new();

        let watched = open(&cache, &lease, "s1");
        let viewed = open(&cache, &lease, "s2");
        settle().await;
        drop(viewed);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate(&QueryKey::messages("w1", "s1")), 1);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate(&QueryKey::messages("w1", "s2")), 1);
        assert_eq!(cache.keys(), vec![QueryKey::messages("w1", "s1")]);
        drop(watched);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entries_beyond_the_limit_are_evicted_oldest_first() {
        let registry = ConnectionRegistry::new(
            SyncConfig::default(),
            Arc::new(MockTransportFactory::new()),
        );
        let lease = registry.acquire(&Workspace::new("w1", "http://w1.test")).expect("acquire");
        settle().await;
        let cache = QueryCache::with_idle_limit(2);

        for session_id in ["s1", "s2", "s3", "s4"] {
            let query = open(&cache, &lease, session_id);
            settle().await;
            drop(query);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let reopened = open(&cache, &lease, "s2");
        let _latest = open(&cache, &lease, "s5");
        let mut keys: Vec<String> = cache.keys().iter().map(|key| key.to_string()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "messages:w1:s2".to_string(),
                "messages:w1:s3".to_string(),
                "messages:w1:s4".to_string(),
                "messages:w1:s5".to_string(),
            ]
        );
        drop(reopened);
    }
}
