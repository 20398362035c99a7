use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use threadline_core::domain::tool::ProviderKey;
use threadline_core::provider::{ProviderCallError, ProviderConnector, ProviderSession};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider `{key}` failed to connect: {message}")]
    ProviderConnectFailure { key: ProviderKey, message: String },
    #[error("provider `{0}` is not configured")]
    UnknownProvider(ProviderKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Healthy,
            1 => Self::Degraded,
            _ => Self::Failed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Failed => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub connect_failures: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

/// Cached handle to one provider. Shared by every run that calls its tools.
pub struct ProviderConnection {
    key: ProviderKey,
    session: Arc<dyn ProviderSession>,
    capabilities: Vec<String>,
    concurrent: bool,
    health: AtomicU8,
    opened_at: Instant,
    last_used_ms: AtomicU64,
    in_flight: AtomicUsize,
    call_lock: Mutex<()>,
    evicted: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("key", &self.key)
            .field("capabilities", &self.capabilities)
            .field("concurrent", &self.concurrent)
            .field("health", &self.health())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProviderConnection {
    fn new(key: ProviderKey, session: Arc<dyn ProviderSession>, capabilities: Vec<String>) -> Self {
        let concurrent = session.is_concurrent();
        Self {
            key,
            session,
            capabilities,
            concurrent,
            health: AtomicU8::new(HealthState::Healthy.as_u8()),
            opened_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            call_lock: Mutex::new(()),
            evicted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ProviderKey {
        &self.key
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    pub fn health(&self) -> HealthState {
        HealthState::from_u8(self.health.load(Ordering::SeqCst))
    }

    pub fn set_health(&self, health: HealthState) {
        self.health.store(health.as_u8(), Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis();
        self.last_used_ms.store(u64::try_from(elapsed).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let last_used = self.opened_at + Duration::from_millis(self.last_used_ms.load(Ordering::SeqCst));
        Instant::now().saturating_duration_since(last_used)
    }

    /// Runs one call, serialized against other calls on this connection
    /// unless the provider declared itself concurrent. `timeout` bounds the
    /// provider call only, not the wait for an earlier call to finish.
    pub async fn call(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ProviderCallError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard(&self.in_flight);
        let _serial = if self.concurrent { None } else { Some(self.call_lock.lock().await) };

        let call = self.session.call(tool_name, arguments, timeout);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderCallError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };
        if result.is_ok() {
            self.touch();
            if self.health() == HealthState::Degraded {
                self.set_health(HealthState::Healthy);
            }
        }
        result
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.session.close().await;
        }
    }
}

impl Drop for ProviderConnection {
    // An evicted connection still held by a caller is closed by whichever
    // holder lets go last.
    fn drop(&mut self) {
        if !self.evicted.load(Ordering::SeqCst) || self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(&self.session);
        let key = self.key.clone();
        runtime.spawn(async move {
            session.close().await;
            debug!(
                event_name = "registry.connection.closed",
                provider_key = %key,
                "evicted provider connection closed by its last holder"
            );
        });
    }
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide pool of provider connections, keyed by provider.
pub struct ProviderRegistry {
    connector: Arc<dyn ProviderConnector>,
    staleness: Duration,
    connect_timeout: Duration,
    connections: RwLock<HashMap<ProviderKey, Arc<ProviderConnection>>>,
    creation_locks: Mutex<HashMap<ProviderKey, Arc<Mutex<()>>>>,
    capability_index: RwLock<BTreeMap<String, ProviderKey>>,
    stats: Mutex<BTreeMap<ProviderKey, ProviderStats>>,
}

impl ProviderRegistry {
    pub fn new(connector: Arc<dyn ProviderConnector>, staleness: Duration) -> Self {
        Self {
            connector,
            staleness,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connections: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            capability_index: RwLock::new(BTreeMap::new()),
            stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bounds the handshake and capability listing of a new connection.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn provider_keys(&self) -> Vec<ProviderKey> {
        self.connector.provider_keys()
    }

    pub async fn resolve(&self, key: &ProviderKey) -> Result<Arc<ProviderConnection>, RegistryError> {
        if let Some(connection) = self.cached(key).await {
            self.record(key, |stats| stats.hits += 1).await;
            return Ok(connection);
        }

        let creation_lock = self.creation_lock(key).await;
        let _creating = creation_lock.lock().await;

        if let Some(connection) = self.cached(key).await {
            self.record(key, |stats| stats.hits += 1).await;
            return Ok(connection);
        }
        self.record(key, |stats| stats.misses += 1).await;

        if !self.connector.provider_keys().contains(key) {
            return Err(RegistryError::UnknownProvider(key.clone()));
        }

        let connection = match self.open(key).await {
            Ok(connection) => Arc::new(connection),
            Err(error) => {
                self.record(key, |stats| stats.connect_failures += 1).await;
                warn!(
                    event_name = "registry.connection.connect_failed",
                    provider_key = %key,
                    error = %error,
                    "provider connection failed"
                );
                return Err(error);
            }
        };

        self.index_capabilities(key, connection.capabilities()).await;
        self.connections.write().await.insert(key.clone(), connection.clone());
        self.record(key, |stats| stats.created += 1).await;
        info!(
            event_name = "registry.connection.created",
            provider_key = %key,
            capabilities = connection.capabilities().len(),
            concurrent = connection.is_concurrent(),
            "provider connection created"
        );

        Ok(connection)
    }

    /// Evicts whatever connection is cached for `key`.
    pub async fn invalidate(&self, key: &ProviderKey) {
        let removed = self.connections.write().await.remove(key);
        if let Some(connection) = removed {
            connection.set_health(HealthState::Failed);
            self.record(key, |stats| stats.invalidations += 1).await;
            info!(
                event_name = "registry.connection.invalidated",
                provider_key = %key,
                "provider connection invalidated"
            );
            Self::release(connection).await;
        }
    }

    /// Marks `connection` failed and evicts it, unless the cache already
    /// holds a newer connection for the same key.
    pub async fn report_failure(&self, connection: &Arc<ProviderConnection>) {
        connection.set_health(HealthState::Failed);
        let key = connection.key().clone();
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&key) {
                Some(current) if Arc::ptr_eq(current, connection) => connections.remove(&key),
                _ => None,
            }
        };

        if let Some(removed) = removed {
            self.record(&key, |stats| stats.invalidations += 1).await;
            warn!(
                event_name = "registry.connection.failed",
                provider_key = %key,
                "provider connection marked failed and evicted"
            );
            Self::release(removed).await;
        }
    }

    /// Provider advertising `tool_name`. Providers whose capabilities are not
    /// known yet are connected first.
    pub async fn provider_for(&self, tool_name: &str) -> Option<ProviderKey> {
        if let Some(key) = self.capability_index.read().await.get(tool_name).cloned() {
            return Some(key);
        }

        self.discover_unindexed().await;
        self.capability_index.read().await.get(tool_name).cloned()
    }

    /// Connects every configured provider so its tools are known. Failures
    /// are logged and retried lazily on first use.
    pub async fn discover(&self) -> usize {
        let mut connected = 0;
        for key in self.connector.provider_keys() {
            if self.resolve(&key).await.is_ok() {
                connected += 1;
            }
        }
        connected
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.capability_index.read().await.keys().cloned().collect()
    }

    /// Evicts connections idle past the staleness window. Connections with a
    /// call in flight are left alone.
    pub async fn sweep_stale(&self) -> usize {
        let stale = {
            let mut connections = self.connections.write().await;
            let keys = connections
                .iter()
                .filter(|(_, connection)| {
                    connection.in_flight() == 0 && connection.idle_for() >= self.staleness
                })
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            keys.into_iter()
                .filter_map(|key| connections.remove(&key))
                .collect::<Vec<_>>()
        };

        let evicted = stale.len();
        for connection in stale {
            let key = connection.key().clone();
            self.record(&key, |stats| stats.evictions += 1).await;
            debug!(
                event_name = "registry.connection.evicted",
                provider_key = %key,
                idle_ms = u64::try_from(connection.idle_for().as_millis()).unwrap_or(u64::MAX),
                "stale provider connection evicted"
            );
            Self::release(connection).await;
        }
        evicted
    }

    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.sweep_stale().await;
                        if evicted > 0 {
                            info!(
                                event_name = "registry.sweep.completed",
                                evicted,
                                "provider staleness sweep evicted connections"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Closes every cached connection. Used at shutdown.
    pub async fn drain(&self) -> usize {
        let drained = self.connections.write().await.drain().map(|(_, c)| c).collect::<Vec<_>>();
        let count = drained.len();
        for connection in drained {
            connection.close().await;
        }
        info!(event_name = "registry.drained", connections = count, "provider registry drained");
        count
    }

    pub async fn stats(&self) -> BTreeMap<ProviderKey, ProviderStats> {
        self.stats.lock().await.clone()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn cached(&self, key: &ProviderKey) -> Option<Arc<ProviderConnection>> {
        self.connections
            .read()
            .await
            .get(key)
            .filter(|connection| connection.health() != HealthState::Failed)
            .cloned()
    }

    async fn creation_lock(&self, key: &ProviderKey) -> Arc<Mutex<()>> {
        self.creation_locks.lock().await.entry(key.clone()).or_default().clone()
    }

    async fn open(&self, key: &ProviderKey) -> Result<ProviderConnection, RegistryError> {
        let timeout = self.connect_timeout;
        let timed_out = || RegistryError::ProviderConnectFailure {
            key: key.clone(),
            message: format!(
                "no response within {}ms",
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
            ),
        };

        let session = tokio::time::timeout(timeout, self.connector.connect(key))
            .await
            .map_err(|_| timed_out())?
            .map_err(|error| RegistryError::ProviderConnectFailure {
                key: key.clone(),
                message: error.message,
            })?;

        let listed = tokio::time::timeout(timeout, session.list_capabilities()).await;
        let capabilities = match listed {
            Ok(Ok(capabilities)) => capabilities,
            Ok(Err(error)) => {
                session.close().await;
                return Err(RegistryError::ProviderConnectFailure {
                    key: key.clone(),
                    message: format!("listing capabilities failed: {error}"),
                });
            }
            Err(_) => {
                session.close().await;
                return Err(timed_out());
            }
        };

        Ok(ProviderConnection::new(key.clone(), session, capabilities))
    }

    async fn index_capabilities(&self, key: &ProviderKey, capabilities: &[String]) {
        let mut index = self.capability_index.write().await;
        index.retain(|_, owner| owner != key);
        for tool in capabilities {
            match index.get(tool) {
                Some(owner) if owner != key => {
                    warn!(
                        event_name = "registry.capability.conflict",
                        provider_key = %key,
                        owner = %owner,
                        tool_name = %tool,
                        "tool already served by another provider, keeping first"
                    );
                }
                _ => {
                    index.insert(tool.clone(), key.clone());
                }
            }
        }
    }

    pub(crate) async fn discover_unindexed(&self) {
        let indexed = self.capability_index.read().await.values().cloned().collect::<Vec<_>>();
        for key in self.connector.provider_keys() {
            if !indexed.contains(&key) {
                let _ = self.resolve(&key).await;
            }
        }
    }

    async fn record(&self, key: &ProviderKey, update: impl FnOnce(&mut ProviderStats)) {
        let mut stats = self.stats.lock().await;
        update(stats.entry(key.clone()).or_default());
    }

    async fn release(connection: Arc<ProviderConnection>) {
        connection.evicted.store(true, Ordering::SeqCst);
        // Callers still holding the connection keep it open; the last one to
        // drop it closes the session.
        if Arc::strong_count(&connection) == 1 {
            connection.close().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use threadline_core::domain::tool::ProviderKey;
    use tokio_util::sync::CancellationToken;

    use super::test_support::{CountingConnector, ProviderScript};
    use super::{HealthState, ProviderRegistry, RegistryError};

    fn key(name: &str) -> ProviderKey {
        ProviderKey(name.to_string())
    }

    fn registry(connector: CountingConnector) -> (Arc<CountingConnector>, Arc<ProviderRegistry>) {
        let connector = Arc::new(connector);
        let registry =
            Arc::new(ProviderRegistry::new(connector.clone(), Duration::from_secs(600)));
        (connector, registry)
    }

    #[tokio::test]
    async fn concurrent_resolves_create_exactly_one_connection() {
        let mut connector =
            CountingConnector::new(vec![("calendar", ProviderScript::serving(&["calendar.today"]))]);
        connector.connect_delay = Duration::from_millis(20);
        let (connector, registry) = registry(connector);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.resolve(&key("calendar")).await }));
        }

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.expect("join").expect("resolve"));
        }

        assert_eq!(connector.connect_count(), 1);
        assert!(connections.iter().all(|connection| Arc::ptr_eq(connection, &connections[0])));
        let stats = registry.stats().await;
        let calendar = stats.get(&key("calendar")).copied().unwrap_or_default();
        assert_eq!(calendar.created, 1);
        assert_eq!(calendar.misses, 1);
        assert_eq!(calendar.hits, 15);
    }

    #[tokio::test]
    async fn failed_connect_is_not_cached_and_can_be_retried() {
        let connector =
            CountingConnector::new(vec![("tasks", ProviderScript::serving(&["tasks.list"]))]);
        connector.fail_connects.store(1, Ordering::SeqCst);
        let (_connector, registry) = registry(connector);

        let first = registry.resolve(&key("tasks")).await;
        assert!(matches!(first, Err(RegistryError::ProviderConnectFailure { .. })));
        assert_eq!(registry.connection_count().await, 0);

        let second = registry.resolve(&key("tasks")).await.expect("retry succeeds");
        assert_eq!(second.capabilities(), ["tasks.list".to_string()]);
        let stats = registry.stats().await;
        assert_eq!(stats.get(&key("tasks")).map(|s| s.connect_failures), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_connect_fails_after_connect_timeout() {
        let mut connector =
            CountingConnector::new(vec![("stuck", ProviderScript::serving(&["stuck.op"]))]);
        connector.connect_delay = Duration::from_secs(3600);
        let registry = ProviderRegistry::new(Arc::new(connector), Duration::from_secs(600))
            .with_connect_timeout(Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let result = registry.resolve(&key("stuck")).await;

        assert!(matches!(result, Err(RegistryError::ProviderConnectFailure { .. })), "{result:?}");
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(registry.connection_count().await, 0);
        let stats = registry.stats().await;
        assert_eq!(stats.get(&key("stuck")).map(|s| s.connect_failures), Some(1));
    }

    #[tokio::test]
    async fn evicted_connection_is_closed_once_its_last_holder_drops_it() {
        let connector =
            CountingConnector::new(vec![("tasks", ProviderScript::serving(&["tasks.list"]))]);
        let (connector, registry) = registry(connector);
        let closed = || {
            connector
                .sessions
                .lock()
                .expect("sessions lock")
                .iter()
                .map(|session| session.closed.load(Ordering::SeqCst))
                .sum::<usize>()
        };

        let held = registry.resolve(&key("tasks")).await.expect("resolve");
        registry.report_failure(&held).await;
        assert_eq!(closed(), 0, "a holder is still using the connection");

        drop(held);
        let closed_in_time = tokio::time::timeout(Duration::from_secs(5), async {
            while closed() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(closed_in_time.is_ok(), "evicted session was never closed");
        assert_eq!(closed(), 1);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let (_connector, registry) = registry(CountingConnector::new(Vec::new()));
        let result = registry.resolve(&key("ghost")).await;
        assert_eq!(result.err(), Some(RegistryError::UnknownProvider(key("ghost"))));
    }

    #[tokio::test]
    async fn invalidated_connection_is_recreated_on_next_resolve() {
        let connector =
            CountingConnector::new(vec![("tasks", ProviderScript::serving(&["tasks.list"]))]);
        let (connector, registry) = registry(connector);

        let first = registry.resolve(&key("tasks")).await.expect("resolve");
        registry.invalidate(&key("tasks")).await;
        assert_eq!(first.health(), HealthState::Failed);

        let second = registry.resolve(&key("tasks")).await.expect("resolve again");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn report_failure_leaves_newer_connection_in_place() {
        let connector =
            CountingConnector::new(vec![("tasks", ProviderScript::serving(&["tasks.list"]))]);
        let (_connector, registry) = registry(connector);

        let stale = registry.resolve(&key("tasks")).await.expect("resolve");
        registry.invalidate(&key("tasks")).await;
        let fresh = registry.resolve(&key("tasks")).await.expect("resolve again");

        registry.report_failure(&stale).await;
        let current = registry.resolve(&key("tasks")).await.expect("cached");
        assert!(Arc::ptr_eq(&current, &fresh));
    }

    #[tokio::test]
    async fn capability_lookup_discovers_providers_lazily() {
        let connector = CountingConnector::new(vec![
            ("calendar", ProviderScript::serving(&["calendar.today"])),
            ("tasks", ProviderScript::serving(&["tasks.list", "tasks.create"])),
        ]);
        let (_connector, registry) = registry(connector);

        assert_eq!(registry.provider_for("tasks.create").await, Some(key("tasks")));
        assert_eq!(registry.provider_for("weather.now").await, None);
        assert_eq!(registry.tool_names().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_evicts_only_idle_connections() {
        let mut slow = ProviderScript::serving(&["slow.op"]);
        slow.call_delay = Duration::from_secs(900);
        let connector = CountingConnector::new(vec![
            ("idle", ProviderScript::serving(&["idle.op"])),
            ("slow", slow),
        ]);
        let (_connector, registry) = registry(connector);

        registry.resolve(&key("idle")).await.expect("idle");
        let busy = registry.resolve(&key("slow")).await.expect("slow");
        let in_flight = tokio::spawn(async move {
            busy.call("slow.op", json!({}), Duration::from_secs(1000)).await
        });
        tokio::task::yield_now().await;

        let shutdown = CancellationToken::new();
        let sweeper = registry.clone().spawn_sweeper(Duration::from_secs(60), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(660)).await;
        assert_eq!(registry.connection_count().await, 1, "in-flight connection survives");
        let stats = registry.stats().await;
        assert_eq!(stats.get(&key("idle")).map(|s| s.evictions), Some(1));

        let result = in_flight.await.expect("join");
        assert!(result.is_ok(), "in-flight call completes after sweep");

        shutdown.cancel();
        sweeper.await.expect("sweeper stops");
    }

    #[tokio::test]
    async fn drain_closes_every_connection() {
        let connector = CountingConnector::new(vec![
            ("calendar", ProviderScript::serving(&["calendar.today"])),
            ("tasks", ProviderScript::serving(&["tasks.list"])),
        ]);
        let (connector, registry) = registry(connector);

        assert_eq!(registry.discover().await, 2);
        assert_eq!(registry.drain().await, 2);
        assert_eq!(registry.connection_count().await, 0);
        let closed = connector
            .sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .map(|session| session.closed.load(Ordering::SeqCst))
            .sum::<usize>();
        assert_eq!(closed, 2);
    }
}
