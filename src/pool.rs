use crate::channel::SessionConnector;
use crate::config::{CommandPolicy, ProbeConfig};
use crate::error::ProbeError;
use crate::session::{ExecutionResult, SessionClient};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// How long `acquire` sleeps between polls when no session is free.
const POLL_STEP: Duration = Duration::from_millis(100);
/// Backoff after a failed session creation before the next attempt.
const CREATE_BACKOFF: Duration = Duration::from_millis(500);

/// One attached session plus its pool bookkeeping.
struct PooledSession {
    id: Uuid,
    pid: u32,
    client: SessionClient,
    created_at: Instant,
    last_used_at: Instant,
    /// Total health probes run against this session.
    health_check_count: u32,
    /// Consecutive health probe failures.
    failed_count: u32,
}

impl PooledSession {
    fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }
}

struct PoolState {
    /// Attached sessions nobody is using, keyed by target pid.
    idle: HashMap<u32, VecDeque<PooledSession>>,
    /// Live sessions per pid: idle + checked-out + reserved-for-creation.
    /// No entry ever exceeds `pool_max_size`.
    counts: HashMap<u32, usize>,
    shut_down: bool,
}

impl PoolState {
    fn count(&self, pid: u32) -> usize {
        self.counts.get(&pid).copied().unwrap_or(0)
    }

    fn decrement(&mut self, pid: u32) {
        if let Some(count) = self.counts.get_mut(&pid) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&pid);
            }
        }
    }
}

/// Point-in-time pool occupancy, for operators and tests.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub max_size: usize,
}

/// Keeps attached diagnostic sessions alive and hands them out one user at a
/// time. Sessions are keyed by target pid; a background sweep probes idle
/// sessions and evicts the stale and the broken.
pub struct SessionPool {
    config: ProbeConfig,
    connector: Arc<dyn SessionConnector>,
    state: Mutex<PoolState>,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionPool {
    /// Build the pool and start its health sweep loop.
    pub fn new(config: ProbeConfig, connector: Arc<dyn SessionConnector>) -> Arc<Self> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let pool = Arc::new(Self {
            connector,
            state: Mutex::new(PoolState {
                idle: HashMap::new(),
                counts: HashMap::new(),
                shut_down: false,
            }),
            shutdown_tx,
            health_task: Mutex::new(None),
            config,
        });

        let weak = Arc::downgrade(&pool);
        let interval = pool.config.health_check_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = sleep(interval) => {}
                }
                let Some(pool) = weak.upgrade() else { break };
                pool.health_sweep().await;
            }
        });
        if let Ok(mut guard) = pool.health_task.try_lock() {
            *guard = Some(task);
        }

        info!(
            max_size = pool.config.pool_max_size,
            health_interval_secs = interval.as_secs(),
            "Session pool started"
        );
        pool
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total: state.counts.values().sum(),
            idle: state.idle.values().map(|q| q.len()).sum(),
            max_size: self.config.pool_max_size,
        }
    }

    /// Check out a session attached to `pid`, reusing an idle one when
    /// possible and attaching a new one when there is room. Polls until the
    /// connection timeout, then fails with the last attach error if creation
    /// was the blocker, or `PoolExhausted` if the pool was simply full.
    #[instrument(skip(self), fields(pid = %pid))]
    pub async fn acquire(self: &Arc<Self>, pid: u32) -> Result<SessionHandle, ProbeError> {
        let wait_budget = self.config.connection_timeout;
        let deadline = Instant::now() + wait_budget;
        let mut last_attach_error: Option<ProbeError> = None;

        loop {
            let mut stale: Vec<PooledSession> = Vec::new();
            let mut claimed: Option<PooledSession> = None;
            let mut may_create = false;
            {
                let mut state = self.state.lock().await;
                if state.shut_down {
                    return Err(ProbeError::PoolShutdown);
                }
                if let Some(queue) = state.idle.get_mut(&pid) {
                    while let Some(session) = queue.pop_front() {
                        if self.is_valid(&session) {
                            claimed = Some(session);
                            break;
                        }
                        stale.push(session);
                    }
                }
                for _ in &stale {
                    state.decrement(pid);
                }
                if claimed.is_none() && state.count(pid) < self.config.pool_max_size {
                    // Reserve the slot now so concurrent acquires cannot
                    // overshoot the per-pid cap while we attach outside the lock.
                    *state.counts.entry(pid).or_insert(0) += 1;
                    may_create = true;
                }
            }

            for mut session in stale {
                debug!(pid, id = %session.id, "Evicting stale session on acquire");
                session.client.disconnect().await;
            }

            if let Some(mut session) = claimed {
                session.touch();
                debug!(pid, id = %session.id, "Reusing pooled session");
                return Ok(SessionHandle {
                    pool: self.clone(),
                    session: Some(session),
                });
            }

            if may_create {
                match self.create_session(pid).await {
                    Ok(session) => {
                        info!(pid, id = %session.id, "Attached new session");
                        return Ok(SessionHandle {
                            pool: self.clone(),
                            session: Some(session),
                        });
                    }
                    Err(e) => {
                        let mut state = self.state.lock().await;
                        state.decrement(pid);
                        drop(state);
                        warn!(pid, error = %e, "Session creation failed");
                        if matches!(e, ProbeError::AttachDenied { .. }) {
                            // retrying a permission failure is pointless
                            return Err(e);
                        }
                        last_attach_error = Some(e);
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        sleep(CREATE_BACKOFF.min(remaining)).await;
                        continue;
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            sleep(POLL_STEP.min(remaining)).await;
        }

        Err(last_attach_error.unwrap_or(ProbeError::PoolExhausted {
            pid,
            waited: wait_budget,
        }))
    }

    async fn create_session(&self, pid: u32) -> Result<PooledSession, ProbeError> {
        let channel = self.connector.connect(pid).await?;
        let mut client = SessionClient::new(
            channel,
            pid,
            self.config.attach_timeout,
            self.config.output_cap_bytes,
        );
        client.attach().await?;
        Ok(PooledSession {
            id: Uuid::new_v4(),
            pid,
            client,
            created_at: Instant::now(),
            last_used_at: Instant::now(),
            health_check_count: 0,
            failed_count: 0,
        })
    }

    fn is_valid(&self, session: &PooledSession) -> bool {
        session.client.is_usable()
            && session.age() < self.config.max_lifetime
            && session.idle_for() < self.config.idle_timeout
            && session.failed_count <= self.config.failure_threshold
    }

    /// Hand a session back. Still-healthy sessions return to the idle queue;
    /// expired or broken ones are destroyed.
    async fn restore(&self, mut session: PooledSession) {
        session.touch();
        let keep = self.is_valid(&session);
        {
            let mut state = self.state.lock().await;
            if keep && !state.shut_down {
                state.idle.entry(session.pid).or_default().push_back(session);
                return;
            }
            state.decrement(session.pid);
        }
        debug!(pid = session.pid, id = %session.id, "Destroying session on release");
        session.client.disconnect().await;
    }

    /// One health pass over the idle sessions: claim them all under the lock
    /// so no acquire can hand one out mid-probe, then probe each with a quick
    /// no-op command. Probe failures accumulate; past the threshold the
    /// session is destroyed.
    pub async fn health_sweep(&self) {
        let claimed: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            state.idle.values_mut().flat_map(|q| q.drain(..)).collect()
        };
        if claimed.is_empty() {
            return;
        }

        let probe = self.config.probe_policy();
        let mut keep: Vec<PooledSession> = Vec::new();
        let mut destroy: Vec<PooledSession> = Vec::new();

        for mut session in claimed {
            if session.age() >= self.config.max_lifetime
                || session.idle_for() >= self.config.idle_timeout
            {
                debug!(pid = session.pid, id = %session.id, "Session expired, evicting");
                destroy.push(session);
                continue;
            }
            session.health_check_count += 1;
            match self.probe_session(&mut session, &probe).await {
                Ok(()) => {
                    debug!(
                        pid = session.pid,
                        id = %session.id,
                        checks = session.health_check_count,
                        "Health probe ok"
                    );
                    session.failed_count = 0;
                    keep.push(session);
                }
                Err(e) => {
                    session.failed_count += 1;
                    warn!(
                        pid = session.pid,
                        id = %session.id,
                        failed_count = session.failed_count,
                        error = %e,
                        "Health probe failed"
                    );
                    if session.failed_count > self.config.failure_threshold
                        || !session.client.is_usable()
                    {
                        destroy.push(session);
                    } else {
                        keep.push(session);
                    }
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            if state.shut_down {
                destroy.append(&mut keep);
            }
            for session in &destroy {
                state.decrement(session.pid);
            }
            for session in keep {
                state.idle.entry(session.pid).or_default().push_back(session);
            }
        }
        for mut session in destroy {
            session.client.disconnect().await;
        }
    }

    async fn probe_session(
        &self,
        session: &mut PooledSession,
        probe: &CommandPolicy,
    ) -> Result<(), ProbeError> {
        session
            .client
            .execute_with_policy("version", probe)
            .await
            .map(|_| ())
    }

    /// Stop the health loop and disconnect every idle session. Checked-out
    /// sessions are destroyed when their handles come back.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.health_task.lock().await.take() {
            let _ = task.await;
        }

        let sessions: Vec<PooledSession> = {
            let mut state = self.state.lock().await;
            let drained: Vec<_> = state.idle.values_mut().flat_map(|q| q.drain(..)).collect();
            for session in &drained {
                state.decrement(session.pid);
            }
            drained
        };
        for mut session in sessions {
            session.client.disconnect().await;
        }
        info!("Session pool shut down");
    }
}

/// A checked-out session. Dropping the handle returns the session to the
/// pool; `release` does the same but deterministically.
pub struct SessionHandle {
    pool: Arc<SessionPool>,
    session: Option<PooledSession>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session.as_ref().map(|s| s.id).unwrap_or_default()
    }

    pub fn pid(&self) -> u32 {
        self.session.as_ref().map(|s| s.pid).unwrap_or_default()
    }

    pub async fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, ProbeError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ProbeError::ChannelBroken("session already released".into()))?;
        let result = session.client.execute(command, timeout).await;
        session.touch();
        result
    }

    /// Execute under the command's registered policy, retries included.
    pub async fn execute_with_policy(
        &mut self,
        command: &str,
        policy: &CommandPolicy,
    ) -> Result<ExecutionResult, ProbeError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ProbeError::ChannelBroken("session already released".into()))?;
        let result = session.client.execute_with_policy(command, policy).await;
        session.touch();
        result
    }

    /// Return the session to the pool now instead of on drop.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.restore(session).await;
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("pid", &self.pid())
            .field("released", &self.session.is_none())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let pool = self.pool.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { pool.restore(session).await });
            } else if let Ok(mut state) = pool.state.try_lock() {
                // No runtime left to disconnect on; at least keep the count honest.
                state.decrement(session.pid);
            }
        }
    }
}

static GLOBAL_POOL: OnceLock<Arc<SessionPool>> = OnceLock::new();

/// Install `pool` as the process-wide pool. The first installation wins;
/// later calls return the already-installed pool unchanged.
pub fn init_global(pool: Arc<SessionPool>) -> Arc<SessionPool> {
    GLOBAL_POOL.get_or_init(|| pool).clone()
}

pub fn global() -> Option<Arc<SessionPool>> {
    GLOBAL_POOL.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{chunk, MockChannel, Step};
    use crate::channel::CommandChannel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    type ChannelFactory = Box<dyn Fn() -> MockChannel + Send + Sync>;

    struct MockConnector {
        created: AtomicU32,
        factory: ChannelFactory,
    }

    impl MockConnector {
        fn well_behaved() -> Arc<Self> {
            Self::with_factory(MockChannel::well_behaved)
        }

        fn with_factory(factory: impl Fn() -> MockChannel + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                created: AtomicU32::new(0),
                factory: Box::new(factory),
            })
        }

        fn created(&self) -> u32 {
            self.created.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionConnector for MockConnector {
        async fn connect(&self, _pid: u32) -> Result<Box<dyn CommandChannel>, ProbeError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new((self.factory)()))
        }
    }

    fn test_config() -> ProbeConfig {
        crate::channel::testing::init_tracing();
        ProbeConfig {
            pool_max_size: 2,
            connection_timeout: Duration::from_millis(300),
            attach_timeout: Duration::from_secs(2),
            ..ProbeConfig::default()
        }
    }

    #[tokio::test]
    async fn acquire_reuses_released_session() {
        let connector = MockConnector::well_behaved();
        let pool = SessionPool::new(test_config(), connector.clone());

        let handle = pool.acquire(100).await.unwrap();
        let first_id = handle.id();
        handle.release().await;

        let handle = pool.acquire(100).await.unwrap();
        assert_eq!(handle.id(), first_id);
        assert_eq!(connector.created(), 1);
        handle.release().await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn full_pool_blocks_until_timeout() {
        let connector = MockConnector::well_behaved();
        let config = ProbeConfig {
            pool_max_size: 1,
            ..test_config()
        };
        let pool = SessionPool::new(config, connector.clone());

        let held = pool.acquire(100).await.unwrap();

        let started = std::time::Instant::now();
        let err = pool.acquire(100).await.unwrap_err();
        assert!(matches!(err, ProbeError::PoolExhausted { pid: 100, .. }));
        assert!(started.elapsed() >= Duration::from_millis(300));

        // the second caller succeeds once the first hands its session back
        held.release().await;
        let handle = pool.acquire(100).await.unwrap();
        assert_eq!(connector.created(), 1);
        handle.release().await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn size_cap_applies_per_target_process() {
        let connector = MockConnector::well_behaved();
        let pool = SessionPool::new(test_config(), connector.clone());

        let a = pool.acquire(100).await.unwrap();
        let b = pool.acquire(100).await.unwrap();
        assert_eq!(pool.stats().await.total, 2);

        // pid 100 is at its cap of 2
        let err = pool.acquire(100).await.unwrap_err();
        assert!(matches!(err, ProbeError::PoolExhausted { pid: 100, .. }));

        // a different pid has its own budget
        let c = pool.acquire(200).await.unwrap();
        assert_eq!(pool.stats().await.total, 3);

        a.release().await;
        b.release().await;
        c.release().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_evicts_multiple_stale_idle_sessions() {
        let connector = MockConnector::well_behaved();
        let config = ProbeConfig {
            idle_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let pool = SessionPool::new(config, connector.clone());

        let a = pool.acquire(100).await.unwrap();
        let b = pool.acquire(100).await.unwrap();
        a.release().await;
        b.release().await;
        assert_eq!(pool.stats().await.idle, 2);

        sleep(Duration::from_millis(100)).await;

        // both stale sessions are destroyed on the way to a fresh attach
        let handle = pool.acquire(100).await.unwrap();
        assert_eq!(connector.created(), 3);
        let stats = pool.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 0);
        handle.release().await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn handle_debug_shows_identity() {
        let connector = MockConnector::well_behaved();
        let pool = SessionPool::new(test_config(), connector);

        let handle = pool.acquire(100).await.unwrap();
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("SessionHandle"));
        assert!(rendered.contains("100"));
        handle.release().await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_evicts_idle_expired_sessions() {
        let connector = MockConnector::well_behaved();
        let config = ProbeConfig {
            idle_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let pool = SessionPool::new(config, connector.clone());

        let handle = pool.acquire(100).await.unwrap();
        let first_id = handle.id();
        handle.release().await;

        sleep(Duration::from_millis(100)).await;
        pool.health_sweep().await;
        assert_eq!(pool.stats().await.total, 0);

        // next acquire attaches a fresh session
        let handle = pool.acquire(100).await.unwrap();
        assert_ne!(handle.id(), first_id);
        assert_eq!(connector.created(), 2);
        handle.release().await;

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_destroys_sessions_whose_probe_breaks() {
        let connector = MockConnector::with_factory(|| {
            MockChannel::with_responder(vec![chunk("$ ")], |line| {
                if line == "version" {
                    vec![Step::Break]
                } else {
                    vec![chunk(&format!("{line}\nok\n$ "))]
                }
            })
        });
        let pool = SessionPool::new(test_config(), connector.clone());

        let handle = pool.acquire(100).await.unwrap();
        handle.release().await;
        assert_eq!(pool.stats().await.total, 1);

        pool.health_sweep().await;
        assert_eq!(pool.stats().await.total, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn attach_denial_fails_acquire_immediately() {
        let connector = MockConnector::with_factory(|| {
            MockChannel::new(vec![chunk("Can not attach to target process\n")])
        });
        let pool = SessionPool::new(test_config(), connector.clone());

        let started = std::time::Instant::now();
        let err = pool.acquire(100).await.unwrap_err();
        assert!(matches!(err, ProbeError::AttachDenied { pid: 100, .. }));
        // no creation retries for a permission failure
        assert_eq!(connector.created(), 1);
        assert!(started.elapsed() < Duration::from_millis(300));
        // the reserved creation slot was returned
        assert_eq!(pool.stats().await.total, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn attach_failure_surfaces_instead_of_pool_exhausted() {
        let connector = MockConnector::with_factory(|| {
            MockChannel::new(vec![chunk("ERROR: can not find java process 100\n")])
        });
        let pool = SessionPool::new(test_config(), connector.clone());

        let err = pool.acquire(100).await.unwrap_err();
        assert!(matches!(err, ProbeError::AttachFailed { pid: 100, .. }));
        assert_eq!(pool.stats().await.total, 0);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_after_shutdown_fails() {
        let connector = MockConnector::well_behaved();
        let pool = SessionPool::new(test_config(), connector);
        pool.shutdown().await;

        let err = pool.acquire(100).await.unwrap_err();
        assert!(matches!(err, ProbeError::PoolShutdown));
    }

    #[tokio::test]
    async fn global_pool_first_installation_wins() {
        let first = SessionPool::new(test_config(), MockConnector::well_behaved());
        let second = SessionPool::new(test_config(), MockConnector::well_behaved());

        let installed = init_global(first.clone());
        assert!(Arc::ptr_eq(&installed, &first));
        let installed = init_global(second.clone());
        assert!(Arc::ptr_eq(&installed, &first));
        assert!(global().is_some());

        first.shutdown().await;
        second.shutdown().await;
    }
}
