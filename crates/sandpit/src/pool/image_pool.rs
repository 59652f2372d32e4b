//! Per-image sandbox pool
//!
//! Each pool owns a fixed warm set of sandboxes and an elastic burst set
//! created under load. All pool state lives in one supervising task; the
//! [`ImagePool`] handle, the idle timers and background extensions talk to it
//! through a command channel, so queue bookkeeping is never touched from two
//! places at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::pool::PoolError;
use crate::sandbox::{
    IdleTimer, RuntimeError, SandboxError, SandboxHandle, SandboxId, SandboxLifecycle,
};
use crate::types::{PoolKey, SandboxFile};

/// Pause before retrying a failed extension for acquirers still waiting
const EXTENSION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which allotment a checked-out sandbox is charged to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Warm,
    Burst,
    /// Burst sandbox whose admission slot was reclaimed by a shrink while it
    /// was checked out
    Retired,
}

/// Notification that a pool tore itself down after being idle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: PoolKey,
    pub pool_id: u64,
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle sandboxes in the warm set
    pub warm: usize,
    /// Idle sandboxes in the burst set
    pub burst: usize,
    /// Sandboxes held by executions
    pub checked_out: usize,
    /// Burst sandboxes being created
    pub creating: usize,
    /// Admission slots still free for burst extension
    pub free_slots: usize,
    /// Acquirers waiting for a sandbox
    pub waiters: usize,
    /// Whether the pool stopped accepting acquisitions
    pub closed: bool,
}

enum PoolCommand {
    Acquire(oneshot::Sender<Result<SandboxHandle, PoolError>>),
    Release(SandboxHandle),
    Discard(SandboxId),
    Extended(Result<SandboxHandle, SandboxError>),
    Replenish,
    IdleTeardown,
    BurstShrink,
    Stats(oneshot::Sender<PoolStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the sandbox pool of one image/command
///
/// Cloning is cheap; all clones drive the same pool. The pool's supervising
/// task exits once every clone is dropped, destroying its idle sandboxes.
#[derive(Debug, Clone)]
pub struct ImagePool {
    key: Arc<PoolKey>,
    id: u64,
    config: PoolConfig,
    lifecycle: Arc<SandboxLifecycle>,
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl ImagePool {
    /// Provision a pool with its full warm set
    ///
    /// The warm sandboxes are created in parallel. If any of them fails, the
    /// ones that succeeded are destroyed and no pool is returned.
    #[instrument(skip_all, fields(key = %key, pool_id = id))]
    pub async fn provision(
        key: PoolKey,
        id: u64,
        config: PoolConfig,
        lifecycle: Arc<SandboxLifecycle>,
        warmup: Option<Arc<[SandboxFile]>>,
        evictions: mpsc::UnboundedSender<Eviction>,
    ) -> Result<Self, PoolError> {
        let key = Arc::new(key);
        info!(warm = config.warm_capacity, "provisioning pool");

        let mut creates = JoinSet::new();
        for _ in 0..config.warm_capacity {
            let key = Arc::clone(&key);
            let lifecycle = Arc::clone(&lifecycle);
            let warmup = warmup.clone();
            creates.spawn(async move { lifecycle.create(&key, warmup.as_deref()).await });
        }

        let mut warm = VecDeque::with_capacity(config.warm_capacity);
        let mut failure = None;
        while let Some(joined) = creates.join_next().await {
            match joined {
                Ok(Ok(handle)) => warm.push_back(handle),
                Ok(Err(err)) => {
                    warn!(error = %err, "failed to create warm sandbox");
                    failure.get_or_insert(err);
                }
                Err(err) => {
                    warn!(error = %err, "warm sandbox creation task failed");
                    failure.get_or_insert(SandboxError::Runtime(RuntimeError::Api {
                        operation: "create",
                        message: err.to_string(),
                    }));
                }
            }
        }

        if let Some(source) = failure {
            let mut destroys = JoinSet::new();
            for handle in warm {
                let lifecycle = Arc::clone(&lifecycle);
                destroys.spawn(async move { lifecycle.destroy(handle).await });
            }
            while destroys.join_next().await.is_some() {}
            return Err(PoolError::Provision {
                key: (*key).clone(),
                source,
            });
        }

        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = PoolWorker::new(
            Arc::clone(&key),
            id,
            config.clone(),
            Arc::clone(&lifecycle),
            warmup,
            warm,
            &commands,
            evictions,
        );
        tokio::spawn(worker.run(receiver));

        info!("pool ready");
        Ok(Self {
            key,
            id,
            config,
            lifecycle,
            commands,
        })
    }

    /// Get the image/command this pool serves
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Get the unique id of this pool instance
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check out a sandbox
    ///
    /// Waits up to the configured acquire timeout for a sandbox to become
    /// free, then fails with [`PoolError::Timeout`]. The caller owns the
    /// returned handle and must hand it back with [`release`](Self::release),
    /// or report it with [`discard`](Self::discard) once destroyed.
    ///
    /// Dropping the returned future is safe: a sandbox delivered after the
    /// caller went away is released back to the pool.
    pub async fn acquire(&self) -> Result<SandboxHandle, PoolError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(PoolCommand::Acquire(reply))
            .map_err(|_| PoolError::Closed(self.key().clone()))?;
        let mut pending = PendingAcquire {
            pool: self,
            response,
        };

        let timeout = self.config.acquire_timeout();
        match tokio::time::timeout(timeout, &mut pending.response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PoolError::Closed(self.key().clone())),
            Err(_) => {
                // A sandbox may have been delivered right as the timeout hit
                pending.response.close();
                match pending.response.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(key = %self.key, ?timeout, "timed out waiting for sandbox");
                        Err(PoolError::Timeout(timeout))
                    }
                }
            }
        }
    }

    /// Return a checked-out sandbox to the pool
    pub fn release(&self, handle: SandboxHandle) {
        if let Err(mpsc::error::SendError(PoolCommand::Release(handle))) =
            self.commands.send(PoolCommand::Release(handle))
        {
            let lifecycle = Arc::clone(&self.lifecycle);
            tokio::spawn(async move { lifecycle.destroy(handle).await });
        }
    }

    /// Tell the pool a checked-out sandbox was destroyed
    pub fn discard(&self, id: SandboxId) {
        let _ = self.commands.send(PoolCommand::Discard(id));
    }

    /// Get a snapshot of the pool's bookkeeping
    pub async fn stats(&self) -> Option<PoolStats> {
        let (reply, response) = oneshot::channel();
        self.commands.send(PoolCommand::Stats(reply)).ok()?;
        response.await.ok()
    }

    /// Close the pool and destroy every idle sandbox
    ///
    /// Sandboxes still checked out are destroyed when they are released.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown(done)).is_ok() {
            let _ = finished.await;
        }
    }
}

/// Reply slot of an acquisition in flight
struct PendingAcquire<'a> {
    pool: &'a ImagePool,
    response: oneshot::Receiver<Result<SandboxHandle, PoolError>>,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        self.response.close();
        if let Ok(Ok(handle)) = self.response.try_recv() {
            debug!(
                key = %self.pool.key,
                sandbox = handle.id().short(),
                "acquirer went away, releasing sandbox"
            );
            self.pool.release(handle);
        }
    }
}

/// The supervising task of one pool
struct PoolWorker {
    key: Arc<PoolKey>,
    id: u64,
    config: PoolConfig,
    lifecycle: Arc<SandboxLifecycle>,
    warmup: Option<Arc<[SandboxFile]>>,

    warm: VecDeque<SandboxHandle>,
    burst: VecDeque<SandboxHandle>,
    checked_out: HashMap<SandboxId, Tier>,
    creating: usize,
    waiters: VecDeque<oneshot::Sender<Result<SandboxHandle, PoolError>>>,
    replenish_scheduled: bool,
    closed: bool,

    last_acquire: Instant,
    last_burst_activity: Instant,
    idle_timer: IdleTimer,
    burst_timer: IdleTimer,

    commands: mpsc::WeakUnboundedSender<PoolCommand>,
    evictions: mpsc::UnboundedSender<Eviction>,
    destroys: JoinSet<()>,
}

impl PoolWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        key: Arc<PoolKey>,
        id: u64,
        config: PoolConfig,
        lifecycle: Arc<SandboxLifecycle>,
        warmup: Option<Arc<[SandboxFile]>>,
        warm: VecDeque<SandboxHandle>,
        commands: &mpsc::UnboundedSender<PoolCommand>,
        evictions: mpsc::UnboundedSender<Eviction>,
    ) -> Self {
        let commands = commands.downgrade();
        let idle_timer = IdleTimer::new(
            config.idle_timeout(),
            post(commands.clone(), || PoolCommand::IdleTeardown),
        );
        let burst_timer = IdleTimer::new(
            config.burst_idle_timeout(),
            post(commands.clone(), || PoolCommand::BurstShrink),
        );
        let now = Instant::now();

        Self {
            key,
            id,
            lifecycle,
            warmup,
            warm,
            burst: VecDeque::with_capacity(config.max_extension),
            checked_out: HashMap::new(),
            creating: 0,
            waiters: VecDeque::new(),
            replenish_scheduled: false,
            closed: false,
            last_acquire: now,
            last_burst_activity: now,
            idle_timer,
            burst_timer,
            commands,
            evictions,
            destroys: JoinSet::new(),
            config,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PoolCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                PoolCommand::Acquire(reply) => self.on_acquire(reply),
                PoolCommand::Release(handle) => self.on_release(handle),
                PoolCommand::Discard(id) => self.on_discard(&id),
                PoolCommand::Extended(result) => self.on_extended(result),
                PoolCommand::Replenish => {
                    self.replenish_scheduled = false;
                    self.replenish();
                }
                PoolCommand::IdleTeardown => self.on_idle_teardown(),
                PoolCommand::BurstShrink => self.on_burst_shrink(),
                PoolCommand::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                PoolCommand::Shutdown(done) => {
                    self.shutdown().await;
                    let _ = done.send(());
                }
            }

            self.check_invariants();
            while self.destroys.try_join_next().is_some() {}
        }

        // Every handle to the pool is gone
        self.shutdown().await;
        debug!(key = %self.key, "pool worker exited");
    }

    fn on_acquire(&mut self, reply: oneshot::Sender<Result<SandboxHandle, PoolError>>) {
        if self.closed {
            let _ = reply.send(Err(PoolError::Closed((*self.key).clone())));
            return;
        }

        self.waiters.push_back(reply);
        self.dispatch();
        self.replenish();
    }

    fn on_release(&mut self, handle: SandboxHandle) {
        let tier = match self.checked_out.remove(handle.id()) {
            Some(tier) => tier,
            None => {
                warn!(
                    key = %self.key,
                    sandbox = handle.id().short(),
                    "released sandbox was not checked out from this pool"
                );
                Tier::Retired
            }
        };

        if self.closed {
            self.destroy(handle);
            return;
        }

        if self.warm.len() < self.config.warm_capacity {
            self.warm.push_back(handle);
        } else if tier != Tier::Retired
            && self.burst.len() < self.config.max_extension
            && self.free_slots() > 0
        {
            self.burst.push_back(handle);
            self.touch_burst();
        } else {
            // Every queue is full: the pool holds more live sandboxes than it
            // accounts for.
            warn!(
                key = %self.key,
                sandbox = handle.id().short(),
                ?tier,
                "no room for released sandbox, destroying it"
            );
            self.destroy(handle);
        }

        self.dispatch();
    }

    fn on_discard(&mut self, id: &SandboxId) {
        if let Some(tier) = self.checked_out.remove(id) {
            debug!(key = %self.key, sandbox = id.short(), ?tier, "sandbox discarded");
            self.replenish();
        }
    }

    fn on_extended(&mut self, result: Result<SandboxHandle, SandboxError>) {
        self.creating -= 1;

        match result {
            Ok(handle) if self.closed => self.destroy(handle),
            Ok(handle) => {
                debug!(key = %self.key, sandbox = handle.id().short(), "burst sandbox ready");
                self.burst.push_back(handle);
                self.touch_burst();
                self.dispatch();
            }
            Err(err) => {
                warn!(key = %self.key, error = %err, "failed to extend pool");
                self.schedule_replenish();
            }
        }
    }

    fn on_idle_teardown(&mut self) {
        // The timer may have fired just before an acquisition reset it.
        if self.closed || self.last_acquire.elapsed() < self.config.idle_timeout() {
            return;
        }

        info!(key = %self.key, warm = self.warm.len(), "pool idle, tearing down");
        self.closed = true;
        for handle in std::mem::take(&mut self.warm) {
            self.destroy(handle);
        }
        self.fail_waiters();

        let _ = self.evictions.send(Eviction {
            key: (*self.key).clone(),
            pool_id: self.id,
        });
    }

    fn on_burst_shrink(&mut self) {
        if self.last_burst_activity.elapsed() < self.config.burst_idle_timeout() {
            return;
        }

        let idle = self.burst.len();
        for handle in std::mem::take(&mut self.burst) {
            self.destroy(handle);
        }

        let mut retired = 0;
        for tier in self.checked_out.values_mut() {
            if *tier == Tier::Burst {
                *tier = Tier::Retired;
                retired += 1;
            }
        }

        if idle > 0 || retired > 0 {
            info!(key = %self.key, destroyed = idle, retired, "burst idle, shrinking pool");
        }
        self.replenish();
    }

    /// Hand free sandboxes to waiting acquirers
    fn dispatch(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }

            let Some((handle, tier)) = self.take_free() else {
                self.waiters.push_front(waiter);
                break;
            };

            let id = handle.id().clone();
            match waiter.send(Ok(handle)) {
                Ok(()) => self.on_checkout(id, tier),
                Err(returned) => {
                    // The acquirer gave up in the meantime
                    if let Ok(handle) = returned {
                        self.put_back(handle, tier);
                    }
                }
            }
        }
    }

    fn take_free(&mut self) -> Option<(SandboxHandle, Tier)> {
        if let Some(handle) = self.warm.pop_front() {
            return Some((handle, Tier::Warm));
        }
        self.burst.pop_front().map(|handle| (handle, Tier::Burst))
    }

    fn put_back(&mut self, handle: SandboxHandle, tier: Tier) {
        match tier {
            Tier::Warm => self.warm.push_front(handle),
            _ => self.burst.push_front(handle),
        }
    }

    fn on_checkout(&mut self, id: SandboxId, tier: Tier) {
        debug!(key = %self.key, sandbox = id.short(), ?tier, "sandbox checked out");
        self.checked_out.insert(id, tier);

        self.last_acquire = Instant::now();
        self.idle_timer.reset();
        if tier == Tier::Burst {
            self.touch_burst();
        }

        if self.warm.len() + self.burst.len() < self.config.margin {
            self.extend();
        }
    }

    /// Start creations for waiting acquirers no pending creation will serve
    fn replenish(&mut self) {
        let waiting = self.waiters.iter().filter(|w| !w.is_closed()).count();
        let mut unserved = waiting.saturating_sub(self.creating);
        while unserved > 0 && self.extend() {
            unserved -= 1;
        }
    }

    /// Run [`replenish`](Self::replenish) again after a failed extension
    fn schedule_replenish(&mut self) {
        if self.replenish_scheduled || self.closed || self.waiters.is_empty() {
            return;
        }
        self.replenish_scheduled = true;

        let replenish = post(self.commands.clone(), || PoolCommand::Replenish);
        tokio::spawn(async move {
            tokio::time::sleep(EXTENSION_RETRY_DELAY).await;
            replenish();
        });
    }

    /// Start creating one burst sandbox if an admission slot is free
    ///
    /// Returns whether a creation was started.
    fn extend(&mut self) -> bool {
        if self.closed || self.free_slots() == 0 {
            return false;
        }
        let Some(commands) = self.commands.upgrade() else {
            return false;
        };

        self.creating += 1;
        debug!(key = %self.key, creating = self.creating, "extending pool");

        let key = Arc::clone(&self.key);
        let lifecycle = Arc::clone(&self.lifecycle);
        let warmup = self.warmup.clone();
        tokio::spawn(async move {
            let result = lifecycle.create(&key, warmup.as_deref()).await;
            if let Err(mpsc::error::SendError(PoolCommand::Extended(Ok(handle)))) =
                commands.send(PoolCommand::Extended(result))
            {
                lifecycle.destroy(handle).await;
            }
        });
        true
    }

    /// Admission slots not held by idle, checked-out or pending burst sandboxes
    fn free_slots(&self) -> usize {
        let charged = self
            .checked_out
            .values()
            .filter(|tier| **tier == Tier::Burst)
            .count();
        self.config
            .max_extension
            .saturating_sub(self.burst.len() + self.creating + charged)
    }

    fn touch_burst(&mut self) {
        self.last_burst_activity = Instant::now();
        self.burst_timer.reset();
    }

    fn destroy(&mut self, handle: SandboxHandle) {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.destroys
            .spawn(async move { lifecycle.destroy(handle).await });
    }

    fn fail_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(PoolError::Closed((*self.key).clone())));
        }
    }

    async fn shutdown(&mut self) {
        if !self.closed {
            info!(key = %self.key, "shutting down pool");
        }
        self.closed = true;

        let idle: Vec<_> = self.warm.drain(..).chain(self.burst.drain(..)).collect();
        for handle in idle {
            self.destroy(handle);
        }
        for tier in self.checked_out.values_mut() {
            *tier = Tier::Retired;
        }
        self.fail_waiters();

        while self.destroys.join_next().await.is_some() {}
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            warm: self.warm.len(),
            burst: self.burst.len(),
            checked_out: self.checked_out.len(),
            creating: self.creating,
            free_slots: self.free_slots(),
            waiters: self.waiters.iter().filter(|w| !w.is_closed()).count(),
            closed: self.closed,
        }
    }

    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            let mut seen = HashSet::new();
            for id in self
                .warm
                .iter()
                .chain(self.burst.iter())
                .map(SandboxHandle::id)
                .chain(self.checked_out.keys())
            {
                assert!(seen.insert(id), "sandbox {id} tracked twice in pool {}", self.key);
            }
            assert!(self.warm.len() <= self.config.warm_capacity);

            let charged = self
                .checked_out
                .values()
                .filter(|tier| **tier == Tier::Burst)
                .count();
            assert!(self.burst.len() + self.creating + charged <= self.config.max_extension);
        }
    }
}

/// Timer action posting `command` to the pool, if it still exists
fn post<F>(
    commands: mpsc::WeakUnboundedSender<PoolCommand>,
    command: F,
) -> impl Fn() + Send + Sync + 'static
where
    F: Fn() -> PoolCommand + Send + Sync + 'static,
{
    move || {
        if let Some(commands) = commands.upgrade() {
            let _ = commands.send(command());
        }
    }
}
