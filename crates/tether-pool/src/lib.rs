//! Elastic thread pools for recurring relay roles.
//!
//! A [`Role`] is a category of recurring work (e.g. flushing send queues).
//! The [`Pool`] spawns a variable number of dedicated OS threads per role,
//! each running one [`RoleWorker`] until cooperative cancellation. Worker
//! counts stay within the role's declared [`ThreadBounds`] and are adjusted
//! by a pluggable [`ScalingPolicy`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};

// ---------------------------------------------------------------------------
// Shutdown signalling
// ---------------------------------------------------------------------------

/// Cooperative shutdown signal shared by every worker of a pool.
///
/// Built on a zero-capacity crossbeam channel: nothing is ever sent, but
/// dropping the sender makes every receiver clone observably disconnected,
/// which wakes consumers blocked in `select!` arms.
pub struct Shutdown {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create an untriggered shutdown signal.
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Derive a token for one worker, with its own retirement flag.
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.rx.clone(),
            global: Arc::clone(&self.flag),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trip the signal. Idempotent; wakes all blocked token holders.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    /// Whether the signal has been tripped.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker view of the shutdown signal.
///
/// A token stops either when the whole pool shuts down or when this one
/// worker is retired by the scaling policy.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: Receiver<()>,
    global: Arc<AtomicBool>,
    retired: Arc<AtomicBool>,
}

impl ShutdownToken {
    /// Whether this worker should stop (pool shutdown or retirement).
    pub fn is_stopped(&self) -> bool {
        self.global.load(Ordering::SeqCst) || self.retired.load(Ordering::SeqCst)
    }

    /// Channel receiver that becomes disconnected on pool shutdown; use it
    /// as a `select!` arm next to the role's work queue.
    pub fn wake_channel(&self) -> &Receiver<()> {
        &self.rx
    }

    fn retire_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.retired)
    }
}

// ---------------------------------------------------------------------------
// Role / worker traits
// ---------------------------------------------------------------------------

/// Declared worker-count bounds for a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadBounds {
    /// Minimum workers the pool keeps alive.
    pub min: usize,
    /// Maximum workers the pool will ever spawn.
    pub max: usize,
}

impl ThreadBounds {
    /// Clamp a desired count into these bounds.
    pub fn clamp(&self, desired: usize) -> usize {
        desired.clamp(self.min.max(1), self.max.max(1))
    }
}

/// A category of recurring work executed by a variable number of dedicated
/// threads.
pub trait Role: Send + Sync + 'static {
    /// Short name, used for thread names and logging.
    fn name(&self) -> &str;

    /// Static worker-count bounds.
    fn thread_bounds(&self) -> ThreadBounds;

    /// Create one worker instance. Called once per spawned thread.
    fn create_worker(&self) -> Box<dyn RoleWorker>;
}

/// One worker bound to one OS thread.
pub trait RoleWorker: Send {
    /// Run until `ctx.token()` reports stopped. Blocking waits inside must
    /// respond promptly to the token's wake channel.
    fn run(&mut self, ctx: &WorkerContext);
}

/// Per-worker context: shutdown token plus the role's active-worker counter.
pub struct WorkerContext {
    token: ShutdownToken,
    active: Arc<AtomicUsize>,
}

impl WorkerContext {
    /// The worker's shutdown token.
    pub fn token(&self) -> &ShutdownToken {
        &self.token
    }

    /// Mark this worker busy for the lifetime of the returned guard. The
    /// count feeds the scaling policy.
    pub fn active_zone(&self) -> ActiveZone<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        ActiveZone { ctx: self }
    }
}

/// RAII guard for the active-worker counter.
pub struct ActiveZone<'a> {
    ctx: &'a WorkerContext,
}

impl Drop for ActiveZone<'_> {
    fn drop(&mut self) {
        self.ctx.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Scaling policy
// ---------------------------------------------------------------------------

/// Load snapshot handed to the scaling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleLoad {
    /// Workers currently inside an active zone.
    pub active: usize,
    /// Workers currently alive.
    pub total: usize,
}

/// Decides how many workers a role should have, given its current load.
/// The pool clamps the answer into the role's [`ThreadBounds`].
pub trait ScalingPolicy: Send {
    /// Desired worker count for the given load.
    fn desired_threads(&self, load: RoleLoad, bounds: ThreadBounds) -> usize;
}

/// Fixed-size policy: always the same worker count.
pub struct FixedSize(pub usize);

impl FixedSize {
    /// Fixed count derived from the CPU count, leaving headroom for receive
    /// threads.
    pub fn auto() -> Self {
        let cpus = num_cpus::get().max(2);
        Self((cpus - 2).max(1))
    }
}

impl ScalingPolicy for FixedSize {
    fn desired_threads(&self, _load: RoleLoad, bounds: ThreadBounds) -> usize {
        bounds.clamp(self.0)
    }
}

/// Saturation-based policy: grow by one when every worker is busy, shrink by
/// one when fewer than half are.
pub struct ActiveLoad;

impl ScalingPolicy for ActiveLoad {
    fn desired_threads(&self, load: RoleLoad, bounds: ThreadBounds) -> usize {
        let desired = if load.total == 0 {
            bounds.min
        } else if load.active >= load.total {
            load.total + 1
        } else if load.active < load.total / 2 {
            load.total - 1
        } else {
            load.total
        };
        bounds.clamp(desired)
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Errors that can occur while managing a pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The OS refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The pool is already shut down.
    #[error("pool is shut down")]
    ShutDown,
}

struct WorkerHandle {
    retire: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct RoleEntry {
    role: Arc<dyn Role>,
    policy: Box<dyn ScalingPolicy>,
    active: Arc<AtomicUsize>,
    workers: Vec<WorkerHandle>,
    next_worker_id: usize,
}

/// Owns the workers of every registered role and the shared shutdown signal.
pub struct Pool {
    shutdown: Shutdown,
    roles: Mutex<Vec<RoleEntry>>,
}

impl Pool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            shutdown: Shutdown::new(),
            roles: Mutex::new(Vec::new()),
        }
    }

    /// Register a role and spawn its initial workers (at least the role's
    /// declared minimum).
    pub fn add_role(
        &self,
        role: Arc<dyn Role>,
        policy: Box<dyn ScalingPolicy>,
    ) -> Result<(), PoolError> {
        if self.shutdown.is_triggered() {
            return Err(PoolError::ShutDown);
        }

        let bounds = role.thread_bounds();
        let initial = bounds.clamp(policy.desired_threads(
            RoleLoad {
                active: 0,
                total: 0,
            },
            bounds,
        ));

        let mut entry = RoleEntry {
            role,
            policy,
            active: Arc::new(AtomicUsize::new(0)),
            workers: Vec::new(),
            next_worker_id: 0,
        };
        for _ in 0..initial {
            self.spawn_worker(&mut entry)?;
        }

        tracing::info!(
            "Role '{}' started with {} worker(s) (bounds {}..={})",
            entry.role.name(),
            entry.workers.len(),
            bounds.min,
            bounds.max
        );

        let mut roles = self.roles.lock().unwrap_or_else(|e| e.into_inner());
        roles.push(entry);
        Ok(())
    }

    fn spawn_worker(&self, entry: &mut RoleEntry) -> Result<(), PoolError> {
        let token = self.shutdown.token();
        let retire = token.retire_flag();
        let ctx = WorkerContext {
            token,
            active: Arc::clone(&entry.active),
        };
        let mut worker = entry.role.create_worker();
        let name = format!("{}-worker-{}", entry.role.name(), entry.next_worker_id);
        entry.next_worker_id += 1;

        let join = std::thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(&ctx))?;

        entry.workers.push(WorkerHandle { retire, join });
        Ok(())
    }

    /// Current load of a role, by name.
    pub fn role_load(&self, name: &str) -> Option<RoleLoad> {
        let mut roles = self.roles.lock().unwrap_or_else(|e| e.into_inner());
        roles.iter_mut().find(|e| e.role.name() == name).map(|e| {
            e.workers.retain(|w| !w.join.is_finished());
            RoleLoad {
                active: e.active.load(Ordering::SeqCst),
                total: e.workers.len(),
            }
        })
    }

    /// Consult each role's scaling policy and spawn or retire workers to
    /// match, within the role's bounds. Retirement is cooperative: a retired
    /// worker exits at its next wakeup.
    pub fn rescale(&self) -> Result<(), PoolError> {
        if self.shutdown.is_triggered() {
            return Err(PoolError::ShutDown);
        }

        let mut roles = self.roles.lock().unwrap_or_else(|e| e.into_inner());
        for i in 0..roles.len() {
            roles[i].workers.retain(|w| !w.join.is_finished());

            let bounds = roles[i].role.thread_bounds();
            let load = RoleLoad {
                active: roles[i].active.load(Ordering::SeqCst),
                total: roles[i].workers.len(),
            };
            let desired = bounds.clamp(roles[i].policy.desired_threads(load, bounds));

            if desired > load.total {
                tracing::debug!(
                    "Scaling role '{}' up: {} -> {desired}",
                    roles[i].role.name(),
                    load.total
                );
                for _ in load.total..desired {
                    self.spawn_worker(&mut roles[i])?;
                }
            } else if desired < load.total {
                tracing::debug!(
                    "Scaling role '{}' down: {} -> {desired}",
                    roles[i].role.name(),
                    load.total
                );
                for handle in roles[i].workers.iter().rev().take(load.total - desired) {
                    handle.retire.store(true, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    /// Trip the shutdown signal, wake every blocked worker, and join them
    /// all. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.trigger();

        let handles: Vec<WorkerHandle> = {
            let mut roles = self.roles.lock().unwrap_or_else(|e| e.into_inner());
            roles.iter_mut().flat_map(|e| e.workers.drain(..)).collect()
        };
        for handle in handles {
            if handle.join.join().is_err() {
                tracing::warn!("A pool worker panicked during shutdown");
            }
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
