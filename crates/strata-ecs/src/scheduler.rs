//! Scheduler
//!
//! Two-level concurrent execution of systems:
//! - one dedicated driver thread runs the ordered task list of a tick
//!   serially, in registration order;
//! - a per-scheduler rayon pool provides fork-join parallelism inside each
//!   task. Every task body runs on the pool, and a cluster fans its member
//!   systems out as independent pool jobs with no ordering among them.
//!
//! `update()` waits for the whole tick under the configured timeout. A
//! system error, a panic, or a timeout is logged, the rest of that tick is
//! skipped, and the next `update()` runs normally.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::config::RegistryConfig;
use crate::error::{EcsError, EcsResult};
use crate::registry::Registry;
use crate::time::{DeltaTime, TickClock};

/// Result of one system invocation
pub type SystemResult = anyhow::Result<()>;

/// Per-tick game logic
pub trait System: Send + Sync + 'static {
    /// Run the system for one tick
    fn run(&self, ctx: &SystemContext) -> SystemResult;

    /// Get the system name for diagnostics
    fn name(&self) -> &str {
        "system"
    }
}

/// Wrapper for closure-based systems
pub struct SystemFn<F> {
    name: String,
    func: F,
}

impl<F> SystemFn<F>
where
    F: Fn(&SystemContext) -> SystemResult + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> System for SystemFn<F>
where
    F: Fn(&SystemContext) -> SystemResult + Send + Sync + 'static,
{
    fn run(&self, ctx: &SystemContext) -> SystemResult {
        (self.func)(ctx)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a scheduled system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(u64);

/// How a tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every enabled system ran
    Completed,
    /// A system returned an error or panicked
    Failed,
    /// The tick exceeded the tick timeout and was abandoned
    TimedOut,
    /// The scheduler or its registry is gone
    ShutDown,
}

/// Capability handed to every system body
///
/// Only the driver creates contexts, so holding one proves the caller is
/// inside a tick of this scheduler.
pub struct SystemContext {
    registry: Arc<Registry>,
    pool: Arc<ThreadPool>,
    delta: DeltaTime,
    tick: u64,
}

impl SystemContext {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Time between this tick and the previous one
    pub fn delta_time(&self) -> DeltaTime {
        self.delta
    }

    /// 1-based tick number
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Run `f` on the fork-join pool and wait for it
    pub fn fork_and_join<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    /// Run `a` and `b` potentially in parallel on the fork-join pool
    pub fn join<A, B, RA, RB>(&self, a: A, b: B) -> (RA, RB)
    where
        A: FnOnce() -> RA + Send,
        B: FnOnce() -> RB + Send,
        RA: Send,
        RB: Send,
    {
        self.pool.install(|| rayon::join(a, b))
    }
}

impl fmt::Debug for SystemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemContext")
            .field("tick", &self.tick)
            .field("delta", &self.delta)
            .finish()
    }
}

struct Single {
    id: SystemId,
    system: Box<dyn System>,
    enabled: AtomicBool,
}

impl Single {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn run(&self, ctx: &SystemContext) -> SystemResult {
        self.system
            .run(ctx)
            .with_context(|| format!("system '{}' failed", self.system.name()))
    }
}

#[derive(Clone)]
enum Task {
    Single(Arc<Single>),
    Cluster(Vec<Arc<Single>>),
}

impl Task {
    fn singles(&self) -> &[Arc<Single>] {
        match self {
            Task::Single(single) => std::slice::from_ref(single),
            Task::Cluster(singles) => singles,
        }
    }

    fn run(&self, ctx: &SystemContext) -> SystemResult {
        match self {
            Task::Single(single) => {
                if !single.is_enabled() {
                    return Ok(());
                }
                ctx.fork_and_join(|| single.run(ctx))
            }
            Task::Cluster(singles) => ctx.fork_and_join(|| {
                singles
                    .par_iter()
                    .filter(|single| single.is_enabled())
                    .try_for_each(|single| single.run(ctx))
            }),
        }
    }
}

struct TickRequest {
    tasks: Arc<Vec<Task>>,
    context: SystemContext,
    abandoned: Arc<AtomicBool>,
    reply: Sender<TickOutcome>,
}

fn drive(requests: Receiver<TickRequest>) {
    for request in requests.iter() {
        let outcome = run_tick(&request);
        // The caller may have stopped waiting
        let _ = request.reply.send(outcome);
    }
}

fn run_tick(request: &TickRequest) -> TickOutcome {
    let tick = request.context.tick;
    for task in request.tasks.iter() {
        if request.abandoned.load(Ordering::Acquire) {
            log::warn!("Abandoning the rest of timed out tick {}", tick);
            return TickOutcome::TimedOut;
        }
        match catch_unwind(AssertUnwindSafe(|| task.run(&request.context))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::error!("Tick {} failed: {:#}", tick, err);
                return TickOutcome::Failed;
            }
            Err(panic) => {
                let names: Vec<&str> = task.singles().iter().map(|single| single.system.name()).collect();
                log::error!("Tick {} panicked in {:?}: {}", tick, names, panic_message(&*panic));
                return TickOutcome::Failed;
            }
        }
    }
    TickOutcome::Completed
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// A named thread whose exit disconnects `exited`
struct ExecutorThread {
    handle: JoinHandle<()>,
    exited: Receiver<()>,
}

impl ExecutorThread {
    fn spawn(name: String, body: impl FnOnce() + Send + 'static) -> EcsResult<Self> {
        let (exit, exited) = channel::bounded::<()>(0);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                // Dropped on return or unwind
                let _exit = exit;
                body();
            })
            .map_err(|err| EcsError::SchedulerStart(err.to_string()))?;
        Ok(Self { handle, exited })
    }

    fn id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Join, giving up after `timeout`; a thread never joins itself
    fn join_within(self, timeout: Duration) -> bool {
        if self.id() == thread::current().id() {
            return true;
        }
        match self.exited.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => self.handle.join().is_ok(),
            Ok(()) | Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

struct Timer {
    stop: Sender<()>,
    thread: ExecutorThread,
}

/// Per-registry concurrent system scheduler
pub struct Scheduler {
    id: usize,
    name: String,
    registry: Weak<Registry>,
    tick_timeout: Duration,
    shutdown_timeout: Duration,
    pool: RwLock<Option<Arc<ThreadPool>>>,
    pool_threads: usize,
    /// One message per pool worker that has exited
    pool_exits: Receiver<()>,
    tasks: RwLock<Arc<Vec<Task>>>,
    next_system: AtomicU64,
    clock: Mutex<TickClock>,
    requests: Mutex<Option<Sender<TickRequest>>>,
    driver: Mutex<Option<ExecutorThread>>,
    driver_thread: ThreadId,
    timer: Mutex<Option<Timer>>,
    shut_down: AtomicBool,
}

impl Scheduler {
    pub(crate) fn new(registry: Weak<Registry>, config: &RegistryConfig, id: usize) -> EcsResult<Self> {
        let prefix = config.thread_name_prefix.clone();
        let pool_threads = config.resolved_worker_threads();
        let (exit, pool_exits) = channel::unbounded();

        let worker_prefix = prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_threads)
            .thread_name(move |index| format!("{}-worker-{}", worker_prefix, index))
            .exit_handler(move |_| {
                let _ = exit.send(());
            })
            .build()
            .map_err(|err| EcsError::SchedulerStart(err.to_string()))?;

        let (sender, receiver) = channel::unbounded();
        let driver = ExecutorThread::spawn(format!("{}-driver-{}", prefix, id), move || drive(receiver))?;
        let driver_thread = driver.id();

        let name = format!("{}-{}", prefix, id);
        log::debug!("Created scheduler {} with {} workers", name, pool_threads);

        Ok(Self {
            id,
            name,
            registry,
            tick_timeout: config.tick_timeout,
            shutdown_timeout: config.shutdown_timeout,
            pool: RwLock::new(Some(Arc::new(pool))),
            pool_threads,
            pool_exits,
            tasks: RwLock::new(Arc::new(Vec::new())),
            next_system: AtomicU64::new(0),
            clock: Mutex::new(TickClock::new()),
            requests: Mutex::new(Some(sender)),
            driver: Mutex::new(Some(driver)),
            driver_thread,
            timer: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Identifier unique within the owning registry
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append one system to the end of the tick
    pub fn schedule(&self, system: impl System) -> SystemId {
        let single = self.single(Box::new(system));
        let id = single.id;
        log::debug!("Scheduled system '{}' on {}", single.system.name(), self.name);
        self.push_task(Task::Single(single));
        id
    }

    /// Append a closure system to the end of the tick
    pub fn schedule_fn<F>(&self, name: impl Into<String>, func: F) -> SystemId
    where
        F: Fn(&SystemContext) -> SystemResult + Send + Sync + 'static,
    {
        self.schedule(SystemFn::new(name, func))
    }

    /// Append a group of systems that run concurrently with each other
    ///
    /// The systems must touch disjoint data; nothing checks this. A single
    /// system is scheduled as if by [`schedule`](Self::schedule).
    pub fn schedule_parallel(&self, systems: Vec<Box<dyn System>>) -> Vec<SystemId> {
        let singles: Vec<Arc<Single>> = systems.into_iter().map(|system| self.single(system)).collect();
        let ids = singles.iter().map(|single| single.id).collect();
        let names: Vec<&str> = singles.iter().map(|single| single.system.name()).collect();

        match singles.len() {
            0 => {}
            1 => {
                log::debug!("Scheduled system '{}' on {}", names[0], self.name);
                let single = Arc::clone(&singles[0]);
                self.push_task(Task::Single(single));
            }
            _ => {
                log::debug!("Scheduled cluster {:?} on {}", names, self.name);
                let cluster = Task::Cluster(singles.clone());
                self.push_task(cluster);
            }
        }
        ids
    }

    fn single(&self, system: Box<dyn System>) -> Arc<Single> {
        Arc::new(Single {
            id: SystemId(self.next_system.fetch_add(1, Ordering::Relaxed)),
            system,
            enabled: AtomicBool::new(true),
        })
    }

    // Copy-on-write so in-flight ticks keep their snapshot
    fn push_task(&self, task: Task) {
        let mut tasks = self.tasks.write();
        let mut next = Vec::clone(&tasks);
        next.push(task);
        *tasks = Arc::new(next);
    }

    fn find(&self, id: SystemId) -> Option<Arc<Single>> {
        self.tasks
            .read()
            .iter()
            .flat_map(Task::singles)
            .find(|single| single.id == id)
            .cloned()
    }

    /// Skip a system until resumed; returns whether it exists
    pub fn suspend(&self, id: SystemId) -> bool {
        self.set_enabled(id, false)
    }

    /// Re-enable a suspended system; returns whether it exists
    pub fn resume(&self, id: SystemId) -> bool {
        self.set_enabled(id, true)
    }

    fn set_enabled(&self, id: SystemId, enabled: bool) -> bool {
        match self.find(id) {
            Some(single) => {
                single.enabled.store(enabled, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_suspended(&self, id: SystemId) -> Option<bool> {
        self.find(id).map(|single| !single.is_enabled())
    }

    /// Number of scheduled systems, cluster members included
    pub fn system_count(&self) -> usize {
        self.tasks.read().iter().map(|task| task.singles().len()).sum()
    }

    /// Number of ordered tasks (singles and clusters)
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Seconds between the last two ticks
    pub fn delta_time(&self) -> DeltaTime {
        self.clock.lock().delta()
    }

    /// Number of ticks started
    pub fn tick_count(&self) -> u64 {
        self.clock.lock().tick_count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn current_pool(&self) -> Option<Arc<ThreadPool>> {
        self.pool.read().clone()
    }

    fn on_scheduler_thread(&self, pool: &ThreadPool) -> bool {
        pool.current_thread_index().is_some() || thread::current().id() == self.driver_thread
    }

    /// Run one tick and wait for it under the tick timeout
    pub fn update(&self) -> TickOutcome {
        if self.is_shut_down() {
            return TickOutcome::ShutDown;
        }
        let (Some(registry), Some(pool)) = (self.registry.upgrade(), self.current_pool()) else {
            return TickOutcome::ShutDown;
        };
        if self.on_scheduler_thread(&pool) {
            log::error!("update() called from inside a tick of {}", self.name);
            return TickOutcome::Failed;
        }

        let (delta, tick) = {
            let mut clock = self.clock.lock();
            let delta = clock.tick();
            (delta, clock.tick_count())
        };
        let (reply, outcome) = channel::bounded(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let request = TickRequest {
            tasks: Arc::clone(&self.tasks.read()),
            context: SystemContext {
                registry,
                pool,
                delta,
                tick,
            },
            abandoned: Arc::clone(&abandoned),
            reply,
        };

        let sent = match self.requests.lock().as_ref() {
            Some(requests) => requests.send(request).is_ok(),
            None => false,
        };
        if !sent {
            return TickOutcome::ShutDown;
        }

        match outcome.recv_timeout(self.tick_timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                abandoned.store(true, Ordering::Release);
                log::warn!(
                    "Tick {} of {} exceeded {:?}; skipping its remaining systems",
                    tick,
                    self.name,
                    self.tick_timeout
                );
                TickOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => TickOutcome::ShutDown,
        }
    }

    /// Run `f` on the fork-join pool and wait for it
    ///
    /// Only the driver thread and pool workers may call this.
    pub fn fork_and_join<R, F>(&self, f: F) -> EcsResult<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let pool = self.current_pool().ok_or(EcsError::SchedulerShutDown)?;
        if !self.on_scheduler_thread(&pool) {
            return Err(EcsError::OutsideScheduler);
        }
        Ok(pool.install(f))
    }

    /// Call `update()` every `period` on a dedicated timer thread, replacing
    /// any running timer
    pub fn run_every(self: &Arc<Self>, period: Duration) -> EcsResult<()> {
        if self.is_shut_down() {
            return Err(EcsError::SchedulerShutDown);
        }
        self.stop_timer();

        let (stop, stopped) = channel::bounded::<()>(1);
        let ticker = channel::tick(period);
        let scheduler = Arc::downgrade(self);
        let thread = ExecutorThread::spawn(format!("{}-timer", self.name), move || loop {
            crossbeam::select! {
                recv(stopped) -> _ => break,
                recv(ticker) -> _ => {
                    let Some(scheduler) = scheduler.upgrade() else {
                        break;
                    };
                    if scheduler.update() == TickOutcome::ShutDown {
                        break;
                    }
                }
            }
        })?;

        log::debug!("Started {:?} tick timer on {}", period, self.name);
        *self.timer.lock() = Some(Timer { stop, thread });
        Ok(())
    }

    /// Stop the tick timer; returns whether one was running
    pub fn stop_timer(&self) -> bool {
        let Some(timer) = self.timer.lock().take() else {
            return false;
        };
        drop(timer.stop);
        if !timer.thread.join_within(self.shutdown_timeout) {
            log::error!("Tick timer of {} did not stop within {:?}", self.name, self.shutdown_timeout);
        }
        true
    }

    /// Stop the timer, the driver, and the fork-join pool
    ///
    /// Each executor gets the shutdown timeout to terminate. A timeout is
    /// logged and its threads are leaked. Either way the scheduler leaves
    /// its registry's active set. Returns whether everything terminated.
    pub fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return true;
        }

        let pool = self.pool.write().take();
        let inside = pool.as_deref().is_some_and(|pool| self.on_scheduler_thread(pool));
        let mut clean = true;

        if let Some(timer) = self.timer.lock().take() {
            drop(timer.stop);
            clean &= timer.thread.join_within(self.shutdown_timeout);
        }

        // Closing the request channel ends the driver loop after the
        // current tick
        self.requests.lock().take();
        if let Some(driver) = self.driver.lock().take() {
            if !inside {
                clean &= driver.join_within(self.shutdown_timeout);
            }
        }

        drop(pool);
        if !inside {
            let deadline = Instant::now() + self.shutdown_timeout;
            clean &= (0..self.pool_threads).all(|_| self.pool_exits.recv_deadline(deadline).is_ok());
        }

        if clean {
            log::debug!("Scheduler {} shut down", self.name);
        } else {
            log::error!(
                "Scheduler {} did not terminate within {:?}; its threads are leaked",
                self.name,
                self.shutdown_timeout
            );
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.detach_scheduler(self.id);
        }
        clean
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("tasks", &self.task_count())
            .field("workers", &self.pool_threads)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(
            RegistryConfig::default()
                .with_worker_threads(2)
                .with_tick_timeout(Duration::from_secs(2)),
        ))
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> impl Fn(&SystemContext) -> SystemResult + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |_| {
            log.lock().push(value);
            Ok(())
        }
    }

    #[test]
    fn test_systems_run_in_order() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        scheduler.schedule_fn("first", recorder(&log, 1));
        scheduler.schedule_fn("second", recorder(&log, 2));

        for _ in 0..3 {
            assert_eq!(scheduler.update(), TickOutcome::Completed);
        }
        assert_eq!(*log.lock(), vec![1, 2, 1, 2, 1, 2]);
        assert_eq!(scheduler.tick_count(), 3);
    }

    #[test]
    fn test_schedule_parallel_shapes() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        assert!(scheduler.schedule_parallel(Vec::new()).is_empty());
        assert_eq!(scheduler.task_count(), 0);

        scheduler.schedule_parallel(vec![Box::new(SystemFn::new("only", recorder(&log, 1)))]);
        assert_eq!(scheduler.task_count(), 1);
        assert_eq!(scheduler.update(), TickOutcome::Completed);
        assert_eq!(*log.lock(), vec![1]);

        let ids = scheduler.schedule_parallel(vec![
            Box::new(SystemFn::new("a", recorder(&log, 2))),
            Box::new(SystemFn::new("b", recorder(&log, 3))),
        ]);
        assert_eq!(ids.len(), 2);
        assert_eq!(scheduler.task_count(), 2);
        assert_eq!(scheduler.system_count(), 3);

        log.lock().clear();
        assert_eq!(scheduler.update(), TickOutcome::Completed);
        let mut seen = log.lock().clone();
        assert_eq!(seen[0], 1);
        seen.sort();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_suspend_and_resume() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let id = scheduler.schedule_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(scheduler.suspend(id));
        assert_eq!(scheduler.is_suspended(id), Some(true));
        scheduler.update();
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        assert!(scheduler.resume(id));
        scheduler.update();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.suspend(SystemId(999)));
    }

    #[test]
    fn test_failure_skips_rest_of_tick() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        scheduler.schedule_fn("fails", |_| anyhow::bail!("broken"));
        scheduler.schedule_fn("after", recorder(&log, 1));

        assert_eq!(scheduler.update(), TickOutcome::Failed);
        assert!(log.lock().is_empty());
        // Still usable on the next call
        assert_eq!(scheduler.update(), TickOutcome::Failed);
    }

    #[test]
    fn test_panic_is_contained() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let panicking = scheduler.schedule_fn("panics", |_| panic!("boom"));
        assert_eq!(scheduler.update(), TickOutcome::Failed);

        scheduler.suspend(panicking);
        assert_eq!(scheduler.update(), TickOutcome::Completed);
    }

    #[test]
    fn test_fork_and_join_capability() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        assert!(matches!(scheduler.fork_and_join(|| 1), Err(EcsError::OutsideScheduler)));

        let handle: Arc<Mutex<Weak<Scheduler>>> = Arc::new(Mutex::new(Weak::new()));
        *handle.lock() = Arc::downgrade(&scheduler);
        let inner = Arc::clone(&handle);
        let result = Arc::new(Mutex::new(None));
        let output = Arc::clone(&result);
        scheduler.schedule_fn("fork", move |ctx| {
            let on_worker = ctx.fork_and_join(|| rayon::current_thread_index().is_some());
            let (a, b) = ctx.join(|| 20, || 22);
            let nested = inner.lock().upgrade().map(|scheduler| scheduler.fork_and_join(|| a + b));
            *output.lock() = Some((on_worker, nested.and_then(Result::ok)));
            Ok(())
        });

        assert_eq!(scheduler.update(), TickOutcome::Completed);
        assert_eq!(*result.lock(), Some((true, Some(42))));
    }

    #[test]
    fn test_timeout_recovery() {
        let registry = Arc::new(Registry::new(
            RegistryConfig::default()
                .with_worker_threads(2)
                .with_tick_timeout(Duration::from_millis(100)),
        ));
        let scheduler = registry.create_scheduler().unwrap();
        let slow = Arc::new(AtomicBool::new(true));
        let first_tick = Arc::clone(&slow);
        let log = Arc::new(Mutex::new(Vec::new()));
        scheduler.schedule_fn("sometimes slow", move |_| {
            if first_tick.swap(false, Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(300));
            }
            Ok(())
        });
        scheduler.schedule_fn("after", recorder(&log, 1));

        assert_eq!(scheduler.update(), TickOutcome::TimedOut);
        thread::sleep(Duration::from_millis(400));
        // The abandoned tick skipped its remaining systems
        assert!(log.lock().is_empty());

        assert_eq!(scheduler.update(), TickOutcome::Completed);
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_delta_time_reaches_systems() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let output = Arc::clone(&seen);
        scheduler.schedule_fn("dt", move |ctx| {
            output.lock().push((ctx.tick(), ctx.delta_time()));
            Ok(())
        });

        scheduler.update();
        thread::sleep(Duration::from_millis(20));
        scheduler.update();

        let seen = seen.lock();
        assert_eq!(seen[1].0, 2);
        assert!(seen[1].1.as_millis() >= 20.0);
        assert_eq!(scheduler.delta_time(), seen[1].1);
    }

    #[test]
    fn test_run_every() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        scheduler.schedule_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        scheduler.run_every(Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert!(scheduler.stop_timer());
        assert!(!scheduler.stop_timer());

        let after_stop = runs.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_shutdown_leaves_registry() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        let other = registry.create_scheduler().unwrap();
        assert_eq!(registry.schedulers().len(), 2);
        assert_ne!(scheduler.id(), other.id());

        assert!(scheduler.shutdown());
        assert!(scheduler.shutdown());
        assert_eq!(registry.schedulers().len(), 1);
        assert_eq!(scheduler.update(), TickOutcome::ShutDown);
        assert!(matches!(scheduler.fork_and_join(|| ()), Err(EcsError::SchedulerShutDown)));
        assert!(matches!(
            scheduler.run_every(Duration::from_millis(5)),
            Err(EcsError::SchedulerShutDown)
        ));
    }

    #[test]
    fn test_shutdown_gives_up_on_busy_driver() {
        let registry = Arc::new(Registry::new(
            RegistryConfig::default()
                .with_worker_threads(1)
                .with_tick_timeout(Duration::from_millis(20))
                .with_shutdown_timeout(Duration::from_millis(50)),
        ));
        let scheduler = registry.create_scheduler().unwrap();
        scheduler.schedule_fn("stall", |_| {
            thread::sleep(Duration::from_millis(600));
            Ok(())
        });
        assert_eq!(scheduler.update(), TickOutcome::TimedOut);

        let started = Instant::now();
        assert!(!scheduler.shutdown());
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(registry.schedulers().is_empty());
    }

    #[test]
    fn test_registry_drop_shuts_down() {
        let registry = registry();
        let scheduler = registry.create_scheduler().unwrap();
        drop(registry);
        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.update(), TickOutcome::ShutDown);
    }
}
