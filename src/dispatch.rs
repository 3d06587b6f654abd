//! Task model and priority dispatcher
//!
//! All work in the service (hardware commands, callback evaluation,
//! signal processing) flows through one priority queue drained by a
//! configurable pool of worker threads.
//!
//! # Ordering
//!
//! Tasks are removed highest priority first; within a priority class
//! removal order is FIFO (a sequence number assigned under the queue lock
//! breaks ties). A later-submitted high-priority task overtakes queued
//! work but never preempts a task that is already executing, and there is
//! no cancellation: once `execute` begins it runs to completion.
//!
//! # Same-channel commands
//!
//! The dispatcher does not serialise tasks that target the same channel.
//! The orchestrator keeps at most one command in flight per channel by
//! issuing each follow-up only from a callback that fires after the
//! previous command's effect is visible in the measurement table.
//!
//! # Shutdown
//!
//! Stopping the queue wakes every worker; each finishes its in-flight
//! task and exits without draining the backlog. Submissions after stop
//! are accepted and discarded silently.

use crate::analysis::AnalysisEngine;
use crate::driver::ChannelDriver;
use crate::error::Result;
use crate::registry::{CallbackContext, CallbackHandle, CallbackRegistry};
use crate::table::ChannelTable;
use crate::types::Snapshot;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Dispatcher precedence, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPriority {
    High,
    Normal,
    Low,
}

impl TaskPriority {
    fn rank(self) -> u8 {
        match self {
            TaskPriority::High => 2,
            TaskPriority::Normal => 1,
            TaskPriority::Low => 0,
        }
    }
}

impl PartialOrd for TaskPriority {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskPriority {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank().cmp(&other.rank())
    }
}

/// One unit of work, owned by the dispatcher from submission until a
/// worker releases it after `execute` returns.
///
/// Tasks carry value-copied inputs; shared state is reached through the
/// [`TaskContext`] handed to `execute`. The set of variants is closed.
#[derive(Debug, Clone)]
pub enum Task {
    /// Issue a constant-current command to the driver.
    ConstantCurrent { channel: usize, amps: f64 },
    /// Issue a constant-voltage command to the driver.
    ConstantVoltage { channel: usize, volts: f64 },
    /// Put the channel into its rest state.
    Rest { channel: usize },
    /// Turn the channel off.
    Off { channel: usize },
    /// Evaluate one registered callback against the current table snapshot
    /// (which may be newer than the frame that scheduled it).
    CallbackEvaluation {
        channel: usize,
        handle: CallbackHandle,
    },
    /// Run the smoothing filter over a frame snapshot.
    Filter { channel: usize, snapshot: Snapshot },
    /// Feed a frame snapshot into the sliding-window polynomial fit.
    Fit { channel: usize, snapshot: Snapshot },
}

impl Task {
    /// Base priority of the variant.
    ///
    /// Callback evaluation and channel-off run at high priority; everything
    /// else is normal. The CC→CV transition submits its synthesized
    /// constant-voltage command with an explicit high-priority override to
    /// bound the interval between threshold crossing and the CV command.
    pub fn priority(&self) -> TaskPriority {
        match self {
            Task::CallbackEvaluation { .. } | Task::Off { .. } => TaskPriority::High,
            _ => TaskPriority::Normal,
        }
    }

    /// Channel this task targets.
    pub fn channel(&self) -> usize {
        match self {
            Task::ConstantCurrent { channel, .. }
            | Task::ConstantVoltage { channel, .. }
            | Task::Rest { channel }
            | Task::Off { channel }
            | Task::CallbackEvaluation { channel, .. }
            | Task::Filter { channel, .. }
            | Task::Fit { channel, .. } => *channel,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Task::ConstantCurrent { .. } => "constant_current",
            Task::ConstantVoltage { .. } => "constant_voltage",
            Task::Rest { .. } => "rest",
            Task::Off { .. } => "off",
            Task::CallbackEvaluation { .. } => "callback_evaluation",
            Task::Filter { .. } => "filter",
            Task::Fit { .. } => "fit",
        }
    }

    fn execute(&self, ctx: &TaskContext) -> Result<()> {
        match self {
            Task::ConstantCurrent { channel, amps } => {
                ctx.driver.constant_current(*channel, *amps)
            }
            Task::ConstantVoltage { channel, volts } => {
                ctx.driver.constant_voltage(*channel, *volts)
            }
            Task::Rest { channel } => ctx.driver.rest(*channel),
            Task::Off { channel } => ctx.driver.off(*channel),
            Task::CallbackEvaluation { channel, handle } => {
                let Some(callback) = ctx.registry.get(*channel, *handle)? else {
                    tracing::trace!(channel, "callback no longer registered, skipping");
                    return Ok(());
                };
                let snapshot = ctx.table.snapshot(*channel)?;
                let cx = CallbackContext {
                    channel: *channel,
                    handle: *handle,
                    snapshot: &snapshot,
                    services: ctx,
                };
                // A panicking callback is logged and kept; the next cycle
                // will attempt it again.
                if catch_unwind(AssertUnwindSafe(|| callback(&cx))).is_err() {
                    tracing::error!(channel = *channel, "callback panicked");
                }
                Ok(())
            }
            Task::Filter { channel, snapshot } => ctx.analysis.filter(*channel, snapshot, &ctx.table),
            Task::Fit { channel, snapshot } => ctx.analysis.fit(*channel, snapshot, &ctx.table),
        }
    }
}

/// Shared handles every executing task can reach.
pub struct TaskContext {
    pub driver: Arc<dyn ChannelDriver>,
    pub table: Arc<ChannelTable>,
    pub registry: Arc<CallbackRegistry>,
    pub analysis: Arc<AnalysisEngine>,
    queue: Arc<TaskQueue>,
}

impl TaskContext {
    /// Assemble a context over the shared service components.
    pub fn new(
        driver: Arc<dyn ChannelDriver>,
        table: Arc<ChannelTable>,
        registry: Arc<CallbackRegistry>,
        analysis: Arc<AnalysisEngine>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            driver,
            table,
            registry,
            analysis,
            queue,
        }
    }

    /// Submit a task at its base priority.
    pub fn submit(&self, task: Task) {
        self.queue.submit(task);
    }

    /// Submit a task at an explicit priority.
    pub fn submit_with_priority(&self, task: Task, priority: TaskPriority) {
        self.queue.submit_with_priority(task, priority);
    }
}

/// Counters for queue and worker activity.
#[derive(Debug, Default)]
pub struct DispatchStats {
    submitted: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl DispatchStats {
    /// Tasks accepted into the queue.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Tasks whose `execute` returned, successfully or not.
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Tasks whose `execute` returned an error (logged, not retried).
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Submissions discarded because the queue was already stopped.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

struct QueuedTask {
    seq: u64,
    priority: TaskPriority,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then earlier submission.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    stopped: bool,
}

/// Thread-safe priority queue: one mutex, one condition variable.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    stats: DispatchStats,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Create an empty, unbounded queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            available: Condvar::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Submit a task at its base priority, waking one waiting worker.
    pub fn submit(&self, task: Task) {
        let priority = task.priority();
        self.submit_with_priority(task, priority);
    }

    /// Submit a task at an explicit priority.
    ///
    /// After [`TaskQueue::stop`] the task is accepted and discarded
    /// silently; callers are expected to have stopped submitting.
    pub fn submit_with_priority(&self, task: Task, priority: TaskPriority) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.stopped {
            tracing::debug!(task = task.label(), "submission after stop discarded");
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedTask {
            seq,
            priority,
            task,
        });
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.available.notify_one();
    }

    /// Block until a task is available or the queue (or pool) is stopping.
    fn next(&self, pool_stop: &AtomicBool) -> Option<Task> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.stopped || pool_stop.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(queued) = state.heap.pop() {
                return Some(queued.task);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Remove the highest-priority task without blocking.
    pub fn try_pop(&self) -> Option<Task> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .pop()
            .map(|queued| queued.task)
    }

    /// Number of tasks currently queued.
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }

    /// Stop the queue and wake every waiting worker.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.stopped = true;
        drop(state);
        self.available.notify_all();
    }

    /// Whether [`TaskQueue::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stopped
    }

    /// Wake every waiting worker without changing queue state.
    ///
    /// Takes the state lock first so a worker between its stop-flag check
    /// and its wait cannot miss the notification.
    fn wake_all(&self) {
        drop(self.state.lock().unwrap_or_else(PoisonError::into_inner));
        self.available.notify_all();
    }

    /// Activity counters.
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

/// Worker pool draining the shared task queue.
pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    ctx: Arc<TaskContext>,
    pool_stop: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `worker_count` workers over the given queue and context.
    pub fn new(queue: Arc<TaskQueue>, ctx: Arc<TaskContext>, worker_count: usize) -> Self {
        let dispatcher = Self {
            queue,
            ctx,
            pool_stop: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        };
        dispatcher.set_worker_count(worker_count);
        dispatcher
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let ctx = Arc::clone(&self.ctx);
        let pool_stop = Arc::clone(&self.pool_stop);
        std::thread::Builder::new()
            .name(format!("cycler-worker-{index}"))
            .spawn(move || worker_loop(queue, ctx, pool_stop))
            .expect("failed to spawn worker thread")
    }

    /// Resize the pool.
    ///
    /// Growing spawns additional workers. Shrinking signals the pool to
    /// stop, joins every worker (in-flight tasks complete first), clears
    /// the signal, and spawns the new count. Tasks submitted during the
    /// transition stay queued. A count of zero pauses execution; queued
    /// tasks are drained once the pool grows again.
    pub fn set_worker_count(&self, count: usize) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let current = workers.len();
        if count > current {
            for index in current..count {
                workers.push(self.spawn_worker(index));
            }
        } else if count < current {
            self.pool_stop.store(true, Ordering::SeqCst);
            self.queue.wake_all();
            for handle in workers.drain(..) {
                let _ = handle.join();
            }
            self.pool_stop.store(false, Ordering::SeqCst);
            for index in 0..count {
                workers.push(self.spawn_worker(index));
            }
        }
        tracing::info!(from = current, to = count, "worker pool resized");
    }

    /// Current pool size.
    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stop the queue and join every worker.
    ///
    /// In-flight tasks complete; queued tasks do not execute.
    pub fn shutdown(&self) {
        self.queue.stop();
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queue: Arc<TaskQueue>, ctx: Arc<TaskContext>, pool_stop: Arc<AtomicBool>) {
    tracing::debug!("worker started");
    while let Some(task) = queue.next(&pool_stop) {
        let label = task.label();
        let channel = task.channel();
        match task.execute(&ctx) {
            Ok(()) => {}
            Err(e) => {
                queue.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(task = label, channel, error = %e, "task failed");
            }
        }
        queue.stats.executed.fetch_add(1, Ordering::Relaxed);
    }
    tracing::debug!("worker exiting");
}
