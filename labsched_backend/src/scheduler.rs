//! # Task dispatch with the `scheduler` Module
//!
//! The [`TaskScheduler`] owns a pool of named worker threads and the dispatch state they share.
//! The pool grows whenever all workers are busy and another device has work, so a long task on one
//! device never holds up an unrelated one. Hardware drivers and orchestration scripts submit [`ScheduledTask`]s; workers pick them
//! up and run them while holding the owning hardware's [`ResourceLock`].
//!
//! ## Dispatch rules
//!
//! - Every hardware id has a FIFO of pending *sequential* tasks. Only its head is eligible, and only
//!   while no other task of that hardware is running, so sequential tasks on one device run one at a
//!   time in submission order.
//! - Non-sequential tasks sit in a global ready set and are eligible whenever their hardware is idle.
//! - Among eligible tasks a worker takes the one with the lowest `(priority, id)` whose channel lock
//!   it can take without waiting. A channel held outside the scheduler (e.g. by a status poll) is
//!   skipped and retried after `lock_retry_interval_ms`.
//! - Dispatch is non-preemptive. A running task finishes unless it returns at one of its own
//!   estop checkpoints.
//!
//! ## Emergency stop
//!
//! Each scheduler subscribes to its [`EmergencyStop`]. A trip cancels every pending task at once,
//! submissions made while tripped are answered with [`TaskOutcome::Cancelled`] without touching any
//! hardware, and a task that was picked concurrently with the trip is cancelled instead of run.
//!
//! ## Task group reservation
//!
//! [`TaskScheduler::wait_for_hardware`] reserves devices for a [`TaskGroup`]: once the devices
//! finished the work queued before the call, they only run tasks of that group until
//! [`TaskScheduler::release_hardware`] or [`TaskScheduler::finish_task_group`].

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::estop::{EmergencyStop, ListenerId};
use crate::group::TaskGroup;
use crate::hardware::{Hardware, HardwareKind};
use crate::lock::{ResourceGuard, ResourceLock};
use crate::task::{
    into_job, Job, ScheduledTask, Submitted, TaskContext, TaskId, TaskOptions, TaskOutcome,
};

struct HardwareSlot {
    lock: Arc<ResourceLock>,
    kind: HardwareKind,
    // Registered implicitly by the first submission rather than by `register_hardware`
    implicit: bool,
    group_sync: bool,
    sequential: VecDeque<TaskId>,
    busy: bool,
    reserved_by: Option<u64>,
}

impl HardwareSlot {
    fn new(lock: Arc<ResourceLock>, kind: HardwareKind, implicit: bool, group_sync: bool) -> Self {
        Self {
            lock,
            kind,
            implicit,
            group_sync,
            sequential: VecDeque::new(),
            busy: false,
            reserved_by: None,
        }
    }

    fn accepts(&self, task: &PendingTask) -> bool {
        !self.busy
            && self
                .reserved_by
                .map_or(true, |group_id| task.group_id() == Some(group_id))
    }

    /// The sequential task allowed to run next. A reserved slot lets tasks of its group overtake
    /// the rest of the queue.
    fn next_sequential(&self, pending: &HashMap<TaskId, PendingTask>) -> Option<TaskId> {
        match self.reserved_by {
            None => self.sequential.front().copied(),
            Some(group_id) => self.sequential.iter().copied().find(|id| {
                pending
                    .get(id)
                    .map_or(false, |task| task.group_id() == Some(group_id))
            }),
        }
    }

    fn is_idle(&self) -> bool {
        !self.busy && self.sequential.is_empty()
    }
}

struct PendingTask {
    hardware_id: String,
    priority: i32,
    sequential: bool,
    group: Option<Arc<TaskGroup>>,
    job: Box<dyn Job>,
}

impl PendingTask {
    fn group_id(&self) -> Option<u64> {
        self.group.as_ref().map(|g| g.id())
    }
}

enum Pick {
    Run(TaskId, PendingTask, ResourceGuard),
    /// Eligible work exists but every candidate channel is held outside the scheduler.
    Contended,
    Idle,
}

struct DispatchState {
    hardware: IndexMap<String, HardwareSlot>,
    pending: HashMap<TaskId, PendingTask>,
    // Non-sequential pending tasks, by (priority, id)
    ready: BTreeSet<(i32, TaskId)>,
    running: usize,
    workers: usize,
    shut_down: bool,
}

impl DispatchState {
    /// Unknown and implicitly registered hardware is given the benefit of the doubt.
    fn accepts_group(&self, hardware_id: &str) -> bool {
        self.hardware
            .get(hardware_id)
            .map_or(true, |slot| slot.group_sync)
    }

    fn slot_mut(&mut self, hardware_id: &str) -> &mut HardwareSlot {
        self.hardware
            .entry(hardware_id.to_string())
            .or_insert_with(|| {
                debug!(hardware_id, "registering hardware on first submission");
                HardwareSlot::new(ResourceLock::new(hardware_id), HardwareKind::Other, true, true)
            })
    }

    fn pick(&mut self) -> Pick {
        let mut candidates: Vec<(i32, TaskId)> = self
            .ready
            .iter()
            .copied()
            .filter(|(_, id)| {
                self.pending.get(id).map_or(false, |task| {
                    self.hardware
                        .get(&task.hardware_id)
                        .map_or(false, |slot| slot.accepts(task))
                })
            })
            .collect();
        for slot in self.hardware.values() {
            if slot.busy {
                continue;
            }
            if let Some(task) = slot
                .next_sequential(&self.pending)
                .and_then(|id| self.pending.get(&id).map(|task| (id, task)))
            {
                if slot.accepts(task.1) {
                    candidates.push((task.1.priority, task.0));
                }
            }
        }
        candidates.sort_unstable();

        let mut contended: HashSet<&str> = HashSet::new();
        let mut picked = None;
        for (_, id) in &candidates {
            let Some(task) = self.pending.get(id) else {
                continue;
            };
            if contended.contains(task.hardware_id.as_str()) {
                continue;
            }
            let Some(slot) = self.hardware.get(&task.hardware_id) else {
                continue;
            };
            match slot.lock.try_acquire() {
                Some(guard) => {
                    picked = Some((*id, guard));
                    break;
                }
                None => {
                    contended.insert(task.hardware_id.as_str());
                }
            }
        }
        let any_contended = !contended.is_empty();
        drop(contended);

        let Some((id, guard)) = picked else {
            return if any_contended { Pick::Contended } else { Pick::Idle };
        };
        let Some(task) = self.pending.remove(&id) else {
            return Pick::Idle;
        };
        if task.sequential {
            if let Some(slot) = self.hardware.get_mut(&task.hardware_id) {
                slot.sequential.retain(|queued| *queued != id);
            }
        } else {
            self.ready.remove(&(task.priority, id));
        }
        Pick::Run(id, task, guard)
    }

    /// Workers needed so that every hardware with work, running or pending, has one.
    fn workers_wanted(&self) -> usize {
        let waiting: HashSet<&str> = self
            .pending
            .values()
            .map(|task| task.hardware_id.as_str())
            .filter(|hardware_id| {
                self.hardware
                    .get(*hardware_id)
                    .map_or(false, |slot| !slot.busy)
            })
            .collect();
        (self.running + waiting.len()).min(self.hardware.len())
    }

    fn drain_pending(&mut self) -> Vec<(TaskId, PendingTask)> {
        self.ready.clear();
        self.hardware
            .values_mut()
            .for_each(|slot| slot.sequential.clear());
        self.pending.drain().collect()
    }

    fn drain_group(&mut self, group_id: u64) -> Vec<(TaskId, PendingTask)> {
        let ids: Vec<TaskId> = self
            .pending
            .iter()
            .filter(|(_, task)| task.group_id() == Some(group_id))
            .map(|(id, _)| *id)
            .collect();
        let mut drained = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(task) = self.pending.remove(&id) else {
                continue;
            };
            if task.sequential {
                if let Some(slot) = self.hardware.get_mut(&task.hardware_id) {
                    slot.sequential.retain(|queued| *queued != id);
                }
            } else {
                self.ready.remove(&(task.priority, id));
            }
            drained.push((id, task));
        }
        drained
    }
}

struct Inner {
    config: SchedulerConfig,
    estop: Arc<EmergencyStop>,
    state: Mutex<DispatchState>,
    work_available: Condvar,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn cancel_pending(&self, reason: &str) -> usize {
        let drained = self.state.lock().drain_pending();
        let count = drained.len();
        for (id, task) in drained {
            debug!(task_id = id, hardware_id = %task.hardware_id, "cancelling pending task");
            task.job.cancel();
        }
        if count > 0 {
            warn!(count, reason, "cancelled pending tasks");
        }
        self.work_available.notify_all();
        count
    }

    fn spawn_worker(self: &Arc<Self>, state: &mut DispatchState) -> std::io::Result<()> {
        let worker_inner = self.clone();
        let handle = thread::Builder::new()
            .name(format!("labsched-worker-{}", state.workers))
            .spawn(move || worker_inner.worker_loop())?;
        self.workers.lock().push(handle);
        state.workers += 1;
        Ok(())
    }

    /// Starts another worker when every existing one is taken, so that a long task on one device
    /// never delays another device. A device runs one task at a time, hence the pool stops
    /// growing at one worker per hardware id.
    fn grow_if_saturated(self: &Arc<Self>, state: &mut DispatchState) {
        if state.shut_down || state.workers >= state.workers_wanted() {
            return;
        }
        match self.spawn_worker(state) {
            Ok(()) => debug!(workers = state.workers, "worker pool grown"),
            Err(err) => error!(%err, "failed to grow the worker pool"),
        }
    }

    fn reserve(&self, hardware_id: &str, group: &TaskGroup) {
        let mut state = self.state.lock();
        let slot = state.slot_mut(hardware_id);
        slot.reserved_by = Some(group.id());
        info!(hardware_id, group = %group.name(), "hardware reserved for task group");
    }

    fn worker_loop(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shut_down {
                return;
            }
            if self.estop.is_tripped() && !state.pending.is_empty() {
                MutexGuard::unlocked(&mut state, || {
                    self.cancel_pending("emergency stop");
                });
                continue;
            }
            match state.pick() {
                Pick::Run(id, task, guard) => {
                    if let Some(slot) = state.hardware.get_mut(&task.hardware_id) {
                        slot.busy = true;
                    }
                    state.running += 1;
                    let hardware_id = task.hardware_id.clone();
                    MutexGuard::unlocked(&mut state, || self.run(id, task, guard));
                    state.running -= 1;
                    if let Some(slot) = state.hardware.get_mut(&hardware_id) {
                        slot.busy = false;
                    }
                    self.work_available.notify_one();
                }
                Pick::Contended => {
                    self.work_available
                        .wait_for(&mut state, self.config.lock_retry_interval());
                }
                Pick::Idle => {
                    self.work_available
                        .wait_for(&mut state, self.config.estop_poll_interval());
                }
            }
        }
    }

    fn run(&self, id: TaskId, task: PendingTask, guard: ResourceGuard) {
        if self.estop.is_tripped() {
            debug!(task_id = id, hardware_id = %task.hardware_id, "stop tripped at dispatch, cancelling");
            task.job.cancel();
            return;
        }
        debug!(task_id = id, hardware_id = %task.hardware_id, priority = task.priority, "running task");
        let ctx = TaskContext {
            id,
            hardware_id: task.hardware_id,
            guard,
            group: task.group,
            estop: self.estop.clone(),
        };
        task.job.run(&ctx);
        debug!(task_id = id, hardware_id = %ctx.hardware_id, "task finished");
    }
}

struct WorkerPool {
    inner: Arc<Inner>,
    listener: Mutex<Option<ListenerId>>,
}

impl WorkerPool {
    fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
        }
        if let Some(listener) = self.listener.lock().take() {
            self.inner.estop.unsubscribe(listener);
        }
        self.inner.cancel_pending("scheduler shut down");
        self.inner.work_available.notify_all();

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("scheduler worker terminated abnormally");
            }
        }
        info!("task scheduler shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running scheduler. Clones share the same workers and queues; the workers stop when
/// the last clone is dropped or [`TaskScheduler::shutdown`] is called.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
    pool: Arc<WorkerPool>,
}

impl TaskScheduler {
    /// Validates `config` and starts `config.worker_threads` workers.
    ///
    /// The pool grows beyond that whenever all workers are busy and another device has work, up
    /// to one worker per known hardware id.
    ///
    /// # Parameters
    ///
    /// * `config`: defaults and tuning knobs, see [`SchedulerConfig`].
    /// * `estop`: the stop this scheduler obeys. Pass [`EmergencyStop::global`] so that one trip
    ///   reaches every scheduler in the process.
    pub fn new(config: SchedulerConfig, estop: Arc<EmergencyStop>) -> Result<Self, SchedulerError> {
        config.validate()?;
        let worker_threads = config.worker_threads;
        let inner = Arc::new(Inner {
            config,
            estop: estop.clone(),
            state: Mutex::new(DispatchState {
                hardware: IndexMap::new(),
                pending: HashMap::new(),
                ready: BTreeSet::new(),
                running: 0,
                workers: 0,
                shut_down: false,
            }),
            work_available: Condvar::new(),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::with_capacity(worker_threads)),
        });
        let pool = Arc::new(WorkerPool {
            inner: inner.clone(),
            listener: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let listener = estop.subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_pending("emergency stop");
            }
        });
        *pool.listener.lock() = Some(listener);

        {
            let mut state = inner.state.lock();
            for _ in 0..worker_threads {
                inner
                    .spawn_worker(&mut state)
                    .map_err(SchedulerError::Spawn)?;
            }
        }
        info!(worker_threads, "task scheduler started");
        Ok(Self { inner, pool })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn estop(&self) -> &Arc<EmergencyStop> {
        &self.inner.estop
    }

    /// Makes `hardware`'s channel lock the one its tasks run under.
    ///
    /// Registering the same driver twice is a no-op. Passive hardware is rejected, as is a second
    /// driver claiming an id that already has a different lock.
    pub fn register_hardware(&self, hardware: &dyn Hardware) -> Result<(), SchedulerError> {
        let hardware_id = hardware.hardware_id();
        if hardware_id.is_empty() {
            return Err(SchedulerError::EmptyHardwareId);
        }
        if !hardware.kind().is_schedulable() {
            return Err(SchedulerError::NotSchedulable(hardware_id.to_string()));
        }
        let lock = hardware.lock();
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.hardware.get_mut(hardware_id) {
            if Arc::ptr_eq(&slot.lock, &lock) {
                return Ok(());
            }
            if !(slot.implicit && slot.is_idle()) {
                return Err(SchedulerError::DuplicateHardware(hardware_id.to_string()));
            }
            slot.lock = lock;
            slot.kind = hardware.kind();
            slot.implicit = false;
            slot.group_sync = hardware.supports_group_sync();
        } else {
            state.hardware.insert(
                hardware_id.to_string(),
                HardwareSlot::new(lock, hardware.kind(), false, hardware.supports_group_sync()),
            );
        }
        info!(hardware_id, kind = %hardware.kind(), channel = hardware.channel_id(), "hardware registered");
        Ok(())
    }

    /// Kind of a known hardware id. Implicitly registered hardware reports [`HardwareKind::Other`].
    pub fn hardware_kind(&self, hardware_id: &str) -> Option<HardwareKind> {
        self.inner
            .state
            .lock()
            .hardware
            .get(hardware_id)
            .map(|slot| slot.kind)
    }

    /// Hardware ids known to the scheduler, in registration order.
    pub fn hardware_ids(&self) -> Vec<String> {
        self.inner.state.lock().hardware.keys().cloned().collect()
    }

    /// Submits `task`.
    ///
    /// Blocking submissions (the task's `block` option, or `default_blocking`) return
    /// [`Submitted::Finished`] once the task is terminal; the others return a [`Submitted::Queued`]
    /// handle right away. A task with an empty hardware id fails with [`TaskError::InvalidTask`],
    /// and while the stop is tripped every submission is answered with [`TaskOutcome::Cancelled`]
    /// without being queued. So is a task carrying a group for registered hardware that does not
    /// support group synchronization, which fails with [`TaskError::InvalidTask`].
    ///
    /// A blocking submission from inside a running task on the same hardware never completes.
    pub fn submit<T: Send + 'static>(&self, task: ScheduledTask<T>) -> Submitted<T> {
        if task.hardware_id.is_empty() {
            return Submitted::Finished(TaskOutcome::Failed(TaskError::InvalidTask(
                "hardware id must not be empty".to_string(),
            )));
        }
        if self.inner.estop.is_tripped() {
            return Submitted::Finished(TaskOutcome::Cancelled);
        }

        let config = &self.inner.config;
        let block = task.options.block.unwrap_or(config.default_blocking);
        let priority = task.options.priority.unwrap_or(config.default_priority);
        let sequential = task.options.is_sequential_task;
        let group = task.options.group.clone();
        let hardware_id = task.hardware_id.clone();

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (job, handle) = into_job(id, task);
        {
            let mut state = self.inner.state.lock();
            if state.shut_down {
                drop(state);
                job.cancel();
                return Submitted::Finished(TaskOutcome::Cancelled);
            }
            if let Some(group) = &group {
                if !state.accepts_group(&hardware_id) {
                    drop(state);
                    drop(job);
                    warn!(hardware_id = %hardware_id, group = %group.name(), "hardware does not take part in task groups");
                    return Submitted::Finished(TaskOutcome::Failed(TaskError::InvalidTask(format!(
                        "{} does not support task group synchronization",
                        hardware_id
                    ))));
                }
            }
            let slot = state.slot_mut(&hardware_id);
            if sequential {
                slot.sequential.push_back(id);
            } else {
                state.ready.insert((priority, id));
            }
            state.pending.insert(
                id,
                PendingTask {
                    hardware_id: hardware_id.clone(),
                    priority,
                    sequential,
                    group,
                    job,
                },
            );
            self.inner.grow_if_saturated(&mut state);
        }
        self.inner.work_available.notify_one();
        debug!(task_id = id, hardware_id = %hardware_id, priority, sequential, block, "task submitted");

        if block {
            Submitted::Finished(handle.wait())
        } else {
            Submitted::Queued(handle)
        }
    }

    /// Cancels every pending task without running it and returns how many there were.
    ///
    /// Running tasks are left alone; they notice a tripped stop at their next checkpoint. Calling
    /// it again with nothing pending returns 0.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_pending("cancel_all")
    }

    /// Wraps a plain device operation into a reusable submitter, see [`ScheduledOperation::call`].
    ///
    /// # Example
    ///
    /// ```
    /// use labsched_backend::*;
    ///
    /// let scheduler = TaskScheduler::new(SchedulerConfig::default(), EmergencyStop::new()).unwrap();
    /// let set_speed = scheduler.scheduled_task("centrifuge", |_ctx: &TaskContext, rpm: u32| Ok(rpm));
    /// let outcome = set_speed.call(1200, TaskOptions::default()).wait();
    /// assert_eq!(outcome, TaskOutcome::Completed(1200));
    /// ```
    pub fn scheduled_task<A, T, F>(
        &self,
        hardware_id: impl Into<String>,
        op: F,
    ) -> ScheduledOperation<A, T>
    where
        F: Fn(&TaskContext, A) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        ScheduledOperation {
            scheduler: self.clone(),
            hardware_id: hardware_id.into(),
            op: Arc::new(op),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Number of worker threads started so far.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().workers
    }

    /// Reserves `hardware_ids` for `group` and blocks until all of them have entered it.
    ///
    /// A sequential marker task is queued on every device, so each device first finishes the work
    /// submitted before this call. From then on it only runs tasks carrying `group`; those may
    /// overtake non-group sequential tasks queued behind the marker.
    ///
    /// Registered hardware whose driver does not support group synchronization is refused with
    /// [`TaskError::InvalidTask`] before anything is queued.
    ///
    /// # Parameters
    ///
    /// * `hardware_ids`: devices taking part in the group.
    /// * `group`: the rendezvous object the group's tasks carry.
    /// * `timeout`: how long to wait for all devices; `None` waits until they enter or the stop trips.
    pub fn wait_for_hardware(
        &self,
        hardware_ids: &[&str],
        group: &Arc<TaskGroup>,
        timeout: Option<Duration>,
    ) -> Result<(), TaskError> {
        self.inner.estop.check()?;
        {
            let state = self.inner.state.lock();
            if let Some(hardware_id) = hardware_ids.iter().find(|id| !state.accepts_group(id)) {
                return Err(TaskError::InvalidTask(format!(
                    "{} does not support task group synchronization",
                    hardware_id
                )));
            }
        }
        for hardware_id in hardware_ids {
            let weak = Arc::downgrade(&self.inner);
            let marker_group = group.clone();
            let marker = ScheduledTask::new(*hardware_id, move |ctx: &TaskContext| {
                if let Some(inner) = weak.upgrade() {
                    inner.reserve(ctx.hardware_id(), &marker_group);
                }
                marker_group.mark_entered(ctx.hardware_id());
                Ok(())
            })
            .sequential(true)
            .block(false)
            .group(group.clone());
            if let Submitted::Finished(outcome) = self.submit(marker) {
                outcome.into_result()?;
            }
        }
        group.wait_for_members(hardware_ids, timeout, &self.inner.estop)
    }

    /// Ends `group`'s reservation of `hardware_ids`.
    pub fn release_hardware(&self, hardware_ids: &[&str], group: &TaskGroup) {
        {
            let mut state = self.inner.state.lock();
            for hardware_id in hardware_ids {
                if let Some(slot) = state.hardware.get_mut(*hardware_id) {
                    if slot.reserved_by == Some(group.id()) {
                        slot.reserved_by = None;
                        info!(hardware_id, group = %group.name(), "hardware released by task group");
                    }
                }
                group.mark_released(hardware_id);
            }
        }
        self.inner.work_available.notify_all();
    }

    /// Releases every device reserved by `group` and returns how many there were.
    ///
    /// Tasks of `group` that have not started yet (including the markers of a
    /// [`wait_for_hardware`](Self::wait_for_hardware) call that timed out) are cancelled.
    pub fn finish_task_group(&self, group: &TaskGroup) -> usize {
        let (released, cancelled): (Vec<String>, Vec<(TaskId, PendingTask)>) = {
            let mut state = self.inner.state.lock();
            let cancelled = state.drain_group(group.id());
            let released = state
                .hardware
                .iter_mut()
                .filter(|(_, slot)| slot.reserved_by == Some(group.id()))
                .map(|(hardware_id, slot)| {
                    slot.reserved_by = None;
                    hardware_id.clone()
                })
                .collect();
            (released, cancelled)
        };
        for (id, task) in cancelled {
            debug!(task_id = id, hardware_id = %task.hardware_id, group = %group.name(), "cancelling task of finished group");
            task.job.cancel();
        }
        released
            .iter()
            .for_each(|hardware_id| group.mark_released(hardware_id));
        self.inner.work_available.notify_all();
        info!(group = %group.name(), released = released.len(), "task group finished");
        released.len()
    }

    /// Cancels pending tasks, lets running ones finish and stops the workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TaskScheduler")
            .field("hardware", &state.hardware.keys().collect::<Vec<_>>())
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .field("workers", &state.workers)
            .field("estop", &self.inner.estop.state())
            .finish()
    }
}

type Operation<A, T> = dyn Fn(&TaskContext, A) -> Result<T, TaskError> + Send + Sync;

/// A device operation bound to a hardware id, produced by [`TaskScheduler::scheduled_task`].
pub struct ScheduledOperation<A, T> {
    scheduler: TaskScheduler,
    hardware_id: String,
    op: Arc<Operation<A, T>>,
}

impl<A: Send + 'static, T: Send + 'static> ScheduledOperation<A, T> {
    /// Submits one call of the operation with `args`, scheduled according to `options`.
    pub fn call(&self, args: A, options: TaskOptions) -> Submitted<T> {
        let op = self.op.clone();
        let task = ScheduledTask::new(self.hardware_id.clone(), move |ctx: &TaskContext| {
            op(ctx, args)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }
}

impl<A, T> Clone for ScheduledOperation<A, T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            hardware_id: self.hardware_id.clone(),
            op: self.op.clone(),
        }
    }
}
