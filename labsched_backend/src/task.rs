//! Scheduled tasks, their outcomes and the handles callers use to collect them.
//!
//! A device operation is an ordinary closure `FnOnce(&TaskContext) -> Result<T, TaskError>`. The
//! [`ScheduledTask`] builder attaches the scheduling options to it; the scheduler answers every
//! submission with a [`Submitted`] value that is either already finished (blocking calls and
//! short-circuited submissions) or a [`TaskHandle`] to wait on later.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::error::TaskError;
use crate::estop::EmergencyStop;
use crate::group::TaskGroup;
use crate::lock::ResourceGuard;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TaskState::Pending => "pending",
                TaskState::Running => "running",
                TaskState::Completed => "completed",
                TaskState::Failed => "failed",
                TaskState::Cancelled => "cancelled",
            }
        )
    }
}

/// Terminal result of a scheduled task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(TaskError),
    /// The task never ran, or stopped at a checkpoint, because of an emergency stop or shutdown.
    Cancelled,
}

impl<T> TaskOutcome<T> {
    pub fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            TaskOutcome::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Folds the outcome into a `Result`, reporting cancellation as [`TaskError::EmergencyStopped`].
    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            TaskOutcome::Completed(value) => Ok(value),
            TaskOutcome::Failed(err) => Err(err),
            TaskOutcome::Cancelled => Err(TaskError::EmergencyStopped),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> TaskOutcome<U> {
        match self {
            TaskOutcome::Completed(value) => TaskOutcome::Completed(f(value)),
            TaskOutcome::Failed(err) => TaskOutcome::Failed(err),
            TaskOutcome::Cancelled => TaskOutcome::Cancelled,
        }
    }

    /// The value on success, the type's sentinel otherwise.
    pub fn value_or_sentinel(self) -> T
    where
        T: Sentinel,
    {
        self.ok().unwrap_or_else(T::sentinel)
    }

    fn from_result(res: Result<T, TaskError>) -> Self {
        match res {
            Ok(value) => TaskOutcome::Completed(value),
            Err(TaskError::EmergencyStopped) => TaskOutcome::Cancelled,
            Err(err) => TaskOutcome::Failed(err),
        }
    }
}

/// Well-known "did not complete" value returned to script authors instead of an error.
pub trait Sentinel {
    fn sentinel() -> Self;
}

impl Sentinel for bool {
    fn sentinel() -> Self {
        false
    }
}

impl Sentinel for i32 {
    fn sentinel() -> Self {
        -1
    }
}

impl Sentinel for i64 {
    fn sentinel() -> Self {
        -1
    }
}

impl Sentinel for f64 {
    fn sentinel() -> Self {
        -1.0
    }
}

impl Sentinel for String {
    fn sentinel() -> Self {
        String::new()
    }
}

impl Sentinel for () {
    fn sentinel() -> Self {}
}

impl<T> Sentinel for Option<T> {
    fn sentinel() -> Self {
        None
    }
}

impl<T> Sentinel for Vec<T> {
    fn sentinel() -> Self {
        Vec::new()
    }
}

/// Per-call scheduling options, the knobs of [`TaskScheduler::scheduled_task`].
///
/// `None` for `block` and `priority` means "use the scheduler default".
///
/// [`TaskScheduler::scheduled_task`]: crate::scheduler::TaskScheduler::scheduled_task
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub block: Option<bool>,
    pub is_sequential_task: bool,
    pub priority: Option<i32>,
    pub group: Option<Arc<TaskGroup>>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            block: None,
            is_sequential_task: true,
            priority: None,
            group: None,
        }
    }
}

type Action<T> = Box<dyn FnOnce(&TaskContext) -> Result<T, TaskError> + Send + 'static>;

/// A device operation together with its scheduling options, ready to be submitted.
pub struct ScheduledTask<T> {
    pub(crate) hardware_id: String,
    pub(crate) options: TaskOptions,
    pub(crate) action: Action<T>,
}

impl<T: Send + 'static> ScheduledTask<T> {
    pub fn new<F>(hardware_id: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<T, TaskError> + Send + 'static,
    {
        Self {
            hardware_id: hardware_id.into(),
            options: TaskOptions::default(),
            action: Box::new(action),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.options.priority = Some(priority);
        self
    }

    pub fn sequential(mut self, is_sequential_task: bool) -> Self {
        self.options.is_sequential_task = is_sequential_task;
        self
    }

    pub fn block(mut self, block: bool) -> Self {
        self.options.block = Some(block);
        self
    }

    pub fn group(mut self, group: Arc<TaskGroup>) -> Self {
        self.options.group = Some(group);
        self
    }

    pub fn with_options(mut self, options: TaskOptions) -> Self {
        self.options = options;
        self
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub fn options(&self) -> &TaskOptions {
        &self.options
    }
}

impl<T> fmt::Debug for ScheduledTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("hardware_id", &self.hardware_id)
            .field("options", &self.options)
            .finish()
    }
}

struct Status {
    state: TaskState,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// State shared between the worker running a task and the task's handle.
pub(crate) struct StatusCell(Mutex<Status>);

impl StatusCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Status {
            state: TaskState::Pending,
            started_at: None,
            finished_at: None,
        })))
    }

    fn mark_running(&self) {
        let mut status = self.0.lock();
        status.state = TaskState::Running;
        status.started_at = Some(Instant::now());
    }

    fn mark_finished(&self, state: TaskState) {
        let mut status = self.0.lock();
        if !status.state.is_terminal() {
            status.state = state;
            status.finished_at = Some(Instant::now());
        }
    }

    fn state(&self) -> TaskState {
        self.0.lock().state
    }
}

/// Type-erased unit of work stored in the scheduler's queues.
pub(crate) trait Job: Send {
    fn run(self: Box<Self>, ctx: &TaskContext);
    fn cancel(self: Box<Self>);
}

pub(crate) struct TaskJob<T> {
    action: Action<T>,
    status: Arc<StatusCell>,
    tx: Sender<TaskOutcome<T>>,
}

fn deliver<T>(status: &StatusCell, tx: &Sender<TaskOutcome<T>>, outcome: TaskOutcome<T>) {
    // Status first, so a caller woken by the outcome already sees the terminal state
    status.mark_finished(outcome.state());
    // The receiver may already be gone (fire-and-forget submission)
    let _ = tx.send(outcome);
}

impl<T: Send + 'static> Job for TaskJob<T> {
    fn run(self: Box<Self>, ctx: &TaskContext) {
        let TaskJob { action, status, tx } = *self;
        status.mark_running();
        let outcome = match catch_unwind(AssertUnwindSafe(|| action(ctx))) {
            Ok(res) => TaskOutcome::from_result(res),
            Err(payload) => TaskOutcome::Failed(TaskError::Panicked(panic_message(payload))),
        };
        deliver(&status, &tx, outcome);
    }

    fn cancel(self: Box<Self>) {
        deliver(&self.status, &self.tx, TaskOutcome::Cancelled);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Splits a task into the queued job and the caller's handle.
pub(crate) fn into_job<T: Send + 'static>(
    id: TaskId,
    task: ScheduledTask<T>,
) -> (Box<dyn Job>, TaskHandle<T>) {
    let status = StatusCell::new();
    let (tx, rx) = crossbeam::channel::bounded(1);
    let job = TaskJob {
        action: task.action,
        status: status.clone(),
        tx,
    };
    let handle = TaskHandle {
        id,
        hardware_id: task.hardware_id,
        status,
        rx,
        outcome: None,
    };
    (Box::new(job), handle)
}

/// Caller's side of a queued task.
pub struct TaskHandle<T> {
    id: TaskId,
    hardware_id: String,
    status: Arc<StatusCell>,
    rx: Receiver<TaskOutcome<T>>,
    outcome: Option<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub fn state(&self) -> TaskState {
        self.status.state()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.state().is_terminal()
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.status.0.lock().started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.status.0.lock().finished_at
    }

    /// The outcome if the task has already finished.
    pub fn try_result(&mut self) -> Option<&TaskOutcome<T>> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Disconnected) => self.abandoned(),
                Err(TryRecvError::Empty) => {}
            }
        }
        self.outcome.as_ref()
    }

    /// Waits at most `timeout` for the outcome.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<&TaskOutcome<T>> {
        if self.outcome.is_none() {
            match self.rx.recv_timeout(timeout) {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(RecvTimeoutError::Disconnected) => self.abandoned(),
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
        self.outcome.as_ref()
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(mut self) -> TaskOutcome<T> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        match self.rx.recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                self.status.mark_finished(TaskState::Cancelled);
                TaskOutcome::Cancelled
            }
        }
    }

    // The job was dropped without reporting, e.g. by a scheduler torn down mid-queue
    fn abandoned(&mut self) {
        self.status.mark_finished(TaskState::Cancelled);
        self.outcome = Some(TaskOutcome::Cancelled);
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("hardware_id", &self.hardware_id)
            .field("state", &self.state())
            .finish()
    }
}

/// What [`TaskScheduler::submit`](crate::scheduler::TaskScheduler::submit) hands back.
#[derive(Debug)]
pub enum Submitted<T> {
    /// Blocking submissions and submissions rejected up front.
    Finished(TaskOutcome<T>),
    Queued(TaskHandle<T>),
}

impl<T> Submitted<T> {
    /// Converges both paths: the outcome a blocking call would have returned.
    pub fn wait(self) -> TaskOutcome<T> {
        match self {
            Submitted::Finished(outcome) => outcome,
            Submitted::Queued(handle) => handle.wait(),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, Submitted::Queued(_))
    }

    pub fn handle(&self) -> Option<&TaskHandle<T>> {
        match self {
            Submitted::Queued(handle) => Some(handle),
            Submitted::Finished(_) => None,
        }
    }

    pub fn into_handle(self) -> Option<TaskHandle<T>> {
        match self {
            Submitted::Queued(handle) => Some(handle),
            Submitted::Finished(_) => None,
        }
    }
}

/// Everything a running device operation may use: the channel guard, its group and the estop.
pub struct TaskContext {
    pub(crate) id: TaskId,
    pub(crate) hardware_id: String,
    pub(crate) guard: ResourceGuard,
    pub(crate) group: Option<Arc<TaskGroup>>,
    pub(crate) estop: Arc<EmergencyStop>,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    /// The hardware's channel lock, held for the whole run of the task except inside
    /// [`TaskContext::sleep_released`].
    pub fn guard(&self) -> &ResourceGuard {
        &self.guard
    }

    pub fn group(&self) -> Option<&Arc<TaskGroup>> {
        self.group.as_ref()
    }

    pub fn estop(&self) -> &Arc<EmergencyStop> {
        &self.estop
    }

    /// Cancellation point: `Err(EmergencyStopped)` once the stop is tripped.
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        self.estop.check()
    }

    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        self.estop.sleep(duration)
    }

    /// Sleeps with the channel freed, so status reads from other threads get through, and takes
    /// it back before returning, also after an emergency stop.
    ///
    /// The hardware stays reserved for this task meanwhile; only out-of-band users of the channel
    /// lock can slip in.
    pub fn sleep_released(&self, duration: Duration) -> Result<(), TaskError> {
        self.guard.released(|| self.sleep(duration))
    }

    /// Blocks until another member of this task's group signals ready.
    pub fn wait_for_group(&self, timeout: Option<Duration>) -> Result<(), TaskError> {
        let group = self.require_group()?;
        group.wait_until_ready_or_stopped(timeout, &self.estop)
    }

    /// Signals this task's group.
    ///
    /// Fails with [`TaskError::GroupSyncTimeout`] if the waiting member already gave up, so both
    /// sides of a failed rendezvous see the failure.
    pub fn signal_group(&self) -> Result<(), TaskError> {
        self.checkpoint()?;
        let group = self.require_group()?;
        if let Some(waited) = group.timed_out_after() {
            return Err(TaskError::GroupSyncTimeout {
                group: group.name().to_string(),
                waited,
            });
        }
        group.signal_ready();
        Ok(())
    }

    /// Re-evaluates `condition` every `interval` until it holds, the optional `timeout` runs out
    /// or the stop is tripped.
    pub fn poll_until<F>(
        &self,
        interval: Duration,
        timeout: Option<Duration>,
        condition: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut() -> Result<bool, TaskError>,
    {
        self.poll(interval, timeout, false, condition)
    }

    /// Like [`TaskContext::poll_until`], but the channel is freed between two evaluations (see
    /// [`TaskContext::sleep_released`]).
    pub fn poll_until_released<F>(
        &self,
        interval: Duration,
        timeout: Option<Duration>,
        condition: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut() -> Result<bool, TaskError>,
    {
        self.poll(interval, timeout, true, condition)
    }

    fn poll<F>(
        &self,
        interval: Duration,
        timeout: Option<Duration>,
        release: bool,
        mut condition: F,
    ) -> Result<(), TaskError>
    where
        F: FnMut() -> Result<bool, TaskError>,
    {
        let start = Instant::now();
        loop {
            self.checkpoint()?;
            if condition()? {
                return Ok(());
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(TaskError::Device(format!(
                        "{}: condition not reached within {:?}",
                        self.hardware_id, timeout
                    )));
                }
            }
            if release {
                self.sleep_released(interval)?;
            } else {
                self.sleep(interval)?;
            }
        }
    }

    fn require_group(&self) -> Result<&Arc<TaskGroup>, TaskError> {
        self.group.as_ref().ok_or_else(|| {
            TaskError::InvalidTask(format!("task {} has no task group", self.id))
        })
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("hardware_id", &self.hardware_id)
            .field("group", &self.group.as_ref().map(|g| g.name()))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lock::ResourceLock;

    fn context(group: Option<Arc<TaskGroup>>, estop: Arc<EmergencyStop>) -> TaskContext {
        context_on(&ResourceLock::new("COM1"), group, estop)
    }

    fn context_on(
        lock: &Arc<ResourceLock>,
        group: Option<Arc<TaskGroup>>,
        estop: Arc<EmergencyStop>,
    ) -> TaskContext {
        TaskContext {
            id: 7,
            hardware_id: "pumpA".into(),
            guard: lock.try_acquire().unwrap(),
            group,
            estop,
        }
    }

    #[test]
    fn sentinels() {
        let failed: TaskOutcome<i32> = TaskOutcome::Failed(TaskError::Device("jammed".into()));
        assert_eq!(failed.value_or_sentinel(), -1);
        assert!(!TaskOutcome::<bool>::Cancelled.value_or_sentinel());
        assert_eq!(TaskOutcome::<String>::Cancelled.value_or_sentinel(), "");
        assert_eq!(TaskOutcome::Completed(1200).value_or_sentinel(), 1200);
    }

    #[test]
    fn stop_during_action_is_a_cancellation() {
        let outcome: TaskOutcome<()> = TaskOutcome::from_result(Err(TaskError::EmergencyStopped));
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(outcome.into_result(), Err(TaskError::EmergencyStopped));
    }

    #[test]
    fn job_delivers_to_handle() {
        let task = ScheduledTask::new("pumpA", |ctx: &TaskContext| Ok(ctx.id() * 2));
        let (job, mut handle) = into_job(7, task);
        assert_eq!(handle.state(), TaskState::Pending);
        assert!(handle.try_result().is_none());

        job.run(&context(None, EmergencyStop::new()));
        assert_eq!(handle.state(), TaskState::Completed);
        assert!(handle.started_at().is_some());
        assert_eq!(handle.try_result(), Some(&TaskOutcome::Completed(14)));
        assert_eq!(handle.wait(), TaskOutcome::Completed(14));
    }

    #[test]
    fn panicking_job_fails() {
        let task = ScheduledTask::new("pumpA", |_: &TaskContext| -> Result<(), TaskError> {
            panic!("valve stuck")
        });
        let (job, handle) = into_job(1, task);
        job.run(&context(None, EmergencyStop::new()));
        assert_eq!(
            handle.wait(),
            TaskOutcome::Failed(TaskError::Panicked("valve stuck".into()))
        );
    }

    #[test]
    fn cancelled_job_and_dropped_job() {
        let (job, handle) = into_job(1, ScheduledTask::new("a", |_: &TaskContext| Ok(1)));
        job.cancel();
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert_eq!(handle.wait(), TaskOutcome::Cancelled);

        let (job, mut handle) = into_job(2, ScheduledTask::new("a", |_: &TaskContext| Ok(1)));
        drop(job);
        assert_eq!(handle.wait_timeout(Duration::from_millis(10)), Some(&TaskOutcome::Cancelled));
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn builder_sets_options() {
        let group = TaskGroup::new("g");
        let task = ScheduledTask::new("pumpA", |_: &TaskContext| Ok(()))
            .priority(2)
            .sequential(false)
            .block(false)
            .group(group.clone());
        assert_eq!(task.options().priority, Some(2));
        assert!(!task.options().is_sequential_task);
        assert_eq!(task.options().block, Some(false));
        assert!(Arc::ptr_eq(task.options().group.as_ref().unwrap(), &group));

        let task = task.with_options(TaskOptions::default());
        assert!(task.options().is_sequential_task);
        assert!(task.options().group.is_none());
    }

    #[test]
    fn signal_after_partner_gave_up_fails() {
        let group = TaskGroup::new("decap");
        assert!(!group.wait_until_ready(Some(Duration::from_millis(5))));
        let ctx = context(Some(group.clone()), EmergencyStop::new());
        match ctx.signal_group() {
            Err(TaskError::GroupSyncTimeout { group: name, .. }) => assert_eq!(name, "decap"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!group.is_ready());
    }

    #[test]
    fn group_calls_need_a_group() {
        let ctx = context(None, EmergencyStop::new());
        assert!(matches!(ctx.signal_group(), Err(TaskError::InvalidTask(_))));
        assert!(matches!(ctx.wait_for_group(None), Err(TaskError::InvalidTask(_))));
    }

    #[test]
    fn poll_until() {
        let ctx = context(None, EmergencyStop::new());
        let mut speed = 0;
        ctx.poll_until(Duration::from_millis(1), Some(Duration::from_secs(1)), || {
            speed += 1000;
            Ok(speed >= 3000)
        })
        .unwrap();
        assert_eq!(speed, 3000);

        let res = ctx.poll_until(Duration::from_millis(5), Some(Duration::from_millis(20)), || Ok(false));
        assert!(matches!(res, Err(TaskError::Device(_))));

        let estop = EmergencyStop::new();
        estop.trip("test");
        let ctx = context(None, estop);
        let res = ctx.poll_until(Duration::from_millis(5), None, || Ok(false));
        assert_eq!(res, Err(TaskError::EmergencyStopped));
    }

    #[test]
    fn released_polling_lets_status_reads_through() {
        let lock = ResourceLock::new("COM4");
        let ctx = context_on(&lock, None, EmergencyStop::new());
        let mut reads = 0;
        let mut polls = 0;
        ctx.poll_until_released(Duration::from_millis(1), Some(Duration::from_secs(1)), || {
            assert!(ctx.guard().guards(&lock));
            assert!(lock.try_acquire().is_none());
            polls += 1;
            Ok(polls == 3)
        })
        .unwrap();
        assert_eq!(polls, 3);

        // Between evaluations another thread can take the channel for a moment
        let lock_ = lock.clone();
        let reader = std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while Instant::now() < deadline {
                if let Some(_guard) = lock_.try_acquire() {
                    return true;
                }
                std::thread::sleep(Duration::from_micros(200));
            }
            false
        });
        ctx.poll_until_released(Duration::from_millis(20), Some(Duration::from_secs(2)), || {
            reads += 1;
            Ok(reads == 10)
        })
        .unwrap();
        assert!(reader.join().unwrap());
        assert!(ctx.guard().guards(&lock));
    }

    #[test]
    fn released_sleep_reports_estop() {
        let estop = EmergencyStop::new();
        let lock = ResourceLock::new("COM4");
        let ctx = context_on(&lock, None, estop.clone());
        estop.trip("test");
        assert_eq!(ctx.sleep_released(Duration::from_millis(5)), Err(TaskError::EmergencyStopped));
        assert!(ctx.guard().guards(&lock));
        drop(ctx);
        assert!(!lock.is_held());
    }
}
