//! Cross-device rendezvous for tasks that belong together.
//!
//! A [`TaskGroup`] is created by the orchestrating script and handed to two (or more) scheduled
//! tasks on different hardware, e.g. "decap the vial" on a capper and "insert the probe" on a
//! sonicator. One member announces a precondition with [`TaskGroup::signal_ready`]; the others
//! block in [`TaskGroup::wait_until_ready`] until it happens. The group carries no hardware state.
//!
//! Every signal bumps a round number, the same way a command channel counts posted messages. A
//! waiter remembers the round it started in and is released by any later round, so a
//! `signal_ready` immediately followed by a `reset` still wakes everybody who was already waiting.
//!
//! The group also records which hardware has entered it (see
//! [`TaskScheduler::wait_for_hardware`](crate::scheduler::TaskScheduler::wait_for_hardware)).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::estop::{EmergencyStop, ESTOP_CHECK_INTERVAL};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

struct GroupState {
    ready: bool,
    timed_out: Option<Duration>,
    round: usize,
    entered: BTreeSet<String>,
}

pub struct TaskGroup {
    id: u64,
    name: String,
    state: Mutex<GroupState>,
    condvar: Condvar,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(GroupState {
                ready: false,
                timed_out: None,
                round: 0,
                entered: BTreeSet::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    /// Process-unique id, used by the scheduler to tag reserved hardware.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Announces that the precondition is met, waking all current and future waiters until
    /// [`TaskGroup::reset`].
    pub fn signal_ready(&self) {
        let mut state = self.state.lock();
        state.ready = true;
        state.round += 1;
        debug!(group = %self.name, round = state.round, "task group signalled ready");
        self.condvar.notify_all();
    }

    /// Blocks until the group is signalled or `timeout` elapses (`None` waits indefinitely).
    ///
    /// Returns `false` on timeout; the group is then marked as timed out so that the signalling
    /// member can observe the failed rendezvous as well.
    pub fn wait_until_ready(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let start_round = state.round;
        while !state.ready && state.round == start_round {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut state, deadline).timed_out()
                        && !state.ready
                        && state.round == start_round
                    {
                        state.timed_out = timeout;
                        warn!(group = %self.name, ?timeout, "task group wait timed out");
                        self.condvar.notify_all();
                        return false;
                    }
                }
                None => self.condvar.wait(&mut state),
            }
        }
        true
    }

    /// Like [`TaskGroup::wait_until_ready`], but also gives up when `estop` trips.
    pub fn wait_until_ready_or_stopped(
        &self,
        timeout: Option<Duration>,
        estop: &EmergencyStop,
    ) -> Result<(), TaskError> {
        let start = Instant::now();
        let mut state = self.state.lock();
        let start_round = state.round;
        while !state.ready && state.round == start_round {
            if estop.is_tripped() {
                return Err(TaskError::EmergencyStopped);
            }
            let mut slice = ESTOP_CHECK_INTERVAL;
            if let Some(timeout) = timeout {
                let waited = start.elapsed();
                if waited >= timeout {
                    state.timed_out = Some(waited);
                    warn!(group = %self.name, ?timeout, "task group wait timed out");
                    self.condvar.notify_all();
                    return Err(TaskError::GroupSyncTimeout {
                        group: self.name.clone(),
                        waited,
                    });
                }
                slice = slice.min(timeout - waited);
            }
            self.condvar.wait_for(&mut state, slice);
        }
        Ok(())
    }

    /// Clears the ready and timed-out flags and the membership for a new coordination round.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.ready = false;
        state.timed_out = None;
        state.entered.clear();
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Whether a member gave up waiting since the last [`TaskGroup::reset`].
    pub fn has_timed_out(&self) -> bool {
        self.state.lock().timed_out.is_some()
    }

    /// How long the member that gave up had been waiting.
    pub fn timed_out_after(&self) -> Option<Duration> {
        self.state.lock().timed_out
    }

    /// Records that `hardware_id` finished its earlier work and now serves this group.
    pub fn mark_entered(&self, hardware_id: &str) {
        let mut state = self.state.lock();
        state.entered.insert(hardware_id.to_string());
        self.condvar.notify_all();
    }

    pub fn mark_released(&self, hardware_id: &str) {
        let mut state = self.state.lock();
        state.entered.remove(hardware_id);
        self.condvar.notify_all();
    }

    pub fn has_entered(&self, hardware_id: &str) -> bool {
        self.state.lock().entered.contains(hardware_id)
    }

    /// Hardware currently serving this group, sorted by id.
    pub fn members(&self) -> Vec<String> {
        self.state.lock().entered.iter().cloned().collect()
    }

    /// Blocks until every id in `hardware_ids` has entered the group.
    pub fn wait_for_members(
        &self,
        hardware_ids: &[&str],
        timeout: Option<Duration>,
        estop: &EmergencyStop,
    ) -> Result<(), TaskError> {
        let start = Instant::now();
        let mut state = self.state.lock();
        while !hardware_ids.iter().all(|id| state.entered.contains(*id)) {
            if estop.is_tripped() {
                return Err(TaskError::EmergencyStopped);
            }
            let mut slice = ESTOP_CHECK_INTERVAL;
            if let Some(timeout) = timeout {
                let waited = start.elapsed();
                if waited >= timeout {
                    return Err(TaskError::GroupSyncTimeout {
                        group: self.name.clone(),
                        waited,
                    });
                }
                slice = slice.min(timeout - waited);
            }
            self.condvar.wait_for(&mut state, slice);
        }
        Ok(())
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ready", &state.ready)
            .field("timed_out", &state.timed_out)
            .field("entered", &state.entered)
            .finish()
    }
}
