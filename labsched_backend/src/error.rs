//! Error types shared by the scheduler and the drivers built on top of it.
//!
//! The two families follow different calling conventions:
//!
//! - [`TaskError`] describes why a single scheduled operation did not complete. It never escapes
//!   as a panic; it travels inside [`TaskOutcome::Failed`] and script authors usually collapse it
//!   into a sentinel with [`TaskOutcome::value_or_sentinel`].
//! - [`SchedulerError`] is returned as `Err` from constructors and configuration code, so that an
//!   orchestration script stops before any task has been scheduled against a faulty setup.
//!
//! [`TaskOutcome::Failed`]: crate::task::TaskOutcome::Failed
//! [`TaskOutcome::value_or_sentinel`]: crate::task::TaskOutcome::value_or_sentinel

use std::time::Duration;

use thiserror::Error;

/// Reason a scheduled device operation did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The channel lock was held and the caller asked not to wait for it.
    #[error("channel {channel} is busy")]
    ChannelUnavailable { channel: String },

    /// The device did not answer within the retry budget.
    #[error("no response on {channel} after {attempts} attempt(s)")]
    CommunicationTimeout { channel: String, attempts: u32 },

    /// The device answered, but not with what the protocol expects.
    #[error("unexpected reply on {channel}: {reply:?}")]
    Protocol { channel: String, reply: String },

    #[error("emergency stop is active")]
    EmergencyStopped,

    /// A task group rendezvous did not happen in time.
    #[error("task group {group} was not ready within {waited:?}")]
    GroupSyncTimeout { group: String, waited: Duration },

    /// Failure reported by the driver itself (bad arguments, device state).
    #[error("device operation failed: {0}")]
    Device(String),

    /// The task was rejected before being queued.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("device operation panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Whether [`call_with_retry`](crate::retry::call_with_retry) may try the same command again.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::CommunicationTimeout { .. })
    }
}

/// Errors raised while building or configuring the scheduling layer.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(String),

    #[error("failed to parse scheduler configuration")]
    ConfigParse(#[from] toml::de::Error),

    #[error("hardware id must not be empty")]
    EmptyHardwareId,

    #[error("hardware {0} is already registered with a different channel lock")]
    DuplicateHardware(String),

    #[error("hardware {0} is passive and cannot receive scheduled tasks")]
    NotSchedulable(String),

    #[error("failed to spawn scheduler worker")]
    Spawn(#[source] std::io::Error),

    /// Construction-time fast-fail: the device could not be reached.
    #[error("could not connect to {hardware_id} on {channel}")]
    Connect {
        hardware_id: String,
        channel: String,
        #[source]
        source: TaskError,
    },
}
