//! # Lab task scheduling core
//!
//! `labsched_backend` lets many independent laboratory devices (pumps, centrifuges, sonicators,
//! robot arms) run concurrent, order-dependent operations safely:
//!
//! - per-channel mutual exclusion with scoped release, see [`lock`];
//! - per-device sequential queues and a global priority order, see [`scheduler`];
//! - blocking and non-blocking submission with handles, see [`task`];
//! - cross-device rendezvous between tasks, see [`group`];
//! - a process-wide, cooperative emergency stop, see [`estop`];
//! - bounded retries for flaky serial and network I/O, see [`retry`].
//!
//! Device drivers live in a separate crate and implement the [`Hardware`] trait. Steady-state
//! failures never panic or propagate as `Err` out of the scheduler; they come back as
//! [`TaskOutcome::Failed`] or [`TaskOutcome::Cancelled`], which script code usually collapses into
//! a sentinel with [`TaskOutcome::value_or_sentinel`].
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use labsched_backend::*;
//!
//! let estop = EmergencyStop::new();
//! let scheduler = TaskScheduler::new(SchedulerConfig::default(), estop.clone()).unwrap();
//!
//! let spin = ScheduledTask::new("centrifuge", |ctx: &TaskContext| {
//!     ctx.sleep(Duration::from_millis(10))?;
//!     Ok(1200)
//! })
//! .block(false);
//! let handle = scheduler.submit(spin);
//! assert_eq!(handle.wait().value_or_sentinel(), 1200);
//!
//! estop.trip("operator pressed the button");
//! let late = scheduler.submit(ScheduledTask::new("centrifuge", |_: &TaskContext| Ok(1200)));
//! assert_eq!(late.wait().value_or_sentinel(), -1);
//! ```

pub mod config;
pub mod error;
pub mod estop;
pub mod group;
pub mod hardware;
pub mod lock;
pub mod retry;
pub mod scheduler;
pub mod task;

pub use config::*;
pub use error::*;
pub use estop::*;
pub use group::*;
pub use hardware::*;
pub use lock::*;
pub use retry::*;
pub use scheduler::*;
pub use task::*;
