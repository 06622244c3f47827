//! # Laboratory hardware control on top of `labsched_backend`
//!
//! This crate connects real (or simulated) instruments to the task scheduler of
//! [`labsched_backend`]:
//!
//! - [`transport`]: line-oriented byte transports, over TCP or simulated in-process.
//! - [`link`]: the [`DeviceLink`] every driver talks through. It owns the channel's
//!   [`ResourceLock`](labsched_backend::ResourceLock), retries timed-out exchanges and fails hard
//!   at construction when the device does not answer.
//! - [`centrifuge`], [`capper`], [`sonicator`], [`sample_holder`]: reference drivers. Their
//!   operations are scheduled tasks returning a
//!   [`Submitted`](labsched_backend::Submitted) outcome; their status reads never wait for a busy
//!   channel and return a sentinel instead.
//! - [`lab`]: the [`Lab`] registry and the multi-device workflows built on it.
//!
//! With the `python` feature the crate also builds a Python extension module exposing the
//! scheduler, task handles, task groups and the emergency stop.
//!
//! ## Example
//!
//! ```
//! use labctrl_backend::*;
//! use labsched_backend::{EmergencyStop, SchedulerConfig, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::default(), EmergencyStop::new()).unwrap();
//! let mut lab = Lab::new(scheduler);
//! let rack = DeviceSpec::SampleHolder { hardware_id: "rack".into(), positions: 8 };
//! lab.connect_all(vec![rack]).unwrap();
//! assert_eq!(lab.sample_holder("rack").unwrap().next_free(), Some(1));
//! ```

pub mod capper;
pub mod centrifuge;
pub mod lab;
pub mod link;
#[cfg(feature = "python")]
pub mod python;
pub mod sample_holder;
pub mod sonicator;
pub mod transport;

pub use crate::capper::CapperDecapper;
pub use crate::centrifuge::Centrifuge;
pub use crate::lab::{DeviceSpec, Lab, LabDevice};
pub use crate::link::DeviceLink;
pub use crate::sample_holder::SampleHolder;
pub use crate::sonicator::ProbeSonicator;
pub use crate::transport::{normalize_channel, SimulatedTransport, TcpTransport, Transport};
