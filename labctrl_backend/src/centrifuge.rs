//! Centrifuge with a programmable run (speed and duration) and a polled speed readout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use labsched_backend::{
    HardwareKind, ScheduledTask, SchedulerError, Submitted, TaskContext, TaskError, TaskOptions,
    TaskScheduler,
};

use crate::link::DeviceLink;
use crate::transport::Transport;

/// How often a running centrifugation asks for its status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Extra time granted on top of the programmed run time before giving up on the `IDLE` status.
const RUN_TIME_MARGIN: Duration = Duration::from_secs(30);

pub struct Centrifuge {
    link: Arc<DeviceLink>,
    scheduler: TaskScheduler,
    max_rpm: u32,
}

impl Centrifuge {
    /// Connects to the centrifuge and registers it with `scheduler`.
    pub fn connect(
        hardware_id: &str,
        channel: &str,
        transport: Box<dyn Transport>,
        max_rpm: u32,
        scheduler: &TaskScheduler,
    ) -> Result<Self, SchedulerError> {
        let link = DeviceLink::connect(
            hardware_id,
            HardwareKind::Centrifuge,
            channel,
            transport,
            "IDN?",
            scheduler.config().retry_policy(),
            scheduler.estop().clone(),
        )?;
        scheduler.register_hardware(&*link)?;
        Ok(Self {
            link,
            scheduler: scheduler.clone(),
            max_rpm,
        })
    }

    pub fn hardware_id(&self) -> &str {
        self.link.hardware_id()
    }

    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Programs and starts a run, then follows it until the rotor is idle again.
    ///
    /// Completes with `true` once the run finished. The channel is free between two status polls,
    /// so [`Centrifuge::current_speed`] reads the rotor during the run. An emergency stop during the
    /// run stops the rotor and cancels the task.
    pub fn start_run(&self, run_time: Duration, rpm: u32, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let max_rpm = self.max_rpm;
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            if rpm > max_rpm {
                return Err(TaskError::Device(format!(
                    "speed {} rpm exceeds the rotor limit of {} rpm",
                    rpm, max_rpm
                )));
            }
            link.exchange(ctx.guard(), &format!("SPEED {}", rpm))?;
            link.exchange(ctx.guard(), &format!("TIME {}", run_time.as_secs()))?;
            link.exchange(ctx.guard(), "START")?;
            info!(hardware_id = ctx.hardware_id(), rpm, ?run_time, "centrifugation run started");

            let finished = ctx.poll_until_released(
                STATUS_POLL_INTERVAL,
                Some(run_time + RUN_TIME_MARGIN),
                || Ok(link.exchange(ctx.guard(), "STATUS?")? == "IDLE"),
            );
            if let Err(cause) = finished {
                // Never leave the rotor spinning, whatever ended the wait
                if let Err(err) = link.exchange_unchecked(ctx.guard(), "STOP") {
                    error!(hardware_id = ctx.hardware_id(), %cause, %err, "failed to stop the rotor");
                } else {
                    warn!(hardware_id = ctx.hardware_id(), %cause, "centrifugation run aborted");
                }
                return Err(cause);
            }
            info!(hardware_id = ctx.hardware_id(), "centrifugation run finished");
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    pub fn stop(&self, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            link.exchange(ctx.guard(), "STOP")?;
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    /// Current rotor speed in rpm, or -1 while a command holds the channel or the read failed.
    pub fn current_speed(&self) -> i32 {
        self.link
            .poll("SPEED?")
            .ok()
            .and_then(|reply| reply.parse().ok())
            .unwrap_or(-1)
    }
}
