//! Probe sonicator. The probe may only go down into an open container, so
//! [`ProbeSonicator::insert_probe`] waits on its task group before moving.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use labsched_backend::{
    HardwareKind, ScheduledTask, SchedulerError, Submitted, TaskContext, TaskError, TaskOptions,
    TaskScheduler,
};

use crate::link::DeviceLink;
use crate::transport::Transport;

pub struct ProbeSonicator {
    link: Arc<DeviceLink>,
    scheduler: TaskScheduler,
}

impl ProbeSonicator {
    pub fn connect(
        hardware_id: &str,
        channel: &str,
        transport: Box<dyn Transport>,
        scheduler: &TaskScheduler,
    ) -> Result<Self, SchedulerError> {
        let link = DeviceLink::connect(
            hardware_id,
            HardwareKind::Sonicator,
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
        })
    }

    pub fn hardware_id(&self) -> &str {
        self.link.hardware_id()
    }

    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Lowers the probe, after the task group (if any) signalled that the container is open.
    ///
    /// `group_timeout` bounds the wait for the signal; `None` waits until signalled or stopped.
    pub fn insert_probe(&self, group_timeout: Option<Duration>, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            if ctx.group().is_some() {
                ctx.wait_for_group(group_timeout)?;
            }
            link.exchange(ctx.guard(), "PROBE DOWN")?;
            info!(hardware_id = ctx.hardware_id(), "probe inserted");
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    /// Runs the ultrasound for `duration` at `amplitude` percent.
    ///
    /// The ultrasound is switched off on every exit path, including an emergency stop.
    pub fn sonicate(&self, duration: Duration, amplitude: u8, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            if !(1..=100).contains(&amplitude) {
                return Err(TaskError::Device(format!(
                    "amplitude must be within 1..=100 %, got {}",
                    amplitude
                )));
            }
            link.exchange(ctx.guard(), &format!("AMPLITUDE {}", amplitude))?;
            link.exchange(ctx.guard(), "US ON")?;
            info!(hardware_id = ctx.hardware_id(), amplitude, ?duration, "sonication started");
            let res = ctx.sleep(duration);
            if let Err(err) = link.exchange_unchecked(ctx.guard(), "US OFF") {
                warn!(hardware_id = ctx.hardware_id(), %err, "failed to switch ultrasound off");
                res?;
                return Err(err);
            }
            res?;
            info!(hardware_id = ctx.hardware_id(), "sonication finished");
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    pub fn retract_probe(&self, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            link.exchange(ctx.guard(), "PROBE UP")?;
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    /// Raw process data line (power, energy, temperature), or an empty string while busy.
    pub fn process_data(&self) -> String {
        self.link.poll("STATUS?").unwrap_or_default()
    }
}
