//! Capper/decapper station. Decapping is the first half of a two-device rendezvous: once the cap
//! is fully off, the decap task signals its task group so a probe may be lowered into the vial.

use std::sync::Arc;

use tracing::info;

use labsched_backend::{
    HardwareKind, ScheduledTask, SchedulerError, Submitted, TaskContext, TaskOptions,
    TaskScheduler,
};

use crate::link::DeviceLink;
use crate::transport::Transport;

pub struct CapperDecapper {
    link: Arc<DeviceLink>,
    scheduler: TaskScheduler,
}

impl CapperDecapper {
    pub fn connect(
        hardware_id: &str,
        channel: &str,
        transport: Box<dyn Transport>,
        scheduler: &TaskScheduler,
    ) -> Result<Self, SchedulerError> {
        let link = DeviceLink::connect(
            hardware_id,
            HardwareKind::CapperDecapper,
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

    /// Clamps the container and removes its cap.
    ///
    /// If `options` carries a task group it is signalled after the cap is off. The task fails if the
    /// waiting member already gave up.
    pub fn decap(&self, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            link.exchange(ctx.guard(), "CLAMP CLOSE")?;
            link.exchange(ctx.guard(), "DECAP")?;
            info!(hardware_id = ctx.hardware_id(), "container decapped");
            if ctx.group().is_some() {
                ctx.signal_group()?;
            }
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    /// Screws the cap back on and releases the container.
    pub fn recap(&self, options: TaskOptions) -> Submitted<bool> {
        let link = self.link.clone();
        let task = ScheduledTask::new(self.hardware_id(), move |ctx: &TaskContext| {
            link.exchange(ctx.guard(), "RECAP")?;
            link.exchange(ctx.guard(), "CLAMP OPEN")?;
            info!(hardware_id = ctx.hardware_id(), "container recapped");
            Ok(true)
        })
        .with_options(options);
        self.scheduler.submit(task)
    }

    /// Clamp opening in mm, or -1 while busy.
    pub fn clamp_position(&self) -> i32 {
        self.link
            .poll("CLAMP?")
            .ok()
            .and_then(|reply| reply.parse().ok())
            .unwrap_or(-1)
    }
}
