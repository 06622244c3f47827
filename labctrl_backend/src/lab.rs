//! The [`Lab`]: every connected device of a setup, the scheduler they share and the multi-device
//! workflows built on top of them.
//!
//! Devices are kept in an [`IndexMap`] so that listings follow the order the devices were declared
//! in. [`Lab::connect_all`] opens all declared devices concurrently with [`rayon`] and stops at the
//! first device that cannot be reached.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use rayon::prelude::*;
use tracing::{error, info, warn};

use labsched_backend::{
    Hardware, HardwareKind, SchedulerError, TaskGroup, TaskOptions, TaskScheduler,
};

use crate::capper::CapperDecapper;
use crate::centrifuge::Centrifuge;
use crate::sample_holder::SampleHolder;
use crate::sonicator::ProbeSonicator;
use crate::transport::Transport;

/// How to reach one device of the lab.
pub enum DeviceSpec {
    Centrifuge {
        hardware_id: String,
        channel: String,
        transport: Box<dyn Transport>,
        max_rpm: u32,
    },
    CapperDecapper {
        hardware_id: String,
        channel: String,
        transport: Box<dyn Transport>,
    },
    Sonicator {
        hardware_id: String,
        channel: String,
        transport: Box<dyn Transport>,
    },
    SampleHolder {
        hardware_id: String,
        positions: usize,
    },
}

impl DeviceSpec {
    pub fn hardware_id(&self) -> &str {
        match self {
            DeviceSpec::Centrifuge { hardware_id, .. }
            | DeviceSpec::CapperDecapper { hardware_id, .. }
            | DeviceSpec::Sonicator { hardware_id, .. }
            | DeviceSpec::SampleHolder { hardware_id, .. } => hardware_id,
        }
    }

    fn connect(self, scheduler: &TaskScheduler) -> Result<LabDevice, SchedulerError> {
        Ok(match self {
            DeviceSpec::Centrifuge {
                hardware_id,
                channel,
                transport,
                max_rpm,
            } => LabDevice::Centrifuge(Centrifuge::connect(
                &hardware_id,
                &channel,
                transport,
                max_rpm,
                scheduler,
            )?),
            DeviceSpec::CapperDecapper {
                hardware_id,
                channel,
                transport,
            } => LabDevice::CapperDecapper(CapperDecapper::connect(
                &hardware_id,
                &channel,
                transport,
                scheduler,
            )?),
            DeviceSpec::Sonicator {
                hardware_id,
                channel,
                transport,
            } => LabDevice::Sonicator(ProbeSonicator::connect(
                &hardware_id,
                &channel,
                transport,
                scheduler,
            )?),
            DeviceSpec::SampleHolder {
                hardware_id,
                positions,
            } => {
                if hardware_id.is_empty() {
                    return Err(SchedulerError::EmptyHardwareId);
                }
                LabDevice::SampleHolder(SampleHolder::new(&hardware_id, positions))
            }
        })
    }
}

/// A connected device.
pub enum LabDevice {
    Centrifuge(Centrifuge),
    CapperDecapper(CapperDecapper),
    Sonicator(ProbeSonicator),
    SampleHolder(SampleHolder),
}

impl LabDevice {
    pub fn hardware_id(&self) -> &str {
        match self {
            LabDevice::Centrifuge(dev) => dev.hardware_id(),
            LabDevice::CapperDecapper(dev) => dev.hardware_id(),
            LabDevice::Sonicator(dev) => dev.hardware_id(),
            LabDevice::SampleHolder(dev) => Hardware::hardware_id(dev),
        }
    }

    pub fn kind(&self) -> HardwareKind {
        match self {
            LabDevice::Centrifuge(_) => HardwareKind::Centrifuge,
            LabDevice::CapperDecapper(_) => HardwareKind::CapperDecapper,
            LabDevice::Sonicator(_) => HardwareKind::Sonicator,
            LabDevice::SampleHolder(_) => HardwareKind::SampleHolder,
        }
    }
}

pub struct Lab {
    devices: IndexMap<String, LabDevice>,
    scheduler: TaskScheduler,
}

impl Lab {
    pub fn new(scheduler: TaskScheduler) -> Self {
        Self {
            devices: IndexMap::new(),
            scheduler,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Connects every device in `specs` and adds them to the lab, in the order given.
    ///
    /// The devices are opened in parallel. Nothing is added unless all of them connect.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::DuplicateHardware`] if an id appears twice or is already part of the lab;
    ///   no device is opened in that case.
    /// - The first construction error of any device, typically [`SchedulerError::Connect`].
    pub fn connect_all(&mut self, specs: Vec<DeviceSpec>) -> Result<(), SchedulerError> {
        let mut seen = HashSet::new();
        for spec in &specs {
            let hardware_id = spec.hardware_id();
            if self.devices.contains_key(hardware_id) || !seen.insert(hardware_id.to_string()) {
                return Err(SchedulerError::DuplicateHardware(hardware_id.to_string()));
            }
        }

        let scheduler = &self.scheduler;
        let connected: Vec<LabDevice> = specs
            .into_par_iter()
            .map(|spec| spec.connect(scheduler))
            .collect::<Result<Vec<_>, SchedulerError>>()
            .map_err(|err| {
                error!(%err, "lab setup failed");
                err
            })?;

        for device in connected {
            info!(hardware_id = device.hardware_id(), kind = %device.kind(), "device added to lab");
            self.devices.insert(device.hardware_id().to_string(), device);
        }
        Ok(())
    }

    pub fn device(&self, hardware_id: &str) -> Option<&LabDevice> {
        self.devices.get(hardware_id)
    }

    pub fn centrifuge(&self, hardware_id: &str) -> Option<&Centrifuge> {
        match self.devices.get(hardware_id) {
            Some(LabDevice::Centrifuge(dev)) => Some(dev),
            _ => None,
        }
    }

    pub fn capper(&self, hardware_id: &str) -> Option<&CapperDecapper> {
        match self.devices.get(hardware_id) {
            Some(LabDevice::CapperDecapper(dev)) => Some(dev),
            _ => None,
        }
    }

    pub fn sonicator(&self, hardware_id: &str) -> Option<&ProbeSonicator> {
        match self.devices.get(hardware_id) {
            Some(LabDevice::Sonicator(dev)) => Some(dev),
            _ => None,
        }
    }

    pub fn sample_holder(&self, hardware_id: &str) -> Option<&SampleHolder> {
        match self.devices.get(hardware_id) {
            Some(LabDevice::SampleHolder(dev)) => Some(dev),
            _ => None,
        }
    }

    /// Device ids in declaration order.
    pub fn hardware_ids(&self) -> Vec<&str> {
        self.devices.keys().map(String::as_str).collect()
    }

    /// Trips the scheduler's emergency stop. Returns `false` if it was already tripped.
    pub fn emergency_stop(&self, reason: &str) -> bool {
        self.scheduler.estop().trip(reason)
    }

    pub fn reset_emergency_stop(&self) -> bool {
        self.scheduler.estop().reset()
    }

    /// Opens a container on `capper_id` and sonicates it with `sonicator_id`.
    ///
    /// Both devices are reserved for the workflow. The probe only goes down after the decap task
    /// signalled that the cap is off; if either side fails or the rendezvous times out after
    /// `sync_timeout`, whatever already happened is undone (probe retracted, container recapped).
    ///
    /// Returns `false` on any failure, following the sentinel convention of device operations.
    pub fn decap_and_sonicate(
        &self,
        capper_id: &str,
        sonicator_id: &str,
        duration: Duration,
        amplitude: u8,
        sync_timeout: Duration,
    ) -> bool {
        let (Some(capper), Some(sonicator)) = (self.capper(capper_id), self.sonicator(sonicator_id))
        else {
            error!(capper_id, sonicator_id, "decap_and_sonicate needs a capper and a sonicator");
            return false;
        };

        let group = TaskGroup::new(format!("{}+{}", capper_id, sonicator_id));
        if let Err(err) =
            self.scheduler
                .wait_for_hardware(&[capper_id, sonicator_id], &group, Some(sync_timeout))
        {
            warn!(group = %group.name(), %err, "devices did not enter the task group");
            self.scheduler.finish_task_group(&group);
            return false;
        }

        let in_group = |block: bool| TaskOptions {
            block: Some(block),
            group: Some(Arc::clone(&group)),
            ..TaskOptions::default()
        };
        let probe = sonicator.insert_probe(Some(sync_timeout), in_group(false));
        let decapped = capper.decap(in_group(false)).wait();
        let probe_in = probe.wait();

        let mut success = decapped.is_completed() && probe_in.is_completed();
        if success {
            let sonicated = sonicator.sonicate(duration, amplitude, in_group(true)).wait();
            success = sonicated.is_completed();
        } else {
            warn!(
                group = %group.name(),
                decap = %decapped.state(),
                probe = %probe_in.state(),
                "rendezvous failed, undoing"
            );
        }
        if probe_in.is_completed() {
            success &= sonicator.retract_probe(in_group(true)).wait().is_completed();
        }
        if decapped.is_completed() {
            success &= capper.recap(in_group(true)).wait().is_completed();
        }

        self.scheduler.finish_task_group(&group);
        info!(group = %group.name(), success, "decap_and_sonicate finished");
        success
    }
}
