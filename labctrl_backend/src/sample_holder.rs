//! Passive rack holding containers at numbered positions. It has no channel and is never
//! scheduled; it is part of the lab so that workflows can address positions on it.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use labsched_backend::{Hardware, HardwareKind, ResourceGuard, ResourceLock, TaskError};

pub struct SampleHolder {
    hardware_id: String,
    positions: usize,
    occupied: Mutex<BTreeSet<usize>>,
    // Never taken; only there to satisfy the hardware interface
    lock: Arc<ResourceLock>,
}

impl SampleHolder {
    pub fn new(hardware_id: &str, positions: usize) -> Self {
        Self {
            hardware_id: hardware_id.to_string(),
            positions,
            occupied: Mutex::new(BTreeSet::new()),
            lock: ResourceLock::new("none"),
        }
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    /// Marks `position` (1-based) as holding a container. Returns `false` if it is out of range or
    /// already taken.
    pub fn place(&self, position: usize) -> bool {
        (1..=self.positions).contains(&position) && self.occupied.lock().insert(position)
    }

    pub fn remove(&self, position: usize) -> bool {
        self.occupied.lock().remove(&position)
    }

    /// Lowest free position, if any.
    pub fn next_free(&self) -> Option<usize> {
        let occupied = self.occupied.lock();
        (1..=self.positions).find(|p| !occupied.contains(p))
    }
}

impl Hardware for SampleHolder {
    fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    fn kind(&self) -> HardwareKind {
        HardwareKind::SampleHolder
    }

    fn lock(&self) -> Arc<ResourceLock> {
        self.lock.clone()
    }

    fn channel_id(&self) -> &str {
        self.lock.channel()
    }

    fn send_command(&self, _guard: &ResourceGuard, command: &str) -> Result<String, TaskError> {
        Err(TaskError::Device(format!(
            "{} is passive and cannot execute {:?}",
            self.hardware_id, command
        )))
    }
}
