//! The closed set of hardware kinds and the capability interface every driver implements.

use std::fmt;
use std::sync::Arc;

use crate::error::TaskError;
use crate::lock::{ResourceGuard, ResourceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareKind {
    Hotplate,
    Addition,
    Centrifuge,
    RobotArm,
    SampleHolder,
    Sonicator,
    CapperDecapper,
    Electromagnet,
    Camera,
    Clamp,
    Fan,
    Sensor,
    CharacterizationInstrument,
    Controller,
    Other,
}

impl HardwareKind {
    /// Passive hardware (racks, holders) has no channel and never receives tasks.
    pub fn is_schedulable(&self) -> bool {
        !matches!(self, HardwareKind::SampleHolder)
    }
}

impl fmt::Display for HardwareKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                HardwareKind::Hotplate => "hotplate",
                HardwareKind::Addition => "addition",
                HardwareKind::Centrifuge => "centrifuge",
                HardwareKind::RobotArm => "robot_arm",
                HardwareKind::SampleHolder => "sample_holder",
                HardwareKind::Sonicator => "sonicator",
                HardwareKind::CapperDecapper => "capper_decapper",
                HardwareKind::Electromagnet => "electromagnet",
                HardwareKind::Camera => "camera",
                HardwareKind::Clamp => "clamp",
                HardwareKind::Fan => "fan",
                HardwareKind::Sensor => "sensor",
                HardwareKind::CharacterizationInstrument => "characterization_instrument",
                HardwareKind::Controller => "controller",
                HardwareKind::Other => "other",
            }
        )
    }
}

/// Capabilities the scheduler needs from a device driver.
pub trait Hardware: Send + Sync {
    /// Key of the device's sequential queue.
    fn hardware_id(&self) -> &str;

    fn kind(&self) -> HardwareKind;

    /// The lock guarding [`Hardware::channel_id`]. Distinct drivers never share one.
    fn lock(&self) -> Arc<ResourceLock>;

    fn channel_id(&self) -> &str;

    /// Sends one raw command over the channel and returns the reply payload.
    ///
    /// The guard proves the caller holds the channel lock.
    fn send_command(&self, guard: &ResourceGuard, command: &str) -> Result<String, TaskError>;

    /// Whether the driver's operations take part in task group rendezvous. The scheduler refuses
    /// grouped tasks on registered hardware answering `false`.
    fn supports_group_sync(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_holders_are_passive() {
        assert!(!HardwareKind::SampleHolder.is_schedulable());
        assert!(HardwareKind::Centrifuge.is_schedulable());
        assert!(HardwareKind::Other.is_schedulable());
        assert_eq!(HardwareKind::CapperDecapper.to_string(), "capper_decapper");
    }
}
