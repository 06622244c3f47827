//! The lock-guarded, retrying command channel every driver talks through.
//!
//! A [`DeviceLink`] owns one [`Transport`] and the [`ResourceLock`] guarding it. It speaks the
//! reply protocol shared by the reference instruments:
//!
//! - `OK` or `OK <payload>`: success, the payload (possibly empty) is returned;
//! - `ERR <message>` or any other line: [`TaskError::Protocol`], not retried;
//! - no line within the per-attempt timeout: a transient failure, retried by
//!   [`call_with_retry`] and reported as [`TaskError::CommunicationTimeout`] once exhausted.
//!
//! Three access paths exist. Scheduled operations already hold the channel through their
//! [`TaskContext`](labsched_backend::TaskContext) and use [`DeviceLink::exchange`]. Status polls
//! use [`DeviceLink::poll`], which never waits for the channel. Ad-hoc queries use
//! [`DeviceLink::query`], which waits for it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use labsched_backend::{
    call_with_retry, EmergencyStop, Hardware, HardwareKind, ResourceGuard, ResourceLock,
    RetryPolicy, SchedulerError, TaskError,
};

use crate::transport::{normalize_channel, Transport};

pub struct DeviceLink {
    hardware_id: String,
    kind: HardwareKind,
    channel: String,
    lock: Arc<ResourceLock>,
    transport: Mutex<Box<dyn Transport>>,
    retry: RetryPolicy,
    estop: Arc<EmergencyStop>,
    group_sync: bool,
}

impl DeviceLink {
    /// Opens the link and performs `handshake`, failing hard if the device does not answer.
    ///
    /// # Parameters
    ///
    /// * `hardware_id`: id the device's tasks are scheduled under.
    /// * `kind`: what the device is.
    /// * `channel`: channel address, normalised with [`normalize_channel`].
    /// * `transport`: the already opened byte transport.
    /// * `handshake`: a harmless command the device must acknowledge with `OK`.
    /// * `retry`: attempts and per-attempt timeout, for the handshake and every later exchange.
    /// * `estop`: the stop every exchange obeys.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Connect`] when the handshake fails, after at most `retry.max_attempts`
    /// tries; [`SchedulerError::Config`] for an unusable channel address.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        hardware_id: &str,
        kind: HardwareKind,
        channel: &str,
        transport: Box<dyn Transport>,
        handshake: &str,
        retry: RetryPolicy,
        estop: Arc<EmergencyStop>,
    ) -> Result<Arc<Self>, SchedulerError> {
        if hardware_id.is_empty() {
            return Err(SchedulerError::EmptyHardwareId);
        }
        let channel = normalize_channel(channel)?;
        let link = Arc::new(Self {
            hardware_id: hardware_id.to_string(),
            kind,
            lock: ResourceLock::new(channel.clone()),
            channel,
            transport: Mutex::new(transport),
            retry,
            estop,
            group_sync: matches!(kind, HardwareKind::CapperDecapper | HardwareKind::Sonicator),
        });
        match link.query(handshake) {
            Ok(reply) => {
                info!(hardware_id, channel = %link.channel, reply = %reply, "device connected");
                Ok(link)
            }
            Err(source) => {
                error!(hardware_id, channel = %link.channel, %source, "device not reachable");
                Err(SchedulerError::Connect {
                    hardware_id: hardware_id.to_string(),
                    channel: link.channel.clone(),
                    source,
                })
            }
        }
    }

    pub fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn estop(&self) -> &Arc<EmergencyStop> {
        &self.estop
    }

    /// Sends `command` and returns the reply payload, retrying per the link's policy.
    ///
    /// `guard` must belong to this link's lock.
    pub fn exchange(&self, guard: &ResourceGuard, command: &str) -> Result<String, TaskError> {
        self.check_guard(guard)?;
        call_with_retry(&self.retry, &self.channel, &self.estop, |attempt| {
            self.round_trip(command, attempt.timeout)
        })
    }

    /// One attempt that ignores the emergency stop.
    ///
    /// Only for commands that make the device safe (motor off, ultrasound off) and must still go out
    /// when the stop has been tripped.
    pub fn exchange_unchecked(
        &self,
        guard: &ResourceGuard,
        command: &str,
    ) -> Result<String, TaskError> {
        self.check_guard(guard)?;
        self.round_trip(command, self.retry.per_attempt_timeout)
    }

    /// Status read that gives up immediately with [`TaskError::ChannelUnavailable`] when a command
    /// is in progress.
    pub fn poll(&self, command: &str) -> Result<String, TaskError> {
        let guard = self.lock.acquire(false, &self.estop)?;
        self.exchange(&guard, command)
    }

    /// Waits for the channel, then exchanges `command`.
    pub fn query(&self, command: &str) -> Result<String, TaskError> {
        let guard = self.lock.acquire(true, &self.estop)?;
        self.exchange(&guard, command)
    }

    fn check_guard(&self, guard: &ResourceGuard) -> Result<(), TaskError> {
        if guard.guards(&self.lock) {
            Ok(())
        } else {
            Err(TaskError::InvalidTask(format!(
                "guard for {} does not hold {}",
                guard.channel(),
                self.channel
            )))
        }
    }

    fn round_trip(&self, command: &str, timeout: Duration) -> Result<String, TaskError> {
        let mut transport = self.transport.lock();
        transport.write_line(command)?;
        match transport.read_line(timeout)? {
            None => Err(TaskError::CommunicationTimeout {
                channel: self.channel.clone(),
                attempts: 1,
            }),
            Some(reply) => {
                debug!(hardware_id = %self.hardware_id, command, reply = %reply, "exchange");
                parse_reply(&self.channel, &reply)
            }
        }
    }
}

fn parse_reply(channel: &str, reply: &str) -> Result<String, TaskError> {
    let reply = reply.trim();
    if reply == "OK" {
        return Ok(String::new());
    }
    match reply.strip_prefix("OK ") {
        Some(payload) => Ok(payload.trim().to_string()),
        None => {
            error!(channel, reply, "device reported an error");
            Err(TaskError::Protocol {
                channel: channel.to_string(),
                reply: reply.to_string(),
            })
        }
    }
}

impl Hardware for DeviceLink {
    fn hardware_id(&self) -> &str {
        &self.hardware_id
    }

    fn kind(&self) -> HardwareKind {
        self.kind
    }

    fn lock(&self) -> Arc<ResourceLock> {
        self.lock.clone()
    }

    fn channel_id(&self) -> &str {
        &self.channel
    }

    fn send_command(&self, guard: &ResourceGuard, command: &str) -> Result<String, TaskError> {
        self.exchange(guard, command)
    }

    fn supports_group_sync(&self) -> bool {
        self.group_sync
    }
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("hardware_id", &self.hardware_id)
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::SimulatedTransport;
    use maplit::hashmap;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            per_attempt_timeout: Duration::from_millis(20),
            backoff: Duration::from_millis(1),
        }
    }

    fn fan(estop: Arc<EmergencyStop>) -> Arc<DeviceLink> {
        let transport = SimulatedTransport::scripted(hashmap! {
            "IDN?".to_string() => "OK fan v2".to_string(),
            "RPM?".to_string() => "OK 800".to_string(),
            "BOOM".to_string() => "ERR 17 overcurrent".to_string(),
        });
        DeviceLink::connect("fan", HardwareKind::Fan, "5", Box::new(transport), "IDN?", policy(), estop)
            .unwrap()
    }

    #[test]
    fn replies() {
        assert_eq!(parse_reply("COM1", "OK"), Ok(String::new()));
        assert_eq!(parse_reply("COM1", "OK  1200 \r"), Ok("1200".to_string()));
        assert_eq!(
            parse_reply("COM1", "ERR 4"),
            Err(TaskError::Protocol {
                channel: "COM1".into(),
                reply: "ERR 4".into()
            })
        );
        assert!(parse_reply("COM1", "OKAY").is_err());
    }

    #[test]
    fn connect_normalises_channel() {
        let link = fan(EmergencyStop::new());
        assert_eq!(link.channel(), "COM5");
        assert_eq!(link.channel_id(), "COM5");
        assert_eq!(link.query("RPM?"), Ok("800".to_string()));
        assert!(matches!(link.query("BOOM"), Err(TaskError::Protocol { .. })));
    }

    #[test]
    fn silent_device_fails_construction() {
        let transport = SimulatedTransport::silent();
        let log = transport.sent_log();
        let res = DeviceLink::connect(
            "centrifuge",
            HardwareKind::Centrifuge,
            "COM4",
            Box::new(transport),
            "IDN?",
            policy(),
            EmergencyStop::new(),
        );
        match res {
            Err(SchedulerError::Connect { hardware_id, channel, source }) => {
                assert_eq!(hardware_id, "centrifuge");
                assert_eq!(channel, "COM4");
                assert_eq!(
                    source,
                    TaskError::CommunicationTimeout {
                        channel: "COM4".into(),
                        attempts: 3
                    }
                );
            }
            other => panic!("expected a connect error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn poll_never_waits_for_a_busy_channel() {
        let link = fan(EmergencyStop::new());
        let guard = link.lock().try_acquire().unwrap();
        assert_eq!(
            link.poll("RPM?"),
            Err(TaskError::ChannelUnavailable {
                channel: "COM5".into()
            })
        );
        assert_eq!(link.exchange(&guard, "RPM?"), Ok("800".to_string()));
        drop(guard);
        assert_eq!(link.poll("RPM?"), Ok("800".to_string()));
    }

    #[test]
    fn foreign_guard_is_rejected() {
        let link = fan(EmergencyStop::new());
        let other = ResourceLock::new("COM9");
        let guard = other.try_acquire().unwrap();
        assert!(matches!(
            link.exchange(&guard, "RPM?"),
            Err(TaskError::InvalidTask(_))
        ));
    }

    #[test]
    fn stop_blocks_all_but_safety_commands() {
        let estop = EmergencyStop::new();
        let link = fan(estop.clone());
        estop.trip("test");
        assert_eq!(link.query("RPM?"), Err(TaskError::EmergencyStopped));
        let guard = link.lock().try_acquire().unwrap();
        assert_eq!(link.exchange(&guard, "RPM?"), Err(TaskError::EmergencyStopped));
        assert_eq!(link.exchange_unchecked(&guard, "RPM?"), Ok("800".to_string()));
    }
}
