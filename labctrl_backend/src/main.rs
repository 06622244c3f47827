use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use labctrl_backend::{DeviceSpec, Lab, SimulatedTransport};
use labsched_backend::{EmergencyStop, SchedulerConfig, SchedulerError, TaskOptions, TaskScheduler};

/// A centrifuge that spins for a few status polls after every `START`.
fn simulated_centrifuge() -> SimulatedTransport {
    let polls = Arc::new(AtomicUsize::new(usize::MAX));
    SimulatedTransport::new(move |line| {
        let reply = match line {
            "IDN?" => "OK SIM-CENTRIFUGE 1.0".to_string(),
            "START" => {
                polls.store(0, Ordering::SeqCst);
                "OK".to_string()
            }
            "STATUS?" => match polls.fetch_add(1, Ordering::SeqCst) {
                n if n < 5 => "OK RUNNING".to_string(),
                _ => "OK IDLE".to_string(),
            },
            "SPEED?" => match polls.load(Ordering::SeqCst) {
                n if n < 5 => "OK 1500".to_string(),
                _ => "OK 0".to_string(),
            },
            _ => "OK".to_string(),
        };
        Some(reply)
    })
    .with_latency(Duration::from_millis(5))
}

fn scripted(replies: &[(&str, &str)]) -> SimulatedTransport {
    let replies: HashMap<String, String> = replies
        .iter()
        .map(|(cmd, reply)| (cmd.to_string(), reply.to_string()))
        .collect();
    SimulatedTransport::scripted(replies).with_latency(Duration::from_millis(5))
}

fn main() -> Result<(), SchedulerError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SchedulerConfig::from_toml_str(
        r#"
        worker_threads = 4

        [retry]
        per_attempt_timeout_ms = 200
        "#,
    )?;
    let scheduler = TaskScheduler::new(config, EmergencyStop::global())?;
    let mut lab = Lab::new(scheduler);

    lab.connect_all(vec![
        DeviceSpec::Centrifuge {
            hardware_id: "centrifuge".into(),
            channel: "4".into(),
            transport: Box::new(simulated_centrifuge()),
            max_rpm: 4000,
        },
        DeviceSpec::CapperDecapper {
            hardware_id: "capper".into(),
            channel: "COM5".into(),
            transport: Box::new(scripted(&[
                ("IDN?", "OK SIM-CAPPER 2.1"),
                ("CLAMP CLOSE", "OK"),
                ("CLAMP OPEN", "OK"),
                ("DECAP", "OK"),
                ("RECAP", "OK"),
                ("CLAMP?", "OK 12"),
            ])),
        },
        DeviceSpec::Sonicator {
            hardware_id: "sonicator".into(),
            channel: "COM6".into(),
            transport: Box::new(scripted(&[
                ("IDN?", "OK SIM-UP200St"),
                ("PROBE DOWN", "OK"),
                ("PROBE UP", "OK"),
                ("AMPLITUDE 60", "OK"),
                ("US ON", "OK"),
                ("US OFF", "OK"),
                ("STATUS?", "OK 0W 0Ws 21.5C"),
            ])),
        },
        DeviceSpec::SampleHolder {
            hardware_id: "rack".into(),
            positions: 12,
        },
    ])?;
    info!(devices = ?lab.hardware_ids(), "lab ready");

    // Spin one sample while another one is sonicated
    let run = lab.centrifuge("centrifuge").map(|centrifuge| {
        centrifuge.start_run(
            Duration::from_secs(2),
            1500,
            TaskOptions {
                block: Some(false),
                ..TaskOptions::default()
            },
        )
    });
    if let Some(centrifuge) = lab.centrifuge("centrifuge") {
        info!(rpm = centrifuge.current_speed(), "centrifuge speed");
    }

    let sonicated = lab.decap_and_sonicate(
        "capper",
        "sonicator",
        Duration::from_millis(500),
        60,
        Duration::from_secs(5),
    );
    info!(sonicated, "decap and sonicate done");

    if let Some(run) = run {
        let outcome = run.wait();
        info!(state = %outcome.state(), "centrifugation done");
    }
    if let Some(sonicator) = lab.sonicator("sonicator") {
        info!(data = %sonicator.process_data(), "sonicator process data");
    }

    lab.scheduler().shutdown();
    Ok(())
}
