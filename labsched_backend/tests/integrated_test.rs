use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use maplit::hashmap;
use parking_lot::Mutex;

use labsched_backend::*;

fn scheduler_with(workers: usize, estop: Arc<EmergencyStop>) -> TaskScheduler {
    let config = SchedulerConfig {
        worker_threads: workers,
        ..SchedulerConfig::default()
    };
    TaskScheduler::new(config, estop).unwrap()
}

fn sleeper(hardware_id: &str, ms: u64) -> ScheduledTask<()> {
    ScheduledTask::new(hardware_id, move |ctx: &TaskContext| ctx.sleep(Duration::from_millis(ms)))
}

#[test]
fn sequential_tasks_are_serialized() {
    let scheduler = scheduler_with(8, EmergencyStop::new());
    let start = Instant::now();
    let handles: Vec<_> = (0..50)
        .map(|_| scheduler.submit(sleeper("pumpA", 10).block(false)))
        .collect();
    for handle in handles {
        assert_eq!(handle.wait(), TaskOutcome::Completed(()));
    }
    assert!(start.elapsed() >= Duration::from_millis(500));
}

#[test]
fn independent_hardware_runs_in_parallel() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), EmergencyStop::new()).unwrap();
    let start = Instant::now();
    let handles: Vec<_> = (0..50)
        .map(|i| {
            scheduler.submit(
                sleeper(&format!("pump{}", i), 10)
                    .sequential(false)
                    .block(false),
            )
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.wait(), TaskOutcome::Completed(()));
    }
    // Serialized this would take at least 500ms
    assert!(start.elapsed() < Duration::from_millis(400));
}

#[test]
fn long_runs_never_delay_other_hardware() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default(), EmergencyStop::new()).unwrap();
    let workers = scheduler.config().worker_threads;
    let runs: Vec<_> = (0..workers)
        .map(|i| scheduler.submit(sleeper(&format!("centrifuge{}", i), 500).block(false)))
        .collect();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(scheduler.running_count(), workers);

    let start = Instant::now();
    let outcome = scheduler
        .submit(ScheduledTask::new("pumpA", |_: &TaskContext| Ok("dosed")))
        .wait();
    assert_eq!(outcome, TaskOutcome::Completed("dosed"));
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(scheduler.worker_count(), workers + 1);

    for run in runs {
        assert_eq!(run.wait(), TaskOutcome::Completed(()));
    }
}

#[test]
fn rendezvous_completes_with_a_single_worker() {
    let scheduler = scheduler_with(1, EmergencyStop::new());
    let group = TaskGroup::new("decap+probe");

    // Submitted first, the waiter takes the only initial worker
    let waiter = scheduler.submit(
        ScheduledTask::new("sonicator", |ctx: &TaskContext| {
            ctx.wait_for_group(Some(Duration::from_secs(1)))?;
            Ok("probe down")
        })
        .group(group.clone())
        .block(false),
    );
    let signaller = scheduler.submit(
        ScheduledTask::new("capper", |ctx: &TaskContext| {
            ctx.sleep(Duration::from_millis(100))?;
            ctx.signal_group()?;
            Ok("decapped")
        })
        .group(group.clone())
        .block(false),
    );
    assert_eq!(signaller.wait(), TaskOutcome::Completed("decapped"));
    assert_eq!(waiter.wait(), TaskOutcome::Completed("probe down"));
    assert!(!group.has_timed_out());
}

#[test]
fn sequential_order_and_no_overlap_per_hardware() {
    let scheduler = scheduler_with(16, EmergencyStop::new());
    let log: Arc<Mutex<HashMap<String, Vec<usize>>>> = Arc::new(Mutex::new(HashMap::new()));
    let active = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

    let mut handles = Vec::new();
    for n in 0..30 {
        for hw in ["pumpA", "pumpB", "valve"] {
            let log = log.clone();
            let active = active.clone();
            let task = ScheduledTask::new(hw, move |ctx: &TaskContext| {
                {
                    let mut active = active.lock();
                    let count = active.entry(ctx.hardware_id().to_string()).or_insert(0);
                    *count += 1;
                    assert_eq!(*count, 1, "two tasks of one hardware overlapped");
                }
                log.lock().entry(ctx.hardware_id().to_string()).or_default().push(n);
                thread::sleep(Duration::from_millis(1));
                *active.lock().get_mut(ctx.hardware_id()).unwrap() -= 1;
                Ok(())
            })
            // Priorities must not reorder a sequential queue
            .priority((n % 7) as i32)
            .block(false);
            handles.push(scheduler.submit(task));
        }
    }
    for handle in handles {
        assert_eq!(handle.wait(), TaskOutcome::Completed(()));
    }
    let expected: Vec<usize> = (0..30).collect();
    let log = log.lock();
    for hw in ["pumpA", "pumpB", "valve"] {
        assert_eq!(log[hw], expected);
    }
}

#[test]
fn previous_sequential_task_is_terminal_before_next_starts() {
    let scheduler = scheduler_with(4, EmergencyStop::new());
    let first = scheduler
        .submit(sleeper("arm", 20).block(false))
        .into_handle()
        .unwrap();
    let mut second = scheduler
        .submit(sleeper("arm", 1).block(false))
        .into_handle()
        .unwrap();

    assert!(second.wait_timeout(Duration::from_secs(5)).is_some());
    assert_eq!(first.state(), TaskState::Completed);
    assert!(first.finished_at().unwrap() <= second.started_at().unwrap());
}

#[test]
fn stopped_scheduler_touches_no_hardware() {
    let estop = EmergencyStop::new();
    let scheduler = scheduler_with(4, estop.clone());
    let io = Arc::new(AtomicUsize::new(0));
    estop.trip("estop button");

    let mut per_hardware = hashmap! {
        "pumpA" => 0,
        "centrifuge" => 0,
        "sonicator" => 0,
    };
    let ids: Vec<&str> = per_hardware.keys().copied().collect();
    for i in 0..120 {
        let hw = ids[i % ids.len()];
        let io_ = io.clone();
        let start = Instant::now();
        let task = ScheduledTask::new(hw, move |_: &TaskContext| {
            io_.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        })
        .block(i % 2 == 0);
        let outcome = scheduler.submit(task).wait();
        assert!(start.elapsed() < scheduler.config().estop_poll_interval());
        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert!(!outcome.value_or_sentinel());
        *per_hardware.get_mut(hw).unwrap() += 1;
    }
    assert_eq!(io.load(Ordering::SeqCst), 0);
    assert!(per_hardware.values().all(|count| *count == 40));
}

#[test]
fn rendezvous_has_no_lost_wakeups() {
    let group = TaskGroup::new("rendezvous");
    for _ in 0..1000 {
        group.reset();
        let waiter = {
            let group = group.clone();
            thread::spawn(move || group.wait_until_ready(Some(Duration::from_secs(1))))
        };
        let signaller = {
            let group = group.clone();
            thread::spawn(move || group.signal_ready())
        };
        signaller.join().unwrap();
        assert!(waiter.join().unwrap());
    }
}

#[test]
fn blocking_and_handle_paths_agree() {
    let scheduler = scheduler_with(4, EmergencyStop::new());
    let read_speed = scheduler.scheduled_task("centrifuge", |_: &TaskContext, rpm: i32| {
        if rpm < 0 {
            Err(TaskError::Device(format!("invalid speed {}", rpm)))
        } else {
            Ok(rpm + 1)
        }
    });
    for rpm in [0, 1200, -5] {
        let blocking = read_speed.call(
            rpm,
            TaskOptions {
                block: Some(true),
                ..TaskOptions::default()
            },
        );
        assert!(!blocking.is_queued());
        let queued = read_speed.call(
            rpm,
            TaskOptions {
                block: Some(false),
                ..TaskOptions::default()
            },
        );
        assert!(queued.is_queued());
        assert_eq!(blocking.wait(), queued.wait());
    }
}

#[test]
fn grouped_tasks_rendezvous() {
    let scheduler = scheduler_with(4, EmergencyStop::new());
    let group = TaskGroup::new("decap+sonicate");

    let start = Instant::now();
    let decap = scheduler.submit(
        ScheduledTask::new("capper", |ctx: &TaskContext| {
            ctx.sleep(Duration::from_millis(100))?;
            ctx.signal_group()
        })
        .group(group.clone())
        .block(false),
    );
    let insert_probe = scheduler.submit(
        ScheduledTask::new("sonicator", move |ctx: &TaskContext| {
            let ready = ctx
                .group()
                .map_or(false, |g| g.wait_until_ready(Some(Duration::from_secs(1))));
            Ok((ready, start.elapsed()))
        })
        .group(group.clone())
        .block(false),
    );

    let (ready, waited) = insert_probe.wait().ok().unwrap();
    assert!(ready);
    assert!(waited >= Duration::from_millis(90));
    assert_eq!(decap.wait(), TaskOutcome::Completed(()));
}

#[test]
fn failed_rendezvous_fails_both_members() {
    let scheduler = scheduler_with(4, EmergencyStop::new());
    let group = TaskGroup::new("slow-decap");

    let decap = scheduler.submit(
        ScheduledTask::new("capper", |ctx: &TaskContext| {
            ctx.sleep(Duration::from_millis(150))?;
            ctx.signal_group()
        })
        .group(group.clone())
        .block(false),
    );
    let insert_probe = scheduler.submit(
        ScheduledTask::new("sonicator", |ctx: &TaskContext| {
            ctx.wait_for_group(Some(Duration::from_millis(30)))
        })
        .group(group.clone())
        .block(false),
    );
    assert!(matches!(
        insert_probe.wait(),
        TaskOutcome::Failed(TaskError::GroupSyncTimeout { .. })
    ));
    assert!(matches!(
        decap.wait(),
        TaskOutcome::Failed(TaskError::GroupSyncTimeout { .. })
    ));
}

#[test]
fn trip_is_idempotent_for_schedulers() {
    let estop = EmergencyStop::new();
    let scheduler = scheduler_with(1, estop.clone());
    let gate = TaskGroup::new("gate");
    let gate_ = gate.clone();
    let running = scheduler.submit(
        ScheduledTask::new("hotplate", move |_: &TaskContext| {
            Ok(gate_.wait_until_ready(Some(Duration::from_secs(5))))
        })
        .block(false),
    );
    let queued: Vec<_> = (0..5)
        .map(|_| scheduler.submit(sleeper("hotplate", 1).block(false)))
        .collect();
    thread::sleep(Duration::from_millis(20));

    assert!(estop.trip("first"));
    assert!(!estop.trip("second"));
    assert_eq!(estop.state(), EstopState::Stopped);
    for handle in queued {
        assert_eq!(handle.wait(), TaskOutcome::Cancelled);
    }
    assert_eq!(scheduler.cancel_all(), 0);

    // A running task is left alone and finishes on its own terms
    gate.signal_ready();
    assert_eq!(running.wait(), TaskOutcome::Completed(true));

    assert!(estop.reset());
    assert_eq!(
        scheduler.submit(sleeper("hotplate", 1)).wait(),
        TaskOutcome::Completed(())
    );
}

#[test]
fn config_from_toml_drives_defaults() {
    let config = SchedulerConfig::from_toml_str(
        r#"
        default_blocking = false
        default_priority = 2
        worker_threads = 2
        "#,
    )
    .unwrap();
    let scheduler = TaskScheduler::new(config, EmergencyStop::new()).unwrap();
    let submitted = scheduler.submit(ScheduledTask::new("fan", |_: &TaskContext| Ok("spinning")));
    assert!(submitted.is_queued());
    assert_eq!(submitted.wait(), TaskOutcome::Completed("spinning"));
}
