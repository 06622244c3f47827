//! Python bindings (`python` feature).
//!
//! The classes mirror the core types for orchestration scripts:
//!
//! ```python
//! from labctrl_backend import TaskScheduler, TaskGroup, EmergencyStop
//!
//! sched = TaskScheduler()
//! handle = sched.submit("centrifuge", run, args=(1200,), block=False, priority=0)
//! handle.wait()   # value, or False if the task failed or was cancelled
//! EmergencyStop().trip("operator")
//! ```
//!
//! Python callables run on the scheduler's worker threads and take the GIL only for the call
//! itself. Every blocking method releases the GIL while it waits.

use std::sync::Arc;
use std::time::Duration;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyTuple;

use labsched_backend::{
    EmergencyStop, ScheduledTask, SchedulerConfig, SchedulerError, Submitted, TaskContext,
    TaskError, TaskGroup, TaskHandle, TaskOptions, TaskOutcome, TaskScheduler,
};

const SIGNAL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

fn seconds(timeout: Option<f64>) -> PyResult<Option<Duration>> {
    timeout
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|_| PyValueError::new_err(format!("invalid timeout: {} s", secs)))
        })
        .transpose()
}

fn scheduler_err(err: SchedulerError) -> PyErr {
    PyRuntimeError::new_err(err.to_string())
}

/// Completed values pass through; anything else becomes `False`.
fn outcome_to_py(py: Python, outcome: &TaskOutcome<PyObject>) -> PyObject {
    match outcome {
        TaskOutcome::Completed(value) => value.clone_ref(py),
        _ => false.into_py(py),
    }
}

#[pyclass(name = "TaskScheduler")]
pub struct PyTaskScheduler {
    scheduler: TaskScheduler,
}

#[pymethods]
impl PyTaskScheduler {
    /// Starts a scheduler bound to the process-wide emergency stop, optionally configured from a
    /// TOML document.
    #[new]
    #[pyo3(signature = (config_toml = None))]
    fn new(config_toml: Option<&str>) -> PyResult<Self> {
        let config = match config_toml {
            Some(doc) => SchedulerConfig::from_toml_str(doc).map_err(scheduler_err)?,
            None => SchedulerConfig::default(),
        };
        let scheduler = TaskScheduler::new(config, EmergencyStop::global()).map_err(scheduler_err)?;
        Ok(Self { scheduler })
    }

    /// Runs `func(*args)` on `hardware_id`.
    ///
    /// Returns the function's result (or `False`) for blocking submissions and a `TaskHandle`
    /// otherwise. Exceptions raised by `func` fail the task.
    #[pyo3(signature = (
        hardware_id,
        func,
        args = None,
        block = None,
        is_sequential_task = true,
        priority = None,
        task_group_synchronization_object = None
    ))]
    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        py: Python,
        hardware_id: &str,
        func: PyObject,
        args: Option<&PyTuple>,
        block: Option<bool>,
        is_sequential_task: bool,
        priority: Option<i32>,
        task_group_synchronization_object: Option<PyRef<PyTaskGroup>>,
    ) -> PyResult<PyObject> {
        let args: Py<PyTuple> = args.unwrap_or_else(|| PyTuple::empty(py)).into();
        let options = TaskOptions {
            block,
            is_sequential_task,
            priority,
            group: task_group_synchronization_object.map(|g| g.group.clone()),
        };
        let task = ScheduledTask::new(hardware_id, move |_: &TaskContext| {
            Python::with_gil(|py| {
                func.call1(py, args.as_ref(py))
                    .map_err(|err| TaskError::Device(err.to_string()))
            })
        })
        .with_options(options);

        let scheduler = &self.scheduler;
        match py.allow_threads(|| scheduler.submit(task)) {
            Submitted::Finished(outcome) => Ok(outcome_to_py(py, &outcome)),
            Submitted::Queued(handle) => Ok(Py::new(py, PyTaskHandle { handle })?.into_py(py)),
        }
    }

    /// Cancels every pending task and returns how many there were.
    fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all()
    }

    fn pending_count(&self) -> usize {
        self.scheduler.pending_count()
    }

    fn running_count(&self) -> usize {
        self.scheduler.running_count()
    }

    /// Reserves `hardware_ids` for `group`; `False` if they did not all enter within `timeout`.
    #[pyo3(signature = (hardware_ids, group, timeout = None))]
    fn wait_for_hardware(
        &self,
        py: Python,
        hardware_ids: Vec<String>,
        group: PyRef<PyTaskGroup>,
        timeout: Option<f64>,
    ) -> PyResult<bool> {
        let timeout = seconds(timeout)?;
        let group = group.group.clone();
        let scheduler = &self.scheduler;
        Ok(py.allow_threads(|| {
            let ids: Vec<&str> = hardware_ids.iter().map(String::as_str).collect();
            scheduler.wait_for_hardware(&ids, &group, timeout).is_ok()
        }))
    }

    fn release_hardware(&self, hardware_ids: Vec<String>, group: PyRef<PyTaskGroup>) {
        let ids: Vec<&str> = hardware_ids.iter().map(String::as_str).collect();
        self.scheduler.release_hardware(&ids, &group.group);
    }

    fn finish_task_group(&self, group: PyRef<PyTaskGroup>) -> usize {
        self.scheduler.finish_task_group(&group.group)
    }

    fn shutdown(&self, py: Python) {
        let scheduler = &self.scheduler;
        py.allow_threads(|| scheduler.shutdown());
    }
}

#[pyclass(name = "TaskHandle")]
pub struct PyTaskHandle {
    handle: TaskHandle<PyObject>,
}

#[pymethods]
impl PyTaskHandle {
    fn id(&self) -> u64 {
        self.handle.id()
    }

    fn hardware_id(&self) -> &str {
        self.handle.hardware_id()
    }

    /// One of `pending`, `running`, `completed`, `failed`, `cancelled`.
    fn state(&self) -> String {
        self.handle.state().to_string()
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task and returns its value, or `False` if it failed, was cancelled or did not
    /// finish within `timeout` seconds.
    #[pyo3(signature = (timeout = None))]
    fn wait(&mut self, py: Python, timeout: Option<f64>) -> PyResult<PyObject> {
        let timeout = seconds(timeout)?;
        let start = std::time::Instant::now();
        loop {
            let slice = match timeout {
                Some(timeout) => {
                    let left = timeout.saturating_sub(start.elapsed());
                    SIGNAL_CHECK_INTERVAL.min(left)
                }
                None => SIGNAL_CHECK_INTERVAL,
            };
            let handle = &mut self.handle;
            let done = py.allow_threads(|| handle.wait_timeout(slice).is_some());
            if done {
                break;
            }
            py.check_signals()?;
            if timeout.map_or(false, |timeout| start.elapsed() >= timeout) {
                return Ok(false.into_py(py));
            }
        }
        Ok(self
            .handle
            .try_result()
            .map_or_else(|| false.into_py(py), |outcome| outcome_to_py(py, outcome)))
    }

    /// Error message of a failed task.
    fn error(&mut self) -> Option<String> {
        self.handle
            .try_result()
            .and_then(|outcome| outcome.error().map(|err| err.to_string()))
    }
}

#[pyclass(name = "TaskGroup")]
pub struct PyTaskGroup {
    group: Arc<TaskGroup>,
}

#[pymethods]
impl PyTaskGroup {
    #[new]
    #[pyo3(signature = (name = "task_group"))]
    fn new(name: &str) -> Self {
        Self {
            group: TaskGroup::new(name),
        }
    }

    fn name(&self) -> &str {
        self.group.name()
    }

    fn signal_ready(&self) {
        self.group.signal_ready();
    }

    #[pyo3(signature = (timeout = None))]
    fn wait_until_ready(&self, py: Python, timeout: Option<f64>) -> PyResult<bool> {
        let timeout = seconds(timeout)?;
        let group = self.group.clone();
        Ok(py.allow_threads(move || group.wait_until_ready(timeout)))
    }

    fn reset(&self) {
        self.group.reset();
    }

    fn is_ready(&self) -> bool {
        self.group.is_ready()
    }

    fn has_timed_out(&self) -> bool {
        self.group.has_timed_out()
    }
}

/// The process-wide emergency stop.
#[pyclass(name = "EmergencyStop")]
pub struct PyEmergencyStop {
    estop: Arc<EmergencyStop>,
}

#[pymethods]
impl PyEmergencyStop {
    #[new]
    fn new() -> Self {
        Self {
            estop: EmergencyStop::global(),
        }
    }

    #[pyo3(signature = (reason = "python"))]
    fn trip(&self, reason: &str) -> bool {
        self.estop.trip(reason)
    }

    fn reset(&self) -> bool {
        self.estop.reset()
    }

    fn is_tripped(&self) -> bool {
        self.estop.is_tripped()
    }
}

#[pymodule]
fn labctrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyTaskScheduler>()?;
    m.add_class::<PyTaskHandle>()?;
    m.add_class::<PyTaskGroup>()?;
    m.add_class::<PyEmergencyStop>()?;
    Ok(())
}
