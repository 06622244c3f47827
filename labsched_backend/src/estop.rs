//! Process-wide emergency stop.
//!
//! An [`EmergencyStop`] is a two-state switch, `Normal -> Stopped -> Normal`. Tripping it is the
//! only way into `Stopped`, and only [`EmergencyStop::reset`] (an explicit operator action, e.g.
//! releasing the physical estop button) leads back out. Nothing in the scheduler resets it.
//!
//! Every consumer holds an `Arc<EmergencyStop>` handed to it at construction. Applications normally
//! pass [`EmergencyStop::global`] everywhere so a single `trip` reaches every scheduler, lock and
//! driver in the process; tests create isolated instances with [`EmergencyStop::new`].
//!
//! Reads are a single atomic load. Waiting code uses [`EmergencyStop::sleep`], which wakes up as
//! soon as the stop is tripped instead of finishing its sleep.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::error::TaskError;

static GLOBAL_ESTOP: Lazy<Arc<EmergencyStop>> = Lazy::new(EmergencyStop::new);

/// Longest uninterrupted condvar wait of code that watches a stop it is not woken by.
pub(crate) const ESTOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Observable state of an [`EmergencyStop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EstopState {
    Normal,
    Stopped,
}

impl fmt::Display for EstopState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                EstopState::Normal => "normal",
                EstopState::Stopped => "stopped",
            }
        )
    }
}

/// Identifies a trip listener registered with [`EmergencyStop::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn() + Send + Sync>;

struct StopBook {
    trips: u64,
    resets: u64,
    next_listener: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

pub struct EmergencyStop {
    tripped: AtomicBool,
    book: Mutex<StopBook>,
    condvar: Condvar,
}

impl EmergencyStop {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tripped: AtomicBool::new(false),
            book: Mutex::new(StopBook {
                trips: 0,
                resets: 0,
                next_listener: 0,
                listeners: Vec::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    /// The process-wide instance, created on first use.
    pub fn global() -> Arc<Self> {
        GLOBAL_ESTOP.clone()
    }

    /// Trips the stop.
    ///
    /// Returns `true` if this call moved the stop from `Normal` to `Stopped`. Listeners run exactly
    /// once per such transition, on the calling thread and after the internal lock is released;
    /// tripping an already stopped instance has no further effect.
    pub fn trip(&self, reason: &str) -> bool {
        let listeners: Vec<Listener> = {
            let mut book = self.book.lock();
            if self.tripped.swap(true, Ordering::AcqRel) {
                return false;
            }
            book.trips += 1;
            self.condvar.notify_all();
            book.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        warn!(reason, listeners = listeners.len(), "emergency stop tripped");
        listeners.iter().for_each(|listener| listener());
        true
    }

    /// Clears the stop after the operator has confirmed the physical safety condition.
    ///
    /// Returns `true` if the stop was tripped before the call.
    pub fn reset(&self) -> bool {
        let mut book = self.book.lock();
        if !self.tripped.swap(false, Ordering::AcqRel) {
            return false;
        }
        book.resets += 1;
        info!(resets = book.resets, "emergency stop reset by operator");
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EstopState {
        if self.is_tripped() {
            EstopState::Stopped
        } else {
            EstopState::Normal
        }
    }

    /// Number of `Normal -> Stopped` transitions so far.
    pub fn trip_count(&self) -> u64 {
        self.book.lock().trips
    }

    /// `Err(EmergencyStopped)` when tripped: the checkpoint every operation starts with.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.is_tripped() {
            Err(TaskError::EmergencyStopped)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration` unless the stop is tripped first.
    ///
    /// Returns `Err(EmergencyStopped)` immediately when the stop is (or becomes) tripped, so long
    /// waits inside device operations react to an estop without polling.
    pub fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        let deadline = Instant::now() + duration;
        let mut book = self.book.lock();
        loop {
            if self.is_tripped() {
                return Err(TaskError::EmergencyStopped);
            }
            if self.condvar.wait_until(&mut book, deadline).timed_out() {
                drop(book);
                return self.check();
            }
        }
    }

    /// Registers a callback run on every `Normal -> Stopped` transition.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut book = self.book.lock();
        let id = ListenerId(book.next_listener);
        book.next_listener += 1;
        book.listeners.push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.book.lock().listeners.retain(|(lid, _)| *lid != id);
    }
}

impl fmt::Debug for EmergencyStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmergencyStop")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn trip_is_idempotent() {
        let estop = EmergencyStop::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ = calls.clone();
        estop.subscribe(move || {
            calls_.fetch_add(1, Ordering::SeqCst);
        });

        assert!(estop.trip("first"));
        assert!(!estop.trip("second"));
        assert!(!estop.trip("third"));

        assert_eq!(estop.state(), EstopState::Stopped);
        assert_eq!(estop.trip_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn only_reset_leaves_stopped() {
        let estop = EmergencyStop::new();
        assert!(!estop.reset());
        estop.trip("test");
        assert_eq!(estop.check(), Err(TaskError::EmergencyStopped));
        assert!(estop.reset());
        assert_eq!(estop.state(), EstopState::Normal);
        assert!(estop.check().is_ok());

        // A new trip after a reset is a new transition
        assert!(estop.trip("again"));
        assert_eq!(estop.trip_count(), 2);
    }

    #[test]
    fn sleep_wakes_on_trip() {
        let estop = EmergencyStop::new();
        let estop_ = estop.clone();
        let tripper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            estop_.trip("test");
        });

        let start = Instant::now();
        let res = estop.sleep(Duration::from_secs(10));
        assert_eq!(res, Err(TaskError::EmergencyStopped));
        assert!(start.elapsed() < Duration::from_secs(5));
        tripper.join().unwrap();
    }

    #[test]
    fn sleep_runs_to_completion_when_normal() {
        let estop = EmergencyStop::new();
        let start = Instant::now();
        assert!(estop.sleep(Duration::from_millis(20)).is_ok());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn unsubscribed_listener_is_not_called() {
        let estop = EmergencyStop::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_ = calls.clone();
        let id = estop.subscribe(move || {
            calls_.fetch_add(1, Ordering::SeqCst);
        });
        estop.unsubscribe(id);
        estop.trip("test");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
