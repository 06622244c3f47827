//! Mutual exclusion over one physical communication channel.
//!
//! A [`ResourceLock`] is bound 1:1 to a serial port, socket or any other exclusive link. The
//! scheduler takes it before running a task on the owning hardware, and status-polling code takes it
//! with [`ResourceLock::try_acquire`] so that periodic monitoring never stalls a command.
//!
//! Acquisition always hands out a [`ResourceGuard`]; the lock is released when the guard is dropped,
//! on every exit path including early returns and panics inside the protected operation. A guard can
//! lend its channel out for a while with [`ResourceGuard::released`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;
use crate::estop::{EmergencyStop, ESTOP_CHECK_INTERVAL};

pub struct ResourceLock {
    channel: String,
    held: Mutex<bool>,
    released: Condvar,
}

impl ResourceLock {
    pub fn new(channel: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.into(),
            held: Mutex::new(false),
            released: Condvar::new(),
        })
    }

    /// Name of the guarded channel, e.g. `COM3` or `192.168.1.20:502`.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    /// Takes the lock if it is free, without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ResourceGuard> {
        let mut held = self.held.lock();
        if *held {
            return None;
        }
        *held = true;
        Some(ResourceGuard::new(self.clone()))
    }

    /// Takes the lock.
    ///
    /// With `blocking == false` this behaves like [`ResourceLock::try_acquire`] and reports a busy
    /// channel as [`TaskError::ChannelUnavailable`]. With `blocking == true` it waits until the
    /// channel is free, giving up with [`TaskError::EmergencyStopped`] if `estop` trips meanwhile.
    pub fn acquire(
        self: &Arc<Self>,
        blocking: bool,
        estop: &EmergencyStop,
    ) -> Result<ResourceGuard, TaskError> {
        self.take(blocking, estop)?;
        Ok(ResourceGuard::new(self.clone()))
    }

    fn take(&self, blocking: bool, estop: &EmergencyStop) -> Result<(), TaskError> {
        estop.check()?;
        let mut held = self.held.lock();
        while *held {
            if !blocking {
                return Err(TaskError::ChannelUnavailable {
                    channel: self.channel.clone(),
                });
            }
            self.released.wait_for(&mut held, ESTOP_CHECK_INTERVAL);
            estop.check()?;
        }
        *held = true;
        Ok(())
    }

    fn take_back(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.released.notify_one();
    }
}

impl fmt::Debug for ResourceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("channel", &self.channel)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Proof of exclusive access to a channel. Dropping it releases the lock.
pub struct ResourceGuard {
    lock: Arc<ResourceLock>,
    // Set while the channel is lent out by `released`
    lent: AtomicBool,
}

impl ResourceGuard {
    fn new(lock: Arc<ResourceLock>) -> Self {
        Self {
            lock,
            lent: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &str {
        self.lock.channel()
    }

    /// Whether this guard was handed out by `lock` and currently holds it.
    pub fn guards(&self, lock: &Arc<ResourceLock>) -> bool {
        Arc::ptr_eq(&self.lock, lock) && !self.lent.load(Ordering::Acquire)
    }

    /// Frees the channel while `f` runs and takes it back afterwards, waiting for whoever picked it
    /// up in between.
    ///
    /// Inside `f` the guard does not hold the channel, so [`ResourceGuard::guards`] is `false`.
    /// Taking the channel back does not give up on an emergency stop: the guard always holds it
    /// again on return, so the caller can still make its device safe.
    pub fn released<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        if self.lent.swap(true, Ordering::AcqRel) {
            return f();
        }
        self.lock.release();
        let res = f();
        self.lock.take_back();
        self.lent.store(false, Ordering::Release);
        res
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if !*self.lent.get_mut() {
            self.lock.release();
        }
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("channel", &self.channel())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::panic;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = ResourceLock::new("COM3");
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());

        let start = Instant::now();
        assert!(lock.try_acquire().is_none());
        assert!(start.elapsed() < Duration::from_millis(50));

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn non_blocking_acquire_reports_busy_channel() {
        let estop = EmergencyStop::new();
        let lock = ResourceLock::new("COM3");
        let _guard = lock.acquire(true, &estop).unwrap();
        assert_eq!(
            lock.acquire(false, &estop).unwrap_err(),
            TaskError::ChannelUnavailable {
                channel: "COM3".into()
            }
        );
    }

    #[test]
    fn blocking_acquire_waits_for_release() {
        let estop = EmergencyStop::new();
        let lock = ResourceLock::new("COM3");
        let guard = lock.try_acquire().unwrap();

        let lock_ = lock.clone();
        let estop_ = estop.clone();
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let guard = lock_.acquire(true, &estop_);
            (guard.is_ok(), start.elapsed())
        });

        thread::sleep(Duration::from_millis(100));
        drop(guard);
        let (ok, waited) = waiter.join().unwrap();
        assert!(ok);
        assert!(waited >= Duration::from_millis(50));
    }

    #[test]
    fn blocking_acquire_gives_up_on_estop() {
        let estop = EmergencyStop::new();
        let lock = ResourceLock::new("COM3");
        let _guard = lock.try_acquire().unwrap();

        let lock_ = lock.clone();
        let estop_ = estop.clone();
        let waiter = thread::spawn(move || lock_.acquire(true, &estop_).map(|_| ()));

        thread::sleep(Duration::from_millis(30));
        let tripped = Instant::now();
        estop.trip("test");
        assert_eq!(waiter.join().unwrap(), Err(TaskError::EmergencyStopped));
        assert!(tripped.elapsed() < ESTOP_CHECK_INTERVAL + Duration::from_millis(50));
    }

    #[test]
    fn released_guard_lends_the_channel() {
        let lock = ResourceLock::new("COM3");
        let guard = lock.try_acquire().unwrap();

        let polled = guard.released(|| {
            assert!(!guard.guards(&lock));
            lock.try_acquire().is_some()
        });
        assert!(polled);
        assert!(guard.guards(&lock));
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn released_guard_waits_for_the_borrower() {
        let estop = EmergencyStop::new();
        let lock = ResourceLock::new("COM3");
        let guard = lock.try_acquire().unwrap();

        let start = Instant::now();
        guard.released(|| {
            let borrowed = lock.try_acquire().unwrap();
            estop.trip("test");
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                drop(borrowed);
            });
        });
        // A tripped stop does not keep the channel from coming back
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(guard.guards(&lock));
    }

    #[test]
    fn panic_while_released_leaves_the_channel_free() {
        let lock = ResourceLock::new("COM3");
        let lock_ = lock.clone();
        let res = panic::catch_unwind(panic::AssertUnwindSafe(move || {
            let guard = lock_.try_acquire().unwrap();
            let _: () = guard.released(|| panic!("status parse error"));
        }));
        assert!(res.is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn guard_releases_on_panic() {
        let lock = ResourceLock::new("COM3");
        let lock_ = lock.clone();
        let res = panic::catch_unwind(panic::AssertUnwindSafe(move || {
            let _guard = lock_.try_acquire().unwrap();
            panic!("wire protocol error");
        }));
        assert!(res.is_err());
        assert!(!lock.is_held());
    }

    #[test]
    fn guard_knows_its_lock() {
        let a = ResourceLock::new("COM3");
        let b = ResourceLock::new("COM3");
        let guard = a.try_acquire().unwrap();
        assert!(guard.guards(&a));
        assert!(!guard.guards(&b));
    }
}
