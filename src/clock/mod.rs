//! Refresh clocks that drive one pipeline tick per display refresh.
//!
//! A clock only delivers timestamps. Whether a tick does any work (or is
//! skipped because the previous one is still running) is decided by the
//! pipeline.

mod display_link;
mod timer;

pub use display_link::DisplayLinkClock;
pub use timer::TimerClock;

use crate::error::ClockError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::debug;

/// Host timestamp of a refresh event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostTime(Duration);

impl HostTime {
    pub const ZERO: HostTime = HostTime(Duration::ZERO);

    pub const fn from_duration(d: Duration) -> Self {
        Self(d)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Current host time, measured from the first call in this process.
    pub fn now() -> Self {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        Self(EPOCH.get_or_init(Instant::now).elapsed())
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }

    pub fn saturating_sub(&self, earlier: HostTime) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

/// Callback invoked once per refresh event.
pub type TickCallback = Box<dyn FnMut(HostTime) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
}

/// Source of refresh events.
pub trait RefreshClock: Send {
    /// Begin delivering ticks to `on_tick`.
    ///
    /// Fails with [`ClockError::AlreadyRunning`] instead of registering a
    /// second callback.
    fn start(&mut self, on_tick: TickCallback) -> Result<(), ClockError>;

    /// Stop delivering ticks. Once this returns, no further tick fires and any
    /// in-flight tick has finished (unless called from inside a tick).
    fn stop(&mut self);

    fn state(&self) -> ClockState;
}

/// Holds the active callback and guarantees stop/fire exclusion.
pub(crate) struct TickSlot {
    active: AtomicBool,
    callback: Mutex<Option<TickCallback>>,
    firing_thread: Mutex<Option<ThreadId>>,
}

impl TickSlot {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            callback: Mutex::new(None),
            firing_thread: Mutex::new(None),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn install(&self, on_tick: TickCallback) {
        *self.callback.lock().unwrap_or_else(|e| e.into_inner()) = Some(on_tick);
        self.active.store(true, Ordering::Release);
    }

    /// Invoke the callback once, unless the slot has been deactivated.
    pub(crate) fn fire(&self, time: HostTime) {
        if !self.is_active() {
            return;
        }
        let mut callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        if !self.is_active() {
            return;
        }
        if let Some(on_tick) = callback.as_mut() {
            self.set_firing(Some(thread::current().id()));
            on_tick(time);
            self.set_firing(None);
        }
    }

    fn set_firing(&self, id: Option<ThreadId>) {
        *self.firing_thread.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }

    fn is_firing_thread(&self) -> bool {
        *self.firing_thread.lock().unwrap_or_else(|e| e.into_inner())
            == Some(thread::current().id())
    }

    /// Stop further ticks.
    ///
    /// Waits for an in-flight tick to finish and drops the callback. Returns
    /// `false` without waiting when called from inside the callback.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.store(false, Ordering::Release);
        if self.is_firing_thread() {
            debug!("Clock stopped from inside a tick");
            return false;
        }
        let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
        drop(callback);
        true
    }
}

/// Clock driven explicitly by the caller, for offline runs and tests.
pub struct ManualClock {
    slot: TickSlot,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            slot: TickSlot::new(),
        }
    }

    /// Deliver one tick. Ignored while stopped.
    pub fn tick(&self, time: HostTime) {
        self.slot.fire(time);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshClock for ManualClock {
    fn start(&mut self, on_tick: TickCallback) -> Result<(), ClockError> {
        if self.slot.is_active() {
            return Err(ClockError::AlreadyRunning);
        }
        self.slot.install(on_tick);
        Ok(())
    }

    fn stop(&mut self) {
        self.slot.deactivate();
    }

    fn state(&self) -> ClockState {
        if self.slot.is_active() {
            ClockState::Running
        } else {
            ClockState::Stopped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (Arc<Mutex<Vec<HostTime>>>, TickCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |t| sink.lock().unwrap().push(t)))
    }

    #[test]
    fn test_manual_clock_delivers_each_tick_once() {
        let mut clock = ManualClock::new();
        let (seen, on_tick) = recorder();
        clock.start(on_tick).unwrap();

        for ms in [0, 16, 33] {
            clock.tick(HostTime::from_millis(ms));
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![HostTime::from_millis(0), HostTime::from_millis(16), HostTime::from_millis(33)]
        );
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let mut clock = ManualClock::new();
        let (_seen, first) = recorder();
        let (second_seen, second) = recorder();
        clock.start(first).unwrap();

        assert!(matches!(clock.start(second), Err(ClockError::AlreadyRunning)));
        clock.tick(HostTime::ZERO);
        assert!(second_seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_ticks_after_stop() {
        let mut clock = ManualClock::new();
        let (seen, on_tick) = recorder();
        clock.start(on_tick).unwrap();
        clock.tick(HostTime::from_millis(1));
        clock.stop();
        clock.tick(HostTime::from_millis(2));

        assert_eq!(clock.state(), ClockState::Stopped);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_restart_after_stop_begins_new_session() {
        let mut clock = ManualClock::new();
        let (_first_seen, first) = recorder();
        clock.start(first).unwrap();
        clock.stop();

        let (seen, second) = recorder();
        clock.start(second).unwrap();
        clock.tick(HostTime::from_millis(5));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_deactivate_from_inside_tick_does_not_wait() {
        let slot = Arc::new(TickSlot::new());
        let inner = slot.clone();
        let result = Arc::new(Mutex::new(None));
        let out = result.clone();
        slot.install(Box::new(move |_| {
            *out.lock().unwrap() = Some(inner.deactivate());
        }));

        slot.fire(HostTime::ZERO);
        assert_eq!(*result.lock().unwrap(), Some(false));
        assert!(!slot.is_active());
    }

    #[test]
    fn test_host_time_arithmetic() {
        let a = HostTime::from_millis(16);
        let b = HostTime::from_millis(33);
        assert_eq!(b.saturating_sub(a), Duration::from_millis(17));
        assert_eq!(a.saturating_sub(b), Duration::ZERO);
        assert!(HostTime::now() >= HostTime::ZERO);
    }
}
