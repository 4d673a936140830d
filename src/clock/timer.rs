//! Fixed-interval timer clock.

use super::{ClockState, HostTime, RefreshClock, TickCallback, TickSlot};
use crate::error::ClockError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fires ticks from a dedicated thread at a fixed nominal interval.
///
/// When a tick overruns its deadline the next one fires late, right away,
/// and the schedule restarts from there. Missed deadlines are never
/// replayed in a burst.
pub struct TimerClock {
    interval: Duration,
    slot: Arc<TickSlot>,
    thread: Option<JoinHandle<()>>,
}

impl TimerClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slot: Arc::new(TickSlot::new()),
            thread: None,
        }
    }

    /// Timer firing `fps` times per second.
    pub fn with_fps(fps: u32) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / fps.max(1) as f64))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn run(slot: Arc<TickSlot>, interval: Duration) {
        let mut deadline = Instant::now();
        while slot.is_active() {
            slot.fire(HostTime::now());

            match pace(&mut deadline, Instant::now(), interval) {
                Pace::Sleep(wait) => thread::sleep(wait),
                Pace::Late(behind) if behind >= interval => {
                    warn!(
                        "Timer clock behind by {:?} ({} refreshes), firing late",
                        behind,
                        behind.as_nanos() / interval.as_nanos().max(1)
                    );
                }
                Pace::Late(_) => {}
            }
        }
    }
}

/// What the timer thread does after a tick.
#[derive(Debug, PartialEq, Eq)]
enum Pace {
    /// Wait until the next deadline.
    Sleep(Duration),
    /// The deadline has passed by this much; fire immediately.
    Late(Duration),
}

/// Advance `deadline` by one interval. A missed deadline is moved to `now`.
fn pace(deadline: &mut Instant, now: Instant, interval: Duration) -> Pace {
    *deadline += interval;
    if *deadline > now {
        Pace::Sleep(*deadline - now)
    } else {
        let behind = now - *deadline;
        *deadline = now;
        Pace::Late(behind)
    }
}

impl RefreshClock for TimerClock {
    fn start(&mut self, on_tick: TickCallback) -> Result<(), ClockError> {
        if self.slot.is_active() {
            return Err(ClockError::AlreadyRunning);
        }
        // Reap a thread left detached by a stop issued from inside a tick.
        if let Some(previous) = self.thread.take() {
            let _ = previous.join();
        }

        self.slot.install(on_tick);
        let slot = self.slot.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("refresh-timer".into())
            .spawn(move || Self::run(slot, interval));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!("Timer clock started ({:?} interval)", self.interval);
                Ok(())
            }
            Err(e) => {
                self.slot.deactivate();
                Err(ClockError::Spawn(e))
            }
        }
    }

    fn stop(&mut self) {
        if !self.slot.is_active() && self.thread.is_none() {
            return;
        }
        if self.slot.deactivate() {
            if let Some(handle) = self.thread.take() {
                let _ = handle.join();
            }
        }
        info!("Timer clock stopped");
    }

    fn state(&self) -> ClockState {
        if self.slot.is_active() {
            ClockState::Running
        } else {
            ClockState::Stopped
        }
    }
}

impl Drop for TimerClock {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_timer_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut clock = TimerClock::new(Duration::from_millis(2));
        clock
            .start(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert_eq!(clock.state(), ClockState::Running);

        thread::sleep(Duration::from_millis(50));
        clock.stop();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop > 0);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
        assert_eq!(clock.state(), ClockState::Stopped);
    }

    #[test]
    fn test_timer_rejects_second_start() {
        let mut clock = TimerClock::with_fps(60);
        clock.start(Box::new(|_| {})).unwrap();
        assert!(matches!(clock.start(Box::new(|_| {})), Err(ClockError::AlreadyRunning)));
        clock.stop();
    }

    #[test]
    fn test_pace_sleeps_until_next_deadline() {
        let start = Instant::now();
        let mut deadline = start;
        let now = start + Duration::from_millis(4);
        assert_eq!(
            pace(&mut deadline, now, Duration::from_millis(10)),
            Pace::Sleep(Duration::from_millis(6))
        );
        assert_eq!(deadline, start + Duration::from_millis(10));
    }

    #[test]
    fn test_overrun_fires_one_late_tick_then_resumes_cadence() {
        let interval = Duration::from_millis(10);
        let start = Instant::now();
        let mut deadline = start;

        // The tick took 35ms: the next one fires late, with no burst.
        let now = start + Duration::from_millis(35);
        assert_eq!(
            pace(&mut deadline, now, interval),
            Pace::Late(Duration::from_millis(25))
        );
        assert_eq!(deadline, now);

        assert_eq!(pace(&mut deadline, now, interval), Pace::Sleep(interval));
    }

    #[test]
    fn test_slow_callback_still_receives_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut clock = TimerClock::new(Duration::from_millis(1));
        clock
            .start(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
            }))
            .unwrap();
        thread::sleep(Duration::from_millis(40));
        clock.stop();
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut clock = TimerClock::new(Duration::from_millis(1));
        clock
            .start(Box::new(move |t| sink.lock().unwrap().push(t)))
            .unwrap();
        thread::sleep(Duration::from_millis(20));
        clock.stop();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}
