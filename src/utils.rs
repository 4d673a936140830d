use std::time::{Duration, Instant};

/// Counts events and reports their rate once per interval.
pub struct FpsCounter {
    frame_count: u32,
    last_time: Instant,
    interval: Duration,
}

impl FpsCounter {
    /// Counter reporting once per second.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(1))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            frame_count: 0,
            last_time: Instant::now(),
            interval,
        }
    }

    /// Count one frame.
    /// Returns Some(fps) if the reporting interval has passed, otherwise None.
    pub fn update(&mut self) -> Option<f32> {
        self.update_at(Instant::now())
    }

    fn update_at(&mut self, now: Instant) -> Option<f32> {
        self.frame_count += 1;
        let elapsed = now.saturating_duration_since(self.last_time);

        if elapsed >= self.interval {
            let fps = self.frame_count as f32 / elapsed.as_secs_f32();
            self.frame_count = 0;
            self.last_time = now;
            Some(fps)
        } else {
            None
        }
    }

    /// Start a fresh measurement window, e.g. after playback restarts.
    pub fn reset(&mut self) {
        self.frame_count = 0;
        self.last_time = Instant::now();
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once_per_interval() {
        let mut counter = FpsCounter::with_interval(Duration::from_secs(1));
        let start = counter.last_time;
        for i in 1..30 {
            assert_eq!(counter.update_at(start + Duration::from_millis(i * 10)), None);
        }
        let fps = counter.update_at(start + Duration::from_secs(1)).unwrap();
        assert_eq!(fps, 30.0);
        assert_eq!(counter.update_at(start + Duration::from_millis(1100)), None);
    }
}
