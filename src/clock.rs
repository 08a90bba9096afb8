use tokio::time::Instant;

/// Seconds since the start of the run, the time base for every record.
///
/// Built on tokio's clock so a paused test runtime controls it.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Elapsed seconds, rounded to 0.1 ms
    pub fn now(&self) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        (secs * 10_000.0).round() / 10_000.0
    }
}

impl Default for RunClock {
    fn default() -> Self {
        Self::start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_runtime_time() {
        let clock = RunClock::start();
        assert_eq!(clock.now(), 0.0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now(), 1.5);
    }
}
