use std::time::Duration;

use tokio::time::Instant;

/// Accumulates how long a game has been online across start/stop cycles.
///
/// `uptime()` hands out only the time accrued since the previous call, so a
/// poller can report deltas without remembering when it last asked.
#[derive(Debug, Default)]
pub struct Counter {
    total: Duration,
    unconsumed: Duration,
    // Later of the last start and the last consumption while running.
    last_mark: Option<Instant>,
    started: bool,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.last_mark = Some(Instant::now());
        self.started = true;
    }

    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        let delta = self.elapsed_since_mark(Instant::now());
        self.total += delta;
        self.unconsumed += delta;
        self.last_mark = None;
        self.started = false;
    }

    /// Returns the online time accrued since the previous call and resets it.
    pub fn uptime(&mut self) -> Duration {
        let mut out = std::mem::take(&mut self.unconsumed);
        if self.started {
            let now = Instant::now();
            let delta = self.elapsed_since_mark(now);
            self.total += delta;
            out += delta;
            self.last_mark = Some(now);
        }
        out
    }

    fn elapsed_since_mark(&self, now: Instant) -> Duration {
        self.last_mark
            .map(|mark| now.saturating_duration_since(mark))
            .unwrap_or_default()
    }
}
