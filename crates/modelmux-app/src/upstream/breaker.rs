//! Per-(provider, model) circuit breaker over a sliding error window.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
const COOLOFF: Duration = Duration::from_secs(30);
const MIN_SAMPLES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Default)]
struct WindowState {
    samples: VecDeque<(Instant, bool)>,
    open_until: Option<Instant>,
}

impl WindowState {
    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn observe(&mut self, now: Instant, ok: bool) {
        if let Some(until) = self.open_until {
            if now < until {
                // State transitions are monotonic within the cool-off.
                return;
            }
            self.open_until = None;
            self.samples.clear();
        }

        self.samples.push_back((now, ok));
        self.prune(now);

        let total = self.samples.len();
        if total < MIN_SAMPLES {
            return;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        // Trip at a 50 % failure ratio or worse.
        if failures * 2 >= total {
            self.open_until = Some(now + COOLOFF);
        }
    }

    fn state(&mut self, now: Instant) -> BreakerState {
        match self.open_until {
            Some(until) if now < until => BreakerState::Open,
            Some(_) => {
                self.open_until = None;
                self.samples.clear();
                BreakerState::Closed
            }
            None => BreakerState::Closed,
        }
    }
}

/// Tracks upstream health and answers availability queries for the router.
#[derive(Default)]
pub struct CircuitBreaker {
    windows: DashMap<(String, String), Mutex<WindowState>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider: &str, model: &str) {
        self.observe(provider, model, true);
    }

    pub fn record_failure(&self, provider: &str, model: &str) {
        self.observe(provider, model, false);
    }

    fn observe(&self, provider: &str, model: &str, ok: bool) {
        let key = (provider.to_string(), model.to_string());
        let entry = self.windows.entry(key).or_default();
        entry.lock().observe(Instant::now(), ok);
    }

    pub fn state(&self, provider: &str, model: &str) -> BreakerState {
        let key = (provider.to_string(), model.to_string());
        match self.windows.get(&key) {
            Some(entry) => entry.lock().state(Instant::now()),
            None => BreakerState::Closed,
        }
    }

    pub fn is_open(&self, provider: &str, model: &str) -> bool {
        self.state(provider, model) == BreakerState::Open
    }

    /// Snapshot of every tripped (provider, model) pair; the router treats
    /// these as unavailable.
    pub fn unavailable(&self) -> HashSet<(String, String)> {
        let now = Instant::now();
        self.windows
            .iter()
            .filter(|entry| entry.value().lock().state(now) == BreakerState::Open)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// (provider, model, open?) triples for the metrics gauge.
    pub fn snapshot(&self) -> Vec<(String, String, bool)> {
        let now = Instant::now();
        self.windows
            .iter()
            .map(|entry| {
                let (provider, model) = entry.key().clone();
                let open = entry.value().lock().state(now) == BreakerState::Open;
                (provider, model, open)
            })
            .collect()
    }
}
