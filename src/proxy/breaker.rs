//! Per-endpoint circuit breaker.
//!
//! Circuits start Closed. `failure_threshold` consecutive failures open a
//! circuit; once `reset_timeout` has passed since the last failure, the next
//! state query moves it to HalfOpen. A HalfOpen circuit admits a single
//! trial request: success closes it, failure reopens it and restarts the
//! clock.
//!
//! Every transition happens under the endpoint's map entry lock, so
//! concurrent updates to one endpoint are serialized and none are lost.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Time source for reset-timeout checks.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Instant,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: DashMap::new(),
            settings: BreakerSettings {
                failure_threshold: settings.failure_threshold.max(1),
                ..settings
            },
            clock,
        }
    }

    /// Current state of `endpoint`. An expired Open circuit becomes HalfOpen here.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        match self.circuits.get_mut(endpoint) {
            Some(mut circuit) => self.refresh(endpoint, &mut circuit),
            None => CircuitState::Closed,
        }
    }

    pub fn failure_count(&self, endpoint: &str) -> u32 {
        self.circuits
            .get(endpoint)
            .map(|circuit| circuit.failure_count)
            .unwrap_or(0)
    }

    /// Claims the single trial slot of a HalfOpen circuit.
    ///
    /// Returns false when the circuit is not HalfOpen or a trial is already running.
    pub fn try_begin_trial(&self, endpoint: &str) -> bool {
        let Some(mut circuit) = self.circuits.get_mut(endpoint) else {
            return false;
        };
        if self.refresh(endpoint, &mut circuit) != CircuitState::HalfOpen || circuit.trial_in_flight {
            return false;
        }
        circuit.trial_in_flight = true;
        true
    }

    /// Drops circuits of endpoints `keep` rejects. Returns how many.
    pub fn retain_endpoints(&self, keep: impl Fn(&str) -> bool) -> usize {
        let before = self.circuits.len();
        self.circuits.retain(|endpoint, _| keep(endpoint));
        before.saturating_sub(self.circuits.len())
    }

    /// Gives back a trial slot without recording an outcome.
    pub fn release_trial(&self, endpoint: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(endpoint) {
            circuit.trial_in_flight = false;
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        let now = self.clock.now();
        let mut circuit = self
            .circuits
            .entry(endpoint.to_string())
            .or_insert_with(|| Circuit {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: now,
                trial_in_flight: false,
            });
        let previous = self.refresh(endpoint, &mut circuit);

        circuit.failure_count = circuit.failure_count.saturating_add(1);
        circuit.last_failure = now;
        circuit.trial_in_flight = false;

        match previous {
            CircuitState::Closed if circuit.failure_count >= self.settings.failure_threshold => {
                circuit.state = CircuitState::Open;
                tracing::warn!(
                    endpoint = %endpoint,
                    failures = circuit.failure_count,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                tracing::warn!(endpoint = %endpoint, "trial request failed, circuit reopened");
            }
            _ => {}
        }
    }

    /// Closes a HalfOpen circuit and clears the failure streak of a Closed one.
    ///
    /// Endpoints without a circuit are left untracked.
    pub fn record_success(&self, endpoint: &str) {
        let Some(mut circuit) = self.circuits.get_mut(endpoint) else {
            return;
        };
        match self.refresh(endpoint, &mut circuit) {
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Closed;
                circuit.failure_count = 0;
                circuit.trial_in_flight = false;
                tracing::info!(endpoint = %endpoint, "circuit closed");
            }
            CircuitState::Closed => circuit.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn refresh(&self, endpoint: &str, circuit: &mut Circuit) -> CircuitState {
        if circuit.state == CircuitState::Open
            && self.clock.now().saturating_duration_since(circuit.last_failure) >= self.settings.reset_timeout
        {
            circuit.state = CircuitState::HalfOpen;
            circuit.trial_in_flight = false;
            tracing::info!(endpoint = %endpoint, "circuit half-open");
        }
        circuit.state
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Clock advanced by hand.
    pub(crate) struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(Instant::now()),
            })
        }

        pub(crate) fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock()
        }
    }

    pub(crate) fn breaker_with(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            BreakerSettings {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(30),
            },
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    const EP: &str = "10.0.0.1:8080";

    // ========== Phase 1: Closed -> Open ==========

    #[test]
    fn test_unknown_endpoint_is_closed() {
        let breaker = CircuitBreaker::new(BreakerSettings::default());
        assert_eq!(breaker.state(EP), CircuitState::Closed);
        assert_eq!(breaker.failure_count(EP), 0);
    }

    #[test]
    fn test_opens_at_threshold() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);

        breaker.record_failure(EP);
        breaker.record_failure(EP);
        assert_eq!(breaker.state(EP), CircuitState::Closed);

        breaker.record_failure(EP);
        assert_eq!(breaker.state(EP), CircuitState::Open);
        assert_eq!(breaker.failure_count(EP), 3);
    }

    #[test]
    fn test_success_resets_closed_streak() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);

        breaker.record_failure(EP);
        breaker.record_failure(EP);
        breaker.record_success(EP);
        breaker.record_failure(EP);
        breaker.record_failure(EP);

        assert_eq!(breaker.state(EP), CircuitState::Closed);
        assert_eq!(breaker.failure_count(EP), 2);
    }

    #[test]
    fn test_success_on_unknown_endpoint_creates_nothing() {
        let breaker = CircuitBreaker::new(BreakerSettings::default());
        breaker.record_success(EP);
        assert!(breaker.circuits.is_empty());
    }

    // ========== Phase 2: Open -> HalfOpen ==========

    #[test]
    fn test_stays_open_before_timeout() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);
        for _ in 0..3 {
            breaker.record_failure(EP);
        }

        clock.advance(Duration::from_secs(29));
        assert_eq!(breaker.state(EP), CircuitState::Open);
    }

    #[test]
    fn test_lazy_half_open_after_timeout() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);
        for _ in 0..3 {
            breaker.record_failure(EP);
        }

        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(EP), CircuitState::HalfOpen);
    }

    #[test]
    fn test_failure_while_open_restarts_clock() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);
        for _ in 0..3 {
            breaker.record_failure(EP);
        }
        clock.advance(Duration::from_secs(20));
        breaker.record_failure(EP);
        clock.advance(Duration::from_secs(20));

        assert_eq!(breaker.state(EP), CircuitState::Open);
    }

    // ========== Phase 3: HalfOpen outcomes ==========

    #[test]
    fn test_half_open_success_closes() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);
        for _ in 0..3 {
            breaker.record_failure(EP);
        }
        clock.advance(Duration::from_secs(30));

        breaker.record_success(EP);
        assert_eq!(breaker.state(EP), CircuitState::Closed);
        assert_eq!(breaker.failure_count(EP), 0);
    }

    #[test]
    fn test_half_open_failure_reopens_and_increments() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);
        for _ in 0..3 {
            breaker.record_failure(EP);
        }
        clock.advance(Duration::from_secs(30));
        assert_eq!(breaker.state(EP), CircuitState::HalfOpen);

        breaker.record_failure(EP);
        assert_eq!(breaker.state(EP), CircuitState::Open);
        assert_eq!(breaker.failure_count(EP), 4);

        clock.advance(Duration::from_secs(29));
        assert_eq!(breaker.state(EP), CircuitState::Open);
        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.state(EP), CircuitState::HalfOpen);
    }

    #[test]
    fn test_single_trial_permit() {
        let clock = ManualClock::new();
        let breaker = breaker_with(&clock);
        for _ in 0..3 {
            breaker.record_failure(EP);
        }
        assert!(!breaker.try_begin_trial(EP));

        clock.advance(Duration::from_secs(30));
        assert!(breaker.try_begin_trial(EP));
        assert!(!breaker.try_begin_trial(EP));

        breaker.release_trial(EP);
        assert_eq!(breaker.state(EP), CircuitState::HalfOpen);
        assert!(breaker.try_begin_trial(EP));
    }

    #[test]
    fn test_closed_endpoint_has_no_trial() {
        let breaker = CircuitBreaker::new(BreakerSettings::default());
        breaker.record_failure(EP);
        assert!(!breaker.try_begin_trial(EP));
    }

    // ========== Phase 4: Thread Safety ==========

    #[test]
    fn test_concurrent_failures_not_lost() {
        use std::thread;

        let breaker = Arc::new(CircuitBreaker::new(BreakerSettings {
            failure_threshold: 10_000,
            reset_timeout: Duration::from_secs(60),
        }));
        let mut handles = vec![];
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            handles.push(thread::spawn(move || {
                for _ in 0..250 {
                    breaker.record_failure(EP);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(breaker.failure_count(EP), 2000);
        assert_eq!(breaker.state(EP), CircuitState::Closed);
    }

    #[test]
    fn test_concurrent_trials_admit_one() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::thread;

        let clock = ManualClock::new();
        let breaker = Arc::new(breaker_with(&clock));
        for _ in 0..3 {
            breaker.record_failure(EP);
        }
        clock.advance(Duration::from_secs(30));

        let admitted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    if breaker.try_begin_trial(EP) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_breaker_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CircuitBreaker>();
    }
}
