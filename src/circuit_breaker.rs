// Circuit Breaker Manager - per-key failure isolation
//
// Keys are free-form strings; the scheduler uses `agent:<id>` and
// `resource:<id>`. Every breaker starts Closed and lives in one map so
// removing an agent drops its breaker with it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::types::{AgentId, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

pub fn agent_key(agent_id: &AgentId) -> String {
    format!("agent:{agent_id}")
}

pub fn resource_key(resource_id: &ResourceId) -> String {
    format!("resource:{resource_id}")
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_transition_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    /// Failure instants inside the tracking window (Closed only)
    failures: VecDeque<Instant>,
    /// Consecutive successes while HalfOpen
    success_count: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    last_transition_at: DateTime<Utc>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            success_count: 0,
            opened_at: None,
            probes_in_flight: 0,
            last_transition_at: Utc::now(),
        }
    }

    fn failure_count(&self) -> u32 {
        self.failures.len() as u32
    }
}

/// Holds one breaker per key
pub struct CircuitBreakerManager {
    breakers: Mutex<HashMap<String, Breaker>>,
    config: CircuitBreakerConfig,
    events: EventBus,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
            events,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask permission to call through `key`. Open circuits short-circuit
    /// with `CircuitOpen`; an Open circuit whose timeout has elapsed moves
    /// to HalfOpen and admits a limited number of probes.
    pub fn check(&self, key: &str) -> Result<()> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(key.to_string()).or_insert_with(Breaker::new);

        if breaker.state == CircuitState::Open {
            let elapsed = breaker
                .opened_at
                .map(|opened| opened.elapsed() >= self.config.open_timeout())
                .unwrap_or(true);
            if !elapsed {
                return Err(CoordinationError::CircuitOpen {
                    key: key.to_string(),
                });
            }
            self.transition(key, breaker, CircuitState::HalfOpen);
        }

        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if breaker.probes_in_flight >= self.config.half_open_max_probes {
                    debug!(key = %key, "Half-open probe limit reached");
                    return Err(CoordinationError::CircuitOpen {
                        key: key.to_string(),
                    });
                }
                breaker.probes_in_flight += 1;
                Ok(())
            }
            CircuitState::Open => Err(CoordinationError::CircuitOpen {
                key: key.to_string(),
            }),
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(key.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            CircuitState::Closed => breaker.failures.clear(),
            CircuitState::HalfOpen => {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
                breaker.success_count += 1;
                if breaker.success_count >= self.config.success_threshold {
                    self.transition(key, breaker, CircuitState::Closed);
                }
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(key.to_string()).or_insert_with(Breaker::new);
        let now = Instant::now();

        match breaker.state {
            CircuitState::Closed => {
                breaker.failures.push_back(now);
                let window = self.config.failure_window();
                while let Some(oldest) = breaker.failures.front() {
                    if now.duration_since(*oldest) > window {
                        breaker.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if breaker.failure_count() >= self.config.failure_threshold {
                    let failure_count = breaker.failure_count();
                    self.open(key, breaker, now, failure_count);
                }
            }
            CircuitState::HalfOpen => {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
                let failure_count = breaker.failure_count() + 1;
                self.open(key, breaker, now, failure_count);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `operation` through the breaker for `key`. The operation is not
    /// invoked at all while the circuit is open.
    pub async fn call<F, Fut, T>(&self, key: &str, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.check(key)?;
        match operation().await {
            Ok(value) => {
                self.record_success(key);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(key);
                Err(e)
            }
        }
    }

    /// Current state without side effects. An Open breaker past its
    /// timeout still reports Open until the next `check`.
    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(key)
            .map(|breaker| breaker.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.state(key) == CircuitState::Open
    }

    /// Whether `check` would let a call through right now. Unlike `check`
    /// this neither moves Open to HalfOpen nor takes a probe slot.
    pub fn would_admit(&self, key: &str) -> bool {
        self.breakers
            .lock()
            .get(key)
            .map_or(true, |breaker| self.admits(breaker))
    }

    /// Keys for which `would_admit` is currently false
    pub fn rejecting_keys(&self) -> HashSet<String> {
        self.breakers
            .lock()
            .iter()
            .filter(|(_, breaker)| !self.admits(breaker))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Give back a probe slot taken by `check` for a call that was
    /// abandoned before it produced an outcome.
    pub fn abandon(&self, key: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(key) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
            }
        }
    }

    /// Keys of all currently open circuits, sorted
    pub fn open_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .breakers
            .lock()
            .iter()
            .filter(|(_, breaker)| breaker.state == CircuitState::Open)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshot: Vec<BreakerSnapshot> = self
            .breakers
            .lock()
            .iter()
            .map(|(key, breaker)| BreakerSnapshot {
                key: key.clone(),
                state: breaker.state,
                failure_count: breaker.failure_count(),
                success_count: breaker.success_count,
                last_transition_at: breaker.last_transition_at,
            })
            .collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        snapshot
    }

    pub fn remove(&self, key: &str) -> bool {
        self.breakers.lock().remove(key).is_some()
    }

    fn admits(&self, breaker: &Breaker) -> bool {
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => breaker.probes_in_flight < self.config.half_open_max_probes,
            CircuitState::Open => breaker
                .opened_at
                .map(|opened| opened.elapsed() >= self.config.open_timeout())
                .unwrap_or(true),
        }
    }

    fn open(&self, key: &str, breaker: &mut Breaker, now: Instant, failure_count: u32) {
        breaker.opened_at = Some(now);
        self.transition(key, breaker, CircuitState::Open);
        warn!(key = %key, failure_count, "Circuit opened");
        self.events.emit(CoordinationEvent::CircuitOpened {
            key: key.to_string(),
            failure_count,
        });
    }

    fn transition(&self, key: &str, breaker: &mut Breaker, to: CircuitState) {
        let from = breaker.state;
        if from == to {
            return;
        }
        breaker.state = to;
        breaker.last_transition_at = Utc::now();
        breaker.success_count = 0;
        breaker.probes_in_flight = 0;
        if to != CircuitState::Open {
            breaker.opened_at = None;
        }
        if to == CircuitState::Closed {
            breaker.failures.clear();
        }

        info!(key = %key, from = %from, to = %to, "Circuit state changed");
        self.events.emit(CoordinationEvent::CircuitStateChanged {
            key: key.to_string(),
            from,
            to,
        });
    }
}

impl fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("breakers", &self.breakers.lock().len())
            .field("config", &self.config)
            .finish()
    }
}
