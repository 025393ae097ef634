//! Named circuit breakers with durable state
//!
//! One breaker per external dependency, looked up by `service_id`. Every
//! mutation is written to the durable store, and OPEN periods are tracked by
//! a named alarm on the [`DurableScheduler`]. After a restart, `rehydrate()`
//! reloads each breaker and re-arms (or immediately fires) its recovery.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use super::breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition,
};
use super::CircuitError;
use crate::scheduler::DurableScheduler;
use crate::storage::{get_json, set_json, DurableStore};

const STORE_KEY_PREFIX: &str = "circuit_breaker:";
const ALARM_PREFIX: &str = "circuit_breaker_recovery:";

/// A state change delivered to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub service_id: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

type StateChangeCallback = Box<dyn Fn(&StateChange) + Send + Sync>;
type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

fn store_key(service_id: &str) -> String {
    format!("{}{}", STORE_KEY_PREFIX, service_id)
}

/// Alarm name used for a breaker's OPEN→HALF_OPEN transition
pub fn recovery_alarm_name(service_id: &str) -> String {
    format!("{}{}", ALARM_PREFIX, service_id)
}

pub struct CircuitBreakerRegistry {
    store: Arc<dyn DurableStore>,
    scheduler: Arc<dyn DurableScheduler>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    listeners: StdMutex<Vec<StateChangeCallback>>,
    unknown_warned: StdMutex<HashSet<String>>,
    clock: Clock,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<dyn DurableStore>, scheduler: Arc<dyn DurableScheduler>) -> Self {
        Self {
            store,
            scheduler,
            breakers: Mutex::new(HashMap::new()),
            listeners: StdMutex::new(Vec::new()),
            unknown_warned: StdMutex::new(HashSet::new()),
            clock: Box::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    /// Replace the wall clock (epoch millis), mainly for tests
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn now_ms(&self) -> i64 {
        (self.clock)()
    }

    /// Register a dependency; a second registration of the same id is ignored
    pub async fn register(&self, config: CircuitBreakerConfig) {
        let mut breakers = self.breakers.lock().await;
        if breakers.contains_key(&config.service_id) {
            log::warn!(
                "CircuitBreaker: {} already registered, keeping existing breaker",
                config.service_id
            );
            return;
        }
        log::debug!(
            "CircuitBreaker: registered {} (threshold {}, recovery {}ms, half-open {})",
            config.service_id,
            config.failure_threshold,
            config.recovery_timeout_ms,
            config.half_open_success_threshold
        );
        breakers.insert(config.service_id.clone(), CircuitBreaker::new(config));
    }

    /// Subscribe to state changes of every breaker
    pub fn on_state_change(&self, callback: impl Fn(&StateChange) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(callback));
        }
    }

    /// Reload every registered breaker from the durable store
    ///
    /// Call once at startup, after all `register()` calls. OPEN breakers whose
    /// deadline is still ahead get their alarm re-armed; overdue ones move to
    /// HALF_OPEN immediately.
    pub async fn rehydrate(&self) {
        let now = self.now_ms();
        let mut changes = Vec::new();

        {
            let mut breakers = self.breakers.lock().await;
            for (service_id, breaker) in breakers.iter_mut() {
                let snapshot = match get_json::<BreakerSnapshot>(
                    self.store.as_ref(),
                    &store_key(service_id),
                )
                .await
                {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!(
                            "CircuitBreaker: could not reload {}, starting CLOSED: {}",
                            service_id,
                            e
                        );
                        continue;
                    }
                };

                *breaker = CircuitBreaker::restore(breaker.config().clone(), snapshot);
                log::info!(
                    "CircuitBreaker: rehydrated {} as {}",
                    service_id,
                    breaker.state()
                );

                match breaker.recovery_remaining(now) {
                    Some(remaining) if remaining.is_zero() => {
                        if let Some(transition) = breaker.on_recovery_due() {
                            self.persist(service_id, breaker).await;
                            changes.push(change(service_id, transition));
                        }
                    }
                    Some(remaining) => {
                        self.scheduler
                            .schedule(&recovery_alarm_name(service_id), remaining);
                    }
                    None => {}
                }
            }
        }

        self.notify(&changes);
    }

    /// Ask whether a call to `service_id` may be attempted
    ///
    /// Unknown dependencies are not guarded and always allowed.
    pub async fn allow_request(&self, service_id: &str) -> bool {
        let now = self.now_ms();
        let (allowed, transition) = {
            let mut breakers = self.breakers.lock().await;
            let Some(breaker) = breakers.get_mut(service_id) else {
                self.warn_unknown(service_id);
                return true;
            };

            let admission = breaker.try_acquire(now);
            if let Some(transition) = admission.transition {
                // The alarm was lost or late; this is still the OPEN→HALF_OPEN edge
                self.scheduler.cancel(&recovery_alarm_name(service_id));
                self.persist(service_id, breaker).await;
                (admission.allowed, Some(change(service_id, transition)))
            } else {
                (admission.allowed, None)
            }
        };

        if !allowed {
            log::debug!("CircuitBreaker: {} is open, failing fast", service_id);
        }
        self.notify(transition.as_slice());
        allowed
    }

    pub async fn record_success(&self, service_id: &str) {
        self.record(service_id, true).await;
    }

    pub async fn record_failure(&self, service_id: &str) {
        self.record(service_id, false).await;
    }

    async fn record(&self, service_id: &str, success: bool) {
        let now = self.now_ms();
        let transition = {
            let mut breakers = self.breakers.lock().await;
            let Some(breaker) = breakers.get_mut(service_id) else {
                self.warn_unknown(service_id);
                return;
            };

            let transition = if success {
                breaker.on_success()
            } else {
                breaker.on_failure(now)
            };

            if let Some(t) = transition {
                match t.to {
                    CircuitState::Open => self.scheduler.schedule(
                        &recovery_alarm_name(service_id),
                        breaker.config().recovery_timeout(),
                    ),
                    _ => self.scheduler.cancel(&recovery_alarm_name(service_id)),
                }
            }
            self.persist(service_id, breaker).await;
            transition.map(|t| change(service_id, t))
        };

        self.notify(transition.as_slice());
    }

    /// Deliver a fired alarm; names that are not recovery alarms are ignored
    pub async fn handle_alarm(&self, name: &str) {
        let Some(service_id) = name.strip_prefix(ALARM_PREFIX) else {
            log::debug!("CircuitBreaker: ignoring foreign alarm {}", name);
            return;
        };

        let transition = {
            let mut breakers = self.breakers.lock().await;
            let Some(breaker) = breakers.get_mut(service_id) else {
                log::warn!("CircuitBreaker: alarm for unregistered {}", service_id);
                return;
            };

            match breaker.on_recovery_due() {
                Some(t) => {
                    self.persist(service_id, breaker).await;
                    Some(change(service_id, t))
                }
                None => {
                    log::debug!(
                        "CircuitBreaker: stale recovery alarm for {} ({})",
                        service_id,
                        breaker.state()
                    );
                    None
                }
            }
        };

        self.notify(transition.as_slice());
    }

    /// Run `call` through the breaker for `service_id`
    ///
    /// Fails fast with [`CircuitError::Open`] without polling `call` when the
    /// circuit rejects the attempt; otherwise records the outcome.
    pub async fn call<T, E, F>(&self, service_id: &str, call: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.allow_request(service_id).await {
            return Err(CircuitError::Open {
                service_id: service_id.to_string(),
            });
        }

        match call.await {
            Ok(value) => {
                self.record_success(service_id).await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(service_id).await;
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub async fn state(&self, service_id: &str) -> Option<CircuitState> {
        self.breakers
            .lock()
            .await
            .get(service_id)
            .map(|b| b.state())
    }

    pub async fn snapshot(&self, service_id: &str) -> Option<BreakerSnapshot> {
        self.breakers
            .lock()
            .await
            .get(service_id)
            .map(|b| b.snapshot())
    }

    /// States of all registered breakers, sorted by id
    pub async fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers = self.breakers.lock().await;
        let mut states: Vec<(String, CircuitState)> = breakers
            .iter()
            .map(|(id, b)| (id.clone(), b.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    async fn persist(&self, service_id: &str, breaker: &CircuitBreaker) {
        if let Err(e) = set_json(
            self.store.as_ref(),
            &store_key(service_id),
            &breaker.snapshot(),
        )
        .await
        {
            log::warn!("CircuitBreaker: failed to persist {}: {}", service_id, e);
        }
    }

    fn notify(&self, changes: &[StateChange]) {
        if changes.is_empty() {
            return;
        }
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for c in changes {
            log::info!("CircuitBreaker: {} {} -> {}", c.service_id, c.from, c.to);
            for listener in listeners.iter() {
                listener(c);
            }
        }
    }

    fn warn_unknown(&self, service_id: &str) {
        if let Ok(mut warned) = self.unknown_warned.lock() {
            if warned.insert(service_id.to_string()) {
                log::warn!(
                    "CircuitBreaker: {} is not registered, calls pass unguarded",
                    service_id
                );
            }
        }
    }
}

fn change(service_id: &str, transition: Transition) -> StateChange {
    StateChange {
        service_id: service_id.to_string(),
        from: transition.from,
        to: transition.to,
    }
}
