//! Circuit breakers for external dependencies
//!
//! Each external service (the streaming STT backend, a text-generation API,
//! ...) gets its own breaker, registered by name in a
//! [`CircuitBreakerRegistry`]. Call sites check `allow_request()` before
//! attempting the dependency and report the outcome afterwards, or wrap the
//! whole call with `call()`.
//!
//! Breaker state is durable: it is written to the store on every change and
//! reloaded with `rehydrate()` at startup, so an OPEN window that started
//! before a host restart is still honoured after it.

mod breaker;
mod registry;

pub use breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition,
};
pub use registry::{recovery_alarm_name, CircuitBreakerRegistry, StateChange};

/// Error returned by [`CircuitBreakerRegistry::call`]
#[derive(Debug)]
pub enum CircuitError<E> {
    /// The circuit rejected the attempt; the dependency was not called
    Open { service_id: String },
    /// The dependency was called and failed
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitError::Open { service_id } => {
                write!(f, "Circuit open for {}, call not attempted", service_id)
            }
            CircuitError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for CircuitError<E> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_error_display() {
        let err: CircuitError<String> = CircuitError::Open {
            service_id: "stt".to_string(),
        };
        assert!(err.to_string().contains("stt"));

        let err = CircuitError::Inner("timeout".to_string());
        assert_eq!(err.to_string(), "timeout");
    }
}
