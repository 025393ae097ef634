//! Named alarms that the host re-derives after a restart
//!
//! A [`DurableScheduler`] arms an alarm by name; when the delay elapses the
//! host delivers the name back (see [`drive_alarms`]). The scheduler itself
//! does not have to survive a restart: owners persist their own deadlines and
//! re-arm on startup (the circuit breaker registry does this in `rehydrate()`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::circuit::CircuitBreakerRegistry;

/// Receiver of alarm names fired by a [`TokioScheduler`]
pub type AlarmReceiver = mpsc::UnboundedReceiver<String>;

/// Schedules named, restart-tolerant alarms
pub trait DurableScheduler: Send + Sync + 'static {
    /// Arm (or re-arm) the alarm `name` to fire after `delay`
    fn schedule(&self, name: &str, delay: Duration);

    /// Disarm the alarm `name` if pending
    fn cancel(&self, name: &str);
}

/// In-process scheduler backed by tokio timers
///
/// Re-scheduling a name replaces the pending timer, so at most one timer per
/// name is ever armed.
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioScheduler {
    /// Create a scheduler and the receiver its alarms are delivered on
    pub fn new() -> (Arc<Self>, AlarmReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                pending: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }

    /// Number of armed alarms
    pub fn pending_count(&self) -> usize {
        match self.pending.lock() {
            Ok(pending) => pending.values().filter(|h| !h.is_finished()).count(),
            Err(_) => 0,
        }
    }
}

impl DurableScheduler for TokioScheduler {
    fn schedule(&self, name: &str, delay: Duration) {
        let tx = self.tx.clone();
        let alarm = name.to_string();
        let deadline = tokio::time::Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            log::debug!("Scheduler: alarm {} fired", alarm);
            if tx.send(alarm).is_err() {
                log::debug!("Scheduler: alarm receiver closed");
            }
        });

        if let Ok(mut pending) = self.pending.lock() {
            if let Some(previous) = pending.insert(name.to_string(), handle) {
                previous.abort();
            }
        }
        log::debug!("Scheduler: armed {} in {:?}", name, delay);
    }

    fn cancel(&self, name: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(handle) = pending.remove(name) {
                handle.abort();
                log::debug!("Scheduler: cancelled {}", name);
            }
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            for (_, handle) in pending.drain() {
                handle.abort();
            }
        }
    }
}

/// Forward fired alarms to the registry until the scheduler is dropped
pub async fn drive_alarms(registry: Arc<CircuitBreakerRegistry>, mut alarms: AlarmReceiver) {
    while let Some(name) = alarms.recv().await {
        registry.handle_alarm(&name).await;
    }
    log::debug!("Scheduler: alarm loop exiting");
}
