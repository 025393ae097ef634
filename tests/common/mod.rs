//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use resilient_stt::scheduler::DurableScheduler;
use resilient_stt::streaming::{
    ConnectionEvent, ConnectionEvents, Connector, Socket, SocketEvent, StreamingError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Server side of one mock socket
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<SocketEvent>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ServerHandle {
    pub fn push(&self, json: &str) {
        let _ = self.tx.send(SocketEvent::Text(json.to_string()));
    }

    pub fn partial(&self, text: &str) {
        self.push(&format!(
            r#"{{"message_type": "partial_transcript", "text": "{}"}}"#,
            text
        ));
    }

    pub fn committed(&self, text: &str) {
        self.push(&format!(
            r#"{{"message_type": "committed_transcript", "text": "{}"}}"#,
            text
        ));
    }

    pub fn close(&self, clean: bool) {
        let _ = self.tx.send(SocketEvent::Closed {
            clean,
            reason: "test".to_string(),
        });
    }

    /// Decoded PCM payloads received from the client, in order
    pub fn audio(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|json| {
                let value: serde_json::Value = serde_json::from_str(json).unwrap();
                assert_eq!(value["message_type"], "input_audio_chunk");
                STANDARD
                    .decode(value["audio_base64"].as_str().unwrap())
                    .unwrap()
            })
            .collect()
    }
}

struct MockSocket {
    inbound: mpsc::UnboundedReceiver<SocketEvent>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Socket for MockSocket {
    async fn send(&mut self, text: String) -> Result<(), StreamingError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> SocketEvent {
        match self.inbound.recv().await {
            Some(event) => event,
            // Server handle dropped: stay quiet instead of ending the stream
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

/// Connector whose attempts follow a script (default: succeed)
#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<Result<(), StreamingError>>>,
    fallback: Mutex<Option<StreamingError>>,
    servers: Mutex<Vec<ServerHandle>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Outcomes for the next attempts, in order
    pub fn scripted(outcomes: Vec<Result<(), StreamingError>>) -> Arc<Self> {
        let connector = Self::default();
        *connector.script.lock().unwrap() = outcomes.into();
        Arc::new(connector)
    }

    /// Every attempt fails with `error`
    pub fn always_failing(error: StreamingError) -> Arc<Self> {
        let connector = Self::default();
        *connector.fallback.lock().unwrap() = Some(error);
        Arc::new(connector)
    }

    /// Number of times `open()` was called
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Server side of the n-th successfully opened socket
    pub fn server(&self, n: usize) -> ServerHandle {
        self.servers.lock().unwrap()[n].clone()
    }

    pub fn server_count(&self) -> usize {
        self.servers.lock().unwrap().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn fetch_token(&self) -> Result<String, StreamingError> {
        Ok("sut_test".to_string())
    }

    async fn open(&self, token: &str) -> Result<Box<dyn Socket>, StreamingError> {
        assert_eq!(token, "sut_test");
        self.opens.fetch_add(1, Ordering::SeqCst);

        let scripted = self.script.lock().unwrap().pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => match self.fallback.lock().unwrap().clone() {
                Some(error) => Err(error),
                None => Ok(()),
            },
        };
        outcome?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.servers.lock().unwrap().push(ServerHandle {
            tx,
            sent: sent.clone(),
        });
        Ok(Box::new(MockSocket { inbound, sent }))
    }
}

/// Records schedule/cancel calls instead of running timers
#[derive(Default)]
pub struct ManualScheduler {
    armed: Mutex<HashMap<String, Duration>>,
}

impl ManualScheduler {
    pub fn armed(&self, name: &str) -> Option<Duration> {
        self.armed.lock().unwrap().get(name).copied()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.lock().unwrap().len()
    }
}

impl DurableScheduler for ManualScheduler {
    fn schedule(&self, name: &str, delay: Duration) {
        self.armed.lock().unwrap().insert(name.to_string(), delay);
    }

    fn cancel(&self, name: &str) {
        self.armed.lock().unwrap().remove(name);
    }
}

/// Everything received so far, without waiting
pub fn drain(events: &mut ConnectionEvents) -> Vec<ConnectionEvent> {
    std::iter::from_fn(|| events.try_recv().ok()).collect()
}

/// Let background tasks run without crossing a backoff deadline
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
