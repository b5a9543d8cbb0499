//! Shared fixtures for executor integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use txscript_core::bus::{CanBus, CanFrame};
use txscript_core::config::ExecutorConfig;
use txscript_core::executor::ScriptExecutor;

/// One `send_frame` call seen by [`MockBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub port: String,
    pub id: u32,
    pub data: Vec<u8>,
    pub extended: bool,
}

/// Records every write and lets tests inject inbound frames.
#[derive(Default)]
pub struct MockBus {
    calls: Mutex<Vec<SentFrame>>,
    failing: Mutex<HashSet<String>>,
    channels: Mutex<HashMap<String, broadcast::Sender<CanFrame>>>,
    latency: Mutex<Option<Duration>>,
    writes: Mutex<InFlight>,
}

/// Concurrent `send_frame` calls, per port and overall.
#[derive(Default)]
struct InFlight {
    current: HashMap<String, usize>,
    peak: HashMap<String, usize>,
    total: usize,
    peak_total: usize,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, port: &str) {
        self.failing.lock().unwrap().insert(port.to_string());
    }

    /// Makes every write take `latency` before it completes.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Most writes ever in flight at once on `port`.
    pub fn max_in_flight(&self, port: &str) -> usize {
        self.writes.lock().unwrap().peak.get(port).copied().unwrap_or(0)
    }

    /// Most writes ever in flight at once across all ports.
    pub fn max_in_flight_total(&self) -> usize {
        self.writes.lock().unwrap().peak_total
    }

    fn begin_write(&self, port: &str) {
        let mut writes = self.writes.lock().unwrap();
        let current = writes.current.entry(port.to_string()).or_default();
        *current += 1;
        let current = *current;
        let peak = writes.peak.entry(port.to_string()).or_default();
        *peak = (*peak).max(current);
        writes.total += 1;
        writes.peak_total = writes.peak_total.max(writes.total);
    }

    fn end_write(&self, port: &str) {
        let mut writes = self.writes.lock().unwrap();
        if let Some(current) = writes.current.get_mut(port) {
            *current -= 1;
        }
        writes.total -= 1;
    }

    fn sender(&self, port: &str) -> broadcast::Sender<CanFrame> {
        self.channels
            .lock()
            .unwrap()
            .entry(port.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Delivers a frame to `port`; returns how many subscribers saw it.
    pub fn inject(&self, port: &str, id: u32, data: &[u8]) -> usize {
        self.sender(port).send(CanFrame::new(port, id, data.to_vec())).unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<SentFrame> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn subscribers(&self, port: &str) -> usize {
        self.sender(port).receiver_count()
    }
}

#[async_trait]
impl CanBus for MockBus {
    async fn send_frame(&self, port: &str, id: u32, data: &[u8], extended: bool) -> bool {
        if self.failing.lock().unwrap().contains(port) {
            return false;
        }
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            self.begin_write(port);
            tokio::time::sleep(latency).await;
            self.end_write(port);
        }
        self.calls.lock().unwrap().push(SentFrame {
            port: port.to_string(),
            id,
            data: data.to_vec(),
            extended,
        });
        true
    }

    fn subscribe(&self, port: &str) -> broadcast::Receiver<CanFrame> {
        self.sender(port).subscribe()
    }
}

pub fn executor(bus: &Arc<MockBus>) -> ScriptExecutor {
    ScriptExecutor::new(bus.clone())
}

pub fn executor_with(bus: &Arc<MockBus>, config: ExecutorConfig) -> ScriptExecutor {
    ScriptExecutor::with_config(bus.clone(), config)
}

/// Lets spawned tasks run up to their next suspension.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Polls `check` every 5 ms until it holds or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
