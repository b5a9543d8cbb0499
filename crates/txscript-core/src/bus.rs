//! CAN I/O boundary.
//!
//! The interpreter talks to hardware only through the [`CanBus`] trait:
//! one async write call and one inbound broadcast stream per port. Writes
//! issued by concurrent script tasks are funnelled through a [`PortWriter`],
//! which serializes them per port.
//!
//! [`VirtualBus`] is an in-memory implementation with a sent-frame history,
//! frame injection, optional loopback and per-port failure injection. The
//! CLI runs scripts against it and the tests use it as a fake adapter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::value::hex_bytes;

/// Largest 11-bit identifier.
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest 29-bit identifier.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// CAN FD payload limit.
pub const MAX_PAYLOAD: usize = 64;

/// One CAN message as seen on a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    pub id: u32,
    pub data: Vec<u8>,
    pub extended: bool,
    pub port: String,
    /// Milliseconds on the bus clock.
    pub timestamp: u64,
}

impl CanFrame {
    /// Builds a frame, marking it extended when the id does not fit 11 bits.
    pub fn new(port: impl Into<String>, id: u32, data: Vec<u8>) -> Self {
        Self { id, data, extended: id > MAX_STANDARD_ID, port: port.into(), timestamp: 0 }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.extended {
            write!(f, "{} {:08X} [{}] {}", self.port, self.id, self.dlc(), hex_bytes(&self.data))
        } else {
            write!(f, "{} {:03X} [{}] {}", self.port, self.id, self.dlc(), hex_bytes(&self.data))
        }
    }
}

/// The CAN adapter as seen by the executor.
///
/// Implementors must be cheap to share across tasks; the executor holds an
/// `Arc<dyn CanBus>` for its whole lifetime.
#[async_trait]
pub trait CanBus: Send + Sync {
    /// Writes one frame to `port`. Returns `false` if the adapter rejected it.
    async fn send_frame(&self, port: &str, id: u32, data: &[u8], extended: bool) -> bool;

    /// Inbound frame stream for `port`.
    fn subscribe(&self, port: &str) -> broadcast::Receiver<CanFrame>;
}

/// Serializes writes per port. Writes to distinct ports proceed concurrently.
pub struct PortWriter {
    bus: Arc<dyn CanBus>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PortWriter {
    pub fn new(bus: Arc<dyn CanBus>) -> Self {
        Self { bus, locks: Mutex::new(HashMap::new()) }
    }

    pub fn bus(&self) -> &Arc<dyn CanBus> {
        &self.bus
    }

    async fn port_lock(&self, port: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(port.to_string()).or_default().clone()
    }

    pub async fn write(&self, port: &str, id: u32, data: &[u8], extended: bool) -> bool {
        let lock = self.port_lock(port).await;
        let _guard = lock.lock().await;
        self.bus.send_frame(port, id, data, extended).await
    }
}

impl std::fmt::Debug for PortWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortWriter")
            .field("bus", &"<dyn CanBus>")
            .field("locks", &"<Mutex<HashMap<String, Arc<Mutex<()>>>>>")
            .finish()
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory CAN adapter.
pub struct VirtualBus {
    channels: StdMutex<HashMap<String, broadcast::Sender<CanFrame>>>,
    history: StdMutex<Vec<CanFrame>>,
    failing: StdMutex<HashSet<String>>,
    loopback: AtomicBool,
    capacity: usize,
    started: Instant,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// `capacity` bounds each port's inbound broadcast buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: StdMutex::new(HashMap::new()),
            history: StdMutex::new(Vec::new()),
            failing: StdMutex::new(HashSet::new()),
            loopback: AtomicBool::new(false),
            capacity: capacity.max(1),
            started: Instant::now(),
        }
    }

    /// When enabled, every frame written to a port is also delivered to its
    /// inbound stream.
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Makes every write to `port` fail (or succeed again).
    pub fn fail_port(&self, port: &str, failing: bool) {
        let mut set = lock(&self.failing);
        if failing {
            set.insert(port.to_string());
        } else {
            set.remove(port);
        }
    }

    /// Milliseconds since the bus was created.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn sender(&self, port: &str) -> broadcast::Sender<CanFrame> {
        lock(&self.channels)
            .entry(port.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Delivers `frame` to subscribers of `frame.port`, stamping it with the
    /// bus clock if it carries no timestamp. Returns the number of receivers.
    pub fn inject(&self, mut frame: CanFrame) -> usize {
        if frame.timestamp == 0 {
            frame.timestamp = self.now_ms();
        }
        debug!(port = %frame.port, id = frame.id, "injecting frame");
        // No subscribers is fine: the frame is simply not observed.
        self.sender(&frame.port).send(frame).unwrap_or(0)
    }

    /// Every frame successfully written, in order.
    pub fn sent(&self) -> Vec<CanFrame> {
        lock(&self.history).clone()
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.history).len()
    }

    pub fn clear_history(&self) {
        lock(&self.history).clear();
    }
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VirtualBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualBus")
            .field("sent", &self.sent_count())
            .field("loopback", &self.loopback.load(Ordering::SeqCst))
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[async_trait]
impl CanBus for VirtualBus {
    async fn send_frame(&self, port: &str, id: u32, data: &[u8], extended: bool) -> bool {
        if lock(&self.failing).contains(port) {
            warn!(port, id, "virtual bus rejected write");
            return false;
        }
        let frame = CanFrame {
            id,
            data: data.to_vec(),
            extended,
            port: port.to_string(),
            timestamp: self.now_ms(),
        };
        lock(&self.history).push(frame.clone());
        if self.loopback.load(Ordering::SeqCst) {
            let _ = self.sender(port).send(frame);
        }
        true
    }

    fn subscribe(&self, port: &str) -> broadcast::Receiver<CanFrame> {
        self.sender(port).subscribe()
    }
}
