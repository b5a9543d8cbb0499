//! Error and output logs of a run, plus the executor event stream.
//!
//! The error log is append-only: entries are never reordered or removed
//! while a run is live. Once it reaches its capacity further errors are
//! still broadcast, but only counted. `print` output is kept in a ring
//! buffer. Errors may also be persisted as JSON Lines.

use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::ScriptError;
use crate::executor::ExecutionState;

/// Events broadcast to observers of an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutorEvent {
    StateChanged {
        run_id: Option<Uuid>,
        state: ExecutionState,
    },
    Error {
        run_id: Option<Uuid>,
        error: ScriptError,
    },
    Output {
        run_id: Option<Uuid>,
        text: String,
    },
}

/// One line of a persisted error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub run_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub error: ScriptError,
}

pub struct RunLog {
    errors: RwLock<Vec<ScriptError>>,
    dropped: AtomicUsize,
    output: RwLock<VecDeque<String>>,
    event_tx: broadcast::Sender<ExecutorEvent>,
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
    max_errors: usize,
    max_output: usize,
}

impl RunLog {
    pub fn new(max_errors: usize, max_output: usize) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            errors: RwLock::new(Vec::new()),
            dropped: AtomicUsize::new(0),
            output: RwLock::new(VecDeque::with_capacity(max_output.min(1024))),
            event_tx,
            writer: Mutex::new(None),
            max_errors,
            max_output: max_output.max(1),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.event_tx.subscribe()
    }

    /// Appends every subsequent error to `path` as JSON Lines.
    pub async fn persist_to(&self, path: &Path) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        *self.writer.lock().await = Some(BufWriter::new(file));
        Ok(())
    }

    /// Clears both logs for a new run.
    pub async fn reset(&self) {
        self.errors.write().await.clear();
        self.output.write().await.clear();
        self.dropped.store(0, Ordering::SeqCst);
    }

    pub async fn record_error(&self, run_id: Option<Uuid>, error: ScriptError) {
        debug!(
            line = error.line,
            column = error.column,
            phase = %error.phase,
            kind = ?error.kind,
            "{}",
            error.message
        );

        {
            let mut errors = self.errors.write().await;
            if errors.len() < self.max_errors {
                errors.push(error.clone());
            } else {
                self.dropped.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let mut writer_guard = self.writer.lock().await;
            if let Some(ref mut writer) = *writer_guard {
                let record = ErrorRecord { run_id, timestamp: Utc::now(), error: error.clone() };
                if let Ok(json) = serde_json::to_string(&record) {
                    let _ = writeln!(writer, "{}", json);
                    let _ = writer.flush();
                }
            }
        }

        // Ignore send errors - no subscribers is expected
        let _ = self.event_tx.send(ExecutorEvent::Error { run_id, error });
    }

    pub async fn record_errors(&self, run_id: Option<Uuid>, errors: Vec<ScriptError>) {
        for error in errors {
            self.record_error(run_id, error).await;
        }
    }

    pub async fn record_output(&self, run_id: Option<Uuid>, text: String) {
        {
            let mut output = self.output.write().await;
            if output.len() >= self.max_output {
                output.pop_front();
            }
            output.push_back(text.clone());
        }
        let _ = self.event_tx.send(ExecutorEvent::Output { run_id, text });
    }

    pub fn state_changed(&self, run_id: Option<Uuid>, state: ExecutionState) {
        let _ = self.event_tx.send(ExecutorEvent::StateChanged { run_id, state });
    }

    pub async fn errors(&self) -> Vec<ScriptError> {
        self.errors.read().await.clone()
    }

    pub async fn error_count(&self) -> usize {
        self.errors.read().await.len() + self.dropped_errors()
    }

    /// Errors recorded after the log reached capacity.
    pub fn dropped_errors(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub async fn output(&self) -> Vec<String> {
        self.output.read().await.iter().cloned().collect()
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("errors", &"<RwLock<Vec<ScriptError>>>")
            .field("dropped", &self.dropped_errors())
            .field("output", &"<RwLock<VecDeque<String>>>")
            .field("event_tx", &"<broadcast::Sender>")
            .field("writer", &"<Mutex<Option<BufWriter<File>>>>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn err(line: usize) -> ScriptError {
        ScriptError::runtime(ErrorKind::TypeMismatch, "bad operand", line, 1)
    }

    #[tokio::test]
    async fn errors_are_kept_in_order() {
        let log = RunLog::new(10, 10);
        log.record_error(None, err(1)).await;
        log.record_error(None, err(2)).await;
        let lines: Vec<usize> = log.errors().await.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2]);
    }

    #[tokio::test]
    async fn error_log_caps_without_evicting() {
        let log = RunLog::new(2, 10);
        for line in 1..=5 {
            log.record_error(None, err(line)).await;
        }
        let lines: Vec<usize> = log.errors().await.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2]);
        assert_eq!(log.dropped_errors(), 3);
        assert_eq!(log.error_count().await, 5);
    }

    #[tokio::test]
    async fn output_is_a_ring_buffer() {
        let log = RunLog::new(10, 3);
        for i in 0..5 {
            log.record_output(None, i.to_string()).await;
        }
        assert_eq!(log.output().await, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let log = RunLog::new(10, 10);
        let mut rx = log.subscribe();
        log.record_output(None, "hello".into()).await;
        log.record_error(None, err(3)).await;
        assert!(matches!(rx.recv().await.unwrap(), ExecutorEvent::Output { text, .. } if text == "hello"));
        assert!(matches!(rx.recv().await.unwrap(), ExecutorEvent::Error { error, .. } if error.line == 3));
    }

    #[tokio::test]
    async fn persists_json_lines() {
        let path = std::env::temp_dir().join(format!("txscript-errors-{}.jsonl", Uuid::new_v4()));
        let log = RunLog::new(10, 10);
        log.persist_to(&path).await.unwrap();
        log.record_error(None, err(4)).await;
        log.record_error(None, err(5)).await;

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<ErrorRecord> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].error.line, 5);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn reset_clears_logs() {
        let log = RunLog::new(1, 10);
        log.record_error(None, err(1)).await;
        log.record_error(None, err(2)).await;
        log.reset().await;
        assert!(log.errors().await.is_empty());
        assert_eq!(log.dropped_errors(), 0);
    }
}
