//! Pause and cancellation plumbing shared by every task of a run.
//!
//! A [`RunControl`] observes the executor's state channel and the run's
//! cancellation token. Its [`sleep`](RunControl::sleep) only counts time
//! spent `RUNNING`: a pause freezes the remaining budget and a resume
//! continues from where it stopped.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::executor::ExecutionState;

/// The run was cancelled while a task was waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

#[derive(Debug, Clone)]
pub struct RunControl {
    state: watch::Receiver<ExecutionState>,
    cancel: CancellationToken,
    started: Instant,
}

impl RunControl {
    pub fn new(state: watch::Receiver<ExecutionState>, cancel: CancellationToken) -> Self {
        Self { state, cancel, started: Instant::now() }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.state.borrow() == ExecutionState::Paused
    }

    /// Milliseconds since the run started, pauses included.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Resolves once the executor enters `PAUSED`.
    pub async fn paused(&self) {
        let mut rx = self.state.clone();
        if rx.wait_for(|s| *s == ExecutionState::Paused).await.is_err() {
            // Executor dropped; only cancellation can end the wait now.
            std::future::pending::<()>().await;
        }
    }

    /// Returns immediately unless paused, otherwise waits for resume.
    pub async fn wait_while_paused(&self) -> Result<(), Stopped> {
        if self.is_cancelled() {
            return Err(Stopped);
        }
        if !self.is_paused() {
            return Ok(());
        }
        let mut rx = self.state.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Stopped),
            res = rx.wait_for(|s| *s != ExecutionState::Paused) => match res {
                Ok(_) if !self.is_cancelled() => Ok(()),
                _ => Err(Stopped),
            },
        }
    }

    /// Sleeps for `duration` of running time.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Stopped> {
        let mut remaining = duration;
        loop {
            self.wait_while_paused().await?;
            let segment = Instant::now();
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stopped),
                _ = tokio::time::sleep(remaining) => return Ok(()),
                _ = self.paused() => {
                    remaining = remaining.saturating_sub(segment.elapsed());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> (watch::Sender<ExecutionState>, RunControl, CancellationToken) {
        let (tx, rx) = watch::channel(ExecutionState::Running);
        let cancel = CancellationToken::new();
        (tx, RunControl::new(rx, cancel.clone()), cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_full_duration() {
        let (_tx, control, _cancel) = control();
        let start = Instant::now();
        control.sleep(Duration::from_millis(300)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(310));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_excludes_paused_time() {
        let (tx, control, _cancel) = control();
        let start = Instant::now();

        let sleeper = tokio::spawn({
            let control = control.clone();
            async move { control.sleep(Duration::from_millis(1000)).await }
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send_replace(ExecutionState::Paused);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        tx.send_replace(ExecutionState::Running);

        sleeper.await.unwrap().unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3050), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_sleep() {
        let (_tx, control, cancel) = control();
        let sleeper = tokio::spawn({
            let control = control.clone();
            async move { control.sleep(Duration::from_secs(60)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(sleeper.await.unwrap(), Err(Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pause() {
        let (tx, control, cancel) = control();
        tx.send_replace(ExecutionState::Paused);
        let waiter = tokio::spawn({
            let control = control.clone();
            async move { control.wait_while_paused().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert_eq!(waiter.await.unwrap(), Err(Stopped));
    }
}
