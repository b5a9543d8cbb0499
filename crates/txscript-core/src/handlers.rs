//! Background tasks of a run: inbound frame forwarding, `on_receive`
//! dispatch and `on_interval` scheduling.
//!
//! All of them are spawned on the run's [`TaskTracker`](tokio_util::task::TaskTracker)
//! and exit when the run's cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::bus::{CanBus, CanFrame};
use crate::error::{ErrorKind, ScriptError};
use crate::interpreter::{Interrupt, RunContext, Task};

#[derive(Debug, Clone, Copy)]
enum HandlerRef {
    Receive(usize),
    Interval(usize),
}

/// Subscribes to every target port now and forwards inbound frames into the
/// run's frame hub until the run ends. Dropping the receivers on exit
/// releases the run's bus subscriptions.
pub(crate) fn spawn_forwarders(ctx: &Arc<RunContext>, bus: &dyn CanBus) {
    for port in &ctx.ports {
        let mut rx = bus.subscribe(port);
        let hub = ctx.frames.clone();
        let cancel = ctx.control.token().clone();
        let port = port.clone();
        ctx.tracker.spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(frame) => {
                                // No receivers only means nothing is listening.
                                let _ = hub.send(frame);
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(port = %port, skipped, "inbound frames dropped");
                            }
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
                debug!(port = %port, "forwarder exited");
            }
            .instrument(debug_span!("forwarder")),
        );
    }
}

/// Tests every inbound frame against every `on_receive` predicate and spawns
/// one activation per match. Frames arriving while paused are discarded.
pub(crate) fn spawn_dispatcher(ctx: &Arc<RunContext>, mut rx: broadcast::Receiver<CanFrame>) {
    let ctx_task = ctx.clone();
    ctx.tracker.spawn(
        async move {
            let ctx = ctx_task;
            let cancel = ctx.control.token().clone();
            let program = ctx.program.clone();
            let mut matcher = Task::new(ctx.clone());

            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(frame) => frame,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "receive dispatcher fell behind");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                if ctx.control.is_paused() {
                    debug!(id = frame.id, "frame discarded while paused");
                    continue;
                }

                for (index, handler) in program.receive_handlers.iter().enumerate() {
                    match matcher.frame_matches(&handler.predicate, &frame, None).await {
                        Ok(true) => spawn_activation(&ctx, HandlerRef::Receive(index), Some(frame.clone())),
                        Ok(false) => {}
                        Err(_) => return,
                    }
                }
                matcher.yield_turn();
            }
        }
        .instrument(debug_span!("dispatcher")),
    );
}

/// Evaluates each `on_interval` period and ticks it for the rest of the run.
/// Ticks are measured in running time, so none fire while paused.
pub(crate) fn spawn_intervals(ctx: &Arc<RunContext>) {
    for index in 0..ctx.program.interval_handlers.len() {
        let ctx_task = ctx.clone();
        ctx.tracker.spawn(
            async move {
                let ctx = ctx_task;
                let program = ctx.program.clone();
                let Some(handler) = program.interval_handlers.get(index) else {
                    return;
                };

                let mut task = Task::new(ctx.clone());
                let period = match task.eval_detached(&handler.period).await {
                    Ok(value) => value.as_millis().map_err(|e| e.at(handler.period.pos)),
                    Err(Interrupt::Error(e)) => Err(e),
                    Err(Interrupt::Stopped) => return,
                };
                let period = match period {
                    Ok(ms) if ms > 0 => Duration::from_millis(ms),
                    Ok(_) => {
                        ctx.report(ScriptError::runtime(
                            ErrorKind::TypeMismatch,
                            "on_interval period must be positive",
                            handler.pos.line,
                            handler.pos.column,
                        ))
                        .await;
                        return;
                    }
                    Err(e) => {
                        ctx.report(e).await;
                        return;
                    }
                };
                info!(index, period_ms = period.as_millis() as u64, "interval handler registered");

                while ctx.control.sleep(period).await.is_ok() {
                    spawn_activation(&ctx, HandlerRef::Interval(index), None);
                }
            }
            .instrument(debug_span!("interval", index)),
        );
    }
}

fn spawn_activation(ctx: &Arc<RunContext>, handler: HandlerRef, frame: Option<CanFrame>) {
    if ctx.control.is_cancelled() {
        return;
    }
    let ctx_task = ctx.clone();
    ctx.tracker.spawn(
        async move {
            let ctx = ctx_task;
            let program = ctx.program.clone();
            let body = match handler {
                HandlerRef::Receive(i) => program.receive_handlers.get(i).map(|h| &h.body),
                HandlerRef::Interval(i) => program.interval_handlers.get(i).map(|h| &h.body),
            };
            if let Some(body) = body {
                Task::new(ctx.clone()).run_activation(body, frame.as_ref()).await;
            }
        }
        .instrument(debug_span!("handler", ?handler)),
    );
}
