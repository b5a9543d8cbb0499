//! Tree-walking evaluation of statements and expressions.
//!
//! Every logical thread of a run (the main sequence, each handler
//! activation, the receive dispatcher) is a [`Task`]. Tasks share the
//! global scope through the run's turn mutex: a task holds the turn while
//! it executes statements and gives it up at suspension points (`send`,
//! `delay`, `wait_for`), while paused, and every `yield_every` statements.
//! A statement that does not suspend therefore runs atomically with
//! respect to every other task.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ast::*;
use crate::bus::{CanFrame, PortWriter, MAX_EXTENDED_ID, MAX_PAYLOAD, MAX_STANDARD_ID};
use crate::config::ExecutorConfig;
use crate::control::{RunControl, Stopped};
use crate::environment::{Environment, GlobalScope, ScopeId};
use crate::error::{ErrorKind, ScriptError};
use crate::executor::ExecutionState;
use crate::log::RunLog;
use crate::value::RuntimeValue;

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Why evaluation of a statement ended early.
#[derive(Debug)]
pub(crate) enum Interrupt {
    Error(ScriptError),
    Stopped,
}

impl From<ScriptError> for Interrupt {
    fn from(e: ScriptError) -> Self {
        Interrupt::Error(e)
    }
}

impl From<Stopped> for Interrupt {
    fn from(_: Stopped) -> Self {
        Interrupt::Stopped
    }
}

type Exec<T> = Result<T, Interrupt>;

#[derive(Debug)]
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
    Return(RuntimeValue),
}

fn fail(kind: ErrorKind, message: impl Into<String>, pos: Pos) -> Interrupt {
    Interrupt::Error(ScriptError::runtime(kind, message, pos.line, pos.column))
}

/// Everything the tasks of one run share.
pub(crate) struct RunContext {
    pub run_id: Uuid,
    pub program: Arc<Program>,
    pub globals: Arc<Mutex<GlobalScope>>,
    pub control: RunControl,
    pub writer: Arc<PortWriter>,
    pub ports: Vec<String>,
    pub log: Arc<RunLog>,
    pub config: ExecutorConfig,
    /// Inbound frames from every target port.
    pub frames: broadcast::Sender<CanFrame>,
    pub state: Arc<watch::Sender<ExecutionState>>,
    pub tracker: TaskTracker,
}

impl RunContext {
    pub async fn report(&self, error: ScriptError) {
        self.log.record_error(Some(self.run_id), error).await;
    }

    /// Ends the run from inside: cancels every task and moves a live run to
    /// `STOPPED`. A host `stop()` later returns the executor to `IDLE`.
    pub fn finish(&self) {
        self.control.token().cancel();
        let changed = self.state.send_if_modified(|s| {
            if s.is_active() {
                *s = ExecutionState::Stopped;
                true
            } else {
                false
            }
        });
        if changed {
            info!(run_id = %self.run_id, "run stopped");
            self.log.state_changed(Some(self.run_id), ExecutionState::Stopped);
        }
    }
}

/// Frame fields visible to predicates and handler bodies.
fn frame_bindings(frame: &CanFrame) -> [(&'static str, RuntimeValue); 6] {
    [
        ("id", RuntimeValue::Int(i64::from(frame.id))),
        ("data", RuntimeValue::Bytes(frame.data.clone())),
        ("ext", RuntimeValue::Bool(frame.extended)),
        ("dlc", RuntimeValue::Int(frame.dlc() as i64)),
        ("port", RuntimeValue::String(frame.port.clone())),
        ("timestamp", RuntimeValue::Int(i64::try_from(frame.timestamp).unwrap_or(i64::MAX))),
    ]
}

const BUILTINS: &[&str] = &["stop", "len", "hex", "str", "int", "float", "now"];

pub(crate) struct Task {
    ctx: Arc<RunContext>,
    env: Environment,
    turn: Option<OwnedMutexGuard<GlobalScope>>,
    call_depth: usize,
    since_yield: usize,
}

impl Task {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx, env: Environment::new(), turn: None, call_depth: 0, since_yield: 0 }
    }

    // ── Turn handling ─────────────────────────────────────────────────────

    async fn acquire(&mut self) -> Exec<()> {
        if self.turn.is_none() {
            let globals = self.ctx.globals.clone();
            let cancel = self.ctx.control.token().clone();
            tokio::select! {
                guard = globals.lock_owned() => self.turn = Some(guard),
                _ = cancel.cancelled() => return Err(Interrupt::Stopped),
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.turn = None;
    }

    /// Local scopes plus the global scope. The turn is held whenever a
    /// statement is executing; a missing turn means the run is shutting down.
    fn vars(&mut self) -> Exec<(&mut Environment, &mut GlobalScope)> {
        match self.turn.as_deref_mut() {
            Some(globals) => Ok((&mut self.env, globals)),
            None => Err(Interrupt::Stopped),
        }
    }

    /// Runs before every statement and loop iteration.
    async fn checkpoint(&mut self) -> Exec<()> {
        if self.ctx.control.is_cancelled() {
            return Err(Interrupt::Stopped);
        }
        if self.ctx.control.is_paused() {
            self.release();
            self.ctx.control.wait_while_paused().await?;
        }
        self.since_yield += 1;
        if self.since_yield >= self.ctx.config.yield_every.max(1) {
            self.since_yield = 0;
            self.release();
            tokio::task::yield_now().await;
        }
        self.acquire().await
    }

    // ── Entry points ──────────────────────────────────────────────────────

    /// Runs the top-level statements. A runtime error abandons the
    /// top-level statement that raised it; the next one still runs.
    pub async fn run_main(&mut self) -> Result<(), Stopped> {
        let program = self.ctx.program.clone();
        for stmt in &program.statements {
            let result = match self.checkpoint().await {
                Ok(()) => self.exec_statement(stmt, None).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => {}
                Err(Interrupt::Error(e)) => self.ctx.report(e).await,
                Err(Interrupt::Stopped) => {
                    self.release();
                    return Err(Stopped);
                }
            }
        }
        self.release();
        Ok(())
    }

    /// Runs one handler activation. An error abandons only this activation.
    pub async fn run_activation(&mut self, body: &[Statement], frame: Option<&CanFrame>) {
        let outcome = self.activation(body, frame).await;
        self.release();
        if let Err(Interrupt::Error(e)) = outcome {
            self.ctx.report(e).await;
        }
    }

    async fn activation(&mut self, body: &[Statement], frame: Option<&CanFrame>) -> Exec<()> {
        self.acquire().await?;
        let scope = self.env.push_scope(None);
        let mut result = match frame {
            Some(frame) => self.bind_frame(Some(scope), frame),
            None => Ok(()),
        };
        if result.is_ok() {
            result = self.exec_statements(body, Some(scope)).await.map(|_| ());
        }
        self.env.pop_scope(scope);
        result
    }

    /// Tests `predicate` against `frame` with the frame fields in scope.
    /// A failing predicate is recorded and counts as no match.
    pub async fn frame_matches(
        &mut self,
        predicate: &Expression,
        frame: &CanFrame,
        scope: Option<ScopeId>,
    ) -> Result<bool, Stopped> {
        if self.acquire().await.is_err() {
            return Err(Stopped);
        }
        let frame_scope = self.env.push_scope(scope);
        let result = match self.bind_frame(Some(frame_scope), frame) {
            Ok(()) => self.eval(predicate, Some(frame_scope)).await,
            Err(e) => Err(e),
        };
        self.env.pop_scope(frame_scope);
        match result {
            Ok(v) => Ok(v.is_truthy()),
            Err(Interrupt::Error(e)) => {
                self.ctx.report(e).await;
                Ok(false)
            }
            Err(Interrupt::Stopped) => Err(Stopped),
        }
    }

    pub fn yield_turn(&mut self) {
        self.release();
    }

    /// Evaluates an expression outside of any statement (handler registration).
    pub async fn eval_detached(&mut self, expr: &Expression) -> Result<RuntimeValue, Interrupt> {
        self.acquire().await?;
        let result = self.eval(expr, None).await;
        self.release();
        result
    }

    fn bind_frame(&mut self, scope: Option<ScopeId>, frame: &CanFrame) -> Exec<()> {
        let (env, globals) = self.vars()?;
        for (name, value) in frame_bindings(frame) {
            env.define(scope, name, value, globals);
        }
        Ok(())
    }

    // ── Statements ────────────────────────────────────────────────────────

    fn exec_statements<'a>(
        &'a mut self,
        stmts: &'a [Statement],
        scope: Option<ScopeId>,
    ) -> BoxFuture<'a, Exec<Flow>> {
        Box::pin(async move {
            for stmt in stmts {
                self.checkpoint().await?;
                match self.exec_statement(stmt, scope).await? {
                    Flow::Normal => {}
                    flow => return Ok(flow),
                }
            }
            Ok(Flow::Normal)
        })
    }

    /// Runs `body` in a fresh block scope nested in `scope`.
    async fn exec_block(&mut self, body: &[Statement], scope: Option<ScopeId>) -> Exec<Flow> {
        let block = self.env.push_scope(scope);
        let result = self.exec_statements(body, Some(block)).await;
        self.env.pop_scope(block);
        result
    }

    fn exec_statement<'a>(
        &'a mut self,
        stmt: &'a Statement,
        scope: Option<ScopeId>,
    ) -> BoxFuture<'a, Exec<Flow>> {
        Box::pin(async move {
            let pos = stmt.pos;
            match &stmt.kind {
                StatementKind::VarDecl { name, value } => {
                    let value = match value {
                        Some(expr) => self.eval(expr, scope).await?,
                        None => RuntimeValue::Void,
                    };
                    let (env, globals) = self.vars()?;
                    env.define(scope, name, value, globals);
                    Ok(Flow::Normal)
                }
                StatementKind::Assign { name, op, value } => {
                    self.exec_assign(name, *op, value, pos, scope).await?;
                    Ok(Flow::Normal)
                }
                StatementKind::Send { id, data, extended } => {
                    self.exec_send(id, data, extended.as_ref(), pos, scope).await?;
                    Ok(Flow::Normal)
                }
                StatementKind::Delay(expr) => {
                    let ms = self.eval(expr, scope).await?.as_millis().map_err(|e| e.at(expr.pos))?;
                    debug!(line = pos.line, ms, "delay");
                    self.release();
                    self.ctx.control.sleep(Duration::from_millis(ms)).await?;
                    self.acquire().await?;
                    Ok(Flow::Normal)
                }
                StatementKind::Repeat { count, body } => {
                    let n = self.eval(count, scope).await?.as_int().map_err(|e| e.at(count.pos))?;
                    for i in 0..n.max(0) {
                        if i > 0 {
                            self.checkpoint().await?;
                        }
                        match self.exec_block(body, scope).await? {
                            Flow::Break => break,
                            Flow::Normal | Flow::Continue => {}
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                    }
                    Ok(Flow::Normal)
                }
                StatementKind::Loop { body } => {
                    let mut first = true;
                    loop {
                        if !first {
                            self.checkpoint().await?;
                        }
                        first = false;
                        match self.exec_block(body, scope).await? {
                            Flow::Break => break,
                            Flow::Normal | Flow::Continue => {}
                            flow @ Flow::Return(_) => return Ok(flow),
                        }
                    }
                    Ok(Flow::Normal)
                }
                StatementKind::If { condition, then_block, else_block } => {
                    if self.eval(condition, scope).await?.is_truthy() {
                        self.exec_block(then_block, scope).await
                    } else if let Some(else_block) = else_block {
                        self.exec_block(else_block, scope).await
                    } else {
                        Ok(Flow::Normal)
                    }
                }
                StatementKind::WaitFor { predicate, timeout, fallback } => {
                    self.exec_wait_for(predicate, timeout, fallback.as_deref(), pos, scope).await
                }
                // Hoisted by the parser.
                StatementKind::FunctionDecl(_) => Ok(Flow::Normal),
                StatementKind::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval(expr, scope).await?,
                        None => RuntimeValue::Void,
                    };
                    Ok(Flow::Return(value))
                }
                StatementKind::Break => Ok(Flow::Break),
                StatementKind::Continue => Ok(Flow::Continue),
                StatementKind::Print(expr) => {
                    let text = self.eval(expr, scope).await?.to_string();
                    info!(line = pos.line, output = %text, "print");
                    self.ctx.log.record_output(Some(self.ctx.run_id), text).await;
                    Ok(Flow::Normal)
                }
                StatementKind::Expr(expr) => {
                    self.eval(expr, scope).await?;
                    Ok(Flow::Normal)
                }
            }
        })
    }

    async fn exec_assign(
        &mut self,
        name: &str,
        op: AssignOp,
        value: &Expression,
        pos: Pos,
        scope: Option<ScopeId>,
    ) -> Exec<()> {
        let mut value = self.eval(value, scope).await?;
        let (env, globals) = self.vars()?;

        if let Some(binary) = op.binary() {
            let current = env
                .lookup(scope, name, globals)
                .ok_or_else(|| fail(ErrorKind::UndefinedIdentifier, format!("Undefined variable '{}'", name), pos))?;
            value = RuntimeValue::binary(binary, &current, &value).map_err(|e| e.at(pos))?;
        }

        if !env.assign(scope, name, value.clone(), globals) {
            debug!(line = pos.line, name, "assignment defines new global");
            globals.define(name, value);
        }
        Ok(())
    }

    async fn exec_send(
        &mut self,
        id: &Expression,
        data: &[Expression],
        extended: Option<&Expression>,
        pos: Pos,
        scope: Option<ScopeId>,
    ) -> Exec<()> {
        let raw_id = self.eval(id, scope).await?.as_int().map_err(|e| e.at(id.pos))?;
        let can_id = u32::try_from(raw_id)
            .ok()
            .filter(|v| *v <= MAX_EXTENDED_ID)
            .ok_or_else(|| fail(ErrorKind::InvalidFrame, format!("CAN id {} is out of range", raw_id), id.pos))?;

        let mut payload = Vec::new();
        for expr in data {
            let value = self.eval(expr, scope).await?;
            value.extend_payload(&mut payload).map_err(|e| e.at(expr.pos))?;
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(fail(
                ErrorKind::InvalidFrame,
                format!("Payload of {} bytes exceeds {} bytes", payload.len(), MAX_PAYLOAD),
                pos,
            ));
        }

        let forced = match extended {
            Some(expr) => self.eval(expr, scope).await?.is_truthy(),
            None => false,
        };
        let ext = forced || can_id > MAX_STANDARD_ID;

        self.release();
        let ctx = self.ctx.clone();
        let cancel = ctx.control.token().clone();
        for port in &ctx.ports {
            let ok = tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupt::Stopped),
                ok = ctx.writer.write(port, can_id, &payload, ext) => ok,
            };
            if ok {
                info!(line = pos.line, port = %port, id = can_id, len = payload.len(), "frame sent");
            } else {
                warn!(line = pos.line, port = %port, id = can_id, "frame write failed");
                ctx.report(ScriptError::runtime(
                    ErrorKind::WriteFailed,
                    format!("Write of id 0x{:X} to port {} failed", can_id, port),
                    pos.line,
                    pos.column,
                ))
                .await;
            }
        }
        self.acquire().await
    }

    async fn exec_wait_for(
        &mut self,
        predicate: &Expression,
        timeout: &Expression,
        fallback: Option<&[Statement]>,
        pos: Pos,
        scope: Option<ScopeId>,
    ) -> Exec<Flow> {
        let timeout_ms = self.eval(timeout, scope).await?.as_millis().map_err(|e| e.at(timeout.pos))?;
        let ctx = self.ctx.clone();
        let cancel = ctx.control.token().clone();
        // Only frames arriving from now on are considered.
        let mut rx = ctx.frames.subscribe();
        let mut deadline = Instant::now() + Duration::from_millis(timeout_ms);
        self.release();
        debug!(line = pos.line, timeout_ms, "waiting for frame");

        loop {
            // Paused time pushes the deadline out; everything else counts.
            let held = Instant::now();
            ctx.control.wait_while_paused().await?;
            deadline += held.elapsed();

            let received = tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupt::Stopped),
                _ = tokio::time::sleep_until(deadline) => None,
                _ = ctx.control.paused() => continue,
                r = rx.recv() => Some(r),
            };

            match received {
                None => break,
                Some(Ok(frame)) => {
                    if self.frame_matches(predicate, &frame, scope).await? {
                        self.bind_frame(scope, &frame)?;
                        info!(line = pos.line, id = frame.id, port = %frame.port, "wait_for matched");
                        return Ok(Flow::Normal);
                    }
                    self.release();
                }
                Some(Err(RecvError::Lagged(skipped))) => {
                    warn!(line = pos.line, skipped, "wait_for fell behind inbound traffic");
                }
                Some(Err(RecvError::Closed)) => {
                    ctx.control.sleep(deadline.saturating_duration_since(Instant::now())).await?;
                    break;
                }
            }
        }

        self.acquire().await?;
        match fallback {
            Some(body) => {
                debug!(line = pos.line, "wait_for timed out, running fallback");
                self.exec_block(body, scope).await
            }
            None => {
                ctx.report(ScriptError::runtime(
                    ErrorKind::Timeout,
                    format!("wait_for timed out after {} ms", timeout_ms),
                    pos.line,
                    pos.column,
                ))
                .await;
                Ok(Flow::Normal)
            }
        }
    }

    // ── Expressions ───────────────────────────────────────────────────────

    fn eval<'a>(&'a mut self, expr: &'a Expression, scope: Option<ScopeId>) -> BoxFuture<'a, Exec<RuntimeValue>> {
        Box::pin(async move {
            let pos = expr.pos;
            match &expr.kind {
                ExprKind::Literal(lit) => Ok(match lit {
                    Literal::Int(n) | Literal::Millis(n) => RuntimeValue::Int(*n),
                    Literal::Float(f) => RuntimeValue::Float(*f),
                    Literal::Bool(b) => RuntimeValue::Bool(*b),
                    Literal::String(s) => RuntimeValue::String(s.clone()),
                }),
                ExprKind::Identifier(name) => {
                    let (env, globals) = self.vars()?;
                    env.lookup(scope, name, globals)
                        .ok_or_else(|| fail(ErrorKind::UndefinedIdentifier, format!("Undefined variable '{}'", name), pos))
                }
                ExprKind::Binary { op: BinaryOp::And, left, right } => {
                    if !self.eval(left, scope).await?.is_truthy() {
                        return Ok(RuntimeValue::Bool(false));
                    }
                    Ok(RuntimeValue::Bool(self.eval(right, scope).await?.is_truthy()))
                }
                ExprKind::Binary { op: BinaryOp::Or, left, right } => {
                    if self.eval(left, scope).await?.is_truthy() {
                        return Ok(RuntimeValue::Bool(true));
                    }
                    Ok(RuntimeValue::Bool(self.eval(right, scope).await?.is_truthy()))
                }
                ExprKind::Binary { op, left, right } => {
                    let l = self.eval(left, scope).await?;
                    let r = self.eval(right, scope).await?;
                    RuntimeValue::binary(*op, &l, &r).map_err(|e| e.at(pos).into())
                }
                ExprKind::Unary { op, operand } => {
                    let v = self.eval(operand, scope).await?;
                    RuntimeValue::unary(*op, &v).map_err(|e| e.at(pos).into())
                }
                ExprKind::Ternary { condition, then_branch, else_branch } => {
                    if self.eval(condition, scope).await?.is_truthy() {
                        self.eval(then_branch, scope).await
                    } else {
                        self.eval(else_branch, scope).await
                    }
                }
                ExprKind::Call { callee, args } => self.eval_call(callee, args, pos, scope).await,
                ExprKind::RandomCall { min, max } => {
                    let lo = self.eval(min, scope).await?;
                    let hi = self.eval(max, scope).await?;
                    random_between(&lo, &hi, pos)
                }
                ExprKind::RandomBytesCall { len } => {
                    let n = self.eval(len, scope).await?.as_int().map_err(|e| e.at(len.pos))?;
                    let n = usize::try_from(n).ok().filter(|n| *n <= MAX_PAYLOAD).ok_or_else(|| {
                        fail(ErrorKind::InvalidFrame, format!("random_bytes length {} must be 0..={}", n, MAX_PAYLOAD), pos)
                    })?;
                    let mut bytes = vec![0u8; n];
                    rand::thread_rng().fill(&mut bytes[..]);
                    Ok(RuntimeValue::Bytes(bytes))
                }
                ExprKind::Index { target, index } => {
                    let t = self.eval(target, scope).await?;
                    let i = self.eval(index, scope).await?;
                    t.index(&i).map_err(|e| e.at(pos).into())
                }
                ExprKind::Member { target, field } => {
                    let t = self.eval(target, scope).await?;
                    t.member(field).map_err(|e| e.at(pos).into())
                }
                ExprKind::ByteList(items) => {
                    let mut bytes = Vec::with_capacity(items.len());
                    for item in items {
                        let v = self.eval(item, scope).await?;
                        v.extend_payload(&mut bytes).map_err(|e| e.at(item.pos))?;
                    }
                    Ok(RuntimeValue::Bytes(bytes))
                }
            }
        })
    }

    async fn eval_call(
        &mut self,
        callee: &Expression,
        args: &[Expression],
        pos: Pos,
        scope: Option<ScopeId>,
    ) -> Exec<RuntimeValue> {
        let name = match &callee.kind {
            ExprKind::Identifier(name) => name.as_str(),
            _ => return Err(fail(ErrorKind::NotCallable, "Expression is not callable", pos)),
        };

        let program = self.ctx.program.clone();
        let function = program.function(name);
        if function.is_none() && !BUILTINS.contains(&name) {
            let (env, globals) = self.vars()?;
            let message = match env.lookup(scope, name, globals) {
                Some(v) => format!("'{}' is a {}, not a function", name, v.type_name()),
                None => format!("Unknown function '{}'", name),
            };
            return Err(fail(ErrorKind::NotCallable, message, pos));
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg, scope).await?);
        }

        match function {
            Some(decl) => self.call_function(decl, values, pos).await,
            None => self.call_builtin(name, values, pos),
        }
    }

    async fn call_function(&mut self, decl: &FunctionDecl, args: Vec<RuntimeValue>, pos: Pos) -> Exec<RuntimeValue> {
        if args.len() != decl.params.len() {
            return Err(fail(
                ErrorKind::ArityMismatch,
                format!("Function '{}' expects {} argument(s), got {}", decl.name, decl.params.len(), args.len()),
                pos,
            ));
        }
        if self.call_depth >= self.ctx.config.max_call_depth {
            return Err(fail(
                ErrorKind::CallDepthExceeded,
                format!("Maximum call depth of {} exceeded in '{}'", self.ctx.config.max_call_depth, decl.name),
                pos,
            ));
        }

        // Function scopes chain to the global scope, not to the caller.
        let frame = self.env.push_scope(None);
        {
            let (env, globals) = self.vars()?;
            for (param, value) in decl.params.iter().zip(args) {
                env.define(Some(frame), param, value, globals);
            }
        }
        self.call_depth += 1;
        let result = self.exec_statements(&decl.body, Some(frame)).await;
        self.call_depth -= 1;
        self.env.pop_scope(frame);

        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(RuntimeValue::Void),
        }
    }

    fn call_builtin(&mut self, name: &str, args: Vec<RuntimeValue>, pos: Pos) -> Exec<RuntimeValue> {
        let expected = if matches!(name, "stop" | "now") { 0 } else { 1 };
        if args.len() != expected {
            return Err(fail(
                ErrorKind::ArityMismatch,
                format!("{}() expects {} argument(s), got {}", name, expected, args.len()),
                pos,
            ));
        }
        let arg = args.into_iter().next().unwrap_or(RuntimeValue::Void);
        let result = match name {
            "stop" => {
                info!(line = pos.line, "stop() called by script");
                self.ctx.finish();
                return Err(Interrupt::Stopped);
            }
            "now" => Ok(RuntimeValue::Int(self.ctx.control.elapsed_ms() as i64)),
            "len" => arg.len().map(|n| RuntimeValue::Int(n as i64)),
            "hex" => arg.to_hex(),
            "str" => Ok(RuntimeValue::String(arg.to_string())),
            "int" => arg.to_int(),
            "float" => arg.to_float(),
            _ => return Err(fail(ErrorKind::NotCallable, format!("Unknown function '{}'", name), pos)),
        };
        result.map_err(|e| e.at(pos).into())
    }
}

fn random_between(lo: &RuntimeValue, hi: &RuntimeValue, pos: Pos) -> Exec<RuntimeValue> {
    match (lo, hi) {
        (RuntimeValue::Int(a), RuntimeValue::Int(b)) if a <= b => {
            Ok(RuntimeValue::Int(rand::thread_rng().gen_range(*a..=*b)))
        }
        (RuntimeValue::Int(_) | RuntimeValue::Float(_), RuntimeValue::Int(_) | RuntimeValue::Float(_)) => {
            let (a, b) = (as_f64(lo), as_f64(hi));
            if a > b || !a.is_finite() || !b.is_finite() {
                return Err(fail(ErrorKind::TypeMismatch, format!("random({}, {}): min exceeds max", lo, hi), pos));
            }
            if a == b {
                return Ok(RuntimeValue::Float(a));
            }
            Ok(RuntimeValue::Float(rand::thread_rng().gen_range(a..b)))
        }
        _ => Err(fail(
            ErrorKind::TypeMismatch,
            format!("random() expects numbers, got {} and {}", lo.type_name(), hi.type_name()),
            pos,
        )),
    }
}

fn as_f64(v: &RuntimeValue) -> f64 {
    match v {
        RuntimeValue::Int(n) => *n as f64,
        RuntimeValue::Float(f) => *f,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(frame: &CanFrame, name: &str) -> RuntimeValue {
        frame_bindings(frame).into_iter().find(|(n, _)| *n == name).map(|(_, v)| v).unwrap()
    }

    #[test]
    fn frame_bindings_expose_every_field() {
        let mut frame = CanFrame::new("can1", 0x7E8, vec![0x04, 0x41]);
        frame.timestamp = 1234;
        assert_eq!(binding(&frame, "id"), RuntimeValue::Int(0x7E8));
        assert_eq!(binding(&frame, "data"), RuntimeValue::Bytes(vec![0x04, 0x41]));
        assert_eq!(binding(&frame, "dlc"), RuntimeValue::Int(2));
        assert_eq!(binding(&frame, "port"), RuntimeValue::String("can1".into()));
        assert_eq!(binding(&frame, "timestamp"), RuntimeValue::Int(1234));
    }

    #[test]
    fn huge_timestamp_saturates() {
        let mut frame = CanFrame::new("can0", 0x1, vec![]);
        frame.timestamp = u64::MAX;
        assert_eq!(binding(&frame, "timestamp"), RuntimeValue::Int(i64::MAX));
    }
}
