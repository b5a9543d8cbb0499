//! # txscript-core
//!
//! Lexer, parser and concurrent interpreter for TxScript, a small scripting
//! language for driving CAN-bus test sessions.
//!
//! A script sends frames, waits for responses, reacts to inbound traffic
//! with `on_receive` handlers and runs periodic work with `on_interval`
//! handlers. Diagnostics from every stage are collected rather than raised,
//! so one run reports every problem it finds.
//!
//! ## Modules
//!
//! - [`lexer`] - Source text to tokens, with lexical diagnostics
//! - [`parser`] - Tokens to [`ast::Program`], with per-statement error recovery
//! - [`ast`] - Syntax tree types
//! - [`value`] - Runtime values and their operators
//! - [`environment`] - Lexically nested variable scopes
//! - [`executor`] - Host control surface: start, pause, resume, stop
//! - [`bus`] - The [`bus::CanBus`] adapter trait and an in-memory [`bus::VirtualBus`]
//! - [`control`] - Pausable, cancellable waiting shared by a run's tasks
//! - [`log`] - Error log, `print` output and the executor event stream
//! - [`trace`] - Parsing and replaying recorded CAN traces
//! - [`config`] - Executor limits and persisted settings
//! - [`error`] - Diagnostics and host API errors
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txscript_core::bus::VirtualBus;
//! use txscript_core::executor::{ExecutionState, ScriptExecutor};
//!
//! # async fn demo() {
//! let bus = Arc::new(VirtualBus::new());
//! let executor = ScriptExecutor::new(bus.clone());
//!
//! let source = r#"
//!     send(0x7DF, 0x02, 0x01, 0x0C)
//!     wait_for(id == 0x7E8) timeout(500) { print "no response" }
//! "#;
//! executor.start(source, &["can0"]).await.expect("script rejected");
//! assert_eq!(executor.wait_until_settled().await, ExecutionState::Stopped);
//!
//! for error in executor.errors().await {
//!     eprintln!("{}", error);
//! }
//! executor.stop().await.unwrap();
//! # }
//! ```

pub mod ast;
pub mod bus;
pub mod config;
pub mod control;
pub mod environment;
pub mod error;
pub mod executor;
mod handlers;
mod interpreter;
pub mod lexer;
pub mod log;
pub mod parser;
pub mod trace;
pub mod value;

pub use error::{ErrorKind, ExecutorError, Phase, ScriptError};
pub use executor::{ExecutionState, ScriptExecutor};
pub use value::RuntimeValue;
