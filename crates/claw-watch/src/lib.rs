//! Scripted search alerting for Clawbernetes.
//!
//! `claw-watch` periodically runs a search query per alert, hands the response
//! to a Starlark condition script and, when the script's verdict is truthy,
//! dispatches the alert's actions.
//!
//! # Features
//!
//! - **Generic results**: search responses become a [`Value`] tree that scripts
//!   read and may rewrite
//! - **Interpreter pool**: a fixed number of isolated interpreters, each
//!   prepared once by an optional init script
//! - **Actions**: log records, HTTP requests and chat webhook messages, run
//!   concurrently with per-action failure reporting
//! - **Scheduling**: one task per alert, cycles never overlap, every cycle is
//!   bounded by a deadline
//!
//! # Example
//!
//! ```rust
//! use claw_watch::{Action, AlertContext, Value};
//! use serde_json::json;
//!
//! let raw = Value::from(json!({"type": "http", "method": "post", "url": "http://hooks.local/x"}));
//! let action = Action::decode(&raw)?;
//! assert_eq!(action.kind(), "http");
//!
//! let context = AlertContext::new("error-spike", 1_700_000_000, Value::map().with("total", 12i64));
//! assert_eq!(context.result().get("total"), Some(&Value::from(12i64)));
//! # Ok::<(), claw_watch::WatchError>(())
//! ```
//!
//! # Running a cycle
//!
//! ```rust,ignore
//! use claw_watch::{
//!     ActionDispatcher, CycleRunner, DispatcherConfig, ElasticsearchClient, InterpreterPool,
//!     PoolConfig, load_alerts_file,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let alerts = load_alerts_file("alerts.yml")?;
//! let search = ElasticsearchClient::new("127.0.0.1:9200", Duration::from_secs(10))?;
//! let pool = InterpreterPool::new(PoolConfig::new(2))?;
//! let dispatcher = ActionDispatcher::new(DispatcherConfig::default())?;
//!
//! let runner = CycleRunner::new(Arc::new(search), pool, dispatcher);
//! let outcome = runner.run_cycle(&alerts[0]).await;
//! println!("matched: {}", outcome.is_match());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod action;
pub mod alert;
pub mod config;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod pool;
pub mod runner;
pub mod script;
pub mod search;
pub mod value;

// Re-export main types at crate root
pub use action::{
    Action, ActionDispatcher, ActionOutcome, DispatchReport, DispatcherConfig, HttpAction,
    LogAction, SlackAction,
};
pub use alert::{AlertDefinition, AlertDefinitionBuilder, load_alerts, load_alerts_file};
pub use config::{InterpreterConfig, WatchConfig};
pub use context::AlertContext;
pub use error::{ActionError, ActionFailure, ActionFailures, Result, WatchError};
pub use evaluator::{Verdict, evaluate, evaluate_script};
pub use pool::{InterpreterHandle, InterpreterPool, PoolConfig};
pub use runner::{CycleOutcome, CycleRunner, Scheduler};
pub use search::{ElasticsearchClient, QuerySpec, SearchBackend};
pub use value::Value;
