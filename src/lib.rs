//! Tether: stateful orchestration core for a long-running bot process.
//!
//! The crate owns a small amount of volatile runtime state and keeps it
//! durable without making every mutation pay for I/O:
//!
//! - **State store**: typed categories behind one lock, flushed to a JSON
//!   file after a quiet window ([`state`])
//! - **Scheduler**: staggered fixed-delay jobs with per-tick failure
//!   isolation ([`scheduler`])
//! - **Ingestion**: a `GET` trigger endpoint that drives a workflow
//!   ([`ingest`])
//!
//! [`runtime::BotRuntime`] wires them together around one shutdown token.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod feed;
pub mod ingest;
pub mod notify;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod workflow;

pub use config::BotConfig;
pub use error::{BotError, PersistenceError, Result};
pub use events::{BotEvent, EventOutcome, apply_event};
pub use ingest::IngestionListener;
pub use runtime::BotRuntime;
pub use scheduler::{RecurringTask, TaskHandle};
pub use state::RuntimeStateStore;
