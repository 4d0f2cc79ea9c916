//! # remark-core
//!
//! Core library for remark - a comment-event capture and delivery pipeline.
//!
//! This library provides:
//! - Domain types for comment events and actor identity
//! - A durable SQLite-backed outbox that survives process termination
//! - A view-log watcher that turns document mutations into admitted events
//! - A delivery engine draining the outbox with capped exponential backoff
//! - A cross-process relay for daily counts and identity queries
//!
//! ## Architecture
//!
//! Events flow detect → dedup → persist → deliver → sweep:
//! the watcher admits candidates into the outbox, the delivery engine
//! drains them strictly FIFO to the remote collector, and the relay
//! carries the resulting daily count to every interested process.
//!
//! ## Example
//!
//! ```rust,no_run
//! use remark_core::{Config, Store};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open the outbox
//! let store = Store::open(&Config::database_path()).expect("failed to open outbox");
//! store.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use store::Store;
pub use types::{ActorIdentity, CommentEvent, Fragment, StoredComment};

// Public modules
pub mod capture;
pub mod config;
pub mod delivery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod relay;
pub mod store;
pub mod types;
