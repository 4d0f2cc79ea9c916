//! Durable storage layer for remark
//!
//! SQLite-backed outbox that survives process termination:
//! - `comments`: pending/sent comment events (the outbox)
//! - `actor`: a single cached identity record for the current actor
//!
//! Schema migrations self-heal a partially initialized store.

pub mod repo;
pub mod schema;

pub use repo::Store;
