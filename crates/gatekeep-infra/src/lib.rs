//! Infrastructure layer for Gatekeep.
//!
//! Contains implementations of the traits defined in `gatekeep-core`:
//! SQLite storage for workflows, the audit log and the identity directory,
//! the `config.toml` loader, and a logging notifier.

pub mod config;
pub mod notifier;
pub mod sqlite;
