//! Shared domain types for Gatekeep.
//!
//! This crate contains the domain model of the approval engine: workflow
//! templates, running instances, step executions, approval requests, the
//! real-time event vocabulary, audit entries, and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod audit;
pub mod config;
pub mod entity;
pub mod error;
pub mod event;
pub mod identity;
pub mod ids;
pub mod instance;
pub mod template;
