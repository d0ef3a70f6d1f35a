//! Workflow engine and repository trait definitions for Gatekeep.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, plus everything that runs on top of
//! them: template validation, assignee resolution, the instance state
//! machine, the review protocol, the audit trail and the notification hub.
//! It depends only on `gatekeep-types` -- never on `gatekeep-infra` or any
//! database/IO crate.

pub mod audit;
pub mod directory;
pub mod event;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
