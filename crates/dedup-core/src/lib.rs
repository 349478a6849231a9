//! dedup-core - Core library for dedup
//!
//! This crate contains the models, database layer, CRM connection lifecycle,
//! and duplicate-group merge state machine used by the dedup API.

pub mod connection;
pub mod crm;
pub mod db;
pub mod error;
pub mod export;
pub mod locks;
pub mod merge;
pub mod models;
pub mod services;
pub mod status;
pub mod util;

#[cfg(test)]
mod test_support;

pub use connection::{ConnectionManager, LifecycleConfig, OAuthSettings};
pub use error::{Error, Result};
pub use merge::{MergeConfig, MergeEngine, PlanGate, UnlimitedPlan};
pub use models::{AccountId, CandidateRecord, DuplicateGroup, MergeCommand, RunPhase};
pub use services::DatabaseService;
pub use status::StatusTracker;
