//! Data models for dedup

mod account;
mod connection;
mod group;
mod run;

pub use account::{Account, AccountId};
pub use connection::{Connection, ConnectionStatus, RemoteAccount, TokenGrant};
pub use group::{
    AuditAction, CandidateRecord, DuplicateGroup, GroupPage, GroupState, MergeAuditEntry,
    MergeCommand,
};
pub use run::{ProcessRun, RunPhase, RunStatus};
