//! Services shared by every client of the core

mod database;

pub use database::DatabaseService;
