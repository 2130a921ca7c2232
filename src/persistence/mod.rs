//! Persisted state (spec §6): CSV-backed model entities, append-only
//! session history, and the admin audit log.

pub mod audit;
pub mod csv_store;
pub mod sessions_history;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: std::io::Error },
    #[error("malformed row in {path}: {source}")]
    Csv { path: String, source: csv::Error },
    #[error("malformed schedule in {path}: {source}")]
    Schedule { path: String, source: crate::domain::schedule::ScheduleError },
}
