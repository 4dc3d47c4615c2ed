use std::path::PathBuf;

use thiserror::Error;

// --- Scheduler Errors ---

/// Errors returned by the [`JobScheduler`](crate::JobScheduler) handle.
///
/// `DuplicateJob` and `UnknownJob` indicate misuse of the scheduler API and are
/// treated as programmer errors by the process entrypoint (fatal at boot).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
  #[error("Job '{0}' is already registered.")]
  DuplicateJob(String),
  #[error("Job '{0}' is not registered.")]
  UnknownJob(String),
  #[error("Invalid schedule for job '{name}': {reason}")]
  InvalidSchedule { name: String, reason: String },
  #[error("Scheduler command channel is closed (coordinator shut down or panicked).")]
  SchedulerShutdown,
  #[error("Scheduler did not respond to the command (coordinator task may have panicked).")]
  ResponseFailed,
}

// --- Storage Errors ---

/// Errors surfaced by a [`Storage`](crate::storage::Storage) implementation.
#[derive(Error, Debug)]
pub enum StorageError {
  #[error("Storage connection is closed.")]
  Closed,
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("Stored data is corrupt: {0}")]
  Corrupt(String),
  #[error("Storage unavailable: {0}")]
  Unavailable(String),
}

// --- Generation Errors ---

/// Errors produced by [`WindowGenerator::generate`](crate::generation::WindowGenerator::generate).
///
/// None of these are fatal: the next scheduled generation run retries any
/// uncovered units idempotently.
#[derive(Error, Debug)]
pub enum GenerationError {
  #[error("Generation window must span at least one week (weeks_ahead = {0}).")]
  InvalidWindow(u32),
  #[error("Failed to read generation inputs: {0}")]
  Storage(#[source] StorageError),
  /// Some units were written before the batch hit a storage error. Written
  /// units are kept; `source` is the first error encountered.
  #[error("Generation batch partially failed after writing {created} session(s): {source}")]
  PartialBatch {
    created: usize,
    #[source]
    source: StorageError,
  },
}

impl GenerationError {
  /// Number of units successfully written before the failure (zero unless `PartialBatch`).
  pub fn created(&self) -> usize {
    match self {
      GenerationError::PartialBatch { created, .. } => *created,
      _ => 0,
    }
  }
}

// --- Configuration Errors ---

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("Invalid configuration: {0}")]
  Invalid(String),
}
