//! streamdl core library
//!
//! Fetches one logical media stream, a progressive file or an HLS playlist,
//! over several parallel HTTP connections and writes it to a strictly
//! sequential output file. Downloads can be paused, resumed and stopped while
//! running and survive a process restart through persisted checkpoints.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Probing, planning, the worker pool, reassembly, HLS and
//!   the session controller and manager built on top of them
//! - [`db`] - SQLite connection and schema management for resume checkpoints

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod db;
pub mod download;
mod user_agent;

// Re-export commonly used types
pub use db::{Database, DbError};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadConfig, DownloadError, DownloadHandle, DownloadJob,
    DownloadManager, DownloadRequest, DownloadSession, DownloadState, DownloadStatus, EngineError,
    FsSink, HttpClient, LinkKind, ManagerStats, MemoryCheckpointStore, ProgressSink,
    ProgressUpdate, RetryPolicy, SqliteCheckpointStore,
};
