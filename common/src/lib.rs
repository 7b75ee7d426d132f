//! Serial sensor ingest: reads comma-separated readings from a board, keeps
//! them in an append-only CSV log and mirrors that log to remote storage.

pub mod config;
pub mod credentials;
mod csvlog;
mod error;
pub mod ingest;
pub mod remote;
pub mod serial;

pub use config::LoggerConfig;
pub use csvlog::CsvLog;
pub use error::{Error, Result};
pub use ingest::{IngestLoop, IngestOptions, IngestReport, StopReason, StopSignal};
pub use serial::SerialLink;

pub use sensorlog_model as model;
