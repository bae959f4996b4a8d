//! Error type shared by every subsystem
//!
//! The coordinator never lets one of these escape its loop; they are logged
//! and turned into status messages at the point of failure.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("Empty response")]
    EmptyResponse,

    #[error("No response within {0} ms")]
    RequestTimeout(u64),

    #[error("Transfer stalled for {0} ms")]
    Stalled(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid version date: {0:?}")]
    InvalidVersion(String),

    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("External command failed: {0}")]
    Process(String),

    #[error("{0} belongs to an installed library")]
    Protected(String),

    #[error("Path leaves the workspace: {0}")]
    OutsideWorkspace(String),

    #[error("Not a regular file: {0}")]
    NotAFile(String),

    #[error("Not enough space on the device: need {needed} bytes, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("Unexpected device output: {0:?}")]
    DeviceOutput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
