// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the HTTP layer before a response is available
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Could not connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP request failed for {url}: {source}")]
    RequestFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl HttpError {
    /// Transport-level failures that are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, HttpError::Connect { .. } | HttpError::Timeout { .. })
    }
}

/// Errors that can occur while moving the bytes of a single transfer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No URL to download from")]
    MissingUrl,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Authentication failed (HTTP {status}) for {url}")]
    AuthenticationFailed { url: String, status: u16 },

    #[error("Content too short: expected {expected} bytes, got {actual}")]
    ContentTooShort { expected: u64, actual: u64 },

    #[error("Failed to open file {path}: {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transfer aborted")]
    Aborted,
}

/// Errors reported by a sync target
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Not enough free space on device: {required} bytes needed, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Device rejected the track: {0}")]
    Rejected(String),
}

/// Reasons a task run ends without success
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move {from} to {to}: {source}")]
    FinalizeFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source file {0} does not exist")]
    MissingSource(PathBuf),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// True when the run was unwound by a pause or cancel request
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskError::Transfer(TransferError::Aborted))
    }
}

/// Errors that can occur when loading or saving settings
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize config: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}
