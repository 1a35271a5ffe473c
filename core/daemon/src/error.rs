//! Error types for posture-daemon.

use std::path::PathBuf;

// ─────────────────────────────────────────────────────────────────────
// Detection Errors
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Image payload was empty")]
    EmptyPayload,

    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

// ─────────────────────────────────────────────────────────────────────
// Store Errors
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open document store: {0}")]
    Open(String),

    #[error("Failed to read document {key}: {details}")]
    Read { key: String, details: String },

    #[error("Failed to write document {key}: {details}")]
    Write { key: String, details: String },

    #[error("Document {key} is corrupt: {details}")]
    Corrupt { key: String, details: String },
}

// ─────────────────────────────────────────────────────────────────────
// Configuration Errors
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {details}")]
    Parse { path: PathBuf, details: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Home directory not found")]
    NoHomeDir,
}

// ─────────────────────────────────────────────────────────────────────
// HTTP Framing Errors
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Request exceeded maximum size")]
    TooLarge,

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to read request: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn status_code(&self) -> u16 {
        match self {
            HttpError::Malformed(_) | HttpError::Io(_) => 400,
            HttpError::TooLarge => 413,
            HttpError::Timeout => 408,
        }
    }
}
