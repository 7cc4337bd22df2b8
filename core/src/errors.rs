use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IntakeError>;

/// Why the quality gate declined an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TooSmall,
    Blurry,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall => f.write_str("resolution below the legibility floor"),
            Self::Blurry => f.write_str("image is too blurry"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("{collection} record {key} already exists")]
    Conflict { collection: &'static str, key: String },
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error("stale read: {0}")]
    Stale(String),
    #[error("image rejected: {0}")]
    Rejected(RejectReason),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("{collection} record {key} not found")]
    NotFound { collection: &'static str, key: String },
    #[error("image could not be decoded: {0}")]
    Decode(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("elevated session required")]
    Unauthorized,
}

impl IntakeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "STO-1001",
            Self::ConstraintViolation(_) => "STO-1002",
            Self::Storage(_) => "STO-1000",
            Self::Stale(_) => "STO-1003",
            Self::Rejected(RejectReason::TooSmall) => "IMG-1001",
            Self::Rejected(RejectReason::Blurry) => "IMG-1002",
            Self::Decode(_) => "IMG-1000",
            Self::InvalidTransition(_) => "INB-1001",
            Self::NotFound { .. } => "GEN-1004",
            Self::InvalidInput(_) => "GEN-1000",
            Self::Unauthorized => "ADM-1001",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "A record with the same key is already stored.",
            Self::ConstraintViolation(_) => {
                "A uniqueness rule of the local store was broken; this is a bug in the caller."
            }
            Self::Storage(_) => {
                "The local database could not be reached or is full. Retry once storage is available."
            }
            Self::Stale(_) => "The record changed while this action was running. Reload and retry.",
            Self::Rejected(RejectReason::TooSmall) => {
                "The photo resolution is too low to be legible. Move closer or retake."
            }
            Self::Rejected(RejectReason::Blurry) => {
                "The photo appears out of focus. Hold the camera steady and retake."
            }
            Self::Decode(_) => "The supplied file is not a readable image.",
            Self::InvalidTransition(_) => {
                "The delivery document is not in a state that allows this action."
            }
            Self::NotFound { .. } => "No record exists for the requested ID.",
            Self::InvalidInput(_) => "The request contained an invalid value.",
            Self::Unauthorized => "This action requires the admin PIN.",
        }
    }

    /// Outcomes a human is expected to act upon, as opposed to faults.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::Rejected(_) | Self::InvalidInput(_) | Self::Stale(_)
        )
    }

    pub(crate) fn not_found(collection: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            collection,
            key: key.into(),
        }
    }
}

impl From<rusqlite::Error> for IntakeError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::ConstraintViolation(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<r2d2::Error> for IntakeError {
    fn from(err: r2d2::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for IntakeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("corrupt record: {err}"))
    }
}

impl From<tokio::task::JoinError> for IntakeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Storage(format!("worker task failed: {err}"))
    }
}

impl From<image::ImageError> for IntakeError {
    fn from(err: image::ImageError) -> Self {
        Self::Decode(err.to_string())
    }
}
