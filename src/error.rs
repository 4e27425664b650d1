use thiserror::Error;

use crate::tracking::TrackingError;

#[derive(Error, Debug)]
pub enum CleaningError {
    #[error("Artifact not found: {reference}")]
    ArtifactNotFound { reference: String },

    #[error("Failed to parse dataset: {0}")]
    Parse(String),

    #[error("Failed to publish artifact: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tracking store error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CleaningError {
    /// Map a tracking failure raised while resolving `reference`.
    pub fn from_fetch(reference: &str, err: TrackingError) -> Self {
        match err {
            TrackingError::NotFound(_) | TrackingError::InvalidReference(_) => {
                CleaningError::ArtifactNotFound {
                    reference: reference.to_string(),
                }
            }
            other => CleaningError::Tracking(other),
        }
    }

    /// Map a tracking failure raised while submitting or awaiting an upload.
    pub fn from_publish(err: TrackingError) -> Self {
        CleaningError::Publish(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CleaningError>;
