// Error taxonomy for a single sighting

use thiserror::Error;

/// Problems with the operator's submission. Nothing is written when these occur.
#[derive(Debug, Error, PartialEq)]
pub enum InputError {
    #[error("No dog name provided")]
    MissingLabel,
    #[error("No image provided")]
    MissingImage,
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
    #[error("File type not allowed: {0}")]
    UnsupportedFileType(String),
    #[error("Image could not be read: {0}")]
    UnreadableImage(String),
}

#[derive(Debug, Error)]
pub enum SightingError {
    #[error(transparent)]
    Input(#[from] InputError),

    /// The record store could not be read or written
    #[error("record store failure: {0:#}")]
    Store(#[source] anyhow::Error),

    /// Pose estimator, overlay renderer, barcode renderer or artifact storage failed
    #[error("{service} failed: {source:#}")]
    External {
        service: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl SightingError {
    pub fn external(service: &'static str, source: anyhow::Error) -> Self {
        SightingError::External { service, source }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, SightingError::Input(_))
    }

    /// Text safe to show the operator
    pub fn user_message(&self) -> String {
        match self {
            SightingError::Input(e) => e.to_string(),
            _ => "Failed to process the sighting, please try again later".to_string(),
        }
    }
}
