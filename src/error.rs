use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification of a failed grading request
///
/// Classifier failures never fail a request, they fall back to pixel counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    ValidationError,
    DecodeError,
    InternalError,
}

impl ErrorKind {
    /// Whether resubmitting the same request could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::InternalError)
    }
}

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("Image file not found: {0:?}")]
    ImageNotFound(PathBuf),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to decode image {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to save annotated image {path:?}: {source}")]
    SaveAnnotated {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GradeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GradeError::ImageNotFound(_) | GradeError::InvalidRequest(_) => {
                ErrorKind::ValidationError
            }
            GradeError::Decode { .. } => ErrorKind::DecodeError,
            GradeError::SaveAnnotated { .. } | GradeError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Full cause chain for unexpected failures, `None` for caller mistakes
    pub fn trace(&self) -> Option<String> {
        match self {
            GradeError::Internal(err) => Some(format!("{:?}", err)),
            GradeError::SaveAnnotated { source, .. } => Some(format!("{:?}", source)),
            _ => None,
        }
    }
}

pub type GradeResult<T> = Result<T, GradeError>;
