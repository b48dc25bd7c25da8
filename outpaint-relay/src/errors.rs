use crate::inference::InferenceError;
use crate::outpaint::MalformedResult;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// The multipart body has no `image` file field
    #[error("No image file provided")]
    MissingImage,

    /// The `image` field was sent with an empty filename (nothing selected in the form)
    #[error("No image selected")]
    EmptyFilename,

    /// Invalid request data, e.g. a multipart body that cannot be parsed
    #[error("{message}")]
    BadRequest { message: String },

    /// Upload exceeds the configured body limit
    #[error("{message}")]
    PayloadTooLarge { message: String },

    /// A call to the remote inference endpoint failed
    #[error("Error in image processing: {0}")]
    Inference(#[from] InferenceError),

    /// The remote endpoint returned a value no path could be extracted from
    #[error(transparent)]
    MalformedResult(#[from] MalformedResult),

    /// The path the remote endpoint pointed at does not exist locally
    #[error("Result file not found: {}", path.display())]
    ArtifactMissing { path: PathBuf },

    /// The copy of the artifact in the staging directory is missing
    #[error("Copied file not found: {}", path.display())]
    CopiedArtifactMissing { path: PathBuf },

    /// Local filesystem failure while staging or copying
    #[error("Failed to {operation}: {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON body returned for every failed request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl Error {
    pub fn io(operation: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let operation = operation.into();
        move |source| Error::Io { operation, source }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MissingImage | Error::EmptyFilename | Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Inference(_)
            | Error::MalformedResult(_)
            | Error::ArtifactMissing { .. }
            | Error::CopiedArtifactMissing { .. }
            | Error::Io { .. }
            | Error::Internal { .. }
            | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to the caller. Upstream failures are surfaced verbatim so the upload page can
    /// show what the endpoint said.
    pub fn user_message(&self) -> String {
        match self {
            Error::Other(e) => format!("{e:#}"),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::MissingImage | Error::EmptyFilename | Error::BadRequest { .. } | Error::PayloadTooLarge { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Inference(_) => {
                tracing::error!("Remote inference error: {:#}", self);
            }
            _ => {
                tracing::error!("Internal service error: {:#}", self);
            }
        }

        let body = ErrorBody {
            error: self.user_message(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
