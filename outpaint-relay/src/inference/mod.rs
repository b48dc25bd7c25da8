//! Client abstraction for the remote inference endpoint.
//!
//! The endpoint is treated as an opaque set of named operations reached over HTTP. The relay only
//! ever sees [`InferenceClient`], which is injected into the request handlers through
//! [`AppState`](crate::AppState), so tests can swap the real [`GradioClient`] for a mock.

mod gradio;
#[cfg(any(test, feature = "test-utils"))]
mod mock;

pub use gradio::GradioClient;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockCall, MockInferenceClient};

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// A single positional argument to a remote operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictArg {
    /// A local file. The client uploads it and passes the remote reference instead.
    File(PathBuf),
    /// A plain JSON value passed through unchanged.
    Value(Value),
}

impl From<Value> for PredictArg {
    fn from(value: Value) -> Self {
        PredictArg::Value(value)
    }
}

/// What a call does with the file outputs the endpoint returns.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutputs {
    /// Leave file references as the endpoint returned them; nothing is fetched.
    Ignore,
    /// Fetch every file output below this directory and point its `path` at the local copy.
    /// The caller owns the directory and its removal.
    FetchInto(PathBuf),
}

/// Errors raised while talking to the remote endpoint.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Transport-level failure (connect, TLS, timeout, body decoding)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status
    #[error("{operation} returned {status}: {body}")]
    Status { operation: String, status: u16, body: String },

    /// The endpoint reported a failure of the operation itself
    #[error("{api_name} failed: {message}")]
    Remote { api_name: String, message: String },

    /// The endpoint answered with something that does not follow its protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local file could not be read or written
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for invoking named operations on the remote endpoint.
///
/// Implementations must be safe to share across concurrently running requests; each call is
/// independent and carries no state between calls from the relay's point of view.
///
/// # Example
/// ```ignore
/// let outputs = client
///     .predict("/use_output_as_input", vec![PredictArg::File(input.clone())], FileOutputs::Ignore)
///     .await?;
/// ```
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Invoke `api_name` with positional `args` and return the operation's outputs, one JSON value
    /// per declared output. File outputs are handled as `files` says.
    async fn predict(
        &self,
        api_name: &str,
        args: Vec<PredictArg>,
        files: FileOutputs,
    ) -> Result<Vec<Value>, InferenceError>;
}
