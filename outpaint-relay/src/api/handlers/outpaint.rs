//! `POST /outpaint`: validate the upload, stage it, run the remote pipeline and stream the result.

use crate::AppState;
use crate::errors::{Error, Result};
use crate::outpaint;
use crate::staging::StagingDir;
use axum::{
    body::Body,
    extract::{Multipart, State, multipart::MultipartRejection},
    http::{StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};

pub const DOWNLOAD_NAME: &str = "outpainted-image.webp";
const CONTENT_TYPE: &str = "image/webp";

/// The validated `image` field.
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub bytes: Bytes,
}

/// Find the `image` file field.
///
/// A field named `image` without a filename is a plain form value, not a file, and does not count.
/// A body that breaks off before an `image` file shows up is treated as having none. Nothing
/// touches the filesystem before this succeeds.
pub async fn read_upload(multipart: &mut Multipart) -> Result<Upload> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(multipart_error("parse multipart data", e));
            }
            Err(e) => {
                debug!(error = %e.body_text(), "Multipart body ended before an image file");
                return Err(Error::MissingImage);
            }
        };
        if field.name() != Some("image") {
            continue;
        }
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if file_name.is_empty() {
            return Err(Error::EmptyFilename);
        }

        let bytes = field.bytes().await.map_err(|e| multipart_error("read image", e))?;
        debug!(file_name = %file_name, size = bytes.len(), "Received image upload");
        return Ok(Upload { file_name, bytes });
    }

    Err(Error::MissingImage)
}

fn multipart_error(operation: &str, e: axum::extract::multipart::MultipartError) -> Error {
    let message = format!("Failed to {operation}: {}", e.body_text());
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        Error::PayloadTooLarge { message }
    } else {
        Error::BadRequest { message }
    }
}

/// Outpaint an uploaded image.
///
/// The staging directory is created only after the upload validated. On every failure it is
/// dropped before the error response is rendered; on success ownership moves into the response
/// body so the file stays readable until the transport is done with it.
#[instrument(skip_all, err)]
pub async fn outpaint(State(state): State<AppState>, multipart: std::result::Result<Multipart, MultipartRejection>) -> Result<Response> {
    let mut multipart = multipart.map_err(|rejection| {
        debug!(%rejection, "Request is not a multipart upload");
        Error::MissingImage
    })?;
    let upload = read_upload(&mut multipart).await?;

    let (staging, output) = process_detached(state, upload).await?;
    stream_file(staging, &output).await
}

/// Run [`process`] on its own task.
///
/// Once forwarded, a request runs to completion even if the client goes away: dropping the
/// returned future only detaches the task, which then drops its staging directory when it
/// finishes. Panics are re-raised here so they surface like any other handler panic.
pub async fn process_detached(state: AppState, upload: Upload) -> Result<(StagingDir, PathBuf)> {
    match tokio::spawn(process(state, upload)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(Error::Internal {
            operation: format!("run outpaint task: {e}"),
        }),
    }
}

/// Stage the upload, run the remote pipeline and copy the artifact next to the input.
async fn process(state: AppState, upload: Upload) -> Result<(StagingDir, PathBuf)> {
    let staging = StagingDir::create(&state.config.staging.root_dir())?;
    let input = staging.write_input(&upload.bytes).await?;

    let artifact = outpaint::run(
        state.inference.as_ref(),
        &input,
        &staging.downloads_path(),
        &state.config.outpaint,
    )
    .await?;
    let output = staging.copy_output_from(&artifact).await?;

    info!(file_name = %upload.file_name, "Outpainted image ready");
    Ok((staging, output))
}

/// Response body that keeps the staging directory alive until the body is finished or dropped.
struct StagedBody {
    inner: ReaderStream<File>,
    _staging: StagingDir,
}

impl Stream for StagedBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn stream_file(staging: StagingDir, output: &Path) -> Result<Response> {
    let file = File::open(output).await.map_err(Error::io("open result"))?;
    let length = file.metadata().await.map_err(Error::io("read result metadata"))?.len();

    let body = StagedBody {
        inner: ReaderStream::new(file),
        _staging: staging,
    };

    Response::builder()
        .header(header::CONTENT_TYPE, CONTENT_TYPE)
        .header(header::CONTENT_DISPOSITION, format!("attachment; filename=\"{DOWNLOAD_NAME}\""))
        .header(header::CONTENT_LENGTH, length)
        .body(Body::from_stream(body))
        .map_err(|e| Error::Internal {
            operation: format!("build response: {e}"),
        })
}
