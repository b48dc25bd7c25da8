//! HTTP handlers for the embedded upload page.

use axum::{
    body::Body,
    http::{StatusCode, header},
    response::IntoResponse,
};
use tracing::instrument;

use crate::static_assets;

/// Serve the upload form at `/`.
#[instrument]
pub async fn index() -> impl IntoResponse {
    let Some(index) = static_assets::Assets::get("index.html") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mime = mime_guess::from_path("index.html").first_or_octet_stream();
    (
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from(index.data.into_owned()),
    )
        .into_response()
}
