//! # outpaint-relay: HTTP front door for a hosted outpainting model
//!
//! `outpaint-relay` accepts an image upload, forwards it to a hosted image-outpainting endpoint,
//! and streams the generated image back to the caller as a download. The model itself runs
//! elsewhere; this crate owns only the request lifecycle around it.
//!
//! ## Request Flow
//!
//! A `POST /outpaint` request moves through five steps:
//!
//! 1. **Validation** ([`api::handlers::outpaint::read_upload`]): the multipart body must carry an
//!    `image` file with a non-empty filename, otherwise the caller gets a 400 and nothing else
//!    happens.
//! 2. **Staging** ([`staging::StagingDir`]): the upload is written as `input.png` into a fresh,
//!    uniquely named temporary directory owned by this request alone.
//! 3. **Remote calls** ([`outpaint::run`]): the staged image is sent through the endpoint's
//!    two-step protocol, `/use_output_as_input` followed by `/inpaint`.
//! 4. **Normalization** ([`outpaint::RemoteResult`]): the endpoint's loosely shaped answer is
//!    reduced to a single local file path, which must exist.
//! 5. **Streaming**: the artifact is copied into the staging directory as `output.webp` and sent
//!    back as `image/webp` with an `attachment` disposition.
//!
//! The staging directory is removed on every exit path. On success the response body owns it, so
//! removal happens once the body has been fully sent or abandoned.
//!
//! Errors of every kind are rendered as `{"error": "<message>"}` (see [`errors`]).
//!
//! ## Remote Endpoint
//!
//! The endpoint is reached through the [`inference::InferenceClient`] trait. The production
//! implementation, [`inference::GradioClient`], speaks the Gradio HTTP API of hosted spaces. The
//! client is built once at startup and shared by all requests through [`AppState`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use outpaint_relay::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = outpaint_relay::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     config.validate()?;
//!
//!     outpaint_relay::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     Application::new(config)?
//!         .serve(async {
//!             tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!         })
//!         .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod config;
pub mod errors;
pub mod inference;
pub mod outpaint;
pub mod staging;
mod static_assets;
pub mod telemetry;

#[cfg(test)]
mod test;

use crate::config::CorsOrigin;
use crate::errors::Error;
use crate::inference::{GradioClient, InferenceClient};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use std::any::Any;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .inference(Arc::new(GradioClient::new(&config.remote)?))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    /// Handle to the remote endpoint, shared by all in-flight requests
    pub inference: Arc<dyn InferenceClient>,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origins = &config.cors.allowed_origins;
    let allow_origin = if origins.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut values = Vec::with_capacity(origins.len());
        for origin in origins {
            if let CorsOrigin::Url(url) = origin {
                values.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(values)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .expose_headers([axum::http::header::CONTENT_DISPOSITION]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Render a panic inside a handler as a JSON 500. The staging directory of the panicking request
/// is still removed while the panic unwinds.
fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };

    Error::Internal {
        operation: format!("handle request: {detail}"),
    }
    .into_response()
}

/// Build the application router with all endpoints and middleware.
#[instrument(skip_all)]
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let cors = create_cors_layer(&state.config)?;
    let body_limit = DefaultBodyLimit::max(state.config.limits.max_upload_size);

    let router = Router::new()
        .route("/", get(api::handlers::static_assets::index))
        .route("/outpaint", post(api::handlers::outpaint::outpaint).layer(body_limit))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(cors)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );

    Ok(router)
}

/// Main application struct that owns the router and configuration.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] builds the remote client and the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: When the shutdown signal is received, in-flight requests finish and telemetry
///    is flushed
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create an application talking to the endpoint described by `config.remote`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = GradioClient::new(&config.remote)?;
        info!("Forwarding outpaint requests to {}", client.base_url());
        Self::with_client(config, Arc::new(client))
    }

    /// Create an application with an explicitly provided remote client.
    pub fn with_client(config: Config, inference: Arc<dyn InferenceClient>) -> anyhow::Result<Self> {
        debug!("Starting outpaint relay with configuration: {:#?}", config);

        let state = AppState::builder().config(config.clone()).inference(inference).build();
        let router = build_router(state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Outpaint relay listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
