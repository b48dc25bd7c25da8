//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `OUTPAINT_RELAY_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`, optional)
//! 2. **Environment variables** - Variables prefixed with `OUTPAINT_RELAY_` override YAML values
//! 3. **HF_TOKEN** - Special case: overrides `remote.token` if set
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `OUTPAINT_RELAY_REMOTE__URL=http://localhost:7860` sets the `remote.url` field.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! OUTPAINT_RELAY_PORT=8080
//!
//! # Access credential for the hosted endpoint (preferred method)
//! HF_TOKEN="hf_..."
//!
//! # Talk to a locally running endpoint instead of the hosted space
//! OUTPAINT_RELAY_REMOTE__URL="http://localhost:7860"
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;
use crate::outpaint::InpaintParams;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "OUTPAINT_RELAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have defaults, so an empty (or missing) config file yields a working relay pointed
/// at the public hosted endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    pub cors: CorsConfig,
    pub limits: LimitsConfig,
    pub staging: StagingConfig,
    /// Remote inference endpoint the relay forwards to
    pub remote: RemoteConfig,
    /// Parameters sent with every outpaint call
    pub outpaint: InpaintParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            enable_otel_export: false,
            cors: CorsConfig::default(),
            limits: LimitsConfig::default(),
            staging: StagingConfig::default(),
            remote: RemoteConfig::default(),
            outpaint: InpaintParams::default(),
        }
    }
}

/// CORS configuration. The upload page may be hosted elsewhere, so every origin is allowed by
/// default.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub allowed_origins: Vec<CorsOrigin>,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: None,
        }
    }
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard", serialize_with = "serialize_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn serialize_wildcard<S>(serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("*")
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

/// Request size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum accepted request body for `/outpaint`, in bytes
    pub max_upload_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 32 * 1024 * 1024,
        }
    }
}

/// Where per-request staging directories are created.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagingConfig {
    /// Parent directory for staging directories. Defaults to the OS temp dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl StagingConfig {
    pub fn root_dir(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Connection settings for the hosted inference endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteConfig {
    /// Hosted space identifier in `owner/name` form
    pub space: String,
    /// Explicit base URL. Takes precedence over `space` when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    /// Path prefix of the endpoint's HTTP API
    pub api_prefix: String,
    /// Access credential, sent as a bearer token. Never commit this to the config file; use
    /// `HF_TOKEN` or `OUTPAINT_RELAY_REMOTE__TOKEN` instead.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Per-request timeout for calls to the endpoint. Unset means no timeout.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            space: "multimodalart/flux-fill-outpaint".to_string(),
            url: None,
            api_prefix: "/gradio_api".to_string(),
            token: None,
            request_timeout: None,
        }
    }
}

impl RemoteConfig {
    /// Resolve the base URL of the endpoint.
    ///
    /// Hosted spaces are served from `https://<owner>-<name>.hf.space`, with underscores and dots
    /// in the identifier replaced by dashes.
    pub fn base_url(&self) -> Result<Url, Error> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let subdomain = self.space.trim().to_lowercase().replace(['/', '_', '.'], "-");
        Url::parse(&format!("https://{subdomain}.hf.space")).map_err(|e| Error::Internal {
            operation: format!("resolve remote url for space '{}': {e}", self.space),
        })
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        Self::figment(args).extract()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.remote.url.is_none() && !self.remote.space.contains('/') {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: remote.space must look like 'owner/name' when remote.url is not set (got '{}')",
                    self.remote.space
                ),
            });
        }
        self.remote.base_url()?;

        if self.limits.max_upload_size == 0 {
            return Err(Error::Internal {
                operation: "Config validation: limits.max_upload_size must be greater than zero".to_string(),
            });
        }

        self.outpaint.validate().map_err(|message| Error::Internal {
            operation: format!("Config validation: {message}"),
        })
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // OUTPAINT_RELAY_CONFIG names the file itself, not a field
            .merge(Env::prefixed("OUTPAINT_RELAY_").ignore(&["CONFIG"]).split("__"))
            .merge(Env::raw().only(&["HF_TOKEN"]).map(|_| "remote.token".into()))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
