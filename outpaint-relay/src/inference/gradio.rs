//! [`InferenceClient`] over the Gradio HTTP API used by hosted spaces.
//!
//! A prediction takes three round trips: upload any file arguments, submit the call to get an
//! event id, then read the event stream for that id until it completes. File outputs are fetched
//! only when the caller names a directory for them, so nothing outlives the request that asked.

use super::{FileOutputs, InferenceClient, InferenceError, PredictArg};
use crate::config::RemoteConfig;
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::{Client, RequestBuilder, Response, multipart};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::path::Path;
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

const FILE_DATA_TYPE: &str = "gradio.FileData";

#[derive(Debug, Deserialize)]
struct CallResponse {
    event_id: String,
}

/// Production client for a Gradio-served inference endpoint.
#[derive(Clone)]
pub struct GradioClient {
    client: Client,
    base_url: Url,
    api_prefix: String,
    token: Option<String>,
}

impl GradioClient {
    pub fn new(config: &RemoteConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let api_prefix = config.api_prefix.trim().trim_end_matches('/');
        let api_prefix = if api_prefix.is_empty() || api_prefix.starts_with('/') {
            api_prefix.to_string()
        } else {
            format!("/{api_prefix}")
        };

        Ok(Self {
            client,
            base_url: config.base_url()?,
            api_prefix,
            token: config.token.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, InferenceError> {
        let raw = format!("{}{}{}", self.base_url.as_str().trim_end_matches('/'), self.api_prefix, suffix);
        Url::parse(&raw).map_err(|e| InferenceError::Protocol(format!("invalid endpoint url '{raw}': {e}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) if !token.is_empty() => request.bearer_auth(token),
            _ => request,
        }
    }

    /// Upload a local file and return the file reference the endpoint expects in its place.
    #[instrument(skip(self), err)]
    async fn upload(&self, path: &Path) -> Result<Value, InferenceError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mime = mime_guess::from_path(path).first_or_octet_stream();

        debug!(file_name = %file_name, size = bytes.len(), "Uploading file argument");

        let part = multipart::Part::bytes(bytes).file_name(file_name.clone()).mime_str(mime.as_ref())?;
        let form = multipart::Form::new().part("files", part);

        let response = self
            .authorized(self.client.post(self.endpoint("/upload")?))
            .multipart(form)
            .send()
            .await?;
        let remote_paths: Vec<String> = ensure_success("upload", response).await?.json().await?;
        let remote_path = remote_paths
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Protocol("upload returned no file paths".to_string()))?;

        Ok(json!({
            "path": remote_path,
            "orig_name": file_name,
            "meta": { "_type": FILE_DATA_TYPE },
        }))
    }

    /// Replace every file output with a local copy under `dir`, recursively.
    fn localize_files<'a>(&'a self, value: &'a mut Value, dir: &'a Path) -> BoxFuture<'a, Result<(), InferenceError>> {
        Box::pin(async move {
            match value {
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        self.localize_files(item, dir).await?;
                    }
                }
                Value::Object(map) => {
                    if let Some(url) = self.file_url(map)? {
                        self.download(&url, map, dir).await?;
                    } else {
                        for item in map.values_mut() {
                            self.localize_files(item, dir).await?;
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Where a file output can be fetched from, if `map` describes one.
    fn file_url(&self, map: &Map<String, Value>) -> Result<Option<Url>, InferenceError> {
        let Some(remote_path) = map.get("path").and_then(Value::as_str) else {
            return Ok(None);
        };

        if let Some(url) = map.get("url").and_then(Value::as_str) {
            return Url::parse(url)
                .map(Some)
                .map_err(|e| InferenceError::Protocol(format!("invalid file url '{url}': {e}")));
        }

        let is_file_data = map
            .get("meta")
            .and_then(|meta| meta.get("_type"))
            .and_then(Value::as_str)
            .is_some_and(|kind| kind == FILE_DATA_TYPE);
        if is_file_data {
            return self.endpoint(&format!("/file={remote_path}")).map(Some);
        }

        Ok(None)
    }

    #[instrument(skip(self, map), err)]
    async fn download(&self, url: &Url, map: &mut Map<String, Value>, dir: &Path) -> Result<(), InferenceError> {
        let response = self.authorized(self.client.get(url.clone())).send().await?;
        let bytes = ensure_success("file download", response).await?.bytes().await?;

        let file_name = ["orig_name", "path"]
            .iter()
            .filter_map(|key| map.get(*key).and_then(Value::as_str))
            .find_map(|name| Path::new(name).file_name().map(|n| n.to_owned()))
            .unwrap_or_else(|| "output".into());

        // Outputs of one call may share a file name
        let dir = dir.join(format!("download-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        let local = dir.join(file_name);
        tokio::fs::write(&local, &bytes).await?;

        debug!(local = %local.display(), size = bytes.len(), "Fetched file output");
        map.insert("path".to_string(), Value::String(local.to_string_lossy().into_owned()));
        Ok(())
    }
}

#[async_trait]
impl InferenceClient for GradioClient {
    #[instrument(skip(self, args), err)]
    async fn predict(
        &self,
        api_name: &str,
        args: Vec<PredictArg>,
        files: FileOutputs,
    ) -> Result<Vec<Value>, InferenceError> {
        let route = api_name.trim_start_matches('/');

        let mut data = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                PredictArg::File(path) => data.push(self.upload(&path).await?),
                PredictArg::Value(value) => data.push(value),
            }
        }

        info!(api_name, "Submitting remote call");
        let response = self
            .authorized(self.client.post(self.endpoint(&format!("/call/{route}"))?))
            .json(&json!({ "data": data }))
            .send()
            .await?;
        let CallResponse { event_id } = ensure_success(api_name, response).await?.json().await?;

        debug!(api_name, event_id = %event_id, "Waiting for remote result");
        let response = self
            .authorized(self.client.get(self.endpoint(&format!("/call/{route}/{event_id}"))?))
            .send()
            .await?;
        let stream = ensure_success(api_name, response).await?.text().await?;

        let mut outputs = parse_event_stream(api_name, &stream)?;
        if let FileOutputs::FetchInto(dir) = &files {
            for output in outputs.iter_mut() {
                self.localize_files(output, dir).await?;
            }
        }

        info!(api_name, outputs = outputs.len(), "Remote call completed");
        Ok(outputs)
    }
}

async fn ensure_success(operation: &str, response: Response) -> Result<Response, InferenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(operation, status = status.as_u16(), "Remote endpoint returned an error status");
    Err(InferenceError::Status {
        operation: operation.to_string(),
        status: status.as_u16(),
        body,
    })
}

/// Extract the outputs of a finished call from its server-sent event stream.
///
/// `complete` carries the JSON array of outputs and `error` fails the call. Anything else
/// (`generating`, `heartbeat`, ...) is progress chatter and skipped.
fn parse_event_stream(api_name: &str, stream: &str) -> Result<Vec<Value>, InferenceError> {
    let mut event: Option<&str> = None;

    for line in stream.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            event = None;
        } else if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim());
        } else if let Some(payload) = line.strip_prefix("data:") {
            let payload = payload.trim_start();
            match event {
                Some("complete") => {
                    return serde_json::from_str(payload)
                        .map_err(|e| InferenceError::Protocol(format!("{api_name} returned unparseable outputs: {e}")));
                }
                Some("error") => {
                    return Err(InferenceError::Remote {
                        api_name: api_name.to_string(),
                        message: error_message(payload),
                    });
                }
                _ => {}
            }
        }
    }

    Err(InferenceError::Protocol(format!(
        "event stream for {api_name} ended without a result"
    )))
}

fn error_message(payload: &str) -> String {
    const NO_DETAILS: &str = "the endpoint reported an error without details";
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::String(message)) => message,
        Ok(Value::Null) => NO_DETAILS.to_string(),
        _ if payload.is_empty() => NO_DETAILS.to_string(),
        _ => payload.to_string(),
    }
}
