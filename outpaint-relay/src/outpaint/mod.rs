//! The outpaint pipeline: the two-step remote handshake and resolution of the produced artifact.
//!
//! The hosted endpoint only accepts an image for `/inpaint` after the same image has been passed
//! through `/use_output_as_input`. The first call's outputs are discarded without fetching any of
//! its files. Both calls are sent strictly in sequence and neither is retried.

mod result;

pub use result::{MalformedResult, RemoteResult};

use crate::errors::{Error, Result};
use crate::inference::{FileOutputs, InferenceClient, PredictArg};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Operation that registers the image as the endpoint's current output.
pub const USE_OUTPUT_AS_INPUT: &str = "/use_output_as_input";
/// Operation that performs the outpainting.
pub const INPAINT: &str = "/inpaint";

/// Where the source image is anchored inside the target canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alignment {
    Middle,
    Left,
    Right,
    Top,
    Bottom,
}

/// How the source image is scaled before being placed on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeOption {
    Full,
    #[serde(rename = "50%")]
    Half,
    #[serde(rename = "33%")]
    Third,
    #[serde(rename = "25%")]
    Quarter,
    #[serde(rename = "75%")]
    ThreeQuarters,
    /// Use `custom_resize_percentage`
    Custom,
}

/// Parameters sent with every `/inpaint` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InpaintParams {
    pub width: u32,
    pub height: u32,
    pub overlap_percentage: u32,
    pub num_inference_steps: u32,
    pub resize_option: ResizeOption,
    pub custom_resize_percentage: u32,
    pub prompt: String,
    pub alignment: Alignment,
    pub overlap_left: bool,
    pub overlap_right: bool,
    pub overlap_top: bool,
    pub overlap_bottom: bool,
}

impl Default for InpaintParams {
    fn default() -> Self {
        Self {
            width: 720,
            height: 1280,
            overlap_percentage: 10,
            num_inference_steps: 28,
            resize_option: ResizeOption::ThreeQuarters,
            custom_resize_percentage: 50,
            prompt: String::new(),
            alignment: Alignment::Middle,
            overlap_left: true,
            overlap_right: true,
            overlap_top: true,
            overlap_bottom: true,
        }
    }
}

impl InpaintParams {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "outpaint target size must be non-zero (got {}x{})",
                self.width, self.height
            ));
        }
        if self.num_inference_steps == 0 {
            return Err("outpaint.num_inference_steps must be at least 1".to_string());
        }
        if !(1..=100).contains(&self.overlap_percentage) {
            return Err(format!(
                "outpaint.overlap_percentage must be between 1 and 100 (got {})",
                self.overlap_percentage
            ));
        }
        if !(1..=100).contains(&self.custom_resize_percentage) {
            return Err(format!(
                "outpaint.custom_resize_percentage must be between 1 and 100 (got {})",
                self.custom_resize_percentage
            ));
        }
        Ok(())
    }

    /// Positional arguments of `/inpaint`, in the order the endpoint declares them.
    pub fn to_args(&self, image: &Path) -> Vec<PredictArg> {
        let mut args = vec![PredictArg::File(image.to_path_buf())];
        args.extend(
            [
                json!(self.width),
                json!(self.height),
                json!(self.overlap_percentage),
                json!(self.num_inference_steps),
                json!(self.resize_option),
                json!(self.custom_resize_percentage),
                json!(self.prompt),
                json!(self.alignment),
                json!(self.overlap_left),
                json!(self.overlap_right),
                json!(self.overlap_top),
                json!(self.overlap_bottom),
            ]
            .into_iter()
            .map(PredictArg::Value),
        );
        args
    }
}

/// Run the remote handshake for the staged `input` and return the path of the produced artifact.
///
/// File outputs of `/inpaint` are fetched below `downloads`, which the caller owns. The returned
/// path is guaranteed to exist at the time of return.
#[instrument(skip(client, params, input, downloads), fields(input = %input.display()), err)]
pub async fn run(client: &dyn InferenceClient, input: &Path, downloads: &Path, params: &InpaintParams) -> Result<PathBuf> {
    client
        .predict(
            USE_OUTPUT_AS_INPUT,
            vec![PredictArg::File(input.to_path_buf())],
            FileOutputs::Ignore,
        )
        .await?;
    debug!("Registered input with remote endpoint");

    let outputs = client
        .predict(INPAINT, params.to_args(input), FileOutputs::FetchInto(downloads.to_path_buf()))
        .await?;
    let result = RemoteResult::from_outputs(outputs);
    debug!(?result, "Remote endpoint returned");

    let path = result.normalize()?;
    let exists = !path.as_os_str().is_empty() && tokio::fs::try_exists(&path).await.unwrap_or(false);
    if !exists {
        return Err(Error::ArtifactMissing { path });
    }

    info!(artifact = %path.display(), "Outpaint result available");
    Ok(path)
}
