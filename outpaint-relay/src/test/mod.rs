//! End-to-end tests of the HTTP surface, driven through [`Application`](crate::Application).

use crate::errors::ErrorBody;
use crate::inference::{FileOutputs, InferenceClient, InferenceError, MockInferenceClient, PredictArg};
use crate::outpaint::{INPAINT, USE_OUTPUT_AS_INPUT};
use crate::{Application, Config};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::TestServer;
use axum_test::multipart::{MultipartForm, Part};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake image body";
const WEBP_BYTES: &[u8] = b"RIFF\x10\x00\x00\x00WEBPVP8 outpainted";

fn create_test_config(staging_root: &Path) -> Config {
    let mut config = Config::default();
    config.staging.root = Some(staging_root.to_path_buf());
    config
}

fn create_test_app(config: Config, client: Arc<dyn InferenceClient>) -> TestServer {
    Application::with_client(config, client)
        .expect("Failed to create application")
        .into_test_server()
}

fn image_form(file_name: &str, bytes: &[u8]) -> MultipartForm {
    MultipartForm::new().add_part(
        "image",
        Part::bytes(bytes.to_vec()).file_name(file_name).mime_type("image/png"),
    )
}

/// Number of entries left under the staging root.
fn staging_entries(root: &Path) -> usize {
    std::fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}

/// Write a fake result artifact the mock endpoint can point at.
fn write_artifact(dir: &TempDir) -> PathBuf {
    let artifact = dir.path().join("image.webp");
    std::fs::write(&artifact, WEBP_BYTES).unwrap();
    artifact
}

/// Mock endpoint that answers both operations successfully, `times` times over.
fn successful_mock(artifact: &Path, times: usize) -> MockInferenceClient {
    let mock = MockInferenceClient::new();
    for _ in 0..times {
        mock.add_outputs(USE_OUTPUT_AS_INPUT, vec![json!({ "path": "/remote/echo.png" })]);
        mock.add_outputs(INPAINT, vec![json!({ "path": artifact.to_str().unwrap() })]);
    }
    mock
}

#[test_log::test(tokio::test)]
async fn test_e2e_outpaint_with_mocked_inference() {
    let staging_root = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&artifacts);

    let mock = successful_mock(&artifact, 1);
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "image/webp");
    let disposition = response.header("content-disposition");
    let disposition = disposition.to_str().unwrap();
    assert!(disposition.starts_with("attachment"));
    assert!(disposition.contains("outpainted-image.webp"));
    assert_eq!(response.as_bytes().as_ref(), WEBP_BYTES);

    // Both calls happened in order, each while the staged input was on disk
    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].api_name, USE_OUTPUT_AS_INPUT);
    assert_eq!(calls[1].api_name, INPAINT);
    assert!(calls.iter().all(|call| call.files_present));

    let PredictArg::File(staged) = &calls[0].args[0] else {
        panic!("first argument must be the staged file");
    };
    assert!(staged.starts_with(staging_root.path()));
    assert_eq!(staged.file_name().unwrap(), "input.png");
    assert_eq!(calls[1].args[0], PredictArg::File(staged.clone()));
    assert_eq!(calls[1].args[1], PredictArg::Value(json!(720)));
    assert_eq!(calls[1].args[5], PredictArg::Value(json!("75%")));

    // Nothing is left behind, and the remote artifact itself is not ours to remove
    assert_eq!(staging_entries(staging_root.path()), 0);
    assert!(artifact.exists());
}

#[test_log::test(tokio::test)]
async fn test_missing_image_field() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let form = MultipartForm::new().add_part("picture", Part::bytes(PNG_BYTES.to_vec()).file_name("photo.png"));
    let response = server.post("/outpaint").multipart(form).await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: ErrorBody = response.json();
    assert_eq!(body.error, "No image file provided");
    assert_eq!(mock.call_count(), 0);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_image_sent_as_text_field_is_not_a_file() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let form = MultipartForm::new().add_text("image", "not a file");
    let response = server.post("/outpaint").multipart(form).await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: ErrorBody = response.json();
    assert_eq!(body.error, "No image file provided");
    assert_eq!(mock.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_empty_body_is_rejected() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let response = server.post("/outpaint").multipart(MultipartForm::new()).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<ErrorBody>().error, "No image file provided");

    // Not multipart at all
    let response = server.post("/outpaint").json(&json!({ "image": "photo.png" })).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<ErrorBody>().error, "No image file provided");

    assert_eq!(mock.call_count(), 0);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_empty_filename() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let response = server.post("/outpaint").multipart(image_form("", PNG_BYTES)).await;

    response.assert_status(StatusCode::BAD_REQUEST);
    let body: ErrorBody = response.json();
    assert_eq!(body.error, "No image selected");
    assert_eq!(mock.call_count(), 0);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_upload_over_body_limit() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    let mut config = create_test_config(staging_root.path());
    config.limits.max_upload_size = 1024;
    let server = create_test_app(config, Arc::new(mock.clone()));

    let response = server
        .post("/outpaint")
        .multipart(image_form("huge.png", &vec![0u8; 16 * 1024]))
        .await;

    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(mock.call_count(), 0);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_remote_failure_reports_processing_error() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    mock.add_outputs(USE_OUTPUT_AS_INPUT, vec![]);
    mock.add_error(INPAINT, "CUDA out of memory");
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = response.json();
    assert!(body.error.starts_with("Error in image processing: "), "got {}", body.error);
    assert!(body.error.contains("CUDA out of memory"));
    assert_eq!(mock.call_count(), 2);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_first_call_failure_skips_inpaint() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    mock.add_error(USE_OUTPUT_AS_INPUT, "Space is sleeping");
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.json::<ErrorBody>().error.contains("Space is sleeping"));
    assert_eq!(mock.call_count(), 1);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_unrecognized_result_shape() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    mock.add_outputs(USE_OUTPUT_AS_INPUT, vec![]);
    mock.add_outputs(INPAINT, vec![json!(42)]);
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock));

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = response.json();
    assert!(body.error.starts_with("Unexpected result format"), "got {}", body.error);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_result_path_that_does_not_exist() {
    let staging_root = tempfile::tempdir().unwrap();
    let mock = MockInferenceClient::new();
    mock.add_outputs(USE_OUTPUT_AS_INPUT, vec![]);
    mock.add_outputs(INPAINT, vec![json!("/nonexistent/outpaint/result.webp")]);
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock));

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = response.json();
    assert_eq!(body.error, "Result file not found: /nonexistent/outpaint/result.webp");
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_every_result_shape_is_streamed() {
    let staging_root = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&artifacts);
    let path = artifact.to_str().unwrap();

    let shapes: Vec<Vec<Value>> = vec![
        vec![json!(path)],
        vec![json!({ "path": path })],
        vec![json!([{ "path": path }])],
        vec![json!([path])],
        vec![json!(path), json!("seed: 42")],
    ];

    let mock = MockInferenceClient::new();
    for outputs in &shapes {
        mock.add_outputs(USE_OUTPUT_AS_INPUT, vec![]);
        mock.add_outputs(INPAINT, outputs.clone());
    }
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock));

    for outputs in &shapes {
        let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;
        response.assert_status_ok();
        assert_eq!(response.as_bytes().as_ref(), WEBP_BYTES, "shape {outputs:?}");
    }
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_repeated_requests_do_not_leak_staging_dirs() {
    let staging_root = tempfile::tempdir().unwrap();
    let artifacts = tempfile::tempdir().unwrap();
    let artifact = write_artifact(&artifacts);

    let mock = successful_mock(&artifact, 8);
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(mock.clone()));

    let requests = (0..8).map(|i| {
        server
            .post("/outpaint")
            .multipart(image_form(&format!("photo-{i}.png"), PNG_BYTES))
            .into_future()
    });
    let responses = futures::future::join_all(requests).await;

    for response in responses {
        response.assert_status_ok();
        assert_eq!(response.as_bytes().as_ref(), WEBP_BYTES);
    }
    assert_eq!(mock.call_count(), 16);
    assert_eq!(staging_entries(staging_root.path()), 0);

    // Each request staged its input in its own directory
    let staged: std::collections::HashSet<PathBuf> = mock
        .calls()
        .iter()
        .filter_map(|call| match &call.args[0] {
            PredictArg::File(path) => path.parent().map(Path::to_path_buf),
            PredictArg::Value(_) => None,
        })
        .collect();
    assert_eq!(staged.len(), 8);
}

/// Client that dies inside the request, after the input has been staged.
struct PanickingClient;

#[async_trait]
impl InferenceClient for PanickingClient {
    async fn predict(
        &self,
        _api_name: &str,
        _args: Vec<PredictArg>,
        _files: FileOutputs,
    ) -> Result<Vec<Value>, InferenceError> {
        panic!("inference client exploded");
    }
}

#[test_log::test(tokio::test)]
async fn test_panic_is_rendered_as_json_and_cleaned_up() {
    let staging_root = tempfile::tempdir().unwrap();
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(PanickingClient));

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = response.json();
    assert!(body.error.contains("inference client exploded"), "got {}", body.error);
    assert_eq!(staging_entries(staging_root.path()), 0);
}

#[test_log::test(tokio::test)]
async fn test_index_and_cors() {
    let staging_root = tempfile::tempdir().unwrap();
    let server = create_test_app(create_test_config(staging_root.path()), Arc::new(MockInferenceClient::new()));

    let response = server.get("/").add_header("origin", "https://elsewhere.example.com").await;

    response.assert_status_ok();
    assert_eq!(response.header("access-control-allow-origin"), "*");
    assert!(response.text().contains("/outpaint"));
}

#[test_log::test(tokio::test)]
async fn test_cors_restricted_to_configured_origins() {
    let staging_root = tempfile::tempdir().unwrap();
    let mut config = create_test_config(staging_root.path());
    config.cors.allowed_origins = vec![crate::config::CorsOrigin::Url(
        Url::parse("https://app.example.com").unwrap(),
    )];
    let server = create_test_app(config, Arc::new(MockInferenceClient::new()));

    let response = server.get("/").add_header("origin", "https://app.example.com").await;
    assert_eq!(response.header("access-control-allow-origin"), "https://app.example.com");

    let response = server.get("/").add_header("origin", "https://evil.example.com").await;
    assert!(response.headers().get("access-control-allow-origin").is_none());
}

/// Full stack: the real Gradio client against a mocked hosted endpoint.
#[test_log::test(tokio::test)]
async fn test_e2e_outpaint_against_mocked_gradio_endpoint() {
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let remote = MockServer::start().await;
    let staging_root = tempfile::tempdir().unwrap();

    Mock::given(method("POST"))
        .and(path("/gradio_api/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(["/tmp/gradio/up/input.png"])))
        .expect(2)
        .mount(&remote)
        .await;

    Mock::given(method("POST"))
        .and(path("/gradio_api/call/use_output_as_input"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "event_id": "evt-echo" })))
        .expect(1)
        .mount(&remote)
        .await;
    let echoed = json!([[{ "path": "/tmp/gradio/up/input.png", "meta": { "_type": "gradio.FileData" } }]]);
    Mock::given(method("GET"))
        .and(path("/gradio_api/call/use_output_as_input/evt-echo"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(format!("event: complete\ndata: {echoed}\n\n"), "text/event-stream"),
        )
        .mount(&remote)
        .await;

    Mock::given(method("POST"))
        .and(path("/gradio_api/call/inpaint"))
        .and(body_partial_json(json!({
            "data": [
                { "path": "/tmp/gradio/up/input.png" },
                720, 1280, 10, 28, "75%", 50, "", "Middle", true, true, true, true
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "event_id": "evt-inpaint" })))
        .expect(1)
        .mount(&remote)
        .await;
    let produced = json!([{
        "path": "/tmp/gradio/out/image.webp",
        "url": format!("{}/gradio_api/file=/tmp/gradio/out/image.webp", remote.uri()),
        "meta": { "_type": "gradio.FileData" }
    }]);
    Mock::given(method("GET"))
        .and(path("/gradio_api/call/inpaint/evt-inpaint"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(format!("event: complete\ndata: {produced}\n\n"), "text/event-stream"),
        )
        .mount(&remote)
        .await;

    // The first call's output is discarded, so its file is never fetched
    Mock::given(method("GET"))
        .and(path("/gradio_api/file=/tmp/gradio/up/input.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PNG_BYTES.to_vec()))
        .expect(0)
        .mount(&remote)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/gradio_api/file=/tmp/gradio/out/"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(WEBP_BYTES.to_vec()))
        .expect(1)
        .mount(&remote)
        .await;

    let mut config = create_test_config(staging_root.path());
    config.remote.url = Some(Url::parse(&remote.uri()).unwrap());
    let server = Application::new(config)
        .expect("Failed to create application")
        .into_test_server();

    let response = server.post("/outpaint").multipart(image_form("photo.png", PNG_BYTES)).await;

    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "image/webp");
    assert_eq!(response.as_bytes().as_ref(), WEBP_BYTES);

    // The fetched artifact lived in the request's staging directory and went with it
    assert_eq!(staging_entries(staging_root.path()), 0);
}
