use super::{FileOutputs, InferenceClient, InferenceError, PredictArg};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Record of a call made to the mock client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub api_name: String,
    pub args: Vec<PredictArg>,
    pub files: FileOutputs,
    /// Whether every file argument existed on disk at call time
    pub files_present: bool,
}

/// Mock inference client for testing.
///
/// Responses are queued per api name and returned in FIFO order. Calls with nothing queued fail
/// with a protocol error so a missing setup shows up as a 500 rather than a hang.
///
/// # Example
/// ```ignore
/// let mock = MockInferenceClient::new();
/// mock.add_outputs("/use_output_as_input", vec![]);
/// mock.add_outputs("/inpaint", vec![json!({ "path": "/tmp/out.webp" })]);
/// ```
#[derive(Clone, Default)]
pub struct MockInferenceClient {
    responses: Arc<Mutex<HashMap<String, VecDeque<Result<Vec<Value>, InferenceError>>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, api_name: &str, response: Result<Vec<Value>, InferenceError>) {
        self.responses
            .lock()
            .entry(api_name.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn add_outputs(&self, api_name: &str, outputs: Vec<Value>) {
        self.add_response(api_name, Ok(outputs));
    }

    pub fn add_error(&self, api_name: &str, message: &str) {
        self.add_response(
            api_name,
            Err(InferenceError::Remote {
                api_name: api_name.to_string(),
                message: message.to_string(),
            }),
        );
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl InferenceClient for MockInferenceClient {
    async fn predict(
        &self,
        api_name: &str,
        args: Vec<PredictArg>,
        files: FileOutputs,
    ) -> Result<Vec<Value>, InferenceError> {
        let files_present = args.iter().all(|arg| match arg {
            PredictArg::File(path) => path.exists(),
            PredictArg::Value(_) => true,
        });
        self.calls.lock().push(MockCall {
            api_name: api_name.to_string(),
            args,
            files,
            files_present,
        });

        self.responses
            .lock()
            .get_mut(api_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(InferenceError::Protocol(format!("No mock response configured for {api_name}"))))
    }
}
