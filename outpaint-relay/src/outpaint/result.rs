//! Normalization of the loosely shaped value the inpaint operation returns.

use serde_json::{Map, Value};
use std::path::PathBuf;
use thiserror::Error;

/// The structural shapes the remote endpoint is known to answer with.
///
/// The endpoint's return contract differs between call paths and releases, so the relay accepts
/// all of them and funnels them through [`RemoteResult::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResult {
    /// A bare path string
    Path(String),
    /// A list; only the first element is looked at
    List(Vec<Value>),
    /// A file description carrying a `path` key
    Mapping(Map<String, Value>),
    /// Several outputs at once; the first one is the image
    Tuple(Vec<Value>),
    Unrecognized(Value),
}

/// No path could be extracted from the remote result.
#[derive(Debug, Error)]
#[error("Unexpected result format: {found}")]
pub struct MalformedResult {
    pub found: String,
}

impl RemoteResult {
    /// Build from the outputs of one remote call. A single output keeps its own shape, several
    /// outputs form a [`RemoteResult::Tuple`].
    pub fn from_outputs(outputs: Vec<Value>) -> Self {
        let mut outputs = outputs.into_iter();
        match (outputs.next(), outputs.next()) {
            (None, _) => RemoteResult::Unrecognized(Value::Array(Vec::new())),
            (Some(single), None) => single.into(),
            (Some(first), Some(second)) => RemoteResult::Tuple([first, second].into_iter().chain(outputs).collect()),
        }
    }

    /// Resolve the file-system path of the produced artifact.
    ///
    /// Existence of the path is not checked here.
    pub fn normalize(&self) -> Result<PathBuf, MalformedResult> {
        match self {
            RemoteResult::Path(path) => Ok(PathBuf::from(path)),
            RemoteResult::List(items) => match items.first() {
                Some(Value::Object(map)) => path_field(map).ok_or_else(|| self.malformed()),
                Some(other) => Ok(PathBuf::from(string_form(other))),
                None => Err(self.malformed()),
            },
            RemoteResult::Mapping(map) => path_field(map).ok_or_else(|| self.malformed()),
            RemoteResult::Tuple(items) => match items.first() {
                Some(Value::String(path)) => Ok(PathBuf::from(path)),
                Some(Value::Object(map)) => path_field(map).ok_or_else(|| self.malformed()),
                _ => Err(self.malformed()),
            },
            RemoteResult::Unrecognized(_) => Err(self.malformed()),
        }
    }

    fn malformed(&self) -> MalformedResult {
        let found = match self {
            RemoteResult::Path(path) => Value::String(path.clone()).to_string(),
            RemoteResult::List(items) | RemoteResult::Tuple(items) => Value::Array(items.clone()).to_string(),
            RemoteResult::Mapping(map) => Value::Object(map.clone()).to_string(),
            RemoteResult::Unrecognized(value) => value.to_string(),
        };
        MalformedResult { found }
    }
}

impl From<Value> for RemoteResult {
    fn from(value: Value) -> Self {
        match value {
            Value::String(path) => RemoteResult::Path(path),
            Value::Array(items) => RemoteResult::List(items),
            Value::Object(map) => RemoteResult::Mapping(map),
            other => RemoteResult::Unrecognized(other),
        }
    }
}

fn path_field(map: &Map<String, Value>) -> Option<PathBuf> {
    map.get("path").and_then(Value::as_str).map(PathBuf::from)
}

/// Render a list element the way the endpoint's own client stringifies values, so a bogus path in
/// "Result file not found" reads the same (`None`, `True`, `['a', 1]`).
fn string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => repr(other),
    }
}

fn repr(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let escaped = s.replace('\\', "\\\\");
            if escaped.contains('\'') && !escaped.contains('"') {
                format!("\"{escaped}\"")
            } else {
                format!("'{}'", escaped.replace('\'', "\\'"))
            }
        }
        Value::Array(items) => format!("[{}]", items.iter().map(repr).collect::<Vec<_>>().join(", ")),
        Value::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(key, value)| format!("{}: {}", repr(&Value::String(key.clone())), repr(value)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
