//! Job payloads and submission requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use validator::{Validate, ValidationError};

/// Maximum length of an input reference.
pub const MAX_INPUT_REF_LENGTH: usize = 2048;

/// Maximum number of operation parameters.
pub const MAX_PARAMS: usize = 32;

/// Requested GPU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Hardware-accelerated transcode
    Transcode,
    /// Split into fixed-length segments
    Segment,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Transcode => "transcode",
            Operation::Segment => "segment",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a job asks the worker to do. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Operation to perform
    pub operation: Operation,
    /// Input location (URL or absolute path)
    pub input_ref: String,
    /// Operation parameters, passed through to the worker
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl JobPayload {
    pub fn new(operation: Operation, input_ref: impl Into<String>) -> Self {
        Self {
            operation,
            input_ref: input_ref.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add an operation parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Job submission accepted by the API.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitJobRequest {
    pub operation: Operation,

    #[validate(
        length(min = 1, max = 2048, message = "input_ref must be 1-2048 characters"),
        custom(function = "validate_input_ref")
    )]
    pub input_ref: String,

    #[validate(range(min = 1, message = "gpu_cost must be a positive integer"))]
    pub gpu_cost: u32,

    #[serde(default)]
    #[validate(custom(function = "validate_params"))]
    pub params: BTreeMap<String, String>,
}

impl SubmitJobRequest {
    pub fn new(operation: Operation, input_ref: impl Into<String>, gpu_cost: u32) -> Self {
        Self {
            operation,
            input_ref: input_ref.into(),
            gpu_cost,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Check the request and flatten validator output into one message.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|errors| {
            let mut messages: Vec<String> = errors
                .field_errors()
                .into_iter()
                .flat_map(|(field, errs)| {
                    errs.iter().map(move |e| match &e.message {
                        Some(msg) => msg.to_string(),
                        None => format!("{} is invalid ({})", field, e.code),
                    })
                })
                .collect();
            messages.sort();
            messages.join("; ")
        })
    }

    /// Split into the payload recorded in the ledger and the GPU cost.
    pub fn into_parts(self) -> (JobPayload, u32) {
        (
            JobPayload {
                operation: self.operation,
                input_ref: self.input_ref,
                params: self.params,
            },
            self.gpu_cost,
        )
    }
}

/// Input references are http(s)/s3 URLs or absolute paths without traversal.
fn validate_input_ref(input: &str) -> Result<(), ValidationError> {
    let input = input.trim();
    if input.starts_with('/') {
        if input.split('/').any(|part| part == "..") {
            return Err(ValidationError::new("path_traversal")
                .with_message("input_ref must not contain '..'".into()));
        }
        return Ok(());
    }

    let parsed = Url::parse(input).map_err(|_| {
        ValidationError::new("invalid_input_ref")
            .with_message("input_ref must be a URL or an absolute path".into())
    })?;

    match parsed.scheme() {
        "http" | "https" | "s3" | "file" => Ok(()),
        _ => Err(ValidationError::new("unsupported_scheme")
            .with_message("input_ref scheme must be http, https, s3 or file".into())),
    }
}

fn validate_params(params: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if params.len() > MAX_PARAMS {
        return Err(ValidationError::new("too_many_params")
            .with_message(format!("at most {} params are allowed", MAX_PARAMS).into()));
    }
    let valid_key = |k: &String| {
        !k.is_empty()
            && k.len() <= 64
            && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if !params.keys().all(valid_key) {
        return Err(ValidationError::new("invalid_param_key")
            .with_message("param keys must be 1-64 chars of [A-Za-z0-9_-]".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_request() {
        let req = SubmitJobRequest::new(Operation::Transcode, "https://cdn.example.com/a.mp4", 2)
            .with_param("codec", "h264_nvenc");
        assert!(req.check().is_ok());

        let (payload, cost) = req.into_parts();
        assert_eq!(cost, 2);
        assert_eq!(payload.params.get("codec").map(String::as_str), Some("h264_nvenc"));
    }

    #[test]
    fn test_zero_cost_rejected() {
        let req = SubmitJobRequest::new(Operation::Segment, "/media/in.mp4", 0);
        let err = req.check().unwrap_err();
        assert!(err.contains("gpu_cost"));
    }

    #[test]
    fn test_bad_input_refs_rejected() {
        for input in ["", "relative/path.mp4", "ftp://host/file", "/media/../etc/passwd"] {
            let req = SubmitJobRequest::new(Operation::Transcode, input, 1);
            assert!(req.check().is_err(), "accepted {:?}", input);
        }
    }

    #[test]
    fn test_bad_param_keys_rejected() {
        let req = SubmitJobRequest::new(Operation::Transcode, "/media/in.mp4", 1)
            .with_param("bad key", "x");
        assert!(req.check().is_err());
    }

    #[test]
    fn test_payload_serialization_skips_empty_params() {
        let payload = JobPayload::new(Operation::Segment, "/media/in.mp4");
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["operation"], "segment");
        assert!(value.get("params").is_none());
    }
}
