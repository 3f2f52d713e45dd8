//! Execution protocol types shared by the host and the sandbox runner.

pub mod codec;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub use codec::{bound_diagnostic, MAX_DIAGNOSTIC_CHARS};

/// How the scoring input is handed to the implementation
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Input fields are expanded as keyword arguments
    #[default]
    Standard,
    /// Input is passed whole as a single positional argument
    ThreadLevel,
}

impl PayloadKind {
    pub fn is_thread_level(self) -> bool {
        matches!(self, PayloadKind::ThreadLevel)
    }
}

/// One unit of scoring work
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionRequest {
    /// Caller-supplied source defining exactly one scoring implementation
    UserCode {
        source: String,
        #[serde(default)]
        input: Map<String, Value>,
        #[serde(default)]
        payload_kind: PayloadKind,
    },
    /// Reference to a pre-registered built-in metric
    CatalogRef {
        metric_id: String,
        #[serde(default)]
        init_config: Map<String, Value>,
        #[serde(default)]
        scoring_kwargs: Map<String, Value>,
        #[serde(default)]
        payload_kind: PayloadKind,
    },
}

impl ExecutionRequest {
    pub fn user_code(source: impl Into<String>, input: Map<String, Value>) -> Self {
        ExecutionRequest::UserCode {
            source: source.into(),
            input,
            payload_kind: PayloadKind::Standard,
        }
    }

    pub fn catalog(
        metric_id: impl Into<String>,
        init_config: Map<String, Value>,
        scoring_kwargs: Map<String, Value>,
    ) -> Self {
        ExecutionRequest::CatalogRef {
            metric_id: metric_id.into(),
            init_config,
            scoring_kwargs,
            payload_kind: PayloadKind::Standard,
        }
    }

    /// Switch the request to thread-level invocation
    pub fn thread_level(mut self) -> Self {
        match &mut self {
            ExecutionRequest::UserCode { payload_kind, .. }
            | ExecutionRequest::CatalogRef { payload_kind, .. } => {
                *payload_kind = PayloadKind::ThreadLevel
            }
        }
        self
    }

    pub fn payload_kind(&self) -> PayloadKind {
        match self {
            ExecutionRequest::UserCode { payload_kind, .. }
            | ExecutionRequest::CatalogRef { payload_kind, .. } => *payload_kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ExecutionRequest::UserCode { .. } => "user_code",
            ExecutionRequest::CatalogRef { .. } => "catalog_ref",
        }
    }
}

/// Normalized unit of scoring output
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoreRecord {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_name: Option<String>,
}

impl ScoreRecord {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            reason: None,
            category_name: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Closed failure taxonomy
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidCode,
    MissingImplementation,
    UnknownMetric,
    EvaluationError,
    Timeout,
    PoolExhausted,
    NoScoreProduced,
}

impl ErrorKind {
    /// Status class a request front end should answer with
    pub fn status_class(self) -> u16 {
        match self {
            ErrorKind::Timeout => 504,
            ErrorKind::PoolExhausted => 503,
            ErrorKind::InvalidCode
            | ErrorKind::MissingImplementation
            | ErrorKind::UnknownMetric
            | ErrorKind::NoScoreProduced
            | ErrorKind::EvaluationError => 400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidCode => "invalid_code",
            ErrorKind::MissingImplementation => "missing_implementation",
            ErrorKind::UnknownMetric => "unknown_metric",
            ErrorKind::EvaluationError => "evaluation_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::NoScoreProduced => "no_score_produced",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one request
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success { scores: Vec<ScoreRecord> },
    Failure { kind: ErrorKind, message: String },
}

impl ExecutionResult {
    pub fn success(scores: Vec<ScoreRecord>) -> Self {
        ExecutionResult::Success { scores }
    }

    /// Build a failure; the message is length-bounded here
    pub fn failure(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        ExecutionResult::Failure {
            kind,
            message: bound_diagnostic(message.as_ref()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionResult::Failure { kind, .. } => Some(*kind),
            ExecutionResult::Success { .. } => None,
        }
    }

    pub fn scores(&self) -> &[ScoreRecord] {
        match self {
            ExecutionResult::Success { scores } => scores,
            ExecutionResult::Failure { .. } => &[],
        }
    }

    /// Re-apply the diagnostic bound to a result decoded from an untrusted peer
    pub fn bounded(self) -> Self {
        match self {
            ExecutionResult::Failure { kind, message } => ExecutionResult::failure(kind, message),
            success => success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape_defaults_payload_kind() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "type": "catalog_ref",
            "metric_id": "Equals",
            "scoring_kwargs": {"output": "a", "reference": "a"}
        }))
        .unwrap();
        assert_eq!(request.payload_kind(), PayloadKind::Standard);
        match request {
            ExecutionRequest::CatalogRef {
                metric_id,
                init_config,
                ..
            } => {
                assert_eq!(metric_id, "Equals");
                assert!(init_config.is_empty());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn thread_level_marker_survives_serialization() {
        let request = ExecutionRequest::user_code("pass", Map::new()).thread_level();
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["type"], "user_code");
        assert_eq!(value["payload_kind"], "thread_level");
    }

    #[test]
    fn failure_serializes_with_snake_case_kind() {
        let result = ExecutionResult::failure(ErrorKind::NoScoreProduced, "nothing");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"status": "failure", "kind": "no_score_produced", "message": "nothing"}));
    }

    #[test]
    fn optional_record_fields_are_omitted() {
        let value = serde_json::to_value(ScoreRecord::new("m", 0.5)).unwrap();
        assert_eq!(value, json!({"name": "m", "value": 0.5}));
    }

    #[test]
    fn status_classes_follow_front_end_mapping() {
        assert_eq!(ErrorKind::Timeout.status_class(), 504);
        assert_eq!(ErrorKind::PoolExhausted.status_class(), 503);
        assert_eq!(ErrorKind::UnknownMetric.status_class(), 400);
        assert_eq!(ErrorKind::NoScoreProduced.status_class(), 400);
    }

    #[test]
    fn bounded_clamps_oversized_peer_messages() {
        let huge = ExecutionResult::Failure {
            kind: ErrorKind::EvaluationError,
            message: "x".repeat(MAX_DIAGNOSTIC_CHARS * 3),
        };
        match huge.bounded() {
            ExecutionResult::Failure { message, .. } => {
                assert!(message.chars().count() <= MAX_DIAGNOSTIC_CHARS)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
