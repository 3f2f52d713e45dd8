/// Structured audit events for scorebox
///
/// Every event is one JSON line logged at info under the `scorebox::audit`
/// target, so deployments can route it separately with RUST_LOG. User source
/// never appears in an event; only its SHA-256 digest does.
use crate::protocol::ErrorKind;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const AUDIT_TARGET: &str = "scorebox::audit";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    EnvironmentCreated,
    EnvironmentRejected,
    RequestDispatched,
    RequestCompleted,
    RequestTimedOut,
    PoolExhausted,
}

impl AuditEventType {
    pub fn default_severity(self) -> AuditSeverity {
        match self {
            AuditEventType::EnvironmentRejected | AuditEventType::RequestTimedOut => AuditSeverity::High,
            AuditEventType::PoolExhausted => AuditSeverity::Medium,
            AuditEventType::EnvironmentCreated
            | AuditEventType::RequestDispatched
            | AuditEventType::RequestCompleted => AuditSeverity::Low,
        }
    }
}

/// Ids that tie an event to a request, an instance and a runner process
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CorrelationIds {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_pid: Option<u32>,
}

impl CorrelationIds {
    pub fn request(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    pub fn instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id.into()),
            ..Self::default()
        }
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_runner_pid(mut self, pid: impl Into<Option<u32>>) -> Self {
        self.runner_pid = pid.into();
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub correlation: CorrelationIds,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, correlation: CorrelationIds, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            severity: event_type.default_severity(),
            correlation,
            details: details.into(),
            request_kind: None,
            source_sha256: None,
            error_kind: None,
            elapsed_ms: None,
        }
    }

    pub fn with_request_kind(mut self, kind: &'static str) -> Self {
        self.request_kind = Some(kind);
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source_sha256 = Some(source_digest(source));
        self
    }

    pub fn with_error_kind(mut self, kind: Option<ErrorKind>) -> Self {
        self.error_kind = kind;
        self
    }

    pub fn with_elapsed(mut self, elapsed: std::time::Duration) -> Self {
        self.elapsed_ms = Some(elapsed.as_millis() as u64);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"event_type\":\"{:?}\",\"details\":\"unserializable audit event: {}\"}}",
                self.event_type, e
            )
        })
    }
}

/// Hex SHA-256 of user source
pub fn source_digest(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Severity travels inside the JSON line; the log level is always info
pub fn log_audit_event(event: AuditEvent) {
    log::info!(target: AUDIT_TARGET, "{}", event.to_json());
}

pub fn environment_created(instance_id: &str, runner_pid: u32, controls: &[String]) {
    log_audit_event(AuditEvent::new(
        AuditEventType::EnvironmentCreated,
        CorrelationIds::instance(instance_id).with_runner_pid(runner_pid),
        format!("controls: {}", controls.join(",")),
    ));
}

pub fn environment_rejected(instance_id: &str, reason: &str) {
    log_audit_event(AuditEvent::new(
        AuditEventType::EnvironmentRejected,
        CorrelationIds::instance(instance_id),
        reason,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let digest = source_digest("class M: pass");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, source_digest("class M: pass"));
        assert_ne!(digest, source_digest("class N: pass"));
        assert_eq!(
            source_digest(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn event_json_omits_empty_fields_and_never_carries_source() {
        let event = AuditEvent::new(
            AuditEventType::RequestDispatched,
            CorrelationIds::request("r1").with_instance("i1"),
            "dispatched",
        )
        .with_request_kind("user_code")
        .with_source("secret = 42");
        let json: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["event_type"], "request_dispatched");
        assert_eq!(json["correlation"]["request_id"], "r1");
        assert!(json["correlation"].get("runner_pid").is_none());
        assert!(json.get("error_kind").is_none());
        assert!(!event.to_json().contains("secret"));
    }

    struct Capture;

    static CAPTURED: std::sync::Mutex<Vec<(log::Level, String)>> = std::sync::Mutex::new(Vec::new());

    impl log::Log for Capture {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.target() == AUDIT_TARGET
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                CAPTURED
                    .lock()
                    .unwrap()
                    .push((record.level(), record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    #[test]
    fn high_severity_events_are_logged_at_info_with_runner_pid() {
        if log::set_boxed_logger(Box::new(Capture)).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
        log_audit_event(AuditEvent::new(
            AuditEventType::RequestTimedOut,
            CorrelationIds::request("r-timeout").with_instance("i1").with_runner_pid(4242u32),
            "audit-level-check",
        ));

        let captured = CAPTURED.lock().unwrap();
        let (level, line) = captured
            .iter()
            .find(|(_, line)| line.contains("audit-level-check"))
            .expect("audit event was not logged");
        assert_eq!(*level, log::Level::Info);
        let json: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(json["severity"], "high");
        assert_eq!(json["correlation"]["runner_pid"], 4242);
    }

    #[test]
    fn severity_follows_event_type() {
        assert_eq!(AuditEventType::RequestTimedOut.default_severity(), AuditSeverity::High);
        assert_eq!(AuditEventType::PoolExhausted.default_severity(), AuditSeverity::Medium);
        assert_eq!(AuditEventType::RequestCompleted.default_severity(), AuditSeverity::Low);
    }
}
