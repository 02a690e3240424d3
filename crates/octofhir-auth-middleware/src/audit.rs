//! Authentication audit events.
//!
//! Every request handled by the middleware produces exactly one terminal
//! event (`Success` or `Failure`, or an `Attempt` tagged `skipped` for
//! bypassed paths), preceded by one `Attempt` event whenever the
//! authentication backend is actually called.
//!
//! Events are handed to an [`AuditManager`]; persisting them is the sink's
//! job. Sink failures are logged and never affect the request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, request::Parts};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::AuditLevel;

// =============================================================================
// Event Types
// =============================================================================

/// Kind of authentication event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEventType {
    /// Authentication is about to run, or was skipped for the path.
    Attempt,
    /// The request was authenticated.
    Success,
    /// Authentication failed or the backend errored.
    Failure,
}

impl AuthEventType {
    /// Returns the subtype code used in FHIR AuditEvents.
    pub fn to_subtype_code(&self) -> &'static str {
        match self {
            AuthEventType::Attempt => "user.login_attempt",
            AuthEventType::Success => "user.login",
            AuthEventType::Failure => "user.login_failed",
        }
    }

    /// Returns a human-readable display name.
    pub fn display(&self) -> &'static str {
        match self {
            AuthEventType::Attempt => "Login Attempt",
            AuthEventType::Success => "User Login",
            AuthEventType::Failure => "Login Failed",
        }
    }
}

/// Request information attached at [`AuditLevel::Detailed`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestDetails {
    pub method: String,
    pub path: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

impl RequestDetails {
    /// Extracts request details from request parts.
    pub fn from_parts(parts: &Parts) -> Self {
        let (ip_address, user_agent, request_id) = extract_source(&parts.headers);
        Self {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            ip_address,
            user_agent,
            request_id,
        }
    }
}

/// Client address, user agent and request id from forwarding headers.
fn extract_source(headers: &HeaderMap) -> (Option<String>, Option<String>, Option<String>) {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let ip_address = header("x-forwarded-for")
        .and_then(|s| s.split(',').next())
        .or_else(|| header("x-real-ip"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    (
        ip_address,
        header("user-agent").map(String::from),
        header("x-request-id").map(String::from),
    )
}

/// A structured authentication event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAuditEvent {
    pub id: Uuid,
    pub event_type: AuthEventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestDetails>,
    /// Decision tags such as `skipped`, `reason` and `cacheHit`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AuthAuditEvent {
    /// Create a new event of the given type, stamped now.
    pub fn new(event_type: AuthEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: OffsetDateTime::now_utc(),
            user_id: None,
            strategy: None,
            error: None,
            duration_ms: None,
            request: None,
            metadata: Map::new(),
        }
    }

    /// Set the authenticated user id.
    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Set the strategy name, if known.
    pub fn strategy(mut self, strategy: Option<&str>) -> Self {
        self.strategy = strategy.map(String::from);
        self
    }

    /// Set the failure reason.
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Set how long the backend call took.
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set request details.
    pub fn request(mut self, details: RequestDetails) -> Self {
        self.request = Some(details);
        self
    }

    /// Add a metadata tag.
    pub fn tag(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Returns a metadata tag as a boolean, `false` when absent.
    pub fn flag(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Renders the event as a FHIR R4 AuditEvent resource.
    pub fn to_fhir_audit_event(&self) -> Value {
        let outcome = match self.event_type {
            AuthEventType::Attempt | AuthEventType::Success => "0",
            AuthEventType::Failure => "4",
        };

        let agent = match &self.user_id {
            Some(user_id) => json!({
                "type": {
                    "coding": [{
                        "system": "http://dicom.nema.org/resources/ontology/DCM",
                        "code": "110153",
                        "display": "Source Role ID"
                    }]
                },
                "who": { "identifier": { "value": user_id } },
                "requestor": true
            }),
            None => json!({
                "type": {
                    "coding": [{
                        "system": "http://dicom.nema.org/resources/ontology/DCM",
                        "code": "110150",
                        "display": "Application"
                    }]
                },
                "who": { "display": "OctoFHIR Server" },
                "requestor": false
            }),
        };

        let mut event = json!({
            "resourceType": "AuditEvent",
            "id": self.id.to_string(),
            "type": {
                "system": "http://dicom.nema.org/resources/ontology/DCM",
                "code": "110114",
                "display": "User Authentication"
            },
            "subtype": [{
                "system": "http://octofhir.io/CodeSystem/audit-action",
                "code": self.event_type.to_subtype_code(),
                "display": self.event_type.display()
            }],
            "action": "E",
            "recorded": self
                .timestamp
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            "outcome": outcome,
            "agent": [agent],
            "source": { "observer": { "display": "OctoFHIR Server" } }
        });

        if let Some(error) = &self.error {
            event["outcomeDesc"] = json!(error);
        }

        let mut extensions = Vec::new();
        let mut push = |name: &str, value: &str| {
            extensions.push(json!({
                "url": format!("http://octofhir.io/StructureDefinition/audit-{name}"),
                "valueString": value
            }));
        };

        if let Some(strategy) = &self.strategy {
            push("auth-strategy", strategy);
        }
        if let Some(request) = &self.request {
            if let Some(ip) = &request.ip_address {
                push("source-ip", ip);
            }
            if let Some(ua) = &request.user_agent {
                push("user-agent", ua);
            }
            if let Some(request_id) = &request.request_id {
                push("request-id", request_id);
            }
        }

        if !extensions.is_empty() {
            event["extension"] = json!(extensions);
        }

        event
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Errors reported by an audit sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit sink error: {0}")]
    Sink(String),
}

/// External collaborator that persists or forwards audit events.
#[async_trait]
pub trait AuditManager: Send + Sync {
    /// Record one event.
    async fn log(&self, event: AuthAuditEvent) -> Result<(), AuditError>;
}

/// Audit sink writing events to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditManager for TracingAuditSink {
    async fn log(&self, event: AuthAuditEvent) -> Result<(), AuditError> {
        let path = event.request.as_ref().map(|r| r.path.as_str()).unwrap_or("");
        // bound outside the macro: tracing's field expansion shadows `Value`
        let metadata = Value::Object(event.metadata.clone());
        match event.event_type {
            AuthEventType::Failure => tracing::warn!(
                audit_id = %event.id,
                path = %path,
                strategy = ?event.strategy,
                error = ?event.error,
                duration_ms = ?event.duration_ms,
                "Authentication failed"
            ),
            event_type => tracing::info!(
                audit_id = %event.id,
                event = event_type.to_subtype_code(),
                path = %path,
                user_id = ?event.user_id,
                strategy = ?event.strategy,
                metadata = %metadata,
                "Authentication event"
            ),
        }
        Ok(())
    }
}

// =============================================================================
// Emitter
// =============================================================================

/// Shapes events according to the audit configuration and forwards them.
#[derive(Clone)]
pub struct AuditEmitter {
    sink: Arc<dyn AuditManager>,
    enabled: bool,
    level: AuditLevel,
}

impl AuditEmitter {
    /// Create an emitter forwarding to `sink`.
    pub fn new(sink: Arc<dyn AuditManager>, enabled: bool, level: AuditLevel) -> Self {
        Self {
            sink,
            enabled,
            level,
        }
    }

    /// Starts an event, attaching request details at the detailed level.
    pub fn event(&self, event_type: AuthEventType, parts: &Parts) -> AuthAuditEvent {
        let event = AuthAuditEvent::new(event_type);
        match self.level {
            AuditLevel::Detailed => event.request(RequestDetails::from_parts(parts)),
            AuditLevel::Minimal => event,
        }
    }

    /// Forwards an event to the sink. Sink errors are logged and dropped.
    pub async fn emit(&self, mut event: AuthAuditEvent) {
        if !self.enabled {
            return;
        }

        if self.level == AuditLevel::Minimal {
            event.request = None;
            event.duration_ms = None;
        }

        let id = event.id;
        let event_type = event.event_type;
        if let Err(e) = self.sink.log(event).await {
            tracing::warn!(
                error = %e,
                audit_id = %id,
                event = event_type.to_subtype_code(),
                "Failed to record authentication audit event"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
