//! Abort responses in FHIR OperationOutcome format.

use std::sync::Arc;

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// Generic text of the 503 response. Backend error details never reach
/// the client.
pub const SERVICE_UNAVAILABLE_TEXT: &str = "Authentication service unavailable";

// =============================================================================
// OperationOutcome
// =============================================================================

/// FHIR issue type codes used by the middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCode {
    Login,
    Forbidden,
    Exception,
}

/// Text details of an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDetails {
    pub text: String,
}

/// A single OperationOutcome issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: String,
    pub code: IssueCode,
    pub details: IssueDetails,
}

/// FHIR OperationOutcome body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    pub issue: Vec<Issue>,
}

impl OperationOutcome {
    /// An outcome with a single error issue.
    #[must_use]
    pub fn error(code: IssueCode, text: impl Into<String>) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![Issue {
                severity: "error".to_string(),
                code,
                details: IssueDetails { text: text.into() },
            }],
        }
    }
}

// =============================================================================
// Abort Response
// =============================================================================

/// Response that terminates the pipeline for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortResponse {
    pub status: StatusCode,
    pub outcome: OperationOutcome,
    /// Value of the `WWW-Authenticate` header, set on 401 responses.
    pub www_authenticate: Option<String>,
}

impl AbortResponse {
    /// 401 with a `login` issue and a Bearer challenge for `realm`.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>, realm: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            outcome: OperationOutcome::error(IssueCode::Login, message),
            www_authenticate: Some(format!("Bearer realm=\"{}\"", realm.replace('"', ""))),
        }
    }

    /// 403 with a `forbidden` issue.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            outcome: OperationOutcome::error(IssueCode::Forbidden, message),
            www_authenticate: None,
        }
    }

    /// 503 with an `exception` issue and generic text.
    #[must_use]
    pub fn service_unavailable() -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            outcome: OperationOutcome::error(IssueCode::Exception, SERVICE_UNAVAILABLE_TEXT),
            www_authenticate: None,
        }
    }

    /// 500 with an `exception` issue; used when the pipeline is misconfigured.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            outcome: OperationOutcome::error(IssueCode::Exception, message),
            www_authenticate: None,
        }
    }
}

impl IntoResponse for AbortResponse {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/fhir+json"),
        );

        if let Some(challenge) = &self.www_authenticate
            && let Ok(value) = HeaderValue::from_str(challenge)
        {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }

        (self.status, headers, Json(self.outcome)).into_response()
    }
}

// =============================================================================
// Failure Handlers
// =============================================================================

/// Which abort path a failure takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Missing, invalid or expired credentials (401).
    Unauthenticated,
    /// Recognized caller, not allowed (403).
    Unauthorized,
    /// The authentication backend errored (503).
    Backend,
}

/// Failure description handed to custom abort handlers.
#[derive(Debug, Clone)]
pub struct AuthFailure {
    pub kind: FailureKind,

    /// Client-facing message; generic for backend errors.
    pub message: String,

    /// Raw backend error text. Only set for [`FailureKind::Backend`].
    pub detail: Option<String>,

    pub strategy: Option<String>,

    /// Path of the rejected request.
    pub path: String,
}

/// Custom constructor of abort responses.
pub type AbortHandler = Arc<dyn Fn(&AuthFailure) -> AbortResponse + Send + Sync>;
