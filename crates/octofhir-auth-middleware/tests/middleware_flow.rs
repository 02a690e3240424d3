//! End-to-end tests of the authentication pipeline with mock collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderValue, Request, StatusCode, header, request::Parts},
    middleware::from_fn_with_state,
    routing::get,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::ServiceExt;

use octofhir_auth_middleware::audit::{AuditError, AuditManager, AuthAuditEvent, AuthEventType};
use octofhir_auth_middleware::middleware::{
    AbortResponse, Authenticated, FailureKind, authentication_layer,
};
use octofhir_auth_middleware::{
    AuthCache, AuthError, AuthManager, AuthMiddleware, AuthResult, AuthenticatedUser,
    AuthenticationResult, DefaultPolicy, MiddlewareConfig, MiddlewareOutcome, PermissionSet,
    RequestContext, ResourcePermission,
};

// -----------------------------------------------------------------------------
// Mocks
// -----------------------------------------------------------------------------

enum Behavior {
    Succeed,
    Fail { status: u16, error: &'static str },
    Error(&'static str),
    Unauthorized(&'static str),
    Forbidden(&'static str),
}

struct MockAuthManager {
    behavior: Behavior,
    calls: AtomicUsize,
}

impl MockAuthManager {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthManager for MockAuthManager {
    async fn authenticate(
        &self,
        _request: &Parts,
        _context: &RequestContext,
    ) -> AuthResult<AuthenticationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Succeed => Ok(AuthenticationResult::success(test_user(), "bearer")),
            Behavior::Fail { status, error } => {
                Ok(AuthenticationResult::failure(*error, *status).with_strategy("bearer"))
            }
            Behavior::Error(message) => Err(AuthError::backend(*message)),
            Behavior::Unauthorized(message) => Err(AuthError::unauthorized(*message)),
            Behavior::Forbidden(message) => Err(AuthError::forbidden(*message)),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<AuthAuditEvent>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<AuthAuditEvent> {
        self.events.lock().clone()
    }

    fn types(&self) -> Vec<AuthEventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }
}

#[async_trait]
impl AuditManager for RecordingSink {
    async fn log(&self, event: AuthAuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}

fn test_user() -> AuthenticatedUser {
    AuthenticatedUser::new("practitioner-1")
        .with_role("practitioner")
        .with_permissions(
            PermissionSet {
                can_write: Some(false),
                ..Default::default()
            }
            .with_resource(
                "Patient",
                ResourcePermission {
                    update: Some(true),
                    ..Default::default()
                },
            ),
        )
}

fn build(
    manager: Arc<MockAuthManager>,
    sink: Arc<RecordingSink>,
    config: MiddlewareConfig,
) -> AuthMiddleware {
    AuthMiddleware::builder(manager)
        .audit_sink(sink)
        .config(config)
        .build()
        .unwrap()
}

fn request(path: &str, authorization: Option<&str>) -> Parts {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(value) = authorization {
        builder = builder.header(header::AUTHORIZATION, value);
    }
    builder.body(()).unwrap().into_parts().0
}

// -----------------------------------------------------------------------------
// Skip rules
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_skipped_path_never_calls_auth_manager() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let sink = Arc::new(RecordingSink::default());
    let mw = build(
        manager.clone(),
        sink.clone(),
        MiddlewareConfig {
            skip_paths: vec!["/health".to_string()],
            ..Default::default()
        },
    );

    let outcome = mw
        .before(&request("/health", Some("Bearer t")), RequestContext::default())
        .await;

    let ctx = outcome.context().expect("request should proceed");
    assert!(!ctx.is_authenticated);
    assert!(!ctx.check_permission("Patient", "read", None));
    assert_eq!(manager.calls(), 0);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, AuthEventType::Attempt);
    assert!(events[0].flag("skipped"));
    assert_eq!(events[0].metadata["reason"], "path_excluded");
}

#[tokio::test]
async fn test_only_paths_allowlist_overrides_skip_paths() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let sink = Arc::new(RecordingSink::default());
    let mw = build(
        manager.clone(),
        sink.clone(),
        MiddlewareConfig {
            only_paths: vec!["/fhir/*".to_string()],
            skip_paths: vec!["/fhir/*".to_string()],
            ..Default::default()
        },
    );

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;
    assert!(outcome.context().unwrap().is_authenticated);
    assert_eq!(manager.calls(), 1);

    let outcome = mw
        .before(&request("/admin", Some("Bearer t")), RequestContext::default())
        .await;
    assert!(!outcome.context().unwrap().is_authenticated);
    assert_eq!(manager.calls(), 1);
}

// -----------------------------------------------------------------------------
// Authentication outcomes
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_successful_authentication_attaches_permissions() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let sink = Arc::new(RecordingSink::default());
    let mw = build(manager.clone(), sink.clone(), MiddlewareConfig::default());

    let outcome = mw
        .before(&request("/fhir/Patient/1", Some("Bearer good")), RequestContext::default())
        .await;

    let ctx = outcome.context().unwrap();
    assert!(ctx.is_authenticated);
    assert!(!ctx.cache_hit);
    assert_eq!(ctx.user_id(), Some("practitioner-1"));
    assert_eq!(ctx.strategy.as_deref(), Some("bearer"));
    assert!(ctx.has_role("practitioner"));
    // canWrite=false beats the resource-level update grant
    assert!(!ctx.check_permission("Patient", "update", None));
    assert!(ctx.check_permission("Patient", "read", None));

    assert_eq!(
        sink.types(),
        vec![AuthEventType::Attempt, AuthEventType::Success]
    );
    let success = &sink.events()[1];
    assert_eq!(success.user_id.as_deref(), Some("practitioner-1"));
    assert_eq!(success.strategy.as_deref(), Some("bearer"));
    assert!(success.duration_ms.is_some());
    assert!(!success.flag("cacheHit"));
}

#[tokio::test]
async fn test_expired_token_produces_login_issue() {
    let manager = MockAuthManager::new(Behavior::Fail {
        status: 401,
        error: "expired token",
    });
    let sink = Arc::new(RecordingSink::default());
    let mw = build(manager, sink.clone(), MiddlewareConfig::default());

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer old")), RequestContext::default())
        .await;

    let response = outcome.abort_response().expect("request should abort");
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let issue = &response.outcome.issue[0];
    assert_eq!(serde_json::to_value(issue.code).unwrap(), "login");
    assert!(issue.details.text.contains("expired token"));
    assert_eq!(
        response.www_authenticate.as_deref(),
        Some("Bearer realm=\"octofhir\"")
    );

    assert_eq!(
        sink.types(),
        vec![AuthEventType::Attempt, AuthEventType::Failure]
    );
    assert_eq!(sink.events()[1].error.as_deref(), Some("expired token"));
}

#[tokio::test]
async fn test_forbidden_result_produces_forbidden_issue() {
    let manager = MockAuthManager::new(Behavior::Fail {
        status: 403,
        error: "account locked",
    });
    let mw = build(
        manager,
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;

    let response = outcome.abort_response().unwrap();
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(
        serde_json::to_value(response.outcome.issue[0].code).unwrap(),
        "forbidden"
    );
    assert!(response.www_authenticate.is_none());
}

#[tokio::test]
async fn test_failure_with_allow_anonymous_proceeds() {
    let manager = MockAuthManager::new(Behavior::Fail {
        status: 401,
        error: "no credentials",
    });
    let sink = Arc::new(RecordingSink::default());
    let mw = build(
        manager,
        sink.clone(),
        MiddlewareConfig {
            allow_anonymous: true,
            ..Default::default()
        },
    );

    let outcome = mw
        .before(&request("/fhir/Patient", None), RequestContext::default())
        .await;

    let ctx = outcome.context().unwrap();
    assert!(!ctx.is_authenticated);
    assert!(!ctx.has_permission("anything"));
    assert_eq!(
        sink.types(),
        vec![AuthEventType::Attempt, AuthEventType::Failure]
    );
}

#[tokio::test]
async fn test_backend_error_becomes_generic_503() {
    let manager = MockAuthManager::new(Behavior::Error("connection refused to 10.1.2.3:5432"));
    let sink = Arc::new(RecordingSink::default());
    let mw = build(manager, sink.clone(), MiddlewareConfig::default());

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;

    let response = outcome.abort_response().unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    let issue = &response.outcome.issue[0];
    assert_eq!(serde_json::to_value(issue.code).unwrap(), "exception");
    assert!(!issue.details.text.contains("connection refused"));

    let types = sink.types();
    assert!(!types.contains(&AuthEventType::Success));
    assert_eq!(types.last(), Some(&AuthEventType::Failure));
    for event in sink.events() {
        assert!(
            !event
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("connection refused")
        );
    }
}

#[tokio::test]
async fn test_unauthorized_error_takes_login_path() {
    let manager = MockAuthManager::new(Behavior::Unauthorized("expired token"));
    let sink = Arc::new(RecordingSink::default());
    let mw = build(manager, sink.clone(), MiddlewareConfig::default());

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer old")), RequestContext::default())
        .await;

    let response = outcome.abort_response().unwrap();
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    let issue = &response.outcome.issue[0];
    assert_eq!(serde_json::to_value(issue.code).unwrap(), "login");
    assert_eq!(issue.details.text, "expired token");
    assert_eq!(
        response.www_authenticate.as_deref(),
        Some("Bearer realm=\"octofhir\"")
    );

    assert_eq!(
        sink.types(),
        vec![AuthEventType::Attempt, AuthEventType::Failure]
    );
    let failure = &sink.events()[1];
    assert_eq!(failure.error.as_deref(), Some("expired token"));
    assert!(!failure.flag("backendError"));
}

#[tokio::test]
async fn test_forbidden_error_takes_forbidden_path() {
    let manager = MockAuthManager::new(Behavior::Forbidden("account locked"));
    let mw = build(
        manager,
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;

    let response = outcome.abort_response().unwrap();
    assert_eq!(response.status, StatusCode::FORBIDDEN);
    assert_eq!(
        serde_json::to_value(response.outcome.issue[0].code).unwrap(),
        "forbidden"
    );
    assert_eq!(response.outcome.issue[0].details.text, "account locked");
}

#[tokio::test]
async fn test_unauthorized_error_with_allow_anonymous_proceeds() {
    let manager = MockAuthManager::new(Behavior::Unauthorized("no credentials"));
    let mw = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig {
            allow_anonymous: true,
            ..Default::default()
        },
    );

    for _ in 0..2 {
        let outcome = mw
            .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
            .await;
        assert!(!outcome.context().unwrap().is_authenticated);
    }

    // the rejection is cached like any other failed result
    assert_eq!(manager.calls(), 1);
}

#[tokio::test]
async fn test_backend_error_is_not_cached() {
    let manager = MockAuthManager::new(Behavior::Error("boom"));
    let mw = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    for _ in 0..2 {
        let _ = mw
            .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
            .await;
    }

    assert_eq!(manager.calls(), 2);
    assert!(mw.cache().unwrap().is_empty());
}

// -----------------------------------------------------------------------------
// Caching
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_identical_credentials_are_served_from_cache() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let sink = Arc::new(RecordingSink::default());
    let mw = build(manager.clone(), sink.clone(), MiddlewareConfig::default());

    let first = mw
        .before(&request("/fhir/Patient", Some("Bearer same")), RequestContext::default())
        .await;
    assert!(!first.context().unwrap().cache_hit);

    tokio::time::advance(Duration::from_millis(900)).await;

    let second = mw
        .before(&request("/fhir/Observation", Some("Bearer same")), RequestContext::default())
        .await;
    let ctx = second.context().unwrap();
    assert!(ctx.cache_hit);
    assert!(ctx.is_authenticated);
    assert_eq!(ctx.user_id(), Some("practitioner-1"));

    assert_eq!(manager.calls(), 1);
    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].event_type, AuthEventType::Success);
    assert!(events[2].flag("cacheHit"));
}

#[tokio::test(start_paused = true)]
async fn test_expired_cache_entry_triggers_reauthentication() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let mw = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    let _ = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;
    tokio::time::advance(Duration::from_millis(5000)).await;
    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;

    assert!(!outcome.context().unwrap().cache_hit);
    assert_eq!(manager.calls(), 2);
}

#[tokio::test]
async fn test_different_credentials_do_not_share_cache_entries() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let mw = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    let _ = mw
        .before(&request("/fhir/Patient", Some("Bearer a")), RequestContext::default())
        .await;
    let _ = mw
        .before(&request("/fhir/Patient", Some("Bearer b")), RequestContext::default())
        .await;

    assert_eq!(manager.calls(), 2);
    assert_eq!(mw.cache().unwrap().len(), 2);
}

#[tokio::test]
async fn test_cached_failure_is_reauthenticated_without_anonymous() {
    let manager = MockAuthManager::new(Behavior::Fail {
        status: 401,
        error: "bad token",
    });
    let mw = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    for _ in 0..2 {
        let outcome = mw
            .before(&request("/fhir/Patient", Some("Bearer bad")), RequestContext::default())
            .await;
        assert!(matches!(outcome, MiddlewareOutcome::Abort(_)));
    }

    assert_eq!(manager.calls(), 2);
}

#[tokio::test]
async fn test_cached_failure_with_anonymous_skips_backend() {
    let manager = MockAuthManager::new(Behavior::Fail {
        status: 401,
        error: "bad token",
    });
    let sink = Arc::new(RecordingSink::default());
    let mw = build(
        manager.clone(),
        sink.clone(),
        MiddlewareConfig {
            allow_anonymous: true,
            ..Default::default()
        },
    );

    for _ in 0..2 {
        let outcome = mw
            .before(&request("/fhir/Patient", Some("Bearer bad")), RequestContext::default())
            .await;
        assert!(!outcome.context().unwrap().is_authenticated);
    }

    assert_eq!(manager.calls(), 1);
    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].event_type, AuthEventType::Failure);
    assert!(events[2].flag("cacheHit"));
}

#[tokio::test]
async fn test_shared_cache_is_injected_explicitly() {
    let cache = Arc::new(AuthCache::new(10, Duration::from_secs(5)));
    let manager = MockAuthManager::new(Behavior::Succeed);

    let first = AuthMiddleware::builder(manager.clone())
        .cache(Arc::clone(&cache))
        .audit_sink(Arc::new(RecordingSink::default()))
        .build()
        .unwrap();
    let second = AuthMiddleware::builder(manager.clone())
        .cache(Arc::clone(&cache))
        .audit_sink(Arc::new(RecordingSink::default()))
        .build()
        .unwrap();
    let isolated = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig::default(),
    );

    let req = || request("/fhir/Patient", Some("Bearer shared"));
    let _ = first.before(&req(), RequestContext::default()).await;
    let _ = second.before(&req(), RequestContext::default()).await;
    assert_eq!(manager.calls(), 1);

    let _ = isolated.before(&req(), RequestContext::default()).await;
    assert_eq!(manager.calls(), 2);
}

#[tokio::test]
async fn test_caching_disabled_always_calls_backend() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let mw = build(
        manager.clone(),
        Arc::new(RecordingSink::default()),
        MiddlewareConfig {
            cache_results: false,
            ..Default::default()
        },
    );

    for _ in 0..3 {
        let _ = mw
            .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
            .await;
    }

    assert_eq!(manager.calls(), 3);
}

// -----------------------------------------------------------------------------
// Configuration switches
// -----------------------------------------------------------------------------

#[tokio::test]
async fn test_audit_disabled_emits_nothing() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let sink = Arc::new(RecordingSink::default());
    let mw = build(
        manager,
        sink.clone(),
        MiddlewareConfig {
            audit_enabled: false,
            ..Default::default()
        },
    );

    let _ = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;

    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn test_deny_default_policy_reaches_request_context() {
    let manager = MockAuthManager::new(Behavior::Succeed);
    let mw = build(
        manager,
        Arc::new(RecordingSink::default()),
        MiddlewareConfig {
            default_policy: DefaultPolicy::Deny,
            ..Default::default()
        },
    );

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;
    let ctx = outcome.context().unwrap();

    assert!(!ctx.check_permission("Observation", "read", None));
    assert!(!ctx.check_permission("Patient", "read", None));
}

#[tokio::test]
async fn test_custom_handlers_override_default_responses() {
    let manager = MockAuthManager::new(Behavior::Fail {
        status: 401,
        error: "expired token",
    });
    let mw = AuthMiddleware::builder(manager)
        .audit_sink(Arc::new(RecordingSink::default()))
        .on_unauthenticated(|failure| {
            assert_eq!(failure.kind, FailureKind::Unauthenticated);
            AbortResponse::unauthenticated(format!("custom: {}", failure.message), "tenant-a")
        })
        .build()
        .unwrap();

    let outcome = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;
    let response = outcome.abort_response().unwrap();

    assert_eq!(response.outcome.issue[0].details.text, "custom: expired token");
    assert_eq!(
        response.www_authenticate.as_deref(),
        Some("Bearer realm=\"tenant-a\"")
    );
}

#[tokio::test]
async fn test_on_error_handler_receives_backend_detail() {
    let manager = MockAuthManager::new(Behavior::Error("ldap timeout"));
    let seen = Arc::new(Mutex::new(None));
    let seen_in_handler = Arc::clone(&seen);
    let mw = AuthMiddleware::builder(manager)
        .audit_sink(Arc::new(RecordingSink::default()))
        .on_error(move |failure| {
            *seen_in_handler.lock() = failure.detail.clone();
            AbortResponse::service_unavailable()
        })
        .build()
        .unwrap();

    let _ = mw
        .before(&request("/fhir/Patient", Some("Bearer t")), RequestContext::default())
        .await;

    let detail = seen.lock().clone().unwrap();
    assert!(detail.contains("ldap timeout"));
}

// -----------------------------------------------------------------------------
// Axum integration
// -----------------------------------------------------------------------------

async fn whoami(Authenticated(ctx): Authenticated) -> String {
    ctx.user_id().unwrap_or("anonymous").to_string()
}

fn app(manager: Arc<MockAuthManager>) -> Router {
    let mw = Arc::new(build(
        manager,
        Arc::new(RecordingSink::default()),
        MiddlewareConfig {
            skip_paths: vec!["/health".to_string()],
            ..Default::default()
        },
    ));
    Router::new()
        .route("/health", get(whoami))
        .route("/fhir/Patient", get(whoami))
        .layer(from_fn_with_state(mw, authentication_layer))
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_axum_layer_passes_context_to_handlers() {
    let app = app(MockAuthManager::new(Behavior::Succeed));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/fhir/Patient")
                .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "practitioner-1");

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "anonymous");
}

#[tokio::test]
async fn test_axum_layer_returns_operation_outcome_on_failure() {
    let app = app(MockAuthManager::new(Behavior::Fail {
        status: 401,
        error: "expired token",
    }));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/fhir/Patient")
                .header(header::AUTHORIZATION, "Bearer old")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer realm=\"octofhir\""
    );
    let json: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(
        json,
        json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": "login",
                "details": {"text": "expired token"}
            }]
        })
    );
}
