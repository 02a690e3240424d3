//! The per-request authentication pipeline.
//!
//! [`AuthMiddleware::before`] runs these steps for every request:
//!
//! 1. Skip authentication for excluded paths (anonymous context)
//! 2. Serve a fresh cached result for the same credentials
//! 3. Call the [`AuthManager`] and cache its result
//! 4. Abort with 401/403 on failure unless anonymous access is allowed
//! 5. Abort with 503 if the backend errors
//!
//! Each branch records audit events through the [`AuditEmitter`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::http::{
    HeaderMap,
    header::{AUTHORIZATION, COOKIE},
    request::Parts,
};

use crate::{AuthError, AuthResult};
use crate::audit::{AuditEmitter, AuditManager, AuthEventType, TracingAuditSink};
use crate::cache::AuthCache;
use crate::config::{ConfigError, MiddlewareConfig};
use crate::path_matcher::PathMatcher;
use crate::permission::PermissionEvaluator;
use crate::types::AuthenticationResult;

use super::context::{AuthenticatedContext, RequestContext};
use super::response::{
    AbortHandler, AbortResponse, AuthFailure, FailureKind, SERVICE_UNAVAILABLE_TEXT,
};

/// Cookie carrying the session identifier used in cache fingerprints.
pub const SESSION_COOKIE: &str = "sessionId";

// =============================================================================
// Collaborators
// =============================================================================

/// External collaborator that verifies credentials.
///
/// Bad or expired credentials are reported either as an unsuccessful
/// [`AuthenticationResult`] or as [`AuthError::Unauthorized`] /
/// [`AuthError::Forbidden`]; both take the 401/403 path. Any other `Err`
/// is a backend failure and is turned into a 503 by the middleware.
#[async_trait]
pub trait AuthManager: Send + Sync {
    /// Authenticates a request.
    async fn authenticate(
        &self,
        request: &Parts,
        context: &RequestContext,
    ) -> AuthResult<AuthenticationResult>;
}

/// Result of running the middleware for one request.
#[derive(Debug, Clone)]
pub enum MiddlewareOutcome {
    /// Continue the pipeline with this context.
    Proceed(AuthenticatedContext),
    /// Stop the pipeline and send this response.
    Abort(AbortResponse),
}

impl MiddlewareOutcome {
    /// Returns the context if the request may proceed.
    #[must_use]
    pub fn context(&self) -> Option<&AuthenticatedContext> {
        match self {
            Self::Proceed(ctx) => Some(ctx),
            Self::Abort(_) => None,
        }
    }

    /// Returns the abort response if the request was rejected.
    #[must_use]
    pub fn abort_response(&self) -> Option<&AbortResponse> {
        match self {
            Self::Proceed(_) => None,
            Self::Abort(response) => Some(response),
        }
    }
}

// =============================================================================
// Fingerprint
// =============================================================================

/// Cache key for a request: the `Authorization` header and the session
/// cookie, joined with `:`.
///
/// Plain concatenation of header values; nothing is parsed or decoded.
#[must_use]
pub fn fingerprint(headers: &HeaderMap) -> String {
    let authorization = headers
        .get(AUTHORIZATION)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    let session = session_cookie(headers).unwrap_or_default();
    format!("{authorization}:{session}")
}

/// Extracts the session cookie from all `Cookie` headers.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(name, _)| name.trim() == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
}

// =============================================================================
// Middleware
// =============================================================================

/// Authentication middleware shared by all requests of a server.
pub struct AuthMiddleware {
    config: MiddlewareConfig,
    auth_manager: Arc<dyn AuthManager>,
    cache: Option<Arc<AuthCache>>,
    audit: AuditEmitter,
    paths: PathMatcher,
    evaluator: PermissionEvaluator,
    on_unauthenticated: Option<AbortHandler>,
    on_unauthorized: Option<AbortHandler>,
    on_error: Option<AbortHandler>,
}

impl AuthMiddleware {
    /// Starts building a middleware around `auth_manager`.
    pub fn builder(auth_manager: Arc<dyn AuthManager>) -> AuthMiddlewareBuilder {
        AuthMiddlewareBuilder::new(auth_manager)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    /// Returns the authentication cache, if caching is enabled.
    pub fn cache(&self) -> Option<&Arc<AuthCache>> {
        self.cache.as_ref()
    }

    /// Returns the permission evaluator attached to request contexts.
    pub fn evaluator(&self) -> PermissionEvaluator {
        self.evaluator
    }

    /// Decides whether `path` bypasses authentication.
    ///
    /// A non-empty `only_paths` allowlist wins over `skip_paths`.
    pub fn should_skip(&self, path: &str) -> bool {
        if !self.config.only_paths.is_empty() {
            return !self.paths.matches_any(path, &self.config.only_paths);
        }
        if !self.config.skip_paths.is_empty() {
            return self.paths.matches_any(path, &self.config.skip_paths);
        }
        !self.config.require_auth
    }

    /// Runs authentication for one request.
    pub async fn before(&self, request: &Parts, context: RequestContext) -> MiddlewareOutcome {
        let path = request.uri.path();

        // 1. Path bypass
        if self.should_skip(path) {
            tracing::debug!(path = %path, "Authentication skipped for path");
            let event = self
                .audit
                .event(AuthEventType::Attempt, request)
                .tag("skipped", true)
                .tag("reason", "path_excluded");
            self.audit.emit(event).await;
            return MiddlewareOutcome::Proceed(self.anonymous(context));
        }

        // 2. Cache lookup
        let key = fingerprint(&request.headers);
        if let Some(cache) = &self.cache
            && let Some(cached) = cache.get(&key)
        {
            if let Some(user) = cached.authenticated_user() {
                tracing::debug!(path = %path, user_id = %user.id, "Authentication served from cache");
                let event = self
                    .audit
                    .event(AuthEventType::Success, request)
                    .user_id(user.id.clone())
                    .strategy(cached.strategy.as_deref())
                    .tag("cacheHit", true);
                self.audit.emit(event).await;
                let ctx = AuthenticatedContext::authenticated(
                    context,
                    Arc::clone(user),
                    cached.strategy.clone(),
                    self.evaluator,
                )
                .from_cache();
                return MiddlewareOutcome::Proceed(ctx);
            }

            if self.config.allow_anonymous {
                tracing::debug!(path = %path, "Cached authentication failure, proceeding anonymously");
                let event = self
                    .audit
                    .event(AuthEventType::Failure, request)
                    .strategy(cached.strategy.as_deref())
                    .error(failure_message(&cached))
                    .tag("cacheHit", true)
                    .tag("anonymous", true);
                self.audit.emit(event).await;
                return MiddlewareOutcome::Proceed(self.anonymous(context));
            }

            tracing::debug!(path = %path, "Cached authentication failure, re-authenticating");
        }

        // 3. Authenticate
        self.audit
            .emit(self.audit.event(AuthEventType::Attempt, request))
            .await;

        let started = Instant::now();
        let outcome = self.auth_manager.authenticate(request, &context).await;
        let duration = started.elapsed();

        let result = match outcome {
            Ok(result) => result,
            Err(AuthError::Unauthorized { message }) => AuthenticationResult::failure(message, 401),
            Err(AuthError::Forbidden { message }) => AuthenticationResult::failure(message, 403),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    category = %e.category(),
                    path = %path,
                    duration_ms = duration.as_millis() as u64,
                    "Authentication backend error"
                );
                let event = self
                    .audit
                    .event(AuthEventType::Failure, request)
                    .error(SERVICE_UNAVAILABLE_TEXT)
                    .duration(duration)
                    .tag("backendError", true);
                self.audit.emit(event).await;

                let failure = AuthFailure {
                    kind: FailureKind::Backend,
                    message: SERVICE_UNAVAILABLE_TEXT.to_string(),
                    detail: Some(e.to_string()),
                    strategy: None,
                    path: path.to_string(),
                };
                return MiddlewareOutcome::Abort(self.abort_response(&failure));
            }
        };

        if let Some(cache) = &self.cache {
            cache.set(key, result.clone());
        }

        // 4. Outcome
        let Some(user) = result.authenticated_user() else {
            let message = failure_message(&result);
            tracing::warn!(
                path = %path,
                strategy = ?result.strategy,
                status = ?result.status_code,
                error = %message,
                "Authentication failed"
            );
            let event = self
                .audit
                .event(AuthEventType::Failure, request)
                .strategy(result.strategy.as_deref())
                .error(message.clone())
                .duration(duration)
                .tag("cacheHit", false);
            self.audit.emit(event).await;

            if self.config.allow_anonymous {
                return MiddlewareOutcome::Proceed(self.anonymous(context));
            }

            let kind = if result.status_code == Some(403) {
                FailureKind::Unauthorized
            } else {
                FailureKind::Unauthenticated
            };
            let failure = AuthFailure {
                kind,
                message,
                detail: None,
                strategy: result.strategy.clone(),
                path: path.to_string(),
            };
            return MiddlewareOutcome::Abort(self.abort_response(&failure));
        };

        tracing::debug!(
            path = %path,
            user_id = %user.id,
            strategy = ?result.strategy,
            duration_ms = duration.as_millis() as u64,
            "Request authenticated"
        );
        let event = self
            .audit
            .event(AuthEventType::Success, request)
            .user_id(user.id.clone())
            .strategy(result.strategy.as_deref())
            .duration(duration)
            .tag("cacheHit", false);
        self.audit.emit(event).await;

        MiddlewareOutcome::Proceed(AuthenticatedContext::authenticated(
            context,
            Arc::clone(user),
            result.strategy.clone(),
            self.evaluator,
        ))
    }

    fn anonymous(&self, context: RequestContext) -> AuthenticatedContext {
        AuthenticatedContext::anonymous(context, self.evaluator)
    }

    /// Builds the abort response, preferring a configured handler.
    fn abort_response(&self, failure: &AuthFailure) -> AbortResponse {
        let handler = match failure.kind {
            FailureKind::Unauthenticated => &self.on_unauthenticated,
            FailureKind::Unauthorized => &self.on_unauthorized,
            FailureKind::Backend => &self.on_error,
        };
        if let Some(handler) = handler {
            return handler(failure);
        }

        match failure.kind {
            FailureKind::Unauthenticated => {
                AbortResponse::unauthenticated(failure.message.clone(), &self.config.realm)
            }
            FailureKind::Unauthorized => AbortResponse::forbidden(failure.message.clone()),
            FailureKind::Backend => AbortResponse::service_unavailable(),
        }
    }
}

/// Client-facing reason of a failed result.
fn failure_message(result: &AuthenticationResult) -> String {
    match (&result.error, result.success) {
        (Some(error), _) => error.clone(),
        (None, true) => "Authentication returned no user".to_string(),
        (None, false) => "Authentication required".to_string(),
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`AuthMiddleware`].
pub struct AuthMiddlewareBuilder {
    config: MiddlewareConfig,
    auth_manager: Arc<dyn AuthManager>,
    cache: Option<Arc<AuthCache>>,
    audit_sink: Option<Arc<dyn AuditManager>>,
    on_unauthenticated: Option<AbortHandler>,
    on_unauthorized: Option<AbortHandler>,
    on_error: Option<AbortHandler>,
}

impl AuthMiddlewareBuilder {
    fn new(auth_manager: Arc<dyn AuthManager>) -> Self {
        Self {
            config: MiddlewareConfig::default(),
            auth_manager,
            cache: None,
            audit_sink: None,
            on_unauthenticated: None,
            on_unauthorized: None,
            on_error: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: MiddlewareConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses an existing cache instead of creating one from the config.
    #[must_use]
    pub fn cache(mut self, cache: Arc<AuthCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the audit sink. Defaults to [`TracingAuditSink`].
    #[must_use]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditManager>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Overrides the 401 response.
    #[must_use]
    pub fn on_unauthenticated<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AuthFailure) -> AbortResponse + Send + Sync + 'static,
    {
        self.on_unauthenticated = Some(Arc::new(handler));
        self
    }

    /// Overrides the 403 response.
    #[must_use]
    pub fn on_unauthorized<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AuthFailure) -> AbortResponse + Send + Sync + 'static,
    {
        self.on_unauthorized = Some(Arc::new(handler));
        self
    }

    /// Overrides the 503 response.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&AuthFailure) -> AbortResponse + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Validates the configuration and builds the middleware.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn build(self) -> Result<AuthMiddleware, ConfigError> {
        self.config.validate()?;

        let cache = if self.config.cache_results {
            Some(self.cache.unwrap_or_else(|| {
                Arc::new(AuthCache::new(
                    self.config.max_cache_size,
                    self.config.cache_ttl,
                ))
            }))
        } else {
            None
        };

        let sink = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(TracingAuditSink));
        let audit = AuditEmitter::new(sink, self.config.audit_enabled, self.config.audit_level);

        tracing::debug!(
            require_auth = self.config.require_auth,
            skip_paths = self.config.skip_paths.len(),
            only_paths = self.config.only_paths.len(),
            cache = cache.is_some(),
            default_policy = ?self.config.default_policy,
            "Authentication middleware configured"
        );

        Ok(AuthMiddleware {
            evaluator: PermissionEvaluator::new(self.config.default_policy),
            config: self.config,
            auth_manager: self.auth_manager,
            cache,
            audit,
            paths: PathMatcher::new(),
            on_unauthenticated: self.on_unauthenticated,
            on_unauthorized: self.on_unauthorized,
            on_error: self.on_error,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
