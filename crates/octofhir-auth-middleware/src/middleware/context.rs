//! Request-scoped authentication context.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde_json::Value;

use crate::permission::PermissionEvaluator;
use crate::types::AuthenticatedUser;

// =============================================================================
// Request Context
// =============================================================================

/// Base per-request context supplied by the surrounding server.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Correlation id of the request, if any.
    pub request_id: Option<String>,

    /// Arbitrary values set by earlier pipeline stages.
    pub attributes: HashMap<String, Value>,
}

impl RequestContext {
    /// Builds a context from request headers (`x-request-id`).
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            request_id: headers
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            attributes: HashMap::new(),
        }
    }
}

// =============================================================================
// Authenticated Context
// =============================================================================

/// Request context enriched with authentication state.
///
/// Created fresh for every request. Anonymous contexts answer `false` to
/// every permission question.
#[derive(Debug, Clone)]
pub struct AuthenticatedContext {
    /// The context this one was built from.
    pub base: RequestContext,

    /// The authenticated user, `None` for anonymous requests.
    pub user: Option<Arc<AuthenticatedUser>>,

    /// Whether the request carries an authenticated identity.
    pub is_authenticated: bool,

    /// Strategy that authenticated the request.
    pub strategy: Option<String>,

    /// Whether the identity came from the authentication cache.
    pub cache_hit: bool,

    evaluator: PermissionEvaluator,
}

impl AuthenticatedContext {
    /// An unauthenticated context.
    #[must_use]
    pub fn anonymous(base: RequestContext, evaluator: PermissionEvaluator) -> Self {
        Self {
            base,
            user: None,
            is_authenticated: false,
            strategy: None,
            cache_hit: false,
            evaluator,
        }
    }

    /// A context for an authenticated `user`.
    #[must_use]
    pub fn authenticated(
        base: RequestContext,
        user: Arc<AuthenticatedUser>,
        strategy: Option<String>,
        evaluator: PermissionEvaluator,
    ) -> Self {
        Self {
            base,
            user: Some(user),
            is_authenticated: true,
            strategy,
            cache_hit: false,
            evaluator,
        }
    }

    /// Marks the context as served from cache.
    #[must_use]
    pub fn from_cache(mut self) -> Self {
        self.cache_hit = true;
        self
    }

    /// Authenticated user id.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user.as_deref().map(|u| u.id.as_str())
    }

    fn authenticated_user(&self) -> Option<&AuthenticatedUser> {
        if self.is_authenticated {
            self.user.as_deref()
        } else {
            None
        }
    }

    /// Checks a resource permission for the current user.
    ///
    /// See [`PermissionEvaluator::check_permission`].
    #[must_use]
    pub fn check_permission(
        &self,
        resource_type: &str,
        operation: &str,
        resource_data: Option<&Value>,
    ) -> bool {
        self.authenticated_user().is_some_and(|user| {
            self.evaluator
                .check_permission(user, resource_type, operation, resource_data)
        })
    }

    /// Returns `true` if the current user has `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.authenticated_user()
            .is_some_and(|user| user.has_role(role))
    }

    /// Checks a named permission for the current user.
    ///
    /// See [`PermissionEvaluator::evaluate_user_permission`].
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.authenticated_user()
            .is_some_and(|user| self.evaluator.evaluate_user_permission(user, permission))
    }
}
