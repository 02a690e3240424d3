//! Axum integration.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use axum::{Router, middleware, routing::get};
//! use octofhir_auth_middleware::middleware::{Authenticated, authentication_layer};
//!
//! async fn handler(Authenticated(ctx): Authenticated) -> String {
//!     format!("hello {}", ctx.user_id().unwrap_or("anonymous"))
//! }
//!
//! let auth = Arc::new(AuthMiddleware::builder(auth_manager).config(config).build()?);
//! let app = Router::new()
//!     .route("/fhir/Patient", get(handler))
//!     .layer(middleware::from_fn_with_state(auth, authentication_layer));
//! ```

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::auth::{AuthMiddleware, MiddlewareOutcome};
use super::context::{AuthenticatedContext, RequestContext};
use super::response::AbortResponse;

/// Axum middleware running [`AuthMiddleware::before`].
///
/// On success the [`AuthenticatedContext`] is stored in the request
/// extensions. A [`RequestContext`] placed in the extensions by an earlier
/// layer is used as the base context; otherwise one is built from headers.
pub async fn authentication_layer(
    State(middleware): State<Arc<AuthMiddleware>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let context = parts
        .extensions
        .remove::<RequestContext>()
        .unwrap_or_else(|| RequestContext::from_headers(&parts.headers));

    match middleware.before(&parts, context).await {
        MiddlewareOutcome::Proceed(ctx) => {
            parts.extensions.insert(ctx);
            next.run(Request::from_parts(parts, body)).await
        }
        MiddlewareOutcome::Abort(response) => response.into_response(),
    }
}

/// Extractor for the context stored by [`authentication_layer`].
///
/// Anonymous contexts are returned as well; check
/// [`AuthenticatedContext::is_authenticated`] where identity is required.
pub struct Authenticated(pub AuthenticatedContext);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AbortResponse;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedContext>()
            .cloned()
            .map(Authenticated)
            .ok_or_else(|| {
                tracing::error!(path = %parts.uri.path(), "Authentication layer is not installed");
                AbortResponse::internal_error("Authentication context unavailable")
            })
    }
}
