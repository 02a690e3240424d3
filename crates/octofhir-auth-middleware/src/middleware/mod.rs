//! Request authentication middleware.
//!
//! - [`auth`] - the per-request pipeline and its collaborators
//! - [`context`] - request-scoped authentication state
//! - [`response`] - FHIR OperationOutcome abort responses
//! - [`layer`] - Axum middleware function and extractor

pub mod auth;
pub mod context;
pub mod layer;
pub mod response;

pub use auth::{
    AuthManager, AuthMiddleware, AuthMiddlewareBuilder, MiddlewareOutcome, SESSION_COOKIE,
    fingerprint,
};
pub use context::{AuthenticatedContext, RequestContext};
pub use layer::{Authenticated, authentication_layer};
pub use response::{
    AbortHandler, AbortResponse, AuthFailure, FailureKind, Issue, IssueCode, IssueDetails,
    OperationOutcome,
};
