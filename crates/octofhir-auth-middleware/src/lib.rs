//! # octofhir-auth-middleware
//!
//! Request-time authentication and authorization for the OctoFHIR server.
//!
//! For every inbound request the middleware decides whether it may
//! proceed, which identity and permissions it carries, and what is
//! recorded for audit. Credential verification and audit persistence are
//! delegated to the [`AuthManager`] and [`AuditManager`] collaborators.
//!
//! ## Modules
//!
//! - [`config`] - Middleware configuration and loader
//! - [`path_matcher`] - Glob matching for bypass rules
//! - [`cache`] - Bounded, expiring cache of authentication results
//! - [`permission`] - Permission model and evaluator
//! - [`audit`] - Authentication audit events and sinks
//! - [`middleware`] - The request pipeline and Axum integration

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod middleware;
pub mod path_matcher;
pub mod permission;
pub mod types;

pub use audit::{AuditEmitter, AuditError, AuditManager, AuthAuditEvent, AuthEventType};
pub use cache::{AuthCache, AuthCacheStats};
pub use config::{AuditLevel, ConfigError, DefaultPolicy, MiddlewareConfig};
pub use error::{AuthError, AuthResult, ErrorCategory};
pub use middleware::{
    AbortResponse, AuthManager, AuthMiddleware, AuthenticatedContext, MiddlewareOutcome,
    RequestContext,
};
pub use path_matcher::PathMatcher;
pub use permission::{
    Condition, ConditionOperator, PermissionEvaluator, PermissionSet, ResourcePermission,
};
pub use types::{AuthenticatedUser, AuthenticationResult};
