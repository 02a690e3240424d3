//! Identity types exchanged with the authentication backend.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::permission::PermissionSet;

/// A user identified by the authentication backend.
///
/// The middleware only ever reads it; it is shared behind `Arc` between
/// the cache and every request context built from a cached result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    /// User's unique identifier.
    pub id: String,

    /// User's assigned roles.
    #[serde(default)]
    pub roles: BTreeSet<String>,

    /// Permissions granted to the user.
    #[serde(default)]
    pub permissions: PermissionSet,
}

impl AuthenticatedUser {
    /// Creates a user with no roles and an empty permission set.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Adds a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Replaces the permission set.
    #[must_use]
    pub fn with_permissions(mut self, permissions: PermissionSet) -> Self {
        self.permissions = permissions;
        self
    }

    /// Returns `true` if the user has a specific role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Outcome of one authentication attempt.
///
/// Produced by an [`AuthManager`](crate::middleware::AuthManager) and never
/// modified afterwards.
#[derive(Debug, Clone, Default)]
pub struct AuthenticationResult {
    /// Whether the credentials were accepted.
    pub success: bool,

    /// The identified user on success.
    pub user: Option<Arc<AuthenticatedUser>>,

    /// Reason for a failure, safe to show to the client.
    pub error: Option<String>,

    /// HTTP status suggested by the backend for a failure (401 or 403).
    pub status_code: Option<u16>,

    /// Name of the strategy that produced the result (e.g. "bearer").
    pub strategy: Option<String>,
}

impl AuthenticationResult {
    /// A successful result for `user`.
    #[must_use]
    pub fn success(user: AuthenticatedUser, strategy: impl Into<String>) -> Self {
        Self {
            success: true,
            user: Some(Arc::new(user)),
            strategy: Some(strategy.into()),
            ..Default::default()
        }
    }

    /// A failed result with a client-facing reason and status.
    #[must_use]
    pub fn failure(error: impl Into<String>, status_code: u16) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status_code: Some(status_code),
            ..Default::default()
        }
    }

    /// Sets the strategy name.
    #[must_use]
    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Returns the user only if authentication succeeded.
    #[must_use]
    pub fn authenticated_user(&self) -> Option<&Arc<AuthenticatedUser>> {
        if self.success { self.user.as_ref() } else { None }
    }
}
