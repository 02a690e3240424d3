//! Permission data attached to an authenticated user.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AuthenticatedUser;

/// Custom predicate replacing operator evaluation of a [`Condition`].
pub type CustomValidator = Arc<dyn Fn(&Value, &AuthenticatedUser) -> bool + Send + Sync>;

/// Global and per-resource permissions of a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionSet {
    /// Global read switch. `Some(false)` denies every read-category operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_read: Option<bool>,

    /// Global write switch (create, update, patch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_write: Option<bool>,

    /// Global delete switch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_delete: Option<bool>,

    /// Resource-specific permissions keyed by resource type.
    pub resources: HashMap<String, ResourcePermission>,

    /// Named operation grants (e.g. `"$export": true`).
    pub operations: HashMap<String, bool>,

    /// Free-form permission values, interpreted by truthiness.
    pub custom: HashMap<String, Value>,
}

impl PermissionSet {
    /// Sets the resource permission for `resource_type`.
    #[must_use]
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        permission: ResourcePermission,
    ) -> Self {
        self.resources.insert(resource_type.into(), permission);
        self
    }

    /// Grants or denies a named operation.
    #[must_use]
    pub fn with_operation(mut self, name: impl Into<String>, allowed: bool) -> Self {
        self.operations.insert(name.into(), allowed);
        self
    }
}

/// Permission flags for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePermission {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<bool>,

    /// Attribute conditions, all of which must hold (AND).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Attribute rule narrowing a resource permission to matching data.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Dotted path into the resource data, e.g. `"subject.reference"`.
    pub field: String,

    /// Comparison applied to the resolved field.
    pub operator: ConditionOperator,

    /// Operand of the comparison.
    #[serde(default)]
    pub value: Value,

    /// Overrides `operator` entirely when present.
    #[serde(skip)]
    pub custom_validator: Option<CustomValidator>,
}

impl Condition {
    /// Creates an operator-based condition.
    #[must_use]
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            custom_validator: None,
        }
    }

    /// Attaches a custom validator.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value, &AuthenticatedUser) -> bool + Send + Sync + 'static,
    {
        self.custom_validator = Some(Arc::new(validator));
        self
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("field", &self.field)
            .field("operator", &self.operator)
            .field("value", &self.value)
            .field("custom_validator", &self.custom_validator.is_some())
            .finish()
    }
}

/// Comparison operators of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    In,
    NotIn,
    Contains,
    /// Any operator name this version does not know. Never matches.
    #[serde(other)]
    Unknown,
}
