//! Permission decisions for authenticated users.
//!
//! [`PermissionEvaluator::check_permission`] layers three kinds of rules:
//!
//! 1. Global category switches (`canRead`, `canWrite`, `canDelete`). An
//!    explicit `false` is final and cannot be overridden below.
//! 2. Resource-specific flags (`resources[type].read`, ...). An explicit
//!    flag decides.
//! 3. Attribute conditions, evaluated only when resource data is given.
//!
//! Anything not covered falls through to the configured [`DefaultPolicy`].

use std::str::FromStr;

use serde_json::Value;

use crate::config::DefaultPolicy;
use crate::permission::model::{Condition, ConditionOperator, ResourcePermission};
use crate::types::AuthenticatedUser;

// =============================================================================
// Operations
// =============================================================================

/// FHIR interactions understood by the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    VRead,
    Search,
    History,
    Create,
    Update,
    Patch,
    Delete,
}

/// Global permission category of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationCategory {
    Read,
    Write,
    Delete,
}

impl Operation {
    /// Returns the global category the operation falls under.
    #[must_use]
    pub fn category(&self) -> OperationCategory {
        match self {
            Self::Read | Self::VRead | Self::Search | Self::History => OperationCategory::Read,
            Self::Create | Self::Update | Self::Patch => OperationCategory::Write,
            Self::Delete => OperationCategory::Delete,
        }
    }

    /// Returns the resource permission flag governing the operation.
    fn resource_flag(&self, permission: &ResourcePermission) -> Option<bool> {
        match self {
            Self::Read | Self::VRead | Self::Search | Self::History => permission.read,
            Self::Create => permission.create,
            Self::Update | Self::Patch => permission.update,
            Self::Delete => permission.delete,
        }
    }
}

/// Error returned for operation names the evaluator does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "vread" => Ok(Self::VRead),
            "search" | "search-type" | "search-system" => Ok(Self::Search),
            "history" | "history-instance" | "history-type" | "history-system" => {
                Ok(Self::History)
            }
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "patch" => Ok(Self::Patch),
            "delete" => Ok(Self::Delete),
            other => Err(UnknownOperation(other.to_string())),
        }
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// Stateless permission decision function.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionEvaluator {
    default_policy: DefaultPolicy,
}

impl PermissionEvaluator {
    /// Create an evaluator with the given fallthrough policy.
    #[must_use]
    pub fn new(default_policy: DefaultPolicy) -> Self {
        Self { default_policy }
    }

    /// Returns the fallthrough policy.
    #[must_use]
    pub fn default_policy(&self) -> DefaultPolicy {
        self.default_policy
    }

    /// Decides whether `user` may perform `operation` on `resource_type`.
    ///
    /// `resource_data` enables attribute conditions; without it only the
    /// boolean flags decide. Unknown operation names skip the category and
    /// flag checks and reach the fallthrough policy.
    #[must_use]
    pub fn check_permission(
        &self,
        user: &AuthenticatedUser,
        resource_type: &str,
        operation: &str,
        resource_data: Option<&Value>,
    ) -> bool {
        let permissions = &user.permissions;
        let operation = operation.parse::<Operation>().ok();

        if let Some(op) = operation {
            let global = match op.category() {
                OperationCategory::Read => permissions.can_read,
                OperationCategory::Write => permissions.can_write,
                OperationCategory::Delete => permissions.can_delete,
            };
            if global == Some(false) {
                return false;
            }
        }

        if let Some(resource_permission) = permissions.resources.get(resource_type) {
            if let Some(flag) = operation.and_then(|op| op.resource_flag(resource_permission)) {
                return flag;
            }

            if let (Some(conditions), Some(data)) = (&resource_permission.conditions, resource_data)
            {
                return conditions
                    .iter()
                    .all(|condition| self.evaluate_condition(condition, data, user));
            }
        }

        match self.default_policy {
            DefaultPolicy::Allow => permissions.can_read != Some(false),
            DefaultPolicy::Deny => false,
        }
    }

    /// Decides a named permission.
    ///
    /// An explicit `operations` entry wins, then a `custom` entry (by
    /// truthiness), then membership of a role with the same name.
    #[must_use]
    pub fn evaluate_user_permission(&self, user: &AuthenticatedUser, permission: &str) -> bool {
        if let Some(&allowed) = user.permissions.operations.get(permission) {
            return allowed;
        }
        if let Some(value) = user.permissions.custom.get(permission) {
            return is_truthy(value);
        }
        user.has_role(permission)
    }

    /// Evaluates a single attribute condition against resource data.
    #[must_use]
    pub fn evaluate_condition(
        &self,
        condition: &Condition,
        data: &Value,
        user: &AuthenticatedUser,
    ) -> bool {
        if let Some(validator) = &condition.custom_validator {
            return validator(data, user);
        }

        let field = resolve_field(data, &condition.field);
        match condition.operator {
            ConditionOperator::Eq => field == Some(&condition.value),
            ConditionOperator::Ne => field != Some(&condition.value),
            ConditionOperator::In => match &condition.value {
                Value::Array(items) => field.is_some_and(|v| items.contains(v)),
                _ => false,
            },
            ConditionOperator::NotIn => match &condition.value {
                Value::Array(items) => !field.is_some_and(|v| items.contains(v)),
                _ => false,
            },
            ConditionOperator::Contains => {
                stringify(field).contains(&stringify(Some(&condition.value)))
            }
            ConditionOperator::Unknown => false,
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolves a dotted path; a missing segment yields `None`.
///
/// Numeric segments index into arrays (`"identifier.0.value"`).
fn resolve_field<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Truthiness of a loosely-typed permission value.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used by `contains`; arrays join their elements with commas.
fn stringify(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => stringify(Some(other)),
            })
            .collect::<Vec<_>>()
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
        Some(other) => other.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
