//! Permission model and decision logic.
//!
//! - [`model`] - permission data carried by an authenticated user
//! - [`evaluator`] - the decision function used by request contexts

pub mod evaluator;
pub mod model;

pub use evaluator::{Operation, OperationCategory, PermissionEvaluator, UnknownOperation};
pub use model::{Condition, ConditionOperator, CustomValidator, PermissionSet, ResourcePermission};
