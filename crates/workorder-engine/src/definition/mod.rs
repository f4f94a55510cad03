//! Process definitions.
//!
//! This module provides:
//! - Type definitions for the step graph
//! - YAML/JSON parsing
//! - Structural validation run before publish

pub mod builder;
pub mod parser;
pub mod types;
pub mod validator;

pub use builder::DefinitionBuilder;
pub use parser::parse_definition;
pub use types::{
    Action, AssignStrategy, AssigneeType, Assignment, AssignmentRule, Condition, ConditionGroup,
    Connection, DefinitionStatus, EscalationAction, EscalationRule, EventKind, Logic,
    NotificationRule, Operator, ProcessCondition, ProcessDefinition, Quorum, Recipients,
    Settings, Step, StepKind, Variable, VariableType, MAX_TIME_LIMIT_SECS, RESERVED_FIELDS,
};
pub use validator::{validate_definition, GraphError};
