//! Process definition types.
//!
//! A definition is a declarative step graph:
//! - steps with a closed `type` and a closed set of actions
//! - connections in declared order, each with an optional guard condition
//! - settings carrying revisitable decision steps, escalation and notification rules

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Form-data fields every instance exposes to conditions without declaring them.
pub const RESERVED_FIELDS: &[&str] = &["priority", "creator_id", "title"];

/// Step kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Start,
    Approval,
    Task,
    Decision,
    End,
    Script,
    Subflow,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::Start => "start",
            StepKind::Approval => "approval",
            StepKind::Task => "task",
            StepKind::Decision => "decision",
            StepKind::End => "end",
            StepKind::Script => "script",
            StepKind::Subflow => "subflow",
        };
        write!(f, "{}", s)
    }
}

/// Actions an actor may take on a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Submit,
    Approve,
    Reject,
    Transfer,
    Complete,
    Cancel,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Transfer => "transfer",
            Action::Complete => "complete",
            Action::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "submit" => Ok(Action::Submit),
            "approve" => Ok(Action::Approve),
            "reject" => Ok(Action::Reject),
            "transfer" => Ok(Action::Transfer),
            "complete" => Ok(Action::Complete),
            "cancel" => Ok(Action::Cancel),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Definition lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DefinitionStatus::Draft => "draft",
            DefinitionStatus::Published => "published",
            DefinitionStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

impl From<&str> for DefinitionStatus {
    fn from(s: &str) -> Self {
        match s {
            "published" => DefinitionStatus::Published,
            "archived" => DefinitionStatus::Archived,
            _ => DefinitionStatus::Draft,
        }
    }
}

/// Declared form variable types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    #[default]
    String,
    Number,
    Boolean,
    List,
    Object,
}

/// A form field conditions may reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: VariableType,

    /// Must be present in the form data at instance creation.
    #[serde(default)]
    pub required: bool,
}

// ============================================================================
// Conditions
// ============================================================================

/// Comparison operators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Contains,
    NotContains,
}

impl Operator {
    pub fn is_numeric(self) -> bool {
        matches!(self, Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte)
    }

    pub fn is_membership(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

/// Boolean combinator for condition groups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// Leaf condition: `field <operator> value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessCondition {
    /// Dotted path into the form data.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Nested list of conditions combined with `and`/`or`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: Logic,
    pub conditions: Vec<Condition>,
}

/// Condition tree guarding a connection or selecting an assignment pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Condition {
    Group(ConditionGroup),
    Rule(ProcessCondition),
}

impl Condition {
    pub fn rule(field: &str, operator: Operator, value: serde_json::Value) -> Self {
        Condition::Rule(ProcessCondition {
            field: field.to_string(),
            operator,
            value,
        })
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            logic: Logic::And,
            conditions,
        })
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Group(ConditionGroup {
            logic: Logic::Or,
            conditions,
        })
    }

    /// All leaf conditions, depth first.
    pub fn leaves(&self) -> Vec<&ProcessCondition> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a ProcessCondition>) {
        match self {
            Condition::Rule(rule) => out.push(rule),
            Condition::Group(group) => {
                for c in &group.conditions {
                    c.collect_leaves(out);
                }
            }
        }
    }
}

// ============================================================================
// Assignment
// ============================================================================

/// How a step's candidate actors are chosen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignStrategy {
    #[default]
    Manual,
    Role,
    Dept,
    Auto,
    Rule,
}

/// What the ids in an assignment name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    #[default]
    User,
    Role,
    Dept,
}

/// Conditional candidate pool for the `rule` strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRule {
    pub condition: Condition,
    #[serde(default)]
    pub assignee_type: AssigneeType,
    pub assignee_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default)]
    pub strategy: AssignStrategy,
    #[serde(default)]
    pub assignee_type: AssigneeType,
    #[serde(default)]
    pub assignee_ids: Vec<String>,
    #[serde(default)]
    pub rules: Vec<AssignmentRule>,
}

/// Completion quorum for parallel steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    #[default]
    Any,
    All,
    Count(u32),
}

impl Quorum {
    /// Whether `acted` approvals out of `assigned` actors satisfy the quorum.
    pub fn is_met(self, acted: usize, assigned: usize) -> bool {
        match self {
            Quorum::Any => acted >= 1,
            Quorum::All => acted >= assigned,
            Quorum::Count(n) => acted >= (n as usize).min(assigned.max(1)),
        }
    }
}

// ============================================================================
// Steps and connections
// ============================================================================

const START_ACTIONS: &[Action] = &[Action::Submit, Action::Cancel];
/// Longest accepted step time limit: one hundred years.
pub const MAX_TIME_LIMIT_SECS: u64 = 100 * 365 * 24 * 60 * 60;

const APPROVAL_ACTIONS: &[Action] = &[Action::Approve, Action::Reject, Action::Transfer];
const TASK_ACTIONS: &[Action] = &[Action::Complete, Action::Transfer];

/// A node in the process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(rename = "type")]
    pub kind: StepKind,

    #[serde(default)]
    pub assignment: Assignment,

    /// Allowed actions. Empty means the defaults for the step type.
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Seconds an instance may wait in this step before escalation.
    #[serde(default)]
    pub time_limit: Option<u64>,

    #[serde(default)]
    pub auto_complete: bool,

    #[serde(default)]
    pub require_comment: bool,

    #[serde(default)]
    pub allow_parallel: bool,

    #[serde(default)]
    pub quorum: Quorum,
}

impl Step {
    /// Create a step with defaults for everything but id and type.
    pub fn new(id: &str, kind: StepKind) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            assignment: Assignment::default(),
            actions: Vec::new(),
            time_limit: None,
            auto_complete: false,
            require_comment: false,
            allow_parallel: false,
            quorum: Quorum::Any,
        }
    }

    /// Assign fixed users.
    pub fn manual(self, ids: &[&str]) -> Self {
        self.assign(AssignStrategy::Manual, AssigneeType::User, ids)
    }

    pub fn assign(mut self, strategy: AssignStrategy, kind: AssigneeType, ids: &[&str]) -> Self {
        self.assignment.strategy = strategy;
        self.assignment.assignee_type = kind;
        self.assignment.assignee_ids = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_actions(mut self, actions: &[Action]) -> Self {
        self.actions = actions.to_vec();
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.time_limit = Some(secs);
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto_complete = true;
        self
    }

    pub fn comment_required(mut self) -> Self {
        self.require_comment = true;
        self
    }

    pub fn parallel(mut self, quorum: Quorum) -> Self {
        self.allow_parallel = true;
        self.quorum = quorum;
        self
    }

    /// Actions accepted on this step.
    pub fn allowed_actions(&self) -> &[Action] {
        if !self.actions.is_empty() {
            return &self.actions;
        }
        match self.kind {
            StepKind::Start => START_ACTIONS,
            StepKind::Approval => APPROVAL_ACTIONS,
            StepKind::Task => TASK_ACTIONS,
            _ => &[],
        }
    }

    pub fn allows(&self, action: Action) -> bool {
        self.allowed_actions().contains(&action)
    }

    /// Steps the machine leaves on its own as soon as they are entered.
    /// Script and subflow steps run outside the engine, so without declared
    /// actions they pass straight through.
    pub fn is_passthrough(&self) -> bool {
        match self.kind {
            StepKind::Decision => true,
            StepKind::Script | StepKind::Subflow => self.auto_complete || self.actions.is_empty(),
            _ => self.auto_complete,
        }
    }

    /// Whether an instance parked on this step waits for an actor.
    pub fn waits_for_actor(&self) -> bool {
        self.kind != StepKind::End && !self.is_passthrough()
    }

    /// The advancing action an escalation fires on behalf of the assignees.
    pub fn primary_action(&self) -> Option<Action> {
        [Action::Approve, Action::Complete, Action::Submit]
            .into_iter()
            .find(|a| self.allows(*a))
    }

    /// The time limit, or `None` when unset or not representable.
    pub fn time_limit_duration(&self) -> Option<Duration> {
        self.time_limit
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
    }
}

/// Directed edge between two steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl Connection {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            id: format!("{}->{}", from, to),
            from: from.to_string(),
            to: to.to_string(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Engine events delivered to the notification collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Approved,
    Rejected,
    Transferred,
    Escalated,
    Completed,
    Cancelled,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Created => "created",
            EventKind::Approved => "approved",
            EventKind::Rejected => "rejected",
            EventKind::Transferred => "transferred",
            EventKind::Escalated => "escalated",
            EventKind::Completed => "completed",
            EventKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Who receives an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Recipients {
    #[default]
    Assignees,
    Creator,
    Users(Vec<String>),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    Notify,
    Reassign,
    AutoApprove,
}

impl std::fmt::Display for EscalationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EscalationAction::Notify => "notify",
            EscalationAction::Reassign => "reassign",
            EscalationAction::AutoApprove => "auto_approve",
        };
        write!(f, "{}", s)
    }
}

fn default_true() -> bool {
    true
}

/// What happens when a step outlives its time limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    pub id: String,

    /// Step this rule watches; `None` watches every step with a time limit.
    #[serde(default)]
    pub step: Option<String>,

    pub action: EscalationAction,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Extra recipients for `notify`, on top of the current assignees.
    #[serde(default)]
    pub recipients: Option<Recipients>,
}

impl EscalationRule {
    pub fn matches_step(&self, step_id: &str) -> bool {
        self.step.as_deref().map_or(true, |s| s == step_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRule {
    pub event: EventKind,
    #[serde(default)]
    pub recipients: Recipients,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Decision steps through which cycles are allowed.
    #[serde(default)]
    pub revisitable_steps: Vec<String>,

    #[serde(default)]
    pub escalation_rules: Vec<EscalationRule>,

    #[serde(default)]
    pub notification_rules: Vec<NotificationRule>,
}

// ============================================================================
// Definition
// ============================================================================

/// Versioned process graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Assigned at publish time.
    #[serde(default)]
    pub version: u32,

    #[serde(default)]
    pub status: DefinitionStatus,

    #[serde(default)]
    pub variables: Vec<Variable>,

    pub steps: Vec<Step>,

    #[serde(default)]
    pub connections: Vec<Connection>,

    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ProcessDefinition {
    /// Get a step by id.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn start_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.kind == StepKind::Start)
    }

    pub fn is_revisitable(&self, step_id: &str) -> bool {
        self.settings.revisitable_steps.iter().any(|s| s == step_id)
    }

    /// First enabled escalation rule watching `step_id`.
    pub fn escalation_rule_for(&self, step_id: &str) -> Option<&EscalationRule> {
        self.settings
            .escalation_rules
            .iter()
            .find(|r| r.enabled && r.matches_step(step_id))
    }

    /// Whether conditions may reference `field`.
    pub fn knows_field(&self, field: &str) -> bool {
        let root = field.split('.').next().unwrap_or(field);
        RESERVED_FIELDS.contains(&root) || self.variables.iter().any(|v| v.name == root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_actions_by_kind() {
        assert_eq!(
            Step::new("s", StepKind::Start).allowed_actions(),
            &[Action::Submit, Action::Cancel]
        );
        assert!(Step::new("a", StepKind::Approval).allows(Action::Reject));
        assert!(Step::new("e", StepKind::End).allowed_actions().is_empty());

        let mut custom = Step::new("a", StepKind::Approval);
        custom.actions = vec![Action::Approve];
        assert!(!custom.allows(Action::Reject));
    }

    #[test]
    fn test_primary_action() {
        assert_eq!(
            Step::new("a", StepKind::Approval).primary_action(),
            Some(Action::Approve)
        );
        assert_eq!(
            Step::new("t", StepKind::Task).primary_action(),
            Some(Action::Complete)
        );
        assert_eq!(Step::new("e", StepKind::End).primary_action(), None);
    }

    #[test]
    fn test_condition_deserializes_leaf_and_group() {
        let json = serde_json::json!({
            "logic": "or",
            "conditions": [
                {"field": "amount", "operator": "gt", "value": 100},
                {"conditions": [{"field": "dept", "operator": "in", "value": ["ops", "it"]}]}
            ]
        });
        let cond: Condition = serde_json::from_value(json).unwrap();
        let leaves = cond.leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0].operator, Operator::Gt);
        assert_eq!(leaves[1].field, "dept");
    }

    #[test]
    fn test_quorum() {
        assert!(Quorum::Any.is_met(1, 3));
        assert!(!Quorum::All.is_met(2, 3));
        assert!(Quorum::All.is_met(3, 3));
        assert!(Quorum::Count(2).is_met(2, 3));
        // A count larger than the pool degrades to "all".
        assert!(Quorum::Count(5).is_met(3, 3));
    }

    #[test]
    fn test_quorum_serde() {
        let q: Quorum = serde_json::from_value(serde_json::json!({"count": 2})).unwrap();
        assert_eq!(q, Quorum::Count(2));
        let q: Quorum = serde_json::from_value(serde_json::json!("all")).unwrap();
        assert_eq!(q, Quorum::All);
    }

    #[test]
    fn test_knows_field() {
        let def = ProcessDefinition {
            id: "d".to_string(),
            name: String::new(),
            description: None,
            version: 0,
            status: DefinitionStatus::Draft,
            variables: vec![Variable {
                name: "applicant".to_string(),
                kind: VariableType::Object,
                required: false,
            }],
            steps: vec![],
            connections: vec![],
            settings: Settings::default(),
            published_at: None,
        };
        assert!(def.knows_field("applicant.dept"));
        assert!(def.knows_field("priority"));
        assert!(!def.knows_field("amount"));
    }

    #[test]
    fn test_time_limit_duration_range() {
        let step = Step::new("s", StepKind::Task).with_time_limit(90);
        assert_eq!(step.time_limit_duration(), Some(Duration::seconds(90)));
        assert_eq!(Step::new("s", StepKind::Task).time_limit_duration(), None);
        assert_eq!(
            Step::new("s", StepKind::Task)
                .with_time_limit(u64::MAX)
                .time_limit_duration(),
            None
        );
    }
}
