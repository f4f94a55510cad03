//! Process definition document parser.
//!
//! Definitions are authored as YAML (JSON is accepted too, being a YAML
//! subset) in an envelope:
//!
//! ```yaml
//! apiVersion: workorder.io/v1
//! kind: ProcessDefinition
//! metadata:
//!   id: expense
//!   name: Expense approval
//! spec:
//!   variables: [...]
//!   steps: [...]
//!   connections: [...]
//!   settings: {...}
//! ```
//!
//! Parsing only checks the document shape. Graph validation happens at
//! publish time.

use serde::Deserialize;

use crate::definition::types::{
    Connection, DefinitionStatus, ProcessDefinition, Settings, Step, Variable,
};
use crate::error::{EngineError, EngineResult};

pub const API_VERSION: &str = "workorder.io/v1";
pub const KIND: &str = "ProcessDefinition";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    api_version: String,
    kind: String,
    metadata: Metadata,
    spec: Spec,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Spec {
    #[serde(default)]
    variables: Vec<Variable>,
    steps: Vec<Step>,
    #[serde(default)]
    connections: Vec<Connection>,
    #[serde(default)]
    settings: Settings,
}

/// Parse a YAML or JSON document into a draft definition.
pub fn parse_definition(content: &str) -> EngineResult<ProcessDefinition> {
    let doc: Document = serde_yaml::from_str(content)?;

    if doc.api_version != API_VERSION {
        return Err(EngineError::Validation(format!(
            "Unsupported API version: {}. Expected {}",
            doc.api_version, API_VERSION
        )));
    }

    if doc.kind != KIND {
        return Err(EngineError::Validation(format!(
            "Invalid kind: {}. Expected {}",
            doc.kind, KIND
        )));
    }

    if doc.metadata.id.trim().is_empty() {
        return Err(EngineError::Validation(
            "metadata.id must not be empty".to_string(),
        ));
    }

    let mut connections = doc.spec.connections;
    for (idx, conn) in connections.iter_mut().enumerate() {
        if conn.id.is_empty() {
            conn.id = format!("c{}", idx);
        }
    }

    Ok(ProcessDefinition {
        name: doc.metadata.name.unwrap_or_else(|| doc.metadata.id.clone()),
        id: doc.metadata.id,
        description: doc.metadata.description,
        version: 0,
        status: DefinitionStatus::Draft,
        variables: doc.spec.variables,
        steps: doc.spec.steps,
        connections,
        settings: doc.spec.settings,
        published_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::types::{
        Action, AssignStrategy, Condition, EscalationAction, Operator, Quorum, StepKind,
    };
    use crate::definition::validate_definition;

    const EXPENSE: &str = r#"
apiVersion: workorder.io/v1
kind: ProcessDefinition
metadata:
  id: expense
  name: Expense approval
spec:
  variables:
    - name: amount
      type: number
      required: true
  steps:
    - id: start
      type: start
    - id: route
      type: decision
    - id: manager
      type: approval
      time_limit: 3600
      require_comment: true
      assignment:
        strategy: role
        assignee_type: role
        assignee_ids: [manager]
    - id: board
      type: approval
      allow_parallel: true
      quorum:
        count: 2
      actions: [approve, reject]
      assignment:
        strategy: manual
        assignee_ids: [ann, ben, cy]
    - id: end
      type: end
  connections:
    - from: start
      to: route
    - from: route
      to: board
      condition:
        logic: and
        conditions:
          - field: amount
            operator: gte
            value: 10000
    - from: route
      to: manager
    - from: manager
      to: end
    - from: board
      to: end
  settings:
    escalation_rules:
      - id: manager-late
        step: manager
        action: auto_approve
"#;

    #[test]
    fn test_parse_full_document() {
        let def = parse_definition(EXPENSE).unwrap();
        assert_eq!(def.id, "expense");
        assert_eq!(def.name, "Expense approval");
        assert_eq!(def.status, DefinitionStatus::Draft);
        assert_eq!(def.steps.len(), 5);

        let manager = def.get_step("manager").unwrap();
        assert_eq!(manager.kind, StepKind::Approval);
        assert_eq!(manager.assignment.strategy, AssignStrategy::Role);
        assert_eq!(manager.time_limit, Some(3600));
        assert!(manager.require_comment);

        let board = def.get_step("board").unwrap();
        assert_eq!(board.quorum, Quorum::Count(2));
        assert_eq!(board.allowed_actions(), &[Action::Approve, Action::Reject]);

        let guarded = &def.connections[1];
        assert_eq!(guarded.id, "c1");
        match guarded.condition.as_ref().unwrap() {
            Condition::Group(group) => {
                assert_eq!(group.conditions.len(), 1);
                assert_eq!(group.conditions[0].leaves()[0].operator, Operator::Gte);
            }
            other => panic!("expected group, got {:?}", other),
        }

        let rule = &def.settings.escalation_rules[0];
        assert_eq!(rule.action, EscalationAction::AutoApprove);
        assert!(rule.enabled);

        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_parse_invalid_api_version() {
        let yaml = EXPENSE.replace("workorder.io/v1", "workorder.io/v0");
        let err = parse_definition(&yaml).unwrap_err();
        assert!(err.to_string().contains("Unsupported API version"));
    }

    #[test]
    fn test_parse_invalid_kind() {
        let yaml = EXPENSE.replace("kind: ProcessDefinition", "kind: Playbook");
        let err = parse_definition(&yaml).unwrap_err();
        assert!(err.to_string().contains("Invalid kind"));
    }

    #[test]
    fn test_unknown_step_type_is_a_parse_error() {
        let yaml = EXPENSE.replace("type: decision", "type: gateway");
        let err = parse_definition(&yaml).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn test_unknown_action_is_a_parse_error() {
        let yaml = EXPENSE.replace("actions: [approve, reject]", "actions: [approve, escalate]");
        assert!(matches!(
            parse_definition(&yaml).unwrap_err(),
            EngineError::Parse(_)
        ));
    }

    #[test]
    fn test_parse_json() {
        let json = serde_json::json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "metadata": {"id": "mini"},
            "spec": {
                "steps": [
                    {"id": "start", "type": "start"},
                    {"id": "end", "type": "end"}
                ],
                "connections": [{"from": "start", "to": "end"}]
            }
        });
        let def = parse_definition(&json.to_string()).unwrap();
        assert_eq!(def.name, "mini");
        assert!(validate_definition(&def).is_ok());
    }
}
