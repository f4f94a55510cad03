//! Structural validation of process definitions.
//!
//! Runs every check and returns the full error list; a definition is only
//! publishable when the list is empty. Checks, in order:
//! 0. step ids, references and per-step configuration
//! 1. exactly one start step, at least one end step
//! 2. inbound/outbound degree
//! 3. reachability from start and of an end step from every step
//! 4. condition fields and operands
//! 5. cycles only through revisitable decision steps

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use thiserror::Error;

use super::types::{
    Action, AssignStrategy, Condition, ProcessDefinition, Quorum, StepKind, MAX_TIME_LIMIT_SECS,
};
use crate::engine::evaluator::{as_number, membership_list};

/// A single structural defect.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum GraphError {
    #[error("step at position {0} has an empty id")]
    EmptyStepId(usize),

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("{location} references unknown step '{step}'")]
    UnknownStep { location: String, step: String },

    #[error("definition has no start step")]
    MissingStart,

    #[error("definition has {0} start steps, expected exactly one")]
    MultipleStarts(usize),

    #[error("definition has no end step")]
    MissingEnd,

    #[error("step '{0}' has no inbound connection")]
    NoInbound(String),

    #[error("step '{0}' has no outbound connection")]
    NoOutbound(String),

    #[error("start step '{0}' must not have inbound connections")]
    StartHasInbound(String),

    #[error("end step '{0}' must not have outbound connections")]
    EndHasOutbound(String),

    #[error("step '{0}' is not reachable from start")]
    Unreachable(String),

    #[error("no end step is reachable from step '{0}'")]
    DeadEnd(String),

    #[error("{location}: condition references unknown field '{field}'")]
    UnknownField { location: String, field: String },

    #[error("{location}: operator {operator} cannot compare against {value}")]
    BadOperand {
        location: String,
        operator: String,
        value: String,
    },

    #[error("cycle through [{}] has no revisitable decision step", .0.join(", "))]
    UnmarkedCycle(Vec<String>),

    #[error("revisitable step '{0}' is not a decision step")]
    RevisitableNotDecision(String),

    #[error("step '{step}': {reason}")]
    InvalidStep { step: String, reason: String },

    #[error("escalation rule '{rule}': {reason}")]
    InvalidEscalationRule { rule: String, reason: String },
}

/// Validate a definition, collecting every structural error.
pub fn validate_definition(def: &ProcessDefinition) -> Result<(), Vec<GraphError>> {
    let mut errors = Vec::new();
    let graph = Graph::build(def, &mut errors);

    check_steps(def, &mut errors);
    check_terminals(def, &mut errors);
    check_degrees(def, &graph, &mut errors);
    check_reachability(def, &graph, &mut errors);
    check_condition_fields(def, &mut errors);
    check_cycles(def, &graph, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Adjacency over connections whose endpoints both exist.
struct Graph<'a> {
    forward: HashMap<&'a str, Vec<&'a str>>,
    reverse: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> Graph<'a> {
    fn build(def: &'a ProcessDefinition, errors: &mut Vec<GraphError>) -> Self {
        let ids: HashSet<&str> = def.steps.iter().map(|s| s.id.as_str()).collect();
        let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();

        for conn in &def.connections {
            let location = connection_label(conn.id.as_str(), &conn.from, &conn.to);
            let mut valid = true;
            for endpoint in [&conn.from, &conn.to] {
                if !ids.contains(endpoint.as_str()) {
                    errors.push(GraphError::UnknownStep {
                        location: location.clone(),
                        step: endpoint.clone(),
                    });
                    valid = false;
                }
            }
            if valid {
                forward.entry(&conn.from).or_default().push(&conn.to);
                reverse.entry(&conn.to).or_default().push(&conn.from);
            }
        }

        Self { forward, reverse }
    }

    fn successors(&self, id: &str) -> &[&'a str] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn predecessors(&self, id: &str) -> &[&'a str] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn connection_label(id: &str, from: &str, to: &str) -> String {
    if id.is_empty() {
        format!("connection '{}->{}'", from, to)
    } else {
        format!("connection '{}'", id)
    }
}

/// Check 0: ids, per-step configuration and escalation rule references.
fn check_steps(def: &ProcessDefinition, errors: &mut Vec<GraphError>) {
    let mut seen = HashSet::new();
    for (idx, step) in def.steps.iter().enumerate() {
        if step.id.is_empty() {
            errors.push(GraphError::EmptyStepId(idx));
            continue;
        }
        if !seen.insert(step.id.as_str()) {
            errors.push(GraphError::DuplicateStep(step.id.clone()));
        }

        let invalid = |reason: &str| GraphError::InvalidStep {
            step: step.id.clone(),
            reason: reason.to_string(),
        };

        match step.kind {
            StepKind::End if !step.actions.is_empty() => {
                errors.push(invalid("end steps accept no actions"));
            }
            StepKind::Start if !step.allows(Action::Submit) => {
                errors.push(invalid("start step must allow submit"));
            }
            _ => {}
        }

        match step.time_limit {
            Some(0) => errors.push(invalid("time_limit must be positive")),
            Some(secs) if secs > MAX_TIME_LIMIT_SECS => errors.push(invalid(&format!(
                "time_limit must not exceed {} seconds",
                MAX_TIME_LIMIT_SECS
            ))),
            _ => {}
        }
        if step.allow_parallel && step.quorum == Quorum::Count(0) {
            errors.push(invalid("parallel quorum count must be at least 1"));
        }

        if step.kind != StepKind::Start && step.waits_for_actor() {
            let assignment = &step.assignment;
            match assignment.strategy {
                AssignStrategy::Rule => {
                    if assignment.rules.is_empty() && assignment.assignee_ids.is_empty() {
                        errors.push(invalid("rule assignment needs at least one rule"));
                    }
                    for (i, rule) in assignment.rules.iter().enumerate() {
                        if rule.assignee_ids.is_empty() {
                            errors.push(invalid(&format!(
                                "assignment rule #{} names no assignees",
                                i
                            )));
                        }
                    }
                }
                _ if assignment.assignee_ids.is_empty() => {
                    errors.push(invalid("assignment names no assignees"));
                }
                _ => {}
            }
        }
    }

    let mut rule_ids = HashSet::new();
    for rule in &def.settings.escalation_rules {
        if !rule_ids.insert(rule.id.as_str()) {
            errors.push(GraphError::InvalidEscalationRule {
                rule: rule.id.clone(),
                reason: "duplicate rule id".to_string(),
            });
        }
        if let Some(step_id) = &rule.step {
            match def.get_step(step_id) {
                None => errors.push(GraphError::UnknownStep {
                    location: format!("escalation rule '{}'", rule.id),
                    step: step_id.clone(),
                }),
                Some(step) if step.time_limit.is_none() => {
                    errors.push(GraphError::InvalidEscalationRule {
                        rule: rule.id.clone(),
                        reason: format!("step '{}' has no time_limit", step_id),
                    })
                }
                Some(_) => {}
            }
        }
    }

    for id in &def.settings.revisitable_steps {
        match def.get_step(id) {
            None => errors.push(GraphError::UnknownStep {
                location: "settings.revisitable_steps".to_string(),
                step: id.clone(),
            }),
            Some(step) if step.kind != StepKind::Decision => {
                errors.push(GraphError::RevisitableNotDecision(id.clone()))
            }
            Some(_) => {}
        }
    }
}

/// Check 1: exactly one start, at least one end.
fn check_terminals(def: &ProcessDefinition, errors: &mut Vec<GraphError>) {
    let starts = def
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::Start)
        .count();
    match starts {
        0 => errors.push(GraphError::MissingStart),
        1 => {}
        n => errors.push(GraphError::MultipleStarts(n)),
    }

    if !def.steps.iter().any(|s| s.kind == StepKind::End) {
        errors.push(GraphError::MissingEnd);
    }
}

/// Check 2: degree constraints.
fn check_degrees(def: &ProcessDefinition, graph: &Graph<'_>, errors: &mut Vec<GraphError>) {
    for step in &def.steps {
        let inbound = graph.predecessors(&step.id).len();
        let outbound = graph.successors(&step.id).len();

        match step.kind {
            StepKind::Start if inbound > 0 => {
                errors.push(GraphError::StartHasInbound(step.id.clone()))
            }
            StepKind::Start => {}
            _ if inbound == 0 => errors.push(GraphError::NoInbound(step.id.clone())),
            _ => {}
        }

        match step.kind {
            StepKind::End if outbound > 0 => {
                errors.push(GraphError::EndHasOutbound(step.id.clone()))
            }
            StepKind::End => {}
            _ if outbound == 0 => errors.push(GraphError::NoOutbound(step.id.clone())),
            _ => {}
        }
    }
}

/// Breadth-first traversal from `roots`, along or against the connections.
fn bfs<'a>(graph: &Graph<'a>, roots: Vec<&'a str>, backward: bool) -> HashSet<&'a str> {
    let mut visited: HashSet<&str> = roots.iter().copied().collect();
    let mut queue: VecDeque<&str> = roots.into_iter().collect();

    while let Some(id) = queue.pop_front() {
        let next = if backward {
            graph.predecessors(id)
        } else {
            graph.successors(id)
        };
        for &step in next {
            if visited.insert(step) {
                queue.push_back(step);
            }
        }
    }

    visited
}

/// Check 3: forward reachability from start and backward from the end steps.
fn check_reachability(def: &ProcessDefinition, graph: &Graph<'_>, errors: &mut Vec<GraphError>) {
    let starts: Vec<&str> = def
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::Start)
        .map(|s| s.id.as_str())
        .collect();
    if starts.len() != 1 {
        // Reported by check 1; reachability is meaningless without a single root.
        return;
    }

    let reached = bfs(graph, starts, false);
    for step in &def.steps {
        if !reached.contains(step.id.as_str()) {
            errors.push(GraphError::Unreachable(step.id.clone()));
        }
    }

    let ends: Vec<&str> = def
        .steps
        .iter()
        .filter(|s| s.kind == StepKind::End)
        .map(|s| s.id.as_str())
        .collect();
    if ends.is_empty() {
        return;
    }

    let finishing = bfs(graph, ends, true);
    for step in &def.steps {
        if step.kind != StepKind::End && !finishing.contains(step.id.as_str()) {
            errors.push(GraphError::DeadEnd(step.id.clone()));
        }
    }
}

/// Check 4: every condition field is declared or reserved, and operands fit the operator.
fn check_condition_fields(def: &ProcessDefinition, errors: &mut Vec<GraphError>) {
    for conn in &def.connections {
        if let Some(cond) = &conn.condition {
            let location = connection_label(&conn.id, &conn.from, &conn.to);
            check_condition(def, cond, &location, errors);
        }
    }

    for step in &def.steps {
        for (i, rule) in step.assignment.rules.iter().enumerate() {
            let location = format!("step '{}' assignment rule #{}", step.id, i);
            check_condition(def, &rule.condition, &location, errors);
        }
    }
}

fn check_condition(
    def: &ProcessDefinition,
    cond: &Condition,
    location: &str,
    errors: &mut Vec<GraphError>,
) {
    for leaf in cond.leaves() {
        if !def.knows_field(&leaf.field) {
            errors.push(GraphError::UnknownField {
                location: location.to_string(),
                field: leaf.field.clone(),
            });
        }

        let bad_operand = (leaf.operator.is_numeric() && as_number(&leaf.value).is_none())
            || (leaf.operator.is_membership() && membership_list(&leaf.value).is_none());
        if bad_operand {
            errors.push(GraphError::BadOperand {
                location: location.to_string(),
                operator: format!("{:?}", leaf.operator).to_lowercase(),
                value: leaf.value.to_string(),
            });
        }
    }
}

/// Check 5: no cycle avoids every revisitable decision step.
///
/// Removing the revisitable decision steps breaks every permitted cycle, so
/// any cycle left in the remaining subgraph is unmarked.
fn check_cycles(def: &ProcessDefinition, graph: &Graph<'_>, errors: &mut Vec<GraphError>) {
    let mut remaining: Vec<&str> = def
        .steps
        .iter()
        .filter(|s| !(s.kind == StepKind::Decision && def.is_revisitable(&s.id)))
        .map(|s| s.id.as_str())
        .collect();

    // Peel off nodes without a predecessor or successor in the remaining set
    // until only nodes on (or between) cycles are left.
    loop {
        let set: HashSet<&str> = remaining.iter().copied().collect();
        let before = remaining.len();
        remaining.retain(|id| {
            let has_in = graph.predecessors(id).iter().any(|p| set.contains(p));
            let has_out = graph.successors(id).iter().any(|s| set.contains(s));
            has_in && has_out
        });
        if remaining.len() == before {
            break;
        }
    }

    if !remaining.is_empty() {
        errors.push(GraphError::UnmarkedCycle(
            remaining.into_iter().map(str::to_string).collect(),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::types::{
        Action, Condition, EscalationAction, EscalationRule, Operator, Step, VariableType,
    };
    use serde_json::json;

    fn linear() -> ProcessDefinition {
        ProcessDefinition::builder("leave")
            .step(Step::new("start", StepKind::Start))
            .step(
                Step::new("approve", StepKind::Approval)
                    .manual(&["alice"])
                    .with_time_limit(60),
            )
            .step(Step::new("end", StepKind::End))
            .connect("start", "approve")
            .connect("approve", "end")
            .build()
    }

    #[test]
    fn test_linear_definition_is_valid() {
        assert!(validate_definition(&linear()).is_ok());
    }

    #[test]
    fn test_missing_start_and_end() {
        let def = ProcessDefinition::builder("empty")
            .step(Step::new("a", StepKind::Task).manual(&["bob"]))
            .build();
        let errors = validate_definition(&def).unwrap_err();
        assert!(errors.contains(&GraphError::MissingStart));
        assert!(errors.contains(&GraphError::MissingEnd));
    }

    #[test]
    fn test_multiple_starts() {
        let mut def = linear();
        def.steps.push(Step::new("start2", StepKind::Start));
        def.connections
            .push(crate::definition::types::Connection::new("start2", "approve"));
        let errors = validate_definition(&def).unwrap_err();
        assert!(errors.contains(&GraphError::MultipleStarts(2)));
    }

    #[test]
    fn test_unreachable_and_dead_end() {
        let def = ProcessDefinition::builder("broken")
            .step(Step::new("start", StepKind::Start))
            .step(Step::new("a", StepKind::Task).manual(&["x"]))
            .step(Step::new("island", StepKind::Task).manual(&["x"]))
            .step(Step::new("end", StepKind::End))
            .connect("start", "a")
            .connect("a", "end")
            .connect("island", "end")
            .build();
        let errors = validate_definition(&def).unwrap_err();
        assert!(errors.contains(&GraphError::NoInbound("island".to_string())));
        assert!(errors.contains(&GraphError::Unreachable("island".to_string())));

        let def = ProcessDefinition::builder("trap")
            .step(Step::new("start", StepKind::Start))
            .step(Step::new("loop_a", StepKind::Task).manual(&["x"]))
            .step(Step::new("loop_b", StepKind::Task).manual(&["x"]))
            .step(Step::new("end", StepKind::End))
            .connect("start", "loop_a")
            .connect("start", "end")
            .connect("loop_a", "loop_b")
            .connect("loop_b", "loop_a")
            .build();
        let errors = validate_definition(&def).unwrap_err();
        assert!(errors.contains(&GraphError::DeadEnd("loop_a".to_string())));
        assert!(errors.contains(&GraphError::DeadEnd("loop_b".to_string())));
    }

    #[test]
    fn test_unknown_connection_endpoint() {
        let mut def = linear();
        def.connections
            .push(crate::definition::types::Connection::new("approve", "ghost"));
        let errors = validate_definition(&def).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, GraphError::UnknownStep { step, .. } if step == "ghost")));
    }

    #[test]
    fn test_condition_fields_must_be_declared() {
        let def = ProcessDefinition::builder("expense")
            .variable("amount", VariableType::Number)
            .step(Step::new("start", StepKind::Start))
            .step(Step::new("route", StepKind::Decision))
            .step(Step::new("cfo", StepKind::Approval).manual(&["cfo"]))
            .step(Step::new("end", StepKind::End))
            .connect("start", "route")
            .connect_when(
                "route",
                "cfo",
                Condition::rule("amount", Operator::Gt, json!(1000)),
            )
            .connect_when(
                "route",
                "end",
                Condition::rule("department", Operator::Eq, json!("ops")),
            )
            .connect("cfo", "end")
            .build();
        let errors = validate_definition(&def).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            GraphError::UnknownField { field, .. } if field == "department"
        ));
    }

    #[test]
    fn test_reserved_fields_are_known() {
        let def = ProcessDefinition::builder("prio")
            .step(Step::new("start", StepKind::Start))
            .step(Step::new("route", StepKind::Decision))
            .step(Step::new("end", StepKind::End))
            .connect("start", "route")
            .connect_when(
                "route",
                "end",
                Condition::rule("priority", Operator::Eq, json!("urgent")),
            )
            .connect("route", "end")
            .build();
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn test_bad_operand() {
        let def = ProcessDefinition::builder("ops")
            .variable("amount", VariableType::Number)
            .step(Step::new("start", StepKind::Start))
            .step(Step::new("end", StepKind::End))
            .connect_when(
                "start",
                "end",
                Condition::rule("amount", Operator::Gt, json!("lots")),
            )
            .build();
        let errors = validate_definition(&def).unwrap_err();
        assert!(matches!(&errors[0], GraphError::BadOperand { .. }));
    }

    fn rework_loop(mark: bool) -> ProcessDefinition {
        let builder = ProcessDefinition::builder("rework")
            .variable("ok", VariableType::Boolean)
            .step(Step::new("start", StepKind::Start))
            .step(Step::new("work", StepKind::Task).manual(&["dev"]))
            .step(Step::new("check", StepKind::Decision))
            .step(Step::new("end", StepKind::End))
            .connect("start", "work")
            .connect("work", "check")
            .connect_when("check", "end", Condition::rule("ok", Operator::Eq, json!(true)))
            .connect("check", "work");
        if mark {
            builder.revisitable("check").build()
        } else {
            builder.build()
        }
    }

    #[test]
    fn test_unmarked_cycle_rejected() {
        let errors = validate_definition(&rework_loop(false)).unwrap_err();
        assert_eq!(
            errors,
            vec![GraphError::UnmarkedCycle(vec![
                "work".to_string(),
                "check".to_string()
            ])]
        );
    }

    #[test]
    fn test_marked_cycle_accepted() {
        assert!(validate_definition(&rework_loop(true)).is_ok());
    }

    #[test]
    fn test_revisitable_must_be_decision() {
        let mut def = rework_loop(true);
        def.settings.revisitable_steps.push("work".to_string());
        let errors = validate_definition(&def).unwrap_err();
        assert!(errors.contains(&GraphError::RevisitableNotDecision("work".to_string())));
    }

    #[test]
    fn test_step_configuration() {
        let def = ProcessDefinition::builder("cfg")
            .step(Step::new("start", StepKind::Start).with_actions(&[Action::Cancel]))
            .step(Step::new("approve", StepKind::Approval).with_time_limit(0))
            .step(Step::new("end", StepKind::End))
            .connect("start", "approve")
            .connect("approve", "end")
            .escalation(EscalationRule {
                id: "late".to_string(),
                step: Some("nowhere".to_string()),
                action: EscalationAction::Notify,
                enabled: true,
                recipients: None,
            })
            .build();
        let errors = validate_definition(&def).unwrap_err();
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert!(messages.iter().any(|m| m.contains("must allow submit")));
        assert!(messages.iter().any(|m| m.contains("time_limit must be positive")));
        assert!(messages.iter().any(|m| m.contains("names no assignees")));
        assert!(messages.iter().any(|m| m.contains("nowhere")));
    }

    #[test]
    fn test_time_limit_upper_bound() {
        let def = |secs: u64| {
            ProcessDefinition::builder("limit")
                .step(Step::new("start", StepKind::Start))
                .step(Step::new("review", StepKind::Approval).manual(&["bob"]).with_time_limit(secs))
                .step(Step::new("end", StepKind::End))
                .connect("start", "review")
                .connect("review", "end")
                .build()
        };

        assert!(validate_definition(&def(MAX_TIME_LIMIT_SECS)).is_ok());
        for secs in [MAX_TIME_LIMIT_SECS + 1, 9_000_000_000_000, u64::MAX] {
            let errors = validate_definition(&def(secs)).unwrap_err();
            assert!(errors[0].to_string().contains("must not exceed"), "{:?}", errors);
        }
    }
}
