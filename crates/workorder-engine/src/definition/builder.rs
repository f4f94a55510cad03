//! Fluent construction of process definitions.

use super::types::{
    Condition, Connection, DefinitionStatus, EscalationRule, NotificationRule, ProcessDefinition,
    Settings, Step, Variable, VariableType,
};

/// Builder for [`ProcessDefinition`].
#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    def: ProcessDefinition,
}

impl DefinitionBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            def: ProcessDefinition {
                id: id.to_string(),
                name: id.to_string(),
                description: None,
                version: 0,
                status: DefinitionStatus::Draft,
                variables: Vec::new(),
                steps: Vec::new(),
                connections: Vec::new(),
                settings: Settings::default(),
                published_at: None,
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.def.name = name.to_string();
        self
    }

    pub fn variable(mut self, name: &str, kind: VariableType) -> Self {
        self.def.variables.push(Variable {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn required_variable(mut self, name: &str, kind: VariableType) -> Self {
        self.def.variables.push(Variable {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.def.steps.push(step);
        self
    }

    pub fn connect(mut self, from: &str, to: &str) -> Self {
        self.def.connections.push(Connection::new(from, to));
        self
    }

    pub fn connect_when(mut self, from: &str, to: &str, condition: Condition) -> Self {
        self.def
            .connections
            .push(Connection::new(from, to).when(condition));
        self
    }

    pub fn revisitable(mut self, step_id: &str) -> Self {
        self.def.settings.revisitable_steps.push(step_id.to_string());
        self
    }

    pub fn escalation(mut self, rule: EscalationRule) -> Self {
        self.def.settings.escalation_rules.push(rule);
        self
    }

    pub fn notification(mut self, rule: NotificationRule) -> Self {
        self.def.settings.notification_rules.push(rule);
        self
    }

    pub fn build(self) -> ProcessDefinition {
        self.def
    }
}

impl ProcessDefinition {
    pub fn builder(id: &str) -> DefinitionBuilder {
        DefinitionBuilder::new(id)
    }
}
