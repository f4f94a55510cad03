//! Directory lookups: who holds a role, who belongs to a department.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::EngineResult;

/// External user directory. Calls may be slow; the engine bounds them
/// with `lookup_timeout_ms`.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn role_members(&self, role_id: &str) -> EngineResult<Vec<String>>;

    async fn dept_members(&self, dept_id: &str) -> EngineResult<Vec<String>>;
}

/// Fixed role and department tables.
///
/// Loadable from YAML:
///
/// ```yaml
/// roles:
///   manager: [bob, carol]
/// depts:
///   ops: [dan]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticDirectory {
    #[serde(default)]
    roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    depts: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml(content: &str) -> EngineResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_role(mut self, role_id: &str, members: &[&str]) -> Self {
        self.roles.insert(
            role_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn with_dept(mut self, dept_id: &str, members: &[&str]) -> Self {
        self.depts.insert(
            dept_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        self
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn role_members(&self, role_id: &str) -> EngineResult<Vec<String>> {
        Ok(self.roles.get(role_id).cloned().unwrap_or_default())
    }

    async fn dept_members(&self, dept_id: &str) -> EngineResult<Vec<String>> {
        Ok(self.depts.get(dept_id).cloned().unwrap_or_default())
    }
}
