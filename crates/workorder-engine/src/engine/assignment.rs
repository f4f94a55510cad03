//! Assignment resolution.
//!
//! Turns a step's assignment strategy into the concrete set of actors that
//! may act on it. Resolution happens once, at step entry.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::db::Store;
use crate::definition::{AssignStrategy, AssigneeType, Step, StepKind};
use crate::directory::Directory;
use crate::engine::evaluator::evaluate;
use crate::error::{EngineError, EngineResult};

pub struct AssignmentResolver {
    directory: Arc<dyn Directory>,
    store: Arc<dyn Store>,
    lookup_timeout: Duration,
}

impl AssignmentResolver {
    pub fn new(directory: Arc<dyn Directory>, store: Arc<dyn Store>, lookup_timeout: Duration) -> Self {
        Self {
            directory,
            store,
            lookup_timeout,
        }
    }

    /// Resolve assignees for entering `step`.
    ///
    /// Steps that never wait for an actor resolve to the empty set. Anything
    /// else must resolve to at least one actor.
    pub async fn resolve(
        &self,
        step: &Step,
        creator_id: &str,
        doc: &Map<String, Value>,
    ) -> EngineResult<BTreeSet<String>> {
        self.resolve_excluding(step, creator_id, doc, &BTreeSet::new())
            .await
    }

    /// Like [`resolve`](Self::resolve), dropping `exclude` from the pool
    /// before any selection. Used by escalation reassignment.
    pub async fn resolve_excluding(
        &self,
        step: &Step,
        creator_id: &str,
        doc: &Map<String, Value>,
        exclude: &BTreeSet<String>,
    ) -> EngineResult<BTreeSet<String>> {
        if !step.waits_for_actor() {
            return Ok(BTreeSet::new());
        }
        if step.kind == StepKind::Start {
            return Ok(BTreeSet::from([creator_id.to_string()]));
        }

        let assignment = &step.assignment;
        let mut resolved = match assignment.strategy {
            AssignStrategy::Manual => assignment.assignee_ids.iter().cloned().collect(),
            AssignStrategy::Role => {
                self.expand(AssigneeType::Role, &assignment.assignee_ids)
                    .await?
            }
            AssignStrategy::Dept => {
                self.expand(AssigneeType::Dept, &assignment.assignee_ids)
                    .await?
            }
            AssignStrategy::Auto => {
                let pool = self
                    .expand(assignment.assignee_type, &assignment.assignee_ids)
                    .await?;
                let pool: BTreeSet<String> = pool.difference(exclude).cloned().collect();
                self.least_loaded(pool).await?.into_iter().collect()
            }
            AssignStrategy::Rule => {
                let matched = assignment
                    .rules
                    .iter()
                    .find(|rule| evaluate(&rule.condition, doc));
                match matched {
                    Some(rule) => self.expand(rule.assignee_type, &rule.assignee_ids).await?,
                    None if !assignment.assignee_ids.is_empty() => {
                        self.expand(assignment.assignee_type, &assignment.assignee_ids)
                            .await?
                    }
                    None => {
                        return Err(EngineError::Validation(format!(
                            "step '{}': no assignment rule matched and no fallback assignees",
                            step.id
                        )))
                    }
                }
            }
        };

        resolved.retain(|actor| !exclude.contains(actor));

        if resolved.is_empty() {
            return Err(EngineError::Validation(format!(
                "step '{}' resolved to no assignees",
                step.id
            )));
        }

        tracing::debug!(
            step = %step.id,
            strategy = ?assignment.strategy,
            assignees = ?resolved,
            "Resolved assignees"
        );

        Ok(resolved)
    }

    /// Expand ids of the given type into actor ids.
    async fn expand(&self, kind: AssigneeType, ids: &[String]) -> EngineResult<BTreeSet<String>> {
        let mut actors = BTreeSet::new();
        for id in ids {
            let members = match kind {
                AssigneeType::User => {
                    actors.insert(id.clone());
                    continue;
                }
                AssigneeType::Role => {
                    self.lookup(id, self.directory.role_members(id)).await?
                }
                AssigneeType::Dept => {
                    self.lookup(id, self.directory.dept_members(id)).await?
                }
            };
            actors.extend(members);
        }
        Ok(actors)
    }

    async fn lookup<F>(&self, id: &str, call: F) -> EngineResult<Vec<String>>
    where
        F: std::future::Future<Output = EngineResult<Vec<String>>>,
    {
        tokio::time::timeout(self.lookup_timeout, call)
            .await
            .map_err(|_| {
                tracing::warn!(
                    id = %id,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Directory lookup timed out"
                );
                EngineError::Timeout(format!("directory lookup for '{}'", id))
            })?
    }

    /// The actor with the fewest open assignments; ties go to the lowest id.
    async fn least_loaded(&self, pool: BTreeSet<String>) -> EngineResult<Option<String>> {
        if pool.is_empty() {
            return Ok(None);
        }
        let actors: Vec<String> = pool.into_iter().collect();
        let counts = self.store.open_assignment_counts(&actors).await?;

        // `actors` is sorted, and min_by_key keeps the first minimum.
        Ok(actors
            .into_iter()
            .min_by_key(|actor| counts.get(actor).copied().unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::definition::{AssignmentRule, Condition, Operator};
    use crate::directory::StaticDirectory;
    use async_trait::async_trait;
    use serde_json::json;

    fn resolver(directory: impl Directory + 'static) -> AssignmentResolver {
        AssignmentResolver::new(
            Arc::new(directory),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(200),
        )
    }

    fn directory() -> StaticDirectory {
        StaticDirectory::new()
            .with_role("manager", &["bob", "carol"])
            .with_role("finance", &["erin"])
            .with_dept("ops", &["dan", "bob"])
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_manual_and_directory_strategies() {
        let r = resolver(directory());
        let doc = Map::new();

        let manual = Step::new("s", StepKind::Approval).manual(&["zed", "amy"]);
        assert_eq!(r.resolve(&manual, "alice", &doc).await.unwrap(), set(&["amy", "zed"]));

        let role = Step::new("s", StepKind::Approval).assign(
            AssignStrategy::Role,
            AssigneeType::Role,
            &["manager", "finance"],
        );
        assert_eq!(
            r.resolve(&role, "alice", &doc).await.unwrap(),
            set(&["bob", "carol", "erin"])
        );

        let dept = Step::new("s", StepKind::Task).assign(AssignStrategy::Dept, AssigneeType::Dept, &["ops"]);
        assert_eq!(r.resolve(&dept, "alice", &doc).await.unwrap(), set(&["bob", "dan"]));
    }

    #[tokio::test]
    async fn test_start_resolves_to_creator_and_passthrough_to_nobody() {
        let r = resolver(directory());
        let doc = Map::new();
        let start = Step::new("start", StepKind::Start);
        assert_eq!(r.resolve(&start, "alice", &doc).await.unwrap(), set(&["alice"]));

        let end = Step::new("end", StepKind::End);
        assert!(r.resolve(&end, "alice", &doc).await.unwrap().is_empty());
        let decision = Step::new("route", StepKind::Decision);
        assert!(r.resolve(&decision, "alice", &doc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_resolution_is_validation_error() {
        let r = resolver(directory());
        let step = Step::new("s", StepKind::Approval).assign(
            AssignStrategy::Role,
            AssigneeType::Role,
            &["nobody"],
        );
        let err = r.resolve(&step, "alice", &Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_auto_picks_least_loaded_lowest_id() {
        let r = resolver(directory());
        let step = Step::new("s", StepKind::Approval).assign(
            AssignStrategy::Auto,
            AssigneeType::Role,
            &["manager"],
        );
        // Both idle: tie goes to "bob".
        assert_eq!(r.resolve(&step, "alice", &Map::new()).await.unwrap(), set(&["bob"]));

        let excluded = r
            .resolve_excluding(&step, "alice", &Map::new(), &set(&["bob"]))
            .await
            .unwrap();
        assert_eq!(excluded, set(&["carol"]));
    }

    #[tokio::test]
    async fn test_rule_strategy_first_match_and_fallback() {
        let r = resolver(directory());
        let mut step = Step::new("s", StepKind::Approval);
        step.assignment.strategy = AssignStrategy::Rule;
        step.assignment.rules = vec![
            AssignmentRule {
                condition: Condition::rule("amount", Operator::Gt, json!(1000)),
                assignee_type: AssigneeType::Role,
                assignee_ids: vec!["finance".to_string()],
            },
            AssignmentRule {
                condition: Condition::rule("amount", Operator::Gt, json!(0)),
                assignee_type: AssigneeType::Role,
                assignee_ids: vec!["manager".to_string()],
            },
        ];

        let big = json!({"amount": 5000}).as_object().cloned().unwrap();
        assert_eq!(r.resolve(&step, "alice", &big).await.unwrap(), set(&["erin"]));

        let small = json!({"amount": 10}).as_object().cloned().unwrap();
        assert_eq!(r.resolve(&step, "alice", &small).await.unwrap(), set(&["bob", "carol"]));

        let none = Map::new();
        assert!(matches!(
            r.resolve(&step, "alice", &none).await.unwrap_err(),
            EngineError::Validation(_)
        ));

        step.assignment.assignee_ids = vec!["frank".to_string()];
        assert_eq!(r.resolve(&step, "alice", &none).await.unwrap(), set(&["frank"]));
    }

    struct SlowDirectory;

    #[async_trait]
    impl Directory for SlowDirectory {
        async fn role_members(&self, _role_id: &str) -> EngineResult<Vec<String>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec!["late".to_string()])
        }

        async fn dept_members(&self, _dept_id: &str) -> EngineResult<Vec<String>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_directory_timeout() {
        let r = AssignmentResolver::new(
            Arc::new(SlowDirectory),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(20),
        );
        let step = Step::new("s", StepKind::Approval).assign(
            AssignStrategy::Role,
            AssigneeType::Role,
            &["manager"],
        );
        let err = r.resolve(&step, "alice", &Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }
}
