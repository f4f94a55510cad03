//! In-process [`Store`] backed by a single `RwLock`.
//!
//! Every method takes the lock once, so compare-and-swap commits and marker
//! claims are atomic with respect to each other.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{
    CommentStatus, EscalationMarker, Instance, InstanceComment, InstanceFlow, InstanceStatus,
    ScanCursor,
};
use crate::db::store::Store;
use crate::definition::{DefinitionStatus, ProcessDefinition};
use crate::error::{EngineError, EngineResult};

type MarkerKey = (Uuid, String, String, u32);

#[derive(Default)]
struct Inner {
    definitions: HashMap<(String, u32), ProcessDefinition>,
    instances: HashMap<Uuid, Instance>,
    flows: Vec<InstanceFlow>,
    comments: Vec<InstanceComment>,
    markers: HashSet<MarkerKey>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_definition(&self, definition: &ProcessDefinition) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let key = (definition.id.clone(), definition.version);
        if inner.definitions.contains_key(&key) {
            return Err(EngineError::Conflict(format!(
                "definition {} version {} already exists",
                definition.id, definition.version
            )));
        }
        inner.definitions.insert(key, definition.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &str,
        version: u32,
    ) -> EngineResult<Option<ProcessDefinition>> {
        let inner = self.inner.read().await;
        Ok(inner.definitions.get(&(id.to_string(), version)).cloned())
    }

    async fn latest_definition_version(&self, id: &str) -> EngineResult<Option<u32>> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .keys()
            .filter(|(def_id, _)| def_id == id)
            .map(|(_, version)| *version)
            .max())
    }

    async fn latest_published_definition(
        &self,
        id: &str,
    ) -> EngineResult<Option<ProcessDefinition>> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .values()
            .filter(|d| d.id == id && d.status == DefinitionStatus::Published)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn set_definition_status(
        &self,
        id: &str,
        version: u32,
        status: DefinitionStatus,
    ) -> EngineResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.definitions.get_mut(&(id.to_string(), version)) {
            Some(def) => {
                def.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_instance(&self, instance: &Instance) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        if inner.instances.contains_key(&instance.id) {
            return Err(EngineError::Conflict(format!(
                "instance {} already exists",
                instance.id
            )));
        }
        inner.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> EngineResult<Option<Instance>> {
        let inner = self.inner.read().await;
        Ok(inner.instances.get(&id).cloned())
    }

    async fn commit_instance(
        &self,
        expected_version: i64,
        instance: &Instance,
        flow: Option<&InstanceFlow>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .instances
            .get_mut(&instance.id)
            .ok_or_else(|| EngineError::NotFound(format!("instance {}", instance.id)))?;

        if stored.version != expected_version {
            return Err(EngineError::Conflict(format!(
                "instance {} is at version {}, expected {}",
                instance.id, stored.version, expected_version
            )));
        }

        *stored = instance.clone();
        if let Some(flow) = flow {
            inner.flows.push(flow.clone());
        }
        Ok(())
    }

    async fn list_flows(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceFlow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .flows
            .iter()
            .filter(|f| f.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_overdue(
        &self,
        now: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> EngineResult<Vec<Instance>> {
        let inner = self.inner.read().await;
        let claimed = |i: &Instance| {
            inner.markers.iter().any(|(id, step, _, entry)| {
                *id == i.id && *step == i.current_step && *entry == i.step_entry
            })
        };
        let mut overdue: Vec<(DateTime<Utc>, &Instance)> = inner
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Processing)
            .filter_map(|i| i.due_at.filter(|due| *due < now).map(|due| (due, i)))
            .filter(|(due, i)| after.map_or(true, |c| (*due, i.id) > (c.due_at, c.id)))
            .filter(|(_, i)| !claimed(*i))
            .collect();
        overdue.sort_by_key(|(due, i)| (*due, i.id));
        Ok(overdue
            .into_iter()
            .take(limit)
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn list_pending_for(&self, actor_id: &str) -> EngineResult<Vec<Instance>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<Instance> = inner
            .instances
            .values()
            .filter(|i| i.is_pending_for(actor_id))
            .cloned()
            .collect();
        pending.sort_by_key(|i| (i.created_at, i.id));
        Ok(pending)
    }

    async fn open_assignment_counts(
        &self,
        actors: &[String],
    ) -> EngineResult<HashMap<String, u64>> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<String, u64> = actors.iter().map(|a| (a.clone(), 0)).collect();
        for instance in inner.instances.values() {
            for (actor, count) in counts.iter_mut() {
                if instance.is_pending_for(actor) {
                    *count += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn insert_comment(&self, comment: &InstanceComment) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.comments.push(comment.clone());
        Ok(())
    }

    async fn get_comment(&self, id: Uuid) -> EngineResult<Option<InstanceComment>> {
        let inner = self.inner.read().await;
        Ok(inner.comments.iter().find(|c| c.id == id).cloned())
    }

    async fn list_comments(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceComment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .comments
            .iter()
            .filter(|c| c.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn set_comment_status(
        &self,
        id: Uuid,
        status: CommentStatus,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        let comment = inner
            .comments
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("comment {}", id)))?;
        comment.status = status;
        comment.updated_at = at;
        Ok(())
    }

    async fn claim_escalation(&self, marker: &EscalationMarker) -> EngineResult<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner.markers.insert(marker.key()))
    }

    async fn release_escalation(&self, marker: &EscalationMarker) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.markers.remove(&marker.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Priority;
    use serde_json::Map;

    fn instance(version: i64) -> Instance {
        let now = Utc::now();
        Instance {
            id: Uuid::new_v4(),
            definition_id: "d".to_string(),
            definition_version: 1,
            title: "t".to_string(),
            creator_id: "alice".to_string(),
            priority: Priority::Normal,
            status: InstanceStatus::Processing,
            current_step: "review".to_string(),
            assignees: ["bob".to_string()].into(),
            acted: Default::default(),
            form_data: Map::new(),
            step_entered_at: now,
            step_entry: 1,
            due_at: None,
            version,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_commit_is_compare_and_swap() {
        let store = MemoryStore::new();
        let mut inst = instance(1);
        store.insert_instance(&inst).await.unwrap();

        inst.version = 2;
        store.commit_instance(1, &inst, None).await.unwrap();

        // A writer still holding version 1 loses.
        let stale = store.commit_instance(1, &inst, None).await.unwrap_err();
        assert!(matches!(stale, EngineError::Conflict(_)));

        let stored = store.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = MemoryStore::new();
        let marker = EscalationMarker {
            instance_id: Uuid::new_v4(),
            step_id: "review".to_string(),
            rule_id: "late".to_string(),
            step_entry: 1,
            claimed_at: Utc::now(),
        };
        assert!(store.claim_escalation(&marker).await.unwrap());
        assert!(!store.claim_escalation(&marker).await.unwrap());

        let next_entry = EscalationMarker {
            step_entry: 2,
            ..marker.clone()
        };
        assert!(store.claim_escalation(&next_entry).await.unwrap());

        store.release_escalation(&marker).await.unwrap();
        assert!(store.claim_escalation(&marker).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_assignment_counts() {
        let store = MemoryStore::new();
        store.insert_instance(&instance(1)).await.unwrap();
        store.insert_instance(&instance(1)).await.unwrap();
        let mut done = instance(1);
        done.status = InstanceStatus::Completed;
        store.insert_instance(&done).await.unwrap();

        let counts = store
            .open_assignment_counts(&["bob".to_string(), "dan".to_string()])
            .await
            .unwrap();
        assert_eq!(counts["bob"], 2);
        assert_eq!(counts["dan"], 0);
    }

    #[tokio::test]
    async fn test_overdue_scan_filters_and_pages() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for mins in [30, 20, 10] {
            let mut inst = instance(1);
            inst.due_at = Some(now - chrono::Duration::minutes(mins));
            store.insert_instance(&inst).await.unwrap();
            ids.push(inst.id);
        }
        let mut at_now = instance(1);
        at_now.due_at = Some(now);
        store.insert_instance(&at_now).await.unwrap();

        let all: Vec<Uuid> = store
            .list_overdue(now, None, 10)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(all, ids);

        let page = store.list_overdue(now, None, 1).await.unwrap();
        let cursor = ScanCursor {
            due_at: page[0].due_at.unwrap(),
            id: page[0].id,
        };
        let rest = store.list_overdue(now, Some(cursor), 10).await.unwrap();
        assert_eq!(rest.iter().map(|i| i.id).collect::<Vec<_>>(), ids[1..].to_vec());

        // A marker on the current entry hides the instance; an older entry does not.
        let marker = EscalationMarker {
            instance_id: ids[1],
            step_id: "review".to_string(),
            rule_id: "late".to_string(),
            step_entry: 1,
            claimed_at: now,
        };
        store.claim_escalation(&marker).await.unwrap();
        store
            .claim_escalation(&EscalationMarker {
                instance_id: ids[2],
                step_entry: 0,
                ..marker.clone()
            })
            .await
            .unwrap();
        let left: Vec<Uuid> = store
            .list_overdue(now, None, 10)
            .await
            .unwrap()
            .iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(left, vec![ids[0], ids[2]]);
    }
}
