//! Threaded comments on instances.
//!
//! Comments form a tree per instance. Nothing here touches instance state;
//! the machine and the escalation scheduler only append system entries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::db::models::{CommentStatus, InstanceComment};
use crate::db::Store;
use crate::error::{EngineError, EngineResult};

/// A comment with its replies, content redacted unless active.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommentNode {
    pub id: Uuid,
    pub author_id: String,
    pub content: Option<String>,
    pub status: CommentStatus,
    pub is_system: bool,
    pub replies: Vec<CommentNode>,
}

#[derive(Clone)]
pub struct CommentService {
    store: Arc<dyn Store>,
    system_actor: String,
}

impl CommentService {
    pub fn new(store: Arc<dyn Store>, system_actor: &str) -> Self {
        Self {
            store,
            system_actor: system_actor.to_string(),
        }
    }

    pub async fn add_comment(
        &self,
        instance_id: Uuid,
        actor_id: &str,
        content: &str,
        parent_id: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        if content.trim().is_empty() {
            return Err(EngineError::Validation(
                "comment content must not be empty".to_string(),
            ));
        }
        self.insert(instance_id, actor_id, content, parent_id, false)
            .await
    }

    /// Append a machine-written entry authored by the system actor.
    pub async fn add_system_comment(&self, instance_id: Uuid, content: &str) -> EngineResult<Uuid> {
        let actor = self.system_actor.clone();
        self.insert(instance_id, &actor, content, None, true).await
    }

    async fn insert(
        &self,
        instance_id: Uuid,
        actor_id: &str,
        content: &str,
        parent_id: Option<Uuid>,
        is_system: bool,
    ) -> EngineResult<Uuid> {
        if self.store.get_instance(instance_id).await?.is_none() {
            return Err(EngineError::NotFound(format!("instance {}", instance_id)));
        }

        if let Some(parent_id) = parent_id {
            let parent = self.store.get_comment(parent_id).await?;
            if parent.map_or(true, |p| p.instance_id != instance_id) {
                return Err(EngineError::NotFound(format!(
                    "comment {} on instance {}",
                    parent_id, instance_id
                )));
            }
        }

        let now = Utc::now();
        let comment = InstanceComment {
            id: Uuid::new_v4(),
            instance_id,
            parent_id,
            author_id: actor_id.to_string(),
            content: content.to_string(),
            status: CommentStatus::Active,
            is_system,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_comment(&comment).await?;

        tracing::debug!(
            instance_id = %instance_id,
            comment_id = %comment.id,
            parent_id = ?parent_id,
            is_system,
            "Comment added"
        );

        Ok(comment.id)
    }

    /// Soft-delete a comment. Only its author may do this.
    pub async fn delete_comment(&self, comment_id: Uuid, actor_id: &str) -> EngineResult<()> {
        let comment = self.load(comment_id).await?;
        if comment.author_id != actor_id {
            return Err(EngineError::Permission(format!(
                "{} is not the author of comment {}",
                actor_id, comment_id
            )));
        }
        self.store
            .set_comment_status(comment_id, CommentStatus::Deleted, Utc::now())
            .await
    }

    /// Hide a comment. Allowed for its author and the instance creator.
    pub async fn hide_comment(&self, comment_id: Uuid, actor_id: &str) -> EngineResult<()> {
        let comment = self.load(comment_id).await?;
        if comment.author_id != actor_id {
            let creator = self
                .store
                .get_instance(comment.instance_id)
                .await?
                .map(|i| i.creator_id);
            if creator.as_deref() != Some(actor_id) {
                return Err(EngineError::Permission(format!(
                    "{} may not hide comment {}",
                    actor_id, comment_id
                )));
            }
        }
        self.store
            .set_comment_status(comment_id, CommentStatus::Hidden, Utc::now())
            .await
    }

    /// The comment forest of an instance, oldest first at every level.
    pub async fn thread(&self, instance_id: Uuid) -> EngineResult<Vec<CommentNode>> {
        let comments = self.store.list_comments(instance_id).await?;

        let mut children: HashMap<Option<Uuid>, Vec<&InstanceComment>> = HashMap::new();
        for comment in &comments {
            children.entry(comment.parent_id).or_default().push(comment);
        }

        Ok(build_level(&children, None))
    }

    async fn load(&self, comment_id: Uuid) -> EngineResult<InstanceComment> {
        self.store
            .get_comment(comment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("comment {}", comment_id)))
    }
}

fn build_level(
    children: &HashMap<Option<Uuid>, Vec<&InstanceComment>>,
    parent: Option<Uuid>,
) -> Vec<CommentNode> {
    children
        .get(&parent)
        .map(|level| {
            level
                .iter()
                .map(|c| CommentNode {
                    id: c.id,
                    author_id: c.author_id.clone(),
                    content: c.is_visible().then(|| c.content.clone()),
                    status: c.status,
                    is_system: c.is_system,
                    replies: build_level(children, Some(c.id)),
                })
                .collect()
        })
        .unwrap_or_default()
}
