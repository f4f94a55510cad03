//! Instance state machine.
//!
//! `Draft -> Processing -> {Completed | Cancelled | Rejected}`. Every
//! accepted action is computed on a copy of the instance and committed with
//! a compare-and-swap on its version together with exactly one flow row, so
//! a failed check leaves nothing behind.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::models::{Instance, InstanceFlow, InstanceState, InstanceStatus, Priority};
use crate::db::Store;
use crate::definition::{
    validate_definition, Action, DefinitionStatus, EventKind, ProcessDefinition, Recipients, Step,
    StepKind,
};
use crate::directory::Directory;
use crate::engine::assignment::AssignmentResolver;
use crate::engine::comments::CommentService;
use crate::engine::evaluator::select_connection;
use crate::error::{EngineError, EngineResult};
use crate::notify::{NotificationEvent, Notifier};

/// Upper bound on consecutive passthrough steps left within one action.
pub const MAX_AUTO_ADVANCE: usize = 10;

/// A caller action against an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub instance_id: Uuid,
    pub action: Action,
    pub actor_id: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub form_delta: Map<String, Value>,
    pub expected_version: i64,
    /// New assignees for `transfer`.
    #[serde(default)]
    pub transfer_to: Vec<String>,
}

impl ActionRequest {
    pub fn new(instance_id: Uuid, action: Action, actor_id: &str, expected_version: i64) -> Self {
        Self {
            instance_id,
            action,
            actor_id: actor_id.to_string(),
            comment: None,
            form_delta: Map::new(),
            expected_version,
            transfer_to: Vec::new(),
        }
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn with_form(mut self, delta: Value) -> Self {
        if let Value::Object(map) = delta {
            self.form_delta = map;
        }
        self
    }

    pub fn transfer_to(mut self, actors: &[&str]) -> Self {
        self.transfer_to = actors.iter().map(|a| a.to_string()).collect();
        self
    }

    fn has_comment(&self) -> bool {
        self.comment.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// Who is behind an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Authority {
    /// A caller; must be a pending assignee (or the creator cancelling).
    Actor,
    /// The engine itself, acting for the assignees. Skips the assignee check
    /// and satisfies any parallel quorum on its own.
    System,
}

/// Where an accepted action leaves the instance.
struct Transition {
    next: Instance,
    flow: InstanceFlow,
    event: Option<EventKind>,
}

/// The work-order engine: definitions, instances and their transitions.
pub struct WorkOrderEngine {
    store: Arc<dyn Store>,
    resolver: AssignmentResolver,
    notifier: Arc<dyn Notifier>,
    comments: CommentService,
    notify_timeout: Duration,
    system_actor: String,
}

impl WorkOrderEngine {
    pub fn new(
        store: Arc<dyn Store>,
        directory: Arc<dyn Directory>,
        notifier: Arc<dyn Notifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            resolver: AssignmentResolver::new(directory, store.clone(), config.lookup_timeout()),
            comments: CommentService::new(store.clone(), &config.system_actor),
            store,
            notifier,
            notify_timeout: config.notify_timeout(),
            system_actor: config.system_actor.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn comments(&self) -> &CommentService {
        &self.comments
    }

    pub(crate) fn resolver(&self) -> &AssignmentResolver {
        &self.resolver
    }

    pub fn system_actor(&self) -> &str {
        &self.system_actor
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Validate and publish `definition` as the next version of its id.
    pub async fn publish_definition(
        &self,
        mut definition: ProcessDefinition,
    ) -> EngineResult<ProcessDefinition> {
        validate_definition(&definition).map_err(EngineError::InvalidDefinition)?;

        let latest = self.store.latest_definition_version(&definition.id).await?;
        definition.version = latest.map_or(1, |v| v + 1);
        definition.status = DefinitionStatus::Published;
        definition.published_at = Some(Utc::now());

        self.store.insert_definition(&definition).await?;

        tracing::info!(
            definition_id = %definition.id,
            version = definition.version,
            steps = definition.steps.len(),
            "Definition published"
        );

        Ok(definition)
    }

    /// Stop new instances of one version. Running instances continue.
    pub async fn archive_definition(&self, id: &str, version: u32) -> EngineResult<()> {
        if !self
            .store
            .set_definition_status(id, version, DefinitionStatus::Archived)
            .await?
        {
            return Err(EngineError::NotFound(format!(
                "definition {} version {}",
                id, version
            )));
        }
        tracing::info!(definition_id = %id, version, "Definition archived");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------

    /// Create a draft instance at the start step of the latest published
    /// version of `definition_id`.
    pub async fn create_instance(
        &self,
        definition_id: &str,
        creator_id: &str,
        title: &str,
        priority: Priority,
        form_data: Map<String, Value>,
    ) -> EngineResult<Uuid> {
        let definition = self
            .store
            .latest_published_definition(definition_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("published definition {}", definition_id))
            })?;

        let missing: Vec<&str> = definition
            .variables
            .iter()
            .filter(|v| v.required && form_data.get(&v.name).map_or(true, Value::is_null))
            .map(|v| v.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(EngineError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let start = definition.start_step().ok_or_else(|| {
            EngineError::Internal(format!("definition {} has no start step", definition.id))
        })?;

        let now = Utc::now();
        let mut instance = Instance {
            id: Uuid::new_v4(),
            definition_id: definition.id.clone(),
            definition_version: definition.version,
            title: title.to_string(),
            creator_id: creator_id.to_string(),
            priority,
            status: InstanceStatus::Draft,
            current_step: start.id.clone(),
            assignees: BTreeSet::new(),
            acted: BTreeSet::new(),
            form_data,
            step_entered_at: now,
            step_entry: 1,
            due_at: due_at(start, now)?,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        instance.assignees = self
            .resolver
            .resolve(start, creator_id, &instance.evaluation_document())
            .await?;

        self.store.insert_instance(&instance).await?;

        tracing::info!(
            instance_id = %instance.id,
            definition_id = %definition.id,
            version = definition.version,
            creator = %creator_id,
            "Instance created"
        );

        self.emit(&definition, &instance, &instance, EventKind::Created, creator_id)
            .await;

        Ok(instance.id)
    }

    /// Apply a caller action.
    pub async fn execute_action(&self, request: ActionRequest) -> EngineResult<InstanceState> {
        self.apply(request, Authority::Actor).await
    }

    pub(crate) async fn apply(
        &self,
        request: ActionRequest,
        authority: Authority,
    ) -> EngineResult<InstanceState> {
        let instance = self.load_instance(request.instance_id).await?;

        if instance.is_terminal() {
            return Err(EngineError::TerminalState(format!(
                "instance {} is {}",
                instance.id, instance.status
            )));
        }
        if instance.version != request.expected_version {
            return Err(EngineError::Conflict(format!(
                "instance {} is at version {}, expected {}",
                instance.id, instance.version, request.expected_version
            )));
        }

        let definition = self.load_definition(&instance).await?;
        let transition = self
            .transition(&definition, &instance, &request, authority)
            .await?;

        self.store
            .commit_instance(request.expected_version, &transition.next, Some(&transition.flow))
            .await?;

        tracing::info!(
            instance_id = %instance.id,
            action = %request.action,
            actor = %request.actor_id,
            from = %instance.current_step,
            to = %transition.next.current_step,
            status = %transition.next.status,
            version = transition.next.version,
            "Action applied"
        );

        if let Some(event) = transition.event {
            self.emit(&definition, &instance, &transition.next, event, &request.actor_id)
                .await;
        }

        Ok(transition.next.state())
    }

    /// Check the request and compute the post-action instance.
    async fn transition(
        &self,
        definition: &ProcessDefinition,
        instance: &Instance,
        request: &ActionRequest,
        authority: Authority,
    ) -> EngineResult<Transition> {
        let step = definition.get_step(&instance.current_step).ok_or_else(|| {
            EngineError::Internal(format!(
                "step '{}' missing from {} v{}",
                instance.current_step, definition.id, definition.version
            ))
        })?;
        let action = request.action;
        let creator_cancel = action == Action::Cancel && request.actor_id == instance.creator_id;

        if authority == Authority::Actor && !creator_cancel && !instance.is_pending_for(&request.actor_id) {
            return Err(EngineError::Permission(format!(
                "{} is not a pending assignee of step '{}'",
                request.actor_id, step.id
            )));
        }

        if !creator_cancel {
            if !step.allows(action) {
                return Err(EngineError::Validation(format!(
                    "action '{}' is not allowed on step '{}'",
                    action, step.id
                )));
            }
            let submitting = action == Action::Submit;
            if (instance.status == InstanceStatus::Draft) != submitting {
                return Err(EngineError::Validation(format!(
                    "action '{}' is not valid while the instance is {}",
                    action, instance.status
                )));
            }
        }

        if step.require_comment && !request.has_comment() {
            return Err(EngineError::Validation(format!(
                "step '{}' requires a comment",
                step.id
            )));
        }

        let now = Utc::now();
        let mut next = instance.clone();
        for (key, value) in &request.form_delta {
            next.form_data.insert(key.clone(), value.clone());
        }
        next.version = instance.version + 1;
        next.updated_at = now;

        let mut route = Vec::new();
        let event = match action {
            Action::Cancel => {
                finish(&mut next, InstanceStatus::Cancelled, now);
                Some(EventKind::Cancelled)
            }
            Action::Reject => {
                finish(&mut next, InstanceStatus::Rejected, now);
                Some(EventKind::Rejected)
            }
            Action::Transfer => {
                if request.transfer_to.is_empty() {
                    return Err(EngineError::Validation(
                        "transfer requires at least one target".to_string(),
                    ));
                }
                next.assignees = request.transfer_to.iter().cloned().collect();
                next.acted.clear();
                Some(EventKind::Transferred)
            }
            Action::Submit | Action::Approve | Action::Complete => {
                next.acted.insert(request.actor_id.clone());
                let quorum_met = authority == Authority::System
                    || !step.allow_parallel
                    || step.quorum.is_met(next.acted.len(), next.assignees.len());

                if quorum_met {
                    if action == Action::Submit {
                        next.status = InstanceStatus::Processing;
                    }
                    route = self.advance(definition, &mut next, now).await?;
                    Some(match (next.status, action) {
                        (InstanceStatus::Completed, _) => EventKind::Completed,
                        (_, Action::Submit) => EventKind::Created,
                        _ => EventKind::Approved,
                    })
                } else {
                    tracing::debug!(
                        instance_id = %instance.id,
                        step = %step.id,
                        acted = next.acted.len(),
                        assigned = next.assignees.len(),
                        "Parallel step waiting for quorum"
                    );
                    None
                }
            }
        };

        let flow = InstanceFlow {
            id: Uuid::new_v4(),
            instance_id: instance.id,
            step_id: step.id.clone(),
            to_step: next.current_step.clone(),
            route,
            action,
            actor_id: request.actor_id.clone(),
            comment: request.comment.clone(),
            form_delta: request.form_delta.clone(),
            version: next.version,
            created_at: now,
        };

        Ok(Transition { next, flow, event })
    }

    /// Route out of the current step, passing through decision and
    /// auto-complete steps, and enter the step the instance comes to rest on.
    /// Returns every step entered.
    async fn advance(
        &self,
        definition: &ProcessDefinition,
        next: &mut Instance,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<String>> {
        let doc = next.evaluation_document();
        let mut route: Vec<String> = Vec::new();
        let mut current = next.current_step.clone();
        let mut hops = 0usize;

        let target = loop {
            let connection = select_connection(definition, &current, &doc).ok_or_else(|| {
                EngineError::Validation(format!(
                    "no outbound connection from step '{}' matches",
                    current
                ))
            })?;
            let target = definition.get_step(&connection.to).ok_or_else(|| {
                EngineError::Internal(format!("connection to unknown step '{}'", connection.to))
            })?;
            route.push(target.id.clone());

            if target.kind == StepKind::End || !target.is_passthrough() {
                break target;
            }

            hops += 1;
            if hops > MAX_AUTO_ADVANCE {
                return Err(EngineError::Validation(format!(
                    "auto-advance exceeded {} steps (route: {})",
                    MAX_AUTO_ADVANCE,
                    route.join(" -> ")
                )));
            }
            current = target.id.clone();
        };

        next.current_step = target.id.clone();
        next.step_entry += route.len() as u32;
        next.step_entered_at = now;
        next.acted.clear();

        if target.kind == StepKind::End {
            finish(next, InstanceStatus::Completed, now);
        } else {
            next.due_at = due_at(target, now)?;
            next.assignees = self
                .resolver
                .resolve(target, &next.creator_id, &doc)
                .await?;
        }

        Ok(route)
    }

    pub async fn get_instance_state(&self, instance_id: Uuid) -> EngineResult<InstanceState> {
        Ok(self.load_instance(instance_id).await?.state())
    }

    /// Instances waiting on `actor_id`, most urgent first, then oldest.
    pub async fn list_pending_for_actor(&self, actor_id: &str) -> EngineResult<Vec<Uuid>> {
        let mut pending = self.store.list_pending_for(actor_id).await?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(pending.into_iter().map(|i| i.id).collect())
    }

    pub async fn list_flows(&self, instance_id: Uuid) -> EngineResult<Vec<InstanceFlow>> {
        self.load_instance(instance_id).await?;
        self.store.list_flows(instance_id).await
    }

    pub async fn add_comment(
        &self,
        instance_id: Uuid,
        actor_id: &str,
        content: &str,
        parent_id: Option<Uuid>,
    ) -> EngineResult<Uuid> {
        self.comments
            .add_comment(instance_id, actor_id, content, parent_id)
            .await
    }

    pub(crate) async fn load_instance(&self, instance_id: Uuid) -> EngineResult<Instance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("instance {}", instance_id)))
    }

    pub(crate) async fn load_definition(&self, instance: &Instance) -> EngineResult<ProcessDefinition> {
        self.store
            .get_definition(&instance.definition_id, instance.definition_version)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "definition {} version {}",
                    instance.definition_id, instance.definition_version
                ))
            })
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Send `event` after a commit. Failures are logged, never returned.
    pub(crate) async fn emit(
        &self,
        definition: &ProcessDefinition,
        before: &Instance,
        after: &Instance,
        event: EventKind,
        actor_id: &str,
    ) {
        self.emit_with(definition, before, after, event, actor_id, None)
            .await
    }

    pub(crate) async fn emit_with(
        &self,
        definition: &ProcessDefinition,
        before: &Instance,
        after: &Instance,
        event: EventKind,
        actor_id: &str,
        extra: Option<&Recipients>,
    ) {
        let mut recipients = event_recipients(definition, before, after, event);
        if let Some(extra) = extra {
            recipients.extend(expand_recipients(extra, before, after));
        }
        if recipients.is_empty() {
            tracing::debug!(instance_id = %after.id, event = %event, "No recipients for event");
            return;
        }

        let notification = NotificationEvent {
            event,
            instance_id: after.id,
            definition_id: definition.id.clone(),
            step_id: after.current_step.clone(),
            actor_id: actor_id.to_string(),
            recipients: recipients.into_iter().collect(),
        };

        match tokio::time::timeout(self.notify_timeout, self.notifier.notify(notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(instance_id = %after.id, event = %event, error = %e, "Notification failed");
            }
            Err(_) => {
                tracing::warn!(
                    instance_id = %after.id,
                    event = %event,
                    timeout_ms = self.notify_timeout.as_millis() as u64,
                    "Notification timed out"
                );
            }
        }
    }
}

fn finish(instance: &mut Instance, status: InstanceStatus, now: DateTime<Utc>) {
    instance.status = status;
    instance.completed_at = Some(now);
    instance.assignees.clear();
    instance.acted.clear();
    instance.due_at = None;
}

fn due_at(step: &Step, entered: DateTime<Utc>) -> EngineResult<Option<DateTime<Utc>>> {
    let Some(secs) = step.time_limit else {
        return Ok(None);
    };
    step.time_limit_duration()
        .and_then(|limit| entered.checked_add_signed(limit))
        .map(Some)
        .ok_or_else(|| {
            EngineError::Validation(format!(
                "step '{}': time_limit of {}s is out of range",
                step.id, secs
            ))
        })
}

/// Recipients from the definition's notification rules for `event`, or the
/// event's default audience when no rule names it.
fn event_recipients(
    definition: &ProcessDefinition,
    before: &Instance,
    after: &Instance,
    event: EventKind,
) -> BTreeSet<String> {
    let rules: Vec<&Recipients> = definition
        .settings
        .notification_rules
        .iter()
        .filter(|r| r.event == event)
        .filter(|r| r.enabled)
        .map(|r| &r.recipients)
        .collect();

    let configured = definition
        .settings
        .notification_rules
        .iter()
        .any(|r| r.event == event);
    if configured {
        return rules
            .into_iter()
            .flat_map(|r| expand_recipients(r, before, after))
            .collect();
    }

    let default = match event {
        EventKind::Rejected | EventKind::Completed => Recipients::Creator,
        _ => Recipients::Assignees,
    };
    expand_recipients(&default, before, after)
}

/// `Assignees` means the actors now responsible, or the ones that were
/// responsible when the instance just left every step.
fn expand_recipients(recipients: &Recipients, before: &Instance, after: &Instance) -> BTreeSet<String> {
    match recipients {
        Recipients::Assignees if after.assignees.is_empty() => before.assignees.clone(),
        Recipients::Assignees => after.assignees.clone(),
        Recipients::Creator => BTreeSet::from([after.creator_id.clone()]),
        Recipients::Users(users) => users.iter().cloned().collect(),
    }
}
