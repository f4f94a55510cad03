//! Escalation scheduler.
//!
//! Periodically scans processing instances whose current step outlived its
//! time limit and applies the first enabled matching escalation rule. The
//! gate is the escalation marker, keyed by instance, step, rule and step
//! entry: whoever inserts it first escalates, so replicas never duplicate
//! work and a rule fires at most once per step entry.
//!
//! Each tick reads one page of at most `scan_batch` overdue instances and
//! the next tick continues after it, wrapping to the start once a short page
//! comes back. Step entries that already hold a marker never reappear, and
//! entries that keep being skipped cannot starve the ones behind them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::db::models::{EscalationMarker, Instance, ScanCursor};
use crate::definition::{EscalationAction, EscalationRule, EventKind, ProcessDefinition, Step};
use crate::engine::machine::{ActionRequest, Authority, WorkOrderEngine};
use crate::error::{EngineError, EngineResult};
use crate::result_ext::{OptionResultExt, ResultExt};

/// Outcome counts of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub scanned: usize,
    pub escalated: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Escalated,
    Skipped(&'static str),
}

pub struct EscalationScheduler {
    engine: Arc<WorkOrderEngine>,
    poll_interval: Duration,
    batch: usize,
    cursor: Mutex<Option<ScanCursor>>,
}

impl EscalationScheduler {
    pub fn new(engine: Arc<WorkOrderEngine>, config: &EngineConfig) -> Self {
        Self {
            engine,
            poll_interval: config.poll_interval(),
            batch: config.scan_batch.max(1),
            cursor: Mutex::new(None),
        }
    }

    /// Scan until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            batch = self.batch,
            "Escalation scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Escalation scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    // A failed scan is retried on the next tick.
                    let _ = self.tick().await.log("escalation tick");
                }
            }
        }
    }

    pub async fn tick(&self) -> EngineResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// One scan as of `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> EngineResult<TickReport> {
        let mut cursor = self.cursor.lock().await;
        let overdue = self
            .engine
            .store()
            .list_overdue(now, *cursor, self.batch)
            .await?;
        *cursor = if overdue.len() < self.batch {
            None
        } else {
            overdue.last().and_then(|i| {
                i.due_at.map(|due_at| ScanCursor {
                    due_at,
                    id: i.id,
                })
            })
        };
        drop(cursor);

        let mut report = TickReport {
            scanned: overdue.len(),
            ..Default::default()
        };

        for instance in &overdue {
            match self.escalate(instance, now).await {
                Ok(Outcome::Escalated) => report.escalated += 1,
                Ok(Outcome::Skipped(reason)) => {
                    tracing::debug!(instance_id = %instance.id, reason, "Escalation skipped");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance.id,
                        step = %instance.current_step,
                        error = %e,
                        "Escalation failed, skipping until next poll"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.scanned > 0 {
            tracing::info!(
                scanned = report.scanned,
                escalated = report.escalated,
                skipped = report.skipped,
                failed = report.failed,
                "Escalation tick finished"
            );
        }

        Ok(report)
    }

    async fn escalate(&self, instance: &Instance, now: DateTime<Utc>) -> EngineResult<Outcome> {
        let definition = self.engine.load_definition(instance).await?;
        let Some(step) = definition
            .get_step(&instance.current_step)
            .log_none(format!("step '{}' of instance {}", instance.current_step, instance.id))
        else {
            return Ok(Outcome::Skipped("unknown step"));
        };

        let Some(limit) = step.time_limit_duration() else {
            return Ok(Outcome::Skipped("no time limit"));
        };
        if now - instance.step_entered_at <= limit {
            return Ok(Outcome::Skipped("within time limit"));
        }
        let Some(rule) = definition.escalation_rule_for(&step.id) else {
            return Ok(Outcome::Skipped("no enabled rule"));
        };

        let marker = EscalationMarker {
            instance_id: instance.id,
            step_id: step.id.clone(),
            rule_id: rule.id.clone(),
            step_entry: instance.step_entry,
            claimed_at: now,
        };
        if !self.engine.store().claim_escalation(&marker).await? {
            return Ok(Outcome::Skipped("already escalated"));
        }

        if let Err(e) = self.apply(&definition, instance, step, rule).await {
            let _ = self
                .engine
                .store()
                .release_escalation(&marker)
                .await
                .log("release escalation marker");
            return Err(e);
        }

        tracing::info!(
            instance_id = %instance.id,
            step = %step.id,
            rule = %rule.id,
            action = %rule.action,
            "Instance escalated"
        );

        Ok(Outcome::Escalated)
    }

    async fn apply(
        &self,
        definition: &ProcessDefinition,
        instance: &Instance,
        step: &Step,
        rule: &EscalationRule,
    ) -> EngineResult<()> {
        let engine = &self.engine;
        let system = engine.system_actor().to_string();
        let limit = step.time_limit.unwrap_or_default();

        match rule.action {
            EscalationAction::Notify => {
                engine
                    .comments()
                    .add_system_comment(
                        instance.id,
                        &format!("Step '{}' exceeded its time limit of {}s", step.id, limit),
                    )
                    .await?;
                engine
                    .emit_with(
                        definition,
                        instance,
                        instance,
                        EventKind::Escalated,
                        &system,
                        rule.recipients.as_ref(),
                    )
                    .await;
            }
            EscalationAction::Reassign => {
                let assignees = engine
                    .resolver()
                    .resolve_excluding(
                        step,
                        &instance.creator_id,
                        &instance.evaluation_document(),
                        &instance.assignees,
                    )
                    .await?;

                let mut next = instance.clone();
                next.assignees = assignees;
                next.acted.clear();
                next.version = instance.version + 1;
                next.updated_at = Utc::now();
                engine
                    .store()
                    .commit_instance(instance.version, &next, None)
                    .await?;

                let previous: Vec<&str> = instance.assignees.iter().map(String::as_str).collect();
                let current: Vec<&str> = next.assignees.iter().map(String::as_str).collect();
                // Committed already; the note is best effort.
                let _ = engine
                    .comments()
                    .add_system_comment(
                        instance.id,
                        &format!(
                            "Step '{}' exceeded its time limit of {}s; reassigned from {} to {}",
                            step.id,
                            limit,
                            previous.join(", "),
                            current.join(", ")
                        ),
                    )
                    .await
                    .log("reassignment comment");
                engine
                    .emit_with(definition, instance, &next, EventKind::Escalated, &system, None)
                    .await;
            }
            EscalationAction::AutoApprove => {
                let action = step.primary_action().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step '{}' has no advancing action to auto-approve",
                        step.id
                    ))
                })?;
                let request = ActionRequest::new(instance.id, action, &system, instance.version)
                    .with_comment(&format!(
                        "{} by escalation rule '{}' after the {}s time limit",
                        action, rule.id, limit
                    ));
                let state = engine.apply(request, Authority::System).await?;

                let _ = engine
                    .comments()
                    .add_system_comment(
                        instance.id,
                        &format!(
                            "Step '{}' exceeded its time limit of {}s; '{}' applied on behalf of the assignees",
                            step.id, limit, action
                        ),
                    )
                    .await
                    .log("auto-approve comment");
                if let Ok(next) = engine.load_instance(state.id).await.log("reload after auto-approve") {
                    engine
                        .emit_with(definition, instance, &next, EventKind::Escalated, &system, None)
                        .await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{InstanceState, InstanceStatus, Priority};
    use crate::db::MemoryStore;
    use crate::definition::{
        Action, AssignStrategy, AssigneeType, Condition, Operator, Recipients, StepKind,
        VariableType,
    };
    use crate::directory::StaticDirectory;
    use crate::notify::{ChannelNotifier, NotificationEvent};
    use chrono::Duration;
    use serde_json::{json, Map};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Harness {
        engine: Arc<WorkOrderEngine>,
        scheduler: EscalationScheduler,
        rx: UnboundedReceiver<NotificationEvent>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_batch(EngineConfig::default().scan_batch)
        }

        fn with_batch(scan_batch: usize) -> Self {
            let (notifier, rx) = ChannelNotifier::new();
            let config = EngineConfig {
                scan_batch,
                ..EngineConfig::default()
            };
            let engine = Arc::new(WorkOrderEngine::new(
                Arc::new(MemoryStore::new()),
                Arc::new(StaticDirectory::new().with_role("manager", &["bob", "carol"])),
                Arc::new(notifier),
                &config,
            ));
            let scheduler = EscalationScheduler::new(engine.clone(), &config);
            Self {
                engine,
                scheduler,
                rx,
            }
        }

        fn drain(&mut self) -> Vec<NotificationEvent> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }

        async fn start(&self, definition: ProcessDefinition) -> InstanceState {
            let id = definition.id.clone();
            self.engine.publish_definition(definition).await.unwrap();
            let instance = self
                .engine
                .create_instance(&id, "alice", "late order", Priority::Normal, Map::new())
                .await
                .unwrap();
            self.engine
                .execute_action(ActionRequest::new(instance, Action::Submit, "alice", 1))
                .await
                .unwrap()
        }
    }

    fn rule(id: &str, step: &str, action: EscalationAction) -> EscalationRule {
        EscalationRule {
            id: id.to_string(),
            step: Some(step.to_string()),
            action,
            enabled: true,
            recipients: None,
        }
    }

    fn timed(step: Step, rule: EscalationRule) -> ProcessDefinition {
        let id = step.id.clone();
        ProcessDefinition::builder("timed")
            .step(Step::new("start", StepKind::Start))
            .step(step)
            .step(Step::new("end", StepKind::End))
            .connect("start", &id)
            .connect(&id, "end")
            .escalation(rule)
            .build()
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + Duration::seconds(61)
    }

    #[tokio::test]
    async fn test_auto_approve_fires_once() {
        let mut h = Harness::new();
        let def = timed(
            Step::new("review", StepKind::Approval)
                .manual(&["bob"])
                .with_time_limit(60),
            rule("auto", "review", EscalationAction::AutoApprove),
        );
        let state = h.start(def).await;
        h.drain();

        let report = h.scheduler.tick_at(later()).await.unwrap();
        assert_eq!(report.escalated, 1);

        let after = h.engine.get_instance_state(state.id).await.unwrap();
        assert_eq!(after.status, InstanceStatus::Completed);

        let flows = h.engine.list_flows(state.id).await.unwrap();
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[1].action, Action::Approve);
        assert_eq!(flows[1].actor_id, "system");

        let events: Vec<EventKind> = h.drain().into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec![EventKind::Completed, EventKind::Escalated]);

        let report = h.scheduler.tick_at(later()).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(h.engine.list_flows(state.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_notify_leaves_state_and_is_not_repeated() {
        let mut h = Harness::new();
        let mut notify = rule("nudge", "review", EscalationAction::Notify);
        notify.recipients = Some(Recipients::Users(vec!["lead".to_string()]));
        let def = timed(
            Step::new("review", StepKind::Approval)
                .manual(&["bob"])
                .with_time_limit(60),
            notify,
        );
        let state = h.start(def).await;
        h.drain();

        let report = h.scheduler.tick_at(later()).await.unwrap();
        assert_eq!(report.escalated, 1);

        let after = h.engine.get_instance_state(state.id).await.unwrap();
        assert_eq!(after, state);

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::Escalated);
        assert_eq!(events[0].recipients, vec!["bob", "lead"]);

        let thread = h.engine.comments().thread(state.id).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert!(thread[0].is_system);
        assert_eq!(thread[0].author_id, "system");

        let report = h.scheduler.tick_at(later()).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(h.engine.comments().thread(state.id).await.unwrap().len(), 1);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn test_reassign_moves_to_next_least_loaded() {
        let mut h = Harness::new();
        let def = timed(
            Step::new("review", StepKind::Approval)
                .assign(AssignStrategy::Auto, AssigneeType::Role, &["manager"])
                .with_time_limit(60),
            rule("move", "review", EscalationAction::Reassign),
        );
        let state = h.start(def).await;
        assert_eq!(state.assignees, vec!["bob"]);
        h.drain();

        h.scheduler.tick_at(later()).await.unwrap();

        let after = h.engine.get_instance_state(state.id).await.unwrap();
        assert_eq!(after.assignees, vec!["carol"]);
        assert_eq!(after.version, state.version + 1);
        assert_eq!(after.current_step, "review");
        assert_eq!(h.engine.list_flows(state.id).await.unwrap().len(), 1);

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].recipients, vec!["carol"]);

        let err = h
            .engine
            .execute_action(ActionRequest::new(state.id, Action::Approve, "bob", after.version))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Permission(_)));
    }

    #[tokio::test]
    async fn test_within_limit_is_not_scanned() {
        let h = Harness::new();
        let def = timed(
            Step::new("review", StepKind::Approval)
                .manual(&["bob"])
                .with_time_limit(60),
            rule("auto", "review", EscalationAction::AutoApprove),
        );
        let state = h.start(def).await;

        let report = h.scheduler.tick_at(Utc::now()).await.unwrap();
        assert_eq!(report.scanned, 0);
        assert_eq!(
            h.engine.get_instance_state(state.id).await.unwrap().status,
            InstanceStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_reentered_step_escalates_again() {
        let h = Harness::new();
        let def = ProcessDefinition::builder("rework")
            .variable("rework", VariableType::Boolean)
            .step(Step::new("start", StepKind::Start))
            .step(
                Step::new("work", StepKind::Task)
                    .manual(&["bob"])
                    .with_time_limit(60),
            )
            .step(Step::new("check", StepKind::Decision))
            .step(Step::new("end", StepKind::End))
            .connect("start", "work")
            .connect("work", "check")
            .connect_when(
                "check",
                "work",
                Condition::rule("rework", Operator::Eq, json!(true)),
            )
            .connect("check", "end")
            .revisitable("check")
            .escalation(rule("nudge", "work", EscalationAction::Notify))
            .build();
        let state = h.start(def).await;

        assert_eq!(h.scheduler.tick_at(later()).await.unwrap().escalated, 1);
        assert_eq!(h.scheduler.tick_at(later()).await.unwrap().escalated, 0);

        let state = h
            .engine
            .execute_action(
                ActionRequest::new(state.id, Action::Complete, "bob", state.version)
                    .with_form(json!({"rework": true})),
            )
            .await
            .unwrap();
        assert_eq!(state.current_step, "work");

        assert_eq!(h.scheduler.tick_at(later()).await.unwrap().escalated, 1);
        assert_eq!(h.engine.comments().thread(state.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new();
        h.scheduler.run(async {}).await;
    }

    fn named(mut def: ProcessDefinition, id: &str) -> ProcessDefinition {
        def.id = id.to_string();
        def
    }

    fn review(rule: EscalationRule) -> ProcessDefinition {
        timed(
            Step::new("review", StepKind::Approval)
                .manual(&["bob"])
                .with_time_limit(60),
            rule,
        )
    }

    #[tokio::test]
    async fn test_batch_pages_through_backlog() {
        let h = Harness::with_batch(1);
        let first = h
            .start(named(review(rule("nudge", "review", EscalationAction::Notify)), "nudge"))
            .await;
        let second = h
            .start(named(review(rule("nudge", "review", EscalationAction::Notify)), "nudge"))
            .await;
        let auto = h
            .start(named(review(rule("auto", "review", EscalationAction::AutoApprove)), "auto"))
            .await;

        let now = later();
        for _ in 0..3 {
            let report = h.scheduler.tick_at(now).await.unwrap();
            assert_eq!((report.scanned, report.escalated), (1, 1));
        }

        assert_eq!(
            h.engine.get_instance_state(auto.id).await.unwrap().status,
            InstanceStatus::Completed
        );
        for id in [first.id, second.id] {
            assert_eq!(h.engine.comments().thread(id).await.unwrap().len(), 1);
        }

        // Escalated entries drop out of the scan for good.
        for _ in 0..3 {
            assert_eq!(h.scheduler.tick_at(now).await.unwrap().escalated, 0);
        }
        assert_eq!(h.scheduler.tick_at(now).await.unwrap().scanned, 0);
    }

    #[tokio::test]
    async fn test_skipped_instance_does_not_block_later_ones() {
        let h = Harness::with_batch(1);
        let mut disabled = rule("off", "review", EscalationAction::AutoApprove);
        disabled.enabled = false;
        let stuck = h.start(named(review(disabled), "quiet")).await;
        let due = h
            .start(named(review(rule("auto", "review", EscalationAction::AutoApprove)), "auto"))
            .await;

        let now = later();
        let report = h.scheduler.tick_at(now).await.unwrap();
        assert_eq!((report.scanned, report.skipped), (1, 1));

        let report = h.scheduler.tick_at(now).await.unwrap();
        assert_eq!((report.scanned, report.escalated), (1, 1));

        assert_eq!(
            h.engine.get_instance_state(due.id).await.unwrap().status,
            InstanceStatus::Completed
        );
        assert_eq!(
            h.engine.get_instance_state(stuck.id).await.unwrap().status,
            InstanceStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_failed_reassign_releases_marker() {
        let mut h = Harness::new();
        let state = h.start(review(rule("move", "review", EscalationAction::Reassign))).await;
        h.drain();

        // bob is the only candidate, so excluding him leaves nobody.
        let now = later();
        let report = h.scheduler.tick_at(now).await.unwrap();
        assert_eq!((report.scanned, report.failed), (1, 1));

        let after = h.engine.get_instance_state(state.id).await.unwrap();
        assert_eq!(after, state);
        assert!(h.drain().is_empty());
        assert!(h.engine.comments().thread(state.id).await.unwrap().is_empty());

        // Released, so the next poll retries instead of skipping.
        let report = h.scheduler.tick_at(now).await.unwrap();
        assert_eq!((report.scanned, report.failed, report.skipped), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_time_limit_boundary() {
        let h = Harness::new();
        let state = h
            .start(review(rule("auto", "review", EscalationAction::AutoApprove)))
            .await;
        let due = state.due_at.unwrap();

        let report = h.scheduler.tick_at(due).await.unwrap();
        assert_eq!(report, TickReport::default());

        let report = h
            .scheduler
            .tick_at(due + Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!((report.scanned, report.escalated), (1, 1));
    }
}
