//! Wellness goals domain used by the outbox demo.
//!
//! A [`WellnessGoal`] aggregate records progress toward a weekly target and
//! collects [`GoalEvent`]s as it changes. The binary persists the aggregate and
//! its events in one transaction; the outbox delivers the events to the
//! [`AuditLog`] and [`CompletionNotifier`] handlers.

use chrono::{DateTime, Utc};
use outbox_core::consumer::{EventHandler, HandlerError};
use outbox_core::event::{DomainEvent, EventEnvelope, EventMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

/// Routing key for [`GoalChange::Created`].
pub const GOAL_CREATED: &str = "wellness.goal.created";
/// Routing key for [`GoalChange::ProgressLogged`].
pub const PROGRESS_LOGGED: &str = "wellness.goal.progress_logged";
/// Routing key for [`GoalChange::Completed`].
pub const GOAL_COMPLETED: &str = "wellness.goal.completed";

/// Every routing key the goal aggregate emits.
pub const GOAL_ROUTING_KEYS: [&str; 3] = [GOAL_CREATED, PROGRESS_LOGGED, GOAL_COMPLETED];

/// Goal command errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GoalError {
    /// Progress must be positive.
    #[error("Progress must be positive")]
    InvalidProgress,

    /// The goal already reached its target.
    #[error("Goal {0} is already completed")]
    AlreadyCompleted(String),
}

/// What happened to a goal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GoalChange {
    /// Goal created.
    Created {
        /// Goal title.
        title: String,
        /// Sessions per week.
        target_per_week: u32,
    },
    /// Sessions logged.
    ProgressLogged {
        /// Sessions added.
        amount: u32,
        /// Total after this entry.
        progress: u32,
    },
    /// Weekly target reached.
    Completed {
        /// Final total.
        progress: u32,
    },
}

/// Event emitted by [`WellnessGoal`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalEvent {
    /// Deduplication key.
    pub event_id: String,
    /// Goal identifier.
    pub goal_id: String,
    /// Owner.
    pub user_id: String,
    /// Occurrence time.
    pub occurred_at: DateTime<Utc>,
    /// The change.
    #[serde(flatten)]
    pub change: GoalChange,
}

impl DomainEvent for GoalEvent {
    fn event_id(&self) -> &str {
        &self.event_id
    }

    fn aggregate_id(&self) -> &str {
        &self.goal_id
    }

    fn aggregate_type(&self) -> &str {
        "wellness_goal"
    }

    fn routing_key(&self) -> &str {
        match self.change {
            GoalChange::Created { .. } => GOAL_CREATED,
            GoalChange::ProgressLogged { .. } => PROGRESS_LOGGED,
            GoalChange::Completed { .. } => GOAL_COMPLETED,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn metadata(&self) -> EventMetadata {
        EventMetadata::new()
            .with_user_id(self.user_id.clone())
            .with_correlation_id(self.goal_id.clone())
    }
}

/// A weekly wellness goal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WellnessGoal {
    /// Goal identifier.
    pub id: String,
    /// Owner.
    pub user_id: String,
    /// Title.
    pub title: String,
    /// Sessions per week.
    pub target_per_week: u32,
    /// Sessions so far.
    pub progress: u32,
    events: Vec<GoalEvent>,
}

impl WellnessGoal {
    /// Create a goal; records [`GoalChange::Created`].
    #[must_use]
    pub fn create(user_id: &str, title: &str, target_per_week: u32) -> Self {
        let mut goal = Self {
            id: format!("goal-{}", Uuid::new_v4()),
            user_id: user_id.to_string(),
            title: title.to_string(),
            target_per_week: target_per_week.max(1),
            progress: 0,
            events: Vec::new(),
        };
        goal.record(GoalChange::Created {
            title: goal.title.clone(),
            target_per_week: goal.target_per_week,
        });
        goal
    }

    /// Whether the weekly target is reached.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.progress >= self.target_per_week
    }

    /// Log `amount` sessions; completing the goal also records
    /// [`GoalChange::Completed`].
    ///
    /// # Errors
    ///
    /// Returns [`GoalError::InvalidProgress`] for zero, or
    /// [`GoalError::AlreadyCompleted`] once the target is reached.
    pub fn log_progress(&mut self, amount: u32) -> Result<(), GoalError> {
        if amount == 0 {
            return Err(GoalError::InvalidProgress);
        }
        if self.is_completed() {
            return Err(GoalError::AlreadyCompleted(self.id.clone()));
        }

        self.progress = self.progress.saturating_add(amount);
        self.record(GoalChange::ProgressLogged {
            amount,
            progress: self.progress,
        });
        if self.is_completed() {
            self.record(GoalChange::Completed {
                progress: self.progress,
            });
        }
        Ok(())
    }

    /// Events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<GoalEvent> {
        std::mem::take(&mut self.events)
    }

    fn record(&mut self, change: GoalChange) {
        self.events.push(GoalEvent {
            event_id: Uuid::new_v4().to_string(),
            goal_id: self.id.clone(),
            user_id: self.user_id.clone(),
            occurred_at: Utc::now(),
            change,
        });
    }
}

/// Records every goal event once, ignoring redeliveries.
#[derive(Debug, Default)]
pub struct AuditLog {
    seen: Mutex<HashSet<String>>,
    entries: Mutex<Vec<String>>,
}

impl AuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `"<routing key> <aggregate id>"` lines in arrival order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventHandler for AuditLog {
    fn event_types(&self) -> Vec<String> {
        GOAL_ROUTING_KEYS.iter().map(ToString::to_string).collect()
    }

    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let fresh = self
                .seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(envelope.event_id.clone());
            if !fresh {
                tracing::debug!(event_id = %envelope.event_id, "Duplicate delivery ignored");
                return Ok(());
            }

            let line = format!("{} {}", envelope.routing_key, envelope.aggregate_id);
            tracing::info!(audit = %line, "Audit entry");
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(line);
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "audit-log"
    }
}

/// Congratulates users on completed goals.
#[derive(Debug, Default)]
pub struct CompletionNotifier {
    sent: AtomicUsize,
}

impl CompletionNotifier {
    /// Create a notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl EventHandler for CompletionNotifier {
    fn event_types(&self) -> Vec<String> {
        vec![GOAL_COMPLETED.to_string()]
    }

    fn handle<'a>(
        &'a self,
        envelope: &'a EventEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let event: GoalEvent = envelope
                .decode_payload()
                .map_err(|e| HandlerError::new(e.to_string()))?;

            let GoalChange::Completed { progress } = event.change else {
                return Err(HandlerError::new(format!(
                    "unexpected change on {}",
                    envelope.routing_key
                )));
            };

            tracing::info!(
                user_id = %event.user_id,
                goal_id = %event.goal_id,
                progress,
                "Goal completed, notification sent"
            );
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "completion-notifier"
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use outbox_core::consumer::ConsumerRegistry;
    use outbox_core::repository::enqueue;
    use outbox_runtime::{InProcessPublisher, OutboxProcessor, ProcessorConfig};
    use outbox_testing::InMemoryOutboxRepository;
    use std::sync::Arc;

    #[test]
    fn test_goal_records_events_in_order() {
        let mut goal = WellnessGoal::create("user-1", "Meditate", 2);
        goal.log_progress(1).expect("progress");
        goal.log_progress(1).expect("progress");

        let keys: Vec<_> = goal
            .take_events()
            .iter()
            .map(|event| event.routing_key().to_string())
            .collect();
        assert_eq!(
            keys,
            vec![GOAL_CREATED, PROGRESS_LOGGED, PROGRESS_LOGGED, GOAL_COMPLETED]
        );
        assert!(goal.take_events().is_empty());
    }

    #[test]
    fn test_goal_rejects_bad_progress() {
        let mut goal = WellnessGoal::create("user-1", "Run", 1);
        assert_eq!(goal.log_progress(0), Err(GoalError::InvalidProgress));
        goal.log_progress(3).expect("progress");
        assert!(matches!(
            goal.log_progress(1),
            Err(GoalError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn test_event_payload_round_trip() {
        let mut goal = WellnessGoal::create("user-7", "Stretch", 3);
        let event = goal.take_events().remove(0);

        let envelope = EventEnvelope::from_event(&event).expect("envelope");
        assert_eq!(envelope.aggregate_type, "wellness_goal");
        assert_eq!(envelope.metadata.user_id.as_deref(), Some("user-7"));
        assert_eq!(envelope.decode_payload::<GoalEvent>().expect("decode"), event);
    }

    #[tokio::test]
    async fn test_outbox_delivers_goal_events_to_handlers() {
        let audit = Arc::new(AuditLog::new());
        let notifier = Arc::new(CompletionNotifier::new());
        let registry = Arc::new(ConsumerRegistry::new());
        registry.register(audit.clone());
        registry.register(notifier.clone());

        let repository = Arc::new(InMemoryOutboxRepository::new());
        let mut goal = WellnessGoal::create("user-3", "Swim", 1);
        goal.log_progress(1).expect("progress");
        enqueue(repository.as_ref(), &goal.take_events())
            .await
            .expect("enqueue");

        let processor = OutboxProcessor::new(
            repository,
            Arc::new(InProcessPublisher::new(registry)),
            ProcessorConfig::default(),
        );
        let report = processor.process_batch().await.expect("batch");

        assert_eq!(report.published, 3);
        assert_eq!(audit.entries().len(), 3);
        assert_eq!(notifier.sent(), 1);
    }

    #[tokio::test]
    async fn test_audit_log_ignores_redelivery() {
        let audit = AuditLog::new();
        let mut goal = WellnessGoal::create("user-4", "Read", 5);
        let envelope =
            EventEnvelope::from_event(&goal.take_events().remove(0)).expect("envelope");

        audit.handle(&envelope).await.expect("handle");
        audit.handle(&envelope).await.expect("handle again");
        assert_eq!(audit.entries().len(), 1);
    }
}
