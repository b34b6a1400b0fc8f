//! In-memory outbox storage for fast, deterministic tests.
//!
//! [`InMemoryOutboxRepository`] implements the full repository contract, including
//! claims, against a clock you control. Failure injection switches let tests
//! exercise the processor's error paths.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use chrono::{DateTime, Utc};
use outbox_core::environment::{Clock, SystemClock, add_duration};
use outbox_core::message::{MessageId, NewOutboxMessage, OutboxMessage};
use outbox_core::repository::{OutboxRepository, RepositoryError};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Default)]
struct State {
    next_id: i64,
    messages: BTreeMap<MessageId, OutboxMessage>,
    failing_marks: HashSet<MessageId>,
}

impl State {
    fn insert(&mut self, message: NewOutboxMessage) -> MessageId {
        self.next_id += 1;
        let id = MessageId::new(self.next_id);
        self.messages.insert(id, message.into_stored(id));
        id
    }

    fn oldest_first<'a>(
        &'a self,
        mut keep: impl FnMut(&OutboxMessage) -> bool + 'a,
    ) -> Vec<&'a OutboxMessage> {
        let mut matching: Vec<&OutboxMessage> =
            self.messages.values().filter(|m| keep(m)).collect();
        matching.sort_by_key(|m| (m.created_at, m.id));
        matching
    }

    fn message_mut(&mut self, id: MessageId) -> Result<&mut OutboxMessage, RepositoryError> {
        if self.failing_marks.contains(&id) {
            return Err(RepositoryError::Database(format!(
                "injected failure marking message {id}"
            )));
        }
        self.messages
            .get_mut(&id)
            .ok_or(RepositoryError::NotFound(id))
    }
}

/// In-memory [`OutboxRepository`].
///
/// Clones share the same storage.
///
/// # Example
///
/// ```
/// use outbox_testing::{InMemoryOutboxRepository, message_for};
/// use outbox_core::repository::OutboxRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let repository = InMemoryOutboxRepository::new();
/// let id = repository.save(message_for("goal.created")).await?;
///
/// let due = repository.get_unpublished(10).await?;
/// assert_eq!(due[0].id, id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryOutboxRepository {
    state: Arc<RwLock<State>>,
    clock: Arc<dyn Clock>,
    fail_fetches: Arc<AtomicBool>,
    fail_saves: Arc<AtomicBool>,
    claim_calls: Arc<AtomicUsize>,
}

impl Default for InMemoryOutboxRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryOutboxRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryOutboxRepository")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryOutboxRepository {
    /// Create an empty repository on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty repository on the given clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            clock,
            fail_fetches: Arc::new(AtomicBool::new(false)),
            fail_saves: Arc::new(AtomicBool::new(false)),
            claim_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every stored message, by identifier.
    #[must_use]
    pub fn all(&self) -> Vec<OutboxMessage> {
        self.state.read().unwrap().messages.values().cloned().collect()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().messages.len()
    }

    /// Whether the repository is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a stored message wholesale (for arranging odd states).
    pub fn put(&self, message: OutboxMessage) {
        let mut state = self.state.write().unwrap();
        state.next_id = state.next_id.max(message.id.value());
        state.messages.insert(message.id, message);
    }

    /// Make `get_unpublished` and `claim_due` fail.
    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Make `save` and `save_batch` fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Make every mark operation on `id` fail.
    pub fn fail_marks_for(&self, id: MessageId) {
        self.state.write().unwrap().failing_marks.insert(id);
    }

    /// How many times `claim_due` has been called.
    #[must_use]
    pub fn claim_calls(&self) -> usize {
        self.claim_calls.load(Ordering::SeqCst)
    }

    fn check_fetch(&self) -> Result<(), RepositoryError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            Err(RepositoryError::Unavailable("injected fetch failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn check_save(&self) -> Result<(), RepositoryError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            Err(RepositoryError::Database("injected save failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl OutboxRepository for InMemoryOutboxRepository {
    fn save(
        &self,
        message: NewOutboxMessage,
    ) -> Pin<Box<dyn Future<Output = Result<MessageId, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            self.check_save()?;
            let message = message.created_at(self.clock.now());
            Ok(self.state.write().unwrap().insert(message))
        })
    }

    fn save_batch(
        &self,
        messages: Vec<NewOutboxMessage>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageId>, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            self.check_save()?;
            let now = self.clock.now();
            let mut state = self.state.write().unwrap();
            Ok(messages
                .into_iter()
                .map(|message| state.insert(message.created_at(now)))
                .collect())
        })
    }

    fn get(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move { Ok(self.state.read().unwrap().messages.get(&id).cloned()) })
    }

    fn get_unpublished(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            self.check_fetch()?;
            let now = self.clock.now();
            let state = self.state.read().unwrap();
            Ok(state
                .oldest_first(|m| m.is_due(now))
                .into_iter()
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn claim_due(
        &self,
        limit: usize,
        lease: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            self.claim_calls.fetch_add(1, Ordering::SeqCst);
            self.check_fetch()?;

            let now = self.clock.now();
            let claimed_until = add_duration(now, lease);
            let mut state = self.state.write().unwrap();

            let ids: Vec<MessageId> = state
                .oldest_first(|m| m.is_due(now) && !m.is_claimed(now))
                .into_iter()
                .take(limit)
                .map(|m| m.id)
                .collect();

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(message) = state.messages.get_mut(&id) {
                    message.claimed_until = Some(claimed_until);
                    claimed.push(message.clone());
                }
            }
            Ok(claimed)
        })
    }

    fn mark_published(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now();
            self.state.write().unwrap().message_mut(id)?.apply_published(now);
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: MessageId,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        let error = error.to_string();
        Box::pin(async move {
            self.state
                .write()
                .unwrap()
                .message_mut(id)?
                .apply_failed(&error, next_retry_at);
            Ok(())
        })
    }

    fn mark_dead(
        &self,
        id: MessageId,
        reason: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        let reason = reason.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            self.state
                .write()
                .unwrap()
                .message_mut(id)?
                .apply_dead(&reason, now);
            Ok(())
        })
    }

    fn release_claim(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(message) = self.state.write().unwrap().messages.get_mut(&id) {
                message.claimed_until = None;
            }
            Ok(())
        })
    }

    fn get_failed(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            Ok(state
                .oldest_first(|m| {
                    !m.is_published()
                        && !m.is_dead()
                        && m.retry_count > 0
                        && m.retry_count < max_retries
                })
                .into_iter()
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn get_dead(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxMessage>, RepositoryError>> + Send + '_>>
    {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            Ok(state
                .oldest_first(OutboxMessage::is_dead)
                .into_iter()
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn replay_dead(
        &self,
        id: MessageId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            Ok(state
                .messages
                .get_mut(&id)
                .is_some_and(OutboxMessage::apply_replay))
        })
    }

    fn delete_old(
        &self,
        older_than_days: u32,
    ) -> Pin<Box<dyn Future<Output = Result<u64, RepositoryError>> + Send + '_>> {
        Box::pin(async move {
            let cutoff = self.clock.now() - chrono::Duration::days(i64::from(older_than_days));
            let mut state = self.state.write().unwrap();
            let before = state.messages.len();
            state
                .messages
                .retain(|_, m| !m.published_at.is_some_and(|at| at < cutoff));
            Ok((before - state.messages.len()) as u64)
        })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mocks::MockClock;
    use crate::properties::retry_offset_secs;
    use crate::{message_for, test_clock};
    use outbox_core::message::MessageState;
    use outbox_core::repository::enqueue;
    use proptest::prelude::*;

    fn clocked() -> (Arc<MockClock>, InMemoryOutboxRepository) {
        let clock = Arc::new(MockClock::new(test_clock().now()));
        let repository = InMemoryOutboxRepository::with_clock(clock.clone());
        (clock, repository)
    }

    #[tokio::test]
    async fn test_unpublished_ordered_oldest_first() {
        let (clock, repository) = clocked();
        let first = repository.save(message_for("a")).await.expect("save");
        clock.advance(Duration::from_secs(1));
        let second = repository.save(message_for("b")).await.expect("save");

        let due = repository.get_unpublished(10).await.expect("fetch");
        let ids: Vec<MessageId> = due.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![first, second]);

        let limited = repository.get_unpublished(1).await.expect("fetch");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, first);
    }

    #[tokio::test]
    async fn test_due_query_excludes_future_published_and_dead() {
        let (clock, repository) = clocked();
        let future = repository.save(message_for("future")).await.expect("save");
        let published = repository.save(message_for("published")).await.expect("save");
        let dead = repository.save(message_for("dead")).await.expect("save");
        let due = repository.save(message_for("due")).await.expect("save");

        let later = clock.now() + chrono::Duration::seconds(30);
        repository.mark_failed(future, "boom", later).await.expect("fail");
        repository.mark_published(published).await.expect("publish");
        repository.mark_dead(dead, "exhausted").await.expect("dead");

        let fetched = repository.get_unpublished(10).await.expect("fetch");
        let ids: Vec<MessageId> = fetched.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![due]);

        clock.advance(Duration::from_secs(30));
        let fetched = repository.get_unpublished(10).await.expect("fetch");
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_hides_messages_until_lease_expires() {
        let (clock, repository) = clocked();
        repository.save(message_for("a")).await.expect("save");
        repository.save(message_for("b")).await.expect("save");

        let lease = Duration::from_secs(60);
        let first = repository.claim_due(1, lease).await.expect("claim");
        let second = repository.claim_due(10, lease).await.expect("claim");
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].id, second[0].id);
        assert!(repository.claim_due(10, lease).await.expect("claim").is_empty());

        // Plain reads ignore claims.
        assert_eq!(repository.get_unpublished(10).await.expect("fetch").len(), 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(repository.claim_due(10, lease).await.expect("claim").len(), 2);
    }

    #[tokio::test]
    async fn test_mark_failed_releases_claim() {
        let (clock, repository) = clocked();
        let id = repository.save(message_for("a")).await.expect("save");
        repository
            .claim_due(10, Duration::from_secs(300))
            .await
            .expect("claim");

        repository
            .mark_failed(id, "boom", clock.now())
            .await
            .expect("fail");

        let reclaimed = repository
            .claim_due(10, Duration::from_secs(300))
            .await
            .expect("claim");
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_release_claim_makes_message_claimable_again() {
        let (_clock, repository) = clocked();
        let id = repository.save(message_for("a")).await.expect("save");
        let lease = Duration::from_secs(300);
        repository.claim_due(10, lease).await.expect("claim");
        assert!(repository.claim_due(10, lease).await.expect("claim").is_empty());

        repository.release_claim(id).await.expect("release");
        let reclaimed = repository.claim_due(10, lease).await.expect("claim");
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry_count, 0);

        repository
            .release_claim(MessageId::new(999))
            .await
            .expect("unknown ids are ignored");
    }

    #[tokio::test]
    async fn test_save_batch_is_all_or_nothing() {
        let repository = InMemoryOutboxRepository::new();
        repository.fail_saves(true);

        let result = repository
            .save_batch(vec![message_for("a"), message_for("b")])
            .await;
        assert!(result.is_err());
        assert!(repository.is_empty());

        repository.fail_saves(false);
        let ids = repository
            .save_batch(vec![message_for("a"), message_for("b")])
            .await
            .expect("save batch");
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
    }

    #[tokio::test]
    async fn test_enqueue_wraps_events() {
        let repository = InMemoryOutboxRepository::new();
        let events = vec![
            crate::TestEvent::new("goal.created"),
            crate::TestEvent::new("goal.completed"),
        ];

        let ids = enqueue(&repository, &events).await.expect("enqueue");
        assert_eq!(ids.len(), 2);

        let stored = repository.get(ids[0]).await.expect("get").expect("exists");
        let envelope = stored.to_envelope().expect("envelope");
        let decoded: crate::TestEvent = envelope.decode_payload().expect("payload");
        assert_eq!(decoded, events[0]);

        assert!(enqueue::<_, crate::TestEvent>(&repository, &[]).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn test_mark_unknown_message_is_not_found() {
        let repository = InMemoryOutboxRepository::new();
        let missing = MessageId::new(404);

        assert!(matches!(
            repository.mark_published(missing).await,
            Err(RepositoryError::NotFound(id)) if id == missing
        ));
        assert!(matches!(
            repository.mark_dead(missing, "x").await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_and_dead_diagnostics() {
        let (clock, repository) = clocked();
        let retryable = repository.save(message_for("a")).await.expect("save");
        let exhausted = repository.save(message_for("b")).await.expect("save");
        repository.save(message_for("c")).await.expect("save");

        repository.mark_failed(retryable, "boom", clock.now()).await.expect("fail");
        for _ in 0..3 {
            repository.mark_failed(exhausted, "boom", clock.now()).await.expect("fail");
        }
        repository.mark_dead(exhausted, "boom").await.expect("dead");

        let failed = repository.get_failed(3, 10).await.expect("failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, retryable);

        let dead = repository.get_dead(10).await.expect("dead");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("boom"));

        assert!(repository.replay_dead(exhausted).await.expect("replay"));
        assert!(!repository.replay_dead(exhausted).await.expect("replay again"));
        let replayed = repository.get(exhausted).await.expect("get").expect("exists");
        assert_eq!(replayed.state(), MessageState::Unpublished);
    }

    #[tokio::test]
    async fn test_delete_old_only_removes_published() {
        let (clock, repository) = clocked();
        let old_published = repository.save(message_for("a")).await.expect("save");
        repository.save(message_for("b")).await.expect("save");
        let late = repository.save(message_for("late")).await.expect("save");
        repository.mark_published(old_published).await.expect("publish");

        clock.advance(Duration::from_secs(8 * 24 * 3600));
        let recent = repository.save(message_for("c")).await.expect("save");
        repository.mark_published(recent).await.expect("publish");
        // Created with the old ones, but delivered only now
        repository.mark_published(late).await.expect("publish");

        assert_eq!(repository.delete_old(7).await.expect("delete"), 1);
        assert_eq!(repository.len(), 3);
        assert!(repository.get(old_published).await.expect("get").is_none());
        assert!(repository.get(late).await.expect("get").is_some());
    }

    proptest! {
        #[test]
        fn prop_due_query_never_returns_undue(
            offsets in prop::collection::vec((retry_offset_secs(), any::<bool>(), any::<bool>()), 0..20)
        ) {
            let (clock, repository) = clocked();
            let now = clock.now();
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");

            runtime.block_on(async {
                for (offset, published, dead) in &offsets {
                    let id = repository.save(message_for("prop.case")).await.expect("save");
                    let mut message = repository.get(id).await.expect("get").expect("exists");
                    message.next_retry_at = offset.map(|s| now + chrono::Duration::seconds(s));
                    if *published {
                        message.published_at = Some(now);
                    } else if *dead {
                        message.dead_lettered_at = Some(now);
                    }
                    repository.put(message);
                }

                let due = repository.get_unpublished(100).await.expect("fetch");
                for message in &due {
                    prop_assert!(message.published_at.is_none());
                    prop_assert!(message.dead_lettered_at.is_none());
                    prop_assert!(message.next_retry_at.is_none_or(|at| at <= now));
                }

                let expected = offsets
                    .iter()
                    .filter(|(offset, published, dead)| {
                        !published && !dead && offset.is_none_or(|s| s <= 0)
                    })
                    .count();
                prop_assert_eq!(due.len(), expected);
                Ok(())
            })?;
        }
    }
}
