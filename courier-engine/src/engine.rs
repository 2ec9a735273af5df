//! Turn-level entry point shared by every transport.
//!
//! [`Engine::handle_turn`] is the only way user input reaches a workflow. It
//! serializes turns per session, loads the session's workflow from the
//! store, advances it, and checkpoints it again before returning.

use crate::config::EngineConfig;
use crate::dispatch::CatalogGateway;
use crate::errors::Result;
use crate::intent::IntentDetector;
use crate::orchestrator::{Orchestrator, Resumption, Turn};
use crate::reply::{ReplyStatus, TurnReply};
use crate::routing::{DescriptorMap, RoutingEngine, RoutingStatus, index_descriptors};
use crate::rules::RuleBasedDetector;
use crate::safety::SafetyPolicy;
use crate::store::SessionStore;
use crate::types::{ConversationContext, SessionId};
use crate::workflow::{PendingRequest, Workflow};
use chrono::{DateTime, Utc};
use courier_catalog::{OperationCatalog, OperationDescriptor};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CANCEL_WORDS: &[&str] = &["cancel", "stop", "abort", "nevermind", "never mind", "forget it"];

const INTERNAL_FAILURE: &str =
    "Something went wrong on my side, so I stopped. No further changes were made.";

pub struct Engine {
    detector: Arc<dyn IntentDetector>,
    routing: RoutingEngine,
    orchestrator: Orchestrator,
    store: Arc<dyn SessionStore>,
    policy: SafetyPolicy,
    config: EngineConfig,
    descriptors: Arc<DescriptorMap>,
    catalog_name: String,
    turn_locks: DashMap<SessionId, Arc<Mutex<()>>>,
    in_flight: DashMap<SessionId, CancellationToken>,
}

impl Engine {
    /// Fetches the catalog's descriptors once and wires routing, safety and
    /// the default rule-based detector around them.
    pub async fn new(
        catalog: Arc<dyn OperationCatalog>,
        store: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Result<Self> {
        let gateway = CatalogGateway::new(catalog, &config);
        let described = gateway.describe().await?;
        let detector = RuleBasedDetector::with_operations(described.clone())?;
        let descriptors = Arc::new(index_descriptors(described));
        let policy = SafetyPolicy::standard(&config.safety);
        let routing = RoutingEngine::new(config.routing.clone(), descriptors.clone(), policy.clone());
        let catalog_name = gateway.catalog_name().to_string();
        let orchestrator = Orchestrator::new(
            gateway,
            descriptors.clone(),
            routing.clone(),
            policy.clone(),
            config.routing.entity_lookup_limit,
        );
        tracing::info!(
            catalog = %catalog_name,
            operations = descriptors.len(),
            detector = detector.name(),
            "engine ready"
        );
        Ok(Self {
            detector: Arc::new(detector),
            routing,
            orchestrator,
            store,
            policy,
            config,
            descriptors,
            catalog_name,
            turn_locks: DashMap::new(),
            in_flight: DashMap::new(),
        })
    }

    pub fn with_detector(mut self, detector: Arc<dyn IntentDetector>) -> Self {
        tracing::info!(detector = detector.name(), "intent detector replaced");
        self.detector = detector;
        self
    }

    pub fn catalog_name(&self) -> &str {
        &self.catalog_name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Catalog operations sorted by name.
    pub fn descriptors(&self) -> Vec<OperationDescriptor> {
        let mut out: Vec<OperationDescriptor> = self.descriptors.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn handle_turn(
        &self,
        session: &SessionId,
        utterance: &str,
        context: &ConversationContext,
    ) -> TurnReply {
        self.handle_turn_at(session, utterance, context, Utc::now())
            .await
    }

    /// Like [`Engine::handle_turn`] with an explicit wall-clock time, which
    /// governs confirmation expiry.
    #[tracing::instrument(level = "info", skip(self, utterance, context), fields(session_id = %session))]
    pub async fn handle_turn_at(
        &self,
        session: &SessionId,
        utterance: &str,
        context: &ConversationContext,
        now: DateTime<Utc>,
    ) -> TurnReply {
        let lock = self.turn_locks.entry(session.clone()).or_default().clone();
        let _turn = lock.lock().await;

        let cancel = CancellationToken::new();
        self.in_flight.insert(session.clone(), cancel.clone());
        let turn = Turn {
            now,
            cancel: &cancel,
        };
        let result = self.process(session, utterance, context, &turn).await;
        self.in_flight.remove(session);

        match result {
            Ok(reply) => {
                tracing::info!(
                    status = reply.status.as_str(),
                    affected = reply.affected_count,
                    "turn handled"
                );
                reply
            }
            Err(err) => {
                tracing::error!(error = %err, "turn failed");
                if let Err(remove_err) = self.store.remove(session).await {
                    tracing::warn!(error = %remove_err, "failed to clear workflow after error");
                }
                TurnReply::new(ReplyStatus::Failed, INTERNAL_FAILURE)
                    .with_next_step("Try the request again. If it keeps failing, run courier doctor.")
            }
        }
    }

    /// Stops an in-flight bulk execution for `session` before its next chunk.
    /// Returns false when no turn is running.
    pub fn cancel(&self, session: &SessionId) -> bool {
        match self.in_flight.get(session) {
            Some(token) => {
                tracing::info!(session_id = %session, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn workflow(&self, session: &SessionId) -> Result<Option<Workflow>> {
        Ok(self.store.load(session).await?)
    }

    /// Drops whatever the session was doing without touching the catalog.
    pub async fn reset(&self, session: &SessionId) -> Result<()> {
        self.store.remove(session).await?;
        tracing::info!(session_id = %session, "session reset");
        Ok(())
    }

    /// Purges workflows idle longer than the retention window.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.config.sessions.retention();
        let purged = self.store.purge_stale(cutoff).await?;
        self.turn_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "stale workflows purged");
        }
        Ok(purged)
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let every = self.config.sessions.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("session sweeper received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = engine.sweep_once(Utc::now()).await {
                            tracing::warn!(error = %err, "session sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn process(
        &self,
        session: &SessionId,
        utterance: &str,
        context: &ConversationContext,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let cancelling = is_cancel(utterance);
        if let Some(mut wf) = self.store.load(session).await? {
            if wf.state.is_suspended() {
                let max_turns = self.policy.max_turns();
                let reply = if cancelling {
                    self.orchestrator.cancel(&mut wf, turn)?
                } else if wf
                    .pending
                    .as_ref()
                    .is_none_or(|pending| pending.is_expired(turn.now, max_turns))
                {
                    tracing::info!(workflow_id = %wf.id, "pending request expired");
                    self.orchestrator.expire(&mut wf, turn)?
                } else {
                    if let Some(pending) = wf.pending.as_mut() {
                        pending.record_turn();
                    }
                    let standalone = match &wf.pending {
                        Some(PendingRequest::Clarification(request))
                            if request.kind.is_choice() =>
                        {
                            self.routes_on_its_own(utterance, context).await?
                        }
                        _ => false,
                    };
                    match self
                        .orchestrator
                        .resume(&mut wf, utterance, standalone, turn)
                        .await?
                    {
                        Resumption::Replied(reply) => reply,
                        Resumption::Fresh => {
                            self.store.remove(session).await?;
                            return self.start(session, utterance, context, turn).await;
                        }
                    }
                };
                self.checkpoint(session, &wf).await?;
                return Ok(reply.for_workflow(&wf.id, wf.state));
            }
            tracing::warn!(
                workflow_id = %wf.id,
                state = %wf.state,
                "discarding workflow that was not waiting on the user"
            );
            self.store.remove(session).await?;
        }

        if cancelling {
            return Ok(TurnReply::completed("There's nothing to cancel."));
        }
        self.start(session, utterance, context, turn).await
    }

    /// Whether `utterance` would start an action by itself, with no question.
    async fn routes_on_its_own(
        &self,
        utterance: &str,
        context: &ConversationContext,
    ) -> Result<bool> {
        let intents = self.detector.detect(utterance, context).await?;
        let decision = self.routing.route(intents);
        Ok(matches!(
            decision.status,
            RoutingStatus::Direct | RoutingStatus::NeedsConfirmation
        ))
    }

    async fn start(
        &self,
        session: &SessionId,
        utterance: &str,
        context: &ConversationContext,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let intents = self.detector.detect(utterance, context).await?;
        let decision = self.routing.route(intents);
        let mut wf = Workflow::new(session.clone(), utterance, turn.now);
        tracing::info!(
            workflow_id = %wf.id,
            status = ?decision.status,
            operation = decision.selected_operation().unwrap_or("-"),
            "workflow started"
        );
        let reply = self.orchestrator.start(&mut wf, decision, turn).await?;
        self.checkpoint(session, &wf).await?;
        Ok(reply.for_workflow(&wf.id, wf.state))
    }

    async fn checkpoint(&self, session: &SessionId, wf: &Workflow) -> Result<()> {
        if wf.state.is_terminal() {
            tracing::debug!(workflow_id = %wf.id, state = %wf.state, outcome = ?wf.outcome, "workflow finished");
            self.store.remove(session).await?;
        } else {
            self.store.save(session, wf).await?;
        }
        Ok(())
    }
}

fn is_cancel(utterance: &str) -> bool {
    let normalized = utterance
        .trim()
        .trim_end_matches(['.', '!'])
        .to_ascii_lowercase();
    CANCEL_WORDS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteSessionStore;
    use crate::store::{InMemorySessionStore, StoreError};
    use crate::workflow::WorkflowState;
    use async_trait::async_trait;
    use courier_catalog::{
        CallMethod, CatalogError, EntityKind, EntityMatch, MailMessage, MailboxCatalog, Parameters,
        operations,
    };
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    async fn engine_for(mailbox: &Arc<MailboxCatalog>) -> Engine {
        Engine::new(
            mailbox.clone(),
            Arc::new(InMemorySessionStore::new()),
            EngineConfig::default(),
        )
        .await
        .expect("engine")
    }

    fn demo() -> Arc<MailboxCatalog> {
        Arc::new(MailboxCatalog::demo())
    }

    fn focused(id: &str) -> ConversationContext {
        ConversationContext::default().with_item(id)
    }

    fn none() -> ConversationContext {
        ConversationContext::default()
    }

    fn in_inbox(mailbox: &MailboxCatalog, id: &str) -> bool {
        mailbox
            .message(id)
            .is_some_and(|m| m.labels.contains("INBOX"))
    }

    #[tokio::test]
    async fn permanent_delete_requires_the_exact_phrase() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("a");

        let reply = engine
            .handle_turn(&s, "permanently delete this email", &focused("m-101"))
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert!(reply.message.contains("irreversible"));
        assert!(reply.prompt.as_deref().is_some_and(|p| p.contains("DELETE FOREVER")));

        let reply = engine.handle_turn(&s, "yes", &none()).await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert!(mailbox.mutating_calls().is_empty());

        let reply = engine.handle_turn(&s, "DELETE FOREVER", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.workflow_state, Some(WorkflowState::Done));
        assert!(mailbox.message("m-101").is_none());
        assert!(engine.workflow(&s).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn second_failed_phrase_aborts() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("a2");
        engine
            .handle_turn(&s, "permanently delete this email", &focused("m-101"))
            .await;
        engine.handle_turn(&s, "yes", &none()).await;
        let reply = engine.handle_turn(&s, "delete forever", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert!(mailbox.message("m-101").is_some());
        assert!(mailbox.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn single_trash_runs_without_confirmation() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let reply = engine
            .handle_turn(&SessionId::new("b"), "delete this email", &focused("m-101"))
            .await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(1));
        let message = mailbox.message("m-101").expect("still recoverable");
        assert!(message.labels.contains("TRASH"));
    }

    #[tokio::test]
    async fn bulk_archive_counts_confirms_and_chunks() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("c");

        let reply = engine
            .handle_turn(&s, "archive all emails from deals@newsletter.example", &none())
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert_eq!(reply.affected_count, Some(34));
        assert!(reply.message.contains("34 items"));
        assert!(mailbox.mutating_calls().is_empty());

        let reply = engine.handle_turn(&s, "yes", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(34));
        assert!(reply.message.contains("34 messages"));

        let batches: Vec<usize> = mailbox.mutating_calls().iter().map(|c| c.items).collect();
        assert_eq!(batches, vec![25, 9]);
        assert!(!in_inbox(&mailbox, "news-01"));
        assert!(!in_inbox(&mailbox, "news-34"));
        assert!(in_inbox(&mailbox, "m-101"));
    }

    #[tokio::test]
    async fn declined_bulk_confirmation_changes_nothing() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("c2");
        engine
            .handle_turn(&s, "archive all emails from deals@newsletter.example", &none())
            .await;
        let reply = engine.handle_turn(&s, "no", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert!(mailbox.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_contact_is_resolved_by_choice() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("d");

        let reply = engine
            .handle_turn(&s, "archive all emails from John", &none())
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsClarification);
        let prompt = reply.prompt.expect("options listed");
        assert!(prompt.contains("1. John Baker <john.baker@initech.example>"));
        assert!(prompt.contains("2. John Doe <john.doe@globex.example>"));
        assert!(prompt.contains("3. John Smith <john.smith@acme.example>"));
        assert!(mailbox.mutating_calls().is_empty());

        let reply = engine.handle_turn(&s, "2", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(1));
        assert!(!in_inbox(&mailbox, "m-102"));
        assert!(in_inbox(&mailbox, "m-101"));
        assert!(in_inbox(&mailbox, "m-103"));
        assert_eq!(mailbox.mutating_calls().len(), 1);
    }

    #[tokio::test]
    async fn unanswerable_contact_choice_reprompts_once_then_aborts() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("d2");
        engine
            .handle_turn(&s, "archive all emails from John", &none())
            .await;
        let reply = engine.handle_turn(&s, "hmm", &none()).await;
        assert_eq!(reply.status, ReplyStatus::NeedsClarification);
        let reply = engine.handle_turn(&s, "hmm", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert!(mailbox.mutating_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_trash_waits_and_completes() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        mailbox.fail_next(
            CallMethod::Execute,
            Some(operations::TRASH_MESSAGE),
            CatalogError::rate_limited(Duration::from_secs(5)),
        );
        let started = Instant::now();
        let reply = engine
            .handle_turn(&SessionId::new("e"), "delete this email", &focused("m-101"))
            .await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(mailbox
            .message("m-101")
            .is_some_and(|m| m.labels.contains("TRASH")));
    }

    #[tokio::test]
    async fn empty_bulk_target_aborts_before_any_mutation() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let reply = engine
            .handle_turn(
                &SessionId::new("f"),
                "archive all emails from nobody@example.com",
                &none(),
            )
            .await;
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert_eq!(reply.affected_count, Some(0));
        assert!(mailbox.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn expired_confirmation_is_not_executed() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("g");
        let t0 = Utc::now();
        engine
            .handle_turn_at(
                &s,
                "archive all emails from deals@newsletter.example",
                &none(),
                t0,
            )
            .await;
        let reply = engine
            .handle_turn_at(&s, "yes", &none(), t0 + chrono::Duration::seconds(61))
            .await;
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert!(reply.message.contains("expired"));
        assert!(mailbox.mutating_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_bulk_execution_between_chunks() {
        let messages = (1..=60).map(|n| {
            MailMessage::new(
                &format!("b-{n:02}"),
                &format!("t-b-{n:02}"),
                "Bulk Sender",
                "bulk@example.com",
                &format!("Offer {n}"),
            )
        });
        let mailbox = Arc::new(MailboxCatalog::new().with_messages(messages));
        let engine = Arc::new(engine_for(&mailbox).await);
        let s = SessionId::new("h");

        let reply = engine
            .handle_turn(&s, "archive all emails from bulk@example.com", &none())
            .await;
        assert_eq!(reply.affected_count, Some(60));

        // The second chunk is throttled once, which leaves a window to cancel.
        mailbox.fail_later(
            CallMethod::ExecuteBatch,
            Some(operations::ARCHIVE_MESSAGE),
            1,
            CatalogError::rate_limited(Duration::from_secs(5)),
        );
        let task = {
            let engine = engine.clone();
            let s = s.clone();
            tokio::spawn(async move { engine.handle_turn(&s, "yes", &none()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(engine.cancel(&s));

        let reply = task.await.expect("turn task");
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert_eq!(reply.affected_count, Some(50));
        let left = (1..=60)
            .filter(|n| in_inbox(&mailbox, &format!("b-{n:02}")))
            .count();
        assert_eq!(left, 10);
        assert!(!engine.cancel(&s));
    }

    #[tokio::test]
    async fn unanswered_destructive_choice_defaults_to_trash() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("i");
        let reply = engine
            .handle_turn(&s, "remove this email", &focused("m-101"))
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsClarification);
        assert!(reply.prompt.as_deref().is_some_and(|p| p.contains("cannot be undone")));

        let reply = engine.handle_turn(&s, "whatever you think", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        let message = mailbox.message("m-101").expect("not deleted forever");
        assert!(message.labels.contains("TRASH"));
    }

    #[tokio::test]
    async fn draft_can_be_revised_then_sent() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("j");

        let reply = engine
            .handle_turn(
                &s,
                "draft an email to bob@example.com about lunch saying see you at noon",
                &none(),
            )
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert!(reply.message.contains("Subject: lunch"));
        assert_eq!(mailbox.drafts().len(), 1);

        let reply = engine
            .handle_turn(&s, "revise subject: Team lunch", &none())
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert!(reply.message.contains("Subject: Team lunch"));
        assert!(mailbox.sent().is_empty());

        let reply = engine.handle_turn(&s, "SEND", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        let sent = mailbox.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Team lunch");
        assert_eq!(sent[0].to, "bob@example.com");
    }

    #[tokio::test]
    async fn cancelled_draft_stays_in_drafts() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("k");
        engine
            .handle_turn(
                &s,
                "draft an email to bob@example.com about lunch saying see you at noon",
                &none(),
            )
            .await;
        let reply = engine.handle_turn(&s, "cancel", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Aborted);
        assert!(reply.message.contains("Drafts"));
        assert_eq!(mailbox.drafts().len(), 1);
        assert!(mailbox.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_address_gets_one_suggestion() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("l");
        let reply = engine
            .handle_turn(
                &s,
                "send now an email to bob@example about delay saying running late",
                &none(),
            )
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsClarification);
        assert!(reply.prompt.as_deref().is_some_and(|p| p.contains("bob@example.com")));

        let reply = engine.handle_turn(&s, "yes", &none()).await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert!(mailbox.sent().is_empty());

        let reply = engine.handle_turn(&s, "SEND", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(mailbox.sent()[0].to, "bob@example.com");
    }

    #[tokio::test]
    async fn missing_reference_is_asked_for() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("m");
        let reply = engine.handle_turn(&s, "archive this email", &none()).await;
        assert_eq!(reply.status, ReplyStatus::NeedsClarification);
        assert!(mailbox.mutating_calls().is_empty());

        let reply = engine.handle_turn(&s, "m-101", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert!(!in_inbox(&mailbox, "m-101"));
        assert_eq!(reply.referenced_items[0].id, "m-101");
    }

    #[tokio::test]
    async fn no_match_offers_categories_and_yields_to_new_requests() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("n");

        let reply = engine.handle_turn(&s, "what's the weather", &none()).await;
        assert_eq!(reply.status, ReplyStatus::NoMatch);
        assert!(reply.prompt.as_deref().is_some_and(|p| p.contains("Delete mail")));

        let reply = engine.handle_turn(&s, "2", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert!(reply.message.contains("archive all emails"));

        engine.handle_turn(&s, "what's the weather", &none()).await;
        let reply = engine
            .handle_turn(&s, "archive all emails from deals@newsletter.example", &none())
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert_eq!(reply.affected_count, Some(34));
    }

    #[tokio::test]
    async fn cancel_with_nothing_pending_is_harmless() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let reply = engine
            .handle_turn(&SessionId::new("o"), "cancel", &none())
            .await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert!(reply.message.contains("nothing to cancel"));
    }

    #[tokio::test]
    async fn suspended_workflow_survives_engine_restart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions.db");
        let mailbox = demo();
        let s = SessionId::new("p");

        let first = Engine::new(
            mailbox.clone(),
            Arc::new(SqliteSessionStore::open(&path).expect("open")),
            EngineConfig::default(),
        )
        .await
        .expect("engine");
        first
            .handle_turn(&s, "archive all emails from deals@newsletter.example", &none())
            .await;
        drop(first);

        let second = Engine::new(
            mailbox.clone(),
            Arc::new(SqliteSessionStore::open(&path).expect("reopen")),
            EngineConfig::default(),
        )
        .await
        .expect("engine");
        let reply = second.handle_turn(&s, "yes", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(34));
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn load(&self, _session: &SessionId) -> std::result::Result<Option<Workflow>, StoreError> {
            Err(StoreError::Poisoned)
        }

        async fn save(&self, _session: &SessionId, _workflow: &Workflow) -> std::result::Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }

        async fn remove(&self, _session: &SessionId) -> std::result::Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }

        async fn purge_stale(&self, _cutoff: DateTime<Utc>) -> std::result::Result<usize, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    async fn store_failure_yields_generic_reply() {
        let mailbox = demo();
        let engine = Engine::new(mailbox.clone(), Arc::new(BrokenStore), EngineConfig::default())
            .await
            .expect("engine");
        let reply = engine
            .handle_turn(&SessionId::new("q"), "delete this email", &focused("m-101"))
            .await;
        assert_eq!(reply.status, ReplyStatus::Failed);
        assert_eq!(reply.message, INTERNAL_FAILURE);
        assert!(mailbox.mutating_calls().is_empty());
    }

    #[tokio::test]
    async fn sweep_purges_idle_workflows() {
        let store = Arc::new(InMemorySessionStore::new());
        let engine = Engine::new(demo(), store.clone(), EngineConfig::default())
            .await
            .expect("engine");
        let now = Utc::now();
        let stale = Workflow::new(SessionId::new("old"), "x", now - chrono::Duration::hours(48));
        store.save(&stale.session_id, &stale).await.expect("save");
        let fresh = Workflow::new(SessionId::new("new"), "y", now);
        store.save(&fresh.session_id, &fresh).await.expect("save");

        assert_eq!(engine.sweep_once(now).await.expect("sweep"), 1);
        assert_eq!(store.len(), 1);
    }

    fn thread_of(id: &str, size: usize) -> impl Iterator<Item = MailMessage> + '_ {
        (1..=size).map(move |n| {
            MailMessage::new(
                &format!("{id}-{n:02}"),
                id,
                "Team",
                "team@example.com",
                &format!("Re: planning {n}"),
            )
        })
    }

    #[tokio::test]
    async fn large_thread_waits_for_confirmation() {
        let mailbox = Arc::new(
            MailboxCatalog::new()
                .with_messages(thread_of("t-big", 15))
                .with_messages(thread_of("t-small", 2)),
        );
        let engine = engine_for(&mailbox).await;
        let big = ConversationContext::default().with_thread("t-big");

        let s = SessionId::new("r");
        let reply = engine.handle_turn(&s, "archive this thread", &big).await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert_eq!(reply.affected_count, Some(15));
        assert!(reply.message.contains("15"));
        assert!(mailbox.mutating_calls().is_empty());

        let reply = engine.handle_turn(&s, "yes", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(15));
        assert!(!in_inbox(&mailbox, "t-big-01"));
        assert!(!in_inbox(&mailbox, "t-big-15"));

        let s = SessionId::new("r2");
        let reply = engine.handle_turn(&s, "delete this thread", &big).await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        engine.handle_turn(&s, "no", &none()).await;
        assert!(
            mailbox
                .message("t-big-01")
                .is_some_and(|m| !m.labels.contains("TRASH"))
        );

        let small = ConversationContext::default().with_thread("t-small");
        let reply = engine
            .handle_turn(&SessionId::new("r3"), "archive this thread", &small)
            .await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(2));
    }

    #[tokio::test]
    async fn new_request_replaces_an_open_destructive_choice() {
        let mailbox = demo();
        let engine = engine_for(&mailbox).await;
        let s = SessionId::new("t");
        let reply = engine
            .handle_turn(&s, "remove this email", &focused("m-101"))
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsClarification);

        let reply = engine
            .handle_turn(&s, "archive all emails from deals@newsletter.example", &none())
            .await;
        assert_eq!(reply.status, ReplyStatus::NeedsConfirmation);
        assert_eq!(reply.affected_count, Some(34));
        let message = mailbox.message("m-101").expect("untouched");
        assert!(!message.labels.contains("TRASH"));
        assert!(message.labels.contains("INBOX"));
        assert!(mailbox.mutating_calls().is_empty());
    }

    /// Delegates to a mailbox; `execute` on one message parks until released.
    struct Gated {
        inner: Arc<MailboxCatalog>,
        parked_id: &'static str,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl OperationCatalog for Gated {
        fn name(&self) -> &str {
            "gated"
        }

        async fn describe(&self) -> courier_catalog::Result<Vec<OperationDescriptor>> {
            self.inner.describe().await
        }

        async fn count(&self, operation: &str, filter: &str) -> courier_catalog::Result<usize> {
            self.inner.count(operation, filter).await
        }

        async fn lookup(
            &self,
            kind: EntityKind,
            query: &str,
            limit: usize,
        ) -> courier_catalog::Result<Vec<EntityMatch>> {
            self.inner.lookup(kind, query, limit).await
        }

        async fn execute(
            &self,
            operation: &str,
            parameters: &Parameters,
        ) -> courier_catalog::Result<Value> {
            if parameters.get("message_id").and_then(Value::as_str) == Some(self.parked_id) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.execute(operation, parameters).await
        }

        async fn execute_batch(
            &self,
            operation: &str,
            parameter_list: &[Parameters],
        ) -> courier_catalog::Result<Vec<courier_catalog::Result<Value>>> {
            self.inner.execute_batch(operation, parameter_list).await
        }
    }

    #[tokio::test]
    async fn stalled_session_does_not_block_another() {
        let mailbox = demo();
        let gated = Arc::new(Gated {
            inner: mailbox.clone(),
            parked_id: "m-101",
            entered: Notify::new(),
            release: Notify::new(),
        });
        let engine = Arc::new(
            Engine::new(
                gated.clone(),
                Arc::new(InMemorySessionStore::new()),
                EngineConfig::default(),
            )
            .await
            .expect("engine"),
        );

        let stalled = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .handle_turn(&SessionId::new("u-a"), "delete this email", &focused("m-101"))
                    .await
            })
        };
        gated.entered.notified().await;

        let reply = tokio::time::timeout(
            Duration::from_secs(5),
            engine.handle_turn(&SessionId::new("u-b"), "delete this email", &focused("m-102")),
        )
        .await
        .expect("second session is not held up");
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert!(mailbox.message("m-102").is_some_and(|m| m.labels.contains("TRASH")));
        assert!(!stalled.is_finished());

        gated.release.notify_one();
        let reply = stalled.await.expect("stalled turn");
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert!(mailbox.message("m-101").is_some_and(|m| m.labels.contains("TRASH")));
    }

    /// Delegates to a mailbox but drops the last result of every batch.
    struct ShortBatches(Arc<MailboxCatalog>);

    #[async_trait]
    impl OperationCatalog for ShortBatches {
        fn name(&self) -> &str {
            "short-batches"
        }

        async fn describe(&self) -> courier_catalog::Result<Vec<OperationDescriptor>> {
            self.0.describe().await
        }

        async fn count(&self, operation: &str, filter: &str) -> courier_catalog::Result<usize> {
            self.0.count(operation, filter).await
        }

        async fn lookup(
            &self,
            kind: EntityKind,
            query: &str,
            limit: usize,
        ) -> courier_catalog::Result<Vec<EntityMatch>> {
            self.0.lookup(kind, query, limit).await
        }

        async fn execute(
            &self,
            operation: &str,
            parameters: &Parameters,
        ) -> courier_catalog::Result<Value> {
            self.0.execute(operation, parameters).await
        }

        async fn execute_batch(
            &self,
            operation: &str,
            parameter_list: &[Parameters],
        ) -> courier_catalog::Result<Vec<courier_catalog::Result<Value>>> {
            let mut results = self.0.execute_batch(operation, parameter_list).await?;
            results.pop();
            Ok(results)
        }
    }

    #[tokio::test]
    async fn unreported_batch_items_count_as_failed() {
        let engine = Engine::new(
            Arc::new(ShortBatches(demo())),
            Arc::new(InMemorySessionStore::new()),
            EngineConfig::default(),
        )
        .await
        .expect("engine");
        let s = SessionId::new("v");
        engine
            .handle_turn(&s, "archive all emails from deals@newsletter.example", &none())
            .await;
        let reply = engine.handle_turn(&s, "yes", &none()).await;
        assert_eq!(reply.status, ReplyStatus::Completed);
        assert_eq!(reply.affected_count, Some(32));
        assert!(reply.message.contains("32 of 34"));
        assert!(reply.message.contains("2 failed (transient_server_error"));
    }

    #[test]
    fn cancel_words_are_exact() {
        assert!(is_cancel("Cancel"));
        assert!(is_cancel("never mind."));
        assert!(!is_cancel("cancel my subscription emails"));
    }
}
