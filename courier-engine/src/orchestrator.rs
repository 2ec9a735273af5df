//! Drives one workflow from a routing decision to a terminal state, one turn
//! at a time.
//!
//! Each public entry point runs until the workflow either finishes or needs
//! the user again. Suspension is always a [`PendingRequest`] on the workflow;
//! nothing here blocks waiting for input.

use crate::dispatch::CatalogGateway;
use crate::errors::{EngineError, Failure, FailureKind, Result, classify};
use crate::intent::{AmbiguityKind, ContactRole, Intent, Target};
use crate::reply::{ReplyStatus, TurnReply};
use crate::routing::{DescriptorMap, RoutingDecision, RoutingEngine, RoutingStatus};
use crate::safety::{
    ConfirmationRequest, ConfirmationVerdict, SafetyDecision, SafetyPolicy, is_affirmative,
    is_negative,
};
use crate::workflow::{
    Action, ClarificationKind, ClarificationOption, ClarificationRequest, OptionChoice,
    PendingRequest, StepError, StepKind, Workflow, WorkflowState, WorkflowStep, WorkflowTemplate,
};
use chrono::{DateTime, Utc};
use courier_catalog::{
    CatalogError, EntityKind, EntityMatch, OperationCategory, OperationDescriptor, ParamKind, ParameterSchema,
    Parameters, SchemaViolation, operations, validate_email_address,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const LISTED_RESULTS: usize = 10;

/// Words too common in option labels to tell options apart.
const LABEL_STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "just", "please", "message", "email", "mail", "want",
    "mean", "them", "only",
];

const EMAIL_DOMAIN_TYPOS: &[(&str, &str)] = &[
    ("gmial.com", "gmail.com"),
    ("gmai.com", "gmail.com"),
    ("gamil.com", "gmail.com"),
    ("gmail.co", "gmail.com"),
    ("gmail.con", "gmail.com"),
    ("yaho.com", "yahoo.com"),
    ("yahooo.com", "yahoo.com"),
    ("hotmial.com", "hotmail.com"),
    ("hotmal.com", "hotmail.com"),
    ("outlok.com", "outlook.com"),
];

/// Per-turn inputs shared by every orchestrator entry point.
pub struct Turn<'a> {
    pub now: DateTime<Utc>,
    /// Tripped by [`crate::Engine::cancel`]; checked between batch chunks.
    pub cancel: &'a CancellationToken,
}

pub enum Resumption {
    Replied(TurnReply),
    /// The reply was not an answer to the pending question; treat it as a new request.
    Fresh,
}

pub struct Orchestrator {
    gateway: CatalogGateway,
    descriptors: Arc<DescriptorMap>,
    routing: RoutingEngine,
    policy: SafetyPolicy,
    entity_lookup_limit: usize,
}

impl Orchestrator {
    pub fn new(
        gateway: CatalogGateway,
        descriptors: Arc<DescriptorMap>,
        routing: RoutingEngine,
        policy: SafetyPolicy,
        entity_lookup_limit: usize,
    ) -> Self {
        Self {
            gateway,
            descriptors,
            routing,
            policy,
            entity_lookup_limit: entity_lookup_limit.max(1),
        }
    }

    fn descriptor(&self, operation: &str) -> Result<&OperationDescriptor> {
        self.descriptors.get(operation).ok_or_else(|| {
            EngineError::Invariant(format!("operation {operation} is not in the catalog"))
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(workflow_id = %wf.id, status = ?decision.status))]
    pub async fn start(
        &self,
        wf: &mut Workflow,
        decision: RoutingDecision,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        match decision.status {
            RoutingStatus::NoMatch => self.offer_categories(wf, turn),
            RoutingStatus::NeedsClarification => {
                self.ask_intent(wf, decision.options, decision.ambiguity, turn)
            }
            RoutingStatus::Direct | RoutingStatus::NeedsConfirmation => {
                let Some(intent) = decision.selected else {
                    return Err(EngineError::Invariant(
                        "routing selected no intent".to_string(),
                    ));
                };
                self.plan(wf, &intent, decision.bound_parameters)?;
                self.advance(wf, turn).await
            }
        }
    }

    /// Continues a suspended workflow with the user's reply. `standalone`
    /// says the reply routes to an action on its own; such a reply replaces
    /// an open choice instead of taking its default.
    #[tracing::instrument(level = "debug", skip_all, fields(workflow_id = %wf.id, state = %wf.state))]
    pub async fn resume(
        &self,
        wf: &mut Workflow,
        reply: &str,
        standalone: bool,
        turn: &Turn<'_>,
    ) -> Result<Resumption> {
        match wf.pending.clone() {
            Some(PendingRequest::Confirmation(request)) => self
                .resume_confirmation(wf, request, reply, turn)
                .await
                .map(Resumption::Replied),
            Some(PendingRequest::Clarification(request)) => {
                self.resume_clarification(wf, request, reply, standalone, turn)
                    .await
            }
            None => Err(EngineError::Invariant(format!(
                "workflow {} is {} without a pending request",
                wf.id, wf.state
            ))),
        }
    }

    pub fn cancel(&self, wf: &mut Workflow, turn: &Turn<'_>) -> Result<TurnReply> {
        let message = format!("Cancelled. {}", nothing_changed(wf));
        self.abort_with(wf, message, None, turn)
    }

    pub fn expire(&self, wf: &mut Workflow, turn: &Turn<'_>) -> Result<TurnReply> {
        let message = format!(
            "That request expired before you answered, so I cancelled it. {}",
            nothing_changed(wf)
        );
        self.abort_with(
            wf,
            message,
            Some("Ask again if you still want to do it."),
            turn,
        )
    }

    fn plan(&self, wf: &mut Workflow, intent: &Intent, parameters: Parameters) -> Result<()> {
        let operation = intent
            .primary_operation()
            .ok_or_else(|| EngineError::Invariant("intent without an operation".to_string()))?
            .to_string();
        if wf.template != WorkflowTemplate::DisambiguateAct {
            wf.template = if operation == operations::CREATE_DRAFT {
                WorkflowTemplate::DraftReviewExecute
            } else if intent.target.is_bulk() {
                WorkflowTemplate::SearchConfirmBulkAct
            } else {
                WorkflowTemplate::SingleAction
            };
        }
        wf.context.set("category", intent.category.as_str());
        wf.action = Some(Action {
            operation,
            parameters,
            target: intent.target.clone(),
            candidate_count: None,
        });
        Ok(())
    }

    /// Resolve entities, check parameters, count, gate, execute: stopping at
    /// the first step that needs the user.
    async fn advance(&self, wf: &mut Workflow, turn: &Turn<'_>) -> Result<TurnReply> {
        let operation = wf.action()?.operation.clone();
        let descriptor = self.descriptor(&operation)?.clone();

        if let Target::Contact {
            name,
            role,
            extra_filter,
        } = wf.action()?.target.clone()
        {
            let lookup_params = params_of(json!({ "query": name }));
            let matches = match self
                .gateway
                .lookup(EntityKind::Contact, &name, self.entity_lookup_limit)
                .await
            {
                Ok(matches) => {
                    wf.record_step(step_ok(
                        StepKind::Lookup,
                        "lookup_contact",
                        lookup_params,
                        json!({ "matches": matches.len() }),
                        turn.now,
                    ));
                    matches
                }
                Err(failure) => {
                    wf.record_step(step_err(
                        StepKind::Lookup,
                        "lookup_contact",
                        lookup_params,
                        &failure,
                        turn.now,
                    ));
                    return self.fail(wf, &failure, turn);
                }
            };
            match matches.as_slice() {
                [] => {
                    return self.abort_with(
                        wf,
                        format!("I couldn't find anyone matching \"{name}\". Nothing was changed."),
                        Some("Try again with their email address."),
                        turn,
                    );
                }
                [contact] => {
                    bind_contact(wf.action_mut()?, &descriptor, contact, role, &extra_filter);
                }
                _ => return self.ask_entity(wf, &name, role, matches, turn),
            }
        }

        let action = wf.action()?.clone();
        let bulk = action.target.is_bulk();
        match request_schema(&descriptor, bulk).validate(&action.parameters) {
            Ok(()) => {}
            Err(SchemaViolation::Missing { field }) => return self.ask_missing(wf, &field, turn),
            Err(SchemaViolation::Invalid { field, reason }) => {
                return self.ask_invalid(wf, &descriptor, &field, &reason, 0, turn);
            }
            Err(violation @ SchemaViolation::Unknown { .. }) => {
                return self.abort_with(
                    wf,
                    format!("{} can't be used that way ({violation}). Nothing was changed.", descriptor.name),
                    Some("Rephrase the request."),
                    turn,
                );
            }
        }

        let affected = match &action.target {
            Target::Filter { query } if bulk => {
                let count = match self.count_step(wf, &operation, query, turn).await? {
                    Ok(count) => count,
                    Err(reply) => return Ok(reply),
                };
                tracing::info!(workflow_id = %wf.id, operation = %operation, filter = %query, count, "bulk candidates counted");
                wf.action_mut()?.candidate_count = Some(count);
                if count == 0 {
                    let reply = self.abort_with(
                        wf,
                        format!("No messages match {query}, so nothing was changed."),
                        Some(FailureKind::EmptyResult.next_action()),
                        turn,
                    )?;
                    return Ok(reply.with_count(0));
                }
                count
            }
            _ if bulk => {
                return Err(EngineError::Invariant(
                    "bulk action without a resolved filter".to_string(),
                ));
            }
            // A thread acts on every message in it, so it is gated on their number.
            Target::Thread { id, .. } => {
                let filter = format!("thread:{id}");
                let count = match self.count_step(wf, &operation, &filter, turn).await? {
                    Ok(count) => count.max(1),
                    Err(reply) => return Ok(reply),
                };
                tracing::debug!(workflow_id = %wf.id, thread_id = %id, count, "thread size counted");
                wf.action_mut()?.candidate_count = Some(count);
                count
            }
            _ => {
                wf.action_mut()?.candidate_count = Some(1);
                1
            }
        };

        match self.policy.evaluate(&descriptor, affected) {
            SafetyDecision::Proceed => self.execute(wf, turn).await,
            SafetyDecision::Confirm { required_phrase } => {
                let request = self.policy.request(
                    &descriptor,
                    affected,
                    &scope_of(wf.action()?),
                    required_phrase,
                    turn.now,
                );
                let message = request.presented_summary.clone();
                let prompt = request.prompt();
                wf.suspend(PendingRequest::Confirmation(request), turn.now)?;
                Ok(TurnReply::new(ReplyStatus::NeedsConfirmation, message)
                    .with_prompt(prompt)
                    .with_count(affected))
            }
        }
    }

    /// Counts candidates and records the step. A failed count comes back as
    /// the reply to send.
    async fn count_step(
        &self,
        wf: &mut Workflow,
        operation: &str,
        filter: &str,
        turn: &Turn<'_>,
    ) -> Result<std::result::Result<usize, TurnReply>> {
        let count_params = params_of(json!({ "filter": filter }));
        match self.gateway.count(operation, filter).await {
            Ok(count) => {
                wf.record_step(step_ok(
                    StepKind::Count,
                    operation,
                    count_params,
                    json!({ "count": count }),
                    turn.now,
                ));
                Ok(Ok(count))
            }
            Err(failure) => {
                wf.record_step(step_err(
                    StepKind::Count,
                    operation,
                    count_params,
                    &failure,
                    turn.now,
                ));
                self.fail(wf, &failure, turn).map(Err)
            }
        }
    }

    async fn execute(&self, wf: &mut Workflow, turn: &Turn<'_>) -> Result<TurnReply> {
        wf.transition(WorkflowState::Executing, turn.now)?;
        let action = wf.action()?.clone();
        let descriptor = self.descriptor(&action.operation)?.clone();
        if action.target.is_bulk() {
            return self.execute_bulk(wf, &descriptor, &action, turn).await;
        }

        match self
            .gateway
            .execute(&action.operation, &action.parameters)
            .await
        {
            Ok(value) => {
                wf.record_step(step_ok(
                    StepKind::Execute,
                    &action.operation,
                    action.parameters.clone(),
                    value.clone(),
                    turn.now,
                ));
                if action.operation == operations::CREATE_DRAFT {
                    return self.present_draft(wf, &action, &value, turn);
                }
                wf.transition(WorkflowState::Done, turn.now)?;
                let reply = completion(&action, &value);
                wf.outcome = Some(reply.message.clone());
                Ok(reply)
            }
            Err(failure) => {
                wf.record_step(step_err(
                    StepKind::Execute,
                    &action.operation,
                    action.parameters.clone(),
                    &failure,
                    turn.now,
                ));
                self.fail(wf, &failure, turn)
            }
        }
    }

    /// Enumerates exactly the confirmed items and acts on them in chunks no
    /// larger than the operation's batch limit.
    async fn execute_bulk(
        &self,
        wf: &mut Workflow,
        descriptor: &OperationDescriptor,
        action: &Action,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let Target::Filter { query } = &action.target else {
            return Err(EngineError::Invariant(
                "bulk execution without a filter".to_string(),
            ));
        };
        let confirmed = action.candidate_count.ok_or_else(|| {
            EngineError::Invariant("bulk execution before counting".to_string())
        })?;

        let lookup_params = params_of(json!({ "query": query, "limit": confirmed }));
        let ids: Vec<String> = match self
            .gateway
            .lookup(EntityKind::Message, query, confirmed)
            .await
        {
            Ok(found) => {
                wf.record_step(step_ok(
                    StepKind::Lookup,
                    "lookup_message",
                    lookup_params,
                    json!({ "found": found.len() }),
                    turn.now,
                ));
                found.into_iter().take(confirmed).map(|m| m.id).collect()
            }
            Err(failure) => {
                wf.record_step(step_err(
                    StepKind::Lookup,
                    "lookup_message",
                    lookup_params,
                    &failure,
                    turn.now,
                ));
                return self.fail(wf, &failure, turn);
            }
        };

        let operation = action.operation.as_str();
        let chunk_size = descriptor.max_batch_size.max(1);
        let mut acted = 0usize;
        let mut failed: Vec<FailureKind> = Vec::new();

        for chunk in ids.chunks(chunk_size) {
            if turn.cancel.is_cancelled() {
                tracing::info!(
                    workflow_id = %wf.id,
                    acted,
                    confirmed,
                    "bulk execution cancelled between chunks"
                );
                let message = format!(
                    "Stopped. {} before you cancelled; the rest were left alone.",
                    acted_phrase(operation, &format!("{acted} of {confirmed} messages"))
                );
                wf.abort(&message, turn.now)?;
                return Ok(TurnReply::aborted(message).with_count(acted));
            }

            let parameter_list: Vec<Parameters> = chunk
                .iter()
                .map(|id| {
                    let mut params = action.parameters.clone();
                    params.insert("message_id".to_string(), Value::String(id.clone()));
                    params
                })
                .collect();
            let step_params = params_of(json!({ "message_ids": chunk }));

            match self.gateway.execute_batch(operation, &parameter_list).await {
                Ok(results) => {
                    let mut chunk_failures = Vec::new();
                    if results.len() != chunk.len() {
                        tracing::warn!(
                            workflow_id = %wf.id,
                            operation,
                            items = chunk.len(),
                            results = results.len(),
                            "catalog returned a result count that does not match the chunk"
                        );
                    }
                    let mut results = results.into_iter();
                    for id in chunk {
                        // Items the catalog did not report on count as failed.
                        let result = results.next().unwrap_or_else(|| {
                            Err(CatalogError::status(502, format!("no result reported for {id}")))
                        });
                        match result {
                            Ok(_) => acted += 1,
                            Err(err) => {
                                let kind = classify(&err);
                                chunk_failures.push(json!({ "id": id, "kind": kind.as_str() }));
                                failed.push(kind);
                            }
                        }
                    }
                    wf.record_step(step_ok(
                        StepKind::Batch,
                        operation,
                        step_params,
                        json!({
                            "succeeded": chunk.len() - chunk_failures.len(),
                            "failed": chunk_failures,
                        }),
                        turn.now,
                    ));
                }
                Err(failure) => {
                    wf.record_step(step_err(
                        StepKind::Batch,
                        operation,
                        step_params,
                        &failure,
                        turn.now,
                    ));
                    tracing::warn!(
                        workflow_id = %wf.id,
                        operation,
                        acted,
                        confirmed,
                        kind = %failure.kind,
                        "bulk execution stopped by failed chunk"
                    );
                    wf.transition(WorkflowState::Failed, turn.now)?;
                    let message = format!(
                        "{}, then stopped: {}",
                        acted_phrase(operation, &format!("{acted} of {confirmed} messages")),
                        failure.kind.user_message()
                    );
                    wf.outcome = Some(message.clone());
                    return Ok(TurnReply::new(ReplyStatus::Failed, message)
                        .with_count(acted)
                        .with_next_step(failure.kind.next_action()));
                }
            }
        }

        wf.transition(WorkflowState::Done, turn.now)?;
        let what = if acted == confirmed {
            format!("{} matching {query}", plural(acted, "message"))
        } else {
            format!("{acted} of {confirmed} messages matching {query}")
        };
        let mut message = format!("{}.", acted_phrase(operation, &what));
        if !failed.is_empty() {
            let kinds: Vec<&str> = failed.iter().map(FailureKind::as_str).collect();
            message.push_str(&format!(" {} failed ({}).", failed.len(), kinds.join(", ")));
        }
        tracing::info!(workflow_id = %wf.id, operation, acted, confirmed, failed = failed.len(), "bulk execution finished");
        wf.outcome = Some(message.clone());
        let mut reply = TurnReply::completed(message).with_count(acted);
        if let Some(kind) = failed.first() {
            reply = reply.with_next_step(kind.next_action());
        }
        Ok(reply)
    }

    fn present_draft(
        &self,
        wf: &mut Workflow,
        action: &Action,
        value: &Value,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let draft_id = value
            .get("draft_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Invariant("create_draft returned no draft_id".to_string()))?
            .to_string();
        for key in ["to", "subject", "body"] {
            if let Some(v) = action.parameters.get(key) {
                wf.context.set(&format!("draft_{key}"), v.clone());
            }
        }
        wf.context.set("draft_id", draft_id.clone());
        wf.template = WorkflowTemplate::DraftReviewExecute;
        wf.action = Some(Action {
            operation: operations::SEND_DRAFT.to_string(),
            parameters: params_of(json!({ "draft_id": draft_id })),
            target: Target::None,
            candidate_count: Some(1),
        });
        self.review_draft(wf, "Draft saved.", turn)
    }

    /// Presents the current draft and waits for the send phrase.
    fn review_draft(&self, wf: &mut Workflow, headline: &str, turn: &Turn<'_>) -> Result<TurnReply> {
        let send = self.descriptor(operations::SEND_DRAFT)?;
        let phrase = send
            .confirmation_phrase
            .clone()
            .unwrap_or_else(|| operations::SEND_PHRASE.to_string());
        let draft_id = wf.context.get_str("draft_id").unwrap_or_default().to_string();
        let mut request = self.policy.request(
            send,
            1,
            &format!("draft {draft_id}"),
            Some(phrase.clone()),
            turn.now,
        );
        request.presented_summary = format!(
            "{headline}\n{}\n{}",
            draft_preview(wf),
            request.presented_summary
        );
        let message = request.presented_summary.clone();
        let prompt = format!(
            "Type {phrase} exactly to send it. Reply revise subject: ..., revise body: ... or revise to: ... to change it, or cancel to keep it as a draft."
        );
        if wf.state == WorkflowState::AwaitingConfirmation {
            wf.pending = Some(PendingRequest::Confirmation(request));
            wf.updated_at = turn.now;
        } else {
            wf.suspend(PendingRequest::Confirmation(request), turn.now)?;
        }
        Ok(TurnReply::new(ReplyStatus::NeedsConfirmation, message)
            .with_prompt(prompt)
            .with_count(1))
    }

    async fn revise_draft(
        &self,
        wf: &mut Workflow,
        field: &str,
        value: String,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        if field == "to" {
            if let Err(reason) = validate_email_address(&value) {
                let prompt = wf.pending.as_ref().map(PendingRequest::prompt);
                let mut reply = TurnReply::new(
                    ReplyStatus::NeedsConfirmation,
                    format!("{reason}. The draft is unchanged."),
                );
                if let Some(prompt) = prompt {
                    reply = reply.with_prompt(prompt);
                }
                return Ok(reply);
            }
        }
        wf.context.set(&format!("draft_{field}"), value);
        let ctx = &wf.context;
        let params = params_of(json!({
            "draft_id": ctx.get("draft_id"),
            "to": ctx.get("draft_to"),
            "subject": ctx.get("draft_subject"),
            "body": ctx.get("draft_body"),
        }));
        match self.gateway.execute(operations::UPDATE_DRAFT, &params).await {
            Ok(result) => {
                wf.record_step(step_ok(
                    StepKind::Execute,
                    operations::UPDATE_DRAFT,
                    params,
                    result,
                    turn.now,
                ));
            }
            Err(failure) => {
                wf.record_step(step_err(
                    StepKind::Execute,
                    operations::UPDATE_DRAFT,
                    params,
                    &failure,
                    turn.now,
                ));
                return self.fail(wf, &failure, turn);
            }
        }
        self.review_draft(wf, "Draft updated.", turn)
    }

    async fn resume_confirmation(
        &self,
        wf: &mut Workflow,
        mut request: ConfirmationRequest,
        reply: &str,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        if wf.context.get_str("draft_id").is_some() {
            if let Some((field, value)) = parse_revision(reply) {
                return self.revise_draft(wf, field, value, turn).await;
            }
        }
        match self.policy.judge(&request, reply) {
            ConfirmationVerdict::Approved => {
                tracing::info!(workflow_id = %wf.id, operation = %request.operation, "confirmation accepted");
                wf.transition(WorkflowState::Confirmed, turn.now)?;
                self.execute(wf, turn).await
            }
            ConfirmationVerdict::Declined => {
                let message = format!("Okay, I won't. {}", nothing_changed(wf));
                self.abort_with(wf, message, None, turn)
            }
            ConfirmationVerdict::Rejected if request.rejections >= 1 => {
                tracing::info!(workflow_id = %wf.id, operation = %request.operation, "confirmation rejected twice");
                let message = format!(
                    "That still doesn't confirm, so I cancelled. {}",
                    nothing_changed(wf)
                );
                self.abort_with(wf, message, None, turn)
            }
            ConfirmationVerdict::Rejected => {
                request.rejections += 1;
                let count = request.affected_count;
                let prompt = request.prompt();
                let message = format!("That doesn't confirm.\n{}", request.presented_summary);
                wf.pending = Some(PendingRequest::Confirmation(request));
                wf.updated_at = turn.now;
                Ok(TurnReply::new(ReplyStatus::NeedsConfirmation, message)
                    .with_prompt(prompt)
                    .with_count(count))
            }
        }
    }

    async fn resume_clarification(
        &self,
        wf: &mut Workflow,
        request: ClarificationRequest,
        reply: &str,
        standalone: bool,
        turn: &Turn<'_>,
    ) -> Result<Resumption> {
        match request.kind.clone() {
            ClarificationKind::Category => {
                return self.resume_category(wf, &request, reply, turn);
            }
            ClarificationKind::MissingParameter { field } => {
                return self
                    .resume_missing(wf, request, &field, reply, turn)
                    .await
                    .map(Resumption::Replied);
            }
            ClarificationKind::InvalidParameter {
                field,
                suggestion,
                attempts,
            } => {
                return self
                    .resume_invalid(wf, &request, &field, suggestion, attempts, reply, turn)
                    .await
                    .map(Resumption::Replied);
            }
            ClarificationKind::Intent { .. } | ClarificationKind::Entity { .. } => {}
        }

        let picked = match match_option(&request.options, reply) {
            Some(index) => Some(request.options[index].choice.clone()),
            None if is_negative(reply) => {
                return self
                    .abort_with(wf, "Okay, never mind. Nothing was changed.".to_string(), None, turn)
                    .map(Resumption::Replied);
            }
            None if standalone => {
                tracing::info!(workflow_id = %wf.id, "new request replaces the open choice");
                wf.abort("replaced by a new request", turn.now)?;
                return Ok(Resumption::Fresh);
            }
            None => request.default_option().map(|option| {
                tracing::info!(workflow_id = %wf.id, option = %option.label, "applying default for unanswered clarification");
                option.choice.clone()
            }),
        };
        let Some(choice) = picked else {
            return self
                .reprompt_or_abort(wf, request, turn)
                .map(Resumption::Replied);
        };

        wf.transition(WorkflowState::Proposed, turn.now)?;
        match (choice, &request.kind) {
            (OptionChoice::Intent(intent), _) => {
                let decision = self.routing.decide((*intent).clone());
                if decision.status == RoutingStatus::NoMatch {
                    return self
                        .abort_with(
                            wf,
                            "That option is no longer available. Nothing was changed.".to_string(),
                            None,
                            turn,
                        )
                        .map(Resumption::Replied);
                }
                self.plan(wf, &intent, decision.bound_parameters)?;
            }
            (OptionChoice::Entity(contact), ClarificationKind::Entity { role, .. }) => {
                let descriptor = self.descriptor(&wf.action()?.operation)?.clone();
                let extra_filter = match &wf.action()?.target {
                    Target::Contact { extra_filter, .. } => extra_filter.clone(),
                    _ => String::new(),
                };
                bind_contact(wf.action_mut()?, &descriptor, &contact, *role, &extra_filter);
            }
            (choice, kind) => {
                return Err(EngineError::Invariant(format!(
                    "option {choice:?} does not answer {kind:?}"
                )));
            }
        }
        self.advance(wf, turn).await.map(Resumption::Replied)
    }

    fn resume_category(
        &self,
        wf: &mut Workflow,
        request: &ClarificationRequest,
        reply: &str,
        turn: &Turn<'_>,
    ) -> Result<Resumption> {
        let category = match_category(&request.options, reply);
        let Some(category) = category else {
            wf.abort("replaced by a new request", turn.now)?;
            return Ok(Resumption::Fresh);
        };
        wf.transition(WorkflowState::Proposed, turn.now)?;
        wf.transition(WorkflowState::Done, turn.now)?;
        let mut message = format!("{}. For example:", category.label());
        for example in category.examples() {
            message.push_str(&format!("\n  - {example}"));
        }
        Ok(Resumption::Replied(TurnReply::completed(message)))
    }

    async fn resume_missing(
        &self,
        wf: &mut Workflow,
        request: ClarificationRequest,
        field: &str,
        reply: &str,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let value = reply.trim();
        if value.is_empty() {
            return self.reprompt_or_abort(wf, request, turn);
        }
        wf.transition(WorkflowState::Proposed, turn.now)?;
        let action = wf.action_mut()?;
        match field {
            "message_id" => {
                action.target = Target::Item {
                    id: value.to_string(),
                    implied: false,
                };
                action
                    .parameters
                    .insert(field.to_string(), Value::String(value.to_string()));
            }
            "thread_id" => {
                action.target = Target::Thread {
                    id: value.to_string(),
                    implied: false,
                };
                action
                    .parameters
                    .insert(field.to_string(), Value::String(value.to_string()));
            }
            // A name instead of an address goes through contact lookup.
            "to" if !value.contains('@') => {
                action.target = Target::Contact {
                    name: value.to_string(),
                    role: ContactRole::Recipient,
                    extra_filter: String::new(),
                };
            }
            _ => {
                action
                    .parameters
                    .insert(field.to_string(), Value::String(value.to_string()));
            }
        }
        self.advance(wf, turn).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn resume_invalid(
        &self,
        wf: &mut Workflow,
        request: &ClarificationRequest,
        field: &str,
        suggestion: Option<String>,
        attempts: u32,
        reply: &str,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let descriptor = self.descriptor(&wf.action()?.operation)?.clone();
        if suggestion.is_some() && is_negative(reply) {
            wf.transition(WorkflowState::Proposed, turn.now)?;
            return self.ask_field_again(wf, field, attempts, turn);
        }
        let value = match (&suggestion, match_option(&request.options, reply)) {
            (Some(suggested), Some(_)) => suggested.clone(),
            _ => reply.trim().to_string(),
        };

        wf.transition(WorkflowState::Proposed, turn.now)?;
        if let Err(reason) = validate_field(&descriptor, field, &value) {
            if attempts >= 1 {
                return self.abort_with(
                    wf,
                    format!(
                        "That still isn't a valid {}, so I stopped. Nothing was changed.",
                        field_label(field)
                    ),
                    Some("Start again with the correct value."),
                    turn,
                );
            }
            wf.action_mut()?
                .parameters
                .insert(field.to_string(), Value::String(value));
            return self.ask_invalid(wf, &descriptor, field, &reason, attempts + 1, turn);
        }
        wf.action_mut()?
            .parameters
            .insert(field.to_string(), Value::String(value));
        self.advance(wf, turn).await
    }

    fn ask_intent(
        &self,
        wf: &mut Workflow,
        intents: Vec<Intent>,
        ambiguity: Option<AmbiguityKind>,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let question = match ambiguity {
            Some(kind) => kind.question().to_string(),
            None if intents.len() == 1 => "Did you mean this? Reply yes, or cancel.".to_string(),
            None => "I can read that a few ways. Which did you mean?".to_string(),
        };
        let options = intents
            .into_iter()
            .map(|intent| ClarificationOption {
                label: self.option_label(&intent),
                choice: OptionChoice::Intent(Box::new(intent)),
            })
            .collect();
        self.suspend_clarification(
            wf,
            ClarificationKind::Intent { ambiguity },
            question,
            options,
            ReplyStatus::NeedsClarification,
            String::new(),
            turn,
        )
    }

    fn ask_entity(
        &self,
        wf: &mut Workflow,
        name: &str,
        role: ContactRole,
        matches: Vec<EntityMatch>,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        wf.template = WorkflowTemplate::DisambiguateAct;
        let question = format!(
            "{} contacts match \"{name}\". Which one do you mean?",
            matches.len()
        );
        let options = matches
            .into_iter()
            .map(|contact| ClarificationOption {
                label: contact.display.clone(),
                choice: OptionChoice::Entity(contact),
            })
            .collect();
        self.suspend_clarification(
            wf,
            ClarificationKind::Entity {
                name: name.to_string(),
                role,
            },
            question,
            options,
            ReplyStatus::NeedsClarification,
            String::new(),
            turn,
        )
    }

    fn ask_missing(&self, wf: &mut Workflow, field: &str, turn: &Turn<'_>) -> Result<TurnReply> {
        let message = match field {
            "message_id" | "thread_id" => "I'm not sure which message you mean.".to_string(),
            _ => String::new(),
        };
        self.suspend_clarification(
            wf,
            ClarificationKind::MissingParameter {
                field: field.to_string(),
            },
            missing_question(field).to_string(),
            Vec::new(),
            ReplyStatus::NeedsClarification,
            message,
            turn,
        )
    }

    fn ask_invalid(
        &self,
        wf: &mut Workflow,
        descriptor: &OperationDescriptor,
        field: &str,
        reason: &str,
        attempts: u32,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let current = wf
            .action()?
            .parameters
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let is_email = descriptor
            .parameter_schema
            .field(field)
            .is_some_and(|spec| spec.kind == ParamKind::Email);
        let suggestion = if is_email && attempts == 0 {
            suggest_email(&current)
        } else {
            None
        };
        let label = field_label(field);
        let (question, options) = match &suggestion {
            Some(suggested) => (
                format!("Did you mean {suggested}? Reply yes to use it, or type the correct {label}."),
                vec![ClarificationOption {
                    label: format!("Use {suggested}"),
                    choice: OptionChoice::Suggestion(suggested.clone()),
                }],
            ),
            None => (format!("Please type a valid {label}."), Vec::new()),
        };
        self.suspend_clarification(
            wf,
            ClarificationKind::InvalidParameter {
                field: field.to_string(),
                suggestion,
                attempts,
            },
            question,
            options,
            ReplyStatus::NeedsClarification,
            format!("That {label} doesn't look right: {reason}."),
            turn,
        )
    }

    fn ask_field_again(
        &self,
        wf: &mut Workflow,
        field: &str,
        attempts: u32,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        self.suspend_clarification(
            wf,
            ClarificationKind::InvalidParameter {
                field: field.to_string(),
                suggestion: None,
                attempts,
            },
            format!("Please type the correct {}.", field_label(field)),
            Vec::new(),
            ReplyStatus::NeedsClarification,
            String::new(),
            turn,
        )
    }

    fn offer_categories(&self, wf: &mut Workflow, turn: &Turn<'_>) -> Result<TurnReply> {
        wf.template = WorkflowTemplate::CategoryMenu;
        let options = OperationCategory::ALL
            .iter()
            .map(|category| ClarificationOption {
                label: category.label().to_string(),
                choice: OptionChoice::Category(*category),
            })
            .collect();
        self.suspend_clarification(
            wf,
            ClarificationKind::Category,
            "Here is what I can help with:".to_string(),
            options,
            ReplyStatus::NoMatch,
            "I couldn't match that to anything I can do.".to_string(),
            turn,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn suspend_clarification(
        &self,
        wf: &mut Workflow,
        kind: ClarificationKind,
        question: String,
        options: Vec<ClarificationOption>,
        status: ReplyStatus,
        message: String,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        let request = ClarificationRequest {
            kind,
            question,
            options,
            created_at: turn.now,
            expires_at: turn.now + self.policy.timeout(),
            turns: 0,
            reprompts: 0,
        };
        let prompt = request.prompt();
        wf.suspend(PendingRequest::Clarification(request), turn.now)?;
        Ok(TurnReply::new(status, message).with_prompt(prompt))
    }

    fn reprompt_or_abort(
        &self,
        wf: &mut Workflow,
        mut request: ClarificationRequest,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        if request.reprompts >= 1 {
            return self.abort_with(
                wf,
                "I still couldn't tell what you meant, so I stopped. Nothing was changed.".to_string(),
                Some("Start again with more detail."),
                turn,
            );
        }
        request.reprompts += 1;
        let prompt = request.prompt();
        wf.pending = Some(PendingRequest::Clarification(request));
        wf.updated_at = turn.now;
        Ok(TurnReply::new(ReplyStatus::NeedsClarification, "Sorry, I didn't catch that.")
            .with_prompt(prompt))
    }

    fn fail(&self, wf: &mut Workflow, failure: &Failure, turn: &Turn<'_>) -> Result<TurnReply> {
        tracing::warn!(
            workflow_id = %wf.id,
            operation = %failure.operation,
            kind = %failure.kind,
            attempts = failure.attempts,
            "workflow failed"
        );
        wf.transition(WorkflowState::Failed, turn.now)?;
        let message = format!(
            "{} ({} did not complete.)",
            failure.kind.user_message(),
            failure.operation
        );
        wf.outcome = Some(message.clone());
        Ok(TurnReply::new(ReplyStatus::Failed, message).with_next_step(failure.kind.next_action()))
    }

    fn abort_with(
        &self,
        wf: &mut Workflow,
        message: String,
        next_step: Option<&str>,
        turn: &Turn<'_>,
    ) -> Result<TurnReply> {
        wf.abort(&message, turn.now)?;
        let mut reply = TurnReply::aborted(message);
        if let Some(step) = next_step {
            reply = reply.with_next_step(step);
        }
        Ok(reply)
    }

    fn option_label(&self, intent: &Intent) -> String {
        let operation = intent.primary_operation().unwrap_or_default();
        let scope = intent_scope(intent);
        match operation {
            operations::DELETE_FOREVER => {
                format!("Delete {scope} permanently, forever (cannot be undone)")
            }
            operations::TRASH_MESSAGE | operations::TRASH_THREAD => {
                format!("Move {scope} to the trash (can be undone)")
            }
            operations::CREATE_DRAFT => "Save a draft to review first".to_string(),
            operations::SEND_EMAIL => "Send it right away".to_string(),
            _ => {
                let what = self
                    .descriptors
                    .get(operation)
                    .map(|d| d.description.trim_end_matches('.').to_string())
                    .unwrap_or_else(|| operation.to_string());
                format!("{what} ({scope})")
            }
        }
    }
}

fn params_of(value: Value) -> Parameters {
    match value {
        Value::Object(map) => map,
        _ => Parameters::new(),
    }
}

fn step_ok(
    kind: StepKind,
    operation: &str,
    parameters: Parameters,
    result: Value,
    now: DateTime<Utc>,
) -> WorkflowStep {
    WorkflowStep {
        kind,
        operation: operation.to_string(),
        parameters,
        result: Some(result),
        error: None,
        executed_at: now,
    }
}

fn step_err(
    kind: StepKind,
    operation: &str,
    parameters: Parameters,
    failure: &Failure,
    now: DateTime<Utc>,
) -> WorkflowStep {
    WorkflowStep {
        kind,
        operation: operation.to_string(),
        parameters,
        result: None,
        error: Some(StepError {
            kind: failure.kind.clone(),
            message: failure.source.to_string(),
            attempts: failure.attempts,
        }),
        executed_at: now,
    }
}

/// Bulk actions take their item id from enumeration, not from the user.
fn request_schema(descriptor: &OperationDescriptor, bulk: bool) -> ParameterSchema {
    if !bulk {
        return descriptor.parameter_schema.clone();
    }
    ParameterSchema {
        fields: descriptor
            .parameter_schema
            .fields
            .iter()
            .filter(|spec| spec.name != "message_id")
            .cloned()
            .collect(),
    }
}

fn validate_field(descriptor: &OperationDescriptor, field: &str, value: &str) -> std::result::Result<(), String> {
    let Some(spec) = descriptor.parameter_schema.field(field) else {
        return Err(format!("{} does not take {field}", descriptor.name));
    };
    let schema = ParameterSchema {
        fields: vec![spec.clone()],
    };
    let mut params = Parameters::new();
    params.insert(field.to_string(), Value::String(value.to_string()));
    schema.validate(&params).map_err(|violation| match violation {
        SchemaViolation::Invalid { reason, .. } => reason,
        other => other.to_string(),
    })
}

fn bind_contact(
    action: &mut Action,
    descriptor: &OperationDescriptor,
    contact: &EntityMatch,
    role: ContactRole,
    extra_filter: &str,
) {
    match role {
        ContactRole::Recipient => {
            action
                .parameters
                .insert("to".to_string(), Value::String(contact.id.clone()));
            action.target = Target::None;
        }
        ContactRole::Sender => {
            let query = if extra_filter.is_empty() {
                format!("from:{}", contact.id)
            } else {
                format!("from:{} {extra_filter}", contact.id)
            };
            if descriptor.parameter_schema.accepts("query") {
                action
                    .parameters
                    .insert("query".to_string(), Value::String(query));
                action.target = Target::None;
            } else {
                action.target = Target::Filter { query };
            }
        }
    }
    tracing::debug!(contact = %contact.id, role = ?role, "contact resolved");
}

fn target_phrase(target: &Target) -> String {
    match target {
        Target::None => "it".to_string(),
        Target::Item { id, .. } => format!("message {id}"),
        Target::Thread { id, .. } => format!("thread {id}"),
        Target::Filter { query } => format!("messages matching {query}"),
        Target::Contact {
            name,
            role: ContactRole::Sender,
            ..
        } => format!("mail from {name}"),
        Target::Contact {
            name,
            role: ContactRole::Recipient,
            ..
        } => format!("a message to {name}"),
    }
}

fn intent_scope(intent: &Intent) -> String {
    match (&intent.target, intent.entities.get("query").and_then(Value::as_str)) {
        (Target::None, Some(query)) => format!("matching {query}"),
        (target, _) => target_phrase(target),
    }
}

fn scope_of(action: &Action) -> String {
    let to = action.parameters.get("to").and_then(Value::as_str);
    match (&action.target, to) {
        (Target::None, Some(to)) => {
            let subject = action
                .parameters
                .get("subject")
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("to {to}, subject \"{subject}\"")
        }
        (target, _) => target_phrase(target),
    }
}

fn acted_phrase(operation: &str, what: &str) -> String {
    match operation {
        operations::ARCHIVE_MESSAGE | operations::ARCHIVE_THREAD => format!("Archived {what}"),
        operations::TRASH_MESSAGE | operations::TRASH_THREAD => {
            format!("Moved {what} to the trash")
        }
        operations::DELETE_FOREVER => format!("Permanently deleted {what}"),
        operations::MARK_READ => format!("Marked {what} as read"),
        operations::APPLY_LABEL => format!("Labeled {what}"),
        other => format!("Ran {other} on {what}"),
    }
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}

fn nothing_changed(wf: &Workflow) -> &'static str {
    if wf.context.get_str("draft_id").is_some() {
        "Nothing was sent; the draft stays in your Drafts folder."
    } else {
        "Nothing was changed."
    }
}

fn missing_question(field: &str) -> &'static str {
    match field {
        "message_id" => "Which message? Reply with its id (for example m-101).",
        "thread_id" => "Which thread? Reply with its id.",
        "to" => "Who should it go to? Reply with an email address or a name.",
        "subject" => "What should the subject be?",
        "body" => "What should the message say?",
        "label" => "Which label should I apply?",
        "query" => "What should I search for?",
        "draft_id" => "Which draft? Reply with its id.",
        _ => "What value should I use?",
    }
}

fn field_label(field: &str) -> &str {
    match field {
        "to" => "email address",
        "message_id" => "message id",
        "thread_id" => "thread id",
        "draft_id" => "draft id",
        other => other,
    }
}

fn draft_preview(wf: &Workflow) -> String {
    let get = |key: &str| wf.context.get_str(key).unwrap_or_default();
    format!(
        "To: {}\nSubject: {}\n\n{}",
        get("draft_to"),
        get("draft_subject"),
        get("draft_body")
    )
}

/// `revise subject: ...`, `revise body: ...` or `revise to: ...`.
fn parse_revision(reply: &str) -> Option<(&'static str, String)> {
    let trimmed = reply.trim();
    if !trimmed.to_ascii_lowercase().starts_with("revise") {
        return None;
    }
    let (field, value) = trimmed["revise".len()..].split_once(':')?;
    let field = match field.trim().to_ascii_lowercase().as_str() {
        "subject" => "subject",
        "body" => "body",
        "to" => "to",
        _ => return None,
    };
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some((field, value.to_string()))
}

/// One automatic correction for a malformed address: stray spaces, doubled
/// `@`, a missing top-level domain or a common domain typo.
fn suggest_email(value: &str) -> Option<String> {
    let mut candidate: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    candidate = candidate.trim_end_matches('.').to_ascii_lowercase();
    while candidate.contains("@@") {
        candidate = candidate.replace("@@", "@");
    }
    if let Some((local, domain)) = candidate.split_once('@') {
        let domain = EMAIL_DOMAIN_TYPOS
            .iter()
            .find(|(typo, _)| *typo == domain)
            .map(|(_, fixed)| (*fixed).to_string())
            .unwrap_or_else(|| {
                if !domain.is_empty() && !domain.contains('.') {
                    format!("{domain}.com")
                } else {
                    domain.to_string()
                }
            });
        candidate = format!("{local}@{domain}");
    }
    (candidate != value && validate_email_address(&candidate).is_ok()).then_some(candidate)
}

fn normalized_tokens(reply: &str) -> Vec<String> {
    reply
        .trim()
        .trim_end_matches(['.', '!', '?'])
        .to_ascii_lowercase()
        .split_whitespace()
        .filter(|w| !matches!(*w, "the" | "one" | "option" | "number" | "#"))
        .map(str::to_string)
        .collect()
}

fn ordinal(token: &str) -> Option<usize> {
    match token {
        "first" | "1st" => Some(0),
        "second" | "2nd" => Some(1),
        "third" | "3rd" => Some(2),
        "fourth" | "4th" => Some(3),
        "fifth" | "5th" => Some(4),
        _ => None,
    }
}

/// Position of a number or ordinal reply, if the reply is one.
fn positional(options_len: usize, tokens: &[String]) -> Option<Option<usize>> {
    let [token] = tokens else {
        return None;
    };
    let token = token.trim_start_matches('#');
    if let Ok(n) = token.parse::<usize>() {
        return Some((1..=options_len).contains(&n).then(|| n - 1));
    }
    if token == "last" {
        return Some(options_len.checked_sub(1));
    }
    ordinal(token).map(|index| (index < options_len).then_some(index))
}

/// Index of the option a reply selects: by number, ordinal, a bare yes when
/// only one option exists, or text that matches exactly one option label.
fn match_option(options: &[ClarificationOption], reply: &str) -> Option<usize> {
    if options.is_empty() {
        return None;
    }
    let tokens = normalized_tokens(reply);
    if let Some(position) = positional(options.len(), &tokens) {
        return position;
    }
    if options.len() == 1 && is_affirmative(reply) {
        return Some(0);
    }
    let text = tokens.join(" ");
    if text.is_empty() {
        return None;
    }
    let labels: Vec<String> = options.iter().map(|o| o.label.to_ascii_lowercase()).collect();
    let unique = |hits: Vec<usize>| (hits.len() == 1).then(|| hits[0]);

    let by_phrase: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| label.contains(&text))
        .map(|(i, _)| i)
        .collect();
    if let Some(index) = unique(by_phrase) {
        return Some(index);
    }

    let words: Vec<&str> = tokens
        .iter()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.len() >= 4 && !LABEL_STOPWORDS.contains(w))
        .collect();
    if words.is_empty() {
        return None;
    }
    let by_word: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| words.iter().any(|w| label.contains(w)))
        .map(|(i, _)| i)
        .collect();
    unique(by_word)
}

/// Category menus only accept a position or the category's own name, so a
/// fresh request mentioning a category word is not swallowed by the menu.
fn match_category(options: &[ClarificationOption], reply: &str) -> Option<OperationCategory> {
    let tokens = normalized_tokens(reply);
    let index = match positional(options.len(), &tokens) {
        Some(position) => position?,
        None => {
            let text = tokens.join(" ");
            options.iter().position(|o| {
                matches!(&o.choice, OptionChoice::Category(c) if c.as_str() == text)
            })?
        }
    };
    match options.get(index).map(|o| &o.choice) {
        Some(OptionChoice::Category(category)) => Some(*category),
        _ => None,
    }
}

fn completion(action: &Action, value: &Value) -> TurnReply {
    let operation = action.operation.as_str();
    match operation {
        operations::SEARCH_MESSAGES => search_report(action, value),
        operations::READ_MESSAGE => read_report(value),
        operations::SEND_DRAFT | operations::SEND_EMAIL => {
            let to = value
                .get("to")
                .and_then(Value::as_str)
                .or_else(|| action.parameters.get("to").and_then(Value::as_str))
                .unwrap_or("the recipient");
            TurnReply::completed(format!("Sent to {to}.")).with_count(1)
        }
        operations::ARCHIVE_THREAD | operations::TRASH_THREAD => {
            let touched = value
                .get("messages")
                .and_then(Value::as_u64)
                .map(|n| n as usize);
            let what = match touched {
                Some(n) => format!("{} ({})", target_phrase(&action.target), plural(n, "message")),
                None => target_phrase(&action.target),
            };
            TurnReply::completed(format!("{}.", acted_phrase(operation, &what)))
                .with_count(touched.unwrap_or(1))
        }
        _ => {
            let mut message = acted_phrase(operation, &target_phrase(&action.target));
            if let Some(label) = action.parameters.get("label").and_then(Value::as_str) {
                message.push_str(&format!(" with {label}"));
            }
            message.push('.');
            let mut reply = TurnReply::completed(message).with_count(1);
            if let Target::Item { id, .. } = &action.target {
                if operation != operations::DELETE_FOREVER {
                    reply = reply.with_item(id, None);
                }
            }
            reply
        }
    }
}

fn search_report(action: &Action, value: &Value) -> TurnReply {
    let query = action
        .parameters
        .get("query")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let messages = value
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if messages.is_empty() {
        return TurnReply::completed(format!("No messages match {query}."))
            .with_count(0)
            .with_next_step(FailureKind::EmptyResult.next_action());
    }
    let mut out = format!("Found {} for {query}:", plural(messages.len(), "message"));
    let mut items = Vec::new();
    for message in messages.iter().take(LISTED_RESULTS) {
        let id = message
            .get("id")
            .or_else(|| message.get("message_id"))
            .and_then(Value::as_str)
            .unwrap_or("?");
        let from = message.get("from").and_then(Value::as_str).unwrap_or_default();
        let subject = message
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or_default();
        out.push_str(&format!("\n  {id}  {from}: {subject}"));
        let thread = message.get("thread_id").and_then(Value::as_str);
        items.push((id.to_string(), thread.map(str::to_string)));
    }
    if messages.len() > LISTED_RESULTS {
        out.push_str(&format!("\n  ...and {} more", messages.len() - LISTED_RESULTS));
    }
    let mut reply = TurnReply::completed(out).with_count(messages.len());
    for (id, thread) in items {
        reply = reply.with_item(&id, thread.as_deref());
    }
    reply
}

fn read_report(value: &Value) -> TurnReply {
    let message = value.get("message").unwrap_or(value);
    let text = |key: &str| message.get(key).and_then(Value::as_str).unwrap_or_default();
    let id = message
        .get("id")
        .or_else(|| message.get("message_id"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let from = match (text("from_name"), text("from")) {
        ("", from) => from.to_string(),
        (name, from) => format!("{name} <{from}>"),
    };
    let body = match text("body") {
        "" => text("snippet"),
        body => body,
    };
    let thread = message.get("thread_id").and_then(Value::as_str);
    TurnReply::completed(format!(
        "From: {from}\nSubject: {}\n\n{body}",
        text("subject")
    ))
    .with_count(1)
    .with_item(id, thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::MatchClass;

    fn intent_option(op: &str, target: Target) -> ClarificationOption {
        let intent = Intent::new(
            OperationCategory::Delete,
            op,
            target,
            MatchClass::ExplicitOperationImpliedTarget,
            "remove this",
        );
        ClarificationOption {
            label: match op {
                operations::DELETE_FOREVER => {
                    "Delete message m-1 permanently, forever (cannot be undone)".to_string()
                }
                _ => "Move message m-1 to the trash (can be undone)".to_string(),
            },
            choice: OptionChoice::Intent(Box::new(intent)),
        }
    }

    fn destructive_options() -> Vec<ClarificationOption> {
        let target = Target::Item {
            id: "m-1".to_string(),
            implied: true,
        };
        vec![
            intent_option(operations::TRASH_MESSAGE, target.clone()),
            intent_option(operations::DELETE_FOREVER, target),
        ]
    }

    #[test]
    fn options_match_by_number_ordinal_and_words() {
        let options = destructive_options();
        assert_eq!(match_option(&options, "2"), Some(1));
        assert_eq!(match_option(&options, "the first one"), Some(0));
        assert_eq!(match_option(&options, "#2"), Some(1));
        assert_eq!(match_option(&options, "trash"), Some(0));
        assert_eq!(match_option(&options, "delete forever"), Some(1));
        assert_eq!(match_option(&options, "permanently"), Some(1));
        assert_eq!(match_option(&options, "7"), None);
        assert_eq!(match_option(&options, "whatever"), None);
        assert_eq!(match_option(&options, "yes"), None);
    }

    #[test]
    fn single_option_accepts_affirmative() {
        let options = destructive_options()[..1].to_vec();
        assert_eq!(match_option(&options, "yes please"), None);
        assert_eq!(match_option(&options, "sure"), Some(0));
    }

    #[test]
    fn category_menu_ignores_incidental_words() {
        let options: Vec<ClarificationOption> = OperationCategory::ALL
            .iter()
            .map(|c| ClarificationOption {
                label: c.label().to_string(),
                choice: OptionChoice::Category(*c),
            })
            .collect();
        assert_eq!(match_category(&options, "2"), Some(OperationCategory::Organize));
        assert_eq!(match_category(&options, "compose"), Some(OperationCategory::Compose));
        assert_eq!(match_category(&options, "archive all emails from bob"), None);
    }

    #[test]
    fn email_suggestions_fix_common_mistakes() {
        assert_eq!(suggest_email("bob@example"), Some("bob@example.com".to_string()));
        assert_eq!(suggest_email("bob@@example.com"), Some("bob@example.com".to_string()));
        assert_eq!(suggest_email("bob@gmial.com"), Some("bob@gmail.com".to_string()));
        assert_eq!(suggest_email("bob"), None);
        assert_eq!(suggest_email("bob@example.com"), None);
    }

    #[test]
    fn revisions_parse_field_and_value() {
        assert_eq!(
            parse_revision("revise subject: Team lunch"),
            Some(("subject", "Team lunch".to_string()))
        );
        assert_eq!(
            parse_revision("Revise to: carol@example.com"),
            Some(("to", "carol@example.com".to_string()))
        );
        assert_eq!(parse_revision("revise cc: x"), None);
        assert_eq!(parse_revision("SEND"), None);
    }

    #[test]
    fn default_reading_is_the_reversible_one() {
        let request = ClarificationRequest {
            kind: ClarificationKind::Intent {
                ambiguity: Some(AmbiguityKind::DestructiveScope),
            },
            question: String::new(),
            options: destructive_options(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            turns: 0,
            reprompts: 0,
        };
        let default = request.default_option().expect("default exists");
        assert!(default.label.contains("trash"));
    }

    #[test]
    fn bulk_schema_drops_item_id_only() {
        let descriptor = courier_catalog::mail_operations()
            .into_iter()
            .find(|d| d.name == operations::APPLY_LABEL)
            .expect("apply_label");
        let schema = request_schema(&descriptor, true);
        assert!(!schema.accepts("message_id"));
        assert!(schema.accepts("label"));
    }
}
