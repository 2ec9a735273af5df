//! Workflow records persisted between turns.
//!
//! A [`Workflow`] is owned by exactly one session. It holds at most one
//! pending request (confirmation or clarification) at a time, which is the
//! only point where a turn suspends.

use crate::errors::{EngineError, FailureKind, Result};
use crate::intent::{AmbiguityKind, ContactRole, Intent, Target};
use crate::safety::ConfirmationRequest;
use crate::types::{SessionId, WorkflowId};
use chrono::{DateTime, Utc};
use courier_catalog::{EntityMatch, OperationCategory, Parameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Proposed,
    AwaitingClarification,
    AwaitingConfirmation,
    Confirmed,
    Executing,
    Done,
    Aborted,
    Failed,
}

impl WorkflowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::AwaitingClarification => "awaiting_clarification",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Confirmed => "confirmed",
            Self::Executing => "executing",
            Self::Done => "done",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed)
    }

    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            Self::AwaitingClarification | Self::AwaitingConfirmation
        )
    }

    pub fn can_transition_to(self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match self {
            Proposed => matches!(
                next,
                AwaitingClarification | AwaitingConfirmation | Executing | Done | Aborted | Failed
            ),
            // A resolved clarification goes back through the risk check.
            AwaitingClarification => matches!(next, Proposed | Aborted),
            // Failed covers a draft revision the backend rejected.
            AwaitingConfirmation => matches!(next, Confirmed | Aborted | Failed),
            Confirmed => matches!(next, Executing | Aborted),
            // Draft review suspends again after the draft is written.
            Executing => matches!(next, Done | Failed | Aborted | AwaitingConfirmation),
            Done | Aborted | Failed => false,
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named step sequences the orchestrator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowTemplate {
    SingleAction,
    DraftReviewExecute,
    SearchConfirmBulkAct,
    DisambiguateAct,
    CategoryMenu,
}

/// Session-scoped key/value state. Every write bumps `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub version: u64,
    pub values: BTreeMap<String, Value>,
}

impl WorkflowContext {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
        self.version += 1;
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.values.remove(key);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }
}

/// The operation a workflow is working toward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub operation: String,
    pub parameters: Parameters,
    pub target: Target,
    /// Exact number of items the count probe found; set before any bulk mutation.
    #[serde(default)]
    pub candidate_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Count,
    Lookup,
    Execute,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
}

/// One catalog call made on behalf of the workflow. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub kind: StepKind,
    pub operation: String,
    pub parameters: Parameters,
    pub result: Option<Value>,
    pub error: Option<StepError>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ClarificationKind {
    /// Several readings of the utterance.
    Intent { ambiguity: Option<AmbiguityKind> },
    /// A person's name matched several contacts.
    Entity { name: String, role: ContactRole },
    MissingParameter { field: String },
    InvalidParameter {
        field: String,
        #[serde(default)]
        suggestion: Option<String>,
        #[serde(default)]
        attempts: u32,
    },
    /// Nothing matched; the user picks an area.
    Category,
}

impl ClarificationKind {
    /// A pick between readings or contacts, as opposed to a request for a value.
    pub fn is_choice(&self) -> bool {
        matches!(self, Self::Intent { .. } | Self::Entity { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum OptionChoice {
    Intent(Box<Intent>),
    Entity(EntityMatch),
    Category(OperationCategory),
    Suggestion(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationOption {
    pub label: String,
    pub choice: OptionChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub kind: ClarificationKind,
    pub question: String,
    #[serde(default)]
    pub options: Vec<ClarificationOption>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub reprompts: u32,
}

impl ClarificationRequest {
    pub fn prompt(&self) -> String {
        let mut out = self.question.clone();
        for (i, option) in self.options.iter().enumerate() {
            out.push_str(&format!("\n  {}. {}", i + 1, option.label));
        }
        if !self.options.is_empty() {
            out.push_str("\nReply with a number or describe what you want, or reply cancel.");
        }
        out
    }

    /// Option the workflow falls back to when the reply matches nothing.
    pub fn default_option(&self) -> Option<&ClarificationOption> {
        let ClarificationKind::Intent {
            ambiguity: Some(ambiguity),
        } = &self.kind
        else {
            return None;
        };
        if !ambiguity.has_default() {
            return None;
        }
        self.options.iter().find(|option| match &option.choice {
            OptionChoice::Intent(intent) => ambiguity.is_default(intent),
            _ => false,
        })
    }
}

/// The single request a suspended workflow waits on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "request")]
pub enum PendingRequest {
    Confirmation(ConfirmationRequest),
    Clarification(ClarificationRequest),
}

impl PendingRequest {
    pub fn is_expired(&self, now: DateTime<Utc>, max_turns: u32) -> bool {
        match self {
            Self::Confirmation(request) => request.is_expired(now, max_turns),
            Self::Clarification(request) => {
                now >= request.expires_at || request.turns >= max_turns
            }
        }
    }

    pub fn record_turn(&mut self) {
        match self {
            Self::Confirmation(request) => request.turns += 1,
            Self::Clarification(request) => request.turns += 1,
        }
    }

    pub fn prompt(&self) -> String {
        match self {
            Self::Confirmation(request) => {
                format!("{}\n{}", request.presented_summary, request.prompt())
            }
            Self::Clarification(request) => request.prompt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub session_id: SessionId,
    pub state: WorkflowState,
    pub template: WorkflowTemplate,
    /// Utterance that started the workflow.
    pub utterance: String,
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub context: WorkflowContext,
    #[serde(default)]
    pub pending: Option<PendingRequest>,
    #[serde(default)]
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(session_id: SessionId, utterance: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: WorkflowId::generate(),
            session_id,
            state: WorkflowState::Proposed,
            template: WorkflowTemplate::SingleAction,
            utterance: utterance.to_string(),
            action: None,
            steps: Vec::new(),
            context: WorkflowContext::default(),
            pending: None,
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, next: WorkflowState, now: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::Invariant(format!(
                "workflow {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        tracing::info!(
            workflow_id = %self.id,
            session_id = %self.session_id,
            from = %self.state,
            to = %next,
            "workflow transition"
        );
        if !next.is_suspended() {
            self.pending = None;
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Suspends on `request`, replacing any earlier one.
    pub fn suspend(&mut self, request: PendingRequest, now: DateTime<Utc>) -> Result<()> {
        let next = match request {
            PendingRequest::Confirmation(_) => WorkflowState::AwaitingConfirmation,
            PendingRequest::Clarification(_) => WorkflowState::AwaitingClarification,
        };
        self.transition(next, now)?;
        self.pending = Some(request);
        Ok(())
    }

    pub fn abort(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(WorkflowState::Aborted, now)?;
        self.outcome = Some(reason.to_string());
        Ok(())
    }

    pub fn action(&self) -> Result<&Action> {
        self.action
            .as_ref()
            .ok_or_else(|| EngineError::Invariant(format!("workflow {} has no action", self.id)))
    }

    pub fn action_mut(&mut self) -> Result<&mut Action> {
        let id = self.id.clone();
        self.action
            .as_mut()
            .ok_or_else(|| EngineError::Invariant(format!("workflow {id} has no action")))
    }

    pub fn record_step(&mut self, step: WorkflowStep) {
        tracing::debug!(
            workflow_id = %self.id,
            kind = ?step.kind,
            operation = %step.operation,
            ok = step.error.is_none(),
            "workflow step recorded"
        );
        self.updated_at = step.executed_at;
        self.steps.push(step);
    }

    pub fn pending_confirmation(&self) -> Option<&ConfirmationRequest> {
        match &self.pending {
            Some(PendingRequest::Confirmation(request)) => Some(request),
            _ => None,
        }
    }

    pub fn pending_clarification(&self) -> Option<&ClarificationRequest> {
        match &self.pending {
            Some(PendingRequest::Clarification(request)) => Some(request),
            _ => None,
        }
    }
}
