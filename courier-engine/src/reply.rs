//! Transport-agnostic turn output.

use crate::types::WorkflowId;
use crate::workflow::WorkflowState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Completed,
    NeedsClarification,
    NeedsConfirmation,
    NoMatch,
    Aborted,
    Failed,
}

impl ReplyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NeedsClarification => "needs_clarification",
            Self::NeedsConfirmation => "needs_confirmation",
            Self::NoMatch => "no_match",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }
}

/// A reference the transport can carry into the next turn's context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnReply {
    pub status: ReplyStatus,
    pub message: String,
    /// Question or confirmation text when the workflow is suspended.
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub affected_count: Option<usize>,
    #[serde(default)]
    pub referenced_items: Vec<ItemRef>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub workflow_state: Option<WorkflowState>,
}

impl TurnReply {
    pub fn new(status: ReplyStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            prompt: None,
            affected_count: None,
            referenced_items: Vec::new(),
            next_steps: Vec::new(),
            workflow_id: None,
            workflow_state: None,
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self::new(ReplyStatus::Completed, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ReplyStatus::Aborted, message)
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.affected_count = Some(count);
        self
    }

    pub fn with_next_step(mut self, step: impl Into<String>) -> Self {
        self.next_steps.push(step.into());
        self
    }

    pub fn with_item(mut self, id: &str, thread_id: Option<&str>) -> Self {
        self.referenced_items.push(ItemRef {
            id: id.to_string(),
            thread_id: thread_id.map(str::to_string),
        });
        self
    }

    pub fn for_workflow(mut self, id: &WorkflowId, state: WorkflowState) -> Self {
        self.workflow_id = Some(id.clone());
        self.workflow_state = Some(state);
        self
    }

    pub fn is_suspended(&self) -> bool {
        matches!(
            self.status,
            ReplyStatus::NeedsClarification | ReplyStatus::NeedsConfirmation
        )
    }

    /// Plain text for line-oriented transports.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        if let Some(prompt) = &self.prompt {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(prompt);
        }
        if !self.next_steps.is_empty() {
            out.push_str("\nNext: ");
            out.push_str(&self.next_steps.join(" "));
        }
        out
    }
}
