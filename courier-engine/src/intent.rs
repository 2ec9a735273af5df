//! Intent records and the detector contract.

use crate::types::ConversationContext;
use async_trait::async_trait;
use courier_catalog::{OperationCategory, Parameters};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("invalid detector output: {0}")]
    InvalidOutput(String),

    #[error("invalid detection rule: {0}")]
    InvalidRule(String),
}

/// How strongly the utterance pinned down the operation and its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchClass {
    ExactOperationName,
    ExplicitOperationExplicitTarget,
    ExplicitOperationImpliedTarget,
    ImpliedOperationExplicitTarget,
    Fuzzy,
}

impl MatchClass {
    pub fn confidence(self) -> f64 {
        match self {
            Self::ExactOperationName => 0.99,
            Self::ExplicitOperationExplicitTarget => 0.95,
            Self::ExplicitOperationImpliedTarget => 0.90,
            Self::ImpliedOperationExplicitTarget => 0.70,
            Self::Fuzzy => 0.50,
        }
    }
}

/// The recognised ambiguity families, each with its fallback when the user
/// does not pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityKind {
    /// "remove", "erase", "wipe": trash or delete forever.
    DestructiveScope,
    /// Bare "this" while both a message and a thread are in focus.
    SingleOrThread,
    /// "send"/"email"/"write" without saying now or draft.
    SendNowOrDraft,
    /// A person name that resolves to several contacts.
    MultipleEntities,
}

impl AmbiguityKind {
    pub fn has_default(self) -> bool {
        self != Self::MultipleEntities
    }

    /// Whether `intent` is the reading applied when the user does not pick:
    /// the reversible delete, the single message, the draft. A person is
    /// never guessed.
    pub fn is_default(self, intent: &Intent) -> bool {
        use courier_catalog::operations;
        match self {
            Self::DestructiveScope => intent.primary_operation() != Some(operations::DELETE_FOREVER),
            Self::SingleOrThread => matches!(intent.target, Target::Item { .. }),
            Self::SendNowOrDraft => intent.primary_operation() == Some(operations::CREATE_DRAFT),
            Self::MultipleEntities => false,
        }
    }

    pub fn question(self) -> &'static str {
        match self {
            Self::DestructiveScope => "Do you want to move it to the trash or delete it forever?",
            Self::SingleOrThread => "Just this message, or the whole thread?",
            Self::SendNowOrDraft => "Should I send it right away or save a draft for you to review?",
            Self::MultipleEntities => "Several contacts match. Which one do you mean?",
        }
    }
}

impl fmt::Display for AmbiguityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DestructiveScope => "destructive_scope",
            Self::SingleOrThread => "single_or_thread",
            Self::SendNowOrDraft => "send_now_or_draft",
            Self::MultipleEntities => "multiple_entities",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactRole {
    /// The person's mail is the target of a bulk action.
    Sender,
    /// The person receives a new message.
    Recipient,
}

/// What an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Target {
    None,
    Item {
        id: String,
        implied: bool,
    },
    Thread {
        id: String,
        implied: bool,
    },
    /// Every message matching a mail query.
    Filter {
        query: String,
    },
    /// A person named in the utterance that still needs resolving.
    Contact {
        name: String,
        role: ContactRole,
        /// Extra query terms combined with `from:` once resolved.
        #[serde(default)]
        extra_filter: String,
    },
}

impl Target {
    pub fn is_bulk(&self) -> bool {
        matches!(
            self,
            Self::Filter { .. }
                | Self::Contact {
                    role: ContactRole::Sender,
                    ..
                }
        )
    }

    pub fn is_explicit(&self) -> bool {
        match self {
            Self::None => false,
            Self::Item { implied, .. } | Self::Thread { implied, .. } => !implied,
            Self::Filter { .. } | Self::Contact { .. } => true,
        }
    }
}

/// One candidate reading of an utterance. Produced fresh per turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub category: OperationCategory,
    /// Operations this reading could map to, most specific first.
    pub operation_candidates: Vec<String>,
    /// Parameter values extracted from the utterance.
    pub entities: Parameters,
    pub target: Target,
    pub confidence: f64,
    pub match_class: MatchClass,
    pub raw_utterance: String,
    /// A reference like "this email" could not be resolved from context.
    #[serde(default)]
    pub missing_context: bool,
    #[serde(default)]
    pub ambiguity: Option<AmbiguityKind>,
}

impl Intent {
    pub fn new(
        category: OperationCategory,
        operation: &str,
        target: Target,
        match_class: MatchClass,
        raw_utterance: &str,
    ) -> Self {
        Self {
            category,
            operation_candidates: vec![operation.to_string()],
            entities: Parameters::new(),
            target,
            confidence: match_class.confidence(),
            match_class,
            raw_utterance: raw_utterance.to_string(),
            missing_context: false,
            ambiguity: None,
        }
    }

    pub fn primary_operation(&self) -> Option<&str> {
        self.operation_candidates.first().map(String::as_str)
    }

    pub fn with_entity(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.entities.insert(key.to_string(), value.into());
        self
    }

    pub fn with_ambiguity(mut self, kind: AmbiguityKind) -> Self {
        self.ambiguity = Some(kind);
        self
    }
}

/// Turns an utterance into zero or more ranked candidate intents.
///
/// Detectors never break ties between equally plausible readings; they return
/// all of them and leave the choice to routing.
#[async_trait]
pub trait IntentDetector: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(
        &self,
        utterance: &str,
        context: &ConversationContext,
    ) -> Result<Vec<Intent>, DetectError>;
}
