//! Confirmation rules keyed by risk level.
//!
//! Risk handling is data: one table maps each [`RiskLevel`] to the kind of
//! confirmation it needs, so no operation carries its own confirmation code.

use crate::config::SafetyConfig;
use chrono::{DateTime, Utc};
use courier_catalog::{OperationDescriptor, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const FALLBACK_PHRASE: &str = "CONFIRM";

const AFFIRMATIVE: &[&str] = &[
    "yes", "y", "yeah", "yep", "sure", "ok", "okay", "confirm", "confirmed", "go ahead", "do it",
    "proceed",
];
const NEGATIVE: &[&str] = &["no", "n", "nope", "don't", "dont", "do not", "no thanks"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationRule {
    /// Execute without asking.
    None,
    /// Ask yes/no when more items are affected than the threshold.
    YesNoAboveThreshold,
    /// Always ask, and only the exact phrase approves.
    ExactPhrase,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyDecision {
    Proceed,
    Confirm { required_phrase: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationVerdict {
    Approved,
    /// An explicit "no" to a yes/no question.
    Declined,
    /// Anything else; the request may be presented once more.
    Rejected,
}

/// An action waiting for explicit approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub operation: String,
    pub required_phrase: Option<String>,
    pub presented_summary: String,
    pub affected_count: usize,
    pub reversible: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub rejections: u32,
}

impl ConfirmationRequest {
    pub fn prompt(&self) -> String {
        match &self.required_phrase {
            Some(phrase) => format!("Type {phrase} exactly to continue, or reply cancel."),
            None => "Reply yes to continue or no to cancel.".to_string(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_turns: u32) -> bool {
        now >= self.expires_at || self.turns >= max_turns
    }
}

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    rules: HashMap<RiskLevel, ConfirmationRule>,
    confirmation_above: usize,
    timeout: chrono::Duration,
    max_turns: u32,
}

impl SafetyPolicy {
    pub fn standard(config: &SafetyConfig) -> Self {
        let rules = HashMap::from([
            (RiskLevel::Safe, ConfirmationRule::None),
            (RiskLevel::Reversible, ConfirmationRule::YesNoAboveThreshold),
            (RiskLevel::BulkCapable, ConfirmationRule::YesNoAboveThreshold),
            (RiskLevel::Irreversible, ConfirmationRule::ExactPhrase),
        ]);
        Self {
            rules,
            confirmation_above: config.confirmation_above,
            timeout: config.confirmation_timeout(),
            max_turns: config.confirmation_max_turns,
        }
    }

    pub fn rule_for(&self, risk: RiskLevel) -> ConfirmationRule {
        // Unlisted levels get the strictest rule.
        self.rules
            .get(&risk)
            .copied()
            .unwrap_or(ConfirmationRule::ExactPhrase)
    }

    pub fn always_confirms(&self, risk: RiskLevel) -> bool {
        self.rule_for(risk) == ConfirmationRule::ExactPhrase
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    pub fn threshold_for(&self, descriptor: &OperationDescriptor) -> usize {
        descriptor
            .requires_confirmation_above
            .min(self.confirmation_above)
    }

    pub fn evaluate(&self, descriptor: &OperationDescriptor, affected: usize) -> SafetyDecision {
        let decision = match self.rule_for(descriptor.risk_level) {
            ConfirmationRule::None => SafetyDecision::Proceed,
            ConfirmationRule::YesNoAboveThreshold => {
                if affected > self.threshold_for(descriptor) {
                    SafetyDecision::Confirm {
                        required_phrase: None,
                    }
                } else {
                    SafetyDecision::Proceed
                }
            }
            ConfirmationRule::ExactPhrase => SafetyDecision::Confirm {
                required_phrase: Some(
                    descriptor
                        .confirmation_phrase
                        .clone()
                        .unwrap_or_else(|| FALLBACK_PHRASE.to_string()),
                ),
            },
        };
        tracing::debug!(
            operation = %descriptor.name,
            risk = %descriptor.risk_level,
            affected,
            decision = ?decision,
            "safety decision"
        );
        decision
    }

    pub fn request(
        &self,
        descriptor: &OperationDescriptor,
        affected: usize,
        scope: &str,
        required_phrase: Option<String>,
        now: DateTime<Utc>,
    ) -> ConfirmationRequest {
        ConfirmationRequest {
            operation: descriptor.name.clone(),
            presented_summary: disclosure(descriptor, affected, scope),
            required_phrase,
            affected_count: affected,
            reversible: descriptor.risk_level.is_reversible(),
            created_at: now,
            expires_at: now + self.timeout,
            turns: 0,
            rejections: 0,
        }
    }

    pub fn judge(&self, request: &ConfirmationRequest, reply: &str) -> ConfirmationVerdict {
        match &request.required_phrase {
            // Case-sensitive; only surrounding whitespace is ignored.
            Some(phrase) => {
                if reply.trim() == phrase {
                    ConfirmationVerdict::Approved
                } else {
                    ConfirmationVerdict::Rejected
                }
            }
            None => {
                if is_affirmative(reply) {
                    ConfirmationVerdict::Approved
                } else if is_negative(reply) {
                    ConfirmationVerdict::Declined
                } else {
                    ConfirmationVerdict::Rejected
                }
            }
        }
    }
}

/// Operation, item count, reversibility, and for irreversible operations the
/// fact that nothing can be recovered.
fn disclosure(descriptor: &OperationDescriptor, affected: usize, scope: &str) -> String {
    let noun = if affected == 1 { "item" } else { "items" };
    let reversibility = if descriptor.risk_level.is_reversible() {
        "This can be undone later.".to_string()
    } else {
        format!(
            "This is irreversible: once {} runs, the affected {noun} cannot be recovered.",
            descriptor.name
        )
    };
    let scope = if scope.is_empty() {
        String::new()
    } else {
        format!(" ({scope})")
    };
    format!(
        "About to run {} on {affected} {noun}{scope}: {} {reversibility}",
        descriptor.name,
        descriptor.description.trim_end_matches('.').to_ascii_lowercase() + ".",
    )
}

fn normalize_reply(reply: &str) -> String {
    reply
        .trim()
        .trim_end_matches(['.', '!'])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

pub fn is_affirmative(reply: &str) -> bool {
    AFFIRMATIVE.contains(&normalize_reply(reply).as_str())
}

pub fn is_negative(reply: &str) -> bool {
    NEGATIVE.contains(&normalize_reply(reply).as_str())
}
