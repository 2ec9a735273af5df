//! Routing: from ranked intents to one operation, a clarification, or no match.

use crate::config::RoutingConfig;
use crate::intent::{AmbiguityKind, Intent, Target};
use crate::safety::SafetyPolicy;
use courier_catalog::{OperationDescriptor, Parameters, SchemaViolation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStatus {
    Direct,
    NeedsClarification,
    NeedsConfirmation,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub status: RoutingStatus,
    pub selected: Option<Intent>,
    pub bound_parameters: Parameters,
    /// Items the operation touches: 1 for a single target, `None` for bulk
    /// targets until a count query has run.
    pub candidate_count: Option<usize>,
    /// Candidates offered when the status is `NeedsClarification`.
    pub options: Vec<Intent>,
    pub ambiguity: Option<AmbiguityKind>,
}

impl RoutingDecision {
    fn no_match() -> Self {
        Self {
            status: RoutingStatus::NoMatch,
            selected: None,
            bound_parameters: Parameters::new(),
            candidate_count: None,
            options: Vec::new(),
            ambiguity: None,
        }
    }

    pub fn selected_operation(&self) -> Option<&str> {
        self.selected.as_ref().and_then(Intent::primary_operation)
    }
}

/// Operation descriptors indexed by name.
pub type DescriptorMap = HashMap<String, OperationDescriptor>;

pub fn index_descriptors(descriptors: Vec<OperationDescriptor>) -> DescriptorMap {
    descriptors.into_iter().map(|d| (d.name.clone(), d)).collect()
}

/// Extracted entities plus the id parameter implied by the target.
pub fn bind_parameters(intent: &Intent, descriptor: &OperationDescriptor) -> Parameters {
    let mut params = intent.entities.clone();
    let schema = &descriptor.parameter_schema;
    match &intent.target {
        Target::Item { id, .. } if schema.accepts("message_id") => {
            params.insert("message_id".to_string(), id.clone().into());
        }
        Target::Thread { id, .. } if schema.accepts("thread_id") => {
            params.insert("thread_id".to_string(), id.clone().into());
        }
        _ => {}
    }
    params
}

#[derive(Clone)]
pub struct RoutingEngine {
    thresholds: RoutingConfig,
    descriptors: Arc<DescriptorMap>,
    policy: SafetyPolicy,
}

impl RoutingEngine {
    pub fn new(thresholds: RoutingConfig, descriptors: Arc<DescriptorMap>, policy: SafetyPolicy) -> Self {
        Self {
            thresholds,
            descriptors,
            policy,
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(candidates = intents.len()))]
    pub fn route(&self, intents: Vec<Intent>) -> RoutingDecision {
        let mut valid: Vec<Intent> = intents
            .into_iter()
            .filter_map(|intent| self.keep_valid(intent))
            .collect();
        valid.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let Some(top) = valid.first().map(|i| i.confidence) else {
            tracing::info!(status = "no_match", "no routable intent");
            return RoutingDecision::no_match();
        };
        if top < self.thresholds.low_threshold {
            tracing::info!(status = "no_match", top_confidence = top, "below low threshold");
            return RoutingDecision::no_match();
        }

        if top >= self.thresholds.high_threshold {
            let above: Vec<Intent> = valid
                .into_iter()
                .filter(|i| i.confidence >= self.thresholds.high_threshold)
                .collect();
            if above.len() == 1 {
                let Some(intent) = above.into_iter().next() else {
                    return RoutingDecision::no_match();
                };
                return self.decide(intent);
            }
            return self.clarify(above);
        }

        // Medium band is ambiguous, low band is fuzzy; both ask.
        let options: Vec<Intent> = valid
            .into_iter()
            .filter(|i| i.confidence >= self.thresholds.low_threshold)
            .collect();
        self.clarify(options)
    }

    /// Routes a single intent that is already known to be what the user wants.
    pub fn decide(&self, intent: Intent) -> RoutingDecision {
        let Some(descriptor) = intent
            .primary_operation()
            .and_then(|op| self.descriptors.get(op))
        else {
            return RoutingDecision::no_match();
        };
        let status = if self.policy.always_confirms(descriptor.risk_level) {
            RoutingStatus::NeedsConfirmation
        } else {
            RoutingStatus::Direct
        };
        // Bulk filters and threads are counted against the catalog later.
        let counted_later =
            intent.target.is_bulk() || matches!(intent.target, Target::Thread { .. });
        let candidate_count = if counted_later { None } else { Some(1) };
        tracing::info!(
            operation = %descriptor.name,
            status = ?status,
            confidence = intent.confidence,
            "routed"
        );
        RoutingDecision {
            status,
            bound_parameters: bind_parameters(&intent, descriptor),
            selected: Some(intent),
            candidate_count,
            options: Vec::new(),
            ambiguity: None,
        }
    }

    fn clarify(&self, options: Vec<Intent>) -> RoutingDecision {
        let ambiguity = options.iter().find_map(|i| i.ambiguity);
        tracing::info!(
            status = "needs_clarification",
            options = options.len(),
            ambiguity = ?ambiguity,
            "routing needs clarification"
        );
        RoutingDecision {
            status: RoutingStatus::NeedsClarification,
            selected: None,
            bound_parameters: Parameters::new(),
            candidate_count: None,
            options,
            ambiguity,
        }
    }

    /// Drops candidates the catalog cannot run: unknown operations, or
    /// entities the operation does not accept. Missing or malformed values
    /// survive so the user can be asked about them.
    fn keep_valid(&self, mut intent: Intent) -> Option<Intent> {
        intent
            .operation_candidates
            .retain(|op| self.descriptors.contains_key(op));
        let descriptor = self.descriptors.get(intent.primary_operation()?)?;
        match descriptor
            .parameter_schema
            .validate(&bind_parameters(&intent, descriptor))
        {
            Err(SchemaViolation::Unknown { field }) => {
                tracing::debug!(
                    operation = %descriptor.name,
                    field = %field,
                    "dropping intent with unsupported parameter"
                );
                None
            }
            _ => Some(intent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::intent::MatchClass;
    use courier_catalog::{OperationCategory, mail_operations, operations};

    fn engine() -> RoutingEngine {
        RoutingEngine::new(
            RoutingConfig::default(),
            Arc::new(index_descriptors(mail_operations())),
            SafetyPolicy::standard(&SafetyConfig::default()),
        )
    }

    fn item_intent(op: &str, class: MatchClass) -> Intent {
        Intent::new(
            OperationCategory::Delete,
            op,
            Target::Item {
                id: "m-1".to_string(),
                implied: true,
            },
            class,
            "test",
        )
    }

    #[test]
    fn single_high_confidence_reversible_routes_directly() {
        let d = engine().route(vec![item_intent(
            operations::TRASH_MESSAGE,
            MatchClass::ExplicitOperationImpliedTarget,
        )]);
        assert_eq!(d.status, RoutingStatus::Direct);
        assert_eq!(d.selected_operation(), Some(operations::TRASH_MESSAGE));
        assert_eq!(d.bound_parameters["message_id"], "m-1");
        assert_eq!(d.candidate_count, Some(1));
    }

    #[test]
    fn irreversible_never_routes_directly() {
        let d = engine().route(vec![item_intent(
            operations::DELETE_FOREVER,
            MatchClass::ExactOperationName,
        )]);
        assert_eq!(d.status, RoutingStatus::NeedsConfirmation);
    }

    #[test]
    fn ties_above_threshold_ask() {
        let d = engine().route(vec![
            item_intent(
                operations::TRASH_MESSAGE,
                MatchClass::ExplicitOperationImpliedTarget,
            )
            .with_ambiguity(AmbiguityKind::DestructiveScope),
            item_intent(
                operations::DELETE_FOREVER,
                MatchClass::ExplicitOperationImpliedTarget,
            )
            .with_ambiguity(AmbiguityKind::DestructiveScope),
        ]);
        assert_eq!(d.status, RoutingStatus::NeedsClarification);
        assert_eq!(d.options.len(), 2);
        assert_eq!(d.ambiguity, Some(AmbiguityKind::DestructiveScope));
    }

    #[test]
    fn medium_and_fuzzy_confidence_ask() {
        for class in [MatchClass::ImpliedOperationExplicitTarget, MatchClass::Fuzzy] {
            let d = engine().route(vec![item_intent(operations::ARCHIVE_MESSAGE, class)]);
            assert_eq!(d.status, RoutingStatus::NeedsClarification, "{class:?}");
            assert_eq!(d.options.len(), 1);
        }
    }

    #[test]
    fn below_low_threshold_is_no_match() {
        let mut intent = item_intent(operations::ARCHIVE_MESSAGE, MatchClass::Fuzzy);
        intent.confidence = 0.2;
        assert_eq!(engine().route(vec![intent]).status, RoutingStatus::NoMatch);
        assert_eq!(engine().route(Vec::new()).status, RoutingStatus::NoMatch);
    }

    #[test]
    fn unknown_operations_and_parameters_are_filtered() {
        let unknown = item_intent("shred_message", MatchClass::ExactOperationName);
        let bad_param = item_intent(
            operations::ARCHIVE_MESSAGE,
            MatchClass::ExplicitOperationExplicitTarget,
        )
        .with_entity("color", "red");
        let d = engine().route(vec![unknown, bad_param]);
        assert_eq!(d.status, RoutingStatus::NoMatch);
    }

    #[test]
    fn bulk_target_leaves_count_unknown() {
        let intent = Intent::new(
            OperationCategory::Organize,
            operations::ARCHIVE_MESSAGE,
            Target::Filter {
                query: "from:x@example.com".to_string(),
            },
            MatchClass::ExplicitOperationExplicitTarget,
            "archive all emails from x@example.com",
        );
        let d = engine().route(vec![intent]);
        assert_eq!(d.status, RoutingStatus::Direct);
        assert_eq!(d.candidate_count, None);
    }
}
