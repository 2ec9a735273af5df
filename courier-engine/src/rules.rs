//! Rule-based intent detection.
//!
//! A fixed-priority table of `(predicate, category, binder)` rules. The first
//! rule whose predicate matches the command head wins; its binder extracts the
//! target and parameters and may emit several tied intents when the wording is
//! ambiguous.

use crate::intent::{
    AmbiguityKind, ContactRole, DetectError, Intent, IntentDetector, MatchClass, Target,
};
use crate::types::ConversationContext;
use async_trait::async_trait;
use courier_catalog::operations::{
    APPLY_LABEL, ARCHIVE_MESSAGE, ARCHIVE_THREAD, CREATE_DRAFT, DELETE_FOREVER, MARK_READ,
    READ_MESSAGE, SEARCH_MESSAGES, SEND_EMAIL, TRASH_MESSAGE, TRASH_THREAD,
};
use courier_catalog::{OperationCategory, OperationDescriptor, mail_operations};
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComposeMode {
    Draft,
    SendNow,
    Undecided,
}

#[derive(Debug, Clone, Copy)]
enum Binder {
    ExactOperation,
    Compose(ComposeMode),
    MessageAction {
        operation: &'static str,
        thread_operation: Option<&'static str>,
        destructive_ambiguity: bool,
        implied_operation: bool,
    },
    Label,
    Read,
    Search {
        implied_operation: bool,
    },
}

struct Rule {
    name: &'static str,
    predicate: Regex,
    category: OperationCategory,
    binder: Binder,
}

struct EntityPatterns {
    body: Regex,
    recipient: Regex,
    leading_verb_recipient: Regex,
    subject: Regex,
    sender: Regex,
    bulk_subject: Regex,
    quantifier: Regex,
    unread: Regex,
    inbox: Regex,
    thread_id: Regex,
    message_id: Regex,
    thread_reference: Regex,
    item_reference: Regex,
    bare_reference: Regex,
    label_as: Regex,
    label_to: Regex,
    search_terms: Regex,
    exact_args: Regex,
}

impl EntityPatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            body: Regex::new(r"(?i)\b(?:saying|that says|with body|body:)\s*(.+)$")?,
            recipient: Regex::new(r"(?i)\bto\s+([^\s,;]+)")?,
            leading_verb_recipient: Regex::new(
                r"(?i)^\s*(?:please\s+)?(?:email|write|message)\s+([^\s,;]+)",
            )?,
            subject: Regex::new(
                r"(?i)\b(?:about|subject:|re:)\s*(.+?)(?:\s+to\s+\S+)?\s*$",
            )?,
            sender: Regex::new(r"(?i)\bfrom\s+([^\s,;]+)")?,
            bulk_subject: Regex::new(r#"(?i)\b(?:about|subject)\s+["']?([\w-]+)"#)?,
            quantifier: Regex::new(r"(?i)\b(?:all|every|everything|emails|messages)\b")?,
            unread: Regex::new(r"(?i)\bunread\b")?,
            inbox: Regex::new(r"(?i)\bin\s+(?:the\s+|my\s+)?inbox\b")?,
            thread_id: Regex::new(r"(?i)\bthread\s*[:#]?\s*([a-z0-9][\w-]*\d[\w-]*)\b")?,
            message_id: Regex::new(
                r"(?i)\b(?:message|email|msg|id)\s*[:#]?\s*([a-z0-9][\w-]*\d[\w-]*)\b",
            )?,
            thread_reference: Regex::new(
                r"(?i)\b(?:this|that|the|whole)\s+(?:thread|conversation)\b",
            )?,
            item_reference: Regex::new(r"(?i)\b(?:this|that|the)\s+(?:email|message|mail|one)\b")?,
            bare_reference: Regex::new(r"(?i)\b(?:this|it|that)\b")?,
            label_as: Regex::new(r#"(?i)\bas\s+["']?([\w./-]+)["']?\s*$"#)?,
            label_to: Regex::new(
                r#"(?i)\b(?:label|tag)\s+["']?([\w./-]+)["']?\s+(?:to|on)\b"#,
            )?,
            search_terms: Regex::new(r"(?i)\b(?:for|about|containing)\s+(.+)$")?,
            exact_args: Regex::new(r#"(\w+)\s*[=:]\s*("[^"]*"|\S+)"#)?,
        })
    }
}

pub struct RuleBasedDetector {
    rules: Vec<Rule>,
    patterns: EntityPatterns,
    operations: Vec<OperationDescriptor>,
}

impl RuleBasedDetector {
    pub fn new() -> Result<Self, DetectError> {
        Self::with_operations(mail_operations())
    }

    /// Builds a detector whose exact-name rule recognises `operations`.
    pub fn with_operations(operations: Vec<OperationDescriptor>) -> Result<Self, DetectError> {
        let invalid = |e: regex::Error| DetectError::InvalidRule(e.to_string());
        let names = operations
            .iter()
            .map(|d| regex::escape(&d.name))
            .collect::<Vec<_>>()
            .join("|");
        let exact = format!(r"(?i)^\s*(?:{names})\b");

        let mut table: Vec<(&'static str, String, OperationCategory, Binder)> = vec![
            (
                "exact_operation",
                exact,
                OperationCategory::Search,
                Binder::ExactOperation,
            ),
            (
                "send_now",
                r"(?i)\bsend\b.*\b(?:now|immediately|right away)\b".to_string(),
                OperationCategory::Compose,
                Binder::Compose(ComposeMode::SendNow),
            ),
            (
                "draft",
                r"(?i)\bdraft\b".to_string(),
                OperationCategory::Compose,
                Binder::Compose(ComposeMode::Draft),
            ),
            (
                "send_or_draft",
                r"(?i)\b(?:send|write)\b|^\s*(?:please\s+)?email\s+\S".to_string(),
                OperationCategory::Compose,
                Binder::Compose(ComposeMode::Undecided),
            ),
            (
                "delete_forever",
                r"(?i)\b(?:permanently|forever|purge|for good)\b".to_string(),
                OperationCategory::Delete,
                Binder::MessageAction {
                    operation: DELETE_FOREVER,
                    thread_operation: None,
                    destructive_ambiguity: false,
                    implied_operation: false,
                },
            ),
            (
                "remove",
                r"(?i)\b(?:remove|get rid of|erase|wipe)\b".to_string(),
                OperationCategory::Delete,
                Binder::MessageAction {
                    operation: TRASH_MESSAGE,
                    thread_operation: Some(TRASH_THREAD),
                    destructive_ambiguity: true,
                    implied_operation: false,
                },
            ),
            (
                "trash",
                r"(?i)\b(?:delete|trash|bin)\b".to_string(),
                OperationCategory::Delete,
                Binder::MessageAction {
                    operation: TRASH_MESSAGE,
                    thread_operation: Some(TRASH_THREAD),
                    destructive_ambiguity: false,
                    implied_operation: false,
                },
            ),
            (
                "archive",
                r"(?i)\barchive\b".to_string(),
                OperationCategory::Organize,
                Binder::MessageAction {
                    operation: ARCHIVE_MESSAGE,
                    thread_operation: Some(ARCHIVE_THREAD),
                    destructive_ambiguity: false,
                    implied_operation: false,
                },
            ),
            (
                "mark_read",
                r"(?i)\bmark\b.*\bread\b".to_string(),
                OperationCategory::Organize,
                Binder::MessageAction {
                    operation: MARK_READ,
                    thread_operation: None,
                    destructive_ambiguity: false,
                    implied_operation: false,
                },
            ),
            (
                "label",
                r"(?i)\b(?:label|tag)\b".to_string(),
                OperationCategory::Organize,
                Binder::Label,
            ),
            (
                "read",
                r"(?i)\b(?:read|open)\b".to_string(),
                OperationCategory::Search,
                Binder::Read,
            ),
            (
                "search",
                r"(?i)\b(?:find|search|look for|show|list)\b".to_string(),
                OperationCategory::Search,
                Binder::Search {
                    implied_operation: false,
                },
            ),
            (
                "clean_up",
                r"(?i)\b(?:clean up|clear out|tidy(?: up)?)\b".to_string(),
                OperationCategory::Organize,
                Binder::MessageAction {
                    operation: ARCHIVE_MESSAGE,
                    thread_operation: Some(ARCHIVE_THREAD),
                    destructive_ambiguity: false,
                    implied_operation: true,
                },
            ),
            (
                "mail_mention",
                r"(?i)\b(?:emails?|inbox|mail|messages?)\b".to_string(),
                OperationCategory::Search,
                Binder::Search {
                    implied_operation: true,
                },
            ),
        ];

        if operations.is_empty() {
            table.retain(|(name, ..)| *name != "exact_operation");
        }

        let mut rules = Vec::with_capacity(table.len());
        for (name, pattern, category, binder) in table {
            rules.push(Rule {
                name,
                predicate: Regex::new(&pattern).map_err(invalid)?,
                category,
                binder,
            });
        }

        Ok(Self {
            rules,
            patterns: EntityPatterns::compile().map_err(invalid)?,
            operations,
        })
    }

    /// Synchronous detection used by the async trait impl.
    pub fn detect_now(&self, utterance: &str, context: &ConversationContext) -> Vec<Intent> {
        let text = utterance
            .trim()
            .trim_end_matches(['.', '!', '?'])
            .trim()
            .to_string();
        if text.is_empty() {
            return Vec::new();
        }
        let head = match self.patterns.body.find(&text) {
            Some(m) => text[..m.start()].trim_end().to_string(),
            None => text.clone(),
        };

        let Some(rule) = self.rules.iter().find(|rule| rule.predicate.is_match(&head)) else {
            tracing::debug!(utterance = %text, "no detection rule matched");
            return Vec::new();
        };
        tracing::debug!(rule = rule.name, "detection rule matched");

        match rule.binder {
            Binder::ExactOperation => self.bind_exact(&text),
            Binder::Compose(mode) => self.bind_compose(&text, &head, mode),
            Binder::MessageAction {
                operation,
                thread_operation,
                destructive_ambiguity,
                implied_operation,
            } => self.bind_message_action(
                &text,
                &head,
                context,
                rule.category,
                operation,
                thread_operation,
                destructive_ambiguity,
                implied_operation,
            ),
            Binder::Label => self.bind_label(&text, &head, context),
            Binder::Read => self.bind_read(&text, &head, context),
            Binder::Search { implied_operation } => {
                self.bind_search(&text, &head, implied_operation)
            }
        }
    }

    fn bind_exact(&self, text: &str) -> Vec<Intent> {
        let trimmed = text.trim_start();
        let name_end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        let name = trimmed[..name_end].to_ascii_lowercase();
        let Some(descriptor) = self.operations.iter().find(|d| d.name == name) else {
            return Vec::new();
        };

        let mut target = Target::None;
        let mut intent = Intent::new(
            descriptor.category,
            &descriptor.name,
            Target::None,
            MatchClass::ExactOperationName,
            text,
        );
        for caps in self.patterns.exact_args.captures_iter(&trimmed[name_end..]) {
            let key = caps[1].to_ascii_lowercase();
            let value = caps[2].trim_matches('"').to_string();
            match key.as_str() {
                "message_id" if descriptor.parameter_schema.accepts("message_id") => {
                    target = Target::Item {
                        id: value,
                        implied: false,
                    };
                }
                "thread_id" if descriptor.parameter_schema.accepts("thread_id") => {
                    target = Target::Thread {
                        id: value,
                        implied: false,
                    };
                }
                "filter" if descriptor.supports_batch() => {
                    target = Target::Filter { query: value };
                }
                _ => {
                    intent.entities.insert(key, Value::String(value));
                }
            }
        }
        intent.target = target;
        vec![intent]
    }

    fn bind_compose(&self, text: &str, head: &str, mode: ComposeMode) -> Vec<Intent> {
        let p = &self.patterns;
        let recipient = p
            .leading_verb_recipient
            .captures(head)
            .map(|c| clean_token(&c[1]))
            .filter(|t| !matches!(t.to_ascii_lowercase().as_str(), "a" | "an" | "the" | "to"))
            .or_else(|| p.recipient.captures(head).map(|c| clean_token(&c[1])));

        let mut entities = courier_catalog::Parameters::new();
        let target = match recipient {
            Some(token) if token.contains('@') => {
                entities.insert("to".to_string(), Value::String(token));
                Target::None
            }
            Some(name) => Target::Contact {
                name,
                role: ContactRole::Recipient,
                extra_filter: String::new(),
            },
            None => Target::None,
        };
        if let Some(c) = p.subject.captures(head) {
            let subject = c[1].trim().to_string();
            if !subject.is_empty() {
                entities.insert("subject".to_string(), Value::String(subject));
            }
        }
        if let Some(c) = p.body.captures(text) {
            let body = c[1].trim().to_string();
            if !body.is_empty() {
                entities.insert("body".to_string(), Value::String(body));
            }
        }

        let has_recipient = entities.contains_key("to") || matches!(target, Target::Contact { .. });
        let class = if has_recipient {
            MatchClass::ExplicitOperationExplicitTarget
        } else {
            MatchClass::ExplicitOperationImpliedTarget
        };
        let build = |operation: &str| {
            let mut intent = Intent::new(
                OperationCategory::Compose,
                operation,
                target.clone(),
                class,
                text,
            );
            intent.entities = entities.clone();
            intent
        };
        match mode {
            ComposeMode::Draft => vec![build(CREATE_DRAFT)],
            ComposeMode::SendNow => vec![build(SEND_EMAIL)],
            ComposeMode::Undecided => vec![
                build(CREATE_DRAFT).with_ambiguity(AmbiguityKind::SendNowOrDraft),
                build(SEND_EMAIL).with_ambiguity(AmbiguityKind::SendNowOrDraft),
            ],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_message_action(
        &self,
        text: &str,
        head: &str,
        context: &ConversationContext,
        category: OperationCategory,
        operation: &'static str,
        thread_operation: Option<&'static str>,
        destructive_ambiguity: bool,
        implied_operation: bool,
    ) -> Vec<Intent> {
        let resolution = self.resolve_target(head, context, thread_operation.is_some());
        let class = match_class(implied_operation, resolution.explicit);

        let mut intents = Vec::new();
        for target in &resolution.targets {
            let is_thread = matches!(target, Target::Thread { .. });
            let op = match (is_thread, thread_operation) {
                (true, Some(thread_op)) => thread_op,
                _ => operation,
            };
            let mut intent = Intent::new(category, op, target.clone(), class, text);
            intent.missing_context = resolution.missing_context;
            intents.push(intent);
            if destructive_ambiguity && !is_thread {
                let mut forever = Intent::new(
                    OperationCategory::Delete,
                    DELETE_FOREVER,
                    target.clone(),
                    class,
                    text,
                );
                forever.missing_context = resolution.missing_context;
                intents.push(forever);
            }
        }

        let ambiguity = if destructive_ambiguity && intents.len() > 1 {
            Some(AmbiguityKind::DestructiveScope)
        } else if resolution.targets.len() > 1 {
            Some(AmbiguityKind::SingleOrThread)
        } else {
            None
        };
        if let Some(kind) = ambiguity {
            for intent in &mut intents {
                intent.ambiguity = Some(kind);
            }
        }
        intents
    }

    fn bind_label(&self, text: &str, head: &str, context: &ConversationContext) -> Vec<Intent> {
        let p = &self.patterns;
        let label = p
            .label_to
            .captures(head)
            .or_else(|| p.label_as.captures(head))
            .map(|c| clean_token(&c[1]));
        // "as receipts" is not part of the target description.
        let target_text = match p.label_as.find(head) {
            Some(m) => &head[..m.start()],
            None => head,
        };
        let resolution = self.resolve_target(target_text, context, false);
        let class = match_class(false, resolution.explicit);
        resolution
            .targets
            .into_iter()
            .map(|target| {
                let mut intent =
                    Intent::new(OperationCategory::Organize, APPLY_LABEL, target, class, text);
                intent.missing_context = resolution.missing_context;
                if let Some(label) = &label {
                    intent = intent.with_entity("label", label.clone());
                }
                intent
            })
            .collect()
    }

    fn bind_read(&self, text: &str, head: &str, context: &ConversationContext) -> Vec<Intent> {
        let resolution = self.resolve_target(head, context, false);
        let class = match_class(false, resolution.explicit);
        resolution
            .targets
            .into_iter()
            .map(|target| match target {
                // Reading many messages is a search.
                Target::Filter { query } => Intent::new(
                    OperationCategory::Search,
                    SEARCH_MESSAGES,
                    Target::None,
                    class,
                    text,
                )
                .with_entity("query", query),
                contact @ Target::Contact { .. } => Intent::new(
                    OperationCategory::Search,
                    SEARCH_MESSAGES,
                    contact,
                    class,
                    text,
                ),
                target => {
                    let mut intent =
                        Intent::new(OperationCategory::Search, READ_MESSAGE, target, class, text);
                    intent.missing_context = resolution.missing_context;
                    intent
                }
            })
            .collect()
    }

    fn bind_search(&self, text: &str, head: &str, implied_operation: bool) -> Vec<Intent> {
        let filter = self.bulk_filter(head);
        let (target, query) = match filter {
            Some(Target::Filter { query }) => (Target::None, Some(query)),
            Some(contact @ Target::Contact { .. }) => (contact, None),
            _ => {
                let terms = self
                    .patterns
                    .search_terms
                    .captures(head)
                    .map(|c| c[1].trim().to_string())
                    .filter(|s| !s.is_empty());
                (Target::None, terms)
            }
        };
        let explicit = query.is_some() || matches!(target, Target::Contact { .. });
        let class = match_class(implied_operation, explicit);
        let mut intent = Intent::new(OperationCategory::Search, SEARCH_MESSAGES, target, class, text);
        if let Some(query) = query {
            intent = intent.with_entity("query", query);
        }
        vec![intent]
    }

    fn bulk_filter(&self, head: &str) -> Option<Target> {
        let p = &self.patterns;
        let mut extra = Vec::new();
        if p.unread.is_match(head) {
            extra.push("is:unread".to_string());
        }
        if p.inbox.is_match(head) {
            extra.push("in:inbox".to_string());
        }
        if let Some(c) = p.bulk_subject.captures(head) {
            extra.push(format!("subject:{}", &c[1]));
        }
        let extra_filter = extra.join(" ");

        if let Some(c) = p.sender.captures(head) {
            let sender = clean_token(&c[1]);
            if sender.contains('@') || sender.contains('.') {
                let query = if extra_filter.is_empty() {
                    format!("from:{sender}")
                } else {
                    format!("from:{sender} {extra_filter}")
                };
                return Some(Target::Filter { query });
            }
            return Some(Target::Contact {
                name: sender,
                role: ContactRole::Sender,
                extra_filter,
            });
        }
        if !extra_filter.is_empty() {
            return Some(Target::Filter {
                query: extra_filter,
            });
        }
        if p.quantifier.is_match(head) && !p.bare_reference.is_match(head) {
            return Some(Target::Filter {
                query: "in:inbox".to_string(),
            });
        }
        None
    }

    fn resolve_target(
        &self,
        head: &str,
        context: &ConversationContext,
        thread_capable: bool,
    ) -> TargetResolution {
        let p = &self.patterns;
        if let Some(c) = p.thread_id.captures(head) {
            if thread_capable {
                return TargetResolution::explicit(Target::Thread {
                    id: c[1].to_string(),
                    implied: false,
                });
            }
        }
        if let Some(c) = p.message_id.captures(head) {
            return TargetResolution::explicit(Target::Item {
                id: c[1].to_string(),
                implied: false,
            });
        }
        if let Some(filter) = self.bulk_filter(head) {
            return TargetResolution::explicit(filter);
        }

        let item = context.last_referenced_item_id.as_deref();
        let thread = context
            .last_thread_or_group_id
            .as_deref()
            .filter(|_| thread_capable);
        let implied_item = |id: &str| Target::Item {
            id: id.to_string(),
            implied: true,
        };
        let implied_thread = |id: &str| Target::Thread {
            id: id.to_string(),
            implied: true,
        };

        if p.thread_reference.is_match(head) && thread_capable {
            return match thread {
                Some(id) => TargetResolution::implied(vec![implied_thread(id)]),
                None => TargetResolution::missing(),
            };
        }
        if p.item_reference.is_match(head) {
            return match item {
                Some(id) => TargetResolution::implied(vec![implied_item(id)]),
                None => TargetResolution::missing(),
            };
        }
        if p.bare_reference.is_match(head) {
            return match (item, thread) {
                (Some(i), Some(t)) => {
                    TargetResolution::implied(vec![implied_item(i), implied_thread(t)])
                }
                (Some(i), None) => TargetResolution::implied(vec![implied_item(i)]),
                (None, Some(t)) => TargetResolution::implied(vec![implied_thread(t)]),
                (None, None) => TargetResolution::missing(),
            };
        }
        TargetResolution::missing()
    }
}

struct TargetResolution {
    targets: Vec<Target>,
    explicit: bool,
    missing_context: bool,
}

impl TargetResolution {
    fn explicit(target: Target) -> Self {
        Self {
            targets: vec![target],
            explicit: true,
            missing_context: false,
        }
    }

    fn implied(targets: Vec<Target>) -> Self {
        Self {
            targets,
            explicit: false,
            missing_context: false,
        }
    }

    fn missing() -> Self {
        Self {
            targets: vec![Target::None],
            explicit: false,
            missing_context: true,
        }
    }
}

fn match_class(implied_operation: bool, explicit_target: bool) -> MatchClass {
    match (implied_operation, explicit_target) {
        (false, true) => MatchClass::ExplicitOperationExplicitTarget,
        (false, false) => MatchClass::ExplicitOperationImpliedTarget,
        (true, true) => MatchClass::ImpliedOperationExplicitTarget,
        (true, false) => MatchClass::Fuzzy,
    }
}

fn clean_token(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | ',' | '.' | ';' | ':' | '<' | '>'))
        .to_string()
}

#[async_trait]
impl IntentDetector for RuleBasedDetector {
    fn name(&self) -> &str {
        "rules"
    }

    async fn detect(
        &self,
        utterance: &str,
        context: &ConversationContext,
    ) -> Result<Vec<Intent>, DetectError> {
        Ok(self.detect_now(utterance, context))
    }
}
