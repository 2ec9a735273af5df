//! In-memory mailbox catalog for local runs and tests.
//!
//! Every call is recorded in a call log, and faults can be scripted per
//! method/operation so callers can observe retries and zero-call guarantees.

use crate::descriptor::{OperationDescriptor, Parameters, validate_email_address};
use crate::error::{CatalogError, Result};
use crate::operations::{self, mail_operations};
use crate::traits::{
    EntityKind, EntityMatch, OperationCatalog, check_batch, find_descriptor, optional_string,
    require_string,
};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

const INBOX: &str = "INBOX";
const TRASH: &str = "TRASH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub from_name: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub labels: BTreeSet<String>,
    pub unread: bool,
}

impl MailMessage {
    pub fn new(id: &str, thread_id: &str, from_name: &str, from: &str, subject: &str) -> Self {
        Self {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            from: from.to_string(),
            from_name: from_name.to_string(),
            to: "me@example.com".to_string(),
            subject: subject.to_string(),
            body: format!("{subject}."),
            labels: BTreeSet::from([INBOX.to_string()]),
            unread: true,
        }
    }

    fn in_trash(&self) -> bool {
        self.labels.contains(TRASH)
    }

    fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "thread_id": self.thread_id,
            "from": format!("{} <{}>", self.from_name, self.from),
            "subject": self.subject,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftMessage {
    pub id: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMethod {
    Describe,
    Count,
    Lookup,
    Execute,
    ExecuteBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogCall {
    pub method: CallMethod,
    pub operation: Option<String>,
    pub items: usize,
}

#[derive(Debug, Clone)]
struct ScriptedFault {
    method: CallMethod,
    operation: Option<String>,
    /// Matching calls to let through before this fault fires.
    skip: usize,
    error: CatalogError,
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: BTreeMap<String, MailMessage>,
    drafts: BTreeMap<String, DraftMessage>,
    sent: Vec<DraftMessage>,
    calls: Vec<CatalogCall>,
    faults: VecDeque<ScriptedFault>,
    next_id: u64,
}

impl MailboxState {
    fn record(&mut self, method: CallMethod, operation: Option<&str>, items: usize) {
        self.calls.push(CatalogCall {
            method,
            operation: operation.map(str::to_string),
            items,
        });
    }

    fn take_fault(&mut self, method: CallMethod, operation: Option<&str>) -> Option<CatalogError> {
        let index = self.faults.iter().position(|fault| {
            fault.method == method
                && match (&fault.operation, operation) {
                    (None, _) => true,
                    (Some(expected), Some(actual)) => expected == actual,
                    (Some(_), None) => false,
                }
        })?;
        if self.faults[index].skip > 0 {
            self.faults[index].skip -= 1;
            return None;
        }
        self.faults.remove(index).map(|fault| fault.error)
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn matching(&self, filter: &str) -> Vec<&MailMessage> {
        let query = MailQuery::parse(filter);
        self.messages
            .values()
            .filter(|message| query.matches(message))
            .collect()
    }
}

pub struct MailboxCatalog {
    state: Mutex<MailboxState>,
    descriptors: Vec<OperationDescriptor>,
}

impl Default for MailboxCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            descriptors: mail_operations(),
        }
    }

    pub fn with_descriptors(mut self, descriptors: Vec<OperationDescriptor>) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn with_messages(self, messages: impl IntoIterator<Item = MailMessage>) -> Self {
        {
            let mut state = self.state();
            for message in messages {
                state.messages.insert(message.id.clone(), message);
            }
        }
        self
    }

    /// A small mailbox used by the `demo` catalog.
    pub fn demo() -> Self {
        let mut messages = Vec::new();
        for n in 1..=34 {
            messages.push(MailMessage::new(
                &format!("news-{n:02}"),
                &format!("t-news-{n:02}"),
                "Deals Weekly",
                "deals@newsletter.example",
                &format!("Deals of the week #{n}"),
            ));
        }
        messages.push(MailMessage::new(
            "m-101",
            "t-101",
            "John Smith",
            "john.smith@acme.example",
            "Quarterly numbers",
        ));
        messages.push(MailMessage::new(
            "m-102",
            "t-102",
            "John Doe",
            "john.doe@globex.example",
            "Lunch on Friday?",
        ));
        messages.push(MailMessage::new(
            "m-103",
            "t-103",
            "John Baker",
            "john.baker@initech.example",
            "Contract draft",
        ));
        messages.push(MailMessage::new(
            "m-104",
            "t-104",
            "Alice Moreau",
            "alice@example.com",
            "Trip itinerary",
        ));
        let mut reply = MailMessage::new(
            "m-105",
            "t-104",
            "Alice Moreau",
            "alice@example.com",
            "Re: Trip itinerary",
        );
        reply.unread = false;
        messages.push(reply);
        Self::new().with_messages(messages)
    }

    fn state(&self) -> MutexGuard<'_, MailboxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next matching call fail with `error`.
    pub fn fail_next(&self, method: CallMethod, operation: Option<&str>, error: CatalogError) {
        self.fail_later(method, operation, 0, error);
    }

    /// Lets `skip` matching calls succeed, then fails the next one with `error`.
    pub fn fail_later(
        &self,
        method: CallMethod,
        operation: Option<&str>,
        skip: usize,
        error: CatalogError,
    ) {
        self.state().faults.push_back(ScriptedFault {
            method,
            operation: operation.map(str::to_string),
            skip,
            error,
        });
    }

    pub fn calls(&self) -> Vec<CatalogCall> {
        self.state().calls.clone()
    }

    /// Calls that could have changed the mailbox.
    pub fn mutating_calls(&self) -> Vec<CatalogCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call.method, CallMethod::Execute | CallMethod::ExecuteBatch))
            .filter(|call| {
                call.operation.as_deref().is_some_and(|op| {
                    self.descriptors
                        .iter()
                        .find(|d| d.name == op)
                        .is_none_or(|d| d.risk_level.is_mutating())
                })
            })
            .cloned()
            .collect()
    }

    pub fn message(&self, id: &str) -> Option<MailMessage> {
        self.state().messages.get(id).cloned()
    }

    pub fn drafts(&self) -> Vec<DraftMessage> {
        self.state().drafts.values().cloned().collect()
    }

    pub fn sent(&self) -> Vec<DraftMessage> {
        self.state().sent.clone()
    }

    fn execute_one(
        &self,
        state: &mut MailboxState,
        operation: &str,
        params: &Parameters,
    ) -> Result<Value> {
        let descriptor = find_descriptor(&self.descriptors, operation)?;
        descriptor
            .parameter_schema
            .validate(params)
            .map_err(|e| CatalogError::InvalidParameters(e.to_string()))?;

        match operation {
            operations::SEARCH_MESSAGES => {
                let query = require_string(params, "query")?;
                let found: Vec<Value> = state
                    .matching(&query)
                    .into_iter()
                    .map(MailMessage::summary)
                    .collect();
                Ok(json!({ "query": query, "count": found.len(), "messages": found }))
            }
            operations::READ_MESSAGE => {
                let id = require_string(params, "message_id")?;
                let message = state
                    .messages
                    .get_mut(&id)
                    .ok_or_else(|| CatalogError::NotFound(format!("message {id}")))?;
                message.unread = false;
                Ok(json!({ "message": message }))
            }
            operations::ARCHIVE_MESSAGE
            | operations::TRASH_MESSAGE
            | operations::MARK_READ
            | operations::APPLY_LABEL => {
                let id = require_string(params, "message_id")?;
                let label = optional_string(params, "label")?;
                let message = state
                    .messages
                    .get_mut(&id)
                    .ok_or_else(|| CatalogError::NotFound(format!("message {id}")))?;
                apply_message_change(message, operation, label.as_deref());
                Ok(json!({ "status": "ok", "message_id": id }))
            }
            operations::ARCHIVE_THREAD | operations::TRASH_THREAD => {
                let thread_id = require_string(params, "thread_id")?;
                let mut touched = 0usize;
                for message in state.messages.values_mut() {
                    if message.thread_id == thread_id {
                        let per_message = if operation == operations::ARCHIVE_THREAD {
                            operations::ARCHIVE_MESSAGE
                        } else {
                            operations::TRASH_MESSAGE
                        };
                        apply_message_change(message, per_message, None);
                        touched += 1;
                    }
                }
                if touched == 0 {
                    return Err(CatalogError::NotFound(format!("thread {thread_id}")));
                }
                Ok(json!({ "status": "ok", "thread_id": thread_id, "messages": touched }))
            }
            operations::DELETE_FOREVER => {
                let id = require_string(params, "message_id")?;
                state
                    .messages
                    .remove(&id)
                    .ok_or_else(|| CatalogError::NotFound(format!("message {id}")))?;
                Ok(json!({ "status": "deleted", "message_id": id }))
            }
            operations::CREATE_DRAFT => {
                let draft = DraftMessage {
                    id: state.next_id("draft"),
                    to: require_string(params, "to")?,
                    subject: require_string(params, "subject")?,
                    body: require_string(params, "body")?,
                };
                let out = json!({ "status": "drafted", "draft_id": draft.id, "draft": draft });
                state.drafts.insert(draft.id.clone(), draft);
                Ok(out)
            }
            operations::UPDATE_DRAFT => {
                let id = require_string(params, "draft_id")?;
                let draft = state
                    .drafts
                    .get_mut(&id)
                    .ok_or_else(|| CatalogError::NotFound(format!("draft {id}")))?;
                draft.to = require_string(params, "to")?;
                draft.subject = require_string(params, "subject")?;
                draft.body = require_string(params, "body")?;
                Ok(json!({ "status": "updated", "draft_id": id, "draft": draft }))
            }
            operations::SEND_DRAFT => {
                let id = require_string(params, "draft_id")?;
                let draft = state
                    .drafts
                    .remove(&id)
                    .ok_or_else(|| CatalogError::NotFound(format!("draft {id}")))?;
                let message_id = state.next_id("sent");
                let out = json!({ "status": "sent", "message_id": message_id, "to": draft.to });
                state.sent.push(draft);
                Ok(out)
            }
            operations::SEND_EMAIL => {
                let to = require_string(params, "to")?;
                validate_email_address(&to).map_err(CatalogError::InvalidParameters)?;
                let message_id = state.next_id("sent");
                state.sent.push(DraftMessage {
                    id: message_id.clone(),
                    to: to.clone(),
                    subject: require_string(params, "subject")?,
                    body: require_string(params, "body")?,
                });
                Ok(json!({ "status": "sent", "message_id": message_id, "to": to }))
            }
            other => Err(CatalogError::UnknownOperation(other.to_string())),
        }
    }
}

fn apply_message_change(message: &mut MailMessage, operation: &str, label: Option<&str>) {
    match operation {
        operations::ARCHIVE_MESSAGE => {
            message.labels.remove(INBOX);
        }
        operations::TRASH_MESSAGE => {
            message.labels.remove(INBOX);
            message.labels.insert(TRASH.to_string());
        }
        operations::MARK_READ => message.unread = false,
        operations::APPLY_LABEL => {
            if let Some(label) = label {
                message.labels.insert(label.to_string());
            }
        }
        _ => {}
    }
}

#[async_trait]
impl OperationCatalog for MailboxCatalog {
    fn name(&self) -> &str {
        "mailbox"
    }

    async fn describe(&self) -> Result<Vec<OperationDescriptor>> {
        let mut state = self.state();
        state.record(CallMethod::Describe, None, 0);
        if let Some(err) = state.take_fault(CallMethod::Describe, None) {
            return Err(err);
        }
        Ok(self.descriptors.clone())
    }

    async fn count(&self, operation: &str, filter: &str) -> Result<usize> {
        let mut state = self.state();
        state.record(CallMethod::Count, Some(operation), 0);
        if let Some(err) = state.take_fault(CallMethod::Count, Some(operation)) {
            return Err(err);
        }
        find_descriptor(&self.descriptors, operation)?;
        Ok(state.matching(filter).len())
    }

    async fn lookup(
        &self,
        kind: EntityKind,
        query: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatch>> {
        let mut state = self.state();
        state.record(CallMethod::Lookup, None, 0);
        if let Some(err) = state.take_fault(CallMethod::Lookup, None) {
            return Err(err);
        }
        let needle = query.trim().to_ascii_lowercase();
        let matches = match kind {
            EntityKind::Contact => {
                let mut seen = BTreeMap::new();
                for message in state.messages.values() {
                    let name = message.from_name.to_ascii_lowercase();
                    let address = message.from.to_ascii_lowercase();
                    if name.contains(&needle) || address.contains(&needle) {
                        seen.entry(message.from.clone())
                            .or_insert_with(|| message.from_name.clone());
                    }
                }
                let mut contacts: Vec<EntityMatch> = seen
                    .into_iter()
                    .map(|(address, name)| EntityMatch {
                        kind: EntityKind::Contact,
                        display: format!("{name} <{address}>"),
                        id: address,
                        detail: None,
                    })
                    .collect();
                contacts.sort_by(|a, b| a.display.cmp(&b.display));
                contacts
            }
            EntityKind::Message => state
                .matching(query)
                .into_iter()
                .map(|message| EntityMatch {
                    kind: EntityKind::Message,
                    id: message.id.clone(),
                    display: message.subject.clone(),
                    detail: Some(message.from.clone()),
                })
                .collect(),
            EntityKind::Label => {
                let labels: BTreeSet<&String> = state
                    .messages
                    .values()
                    .flat_map(|message| message.labels.iter())
                    .filter(|label| label.to_ascii_lowercase().contains(&needle))
                    .collect();
                labels
                    .into_iter()
                    .map(|label| EntityMatch {
                        kind: EntityKind::Label,
                        id: label.clone(),
                        display: label.clone(),
                        detail: None,
                    })
                    .collect()
            }
        };
        Ok(matches.into_iter().take(limit).collect())
    }

    async fn execute(&self, operation: &str, parameters: &Parameters) -> Result<Value> {
        let mut state = self.state();
        state.record(CallMethod::Execute, Some(operation), 1);
        if let Some(err) = state.take_fault(CallMethod::Execute, Some(operation)) {
            return Err(err);
        }
        self.execute_one(&mut state, operation, parameters)
    }

    async fn execute_batch(
        &self,
        operation: &str,
        parameter_list: &[Parameters],
    ) -> Result<Vec<Result<Value>>> {
        let mut state = self.state();
        state.record(CallMethod::ExecuteBatch, Some(operation), parameter_list.len());
        if let Some(err) = state.take_fault(CallMethod::ExecuteBatch, Some(operation)) {
            return Err(err);
        }
        let descriptor = find_descriptor(&self.descriptors, operation)?;
        check_batch(descriptor, parameter_list.len())?;
        Ok(parameter_list
            .iter()
            .map(|params| self.execute_one(&mut state, operation, params))
            .collect())
    }
}

/// The subset of the mail query language the in-memory mailbox understands.
#[derive(Debug, Default)]
struct MailQuery {
    from: Vec<String>,
    to: Vec<String>,
    subject: Vec<String>,
    labels: Vec<String>,
    threads: Vec<String>,
    words: Vec<String>,
    unread: bool,
    inbox_only: bool,
    include_trash: bool,
}

impl MailQuery {
    fn parse(filter: &str) -> Self {
        let mut query = MailQuery::default();
        for token in filter.split_whitespace() {
            let token = token.to_ascii_lowercase();
            match token.split_once(':') {
                Some(("from", v)) => query.from.push(v.to_string()),
                Some(("to", v)) => query.to.push(v.to_string()),
                Some(("subject", v)) => query.subject.push(v.to_string()),
                Some(("label", v)) => query.labels.push(v.to_string()),
                Some(("thread", v)) => query.threads.push(v.to_string()),
                Some(("is", "unread")) => query.unread = true,
                Some(("in", "inbox")) => query.inbox_only = true,
                Some(("in", "trash")) => query.include_trash = true,
                _ => query.words.push(token),
            }
        }
        query
    }

    fn matches(&self, message: &MailMessage) -> bool {
        if message.in_trash() && !self.include_trash {
            return false;
        }
        if self.inbox_only && !message.labels.contains(INBOX) {
            return false;
        }
        if self.unread && !message.unread {
            return false;
        }
        let from = format!("{} {}", message.from_name, message.from).to_ascii_lowercase();
        let subject = message.subject.to_ascii_lowercase();
        let text = format!("{from} {subject} {}", message.body.to_ascii_lowercase());
        self.from.iter().all(|v| from.contains(v))
            && self.to.iter().all(|v| message.to.to_ascii_lowercase().contains(v))
            && self.subject.iter().all(|v| subject.contains(v))
            && self.labels.iter().all(|v| {
                message
                    .labels
                    .iter()
                    .any(|label| label.eq_ignore_ascii_case(v))
            })
            && self.threads.iter().all(|v| message.thread_id.eq_ignore_ascii_case(v))
            && self.words.iter().all(|v| text.contains(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().expect("object")
    }

    #[tokio::test]
    async fn count_matches_sender_filter_exactly() {
        let catalog = MailboxCatalog::demo();
        let n = catalog
            .count(operations::ARCHIVE_MESSAGE, "from:deals@newsletter.example")
            .await
            .expect("count");
        assert_eq!(n, 34);
    }

    #[tokio::test]
    async fn thread_filter_selects_one_thread() {
        let catalog = MailboxCatalog::new().with_messages([
            MailMessage::new("a-1", "t-A", "Ann", "ann@example.com", "Plans"),
            MailMessage::new("a-2", "t-A", "Bob", "bob@example.com", "Re: Plans"),
            MailMessage::new("b-1", "t-B", "Ann", "ann@example.com", "Other"),
        ]);
        let n = catalog
            .count(operations::ARCHIVE_THREAD, "thread:t-a")
            .await
            .expect("count");
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn contact_lookup_returns_every_distinct_sender() {
        let catalog = MailboxCatalog::demo();
        let johns = catalog
            .lookup(EntityKind::Contact, "john", 10)
            .await
            .expect("lookup");
        assert_eq!(johns.len(), 3);
        assert!(johns.iter().all(|m| m.display.contains("John")));
    }

    #[tokio::test]
    async fn trashed_messages_leave_default_queries() {
        let catalog = MailboxCatalog::demo();
        catalog
            .execute(
                operations::TRASH_MESSAGE,
                &params(json!({"message_id": "m-101"})),
            )
            .await
            .expect("trash");
        let n = catalog
            .count(operations::SEARCH_MESSAGES, "from:john.smith")
            .await
            .expect("count");
        assert_eq!(n, 0);
        let message = catalog.message("m-101").expect("still stored");
        assert!(message.labels.contains(TRASH));
    }

    #[tokio::test]
    async fn batch_larger_than_limit_is_rejected() {
        let catalog = MailboxCatalog::demo();
        let list: Vec<Parameters> = (1..=26)
            .map(|n| params(json!({"message_id": format!("news-{n:02}")})))
            .collect();
        let err = catalog
            .execute_batch(operations::ARCHIVE_MESSAGE, &list)
            .await
            .expect_err("batch too large");
        assert!(matches!(err, CatalogError::BatchTooLarge { max: 25, .. }));
    }

    #[tokio::test]
    async fn scripted_fault_fires_once_for_matching_operation() {
        let catalog = MailboxCatalog::demo();
        catalog.fail_next(
            CallMethod::Execute,
            Some(operations::MARK_READ),
            CatalogError::status(503, "unavailable"),
        );
        let p = params(json!({"message_id": "m-104"}));
        assert!(catalog.execute(operations::MARK_READ, &p).await.is_err());
        assert!(catalog.execute(operations::MARK_READ, &p).await.is_ok());
        assert_eq!(catalog.mutating_calls().len(), 2);
    }

    #[tokio::test]
    async fn delayed_fault_skips_earlier_calls() {
        let catalog = MailboxCatalog::demo();
        catalog.fail_later(
            CallMethod::Execute,
            Some(operations::MARK_READ),
            1,
            CatalogError::status(500, "boom"),
        );
        let p = params(json!({"message_id": "m-104"}));
        assert!(catalog.execute(operations::MARK_READ, &p).await.is_ok());
        assert!(catalog.execute(operations::MARK_READ, &p).await.is_err());
        assert!(catalog.execute(operations::MARK_READ, &p).await.is_ok());
    }

    #[tokio::test]
    async fn draft_then_send_moves_draft_to_sent() {
        let catalog = MailboxCatalog::new();
        let out = catalog
            .execute(
                operations::CREATE_DRAFT,
                &params(json!({"to": "bob@example.com", "subject": "Lunch", "body": "noon?"})),
            )
            .await
            .expect("draft");
        let draft_id = out["draft_id"].as_str().expect("draft id").to_string();
        catalog
            .execute(operations::SEND_DRAFT, &params(json!({"draft_id": draft_id})))
            .await
            .expect("send");
        assert!(catalog.drafts().is_empty());
        assert_eq!(catalog.sent().len(), 1);
    }
}
