use crate::descriptor::{OperationDescriptor, Parameters, validate_email_address};
use crate::error::{CatalogError, Result};
use crate::operations::{self, mail_operations};
use crate::rate_limit::RateLimiter;
use crate::traits::{
    EntityKind, EntityMatch, OperationCatalog, check_batch, find_descriptor, require_string,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Url;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const COUNT_PAGE_SIZE: usize = 500;
const SEARCH_PAGE_SIZE: usize = 50;
const MAX_COUNT_PAGES: usize = 40;

/// Gmail REST backend. Counts are exact: they page through `messages.list`
/// rather than trusting `resultSizeEstimate`.
#[derive(Clone)]
pub struct GmailCatalog {
    http: reqwest::Client,
    access_token: String,
    base_url: String,
    descriptors: Vec<OperationDescriptor>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GmailCatalog {
    pub fn new(access_token: &str, request_timeout: Duration) -> Result<Self> {
        let token = access_token.trim();
        if token.is_empty() {
            return Err(CatalogError::InvalidParameters(
                "gmail access token is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CatalogError::Network(e.to_string()))?;
        Ok(Self {
            http,
            access_token: token.to_string(),
            base_url: GMAIL_API_BASE.to_string(),
            descriptors: mail_operations(),
            limiter: None,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Charges every HTTP request against `limiter`, including each item
    /// of a batch that has no native batch endpoint.
    pub fn with_rate_limit(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{path}", self.base_url))
            .map_err(|e| CatalogError::Network(e.to_string()))
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        let resp = req.bearer_auth(&self.access_token).send().await?;
        check_status(resp, what).await
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        Ok(self.send(req, what).await?.json().await?)
    }

    async fn send_empty(&self, req: reqwest::RequestBuilder, what: &str) -> Result<()> {
        self.send(req, what).await?;
        Ok(())
    }

    async fn list_page(
        &self,
        query: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<GmailListMessagesResponse> {
        let max_results = max_results.to_string();
        let mut req = self
            .http
            .get(self.api_url("messages")?)
            .query(&[("maxResults", max_results.as_str())]);
        let query = query.trim();
        if !query.is_empty() {
            req = req.query(&[("q", query)]);
        }
        if let Some(token) = page_token {
            req = req.query(&[("pageToken", token)]);
        }
        self.send_json(req, "list messages").await
    }

    /// Ids of up to `limit` messages matching `query`, following
    /// `nextPageToken` across pages.
    async fn list_ids(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        while ids.len() < limit {
            let want = (limit - ids.len()).min(COUNT_PAGE_SIZE);
            let page = self.list_page(query, want, page_token.as_deref()).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id).take(limit - ids.len()));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(ids)
    }

    async fn get_message_metadata(&self, message_id: &str) -> Result<GmailMessageMetadata> {
        let url = self.api_url(&format!("messages/{message_id}"))?;
        let req = self.http.get(url).query(&[
            ("format", "metadata"),
            ("metadataHeaders", "From"),
            ("metadataHeaders", "To"),
            ("metadataHeaders", "Subject"),
            ("metadataHeaders", "Date"),
        ]);
        let payload: GmailMessage = self.send_json(req, "get message").await?;
        Ok(GmailMessageMetadata {
            message_id: payload.id.clone(),
            thread_id: payload.thread_id.clone(),
            label_ids: payload.label_ids.clone(),
            from: payload
                .header_value("From")
                .unwrap_or_else(|| "(missing)".to_string()),
            to: payload
                .header_value("To")
                .unwrap_or_else(|| "(missing)".to_string()),
            subject: payload
                .header_value("Subject")
                .unwrap_or_else(|| "(no subject)".to_string()),
            date: payload
                .header_value("Date")
                .unwrap_or_else(|| "(missing)".to_string()),
            snippet: payload.snippet.unwrap_or_default(),
        })
    }

    async fn fetch_labels(&self) -> Result<Vec<GmailLabel>> {
        let req = self.http.get(self.api_url("labels")?);
        let mut payload: GmailListLabelsResponse = self.send_json(req, "list labels").await?;
        payload.labels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(payload.labels)
    }

    async fn resolve_label_id(&self, reference: &str) -> Result<String> {
        let labels = self.fetch_labels().await?;
        let wanted = normalize_for_compare(reference);
        labels
            .iter()
            .find(|label| label.id.eq_ignore_ascii_case(reference))
            .or_else(|| {
                labels
                    .iter()
                    .find(|label| normalize_for_compare(&label.name) == wanted)
            })
            .map(|label| label.id.clone())
            .ok_or_else(|| CatalogError::NotFound(format!("label {reference:?}")))
    }

    async fn modify_message(
        &self,
        message_id: &str,
        add: &[String],
        remove: &[&str],
    ) -> Result<Value> {
        let url = self.api_url(&format!("messages/{message_id}/modify"))?;
        let req = self
            .http
            .post(url)
            .json(&json!({ "addLabelIds": add, "removeLabelIds": remove }));
        self.send_empty(req, "modify message").await?;
        Ok(json!({ "status": "ok", "message_id": message_id }))
    }

    async fn batch_modify(&self, ids: &[String], add: &[String], remove: &[&str]) -> Result<()> {
        let req = self.http.post(self.api_url("messages/batchModify")?).json(
            &json!({ "ids": ids, "addLabelIds": add, "removeLabelIds": remove }),
        );
        self.send_empty(req, "batch modify").await
    }

    async fn put_draft(&self, draft_id: Option<&str>, params: &Parameters) -> Result<Value> {
        let to = require_string(params, "to")?;
        let subject = require_string(params, "subject")?;
        let body = require_string(params, "body")?;
        let raw = URL_SAFE_NO_PAD.encode(build_mime_message(&to, &subject, &body).as_bytes());
        let payload = json!({ "message": { "raw": raw } });
        let draft: GmailDraft = match draft_id {
            Some(id) => {
                let req = self
                    .http
                    .put(self.api_url(&format!("drafts/{id}"))?)
                    .json(&payload);
                self.send_json(req, "update draft").await?
            }
            None => {
                let req = self.http.post(self.api_url("drafts")?).json(&payload);
                self.send_json(req, "create draft").await?
            }
        };
        let status = if draft_id.is_some() { "updated" } else { "drafted" };
        Ok(json!({
            "status": status,
            "draft_id": draft.id,
            "draft": { "to": to, "subject": subject, "body": body },
        }))
    }

    async fn execute_one(&self, operation: &str, params: &Parameters) -> Result<Value> {
        match operation {
            operations::SEARCH_MESSAGES => {
                let query = require_string(params, "query")?;
                let page = self.list_page(&query, SEARCH_PAGE_SIZE, None).await?;
                let mut messages = Vec::with_capacity(page.messages.len());
                for msg in page.messages {
                    messages.push(self.get_message_metadata(&msg.id).await?);
                }
                Ok(json!({ "query": query, "count": messages.len(), "messages": messages }))
            }
            operations::READ_MESSAGE => {
                let id = require_string(params, "message_id")?;
                let metadata = self.get_message_metadata(&id).await?;
                Ok(json!({ "message": metadata }))
            }
            operations::ARCHIVE_MESSAGE => {
                let id = require_string(params, "message_id")?;
                self.modify_message(&id, &[], &["INBOX"]).await
            }
            operations::MARK_READ => {
                let id = require_string(params, "message_id")?;
                self.modify_message(&id, &[], &["UNREAD"]).await
            }
            operations::APPLY_LABEL => {
                let id = require_string(params, "message_id")?;
                let label = require_string(params, "label")?;
                let label_id = self.resolve_label_id(&label).await?;
                self.modify_message(&id, &[label_id], &[]).await
            }
            operations::TRASH_MESSAGE => {
                let id = require_string(params, "message_id")?;
                let req = self.http.post(self.api_url(&format!("messages/{id}/trash"))?);
                self.send_empty(req, "trash message").await?;
                Ok(json!({ "status": "ok", "message_id": id }))
            }
            operations::DELETE_FOREVER => {
                let id = require_string(params, "message_id")?;
                let req = self.http.delete(self.api_url(&format!("messages/{id}"))?);
                self.send_empty(req, "delete message").await?;
                Ok(json!({ "status": "deleted", "message_id": id }))
            }
            operations::ARCHIVE_THREAD => {
                let id = require_string(params, "thread_id")?;
                let req = self
                    .http
                    .post(self.api_url(&format!("threads/{id}/modify"))?)
                    .json(&json!({ "removeLabelIds": ["INBOX"] }));
                self.send_empty(req, "archive thread").await?;
                Ok(json!({ "status": "ok", "thread_id": id }))
            }
            operations::TRASH_THREAD => {
                let id = require_string(params, "thread_id")?;
                let req = self.http.post(self.api_url(&format!("threads/{id}/trash"))?);
                self.send_empty(req, "trash thread").await?;
                Ok(json!({ "status": "ok", "thread_id": id }))
            }
            operations::CREATE_DRAFT => self.put_draft(None, params).await,
            operations::UPDATE_DRAFT => {
                let id = require_string(params, "draft_id")?;
                self.put_draft(Some(&id), params).await
            }
            operations::SEND_DRAFT => {
                let id = require_string(params, "draft_id")?;
                let req = self
                    .http
                    .post(self.api_url("drafts/send")?)
                    .json(&json!({ "id": id }));
                let sent: GmailSendResponse = self.send_json(req, "send draft").await?;
                Ok(json!({ "status": "sent", "message_id": sent.id, "thread_id": sent.thread_id }))
            }
            operations::SEND_EMAIL => {
                let to = require_string(params, "to")?;
                let subject = require_string(params, "subject")?;
                let body = require_string(params, "body")?;
                validate_email_address(&to).map_err(CatalogError::InvalidParameters)?;
                let raw =
                    URL_SAFE_NO_PAD.encode(build_mime_message(&to, &subject, &body).as_bytes());
                let req = self
                    .http
                    .post(self.api_url("messages/send")?)
                    .json(&json!({ "raw": raw }));
                let sent: GmailSendResponse = self.send_json(req, "send message").await?;
                Ok(json!({
                    "status": "sent",
                    "message_id": sent.id,
                    "thread_id": sent.thread_id,
                    "to": to,
                    "subject": subject,
                }))
            }
            other => Err(CatalogError::UnknownOperation(other.to_string())),
        }
    }
}

#[async_trait]
impl OperationCatalog for GmailCatalog {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn describe(&self) -> Result<Vec<OperationDescriptor>> {
        Ok(self.descriptors.clone())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn count(&self, operation: &str, filter: &str) -> Result<usize> {
        find_descriptor(&self.descriptors, operation)?;
        // Gmail search has no thread operator; a thread is sized directly.
        if let Some(thread_id) = filter.trim().strip_prefix("thread:") {
            let url = self.api_url(&format!("threads/{}", thread_id.trim()))?;
            let req = self.http.get(url).query(&[("format", "minimal")]);
            let thread: GmailThread = self.send_json(req, "get thread").await?;
            return Ok(thread.messages.len());
        }
        let mut total = 0usize;
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_COUNT_PAGES {
            let page = self
                .list_page(filter, COUNT_PAGE_SIZE, page_token.as_deref())
                .await?;
            total += page.messages.len();
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(total),
            }
        }
        Err(CatalogError::InvalidParameters(format!(
            "filter {filter:?} matches more than {} messages; narrow it down",
            MAX_COUNT_PAGES * COUNT_PAGE_SIZE
        )))
    }

    async fn lookup(
        &self,
        kind: EntityKind,
        query: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatch>> {
        match kind {
            EntityKind::Label => {
                let wanted = normalize_for_compare(query);
                Ok(self
                    .fetch_labels()
                    .await?
                    .into_iter()
                    .filter(|label| normalize_for_compare(&label.name).contains(&wanted))
                    .take(limit)
                    .map(|label| EntityMatch {
                        kind: EntityKind::Label,
                        id: label.id,
                        display: label.name,
                        detail: None,
                    })
                    .collect())
            }
            EntityKind::Message => Ok(self
                .list_ids(query, limit)
                .await?
                .into_iter()
                .map(|id| EntityMatch {
                    kind: EntityKind::Message,
                    display: id.clone(),
                    id,
                    detail: None,
                })
                .collect()),
            EntityKind::Contact => {
                // Gmail has no contact directory; senders of matching mail stand in.
                let page = self
                    .list_page(&format!("from:{}", query.trim()), SEARCH_PAGE_SIZE, None)
                    .await?;
                let mut senders = BTreeMap::new();
                for msg in page.messages {
                    let metadata = self.get_message_metadata(&msg.id).await?;
                    let (name, address) = split_mailbox(&metadata.from);
                    senders.entry(address).or_insert(name);
                }
                Ok(senders
                    .into_iter()
                    .take(limit)
                    .map(|(address, name)| EntityMatch {
                        kind: EntityKind::Contact,
                        display: if name.is_empty() {
                            address.clone()
                        } else {
                            format!("{name} <{address}>")
                        },
                        id: address,
                        detail: None,
                    })
                    .collect())
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self, parameters))]
    async fn execute(&self, operation: &str, parameters: &Parameters) -> Result<Value> {
        let descriptor = find_descriptor(&self.descriptors, operation)?;
        descriptor
            .parameter_schema
            .validate(parameters)
            .map_err(|e| CatalogError::InvalidParameters(e.to_string()))?;
        self.execute_one(operation, parameters).await
    }

    #[tracing::instrument(level = "info", skip(self, parameter_list), fields(items = parameter_list.len()))]
    async fn execute_batch(
        &self,
        operation: &str,
        parameter_list: &[Parameters],
    ) -> Result<Vec<Result<Value>>> {
        let descriptor = find_descriptor(&self.descriptors, operation)?;
        check_batch(descriptor, parameter_list.len())?;

        let (add, remove): (Vec<String>, Vec<&str>) = match operation {
            operations::ARCHIVE_MESSAGE => (Vec::new(), vec!["INBOX"]),
            operations::MARK_READ => (Vec::new(), vec!["UNREAD"]),
            operations::DELETE_FOREVER => {
                let ids = collect_ids(parameter_list)?;
                let req = self
                    .http
                    .post(self.api_url("messages/batchDelete")?)
                    .json(&json!({ "ids": ids }));
                self.send_empty(req, "batch delete").await?;
                return Ok(ids
                    .into_iter()
                    .map(|id| Ok(json!({ "status": "deleted", "message_id": id })))
                    .collect());
            }
            _ => {
                // No native batch endpoint: one request per item, failures kept per item.
                let mut results = Vec::with_capacity(parameter_list.len());
                for params in parameter_list {
                    results.push(self.execute(operation, params).await);
                }
                return Ok(results);
            }
        };

        let ids = collect_ids(parameter_list)?;
        self.batch_modify(&ids, &add, &remove).await?;
        Ok(ids
            .into_iter()
            .map(|id| Ok(json!({ "status": "ok", "message_id": id })))
            .collect())
    }
}

async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read response body>".to_string());
    Err(CatalogError::Status {
        status,
        message: format!("gmail {what} failed: {body}"),
        retry_after,
    })
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn collect_ids(parameter_list: &[Parameters]) -> Result<Vec<String>> {
    parameter_list
        .iter()
        .map(|params| require_string(params, "message_id"))
        .collect()
}

fn build_mime_message(to: &str, subject: &str, body: &str) -> String {
    let normalized = body.replace('\r', "");
    format!(
        "To: {to}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\nMIME-Version: 1.0\r\n\r\n{normalized}\r\n"
    )
}

fn normalize_for_compare(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

/// Splits `Name <addr>` into its parts; a bare address has an empty name.
fn split_mailbox(value: &str) -> (String, String) {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => (
            value[..open].trim().trim_matches('"').to_string(),
            value[open + 1..close].trim().to_ascii_lowercase(),
        ),
        _ => (String::new(), value.trim().to_ascii_lowercase()),
    }
}

#[derive(Debug, Deserialize)]
struct GmailListMessagesResponse {
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailListLabelsResponse {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
}

#[derive(Debug, Deserialize)]
struct GmailDraft {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailSendResponse {
    id: String,
    #[serde(rename = "threadId", default)]
    thread_id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds", default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    payload: Option<GmailPayload>,
}

impl GmailMessage {
    fn header_value(&self, name: &str) -> Option<String> {
        let headers = self.payload.as_ref()?.headers.as_slice();
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(default)]
    headers: Vec<GmailHeader>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct GmailMessageMetadata {
    message_id: String,
    thread_id: String,
    label_ids: Vec<String>,
    from: String,
    to: String,
    subject: String,
    date: String,
    snippet: String,
}
