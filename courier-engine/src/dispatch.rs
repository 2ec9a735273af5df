//! Every catalog call goes through [`CatalogGateway`]: shared rate limit,
//! per-call timeout, failure classification and bounded retries.

use crate::config::EngineConfig;
use crate::errors::{Failure, RetryPolicy, classify};
use courier_catalog::{
    CatalogError, EntityKind, EntityMatch, OperationCatalog, OperationDescriptor, Parameters,
    RateLimiter,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct CatalogGateway {
    catalog: Arc<dyn OperationCatalog>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl CatalogGateway {
    pub fn new(catalog: Arc<dyn OperationCatalog>, config: &EngineConfig) -> Self {
        Self {
            catalog,
            limiter: Arc::new(RateLimiter::new(
                config.catalog.rate_limit_per_second,
                config.catalog.rate_limit_burst,
            )),
            retry: RetryPolicy::from_config(&config.retry),
            timeout: config.catalog.request_timeout(),
        }
    }

    /// Shares one token bucket across gateways talking to the same backend.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn catalog_name(&self) -> &str {
        self.catalog.name()
    }

    pub async fn describe(&self) -> Result<Vec<OperationDescriptor>, Failure> {
        let catalog = &self.catalog;
        self.call("describe", || catalog.describe()).await
    }

    pub async fn count(&self, operation: &str, filter: &str) -> Result<usize, Failure> {
        let catalog = &self.catalog;
        self.call(operation, || catalog.count(operation, filter)).await
    }

    pub async fn lookup(
        &self,
        kind: EntityKind,
        query: &str,
        limit: usize,
    ) -> Result<Vec<EntityMatch>, Failure> {
        let catalog = &self.catalog;
        let label = match kind {
            EntityKind::Contact => "lookup_contact",
            EntityKind::Message => "lookup_message",
            EntityKind::Label => "lookup_label",
        };
        self.call(label, || catalog.lookup(kind, query, limit)).await
    }

    pub async fn execute(&self, operation: &str, parameters: &Parameters) -> Result<Value, Failure> {
        let catalog = &self.catalog;
        self.call(operation, || catalog.execute(operation, parameters))
            .await
    }

    pub async fn execute_batch(
        &self,
        operation: &str,
        parameter_list: &[Parameters],
    ) -> Result<Vec<courier_catalog::Result<Value>>, Failure> {
        let catalog = &self.catalog;
        self.call(operation, || catalog.execute_batch(operation, parameter_list))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, attempt), fields(catalog = %self.catalog.name()))]
    async fn call<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, Failure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = courier_catalog::Result<T>>,
    {
        let mut retries = 0u32;
        loop {
            self.limiter.acquire().await;
            let result = match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(CatalogError::Timeout),
            };
            let err = match result {
                Ok(value) => {
                    if retries > 0 {
                        tracing::info!(
                            operation,
                            attempts = retries + 1,
                            "catalog call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = classify(&err);
            if kind.is_retryable() && retries < self.retry.max_retries {
                let delay = self.retry.delay(retries, kind.retry_after());
                tracing::warn!(
                    operation,
                    kind = %kind,
                    retry = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying catalog call"
                );
                tokio::time::sleep(delay).await;
                retries += 1;
                continue;
            }

            tracing::warn!(
                operation,
                kind = %kind,
                attempts = retries + 1,
                error = %err,
                "catalog call failed"
            );
            return Err(Failure {
                kind,
                operation: operation.to_string(),
                attempts: retries + 1,
                source: err,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use courier_catalog::{CallMethod, MailboxCatalog, operations};
    use serde_json::json;
    use tokio::time::Instant;

    fn gateway(mailbox: &Arc<MailboxCatalog>) -> CatalogGateway {
        CatalogGateway::new(mailbox.clone(), &EngineConfig::default())
    }

    fn read_params(id: &str) -> Parameters {
        json!({ "message_id": id })
            .as_object()
            .cloned()
            .expect("object")
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_call_waits_for_retry_after() {
        let mailbox = Arc::new(MailboxCatalog::demo());
        mailbox.fail_next(
            CallMethod::Execute,
            Some(operations::READ_MESSAGE),
            CatalogError::rate_limited(Duration::from_secs(5)),
        );
        let start = Instant::now();
        let out = gateway(&mailbox)
            .execute(operations::READ_MESSAGE, &read_params("m-101"))
            .await
            .expect("second attempt succeeds");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(out["message"]["id"], "m-101");
        assert_eq!(mailbox.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_then_give_up() {
        let mailbox = Arc::new(MailboxCatalog::demo());
        for _ in 0..4 {
            mailbox.fail_next(CallMethod::Count, None, CatalogError::status(503, "down"));
        }
        let start = Instant::now();
        let failure = gateway(&mailbox)
            .count(operations::ARCHIVE_MESSAGE, "in:inbox")
            .await
            .expect_err("retries exhausted");
        assert_eq!(failure.kind, FailureKind::TransientServerError);
        assert_eq!(failure.attempts, 4);
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let mailbox = Arc::new(MailboxCatalog::demo());
        mailbox.fail_next(CallMethod::Execute, None, CatalogError::status(401, "expired"));
        let failure = gateway(&mailbox)
            .execute(operations::READ_MESSAGE, &read_params("m-101"))
            .await
            .expect_err("auth failure surfaces");
        assert_eq!(failure.kind, FailureKind::AuthExpired);
        assert_eq!(failure.attempts, 1);
        assert_eq!(mailbox.calls().len(), 1);
    }
}
