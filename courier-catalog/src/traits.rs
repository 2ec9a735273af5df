use crate::descriptor::{OperationDescriptor, Parameters};
use crate::error::{CatalogError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Contact,
    Message,
    Label,
}

/// One record returned by entity resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMatch {
    pub kind: EntityKind,
    pub id: String,
    pub display: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// The external registry of callable backend operations.
///
/// `count` and `lookup` never mutate. `execute_batch` must be called with at
/// most `max_batch_size` parameter sets and reports one result per item.
#[async_trait]
pub trait OperationCatalog: Send + Sync {
    fn name(&self) -> &str;

    async fn describe(&self) -> Result<Vec<OperationDescriptor>>;

    async fn count(&self, operation: &str, filter: &str) -> Result<usize>;

    async fn lookup(&self, kind: EntityKind, query: &str, limit: usize)
    -> Result<Vec<EntityMatch>>;

    async fn execute(&self, operation: &str, parameters: &Parameters) -> Result<Value>;

    async fn execute_batch(
        &self,
        operation: &str,
        parameter_list: &[Parameters],
    ) -> Result<Vec<Result<Value>>>;
}

pub(crate) fn require_string(args: &Parameters, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(CatalogError::InvalidParameters(format!(
            "missing key: {key}"
        )));
    };
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(CatalogError::InvalidParameters(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string(args: &Parameters, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(CatalogError::InvalidParameters(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn find_descriptor<'a>(
    descriptors: &'a [OperationDescriptor],
    operation: &str,
) -> Result<&'a OperationDescriptor> {
    descriptors
        .iter()
        .find(|d| d.name == operation)
        .ok_or_else(|| CatalogError::UnknownOperation(operation.to_string()))
}

pub(crate) fn check_batch(descriptor: &OperationDescriptor, size: usize) -> Result<()> {
    if size > descriptor.max_batch_size {
        return Err(CatalogError::BatchTooLarge {
            operation: descriptor.name.clone(),
            size,
            max: descriptor.max_batch_size,
        });
    }
    Ok(())
}
