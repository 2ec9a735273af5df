//! Operation catalog for Courier.
//!
//! Describes the backend operations a mail assistant may invoke (risk level,
//! batch limits, parameter schemas) and provides the backends that execute
//! them: an in-memory mailbox and the Gmail REST API.

mod descriptor;
mod error;
mod gmail;
mod mailbox;
pub mod operations;
mod rate_limit;
mod traits;

pub use descriptor::{
    DEFAULT_CONFIRMATION_ABOVE, OperationCategory, OperationDescriptor, ParamKind,
    ParameterSchema, ParameterSpec, Parameters, RiskLevel, SchemaViolation,
    validate_email_address,
};
pub use error::{CatalogError, Result};
pub use gmail::GmailCatalog;
pub use mailbox::{CallMethod, CatalogCall, DraftMessage, MailMessage, MailboxCatalog};
pub use operations::mail_operations;
pub use rate_limit::RateLimiter;
pub use traits::{EntityKind, EntityMatch, OperationCatalog};
