//! Courier workflow engine.
//!
//! Turns natural-language mail requests into operation-catalog calls, one
//! conversational turn at a time: detect intents, route them, run the
//! resulting workflow through its safety gates, and persist it whenever it
//! waits on the user.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod intent;
pub mod orchestrator;
pub mod reply;
pub mod routing;
pub mod rules;
pub mod safety;
pub mod sqlite_store;
pub mod store;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use engine::Engine;
pub use errors::{EngineError, Failure, FailureKind, Result};
pub use intent::{DetectError, Intent, IntentDetector};
pub use reply::{ItemRef, ReplyStatus, TurnReply};
pub use rules::RuleBasedDetector;
pub use sqlite_store::SqliteSessionStore;
pub use store::{InMemorySessionStore, SessionStore, StoreError};
pub use types::{ConversationContext, SessionId, WorkflowId};
pub use workflow::{Workflow, WorkflowState};
