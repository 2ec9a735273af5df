//! Slash commands for the local transport.

use courier_engine::{ConversationContext, Engine, SessionId, TurnReply};
use std::time::Instant;

pub const HELP: &str = "\
Type a mail request, e.g. \"archive all emails from anna@example.com\".
Answer questions with a number, a name, yes/no, or \"cancel\".
Commands:
  /help              show this text
  /status            catalog, session and pending workflow
  /new               cancel anything pending and start over
  /focus <msg_id>    treat a message as \"this email\"
  /thread <id>       treat a thread as \"this thread\"
  /context           show the references carried into the next turn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Status,
    New,
    Focus(String),
    Thread(String),
    Context,
    /// A known command with bad arguments, or an unknown one. Carries the reply.
    Invalid(String),
}

/// Returns `None` for anything that is not a slash command.
pub fn parse_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let cmd = match (name, args.as_slice()) {
        ("/help", []) => SlashCommand::Help,
        ("/status", []) => SlashCommand::Status,
        ("/new", []) => SlashCommand::New,
        ("/context", []) => SlashCommand::Context,
        ("/focus", [id]) => SlashCommand::Focus((*id).to_string()),
        ("/thread", [id]) => SlashCommand::Thread((*id).to_string()),
        ("/focus", _) => SlashCommand::Invalid("Usage: /focus <message_id>".to_string()),
        ("/thread", _) => SlashCommand::Invalid("Usage: /thread <thread_id>".to_string()),
        ("/help" | "/status" | "/new" | "/context", _) => {
            SlashCommand::Invalid(format!("{name} takes no arguments."))
        }
        _ => SlashCommand::Invalid(
            "Unknown command. Supported: /help /status /new /focus /thread /context".to_string(),
        ),
    };
    Some(cmd)
}

/// One local conversation: its session id and the references it carries.
#[derive(Debug)]
pub struct LocalSession {
    pub id: SessionId,
    pub context: ConversationContext,
    pub turns: u64,
    started: Instant,
}

impl LocalSession {
    pub fn new(id: impl Into<SessionId>) -> Self {
        Self {
            id: id.into(),
            context: ConversationContext::default(),
            turns: 0,
            started: Instant::now(),
        }
    }

    /// Carries the reply's references into the next turn.
    pub fn absorb(&mut self, reply: &TurnReply) {
        self.turns += 1;
        if let Some(item) = reply.referenced_items.last() {
            self.context.last_referenced_item_id = Some(item.id.clone());
            if let Some(thread) = &item.thread_id {
                self.context.last_thread_or_group_id = Some(thread.clone());
            }
        }
        self.context.pending_workflow_id = if reply.is_suspended() {
            reply.workflow_id.clone()
        } else {
            None
        };
    }

    pub fn render_context(&self) -> String {
        let c = &self.context;
        format!(
            "session={}\nfocused_message={}\nfocused_thread={}\npending_workflow={}",
            self.id,
            c.last_referenced_item_id.as_deref().unwrap_or("-"),
            c.last_thread_or_group_id.as_deref().unwrap_or("-"),
            c.pending_workflow_id.as_ref().map_or("-", |id| id.as_str()),
        )
    }

    pub async fn run_command(&mut self, engine: &Engine, cmd: SlashCommand) -> String {
        match cmd {
            SlashCommand::Help => HELP.to_string(),
            SlashCommand::Status => self.status(engine).await,
            SlashCommand::New => {
                engine.cancel(&self.id);
                if let Err(err) = engine.reset(&self.id).await {
                    tracing::error!(session_id = %self.id, error = %err, "session reset failed");
                    return "Could not clear the session. Try again.".to_string();
                }
                self.context = ConversationContext::default();
                "Session reset. Anything pending was cancelled.".to_string()
            }
            SlashCommand::Focus(id) => {
                self.context.last_referenced_item_id = Some(id.clone());
                format!("\"this email\" now means {id}.")
            }
            SlashCommand::Thread(id) => {
                self.context.last_thread_or_group_id = Some(id.clone());
                format!("\"this thread\" now means {id}.")
            }
            SlashCommand::Context => self.render_context(),
            SlashCommand::Invalid(message) => message,
        }
    }

    async fn status(&self, engine: &Engine) -> String {
        let pending = match engine.workflow(&self.id).await {
            Ok(Some(wf)) => format!("{} ({})", wf.state.as_str(), wf.id),
            Ok(None) => "none".to_string(),
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "status lookup failed");
                "unknown".to_string()
            }
        };
        format!(
            "catalog={}\noperations={}\nsession={}\nworkflow={pending}\nturns={}\nuptime_seconds={}",
            engine.catalog_name(),
            engine.descriptors().len(),
            self.id,
            self.turns,
            self.started.elapsed().as_secs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_catalog::MailboxCatalog;
    use courier_engine::{EngineConfig, InMemorySessionStore, ItemRef, ReplyStatus, WorkflowId};
    use std::sync::Arc;

    async fn demo_engine() -> Engine {
        Engine::new(
            Arc::new(MailboxCatalog::demo()),
            Arc::new(InMemorySessionStore::new()),
            EngineConfig::default(),
        )
        .await
        .expect("engine")
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("archive this email"), None);
        assert_eq!(parse_command("  /help "), Some(SlashCommand::Help));
    }

    #[test]
    fn focus_and_thread_take_one_id() {
        assert_eq!(
            parse_command("/focus m-42"),
            Some(SlashCommand::Focus("m-42".to_string()))
        );
        assert_eq!(
            parse_command("/thread t-7"),
            Some(SlashCommand::Thread("t-7".to_string()))
        );
        assert!(matches!(
            parse_command("/focus"),
            Some(SlashCommand::Invalid(msg)) if msg.contains("Usage")
        ));
        assert!(matches!(
            parse_command("/status now"),
            Some(SlashCommand::Invalid(_))
        ));
    }

    #[test]
    fn unknown_commands_list_the_supported_ones() {
        let Some(SlashCommand::Invalid(msg)) = parse_command("/model gpt") else {
            panic!("expected invalid command");
        };
        assert!(msg.starts_with("Unknown command."));
        assert!(msg.contains("/focus"));
    }

    #[test]
    fn absorb_tracks_references_and_pending_workflow() {
        let mut session = LocalSession::new("local");
        let mut reply = TurnReply::new(ReplyStatus::Completed, "Here is the message.");
        reply.referenced_items.push(ItemRef {
            id: "m-9".to_string(),
            thread_id: Some("t-3".to_string()),
        });
        session.absorb(&reply);
        assert_eq!(session.context.last_referenced_item_id.as_deref(), Some("m-9"));
        assert_eq!(session.context.last_thread_or_group_id.as_deref(), Some("t-3"));
        assert!(session.context.pending_workflow_id.is_none());

        let id = WorkflowId::generate();
        let mut question = TurnReply::new(ReplyStatus::NeedsConfirmation, "About to archive 34 items.");
        question.workflow_id = Some(id.clone());
        session.absorb(&question);
        assert_eq!(session.context.pending_workflow_id, Some(id));
        assert_eq!(session.context.last_referenced_item_id.as_deref(), Some("m-9"));
        assert_eq!(session.turns, 2);
    }

    #[tokio::test]
    async fn focus_then_new_clears_context() {
        let engine = demo_engine().await;
        let mut session = LocalSession::new("local");

        let reply = session
            .run_command(&engine, SlashCommand::Focus("m-1".to_string()))
            .await;
        assert!(reply.contains("m-1"));
        assert!(session.render_context().contains("focused_message=m-1"));

        let reply = session.run_command(&engine, SlashCommand::New).await;
        assert!(reply.starts_with("Session reset."));
        assert_eq!(session.context, ConversationContext::default());
    }

    #[tokio::test]
    async fn status_reports_catalog_and_idle_session() {
        let engine = demo_engine().await;
        let mut session = LocalSession::new("local");
        let status = session.run_command(&engine, SlashCommand::Status).await;
        assert!(status.contains("catalog=mailbox"));
        assert!(status.contains("workflow=none"));
        assert!(status.contains("session=local"));
    }
}
