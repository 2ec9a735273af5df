//! Local line transport: one utterance per line on stdin, replies on stdout.

use crate::commands::{LocalSession, parse_command};
use anyhow::Result;
use courier_engine::Engine;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const PROMPT: &str = "> ";

/// Runs turns until input ends or `shutdown` fires. A shutdown that lands
/// mid-turn cancels the turn's bulk work before its next chunk, then exits.
pub async fn run<W>(
    engine: Arc<Engine>,
    session: &mut LocalSession,
    mut lines: mpsc::Receiver<String>,
    mut output: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_out(
        &mut output,
        &format!(
            "courier ({} catalog, session {}). /help for commands.\n",
            engine.catalog_name(),
            session.id
        ),
    )
    .await?;

    loop {
        write_out(&mut output, PROMPT).await?;
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        if let Some(cmd) = parse_command(text) {
            let reply = session.run_command(&engine, cmd).await;
            write_out(&mut output, &format!("{reply}\n")).await?;
            continue;
        }

        let reply = {
            let id = session.id.clone();
            let context = session.context.clone();
            let turn = engine.handle_turn(&id, text, &context);
            tokio::pin!(turn);
            let finished = tokio::select! {
                biased;
                reply = &mut turn => Some(reply),
                _ = shutdown.cancelled() => None,
            };
            match finished {
                Some(reply) => reply,
                None => {
                    engine.cancel(&id);
                    turn.await
                }
            }
        };
        tracing::debug!(
            session_id = %session.id,
            status = reply.status.as_str(),
            "turn finished"
        );
        session.absorb(&reply);
        write_out(&mut output, &format!("{}\n", reply.render())).await?;
        if shutdown.is_cancelled() {
            break;
        }
    }

    write_out(&mut output, "\n").await?;
    Ok(())
}

/// Reads stdin on a dedicated thread so a pending read never holds up
/// runtime shutdown.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn write_out<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> Result<()> {
    output.write_all(text.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_catalog::MailboxCatalog;
    use courier_engine::{EngineConfig, InMemorySessionStore};

    fn lines_of(text: &str) -> mpsc::Receiver<String> {
        let lines: Vec<String> = text.lines().map(str::to_string).collect();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line).expect("buffered");
        }
        rx
    }

    async fn transcript(script: &str) -> (String, LocalSession) {
        let engine = Engine::new(
            Arc::new(MailboxCatalog::demo()),
            Arc::new(InMemorySessionStore::new()),
            EngineConfig::default(),
        )
        .await
        .expect("engine");
        let mut session = LocalSession::new("local");
        let mut out = Vec::new();
        run(
            Arc::new(engine),
            &mut session,
            lines_of(script),
            &mut out,
            CancellationToken::new(),
        )
        .await
        .expect("repl");
        (String::from_utf8(out).expect("utf8"), session)
    }

    #[tokio::test(start_paused = true)]
    async fn focused_message_is_used_for_this_email() {
        let (out, session) = transcript("/focus m-101\ndelete this email\n/context\n").await;
        assert!(out.starts_with("courier (mailbox catalog, session local)."));
        assert!(out.contains("\"this email\" now means m-101."));
        assert!(out.contains("focused_message=m-101"));
        assert!(session.context.pending_workflow_id.is_none());
        assert_eq!(session.turns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_question_is_answered_on_the_next_line() {
        let (out, session) = transcript(
            "archive all emails from deals@newsletter.example\nyes\n",
        )
        .await;
        assert!(out.contains("34 items"));
        assert!(out.contains("34 messages"));
        assert!(session.context.pending_workflow_id.is_none());
        assert_eq!(session.turns, 2);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped_and_eof_ends_the_loop() {
        let (out, session) = transcript("\n   \n").await;
        assert_eq!(session.turns, 0);
        assert!(out.ends_with("> \n"));
    }

    #[tokio::test]
    async fn shutdown_before_input_exits_immediately() {
        let engine = Engine::new(
            Arc::new(MailboxCatalog::demo()),
            Arc::new(InMemorySessionStore::new()),
            EngineConfig::default(),
        )
        .await
        .expect("engine");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut session = LocalSession::new("local");
        let mut out = Vec::new();
        run(
            Arc::new(engine),
            &mut session,
            lines_of("delete this email"),
            &mut out,
            shutdown,
        )
        .await
        .expect("repl");
        assert_eq!(session.turns, 0);
    }
}
