//! Courier main binary.

mod commands;
mod config;
mod init;
mod repl;
mod setup;

use crate::commands::LocalSession;
use crate::config::CourierConfig;
use crate::init::InitOutcome;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Debug, Parser)]
#[command(name = "courier", version, about = "Conversational mail workflows")]
struct Cli {
    /// Config file (default: ~/.courier/config.toml).
    #[arg(long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Chat with the engine on stdin/stdout (default).
    Repl {
        /// Session id; suspended workflows are resumed by it.
        #[arg(long, default_value = "local")]
        session: String,
    },
    /// Write the config template to ~/.courier (idempotent).
    Init,
    /// Validate config and check that the catalog answers.
    Doctor,
    /// List catalog operations with their risk level and batch size.
    Catalog,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv().ok();
    init_tracing()?;
    install_panic_hook();
    if let Some(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Repl {
        session: "local".to_string(),
    });

    match command {
        Command::Repl { session } => run_repl(cli.config, session).await,
        Command::Init => {
            match init::initialize(cli.config).await? {
                InitOutcome::Created(path) => {
                    println!("init: created {}", path.display());
                    println!("next: edit {} and run `courier doctor`", path.display());
                }
                outcome @ InitOutcome::Kept(_) => {
                    println!(
                        "init: kept existing {} unchanged",
                        outcome.path().display()
                    );
                }
            }
            Ok(())
        }
        Command::Doctor => doctor(cli.config).await,
        Command::Catalog => list_catalog(cli.config).await,
    }
}

async fn run_repl(config_path: Option<PathBuf>, session_id: String) -> anyhow::Result<()> {
    let cfg = CourierConfig::load(config_path).await?;
    let engine = Arc::new(setup::build_engine(&cfg).await?);

    let shutdown = CancellationToken::new();
    let sweeper = engine.spawn_sweeper(shutdown.clone());
    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; shutting down");
                shutdown.cancel();
            }
        })
    };

    let mut session = LocalSession::new(session_id);
    let result = repl::run(
        engine,
        &mut session,
        repl::stdin_lines(),
        tokio::io::stdout(),
        shutdown.clone(),
    )
    .await;

    shutdown.cancel();
    ctrl_c.abort();
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "session sweeper did not stop cleanly");
    }
    result
}

async fn doctor(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (cfg, path) = CourierConfig::load_with_path(config_path).await?;
    let engine = setup::build_engine(&cfg).await?;
    tracing::info!(
        config_path = %path.display(),
        catalog = %engine.catalog_name(),
        operations = engine.descriptors().len(),
        "config ok"
    );
    println!("config: {}", path.display());
    println!("catalog: {} ({})", cfg.catalog.backend.as_str(), engine.catalog_name());
    println!(
        "sessions: {}",
        cfg.sessions
            .resolved_db_path()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );
    println!("operations: {}", engine.descriptors().len());
    Ok(())
}

async fn list_catalog(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let cfg = CourierConfig::load(config_path).await?;
    let engine = setup::build_engine(&cfg).await?;
    let descriptors = engine.descriptors();
    let width = descriptors.iter().map(|d| d.name.len()).max().unwrap_or(0);
    for d in &descriptors {
        println!(
            "{:<width$}  {:<12}  batch={:<4}  {}",
            d.name,
            d.risk_level.as_str(),
            d.max_batch_size,
            d.description
        );
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(v) => v,
        Err(_) => EnvFilter::new("warn,courier=info"),
    };
    let log_format = std::env::var("COURIER_LOG_FORMAT")
        .unwrap_or_else(|_| "compact".to_string())
        .to_ascii_lowercase();

    // Stdout belongs to the conversation; logs go to stderr.
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty()
                .init();
        }
        "compact" => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
        other => {
            return Err(anyhow::anyhow!(
                "unsupported COURIER_LOG_FORMAT={other:?}; expected one of: json, pretty, compact"
            ));
        }
    }

    tracing::info!(
        log_format = %log_format,
        env_filter = ?std::env::var("RUST_LOG").ok(),
        "tracing initialized"
    );
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let payload = panic_payload_to_string(panic_info.payload());
        tracing::error!(
            panic_location = %location,
            panic_payload = %payload,
            "panic captured"
        );
        default_hook(panic_info);
    }));
}

fn panic_payload_to_string(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_repl() {
        let cli = Cli::try_parse_from(["courier"]).expect("parse");
        assert!(cli.command.is_none());
    }

    #[test]
    fn repl_session_and_global_config_flags() {
        let cli = Cli::try_parse_from([
            "courier",
            "repl",
            "--session",
            "work",
            "--config",
            "/tmp/courier.toml",
        ])
        .expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/courier.toml")));
        match cli.command {
            Some(Command::Repl { session }) => assert_eq!(session, "work"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn panic_payloads_are_stringified() {
        let s: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_payload_to_string(s.as_ref()), "boom");
        let s: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_payload_to_string(s.as_ref()), "bang");
        let s: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_payload_to_string(s.as_ref()), "non-string panic payload");
    }
}
