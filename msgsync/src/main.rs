//! `msgsync` — inspect the local sync database or run a demo session.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/msgsync/config.toml`).
//!
//! ```bash
//! # Cached history of a conversation
//! cargo run --bin msgsync -- history general --limit 20
//!
//! # Pending outgoing messages, as JSON
//! cargo run --bin msgsync -- --json queue
//!
//! # Offline send, reconnect, converge
//! cargo run --bin msgsync -- demo
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser};
use tracing_appender::non_blocking::WorkerGuard;

use msgsync::clock::SystemClock;
use msgsync::config::{CliArgs, ClientConfig, Command};
use msgsync::engine::{EngineConfig, SyncEngine, actor};
use msgsync::network::{NetworkMonitor, NetworkStatus};
use msgsync::remote::memory::InMemoryRemote;
use msgsync::storage::memory::InMemoryStorage;
use msgsync::storage::sqlite::SqliteStorage;
use msgsync::storage::{MessageStore, OfflineQueue};
use msgsync_proto::message::{ConversationId, Message, SenderId, Timestamp};
use msgsync_proto::queue::QueueEntry;
use msgsync_proto::record::MessageRecord;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("msgsync starting");

    let result = match &cli.command {
        Some(Command::History {
            conversation,
            limit,
            offset,
        }) => history(&config, conversation, *limit, *offset, cli.json).await,
        Some(Command::Queue { conversation }) => {
            queue(&config, conversation.as_deref(), cli.json).await
        }
        Some(Command::Demo) => demo(&config, cli.json).await,
        None => CliArgs::command().print_help().map_err(Into::into),
    };

    tracing::info!("msgsync exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Logs are written to a file so stdout stays clean for command output.
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("msgsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn history(
    config: &ClientConfig,
    conversation: &str,
    limit: usize,
    offset: usize,
    json: bool,
) -> CliResult {
    let storage = SqliteStorage::open(&config.db_path)?;
    let messages = storage
        .list(&ConversationId::new(conversation), limit, offset)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&messages)?);
        return Ok(());
    }
    if messages.is_empty() {
        println!("no cached messages in {conversation}");
    }
    for message in &messages {
        println!("{}", format_message(message));
    }
    Ok(())
}

async fn queue(config: &ClientConfig, conversation: Option<&str>, json: bool) -> CliResult {
    let storage = SqliteStorage::open(&config.db_path)?;
    let mut entries = storage.dequeue_all().await?;
    if let Some(conversation) = conversation {
        entries.retain(|entry| entry.conversation_id.as_str() == conversation);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("offline queue is empty");
    }
    for entry in &entries {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

/// Sends two messages while offline, reconnects, and prints the view once
/// the remote log has absorbed them.
async fn demo(config: &ClientConfig, json: bool) -> CliResult {
    let engine_config = config
        .to_engine_config()
        .unwrap_or_else(|| EngineConfig::new(SenderId::new("demo-user")));
    let conversation = ConversationId::new("demo");
    let storage = InMemoryStorage::new();
    let remote = InMemoryRemote::new();
    let network = NetworkMonitor::new(NetworkStatus::OFFLINE);

    let (engine, snapshots) = SyncEngine::new(
        engine_config,
        storage.clone(),
        storage,
        remote,
        network.clone(),
        Arc::new(SystemClock),
    );
    let (handle, task) = actor::spawn(engine, snapshots);
    let mut view = handle.watch(conversation.clone()).await?;

    for content in ["Hello", "Are you there?"] {
        handle
            .send_message(conversation.clone(), content, None)
            .await?;
    }
    print_view("offline", &view.borrow(), json)?;

    network.set_status(NetworkStatus::ONLINE);
    let converged = tokio::time::timeout(
        Duration::from_secs(10),
        view.wait_for(|records| !records.is_empty() && records.iter().all(|r| !r.is_optimistic())),
    )
    .await
    .ok()
    .and_then(Result::ok)
    .map(|records| records.clone());
    match converged {
        Some(records) => print_view("online", &records, json)?,
        None => println!("demo did not converge within 10s"),
    }

    handle.shutdown().await;
    task.await?;
    Ok(())
}

fn print_view(label: &str, records: &[MessageRecord], json: bool) -> CliResult {
    if json {
        println!("{}", serde_json::to_string(records)?);
        return Ok(());
    }
    println!("-- {label} --");
    for record in records {
        let origin = if record.is_optimistic() { "local" } else { "remote" };
        println!(
            "{} {} [{}] {} ({origin})",
            format_time(record.timestamp()),
            record.sender_id(),
            record.status(),
            record.content(),
        );
    }
    Ok(())
}

fn format_message(message: &Message) -> String {
    let attachment = message
        .attachment_ref
        .as_deref()
        .map_or_else(String::new, |a| format!(" <{a}>"));
    format!(
        "{} {} [{}] {}{attachment}",
        format_time(message.timestamp),
        message.sender_id,
        message.status,
        message.content
    )
}

fn format_entry(entry: &QueueEntry) -> String {
    let last = entry
        .last_retry_at
        .map_or_else(|| "never".to_string(), format_time);
    format!(
        "{} {} retries={} last_attempt={last} error={} :: {}",
        entry.id,
        entry.conversation_id,
        entry.retry_count,
        entry.error.as_deref().unwrap_or("-"),
        entry.content
    )
}

fn format_time(timestamp: Timestamp) -> String {
    i64::try_from(timestamp.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || timestamp.as_millis().to_string(),
            |t| t.format("%Y-%m-%d %H:%M:%S").to_string(),
        )
}
