//! CLI binary for duewatch.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, NaiveTime, TimeZone};
use clap::{Parser, Subcommand};
use duewatch::store::StoreFactory;
use duewatch::tasks::open_task_store;
use duewatch::watcher::now_epoch_millis;
use duewatch::{
    Dispatcher, NewTask, PermissionGate, Task, TaskRepository, TracingAlertSink, TrackerConfig,
    Trigger, Watcher, WatcherMessage,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// duewatch: local tasks with deadline alerts.
#[derive(Parser)]
#[command(name = "duewatch", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Add a task.
    Add {
        #[arg(short, long)]
        title: String,
        /// Due date, `YYYY-MM-DD`.
        #[arg(short, long)]
        date: NaiveDate,
        /// Due time, `HH:MM`.
        #[arg(long, value_parser = parse_time)]
        time: NaiveTime,
    },

    /// List all tasks.
    List,

    /// Toggle a task's completed flag.
    Toggle { id: i64 },

    /// Mark a task completed.
    Complete { id: i64 },

    /// Delete a task.
    Delete { id: i64 },

    /// Check deadlines once and alert what is due.
    Check,

    /// Watch deadlines until Ctrl+C. Reads `check` and `complete <id>`
    /// lines from stdin.
    Watch,
}

fn parse_time(s: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(s, "%H:%M")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("duewatch=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(TrackerConfig::default_config_path);
    let config = TrackerConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let factory = StoreFactory::new(&config.store.data_dir, config.store.options());
    let db = open_task_store(&factory, &config.store.name)
        .await
        .with_context(|| format!("opening store in {}", config.store.data_dir.display()))?;
    let repo = TaskRepository::new(db.clone());

    match cli.command {
        Command::Add { title, date, time } => {
            let task = repo.create(NewTask::at(title, date.and_time(time))).await?;
            println!("added #{}", task.id);
            print_task(&task);
        }
        Command::List => {
            let tasks = repo.list_all().await?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            for task in &tasks {
                print_task(task);
            }
            let pending = repo.count_unnotified().await?;
            println!("{} task(s), {pending} awaiting alert", tasks.len());
        }
        Command::Toggle { id } => print_task(&repo.toggle_completed(id).await?),
        Command::Complete { id } => print_task(&repo.set_completed(id, true).await?),
        Command::Delete { id } => {
            repo.delete(id).await?;
            println!("deleted #{id}");
        }
        Command::Check => {
            let watcher = build_watcher(&config, db);
            let report = watcher
                .check_deadlines(Trigger::Message, now_epoch_millis())
                .await?;
            println!(
                "{} due, {} alerted, {} failed",
                report.scanned, report.alerted, report.failed
            );
        }
        Command::Watch => run_watch(&config, db).await?,
    }
    Ok(())
}

fn build_watcher(config: &TrackerConfig, db: duewatch::store::Database) -> Watcher {
    let sink = PermissionGate::new(TracingAlertSink, config.alerts.permission);
    let dispatcher = Dispatcher::new(Arc::new(sink)).with_title(config.alerts.title.clone());
    Watcher::new(db, dispatcher)
        .with_config(&config.watcher)
        .with_transaction_timeout(config.store.transaction_timeout())
}

async fn run_watch(config: &TrackerConfig, db: duewatch::store::Database) -> anyhow::Result<()> {
    let watcher = build_watcher(config, db);
    let cancel = CancellationToken::new();
    let (messages_tx, messages_rx) = mpsc::channel(16);
    forward_stdin(messages_tx).context("starting stdin reader")?;

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    watcher.spawn(messages_rx, cancel).await?;
    Ok(())
}

/// Forward `check` and `complete <id>` lines from stdin to the watcher.
///
/// Runs on its own thread so a pending read never holds up shutdown.
fn forward_stdin(messages: mpsc::Sender<WatcherMessage>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("duewatch-stdin".to_owned())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("reading stdin failed: {e}");
                        return;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<WatcherMessage>() {
                    Ok(message) => {
                        if messages.blocking_send(message).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("ignoring input: {e}"),
                }
            }
            debug!("stdin closed, no more messages");
        })
        .map(|_| ())
}

fn print_task(task: &Task) {
    let due = chrono::Local
        .timestamp_millis_opt(task.deadline)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| task.deadline.to_string());
    let mark = if task.completed { "x" } else { " " };
    let bell = if task.notified { " (alerted)" } else { "" };
    println!("[{mark}] #{:<4} {due}  {}{bell}", task.id, task.title);
}
