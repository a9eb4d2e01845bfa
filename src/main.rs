use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use theatre_sync::api::{Dataset, Method, Mutation};
use theatre_sync::cache::DatasetRead;
use theatre_sync::offline::{DeadLetterReason, FetchOutcome};
use theatre_sync::{logging, Config, SyncEngine, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "theatre-sync")]
#[command(about = "Offline-first sync client for the theatre management API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/theatre-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL, overrides the config file
  #[arg(long)]
  api_url: Option<String>,

  /// Keep the queue and cache in memory only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connectivity and queue counts
  Status,
  /// List queued writes in replay order
  Queue,
  /// List abandoned writes
  DeadLetters,
  /// Move a dead letter back to the end of the queue
  Requeue { id: Uuid },
  /// Drop a dead letter for good
  Discard { id: Uuid },
  /// Submit a typed mutation given as JSON, e.g. '{"kind":"end_duty",...}'
  Send { mutation: String },
  /// Perform a raw API call
  Request {
    method: Method,
    path: String,
    /// JSON body
    body: Option<String>,
  },
  /// Replay the queue now
  Drain,
  /// Refresh every configured dataset
  Prefetch,
  /// Read a dataset, falling back to the cache
  Get { dataset: Dataset },
  /// Run in the background until Ctrl-C, printing sync events
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = match &args.api_url {
    Some(url) => {
      let mut config = Config::load_or_default(args.config.as_deref(), url)?;
      config.api.base_url = url.clone();
      config
    }
    None => Config::load(args.config.as_deref())?,
  };
  config.validate()?;

  let _log_guard = logging::init(config.storage.log_dir.as_deref())?;

  let engine = if args.ephemeral {
    SyncEngine::open_ephemeral(config).await?
  } else {
    SyncEngine::open(config).await?
  };

  run(&engine, args.command).await
}

async fn run(engine: &SyncEngine, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let status = engine.status();
      println!("connectivity: {}", status.connectivity);
      println!("pending:      {}", status.pending);
      println!("dead letters: {}", status.dead_letters);
    }
    Command::Queue => {
      for item in engine.queue().list()? {
        println!(
          "{}  {:<6} {}  retries={}{}",
          item.id,
          item.request.method,
          item.request.path,
          item.retry_count,
          item
            .last_error
            .map(|e| format!("  last_error={}", e))
            .unwrap_or_default()
        );
      }
    }
    Command::DeadLetters => {
      for letter in engine.queue().dead_letters()? {
        println!(
          "{}  {:<6} {}  {}  {}",
          letter.item.id,
          letter.item.request.method,
          letter.item.request.path,
          letter.dead_at.to_rfc3339(),
          describe_reason(&letter.reason)
        );
      }
    }
    Command::Requeue { id } => {
      engine.queue().requeue_dead_letter(id)?;
      println!("requeued {}", id);
    }
    Command::Discard { id } => {
      engine.queue().discard_dead_letter(id)?;
      println!("discarded {}", id);
    }
    Command::Send { mutation } => {
      let mutation: Mutation = serde_json::from_str(&mutation).wrap_err("invalid mutation JSON")?;
      print_outcome(engine.fetch().mutate(&mutation).await?)?;
    }
    Command::Request { method, path, body } => {
      let body = body
        .map(|b| serde_json::from_str::<Value>(&b))
        .transpose()
        .wrap_err("invalid JSON body")?;
      print_outcome(engine.fetch().request(method, &path, body).await?)?;
    }
    Command::Drain => {
      let summary = engine
        .processor()
        .drain()
        .await
        .ok_or_else(|| eyre!("a drain is already running"))?;
      println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Command::Prefetch => {
      let report = engine.cache().prefetch_all().await;
      if report.skipped_offline {
        println!("offline, nothing fetched");
      }
      for dataset in &report.refreshed {
        println!("refreshed {}", dataset);
      }
      for (dataset, error) in &report.failed {
        println!("failed    {}: {}", dataset, error);
      }
    }
    Command::Get { dataset } => {
      print_read(&engine.cache().get(dataset).await?)?;
    }
    Command::Watch => watch(engine).await?,
  }
  Ok(())
}

async fn watch(engine: &SyncEngine) -> Result<()> {
  let mut events = engine.events().subscribe();
  let handle = engine.start();
  tracing::info!(status = ?engine.status(), "watching, Ctrl-C to stop");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(event) => log_event(&event),
        Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "event stream lagged"),
        Err(RecvError::Closed) => break,
      },
    }
  }

  handle.shutdown().await;
  Ok(())
}

fn log_event(event: &SyncEvent) {
  match event {
    SyncEvent::Connectivity(state) => tracing::info!(%state, "connectivity"),
    SyncEvent::Queued {
      id,
      method,
      path,
      pending,
    } => tracing::info!(%id, %method, %path, pending, "queued"),
    SyncEvent::Drained(summary) => tracing::info!(
      succeeded = summary.succeeded,
      dead_lettered = summary.dead_lettered,
      pending = summary.pending,
      "drained"
    ),
    SyncEvent::DeadLettered(letter) => tracing::warn!(
      id = %letter.item.id,
      path = %letter.item.request.path,
      reason = %describe_reason(&letter.reason),
      "dead-lettered"
    ),
    SyncEvent::CacheRefreshed(report) => tracing::info!(
      refreshed = report.refreshed.len(),
      failed = report.failed.len(),
      "cache refreshed"
    ),
  }
}

fn describe_reason(reason: &DeadLetterReason) -> String {
  match reason {
    DeadLetterReason::Rejected {
      status, message, ..
    } => match message {
      Some(m) => format!("rejected {}: {}", status, m),
      None => format!("rejected {}", status),
    },
    DeadLetterReason::Exhausted {
      attempts,
      last_error,
    } => format!("gave up after {} attempts: {}", attempts, last_error),
    DeadLetterReason::Invalid { error } => format!("invalid: {}", error),
  }
}

fn print_outcome(outcome: FetchOutcome) -> Result<()> {
  match outcome {
    FetchOutcome::Response(response) => {
      println!("{}", response.status);
      println!("{}", serde_json::to_string_pretty(&response.body)?);
    }
    FetchOutcome::Queued(receipt) => {
      println!(
        "queued {} ({} pending, fingerprint {})",
        receipt.id, receipt.pending, receipt.fingerprint
      );
    }
    FetchOutcome::Cached(read) => print_read(&read)?,
  }
  Ok(())
}

fn print_read(read: &DatasetRead) -> Result<()> {
  match read {
    DatasetRead::Live(snapshot) => {
      println!("{} (live)", snapshot.dataset);
      println!("{}", serde_json::to_string_pretty(&snapshot.payload)?);
    }
    DatasetRead::Cached {
      snapshot,
      age,
      stale,
    } => {
      println!(
        "{} (cached {}s ago{})",
        snapshot.dataset,
        age.num_seconds(),
        if *stale { ", stale" } else { "" }
      );
      println!("{}", serde_json::to_string_pretty(&snapshot.payload)?);
    }
    DatasetRead::Missing(dataset) => println!("{}: no data available offline", dataset),
  }
  Ok(())
}
