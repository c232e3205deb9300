mod cache;
mod config;
mod db;
mod event;
mod fetch;
mod http;
mod logging;
mod network;
mod notify;
mod queue;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use url::Url;

use event::{EventHandler, WorkerEvent};
use queue::Category;
use worker::{EventOutcome, Worker};

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Offline-resilience worker: cache-first fetch, deferred form delivery, push notifications")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin to serve, overriding the config file
  #[arg(long, global = true)]
  origin: Option<Url>,

  /// Mirror logs to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Open the current cache generation and precache the app shell
  Install,
  /// Delete every cache generation except the current one
  Activate,
  /// Intercept a request as the page would issue it
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// Accept header, e.g. "text/html"
    #[arg(long)]
    accept: Option<String>,
  },
  /// Queue a JSON submission for deferred delivery
  Enqueue {
    /// assessment or consultation
    category: Category,
    /// JSON payload
    payload: String,
  },
  /// Deliver queued submissions for a sync tag (e.g. sync-assessments)
  Sync { tag: String },
  /// Render a push payload as a notification
  Push { payload: Option<String> },
  /// Route a notification click (explore, close, or none for a body click)
  Click { action: Option<String> },
  /// List queued submissions of a category
  Queue { category: Category },
  /// Show cache generations and queue depths
  Status,
  /// Read JSON-line events from stdin until EOF
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let worker = Worker::open(config)?;

  match args.command {
    Command::Install => dispatch(&worker, WorkerEvent::Install).await,
    Command::Activate => dispatch(&worker, WorkerEvent::Activate).await,
    Command::Fetch {
      url,
      method,
      accept,
    } => dispatch(&worker, WorkerEvent::Fetch { url, method, accept }).await,
    Command::Sync { tag } => dispatch(&worker, WorkerEvent::Sync { tag }).await,
    Command::Push { payload } => dispatch(&worker, WorkerEvent::Push { payload }).await,
    Command::Click { action } => {
      dispatch(&worker, WorkerEvent::NotificationClick { action }).await
    }
    Command::Enqueue { category, payload } => {
      serde_json::from_str::<serde_json::Value>(&payload)
        .map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let id = worker
        .queue()
        .enqueue(category, payload.into_bytes())
        .await?;
      println!("{}", serde_json::json!({ "queued": { "category": category.collection(), "id": id } }));
      Ok(())
    }
    Command::Queue { category } => {
      for entry in worker.queue().list_all(category).await? {
        println!(
          "{}",
          serde_json::json!({ "id": entry.id, "data": String::from_utf8_lossy(&entry.data) })
        );
      }
      Ok(())
    }
    Command::Status => status(&worker).await,
    Command::Run => {
      let events = EventHandler::new(tokio::io::stdin());
      Arc::new(worker)
        .run(events, |outcome| println!("{}", outcome.to_json()))
        .await;
      Ok(())
    }
  }
}

async fn dispatch(worker: &Worker, event: WorkerEvent) -> Result<()> {
  worker
    .handle(event, |outcome: EventOutcome| println!("{}", outcome.to_json()))
    .await
}

async fn status(worker: &Worker) -> Result<()> {
  let current = worker.generation();
  let generations = worker.cache().generations().await?;
  let cached = worker.cache().keys(current).await?;

  let mut queues = serde_json::Map::new();
  for category in Category::ALL {
    queues.insert(
      category.collection().to_string(),
      worker.queue().pending(category).await?.into(),
    );
  }

  println!(
    "{}",
    serde_json::to_string_pretty(&serde_json::json!({
      "current": current.name(),
      "generations": generations,
      "cached": cached.iter().map(|(method, url)| format!("{} {}", method, url)).collect::<Vec<_>>(),
      "queues": queues,
    }))
    .map_err(|e| eyre!("Failed to render status: {}", e))?
  );
  Ok(())
}
