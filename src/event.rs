use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

/// Lifecycle events delivered to the worker by its host
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
  /// Populate the current cache generation
  Install,
  /// Retire every other cache generation
  Activate,
  /// Outgoing request; `url` may be relative to the origin
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    accept: Option<String>,
  },
  /// Connectivity restored for a tagged category
  Sync { tag: String },
  Push {
    #[serde(default)]
    payload: Option<String>,
  },
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
  },
}

impl WorkerEvent {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Install => "install",
      Self::Activate => "activate",
      Self::Fetch { .. } => "fetch",
      Self::Sync { .. } => "sync",
      Self::Push { .. } => "push",
      Self::NotificationClick { .. } => "notification_click",
    }
  }

  /// Parse one JSON line, e.g. `{"event":"sync","tag":"sync-assessments"}`.
  pub fn parse(line: &str) -> Result<Self> {
    serde_json::from_str(line).map_err(|e| eyre!("Invalid event {:?}: {}", line, e))
  }
}

/// Event source that reads newline-delimited JSON events from a reader
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl EventHandler {
  /// Spawn a reader task over `input`; the stream ends at EOF.
  pub fn new<R>(input: R) -> Self
  where
    R: AsyncRead + Unpin + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      let mut lines = BufReader::new(input).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            if line.trim().is_empty() {
              continue;
            }
            match WorkerEvent::parse(&line) {
              Ok(event) => {
                if tx.send(event).is_err() {
                  break;
                }
              }
              Err(e) => warn!("skipping event: {}", e),
            }
          }
          Ok(None) => break,
          Err(e) => {
            warn!("failed to read events: {}", e);
            break;
          }
        }
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}
