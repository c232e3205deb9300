//! Worker runtime: owns the components and dispatches lifecycle events.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::cache::{Generation, ResourceCache, ResponseSource, SqliteStorage, WarmReport};
use crate::config::{Config, WarmPolicy};
use crate::db::Database;
use crate::event::{EventHandler, WorkerEvent};
use crate::fetch::FetchInterceptor;
use crate::http::{Request, Response};
use crate::network::{HttpNetwork, Network};
use crate::notify::{ClickRoute, ConsoleHost, Notification, NotificationHost, NotificationRouter};
use crate::queue::{Category, QueueStore, SyncCoordinator, SyncReport};

/// What handling one event produced.
#[derive(Debug)]
pub enum EventOutcome {
  Installed(WarmReport),
  Activated { deleted: Vec<String> },
  Fetched {
    source: ResponseSource,
    response: Option<Response>,
  },
  Synced {
    category: Category,
    report: SyncReport,
  },
  Pushed(Notification),
  Clicked(ClickRoute),
  /// Event understood but not acted on
  Ignored(String),
}

impl EventOutcome {
  pub fn to_json(&self) -> serde_json::Value {
    match self {
      Self::Installed(report) => json!({
        "installed": {
          "stored": report.stored(),
          "failed": report
            .failures()
            .map(|o| json!({ "url": o.url.as_str(), "error": o.error }))
            .collect::<Vec<_>>(),
        }
      }),
      Self::Activated { deleted } => json!({ "activated": { "deleted": deleted } }),
      Self::Fetched { source, response } => json!({
        "fetched": {
          "source": source.to_string(),
          "status": response.as_ref().map(|r| r.status),
          "body": response.as_ref().map(Response::body_text),
        }
      }),
      Self::Synced { category, report } => json!({
        "synced": {
          "category": category.collection(),
          "delivered": report.delivered,
          "failed": report.failed.iter().map(|(id, _)| id).collect::<Vec<_>>(),
        }
      }),
      Self::Pushed(notification) => json!({ "pushed": notification }),
      Self::Clicked(ClickRoute::Opened(url)) => json!({ "clicked": { "opened": url.as_str() } }),
      Self::Clicked(ClickRoute::Dismissed) => json!({ "clicked": { "opened": null } }),
      Self::Ignored(reason) => json!({ "ignored": reason }),
    }
  }
}

pub struct Worker {
  config: Config,
  generation: Generation,
  cache: ResourceCache,
  network: Arc<dyn Network>,
  interceptor: FetchInterceptor,
  queue: QueueStore,
  sync: SyncCoordinator,
  notifications: NotificationRouter,
}

impl Worker {
  /// Build a worker that talks to the real network and prints notifications.
  pub fn open(config: Config) -> Result<Self> {
    let db = Database::open(config.storage.path.as_deref())?;
    let network = Arc::new(HttpNetwork::new(
      config.origin.clone(),
      Duration::from_secs(config.network.timeout_secs),
    )?);
    Self::new(config, &db, network, Arc::new(ConsoleHost))
  }

  pub fn new(
    config: Config,
    db: &Database,
    network: Arc<dyn Network>,
    host: Arc<dyn NotificationHost>,
  ) -> Result<Self> {
    let generation = Generation::new(&config.cache.name, &config.cache.version);
    let cache = ResourceCache::new(SqliteStorage::open(db)?);
    let queue = QueueStore::open(db)?;

    let interceptor = FetchInterceptor::new(
      cache.clone(),
      Arc::clone(&network),
      config.origin.clone(),
      config.cache.allowed_origins.clone(),
      config.resolve(&config.cache.offline_document)?,
    );
    let sync = SyncCoordinator::new(
      queue.clone(),
      Arc::clone(&network),
      config.resolve(&config.sync.assessment_endpoint)?,
      config.resolve(&config.sync.consultation_endpoint)?,
    );
    let notifications = NotificationRouter::new(
      config.notifications.clone(),
      config.resolve(&config.notifications.details_url)?,
      config.resolve(&config.notifications.default_url)?,
      host,
    );

    Ok(Self {
      config,
      generation,
      cache,
      network,
      interceptor,
      queue,
      sync,
      notifications,
    })
  }

  pub fn generation(&self) -> &Generation {
    &self.generation
  }

  pub fn cache(&self) -> &ResourceCache {
    &self.cache
  }

  pub fn queue(&self) -> &QueueStore {
    &self.queue
  }

  /// Pre-populate the current generation and open it.
  ///
  /// Under the atomic policy a failed install writes nothing, so a
  /// generation installed earlier under the same version keeps serving.
  pub async fn install(&self) -> Result<WarmReport> {
    let urls = self
      .config
      .cache
      .precache
      .iter()
      .map(|path| self.config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    let policy = self.config.cache.warm_policy;
    let report = self
      .cache
      .warm(&self.generation, self.network.as_ref(), &urls, policy)
      .await;

    if policy == WarmPolicy::Atomic && !report.is_complete() {
      let failed: Vec<String> = report
        .failures()
        .map(|o| format!("{} ({})", o.url, o.error.as_deref().unwrap_or_default()))
        .collect();
      return Err(eyre!(
        "Install of {} failed; could not precache: {}",
        self.generation,
        failed.join(", ")
      ));
    }

    self.cache.open(&self.generation).await?;
    info!(generation = %self.generation, "installed");
    Ok(report)
  }

  /// Delete every generation but the current one.
  pub async fn activate(&self) -> Result<Vec<String>> {
    let deleted = self.cache.evict_stale(&self.generation).await?;
    info!(generation = %self.generation, deleted = deleted.len(), "activated");
    Ok(deleted)
  }

  fn fetch_request(&self, url: &str, method: Option<&str>, accept: Option<&str>) -> Result<Request> {
    let url = self.config.resolve(url)?;
    let method = match method {
      Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {:?}: {}", m, e))?,
      None => Method::GET,
    };

    let mut request = Request::get(url);
    request.method = method;
    if let Some(accept) = accept {
      request = request.with_header("accept", accept);
    }
    Ok(request)
  }

  /// Handle one event.
  ///
  /// `respond` receives the outcome as soon as it is known; the returned
  /// future completes only once all work the event started has finished
  /// (for fetches, that includes the background cache write).
  pub async fn handle<F>(&self, event: WorkerEvent, respond: F) -> Result<()>
  where
    F: FnOnce(EventOutcome) + Send,
  {
    match event {
      WorkerEvent::Install => respond(EventOutcome::Installed(self.install().await?)),
      WorkerEvent::Activate => respond(EventOutcome::Activated {
        deleted: self.activate().await?,
      }),
      WorkerEvent::Fetch {
        url,
        method,
        accept,
      } => {
        let request = self.fetch_request(&url, method.as_deref(), accept.as_deref())?;
        let mut interception = self.interceptor.intercept(&self.generation, &request).await;
        respond(EventOutcome::Fetched {
          source: interception.source,
          response: interception.response.take(),
        });
        interception.wait_until().await;
      }
      WorkerEvent::Sync { tag } => match Category::from_sync_tag(&tag) {
        Some(category) => respond(EventOutcome::Synced {
          category,
          report: self.sync.run(category).await?,
        }),
        None => {
          warn!(%tag, "ignoring sync for unknown tag");
          respond(EventOutcome::Ignored(format!("unknown sync tag {:?}", tag)));
        }
      },
      WorkerEvent::Push { payload } => {
        respond(EventOutcome::Pushed(self.notifications.on_push(payload.as_deref())))
      }
      WorkerEvent::NotificationClick { action } => {
        respond(EventOutcome::Clicked(self.notifications.on_click(action.as_deref())))
      }
    }
    Ok(())
  }

  /// Dispatch events until the source is exhausted.
  ///
  /// Every event runs on its own task; failures are logged and never stop the
  /// loop. All outstanding handlers are joined before returning.
  pub async fn run<F>(self: Arc<Self>, mut events: EventHandler, respond: F)
  where
    F: Fn(EventOutcome) + Clone + Send + Sync + 'static,
  {
    let mut tasks = JoinSet::new();

    while let Some(event) = events.next().await {
      let worker = Arc::clone(&self);
      let respond = respond.clone();
      tasks.spawn(async move {
        let name = event.name();
        if let Err(e) = worker.handle(event, respond).await {
          error!(event = name, "handler failed: {:#}", e);
        }
      });

      while let Some(finished) = tasks.try_join_next() {
        if let Err(e) = finished {
          error!("event task panicked: {}", e);
        }
      }
    }

    while let Some(finished) = tasks.join_next().await {
      if let Err(e) = finished {
        error!("event task panicked: {}", e);
      }
    }
  }
}
