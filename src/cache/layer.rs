//! Resource cache: warm, lookup, put and generation eviction.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::{CacheStorage, SqliteStorage};
use super::traits::{Generation, RequestIdentity};
use crate::config::WarmPolicy;
use crate::http::{Request, Response, ResponseKind};
use crate::network::Network;

/// Outcome of warming one URL.
#[derive(Debug, Clone)]
pub struct WarmOutcome {
  pub url: Url,
  /// None on success, otherwise why the entry was not stored
  pub error: Option<String>,
}

/// Per-URL summary of a bulk warm.
#[derive(Debug, Clone, Default)]
pub struct WarmReport {
  pub outcomes: Vec<WarmOutcome>,
}

impl WarmReport {
  pub fn stored(&self) -> usize {
    self.outcomes.iter().filter(|o| o.error.is_none()).count()
  }

  pub fn failures(&self) -> impl Iterator<Item = &WarmOutcome> {
    self.outcomes.iter().filter(|o| o.error.is_some())
  }

  pub fn is_complete(&self) -> bool {
    self.failures().next().is_none()
  }
}

/// Whether a response to `request` may be written to the cache.
///
/// Only GET responses with status 200 and a basic (same-origin) or cors
/// (allow-listed cross-origin) kind qualify.
pub fn is_cacheable(request: &Request, response: &Response) -> bool {
  request.method == Method::GET
    && response.status == 200
    && matches!(response.kind, ResponseKind::Basic | ResponseKind::Cors)
}

type Fetched = (Request, std::result::Result<Response, String>);

/// Named, versioned cache of responses.
///
/// Every operation takes the generation it works on explicitly; the cache
/// itself holds no notion of a "current" generation. Storage calls run on
/// the blocking pool so they never stall the event tasks.
pub struct ResourceCache<S: CacheStorage = SqliteStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> ResourceCache<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  async fn blocking<T, F>(&self, task: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    let storage = Arc::clone(&self.storage);
    tokio::task::spawn_blocking(move || task(storage.as_ref()))
      .await
      .map_err(|e| eyre!("Cache storage task failed: {}", e))?
  }

  /// Add a generation to the live set.
  pub async fn open(&self, generation: &Generation) -> Result<()> {
    let generation = generation.clone();
    self
      .blocking(move |storage| storage.open_generation(&generation))
      .await
  }

  /// Fetch every URL concurrently, then store the results per `policy`.
  ///
  /// Best effort stores each success on its own, so one failing URL never
  /// prevents the others from being stored. Atomic writes every entry in a
  /// single transaction, and writes nothing unless every URL was fetched;
  /// whatever the generation held before is left as it was.
  pub async fn warm(
    &self,
    generation: &Generation,
    network: &dyn Network,
    urls: &[Url],
    policy: WarmPolicy,
  ) -> WarmReport {
    let attempts = urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let fetched = match network.fetch(&request).await {
        Ok(response) if is_cacheable(&request, &response) => Ok(response),
        Ok(response) => Err(format!("status {}", response.status)),
        Err(e) => Err(e.to_string()),
      };
      (request, fetched)
    });
    let fetched = join_all(attempts).await;

    let outcomes = match policy {
      WarmPolicy::BestEffort => self.store_each(generation, fetched).await,
      WarmPolicy::Atomic => self.store_all(generation, fetched).await,
    };
    for outcome in &outcomes {
      if let Some(reason) = &outcome.error {
        warn!(url = %outcome.url, %reason, "precache failed");
      }
    }

    let report = WarmReport { outcomes };
    info!(
      generation = %generation,
      stored = report.stored(),
      total = report.outcomes.len(),
      "cache warmed"
    );
    report
  }

  async fn store_each(&self, generation: &Generation, fetched: Vec<Fetched>) -> Vec<WarmOutcome> {
    let mut outcomes = Vec::with_capacity(fetched.len());
    for (request, fetched) in fetched {
      let error = match fetched {
        Ok(response) => self
          .put(generation, &request, &response)
          .await
          .err()
          .map(|e| e.to_string()),
        Err(reason) => Some(reason),
      };
      outcomes.push(WarmOutcome {
        url: request.url,
        error,
      });
    }
    outcomes
  }

  async fn store_all(&self, generation: &Generation, fetched: Vec<Fetched>) -> Vec<WarmOutcome> {
    if fetched.iter().any(|(_, f)| f.is_err()) {
      return fetched
        .into_iter()
        .map(|(request, f)| WarmOutcome {
          url: request.url,
          error: Some(
            f.err()
              .unwrap_or_else(|| "not stored: precache incomplete".to_string()),
          ),
        })
        .collect();
    }

    let urls: Vec<Url> = fetched.iter().map(|(request, _)| request.url.clone()).collect();
    let entries: Vec<(RequestIdentity, Response)> = fetched
      .into_iter()
      .filter_map(|(request, f)| f.ok().map(|response| (RequestIdentity::of(&request), response)))
      .collect();

    let target = generation.clone();
    let error = self
      .blocking(move |storage| storage.store_entries(&target, &entries))
      .await
      .err()
      .map(|e| e.to_string());

    urls
      .into_iter()
      .map(|url| WarmOutcome {
        url,
        error: error.clone(),
      })
      .collect()
  }

  /// Look up a request in a generation. Never mutates.
  pub async fn lookup(&self, generation: &Generation, request: &Request) -> Result<Option<Response>> {
    let generation = generation.clone();
    let identity = RequestIdentity::of(request);
    let entry = self
      .blocking(move |storage| storage.get_entry(&generation, &identity))
      .await?;
    Ok(entry.map(|e| {
      debug!(url = %request.url, cached_at = %e.cached_at, "cache entry found");
      e.response
    }))
  }

  /// Store a response if it is cacheable; silently ignore it otherwise.
  ///
  /// Returns whether the response was written.
  pub async fn put(
    &self,
    generation: &Generation,
    request: &Request,
    response: &Response,
  ) -> Result<bool> {
    if !is_cacheable(request, response) {
      debug!(url = %request.url, status = response.status, "not caching");
      return Ok(false);
    }

    let generation = generation.clone();
    let identity = RequestIdentity::of(request);
    let response = response.clone();
    self
      .blocking(move |storage| storage.store_entry(&generation, &identity, &response))
      .await?;
    Ok(true)
  }

  /// Delete every generation other than `current`, returning the deleted names.
  pub async fn evict_stale(&self, current: &Generation) -> Result<Vec<String>> {
    let current = current.name().to_string();
    self
      .blocking(move |storage| {
        let mut deleted = Vec::new();
        for name in storage.generations()? {
          if name == current {
            continue;
          }
          if storage.delete_generation(&name)? {
            info!(generation = %name, "deleted stale cache generation");
            deleted.push(name);
          }
        }
        Ok(deleted)
      })
      .await
  }

  pub async fn generations(&self) -> Result<Vec<String>> {
    self.blocking(|storage| storage.generations()).await
  }

  pub async fn keys(&self, generation: &Generation) -> Result<Vec<(String, String)>> {
    let generation = generation.clone();
    self.blocking(move |storage| storage.keys(&generation)).await
  }
}

impl<S: CacheStorage> Clone for ResourceCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
