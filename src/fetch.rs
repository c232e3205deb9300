//! Cache-first fetch interception.

use color_eyre::Result;
use reqwest::Method;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

use crate::cache::{is_cacheable, CacheStorage, Generation, ResourceCache, ResponseSource, SqliteStorage};
use crate::http::{Request, Response};
use crate::network::Network;

/// Result of intercepting one request.
#[derive(Debug)]
pub struct Interception {
  pub response: Option<Response>,
  pub source: ResponseSource,
  write_behind: Option<JoinHandle<()>>,
}

impl Interception {
  fn new(response: Option<Response>, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      write_behind: None,
    }
  }

  /// Wait for the background cache write (if any) to finish.
  ///
  /// The response is usable before this is awaited; the event that produced
  /// it must not complete until it has been.
  pub async fn wait_until(&mut self) {
    if let Some(handle) = self.write_behind.take() {
      if let Err(e) = handle.await {
        error!("cache write-behind task failed: {}", e);
      }
    }
  }
}

/// Decides per request between cache, network and offline fallback.
pub struct FetchInterceptor<S: CacheStorage = SqliteStorage> {
  cache: ResourceCache<S>,
  network: Arc<dyn Network>,
  origin: Url,
  allowed_origins: BTreeSet<String>,
  offline_document: Url,
}

impl<S: CacheStorage> FetchInterceptor<S> {
  pub fn new(
    cache: ResourceCache<S>,
    network: Arc<dyn Network>,
    origin: Url,
    allowed_origins: BTreeSet<String>,
    offline_document: Url,
  ) -> Self {
    Self {
      cache,
      network,
      origin,
      allowed_origins,
      offline_document,
    }
  }

  /// Whether the worker handles this request at all.
  fn in_scope(&self, request: &Request) -> bool {
    if request.method != Method::GET {
      return false;
    }
    if request.url.origin() == self.origin.origin() {
      return true;
    }
    request
      .url
      .host_str()
      .map(|host| self.allowed_origins.contains(&host.to_ascii_lowercase()))
      .unwrap_or(false)
  }

  pub async fn intercept(&self, generation: &Generation, request: &Request) -> Interception {
    if !self.in_scope(request) {
      debug!(method = %request.method, url = %request.url, "passing through");
      let response = self.network.fetch(request).await.ok();
      return Interception::new(response, ResponseSource::Bypass);
    }

    match self.cache.lookup(generation, request).await {
      Ok(Some(response)) => {
        debug!(url = %request.url, "cache hit");
        return Interception::new(Some(response), ResponseSource::Cache);
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, "cache lookup failed: {}", e),
    }

    match self.network.fetch(request).await {
      Ok(response) if is_cacheable(request, &response) => {
        let write_behind = self.spawn_put(generation, request, &response);
        Interception {
          response: Some(response),
          source: ResponseSource::Network,
          write_behind: Some(write_behind),
        }
      }
      Ok(response) => Interception::new(Some(response), ResponseSource::Network),
      Err(e) => {
        warn!(url = %request.url, "network unavailable: {}", e);
        self.fallback(generation, request).await
      }
    }
  }

  fn spawn_put(
    &self,
    generation: &Generation,
    request: &Request,
    response: &Response,
  ) -> JoinHandle<()> {
    let cache = self.cache.clone();
    let generation = generation.clone();
    let request = request.clone();
    let response = response.clone();

    tokio::spawn(async move {
      if let Err(e) = cache.put(&generation, &request, &response).await {
        warn!(url = %request.url, "failed to cache response: {}", e);
      }
    })
  }

  async fn fallback(&self, generation: &Generation, request: &Request) -> Interception {
    if !request.accepts_html() {
      return Interception::new(None, ResponseSource::Unavailable);
    }

    match self.offline_document(generation).await {
      Ok(Some(document)) => Interception::new(Some(document), ResponseSource::Offline),
      Ok(None) => {
        warn!(url = %self.offline_document, "offline document is not cached");
        Interception::new(None, ResponseSource::Unavailable)
      }
      Err(e) => {
        warn!("failed to read offline document: {}", e);
        Interception::new(None, ResponseSource::Unavailable)
      }
    }
  }

  async fn offline_document(&self, generation: &Generation) -> Result<Option<Response>> {
    self
      .cache
      .lookup(generation, &Request::get(self.offline_document.clone()))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedEntry, RequestIdentity};
  use crate::db::Database;
  use crate::http::ResponseKind;
  use crate::network::fake::FakeNetwork;

  struct Fixture {
    _dir: tempfile::TempDir,
    cache: ResourceCache,
    network: Arc<FakeNetwork>,
    interceptor: FetchInterceptor,
    generation: Generation,
  }

  fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(Some(&dir.path().join("cache.db"))).unwrap();
    let cache = ResourceCache::new(SqliteStorage::open(&db).unwrap());
    let network = Arc::new(FakeNetwork::new());
    let interceptor = FetchInterceptor::new(
      cache.clone(),
      network.clone(),
      url("https://app.test/"),
      BTreeSet::from(["fonts.example.com".to_string()]),
      url("https://app.test/offline.html"),
    );
    Fixture {
      _dir: dir,
      cache,
      network,
      interceptor,
      generation: Generation::new("outpost", "v1"),
    }
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  async fn intercept(f: &Fixture, request: &Request) -> Interception {
    let mut result = f.interceptor.intercept(&f.generation, request).await;
    result.wait_until().await;
    result
  }

  #[tokio::test]
  async fn test_non_get_never_touches_cache() {
    let f = fixture();
    let target = url("https://app.test/api/assessments");
    f.network.route(target.as_str(), Response::new(200, "created"));
    // Even a cached GET for the same URL must not be served to a POST
    f.cache
      .put(&f.generation, &Request::get(target.clone()), &Response::new(200, "cached"))
      .await
      .unwrap();

    let post = Request::post_json(target.clone(), b"{}".to_vec());
    let result = intercept(&f, &post).await;

    assert_eq!(result.source, ResponseSource::Bypass);
    assert_eq!(result.response.unwrap().body, b"created".to_vec());
    let cached = f.cache.lookup(&f.generation, &Request::get(target)).await.unwrap();
    assert_eq!(cached.unwrap().body, b"cached".to_vec());
  }

  #[tokio::test]
  async fn test_cache_first_after_network_fetch() {
    let f = fixture();
    f.network.route("https://app.test/about", Response::new(200, "about"));
    let request = Request::get(url("https://app.test/about"));

    let first = intercept(&f, &request).await;
    assert_eq!(first.source, ResponseSource::Network);

    f.network.clear_calls();
    let second = intercept(&f, &request).await;
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.unwrap().body, b"about".to_vec());
    assert!(f.network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_error_and_opaque_responses_not_cached() {
    let f = fixture();
    f.network.route("https://app.test/broken", Response::new(500, "boom"));
    f.network.route(
      "https://fonts.example.com/font.woff2",
      Response::new(200, "").with_kind(ResponseKind::Opaque),
    );

    let broken = Request::get(url("https://app.test/broken"));
    let result = intercept(&f, &broken).await;
    assert_eq!(result.response.unwrap().status, 500);
    assert!(f.cache.lookup(&f.generation, &broken).await.unwrap().is_none());

    let font = Request::get(url("https://fonts.example.com/font.woff2"));
    let result = intercept(&f, &font).await;
    assert_eq!(result.source, ResponseSource::Network);
    assert!(f.cache.lookup(&f.generation, &font).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_foreign_origin_passes_through() {
    let f = fixture();
    f.network.route("https://cdn.other.test/lib.js", Response::new(200, "lib"));
    let request = Request::get(url("https://cdn.other.test/lib.js"));

    let result = intercept(&f, &request).await;
    assert_eq!(result.source, ResponseSource::Bypass);
    assert!(f.cache.lookup(&f.generation, &request).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_allow_listed_origin_is_cached() {
    let f = fixture();
    f.network.route(
      "https://fonts.example.com/css",
      Response::new(200, "css").with_kind(ResponseKind::Cors),
    );
    let request = Request::get(url("https://fonts.example.com/css"));

    intercept(&f, &request).await;
    assert!(f.cache.lookup(&f.generation, &request).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_offline_html_navigation_gets_offline_document() {
    let f = fixture();
    f.cache
      .put(
        &f.generation,
        &Request::get(url("https://app.test/offline.html")),
        &Response::new(200, "you are offline"),
      )
      .await
      .unwrap();
    f.network.set_offline(true);

    let request = Request::get(url("https://app.test/dashboard")).with_header("accept", "text/html");
    let result = intercept(&f, &request).await;
    assert_eq!(result.source, ResponseSource::Offline);
    assert_eq!(result.response.unwrap().body_text(), "you are offline");
  }

  #[tokio::test]
  async fn test_offline_non_html_gets_nothing() {
    let f = fixture();
    f.network.set_offline(true);

    let request = Request::get(url("https://app.test/data.json")).with_header("accept", "application/json");
    let result = intercept(&f, &request).await;
    assert_eq!(result.source, ResponseSource::Unavailable);
    assert!(result.response.is_none());
  }

  /// Storage that has nothing cached and refuses every write.
  struct ReadOnlyStorage;

  impl CacheStorage for ReadOnlyStorage {
    fn open_generation(&self, _generation: &Generation) -> Result<()> {
      Ok(())
    }

    fn delete_generation(&self, _name: &str) -> Result<bool> {
      Ok(false)
    }

    fn generations(&self) -> Result<Vec<String>> {
      Ok(Vec::new())
    }

    fn get_entry(
      &self,
      _generation: &Generation,
      _identity: &RequestIdentity,
    ) -> Result<Option<CachedEntry>> {
      Ok(None)
    }

    fn store_entry(
      &self,
      _generation: &Generation,
      identity: &RequestIdentity,
      _response: &Response,
    ) -> Result<()> {
      Err(color_eyre::eyre::eyre!("disk full while storing {}", identity.url))
    }

    fn store_entries(
      &self,
      _generation: &Generation,
      _entries: &[(RequestIdentity, Response)],
    ) -> Result<()> {
      Err(color_eyre::eyre::eyre!("disk full"))
    }

    fn keys(&self, _generation: &Generation) -> Result<Vec<(String, String)>> {
      Ok(Vec::new())
    }
  }

  #[tokio::test]
  async fn test_failed_cache_write_still_serves_network_response() {
    let network = Arc::new(FakeNetwork::new());
    network.route("https://app.test/report", Response::new(200, "report body"));
    let interceptor = FetchInterceptor::new(
      ResourceCache::new(ReadOnlyStorage),
      network,
      url("https://app.test/"),
      BTreeSet::new(),
      url("https://app.test/offline.html"),
    );

    let generation = Generation::new("outpost", "v1");
    let mut result = interceptor
      .intercept(&generation, &Request::get(url("https://app.test/report")))
      .await;
    result.wait_until().await;

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.unwrap().body_text(), "report body");
  }
}
