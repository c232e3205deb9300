//! Relays queued submissions once connectivity is restored.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::{Category, QueueStore, QueuedSubmission};
use crate::http::Request;
use crate::network::Network;

/// Summary of one sync pass over a category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Ids delivered and removed from the store
  pub delivered: Vec<i64>,
  /// Ids left queued for the next pass, with the reason
  pub failed: Vec<(i64, String)>,
}

/// Drains a category's collection, delivering entries oldest first.
///
/// At most one pass per category runs at a time; a signal that arrives
/// mid-pass waits for it and then sees only what is still queued.
pub struct SyncCoordinator {
  store: QueueStore,
  network: Arc<dyn Network>,
  assessment_endpoint: Url,
  consultation_endpoint: Url,
  assessment_pass: Mutex<()>,
  consultation_pass: Mutex<()>,
}

impl SyncCoordinator {
  pub fn new(
    store: QueueStore,
    network: Arc<dyn Network>,
    assessment_endpoint: Url,
    consultation_endpoint: Url,
  ) -> Self {
    Self {
      store,
      network,
      assessment_endpoint,
      consultation_endpoint,
      assessment_pass: Mutex::new(()),
      consultation_pass: Mutex::new(()),
    }
  }

  fn pass_lock(&self, category: Category) -> &Mutex<()> {
    match category {
      Category::Assessment => &self.assessment_pass,
      Category::Consultation => &self.consultation_pass,
    }
  }

  fn endpoint(&self, category: Category) -> &Url {
    match category {
      Category::Assessment => &self.assessment_endpoint,
      Category::Consultation => &self.consultation_endpoint,
    }
  }

  /// Run one full pass over `category`.
  ///
  /// Delivery is sequential. A failed entry stays queued and the pass moves
  /// on; only a failure to list the collection aborts it.
  pub async fn run(&self, category: Category) -> Result<SyncReport> {
    let lock = self.pass_lock(category);
    let _pass = match lock.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        debug!(%category, "waiting for the running pass to finish");
        lock.lock().await
      }
    };

    let entries = self.store.list_all(category).await?;
    let mut report = SyncReport::default();

    if entries.is_empty() {
      info!(%category, "nothing to sync");
      return Ok(report);
    }

    for entry in entries {
      match self.deliver(&entry).await {
        Ok(()) => match self.store.remove(category, entry.id).await {
          Ok(_) => report.delivered.push(entry.id),
          Err(e) => {
            // Delivered but still queued; the endpoint tolerates the replay
            warn!(%category, id = entry.id, "failed to remove delivered entry: {}", e);
            report.failed.push((entry.id, e.to_string()));
          }
        },
        Err(e) => {
          warn!(%category, id = entry.id, "delivery failed: {}", e);
          report.failed.push((entry.id, e.to_string()));
        }
      }
    }

    info!(
      %category,
      delivered = report.delivered.len(),
      failed = report.failed.len(),
      "sync pass complete"
    );
    Ok(report)
  }

  async fn deliver(&self, entry: &QueuedSubmission) -> Result<()> {
    let endpoint = self.endpoint(entry.category);
    let request = Request::post_json(endpoint.clone(), entry.data.clone());

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(eyre!("{} responded with status {}", endpoint, response.status));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::Response;
  use futures::future::{BoxFuture, FutureExt};
  use std::time::Duration;

  /// Endpoint that rejects payloads containing a marker string.
  #[derive(Default)]
  struct Endpoint {
    reject: std::sync::Mutex<Option<String>>,
    received: std::sync::Mutex<Vec<(String, String)>>,
    latency: std::sync::Mutex<Option<Duration>>,
  }

  impl Endpoint {
    fn reject(&self, marker: Option<&str>) {
      *self.reject.lock().unwrap() = marker.map(String::from);
    }

    fn slow_down(&self, latency: Duration) {
      *self.latency.lock().unwrap() = Some(latency);
    }

    fn received(&self) -> Vec<(String, String)> {
      self.received.lock().unwrap().clone()
    }
  }

  impl Network for Endpoint {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
      async move {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
          tokio::time::sleep(latency).await;
        }

        let body = String::from_utf8_lossy(request.body.as_deref().unwrap_or_default()).into_owned();
        self
          .received
          .lock()
          .unwrap()
          .push((request.url.path().to_string(), body.clone()));

        let rejected = self
          .reject
          .lock()
          .unwrap()
          .as_deref()
          .map(|m| body.contains(m))
          .unwrap_or(false);
        if rejected {
          Ok(Response::new(503, "unavailable"))
        } else {
          Ok(Response::new(201, "created"))
        }
      }
      .boxed()
    }
  }

  fn coordinator() -> (tempfile::TempDir, QueueStore, Arc<Endpoint>, SyncCoordinator) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(Some(&dir.path().join("queue.db"))).unwrap();
    let store = QueueStore::open(&db).unwrap();
    let endpoint = Arc::new(Endpoint::default());
    let coordinator = SyncCoordinator::new(
      store.clone(),
      endpoint.clone(),
      Url::parse("https://app.test/api/assessments").unwrap(),
      Url::parse("https://app.test/api/consultations").unwrap(),
    );
    (dir, store, endpoint, coordinator)
  }

  #[tokio::test]
  async fn test_failed_entry_stays_and_is_retried_alone() {
    let (_dir, store, endpoint, coordinator) = coordinator();
    let a = store
      .enqueue(Category::Assessment, br#"{"name":"A"}"#.to_vec())
      .await
      .unwrap();
    let b = store
      .enqueue(Category::Assessment, br#"{"name":"B"}"#.to_vec())
      .await
      .unwrap();
    endpoint.reject(Some("\"A\""));

    let report = coordinator.run(Category::Assessment).await.unwrap();
    assert_eq!(report.delivered, vec![b]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, a);
    let left: Vec<i64> = store
      .list_all(Category::Assessment)
      .await
      .unwrap()
      .iter()
      .map(|e| e.id)
      .collect();
    assert_eq!(left, vec![a]);

    // Oldest first, and B was attempted even though A failed
    let first_pass: Vec<String> = endpoint.received().into_iter().map(|(_, body)| body).collect();
    assert_eq!(first_pass, vec![r#"{"name":"A"}"#, r#"{"name":"B"}"#]);

    endpoint.reject(None);
    let report = coordinator.run(Category::Assessment).await.unwrap();
    assert_eq!(report.delivered, vec![a]);
    assert!(report.failed.is_empty());
    assert_eq!(endpoint.received().len(), 3);
    assert_eq!(store.pending(Category::Assessment).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_categories_use_their_own_endpoint() {
    let (_dir, store, endpoint, coordinator) = coordinator();
    store.enqueue(Category::Assessment, b"{}".to_vec()).await.unwrap();
    store.enqueue(Category::Consultation, b"{}".to_vec()).await.unwrap();

    coordinator.run(Category::Consultation).await.unwrap();
    assert_eq!(endpoint.received()[0].0, "/api/consultations");
    // The other collection is untouched
    assert_eq!(store.pending(Category::Assessment).await.unwrap(), 1);

    coordinator.run(Category::Assessment).await.unwrap();
    assert_eq!(endpoint.received()[1].0, "/api/assessments");
  }

  #[tokio::test]
  async fn test_overlapping_passes_deliver_each_entry_once() {
    let (_dir, store, endpoint, coordinator) = coordinator();
    let a = store.enqueue(Category::Assessment, b"{\"n\":1}".to_vec()).await.unwrap();
    let b = store.enqueue(Category::Assessment, b"{\"n\":2}".to_vec()).await.unwrap();
    endpoint.slow_down(Duration::from_millis(30));

    let (first, second) = tokio::join!(
      coordinator.run(Category::Assessment),
      coordinator.run(Category::Assessment)
    );
    let mut delivered = first.unwrap().delivered;
    delivered.extend(second.unwrap().delivered);
    delivered.sort();

    assert_eq!(delivered, vec![a, b]);
    assert_eq!(endpoint.received().len(), 2);
    assert_eq!(store.pending(Category::Assessment).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_passes_of_different_categories_do_not_wait_on_each_other() {
    let (_dir, store, endpoint, coordinator) = coordinator();
    store.enqueue(Category::Assessment, b"{}".to_vec()).await.unwrap();
    store.enqueue(Category::Consultation, b"{}".to_vec()).await.unwrap();
    endpoint.slow_down(Duration::from_millis(30));

    let (assessments, consultations) = tokio::join!(
      coordinator.run(Category::Assessment),
      coordinator.run(Category::Consultation)
    );
    assert_eq!(assessments.unwrap().delivered.len(), 1);
    assert_eq!(consultations.unwrap().delivered.len(), 1);
  }

  #[tokio::test]
  async fn test_network_error_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(Some(&dir.path().join("queue.db"))).unwrap();
    let store = QueueStore::open(&db).unwrap();
    let network = Arc::new(crate::network::fake::FakeNetwork::new());
    network.set_offline(true);
    let coordinator = SyncCoordinator::new(
      store.clone(),
      network,
      Url::parse("https://app.test/api/assessments").unwrap(),
      Url::parse("https://app.test/api/consultations").unwrap(),
    );

    store.enqueue(Category::Consultation, b"{}".to_vec()).await.unwrap();
    store.enqueue(Category::Consultation, b"{}".to_vec()).await.unwrap();

    let report = coordinator.run(Category::Consultation).await.unwrap();
    assert!(report.delivered.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert_eq!(store.pending(Category::Consultation).await.unwrap(), 2);
  }
}
