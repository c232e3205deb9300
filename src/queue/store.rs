//! SQLite-backed queue store with one collection per category.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Category, QueuedSubmission};
use crate::db::Database;

struct Collections {
  assessments: Mutex<Connection>,
  consultations: Mutex<Connection>,
}

impl Collections {
  fn connection(&self, category: Category) -> Result<MutexGuard<'_, Connection>> {
    let conn = match category {
      Category::Assessment => &self.assessments,
      Category::Consultation => &self.consultations,
    };
    conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn enqueue(&self, category: Category, data: &[u8]) -> Result<i64> {
    let conn = self.connection(category)?;

    conn
      .execute(
        &format!("INSERT INTO {} (data) VALUES (?)", category.collection()),
        params![data],
      )
      .map_err(|e| eyre!("Failed to enqueue into {}: {}", category, e))?;

    Ok(conn.last_insert_rowid())
  }

  fn list_all(&self, category: Category) -> Result<Vec<QueuedSubmission>> {
    let conn = self.connection(category)?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT id, data FROM {} ORDER BY id",
        category.collection()
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let entries = stmt
      .query_map([], |row| {
        Ok(QueuedSubmission {
          id: row.get(0)?,
          category,
          data: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list {}: {}", category, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read {} row: {}", category, e))?;

    Ok(entries)
  }

  fn remove(&self, category: Category, id: i64) -> Result<bool> {
    let conn = self.connection(category)?;

    let removed = conn
      .execute(
        &format!("DELETE FROM {} WHERE id = ?", category.collection()),
        params![id],
      )
      .map_err(|e| eyre!("Failed to remove {} #{}: {}", category, id, e))?;

    Ok(removed > 0)
  }

  fn pending(&self, category: Category) -> Result<usize> {
    let conn = self.connection(category)?;

    let count: i64 = conn
      .query_row(
        &format!("SELECT COUNT(*) FROM {}", category.collection()),
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {}: {}", category, e))?;

    Ok(count as usize)
  }
}

/// Durable store of queued submissions.
///
/// Each collection owns a separate connection, so work on one collection
/// never waits behind the other's lock. Every call runs on the blocking
/// pool; clones share the same connections.
#[derive(Clone)]
pub struct QueueStore {
  collections: Arc<Collections>,
}

impl QueueStore {
  pub fn open(db: &Database) -> Result<Self> {
    Ok(Self {
      collections: Arc::new(Collections {
        assessments: Mutex::new(db.connect()?),
        consultations: Mutex::new(db.connect()?),
      }),
    })
  }

  async fn blocking<T, F>(&self, task: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Collections) -> Result<T> + Send + 'static,
  {
    let collections = Arc::clone(&self.collections);
    tokio::task::spawn_blocking(move || task(&collections))
      .await
      .map_err(|e| eyre!("Queue store task failed: {}", e))?
  }

  /// Queue a payload, returning its newly assigned id.
  pub async fn enqueue(&self, category: Category, data: Vec<u8>) -> Result<i64> {
    self
      .blocking(move |collections| collections.enqueue(category, &data))
      .await
  }

  /// All entries of a category, oldest first.
  pub async fn list_all(&self, category: Category) -> Result<Vec<QueuedSubmission>> {
    self
      .blocking(move |collections| collections.list_all(category))
      .await
  }

  /// Remove an entry. Removing an id that is already gone is not an error.
  pub async fn remove(&self, category: Category, id: i64) -> Result<bool> {
    self
      .blocking(move |collections| collections.remove(category, id))
      .await
  }

  pub async fn pending(&self, category: Category) -> Result<usize> {
    self
      .blocking(move |collections| collections.pending(category))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> (tempfile::TempDir, QueueStore) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(Some(&dir.path().join("queue.db"))).unwrap();
    (dir, QueueStore::open(&db).unwrap())
  }

  #[tokio::test]
  async fn test_enqueue_then_list_preserves_order() {
    let (_dir, store) = store();
    let payloads: Vec<String> = (0..5).map(|i| format!(r#"{{"answer":{}}}"#, i)).collect();

    let mut ids = Vec::new();
    for payload in &payloads {
      ids.push(
        store
          .enqueue(Category::Assessment, payload.as_bytes().to_vec())
          .await
          .unwrap(),
      );
    }

    let listed = store.list_all(Category::Assessment).await.unwrap();
    assert_eq!(listed.len(), 5);
    assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), ids);
    for (entry, payload) in listed.iter().zip(&payloads) {
      assert_eq!(entry.data, payload.as_bytes());
    }

    assert!(ids.windows(2).all(|w| w[0] < w[1]));
  }

  #[tokio::test]
  async fn test_collections_are_independent() {
    let (_dir, store) = store();
    store.enqueue(Category::Assessment, b"a".to_vec()).await.unwrap();
    store.enqueue(Category::Consultation, b"c1".to_vec()).await.unwrap();
    store.enqueue(Category::Consultation, b"c2".to_vec()).await.unwrap();

    assert_eq!(store.pending(Category::Assessment).await.unwrap(), 1);
    assert_eq!(store.pending(Category::Consultation).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_ids_are_never_reused() {
    let (_dir, store) = store();
    let first = store.enqueue(Category::Consultation, b"one".to_vec()).await.unwrap();
    assert!(store.remove(Category::Consultation, first).await.unwrap());

    let second = store.enqueue(Category::Consultation, b"two".to_vec()).await.unwrap();
    assert!(second > first);

    // Second removal of the same id is a no-op
    assert!(!store.remove(Category::Consultation, first).await.unwrap());
  }

  #[tokio::test]
  async fn test_clones_share_collections() {
    let (_dir, store) = store();
    let other = store.clone();
    store.enqueue(Category::Assessment, b"{}".to_vec()).await.unwrap();
    assert_eq!(other.pending(Category::Assessment).await.unwrap(), 1);
  }
}
