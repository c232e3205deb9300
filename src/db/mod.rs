mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location of the worker's SQLite file.
///
/// Every component opens its own connection through [`Database::connect`], so
/// the resource cache and each queue collection never share a connection lock.
#[derive(Debug, Clone)]
pub struct Database {
  path: PathBuf,
}

impl Database {
  /// Open or create the database at the given location, or the default one
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let db = Self { path };
    // Fail early if the file cannot be opened or migrated
    db.connect()?;

    Ok(db)
  }

  /// Get the default database path
  fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("outpost.db"))
  }

  /// Open a fresh connection with WAL journaling and a busy timeout.
  pub fn connect(&self) -> Result<Connection> {
    let conn = Connection::open(&self.path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", self.path.display(), e))?;

    conn
      .busy_timeout(Duration::from_secs(5))
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
    conn
      .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
      .map_err(|e| eyre!("Failed to enable WAL: {}", e))?;
    conn
      .pragma_update(None, "foreign_keys", "ON")
      .map_err(|e| eyre!("Failed to enable foreign keys: {}", e))?;

    Self::run_migrations(&conn)?;
    Ok(conn)
  }

  /// Run database migrations
  fn run_migrations(conn: &Connection) -> Result<()> {
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
    Ok(())
  }
}
