//! Cache storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedResponse, RequestKey};
use crate::net::Response;

/// Trait for cache storage backends.
///
/// A backend holds any number of named generations, each an independent
/// request → response map. At most one generation is marked active.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open(&self, generation: &str) -> Result<()>;

  /// Look up a response in one generation.
  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous one for the same key.
  /// Fails if the generation does not exist; only `open`, `store_all` and
  /// `set_active_generation` create generations.
  fn store(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store several responses; either all of them are written or none.
  fn store_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Names of every stored generation.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and everything in it. Returns whether it existed.
  fn delete_generation(&self, generation: &str) -> Result<bool>;

  /// The generation most recently marked active.
  fn active_generation(&self) -> Result<Option<String>>;

  /// Mark a generation as the active one.
  fn set_active_generation(&self, generation: &str) -> Result<()>;
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Default)]
struct MemoryState {
  generations: BTreeMap<String, HashMap<RequestKey, CachedResponse>>,
  active: Option<String>,
}

/// Storage that lives only as long as the process.
/// Used for ephemeral runs and as the store in tests.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, generation: &str) -> Result<()> {
    self
      .state()?
      .generations
      .entry(generation.to_string())
      .or_default();
    Ok(())
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .state()?
        .generations
        .get(generation)
        .and_then(|entries| entries.get(key))
        .cloned(),
    )
  }

  fn store(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut state = self.state()?;
    let cache = state
      .generations
      .get_mut(generation)
      .ok_or_else(|| eyre!("Generation {} does not exist", generation))?;

    cache.insert(
      key.clone(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn store_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut state = self.state()?;
    let cache = state.generations.entry(generation.to_string()).or_default();
    let cached_at = Utc::now();

    for (key, response) in entries {
      cache.insert(
        key.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at,
        },
      );
    }

    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    Ok(self.state()?.generations.keys().cloned().collect())
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let mut state = self.state()?;
    if state.active.as_deref() == Some(generation) {
      state.active = None;
    }
    Ok(state.generations.remove(generation).is_some())
  }

  fn active_generation(&self) -> Result<Option<String>> {
    Ok(self.state()?.active.clone())
  }

  fn set_active_generation(&self, generation: &str) -> Result<()> {
    let mut state = self.state()?;
    state
      .generations
      .entry(generation.to_string())
      .or_default();
    state.active = Some(generation.to_string());
    Ok(())
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a database that disappears with the connection.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache generation
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Captured responses, keyed by request hash within a generation
CREATE TABLE IF NOT EXISTS responses (
    generation TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_responses_generation ON responses(generation);
"#;

/// Insert one response row. Callers own the surrounding transaction.
fn insert_response(
  conn: &Connection,
  generation: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO responses (generation, request_hash, method, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        generation,
        key.cache_hash(),
        key.method(),
        key.url(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", key.url(), e))?;

  Ok(())
}

fn generation_exists(conn: &Connection, generation: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT 1 FROM generations WHERE name = ?",
      params![generation],
      |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
    .map_err(|e| eyre!("Failed to check generation {}: {}", generation, e))
}

fn insert_generation(conn: &Connection, generation: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create generation {}: {}", generation, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, generation: &str) -> Result<()> {
    let conn = self.conn()?;
    insert_generation(&conn, generation)
  }

  fn lookup(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;

    let row: Option<(u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT status, headers, body, cached_at FROM responses
         WHERE generation = ? AND request_hash = ?",
        params![generation, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url(), e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key.url(), e))?;
        let cached_at = parse_datetime(&cached_at_str)?;

        Ok(Some(CachedResponse {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn store(&self, generation: &str, key: &RequestKey, response: &Response) -> Result<()> {
    // The connection lock spans the check and the insert
    let conn = self.conn()?;
    if !generation_exists(&conn, generation)? {
      return Err(eyre!("Generation {} does not exist", generation));
    }

    insert_response(&conn, generation, key, response)
  }

  fn store_all(&self, generation: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_generation(&tx, generation)?;
    for (key, response) in entries {
      // An early return drops `tx`, which rolls everything back
      insert_response(&tx, generation, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn delete_generation(&self, generation: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM responses WHERE generation = ?",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to delete responses of {}: {}", generation, e))?;

    let deleted = tx
      .execute("DELETE FROM generations WHERE name = ?", params![generation])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn active_generation(&self) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT name FROM generations WHERE active = 1 LIMIT 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active generation: {}", e))
  }

  fn set_active_generation(&self, generation: &str) -> Result<()> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    insert_generation(&tx, generation)?;
    tx.execute("UPDATE generations SET active = (name = ?)", params![generation])
      .map_err(|e| eyre!("Failed to activate generation {}: {}", generation, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
