//! SQLite-backed persistence: content-addressed images and the document cache.
//!
//! One database file, `<cache_dir>/paper2md.sqlite3`, holds three tables:
//!
//! ```text
//! images    (key PK)                          content-addressed PNG blobs
//! documents (identity_hash PK)                Markdown, page texts, image refs
//! captions  (identity_hash, image_key) PK     one Caption per image per document
//! ```
//!
//! [`Database`] owns the connection behind a mutex; [`ImageStore`] and
//! [`Cache`] are cheap clones sharing it, so concurrent captioning workers
//! serialise their writes through SQLite transactions rather than ad-hoc
//! per-key locks.

pub mod cache;
pub mod images;

pub use cache::{Cache, CacheEntry, CachedImage};
pub use images::ImageStore;

use crate::error::CacheError;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Database filename inside the cache directory.
pub const DB_FILENAME: &str = "paper2md.sqlite3";

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    version     INTEGER NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS images (
    key         TEXT PRIMARY KEY,
    data        BLOB NOT NULL,
    byte_len    INTEGER NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS documents (
    identity_hash TEXT PRIMARY KEY,
    identity      TEXT NOT NULL,
    markdown      TEXT NOT NULL,
    images_json   TEXT NOT NULL,
    pages_json    TEXT NOT NULL DEFAULT '[]',
    updated_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS captions (
    identity_hash TEXT NOT NULL,
    image_key     TEXT NOT NULL,
    title         TEXT NOT NULL,
    description   TEXT NOT NULL,
    model         TEXT NOT NULL,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (identity_hash, image_key)
);
"#;

/// Thread-safe handle on the SQLite database.
#[derive(Clone)]
pub struct Database {
    db_path: PathBuf,
    connection: Arc<Mutex<Connection>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("db_path", &self.db_path).finish()
    }
}

impl Database {
    /// Open (creating if needed) `<cache_dir>/paper2md.sqlite3`.
    pub fn open(cache_dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.as_ref();
        std::fs::create_dir_all(cache_dir)?;
        let db_path = cache_dir.join(DB_FILENAME);
        info!("Opening cache database at {}", db_path.display());

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        initialize_schema(&conn)?;

        Ok(Self {
            db_path,
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, CacheError> {
        debug!("Creating in-memory cache database");
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            db_path: PathBuf::from(":memory:"),
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// Path of the database file (`:memory:` for in-memory databases).
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CacheError>,
    {
        let mut conn = self
            .connection
            .lock()
            .map_err(|_| CacheError::LockPoisoned)?;
        f(&mut conn)
    }

    /// ImageStore view over this database.
    pub fn image_store(&self) -> ImageStore {
        ImageStore::new(self.clone())
    }

    /// Cache view over this database.
    pub fn cache(&self) -> Cache {
        Cache::new(self.clone())
    }
}

fn initialize_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(SCHEMA)?;
    let current: Option<i32> = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .ok();
    match current {
        Some(v) if v >= SCHEMA_VERSION => {
            debug!("Cache schema is up to date (v{})", v);
        }
        _ => {
            info!("Initialising cache schema v{}", SCHEMA_VERSION);
            if !has_column(conn, "documents", "pages_json")? {
                debug!("Adding documents.pages_json");
                conn.execute_batch(
                    "ALTER TABLE documents ADD COLUMN pages_json TEXT NOT NULL DEFAULT '[]';",
                )?;
            }
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (id, version, updated_at) \
                 VALUES (1, ?1, datetime('now'))",
                [SCHEMA_VERSION],
            )?;
        }
    }
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, CacheError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Keys ─────────────────────────────────────────────────────────────────

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content-derived key of an image: SHA-256 of its PNG bytes, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageKey(String);

impl ImageKey {
    /// Derive the key for a blob.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(sha256_hex(bytes))
    }

    /// Wrap an already computed key (as read back from the database).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name used under the output `images/` directory.
    pub fn file_name(&self) -> String {
        format!("{}.png", self.0)
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical identity of a source document.
///
/// `file://<canonical path>` for local files, the URL for downloads, or an
/// explicit override. Rows are keyed by the SHA-256 of this string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentIdentity {
    identity: String,
    hash: String,
}

impl DocumentIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        let hash = sha256_hex(identity.as_bytes());
        Self { identity, hash }
    }

    /// Identity for a user-supplied input string: the override if present,
    /// the URL itself for `http(s)://` inputs, else `file://<canonical path>`.
    pub fn for_input(input: &str, override_id: Option<&str>) -> Self {
        if let Some(id) = override_id {
            return Self::new(id);
        }
        if crate::pipeline::input::is_url(input) {
            return Self::new(input);
        }
        let path = Path::new(input);
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self::new(format!("file://{}", canonical.display()))
    }

    pub fn as_str(&self) -> &str {
        &self.identity
    }

    /// SHA-256 hex of the identity string; the primary key in the cache tables.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}
