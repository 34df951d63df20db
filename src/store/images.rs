//! Content-addressed image blobs.

use super::{Database, ImageKey};
use crate::error::CacheError;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

/// Persists PNG blobs keyed by [`ImageKey`].
///
/// `put` is idempotent: identical bytes map to the same key and are stored
/// once, whichever document they came from.
#[derive(Debug, Clone)]
pub struct ImageStore {
    db: Database,
}

impl ImageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store `bytes` and return their key. A second put of the same bytes is a no-op.
    pub fn put(&self, bytes: &[u8]) -> Result<ImageKey, CacheError> {
        let key = ImageKey::for_bytes(bytes);
        let inserted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "INSERT OR IGNORE INTO images (key, data, byte_len) VALUES (?1, ?2, ?3)",
                params![key.as_str(), bytes, bytes.len() as i64],
            )?)
        })?;
        if inserted == 0 {
            debug!("Image {} already stored", key);
        } else {
            debug!("Stored image {} ({} bytes)", key, bytes.len());
        }
        Ok(key)
    }

    /// Fetch the bytes for `key`, or [`CacheError::NotFound`].
    pub fn get(&self, key: &ImageKey) -> Result<Vec<u8>, CacheError> {
        self.db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT data FROM images WHERE key = ?1",
                        [key.as_str()],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?)
            })?
            .ok_or_else(|| CacheError::NotFound {
                key: key.to_string(),
            })
    }

    pub fn contains(&self, key: &ImageKey) -> Result<bool, CacheError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM images WHERE key = ?1",
                [key.as_str()],
                |row| row.get(0),
            )?;
            Ok(n > 0)
        })
    }

    /// Remove a blob. Returns whether anything was deleted.
    pub fn delete(&self, key: &ImageKey) -> Result<bool, CacheError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM images WHERE key = ?1", [key.as_str()])? > 0)
        })
    }

    /// Number of distinct blobs stored.
    pub fn len(&self) -> Result<usize, CacheError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ImageStore {
        Database::open_in_memory().unwrap().image_store()
    }

    #[test]
    fn put_is_idempotent() {
        let s = store();
        let k1 = s.put(b"png-bytes").unwrap();
        let k2 = s.put(b"png-bytes").unwrap();
        assert_eq!(k1, k2);
        assert_eq!(s.len().unwrap(), 1);
    }

    #[test]
    fn get_round_trips_bytes() {
        let s = store();
        let k = s.put(&[1, 2, 3, 4]).unwrap();
        assert_eq!(s.get(&k).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn get_missing_is_not_found() {
        let s = store();
        let err = s.get(&ImageKey::for_bytes(b"never stored")).unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }));
    }

    #[test]
    fn delete_removes_blob() {
        let s = store();
        let k = s.put(b"x").unwrap();
        assert!(s.contains(&k).unwrap());
        assert!(s.delete(&k).unwrap());
        assert!(!s.contains(&k).unwrap());
        assert!(!s.delete(&k).unwrap());
        assert!(s.is_empty().unwrap());
    }
}
