//! Document and caption cache.
//!
//! Two granularities share one database:
//!
//! * **document** rows map an identity to the assembled Markdown, the page
//!   texts and the ordered image references it embeds. A hit skips every downstream stage.
//! * **caption** rows map `(identity, image key)` to a [`Caption`]. Workers
//!   write them as each caption completes, so an interrupted or partly failed
//!   run keeps its progress.

use super::{Database, DocumentIdentity, ImageKey, ImageStore};
use crate::error::CacheError;
use crate::output::{Caption, Page};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One embedded image of a cached document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedImage {
    pub key: ImageKey,
    /// 1-indexed page number.
    pub page: usize,
    /// 0-indexed position within the page, in extraction order.
    pub position: usize,
    pub caption: Caption,
}

/// What a document-level hit returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub markdown: String,
    /// Extracted page texts, so a hit returns what a fresh run would.
    #[serde(default)]
    pub pages: Vec<Page>,
    pub images: Vec<CachedImage>,
}

impl CacheEntry {
    /// An entry is valid only if every referenced blob is still in the store.
    /// Caption presence is enforced by [`Cache::lookup`].
    pub fn is_valid(&self, store: &ImageStore) -> Result<bool, CacheError> {
        for image in &self.images {
            if !store.contains(&image.key)? {
                warn!(
                    "Cache entry references missing image {} (page {})",
                    image.key, image.page
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Reference stored in `documents.images_json`; captions live in their own table.
#[derive(Debug, Serialize, Deserialize)]
struct ImageRef {
    key: ImageKey,
    page: usize,
    position: usize,
}

/// SQLite-backed cache keyed by [`DocumentIdentity`].
#[derive(Debug, Clone)]
pub struct Cache {
    db: Database,
}

impl Cache {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Previously assembled document for `identity`.
    ///
    /// Returns `None` when no entry exists or when any referenced image has
    /// lost its caption row.
    pub fn lookup(&self, identity: &DocumentIdentity) -> Result<Option<CacheEntry>, CacheError> {
        let row = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT markdown, images_json, pages_json FROM documents WHERE identity_hash = ?1",
                    [identity.hash()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((markdown, images_json, pages_json)) = row else {
            debug!("Cache miss for {}", identity);
            return Ok(None);
        };

        let refs: Vec<ImageRef> = serde_json::from_str(&images_json)?;
        let pages: Vec<Page> = serde_json::from_str(&pages_json)?;
        let mut images = Vec::with_capacity(refs.len());
        for r in refs {
            match self.caption(identity, &r.key)? {
                Some(caption) => images.push(CachedImage {
                    key: r.key,
                    page: r.page,
                    position: r.position,
                    caption,
                }),
                None => {
                    warn!(
                        "Cache entry for {} lacks a caption for image {}; treating as miss",
                        identity, r.key
                    );
                    return Ok(None);
                }
            }
        }

        debug!("Cache hit for {} ({} images)", identity, images.len());
        Ok(Some(CacheEntry {
            markdown,
            pages,
            images,
        }))
    }

    /// Persist `entry` for `identity`. Last write wins.
    ///
    /// The document row and every caption it references are written in one
    /// transaction.
    pub fn store(&self, identity: &DocumentIdentity, entry: &CacheEntry) -> Result<(), CacheError> {
        let refs: Vec<ImageRef> = entry
            .images
            .iter()
            .map(|i| ImageRef {
                key: i.key.clone(),
                page: i.page,
                position: i.position,
            })
            .collect();
        let images_json = serde_json::to_string(&refs)?;
        let pages_json = serde_json::to_string(&entry.pages)?;

        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO documents \
                    (identity_hash, identity, markdown, images_json, pages_json, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, datetime('now')) \
                 ON CONFLICT(identity_hash) DO UPDATE SET \
                    identity = excluded.identity, \
                    markdown = excluded.markdown, \
                    images_json = excluded.images_json, \
                    pages_json = excluded.pages_json, \
                    updated_at = excluded.updated_at",
                params![
                    identity.hash(),
                    identity.as_str(),
                    entry.markdown,
                    images_json,
                    pages_json
                ],
            )?;
            for image in &entry.images {
                upsert_caption(&tx, identity, &image.caption)?;
            }
            tx.commit()?;
            Ok(())
        })?;

        info!(
            "Cached document {} ({} bytes, {} images)",
            identity,
            entry.markdown.len(),
            entry.images.len()
        );
        Ok(())
    }

    /// Cached caption for one image of one document.
    pub fn caption(
        &self,
        identity: &DocumentIdentity,
        key: &ImageKey,
    ) -> Result<Option<Caption>, CacheError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT title, description, model FROM captions \
                     WHERE identity_hash = ?1 AND image_key = ?2",
                    params![identity.hash(), key.as_str()],
                    |row| {
                        Ok(Caption {
                            image_key: key.clone(),
                            title: row.get(0)?,
                            description: row.get(1)?,
                            model: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Persist one caption. Concurrent writers for the same key converge on the last write.
    pub fn store_caption(
        &self,
        identity: &DocumentIdentity,
        caption: &Caption,
    ) -> Result<(), CacheError> {
        self.db.with_conn(|conn| {
            upsert_caption(conn, identity, caption)?;
            Ok(())
        })
    }

    /// Drop the document entry and all captions for `identity`.
    /// Returns whether anything was removed. Image blobs are left alone
    /// since other documents may share them.
    pub fn invalidate(&self, identity: &DocumentIdentity) -> Result<bool, CacheError> {
        let removed = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let docs = tx.execute(
                "DELETE FROM documents WHERE identity_hash = ?1",
                [identity.hash()],
            )?;
            let caps = tx.execute(
                "DELETE FROM captions WHERE identity_hash = ?1",
                [identity.hash()],
            )?;
            tx.commit()?;
            Ok(docs + caps)
        })?;
        info!("Invalidated {} ({} rows)", identity, removed);
        Ok(removed > 0)
    }
}

fn upsert_caption(
    conn: &rusqlite::Connection,
    identity: &DocumentIdentity,
    caption: &Caption,
) -> Result<(), CacheError> {
    conn.execute(
        "INSERT INTO captions (identity_hash, image_key, title, description, model) \
         VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(identity_hash, image_key) DO UPDATE SET \
            title = excluded.title, \
            description = excluded.description, \
            model = excluded.model",
        params![
            identity.hash(),
            caption.image_key.as_str(),
            caption.title,
            caption.description,
            caption.model
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caption(key: &ImageKey, title: &str) -> Caption {
        Caption {
            image_key: key.clone(),
            title: title.to_string(),
            description: format!("{title} description"),
            model: "mock".into(),
        }
    }

    fn entry(markdown: &str, key: &ImageKey) -> CacheEntry {
        CacheEntry {
            markdown: markdown.to_string(),
            pages: vec![Page {
                number: 1,
                text: "page one".into(),
            }],
            images: vec![CachedImage {
                key: key.clone(),
                page: 1,
                position: 0,
                caption: caption(key, "Figure"),
            }],
        }
    }

    #[test]
    fn lookup_miss_on_empty_cache() {
        let cache = Database::open_in_memory().unwrap().cache();
        let id = DocumentIdentity::new("file:///a.pdf");
        assert!(cache.lookup(&id).unwrap().is_none());
    }

    #[test]
    fn store_then_lookup() {
        let db = Database::open_in_memory().unwrap();
        let key = db.image_store().put(b"img").unwrap();
        let cache = db.cache();
        let id = DocumentIdentity::new("file:///a.pdf");
        cache.store(&id, &entry("# A\n", &key)).unwrap();

        let hit = cache.lookup(&id).unwrap().unwrap();
        assert_eq!(hit.markdown, "# A\n");
        assert_eq!(hit.pages.len(), 1);
        assert_eq!(hit.pages[0].text, "page one");
        assert_eq!(hit.images.len(), 1);
        assert_eq!(hit.images[0].caption.title, "Figure");
        assert!(hit.is_valid(&db.image_store()).unwrap());
    }

    #[test]
    fn store_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let key = ImageKey::for_bytes(b"img");
        let cache = db.cache();
        let id = DocumentIdentity::new("file:///a.pdf");
        cache.store(&id, &entry("first\n", &key)).unwrap();
        cache.store(&id, &entry("second\n", &key)).unwrap();
        assert_eq!(cache.lookup(&id).unwrap().unwrap().markdown, "second\n");
    }

    #[test]
    fn missing_caption_row_is_a_miss() {
        let db = Database::open_in_memory().unwrap();
        let key = ImageKey::for_bytes(b"img");
        let cache = db.cache();
        let id = DocumentIdentity::new("file:///a.pdf");
        cache.store(&id, &entry("doc\n", &key)).unwrap();
        db.with_conn(|conn| {
            conn.execute("DELETE FROM captions", [])?;
            Ok(())
        })
        .unwrap();
        assert!(cache.lookup(&id).unwrap().is_none());
    }

    #[test]
    fn entry_with_missing_blob_is_invalid() {
        let db = Database::open_in_memory().unwrap();
        let key = ImageKey::for_bytes(b"never stored");
        let e = entry("doc\n", &key);
        assert!(!e.is_valid(&db.image_store()).unwrap());
    }

    #[test]
    fn captions_are_scoped_by_document() {
        let cache = Database::open_in_memory().unwrap().cache();
        let key = ImageKey::for_bytes(b"shared");
        let a = DocumentIdentity::new("file:///a.pdf");
        let b = DocumentIdentity::new("file:///b.pdf");
        cache.store_caption(&a, &caption(&key, "From A")).unwrap();
        assert_eq!(cache.caption(&a, &key).unwrap().unwrap().title, "From A");
        assert!(cache.caption(&b, &key).unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_document_and_captions() {
        let cache = Database::open_in_memory().unwrap().cache();
        let key = ImageKey::for_bytes(b"img");
        let id = DocumentIdentity::new("file:///a.pdf");
        cache.store(&id, &entry("doc\n", &key)).unwrap();
        assert!(cache.invalidate(&id).unwrap());
        assert!(cache.lookup(&id).unwrap().is_none());
        assert!(cache.caption(&id, &key).unwrap().is_none());
        assert!(!cache.invalidate(&id).unwrap());
    }
}
