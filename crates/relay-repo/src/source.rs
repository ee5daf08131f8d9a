//! Sources, their items and entries
//!
//! A source arrives unexamined and sits on the examination queue until the
//! receiver splits it. [`SourceStore::add_items`] stores the resulting items
//! and entries, marks the source examined and puts every item on the
//! aggregation queue in one transaction, so a half-split source is never
//! visible. In direct mode sources skip examination and go straight onto the
//! forward queue instead.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{RepoError, RepoResult};
use crate::ids::IdGenerator;
use crate::model::{AddSource, EntryKind, NewItem, NewItemRef, RepoSource, SourceEntry, SourceItem};
use crate::now_ms;
use crate::queue::PositionQueue;

const SOURCE_COLUMNS: &str =
    "id, file_store_id, feed_name, type_name, last_modified_time_ms, examined, forwarded";

pub struct SourceStore {
    db: Arc<Database>,
    source_ids: IdGenerator,
    item_ids: IdGenerator,
    entry_ids: IdGenerator,
    new_sources: PositionQueue,
    forward_sources: Arc<PositionQueue>,
    new_items: Arc<PositionQueue>,
    direct: bool,
}

impl SourceStore {
    /// Open over `db`, re-queueing sources a crash left unexamined.
    pub fn open(db: Arc<Database>, direct: bool) -> RepoResult<Self> {
        let store = Self::attach(db, direct)?;

        let recovered = store.db.read_write(|conn| store.requeue_lost(conn))?;
        if recovered > 0 {
            info!(recovered, "Re-queued unexamined sources");
        }

        Ok(store)
    }

    /// Open without recovery; nothing is written.
    pub(crate) fn attach(db: Arc<Database>, direct: bool) -> RepoResult<Self> {
        db.read_only(|conn| {
            Ok(Self {
                db: Arc::clone(&db),
                source_ids: IdGenerator::seed(conn, "source")?,
                item_ids: IdGenerator::seed(conn, "source_item")?,
                entry_ids: IdGenerator::seed(conn, "source_entry")?,
                new_sources: PositionQueue::seed(conn, "source", "new_position")?,
                forward_sources: Arc::new(PositionQueue::seed(conn, "source", "forward_position")?),
                new_items: Arc::new(PositionQueue::seed(conn, "source_item", "new_position")?),
                direct,
            })
        })
    }

    /// Record a newly received source.
    ///
    /// Idempotent on `file_store_id`: a second call reports the existing id.
    pub fn add_source(
        &self,
        file_store_id: i64,
        feed_name: Option<&str>,
        type_name: Option<&str>,
    ) -> RepoResult<AddSource> {
        self.db.read_write(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM source WHERE file_store_id = ?1",
                    [file_store_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                debug!(file_store_id, source_id = id, "Source already exists");
                return Ok(AddSource::AlreadyExists(id));
            }

            let id = self.source_ids.next();
            conn.execute(
                "INSERT INTO source (id, file_store_id, feed_name, type_name, last_modified_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, file_store_id, feed_name, type_name, now_ms()],
            )?;
            self.enqueue(conn, id)?;

            debug!(file_store_id, source_id = id, feed = ?feed_name, "Added source");
            Ok(AddSource::Added(id))
        })
    }

    /// Dequeue the next source awaiting examination
    pub fn get_new_source(&self) -> RepoResult<Option<RepoSource>> {
        self.new_sources.get(&self.db, source_at_new_position)
    }

    pub fn get_new_source_timeout(&self, timeout: Duration) -> RepoResult<Option<RepoSource>> {
        self.new_sources
            .get_timeout(&self.db, timeout, source_at_new_position)
    }

    /// Store the items and entries a source was split into.
    ///
    /// Marks the source examined, takes it off the examination queue and
    /// queues every item for aggregation, all in one transaction. Returns
    /// the new item ids in input order.
    pub fn add_items(&self, source_id: i64, items: &[NewItem]) -> RepoResult<Vec<i64>> {
        if let Some(blank) = items.iter().position(|i| i.name.trim().is_empty()) {
            return Err(RepoError::invalid_argument(format!(
                "Item {} of source {} has no name",
                blank, source_id
            )));
        }

        self.db.read_write(|conn| {
            let source = load_source(conn, source_id)?
                .ok_or_else(|| RepoError::not_found("source", source_id))?;
            if source.examined {
                return Err(RepoError::invalid_argument(format!(
                    "Source {} has already been examined",
                    source_id
                )));
            }

            let mut ids = Vec::with_capacity(items.len());
            for item in items {
                ids.push(self.insert_item(conn, &source, item)?);
            }

            conn.execute(
                "UPDATE source SET examined = 1, new_position = NULL WHERE id = ?1",
                [source_id],
            )?;

            debug!(source_id, items = ids.len(), "Examined source");
            Ok(ids)
        })
    }

    /// Items waiting for aggregation, oldest first
    pub fn get_new_source_items(&self, limit: Option<usize>) -> RepoResult<Vec<NewItemRef>> {
        self.db.read_only(|conn| {
            let limit = limit.map_or(-1, |l| l as i64);
            let mut stmt = conn.prepare(
                "SELECT id, fk_source_id, feed_name, type_name, byte_size
                 FROM source_item
                 WHERE new_position IS NOT NULL
                 ORDER BY new_position
                 LIMIT ?1",
            )?;
            let refs = stmt
                .query_map([limit], item_ref_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(refs)
        })
    }

    pub fn get_source(&self, source_id: i64) -> RepoResult<Option<RepoSource>> {
        self.db.read_only(|conn| load_source(conn, source_id))
    }

    pub fn get_items(&self, source_id: i64) -> RepoResult<Vec<SourceItem>> {
        self.db.read_only(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, feed_name, type_name, byte_size, fk_source_id, fk_aggregate_id
                 FROM source_item WHERE fk_source_id = ?1 ORDER BY id",
            )?;
            let items = stmt
                .query_map([source_id], |row| {
                    Ok(SourceItem {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        feed_name: row.get(2)?,
                        type_name: row.get(3)?,
                        byte_size: row.get(4)?,
                        source_id: row.get(5)?,
                        aggregate_id: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    pub fn get_entries(&self, item_id: i64) -> RepoResult<Vec<SourceEntry>> {
        self.db.read_only(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, extension, extension_type, byte_size, fk_source_item_id
                 FROM source_entry WHERE fk_source_item_id = ?1
                 ORDER BY extension_type, extension",
            )?;
            let entries = stmt
                .query_map([item_id], |row| {
                    Ok(SourceEntry {
                        id: row.get(0)?,
                        extension: row.get(1)?,
                        kind: EntryKind::from_code(row.get(2)?),
                        byte_size: row.get(3)?,
                        item_id: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }

    /// Sources that can be physically removed.
    ///
    /// A source qualifies once it is examined with every item gone, or was
    /// forwarded directly, and it sits on no queue.
    pub fn get_deletable_sources(&self, limit: usize) -> RepoResult<Vec<RepoSource>> {
        self.db.read_only(|conn| {
            let sql = format!(
                "SELECT {} FROM source WHERE {} ORDER BY id LIMIT ?1",
                SOURCE_COLUMNS, DELETABLE
            );
            let mut stmt = conn.prepare(&sql)?;
            let sources = stmt
                .query_map([limit as i64], source_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sources)
        })
    }

    /// Delete sources that are still deletable; others are left alone.
    pub fn delete_sources(&self, source_ids: &[i64]) -> RepoResult<usize> {
        if source_ids.is_empty() {
            return Ok(0);
        }

        self.db.read_write(|conn| {
            let sql = format!("DELETE FROM source WHERE id = ?1 AND {}", DELETABLE);
            let mut stmt = conn.prepare(&sql)?;
            let mut deleted = 0;
            for id in source_ids {
                deleted += stmt.execute([id])?;
            }
            if deleted > 0 {
                debug!(deleted, "Deleted sources");
            }
            Ok(deleted)
        })
    }

    /// Remove items, and their entries, whose aggregate no longer exists
    pub fn delete_orphaned_items(&self) -> RepoResult<usize> {
        self.db.read_write(|conn| {
            let orphaned = "SELECT i.id FROM source_item i
                 WHERE i.fk_aggregate_id IS NOT NULL
                 AND NOT EXISTS (SELECT 1 FROM aggregate a WHERE a.id = i.fk_aggregate_id)";
            conn.execute(
                &format!(
                    "DELETE FROM source_entry WHERE fk_source_item_id IN ({})",
                    orphaned
                ),
                [],
            )?;
            let deleted = conn.execute(
                &format!("DELETE FROM source_item WHERE id IN ({})", orphaned),
                [],
            )?;
            if deleted > 0 {
                info!(deleted, "Deleted orphaned items");
            }
            Ok(deleted)
        })
    }

    pub fn count_sources(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| count(conn, "source"))
    }

    pub fn count_items(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| count(conn, "source_item"))
    }

    pub fn count_entries(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| count(conn, "source_entry"))
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub(crate) fn new_source_queue(&self) -> &PositionQueue {
        &self.new_sources
    }

    pub(crate) fn new_item_queue(&self) -> Arc<PositionQueue> {
        Arc::clone(&self.new_items)
    }

    pub(crate) fn forward_queue(&self) -> Arc<PositionQueue> {
        Arc::clone(&self.forward_sources)
    }

    /// Reseed counters after every table has been emptied
    pub(crate) fn reset(&self, conn: &Connection) -> RepoResult<()> {
        self.source_ids.reset(conn)?;
        self.item_ids.reset(conn)?;
        self.entry_ids.reset(conn)?;
        self.new_sources.reseed(conn)?;
        self.forward_sources.reseed(conn)?;
        self.new_items.reseed(conn)
    }

    fn enqueue(&self, conn: &Connection, source_id: i64) -> RepoResult<()> {
        let (queue, sql) = if self.direct {
            (
                self.forward_sources.as_ref(),
                "UPDATE source SET forward_position = ?1 WHERE id = ?2",
            )
        } else {
            (
                &self.new_sources,
                "UPDATE source SET new_position = ?1 WHERE id = ?2",
            )
        };
        queue.put(conn, |conn, position| {
            conn.execute(sql, params![position, source_id])?;
            Ok(())
        })
    }

    fn insert_item(&self, conn: &Connection, source: &RepoSource, item: &NewItem) -> RepoResult<i64> {
        let item_id = self.item_ids.next();
        let feed_name = item.feed_name.as_deref().or(source.feed_name.as_deref());
        let type_name = item.type_name.as_deref().or(source.type_name.as_deref());

        conn.execute(
            "INSERT INTO source_item (id, name, feed_name, type_name, byte_size, fk_source_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![item_id, item.name, feed_name, type_name, item.byte_size(), source.id],
        )?;

        let mut insert_entry = conn.prepare_cached(
            "INSERT INTO source_entry (id, extension, extension_type, byte_size, fk_source_item_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for entry in &item.entries {
            insert_entry.execute(params![
                self.entry_ids.next(),
                entry.extension,
                entry.kind().code(),
                entry.byte_size,
                item_id
            ])?;
        }

        self.new_items.put(conn, |conn, position| {
            conn.execute(
                "UPDATE source_item SET new_position = ?1 WHERE id = ?2",
                params![position, item_id],
            )?;
            Ok(())
        })?;

        Ok(item_id)
    }

    /// Unexamined sources on no queue were dequeued by a splitter that never
    /// finished.
    fn requeue_lost(&self, conn: &Connection) -> RepoResult<usize> {
        let mut stmt = conn.prepare(
            "SELECT id FROM source s
             WHERE s.examined = 0 AND s.forwarded = 0
             AND s.new_position IS NULL AND s.forward_position IS NULL
             AND NOT EXISTS (SELECT 1 FROM forward_source f WHERE f.fk_source_id = s.id)
             ORDER BY s.id",
        )?;
        let lost = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        for id in &lost {
            self.enqueue(conn, *id)?;
        }
        Ok(lost.len())
    }
}

const DELETABLE: &str = "(examined = 1 OR forwarded = 1)
    AND new_position IS NULL AND forward_position IS NULL
    AND NOT EXISTS (SELECT 1 FROM source_item i WHERE i.fk_source_id = source.id)
    AND NOT EXISTS (SELECT 1 FROM forward_source f WHERE f.fk_source_id = source.id)";

pub(crate) fn load_source(conn: &Connection, source_id: i64) -> RepoResult<Option<RepoSource>> {
    let sql = format!("SELECT {} FROM source WHERE id = ?1", SOURCE_COLUMNS);
    Ok(conn
        .query_row(&sql, [source_id], source_from_row)
        .optional()?)
}

fn source_at_new_position(conn: &Connection, position: i64) -> RepoResult<RepoSource> {
    let sql = format!("SELECT {} FROM source WHERE new_position = ?1", SOURCE_COLUMNS);
    Ok(conn.query_row(&sql, [position], source_from_row)?)
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<RepoSource> {
    Ok(RepoSource {
        id: row.get(0)?,
        file_store_id: row.get(1)?,
        feed_name: row.get(2)?,
        type_name: row.get(3)?,
        last_modified_time_ms: row.get(4)?,
        examined: row.get(5)?,
        forwarded: row.get(6)?,
    })
}

pub(crate) fn item_ref_from_row(row: &Row<'_>) -> rusqlite::Result<NewItemRef> {
    Ok(NewItemRef {
        item_id: row.get(0)?,
        source_id: row.get(1)?,
        feed_name: row.get(2)?,
        type_name: row.get(3)?,
        byte_size: row.get(4)?,
    })
}

pub(crate) fn count(conn: &Connection, table: &str) -> RepoResult<i64> {
    Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
        row.get(0)
    })?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use tempfile::TempDir;

    fn open(direct: bool) -> (TempDir, Arc<Database>, SourceStore) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&DbConfig::at(dir.path().join("repo.db"))).unwrap());
        let store = SourceStore::open(Arc::clone(&db), direct).unwrap();
        (dir, db, store)
    }

    fn two_items() -> Vec<NewItem> {
        vec![
            NewItem::new("001").entry(".meta", 10).entry(".dat", 100),
            NewItem::new("002").entry(".dat", 50),
        ]
    }

    #[test]
    fn test_add_source_is_idempotent() {
        let (_dir, _db, store) = open(false);

        let first = store.add_source(10, Some("FEED"), Some("Raw Events")).unwrap();
        let second = store.add_source(10, Some("FEED"), Some("Raw Events")).unwrap();

        assert!(first.is_new());
        assert_eq!(second, AddSource::AlreadyExists(first.id()));
        assert_eq!(store.count_sources().unwrap(), 1);
    }

    #[test]
    fn test_examination_flow() {
        let (_dir, _db, store) = open(false);
        let id = store.add_source(1, Some("FEED"), None).unwrap().id();

        let source = store.get_new_source().unwrap().unwrap();
        assert_eq!(source.id, id);
        assert!(!source.examined);
        assert!(store.get_new_source().unwrap().is_none());

        let item_ids = store.add_items(id, &two_items()).unwrap();
        assert_eq!(item_ids.len(), 2);

        let source = store.get_source(id).unwrap().unwrap();
        assert!(source.examined);

        let items = store.get_items(id).unwrap();
        assert_eq!(items[0].byte_size, 110);
        // Items inherit the source feed when they do not name one.
        assert_eq!(items[0].feed_name.as_deref(), Some("FEED"));
        assert_eq!(store.count_entries().unwrap(), 3);

        let entries = store.get_entries(item_ids[0]).unwrap();
        assert_eq!(entries[0].kind, EntryKind::Meta);
        assert_eq!(entries[1].kind, EntryKind::Data);

        let refs = store.get_new_source_items(None).unwrap();
        assert_eq!(
            refs.iter().map(|r| r.item_id).collect::<Vec<_>>(),
            item_ids
        );
        assert_eq!(store.get_new_source_items(Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_add_items_twice_is_rejected() {
        let (_dir, _db, store) = open(false);
        let id = store.add_source(1, Some("FEED"), None).unwrap().id();
        store.add_items(id, &two_items()).unwrap();

        let err = store.add_items(id, &two_items()).unwrap_err();
        assert!(matches!(err, RepoError::InvalidArgument(_)));
        assert_eq!(store.count_items().unwrap(), 2);
    }

    #[test]
    fn test_add_items_rolls_back_on_missing_source() {
        let (_dir, _db, store) = open(false);
        let err = store.add_items(99, &two_items()).unwrap_err();
        assert!(matches!(err, RepoError::NotFound { entity: "source", id: 99 }));
        assert_eq!(store.count_items().unwrap(), 0);
    }

    #[test]
    fn test_blank_item_name_rejected() {
        let (_dir, _db, store) = open(false);
        let id = store.add_source(1, None, None).unwrap().id();
        let err = store.add_items(id, &[NewItem::new(" ")]).unwrap_err();
        assert!(matches!(err, RepoError::InvalidArgument(_)));
    }

    #[test]
    fn test_lost_sources_requeued_on_open() {
        let (_dir, db, store) = open(false);
        let id = store.add_source(1, Some("FEED"), None).unwrap().id();

        // Dequeued but never split.
        store.get_new_source().unwrap().unwrap();
        drop(store);

        let store = SourceStore::open(Arc::clone(&db), false).unwrap();
        assert_eq!(store.get_new_source().unwrap().map(|s| s.id), Some(id));
    }

    #[test]
    fn test_direct_mode_skips_examination() {
        let (_dir, db, store) = open(true);
        store.add_source(1, Some("FEED"), None).unwrap();

        assert!(store.get_new_source().unwrap().is_none());
        assert_eq!(db.read_only(|c| store.forward_queue().len(c)).unwrap(), 1);
    }

    #[test]
    fn test_deletable_sources() {
        let (_dir, _db, store) = open(false);
        let empty = store.add_source(1, None, None).unwrap().id();
        let full = store.add_source(2, None, None).unwrap().id();
        store.add_items(empty, &[]).unwrap();
        store.add_items(full, &two_items()).unwrap();

        let deletable = store.get_deletable_sources(10).unwrap();
        assert_eq!(deletable.iter().map(|s| s.id).collect::<Vec<_>>(), vec![empty]);

        assert_eq!(store.delete_sources(&[empty, full]).unwrap(), 1);
        assert!(store.get_source(empty).unwrap().is_none());
        assert!(store.get_source(full).unwrap().is_some());
    }

    #[test]
    fn test_delete_orphaned_items() {
        let (_dir, db, store) = open(false);
        let id = store.add_source(1, None, None).unwrap().id();
        let items = store.add_items(id, &two_items()).unwrap();

        db.read_write(|conn| {
            conn.execute(
                "UPDATE source_item SET fk_aggregate_id = 404, new_position = NULL WHERE id = ?1",
                [items[0]],
            )?;
            Ok(())
        })
        .unwrap();

        assert_eq!(store.delete_orphaned_items().unwrap(), 1);
        assert_eq!(store.count_items().unwrap(), 1);
        assert_eq!(store.count_entries().unwrap(), 1);
    }
}
