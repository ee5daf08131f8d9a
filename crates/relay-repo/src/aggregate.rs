//! Grouping items into bounded aggregates
//!
//! Items are appended to the newest open aggregate with the same feed and
//! type. An aggregate closes as soon as it reaches its item count or byte
//! bound, or when a sweep finds it older than the age bound. Closing marks
//! it complete and puts it on the closed queue, where forward fan-out picks
//! it up. A closed aggregate never takes another item.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{RepoError, RepoResult};
use crate::ids::IdGenerator;
use crate::model::{Aggregate, EntryKind, ForwardItem, NewItemRef};
use crate::now_ms;
use crate::queue::PositionQueue;
use crate::source::{count, item_ref_from_row};

const AGGREGATE_COLUMNS: &str =
    "id, feed_name, type_name, byte_size, items, create_time_ms, complete";

/// Size bounds for one aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateBounds {
    pub max_items: i64,
    pub max_bytes: i64,
}

pub struct AggregateStore {
    db: Arc<Database>,
    ids: IdGenerator,
    new_items: Arc<PositionQueue>,
    closed: Arc<PositionQueue>,
}

impl AggregateStore {
    /// `new_items` is the aggregation queue owned by the source store.
    pub fn open(db: Arc<Database>, new_items: Arc<PositionQueue>) -> RepoResult<Self> {
        db.read_only(|conn| {
            Ok(Self {
                db: Arc::clone(&db),
                ids: IdGenerator::seed(conn, "aggregate")?,
                new_items,
                closed: Arc::new(PositionQueue::seed(conn, "aggregate", "new_position")?),
            })
        })
    }

    /// Assign the given items to aggregates.
    ///
    /// Items that were already aggregated or are no longer queued are
    /// skipped. Returns the number of items assigned.
    pub fn add_items(&self, items: &[NewItemRef], bounds: AggregateBounds) -> RepoResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        self.db.read_write(|conn| {
            let mut added = 0;
            for item in items {
                let queued: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM source_item
                         WHERE id = ?1 AND new_position IS NOT NULL AND fk_aggregate_id IS NULL",
                        [item.item_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if queued.is_none() {
                    debug!(item_id = item.item_id, "Item no longer awaiting aggregation");
                    continue;
                }

                self.assign(conn, item, bounds)?;
                conn.execute(
                    "UPDATE source_item SET new_position = NULL WHERE id = ?1",
                    [item.item_id],
                )?;
                added += 1;
            }
            Ok(added)
        })
    }

    /// Drain up to `limit` items from the aggregation queue in one
    /// transaction.
    pub fn aggregate_new_items(&self, bounds: AggregateBounds, limit: usize) -> RepoResult<usize> {
        self.db.read_write(|conn| {
            let mut added = 0;
            while added < limit {
                let taken = self.new_items.take(conn, |conn, position| {
                    let item = conn.query_row(
                        "SELECT id, fk_source_id, feed_name, type_name, byte_size
                         FROM source_item WHERE new_position = ?1",
                        [position],
                        item_ref_from_row,
                    )?;
                    self.assign(conn, &item, bounds)
                })?;
                if taken.is_none() {
                    break;
                }
                added += 1;
            }
            if added > 0 {
                debug!(items = added, "Aggregated items");
            }
            Ok(added)
        })
    }

    /// Close open aggregates that hit a bound or are older than `max_age`.
    pub fn close_aggregates(
        &self,
        bounds: AggregateBounds,
        max_age: Duration,
        limit: usize,
    ) -> RepoResult<usize> {
        let oldest_ms = now_ms() - max_age.as_millis() as i64;

        self.db.read_write(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM aggregate
                 WHERE complete = 0
                 AND (items >= ?1 OR byte_size >= ?2 OR create_time_ms <= ?3)
                 ORDER BY id
                 LIMIT ?4",
            )?;
            let due = stmt
                .query_map(
                    params![bounds.max_items, bounds.max_bytes, oldest_ms, limit as i64],
                    |row| row.get::<_, i64>(0),
                )?
                .collect::<Result<Vec<_>, _>>()?;

            let mut closed = 0;
            for id in due {
                if self.close(conn, id)? {
                    closed += 1;
                }
            }
            if closed > 0 {
                info!(closed, "Closed aggregates");
            }
            Ok(closed)
        })
    }

    /// Close one aggregate now. Returns false if it was already closed.
    pub fn close_aggregate(&self, aggregate_id: i64) -> RepoResult<bool> {
        self.db.read_write(|conn| {
            if load_aggregate(conn, aggregate_id)?.is_none() {
                return Err(RepoError::not_found("aggregate", aggregate_id));
            }
            self.close(conn, aggregate_id)
        })
    }

    /// Dequeue the next closed aggregate and hand it to `consume` in the
    /// same transaction.
    pub fn get_new_aggregate<T, F>(&self, consume: F) -> RepoResult<Option<T>>
    where
        F: FnOnce(&Connection, Aggregate) -> RepoResult<T>,
    {
        self.closed
            .get(&self.db, |conn, position| consume_closed(conn, position, consume))
    }

    pub fn get_new_aggregate_timeout<T, F>(
        &self,
        timeout: Duration,
        consume: F,
    ) -> RepoResult<Option<T>>
    where
        F: FnOnce(&Connection, Aggregate) -> RepoResult<T>,
    {
        self.closed.get_timeout(&self.db, timeout, |conn, position| {
            consume_closed(conn, position, consume)
        })
    }

    pub fn get_aggregate(&self, aggregate_id: i64) -> RepoResult<Option<Aggregate>> {
        self.db.read_only(|conn| load_aggregate(conn, aggregate_id))
    }

    /// Entries of an aggregate in the order a forwarder streams them
    pub fn get_forward_items(&self, aggregate_id: i64) -> RepoResult<Vec<ForwardItem>> {
        self.db.read_only(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.file_store_id, i.id, i.name, e.extension, e.extension_type, e.byte_size
                 FROM source_item i
                 JOIN source s ON s.id = i.fk_source_id
                 JOIN source_entry e ON e.fk_source_item_id = i.id
                 WHERE i.fk_aggregate_id = ?1
                 ORDER BY s.id, i.name, e.extension_type, e.extension",
            )?;
            let items = stmt
                .query_map([aggregate_id], |row| {
                    Ok(ForwardItem {
                        source_id: row.get(0)?,
                        file_store_id: row.get(1)?,
                        item_id: row.get(2)?,
                        item_name: row.get(3)?,
                        extension: row.get(4)?,
                        kind: EntryKind::from_code(row.get(5)?),
                        byte_size: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(items)
        })
    }

    pub fn count_aggregates(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| count(conn, "aggregate"))
    }

    pub fn count_open_aggregates(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM aggregate WHERE complete = 0",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub(crate) fn closed_queue(&self) -> Arc<PositionQueue> {
        Arc::clone(&self.closed)
    }

    pub(crate) fn reset(&self, conn: &Connection) -> RepoResult<()> {
        self.ids.reset(conn)?;
        self.closed.reseed(conn)
    }

    fn assign(&self, conn: &Connection, item: &NewItemRef, bounds: AggregateBounds) -> RepoResult<i64> {
        let current = conn
            .query_row(
                "SELECT id, byte_size, items FROM aggregate
                 WHERE complete = 0 AND feed_name IS ?1 AND type_name IS ?2
                 ORDER BY id DESC LIMIT 1",
                params![item.feed_name, item.type_name],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
            )
            .optional()?;

        let aggregate_id = match current {
            Some((id, bytes, items))
                if items == 0
                    || (items < bounds.max_items && bytes + item.byte_size <= bounds.max_bytes) =>
            {
                id
            }
            Some((id, _, _)) => {
                self.close(conn, id)?;
                self.create(conn, item)?
            }
            None => self.create(conn, item)?,
        };

        conn.execute(
            "UPDATE aggregate SET items = items + 1, byte_size = byte_size + ?1 WHERE id = ?2",
            params![item.byte_size, aggregate_id],
        )?;
        conn.execute(
            "UPDATE source_item SET fk_aggregate_id = ?1 WHERE id = ?2",
            params![aggregate_id, item.item_id],
        )?;

        let (bytes, items): (i64, i64) = conn.query_row(
            "SELECT byte_size, items FROM aggregate WHERE id = ?1",
            [aggregate_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if items >= bounds.max_items || bytes >= bounds.max_bytes {
            self.close(conn, aggregate_id)?;
        }

        Ok(aggregate_id)
    }

    fn create(&self, conn: &Connection, item: &NewItemRef) -> RepoResult<i64> {
        let id = self.ids.next();
        conn.execute(
            "INSERT INTO aggregate (id, feed_name, type_name, create_time_ms) VALUES (?1, ?2, ?3, ?4)",
            params![id, item.feed_name, item.type_name, now_ms()],
        )?;
        debug!(aggregate_id = id, feed = ?item.feed_name, "Opened aggregate");
        Ok(id)
    }

    fn close(&self, conn: &Connection, aggregate_id: i64) -> RepoResult<bool> {
        let changed = conn.execute(
            "UPDATE aggregate SET complete = 1 WHERE id = ?1 AND complete = 0",
            [aggregate_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }

        self.closed.put(conn, |conn, position| {
            conn.execute(
                "UPDATE aggregate SET new_position = ?1 WHERE id = ?2",
                params![position, aggregate_id],
            )?;
            Ok(())
        })?;
        debug!(aggregate_id, "Closed aggregate");
        Ok(true)
    }
}

fn consume_closed<T, F>(conn: &Connection, position: i64, consume: F) -> RepoResult<T>
where
    F: FnOnce(&Connection, Aggregate) -> RepoResult<T>,
{
    let sql = format!("SELECT {} FROM aggregate WHERE new_position = ?1", AGGREGATE_COLUMNS);
    let aggregate = conn.query_row(&sql, [position], aggregate_from_row)?;
    consume(conn, aggregate)
}

pub(crate) fn load_aggregate(conn: &Connection, aggregate_id: i64) -> RepoResult<Option<Aggregate>> {
    let sql = format!("SELECT {} FROM aggregate WHERE id = ?1", AGGREGATE_COLUMNS);
    Ok(conn
        .query_row(&sql, [aggregate_id], aggregate_from_row)
        .optional()?)
}

/// Remove an aggregate with its items, their entries and forward rows
pub(crate) fn delete_aggregate(conn: &Connection, aggregate_id: i64) -> RepoResult<()> {
    conn.execute(
        "DELETE FROM forward_aggregate WHERE fk_aggregate_id = ?1",
        [aggregate_id],
    )?;
    conn.execute(
        "DELETE FROM source_entry WHERE fk_source_item_id IN
            (SELECT id FROM source_item WHERE fk_aggregate_id = ?1)",
        [aggregate_id],
    )?;
    let items = conn.execute(
        "DELETE FROM source_item WHERE fk_aggregate_id = ?1",
        [aggregate_id],
    )?;
    conn.execute("DELETE FROM aggregate WHERE id = ?1", [aggregate_id])?;
    debug!(aggregate_id, items, "Deleted aggregate");
    Ok(())
}

fn aggregate_from_row(row: &Row<'_>) -> rusqlite::Result<Aggregate> {
    Ok(Aggregate {
        id: row.get(0)?,
        feed_name: row.get(1)?,
        type_name: row.get(2)?,
        byte_size: row.get(3)?,
        items: row.get(4)?,
        create_time_ms: row.get(5)?,
        complete: row.get(6)?,
    })
}
