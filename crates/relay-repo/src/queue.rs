//! Durable FIFO queues stored as a nullable position column.
//!
//! A row is queued while its position column is non-null. Consumers always
//! take the lowest remaining position, so gaps left by rows that were
//! removed out of order are simply skipped. Nothing about the queue lives
//! only in memory except the last allocated position, which is reseeded
//! from the column at open; a restart therefore loses nothing.
//!
//! [`PositionQueue::take`] clears the position after the consumer has run,
//! inside the same transaction, so a consumer cannot leave a row queued
//! by mistake.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, trace};

use crate::db::Database;
use crate::error::{RepoError, RepoResult};

pub struct PositionQueue {
    name: String,
    last: AtomicI64,
    signal: Signal,
    max_sql: String,
    head_sql: String,
    clear_sql: String,
    count_sql: String,
}

impl PositionQueue {
    /// Queue over `table.column`, seeded from the highest stored position
    pub fn seed(conn: &Connection, table: &'static str, column: &'static str) -> RepoResult<Self> {
        let queue = Self {
            name: format!("{}.{}", table, column),
            last: AtomicI64::new(0),
            signal: Signal::default(),
            max_sql: format!("SELECT COALESCE(MAX({c}), 0) FROM {t}", t = table, c = column),
            head_sql: format!("SELECT MIN({c}) FROM {t}", t = table, c = column),
            clear_sql: format!("UPDATE {t} SET {c} = NULL WHERE {c} = ?1", t = table, c = column),
            count_sql: format!("SELECT COUNT({c}) FROM {t}", t = table, c = column),
        };
        queue.reseed(conn)?;
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue: allocate the next position and let `claim` store it.
    ///
    /// Must run inside a write transaction; consumers blocked in
    /// [`get_timeout`](Self::get_timeout) are woken.
    pub fn put<T, F>(&self, conn: &Connection, claim: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection, i64) -> RepoResult<T>,
    {
        let position = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(queue = %self.name, position, "put");
        let value = claim(conn, position)?;
        self.signal.notify();
        Ok(value)
    }

    /// Dequeue the head in its own write transaction.
    pub fn get<T, F>(&self, db: &Database, consume: F) -> RepoResult<Option<T>>
    where
        F: FnOnce(&Connection, i64) -> RepoResult<T>,
    {
        db.read_write(|conn| self.take(conn, consume))
    }

    /// Dequeue the head, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on expiry without touching the database further.
    pub fn get_timeout<T, F>(
        &self,
        db: &Database,
        timeout: Duration,
        consume: F,
    ) -> RepoResult<Option<T>>
    where
        F: FnOnce(&Connection, i64) -> RepoResult<T>,
    {
        let deadline = Instant::now() + timeout;
        let mut consume = Some(consume);

        loop {
            let seen = self.signal.generation();

            let found = db.read_write(|conn| match self.head(conn)? {
                Some(position) => {
                    let consume = consume
                        .take()
                        .ok_or_else(|| RepoError::invariant("queue consumer already used"))?;
                    self.consume_at(conn, position, consume).map(Some)
                }
                None => Ok(None),
            })?;

            if found.is_some() {
                return Ok(found);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(queue = %self.name, "get timed out");
                return Ok(None);
            }
            self.signal.wait_past(seen, deadline - now);
        }
    }

    /// Dequeue the head inside a transaction the caller already holds
    pub fn take<T, F>(&self, conn: &Connection, consume: F) -> RepoResult<Option<T>>
    where
        F: FnOnce(&Connection, i64) -> RepoResult<T>,
    {
        match self.head(conn)? {
            Some(position) => self.consume_at(conn, position, consume).map(Some),
            None => Ok(None),
        }
    }

    /// Lowest queued position, if any
    pub fn head(&self, conn: &Connection) -> RepoResult<Option<i64>> {
        Ok(conn
            .query_row(&self.head_sql, [], |row| row.get::<_, Option<i64>>(0))
            .optional()?
            .flatten())
    }

    pub fn len(&self, conn: &Connection) -> RepoResult<i64> {
        Ok(conn.query_row(&self.count_sql, [], |row| row.get(0))?)
    }

    pub fn is_empty(&self, conn: &Connection) -> RepoResult<bool> {
        Ok(self.head(conn)?.is_none())
    }

    /// Re-read the highest stored position; used at open and after clear
    pub fn reseed(&self, conn: &Connection) -> RepoResult<()> {
        let max: i64 = conn.query_row(&self.max_sql, [], |row| row.get(0))?;
        self.last.store(max, Ordering::SeqCst);
        Ok(())
    }

    fn consume_at<T, F>(&self, conn: &Connection, position: i64, consume: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection, i64) -> RepoResult<T>,
    {
        trace!(queue = %self.name, position, "take");
        let value = consume(conn, position)?;
        conn.execute(&self.clear_sql, [position])?;
        Ok(value)
    }
}

/// Wakes blocked consumers whenever something is put.
#[derive(Default)]
struct Signal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Signal {
    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    fn wait_past(&self, seen: u64, timeout: Duration) {
        let generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .changed
            .wait_timeout_while(generation, timeout, |g| *g == seen)
            .unwrap_or_else(PoisonError::into_inner);
    }
}
