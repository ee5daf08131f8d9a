//! Forward tracking: one row per (subject, destination).
//!
//! A subject is whatever gets forwarded as a unit: a closed aggregate, or a
//! whole source in direct mode. Fan-out takes subjects off their queue and
//! creates one row per destination on the new queue. A forwarder takes rows
//! from the new or retry queue, performs the transfer and reports back
//! through [`ForwardStore::update`]. Once no row of a subject is left
//! unsuccessful the subject is completed, which for an aggregate deletes it
//! together with its items, entries and every forward row.

mod aggregate;
mod source;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::dest::ForwardDestStore;
use crate::error::{RepoError, RepoResult};
use crate::ids::IdGenerator;
use crate::model::{Aggregate, ForwardDest, ForwardRecord, RepoSource};
use crate::now_ms;
use crate::queue::PositionQueue;

/// Something forwarded as a unit
pub trait ForwardSubject: Sized {
    /// Entity name used in logs and errors
    const NAME: &'static str;
    /// Forward record table
    const TABLE: &'static str;
    /// Column of `TABLE` referencing the subject
    const FK_COLUMN: &'static str;
    const SUBJECT_TABLE: &'static str;
    /// Column of `SUBJECT_TABLE` queueing subjects for fan-out
    const QUEUE_COLUMN: &'static str;

    fn load(conn: &Connection, id: i64) -> RepoResult<Option<Self>>;

    /// Every destination has succeeded; release the subject.
    fn complete(conn: &Connection, id: i64) -> RepoResult<()>;
}

pub type ForwardAggregateStore = ForwardStore<Aggregate>;
pub type ForwardSourceStore = ForwardStore<RepoSource>;

/// What [`ForwardStore::update`] did with a reported outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Recorded as a success; other destinations are still outstanding
    Pending,
    /// The last outstanding destination succeeded and the subject is done
    Complete,
    /// Recorded as a failure and queued for retry
    Retry,
    /// The row no longer exists, e.g. its destination was retired
    Stale,
}

pub struct ForwardStore<S> {
    db: Arc<Database>,
    dests: Arc<ForwardDestStore>,
    ids: IdGenerator,
    subjects: Arc<PositionQueue>,
    new_queue: PositionQueue,
    retry_queue: PositionQueue,
    _subject: PhantomData<fn() -> S>,
}

impl<S: ForwardSubject> ForwardStore<S> {
    /// `subjects` is the queue of subjects awaiting fan-out.
    ///
    /// Rows handed to a forwarder that never reported back are put back on
    /// their queue.
    pub fn open(
        db: Arc<Database>,
        dests: Arc<ForwardDestStore>,
        subjects: Arc<PositionQueue>,
    ) -> RepoResult<Self> {
        let store = Self::attach(db, dests, subjects)?;
        let (new, retry) = store.db.read_write(|conn| store.requeue_lost(conn))?;
        if new + retry > 0 {
            info!(subject = S::NAME, new, retry, "Re-queued unreported forward records");
        }
        Ok(store)
    }

    /// Open without recovery; nothing is written.
    pub(crate) fn attach(
        db: Arc<Database>,
        dests: Arc<ForwardDestStore>,
        subjects: Arc<PositionQueue>,
    ) -> RepoResult<Self> {
        db.read_only(|conn| {
            Ok(Self {
                db: Arc::clone(&db),
                dests,
                ids: IdGenerator::seed(conn, S::TABLE)?,
                subjects,
                new_queue: PositionQueue::seed(conn, S::TABLE, "new_position")?,
                retry_queue: PositionQueue::seed(conn, S::TABLE, "retry_position")?,
                _subject: PhantomData,
            })
        })
    }

    /// Fan out every queued subject to `destinations`.
    ///
    /// With no destinations the subjects stay queued. Returns the number of
    /// rows created.
    pub fn create_forward_records(&self, destinations: &[ForwardDest]) -> RepoResult<usize> {
        if destinations.is_empty() {
            debug!(subject = S::NAME, "No destinations, fan-out deferred");
            return Ok(0);
        }

        self.db.read_write(|conn| {
            let mut created = 0;
            let mut subjects = 0;
            while let Some(rows) = self.subjects.take(conn, |conn, position| {
                let id = self.subject_at(conn, position)?;
                self.insert_missing(conn, id, destinations)
            })? {
                created += rows;
                subjects += 1;
            }
            if subjects > 0 {
                debug!(subject = S::NAME, subjects, rows = created, "Created forward records");
            }
            Ok(created)
        })
    }

    /// Wait up to `timeout` for one subject and fan it out.
    pub fn create_next_forward_records(
        &self,
        destinations: &[ForwardDest],
        timeout: Duration,
    ) -> RepoResult<Option<usize>> {
        if destinations.is_empty() {
            return Ok(None);
        }
        self.subjects.get_timeout(&self.db, timeout, |conn, position| {
            let id = self.subject_at(conn, position)?;
            self.insert_missing(conn, id, destinations)
        })
    }

    pub fn get_new(&self) -> RepoResult<Option<ForwardRecord<S>>> {
        self.new_queue
            .get(&self.db, |conn, position| self.record_at(conn, "new_position", position))
    }

    pub fn get_new_timeout(&self, timeout: Duration) -> RepoResult<Option<ForwardRecord<S>>> {
        self.new_queue.get_timeout(&self.db, timeout, |conn, position| {
            self.record_at(conn, "new_position", position)
        })
    }

    pub fn get_retry(&self) -> RepoResult<Option<ForwardRecord<S>>> {
        self.retry_queue
            .get(&self.db, |conn, position| self.record_at(conn, "retry_position", position))
    }

    pub fn get_retry_timeout(&self, timeout: Duration) -> RepoResult<Option<ForwardRecord<S>>> {
        self.retry_queue.get_timeout(&self.db, timeout, |conn, position| {
            self.record_at(conn, "retry_position", position)
        })
    }

    /// Record the outcome of a forward attempt.
    ///
    /// A success completes the subject once none of its rows is left
    /// unsuccessful. A failure keeps the error, counts the try and queues
    /// the row for retry.
    pub fn update(&self, record: &ForwardRecord<S>) -> RepoResult<UpdateOutcome> {
        let sql_fk = format!("SELECT {} FROM {} WHERE id = ?1", S::FK_COLUMN, S::TABLE);

        self.db.read_write(|conn| {
            let subject_id: Option<i64> = conn
                .query_row(&sql_fk, [record.id], |row| row.get(0))
                .optional()?;
            let Some(subject_id) = subject_id else {
                debug!(subject = S::NAME, record_id = record.id, "Forward record already gone");
                return Ok(UpdateOutcome::Stale);
            };

            if record.success {
                conn.execute(
                    &format!(
                        "UPDATE {} SET success = 1, error = NULL, tries = tries + 1,
                         update_time_ms = ?1, new_position = NULL, retry_position = NULL
                         WHERE id = ?2",
                        S::TABLE
                    ),
                    params![now_ms(), record.id],
                )?;

                if self.outstanding(conn, subject_id)? > 0 {
                    return Ok(UpdateOutcome::Pending);
                }
                S::complete(conn, subject_id)?;
                info!(
                    subject = S::NAME,
                    id = subject_id,
                    dest = %record.dest.name,
                    "Forwarding complete"
                );
                Ok(UpdateOutcome::Complete)
            } else {
                conn.execute(
                    &format!(
                        "UPDATE {} SET success = 0, error = ?1, tries = tries + 1,
                         update_time_ms = ?2, new_position = NULL
                         WHERE id = ?3",
                        S::TABLE
                    ),
                    params![record.error, now_ms(), record.id],
                )?;
                let retry_sql = format!("UPDATE {} SET retry_position = ?1 WHERE id = ?2", S::TABLE);
                self.retry_queue.put(conn, |conn, position| {
                    conn.execute(&retry_sql, params![position, record.id])?;
                    Ok(())
                })?;
                warn!(
                    subject = S::NAME,
                    id = subject_id,
                    dest = %record.dest.name,
                    error = record.error.as_deref().unwrap_or(""),
                    "Forward attempt failed, queued for retry"
                );
                Ok(UpdateOutcome::Retry)
            }
        })
    }

    /// Create rows for destinations added while subjects were outstanding.
    ///
    /// Subjects still waiting for fan-out pick the new destinations up then
    /// and are left alone here.
    pub fn add_new_forward_records(&self, new_dests: &[ForwardDest]) -> RepoResult<usize> {
        if new_dests.is_empty() {
            return Ok(0);
        }

        self.db.read_write(|conn| {
            let outstanding = self.subjects_where(conn, "1 = 1", [])?;
            let mut created = 0;
            for id in outstanding {
                created += self.insert_missing(conn, id, new_dests)?;
            }
            if created > 0 {
                info!(subject = S::NAME, rows = created, "Back-filled forward records for new destinations");
            }
            Ok(created)
        })
    }

    /// Drop rows of retired destinations.
    ///
    /// A subject left with nothing outstanding is completed.
    pub fn remove_old_forward_records(&self, retired: &[ForwardDest]) -> RepoResult<usize> {
        if retired.is_empty() {
            return Ok(0);
        }

        self.db.read_write(|conn| {
            let delete_sql = format!("DELETE FROM {} WHERE fk_forward_dest_id = ?1", S::TABLE);
            let mut removed = 0;
            let mut completed = 0;

            for dest in retired {
                let affected = self.subjects_where(conn, "fk_forward_dest_id = ?1", [dest.id])?;
                removed += conn.execute(&delete_sql, [dest.id])?;

                for id in affected {
                    if self.outstanding(conn, id)? == 0 {
                        S::complete(conn, id)?;
                        completed += 1;
                    }
                }
            }

            if removed > 0 {
                info!(
                    subject = S::NAME,
                    rows = removed,
                    completed,
                    "Removed forward records for retired destinations"
                );
            }
            Ok(removed)
        })
    }

    /// Delete failed rows so their subjects are fanned out afresh.
    pub fn delete_failed_forwards(&self) -> RepoResult<usize> {
        self.db.read_write(|conn| {
            let failed = "success = 0 AND tries > 0";
            let subjects = self.subjects_where(conn, failed, [])?;
            let deleted = conn.execute(
                &format!("DELETE FROM {} WHERE {}", S::TABLE, failed),
                [],
            )?;

            let requeue_sql = format!(
                "UPDATE {} SET {c} = ?1 WHERE id = ?2 AND {c} IS NULL",
                S::SUBJECT_TABLE,
                c = S::QUEUE_COLUMN
            );
            for id in &subjects {
                self.subjects.put(conn, |conn, position| {
                    conn.execute(&requeue_sql, params![position, id])?;
                    Ok(())
                })?;
            }

            if deleted > 0 {
                info!(subject = S::NAME, rows = deleted, subjects = subjects.len(), "Deleted failed forwards");
            }
            Ok(deleted)
        })
    }

    pub fn count(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| self.count_in(conn))
    }

    pub fn count_failed(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| self.count_failed_in(conn))
    }

    pub(crate) fn count_in(&self, conn: &Connection) -> RepoResult<i64> {
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {}", S::TABLE), [], |row| {
            row.get(0)
        })?)
    }

    pub(crate) fn count_failed_in(&self, conn: &Connection) -> RepoResult<i64> {
        Ok(conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE success = 0 AND tries > 0", S::TABLE),
            [],
            |row| row.get(0),
        )?)
    }

    pub(crate) fn new_queue(&self) -> &PositionQueue {
        &self.new_queue
    }

    pub(crate) fn retry_queue(&self) -> &PositionQueue {
        &self.retry_queue
    }

    pub(crate) fn subject_queue(&self) -> &PositionQueue {
        &self.subjects
    }

    pub(crate) fn reset(&self, conn: &Connection) -> RepoResult<()> {
        self.ids.reset(conn)?;
        self.new_queue.reseed(conn)?;
        self.retry_queue.reseed(conn)
    }

    /// Unsuccessful rows on neither queue were dequeued by a forwarder that
    /// never reported an outcome. Untried rows go back on the new queue,
    /// tried ones on the retry queue.
    ///
    /// Returns (new, retry) counts.
    fn requeue_lost(&self, conn: &Connection) -> RepoResult<(usize, usize)> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, tries FROM {}
             WHERE success = 0 AND new_position IS NULL AND retry_position IS NULL
             ORDER BY id",
            S::TABLE
        ))?;
        let lost = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let (mut new, mut retry) = (0, 0);
        for (id, tries) in lost {
            let (queue, column) = if tries == 0 {
                new += 1;
                (&self.new_queue, "new_position")
            } else {
                retry += 1;
                (&self.retry_queue, "retry_position")
            };
            let sql = format!("UPDATE {} SET {} = ?1 WHERE id = ?2", S::TABLE, column);
            queue.put(conn, |conn, position| {
                conn.execute(&sql, params![position, id])?;
                Ok(())
            })?;
        }
        Ok((new, retry))
    }

    fn subject_at(&self, conn: &Connection, position: i64) -> RepoResult<i64> {
        Ok(conn.query_row(
            &format!(
                "SELECT id FROM {} WHERE {} = ?1",
                S::SUBJECT_TABLE,
                S::QUEUE_COLUMN
            ),
            [position],
            |row| row.get(0),
        )?)
    }

    /// Create a queued row for each destination the subject lacks
    fn insert_missing(&self, conn: &Connection, subject_id: i64, dests: &[ForwardDest]) -> RepoResult<usize> {
        let exists_sql = format!(
            "SELECT 1 FROM {} WHERE {} = ?1 AND fk_forward_dest_id = ?2",
            S::TABLE,
            S::FK_COLUMN
        );
        let insert_sql = format!(
            "INSERT INTO {} (id, update_time_ms, fk_forward_dest_id, {}, new_position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            S::TABLE,
            S::FK_COLUMN
        );

        let mut created = 0;
        for dest in dests {
            let exists = conn
                .query_row(&exists_sql, params![subject_id, dest.id], |_| Ok(()))
                .optional()?
                .is_some();
            if exists {
                continue;
            }

            let id = self.ids.next();
            self.new_queue.put(conn, |conn, position| {
                conn.execute(
                    &insert_sql,
                    params![id, now_ms(), dest.id, subject_id, position],
                )?;
                Ok(())
            })?;
            created += 1;
        }
        Ok(created)
    }

    /// Rows of the subject that have not succeeded
    fn outstanding(&self, conn: &Connection, subject_id: i64) -> RepoResult<i64> {
        Ok(conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?1 AND success = 0",
                S::TABLE,
                S::FK_COLUMN
            ),
            [subject_id],
            |row| row.get(0),
        )?)
    }

    fn subjects_where<P: rusqlite::Params>(
        &self,
        conn: &Connection,
        filter: &str,
        params: P,
    ) -> RepoResult<Vec<i64>> {
        let sql = format!(
            "SELECT DISTINCT {fk} FROM {t} WHERE {filter} ORDER BY {fk}",
            fk = S::FK_COLUMN,
            t = S::TABLE,
            filter = filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn record_at(&self, conn: &Connection, column: &str, position: i64) -> RepoResult<ForwardRecord<S>> {
        let sql = format!(
            "SELECT id, update_time_ms, fk_forward_dest_id, {}, success, error, tries
             FROM {} WHERE {} = ?1",
            S::FK_COLUMN,
            S::TABLE,
            column
        );
        let (id, update_time_ms, dest_id, subject_id, success, error, tries): (
            i64,
            i64,
            i64,
            i64,
            bool,
            Option<String>,
            i64,
        ) = conn.query_row(&sql, [position], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?;

        let dest = self.dests.load(conn, dest_id)?;
        let subject =
            S::load(conn, subject_id)?.ok_or_else(|| RepoError::not_found(S::NAME, subject_id))?;

        Ok(ForwardRecord {
            id,
            update_time_ms,
            dest,
            subject,
            success,
            error,
            tries,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests;
