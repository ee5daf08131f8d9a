//! Process-local id allocation
//!
//! Ids are handed out from an atomic counter seeded from `MAX(id)` when the
//! store opens, so allocating one never touches the database. The counter
//! must be reseeded whenever the table is emptied and is never rewound while
//! rows exist, which keeps ids unique for the lifetime of the store file.

use std::sync::atomic::{AtomicI64, Ordering};

use rusqlite::Connection;

use crate::error::{RepoError, RepoResult};

pub struct IdGenerator {
    table: &'static str,
    last: AtomicI64,
}

impl IdGenerator {
    pub fn seed(conn: &Connection, table: &'static str) -> RepoResult<Self> {
        Ok(Self {
            table,
            last: AtomicI64::new(max_id(conn, table)?),
        })
    }

    pub fn next(&self) -> i64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last id handed out
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }

    /// Reset after the table has been emptied.
    ///
    /// Fails with [`RepoError::Invariant`] if the table still holds rows.
    pub fn reset(&self, conn: &Connection) -> RepoResult<()> {
        let max = max_id(conn, self.table)?;
        if max != 0 {
            return Err(RepoError::invariant(format!(
                "{} still has ids up to {} after clear",
                self.table, max
            )));
        }
        self.last.store(0, Ordering::SeqCst);
        Ok(())
    }
}

fn max_id(conn: &Connection, table: &str) -> RepoResult<i64> {
    let sql = format!("SELECT COALESCE(MAX(id), 0) FROM {}", table);
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// Delete every row of `table` and fail if any survive.
pub(crate) fn clear_table(conn: &Connection, table: &str) -> RepoResult<usize> {
    let deleted = conn.execute(&format!("DELETE FROM {}", table), [])?;
    let remaining: i64 =
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
    if remaining != 0 {
        return Err(RepoError::invariant(format!(
            "{} has {} rows after clear",
            table, remaining
        )));
    }
    Ok(deleted)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_seed_from_existing_rows() {
        let conn = conn();
        conn.execute("INSERT INTO forward_dest (id, name) VALUES (41, 'a')", [])
            .unwrap();

        let ids = IdGenerator::seed(&conn, "forward_dest").unwrap();
        assert_eq!(ids.last(), 41);
        assert_eq!(ids.next(), 42);
        assert_eq!(ids.next(), 43);
    }

    #[test]
    fn test_reset_requires_empty_table() {
        let conn = conn();
        conn.execute("INSERT INTO forward_dest (id, name) VALUES (1, 'a')", [])
            .unwrap();
        let ids = IdGenerator::seed(&conn, "forward_dest").unwrap();

        let err = ids.reset(&conn).unwrap_err();
        assert!(err.is_fatal());

        clear_table(&conn, "forward_dest").unwrap();
        ids.reset(&conn).unwrap();
        assert_eq!(ids.next(), 1);
    }
}
