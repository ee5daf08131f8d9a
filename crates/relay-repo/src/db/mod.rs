//! Transactional gateway over the embedded SQLite database.
//!
//! All access goes through [`Database::read_only`] or
//! [`Database::read_write`]. Writers are serialised on a single connection
//! and start with `BEGIN IMMEDIATE`, retrying for as long as the file is
//! busy; readers use pooled `query_only` connections and see a consistent
//! WAL snapshot. [`Database::run_maintenance`] is the one stop-the-world
//! point: it waits for every in-flight transaction to finish and holds new
//! ones back until it is done.

mod gate;
pub mod maintenance;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use crate::error::{RepoError, RepoResult};
use gate::{NestingGuard, TxGate};

pub use maintenance::MaintenanceTask;

/// How long SQLite itself waits on a lock before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause between write lock attempts.
const BUSY_BACKOFF: Duration = Duration::from_millis(10);

/// Single-writer SQLite database with pooled readers
pub struct Database {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    reader_pool_size: usize,
    gate: TxGate,
    busy_warn_threshold: Duration,
    maintenance_statements: Vec<String>,
}

impl Database {
    /// Open or create the database file and make sure the schema exists
    pub fn open(config: &DbConfig) -> RepoResult<Self> {
        let path = config.path.clone();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(path = %path.display(), "Opening staging store database");

        let writer = open_connection(&path, false)?;
        schema::init_schema(&writer)?;

        debug!("Database schema ready");

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            reader_pool_size: config.reader_pool_size.max(1),
            gate: TxGate::default(),
            busy_warn_threshold: config.busy_warn_threshold(),
            maintenance_statements: config.maintenance_statements.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a read-only transaction.
    pub fn read_only<T, F>(&self, f: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection) -> RepoResult<T>,
    {
        let _nesting = NestingGuard::enter()?;
        let _permit = self.gate.enter();

        let conn = self.checkout_reader()?;
        let result = run_in_tx(&conn, Tx::begin_deferred, f);
        self.checkin_reader(conn);
        result
    }

    /// Run `f` inside a write transaction.
    ///
    /// Blocks until the write lock is acquired. If `f` fails nothing it did
    /// is kept and its error is returned unchanged.
    pub fn read_write<T, F>(&self, f: F) -> RepoResult<T>
    where
        F: FnOnce(&Connection) -> RepoResult<T>,
    {
        let _nesting = NestingGuard::enter()?;
        let _permit = self.gate.enter();

        let conn = self.lock_writer();
        let warn_after = self.busy_warn_threshold;
        run_in_tx(&conn, |c| Tx::begin_immediate(c, warn_after), f)
    }

    /// Run the configured maintenance statements with no other transaction
    /// in flight.
    pub fn run_maintenance(&self) -> RepoResult<()> {
        let _nesting = NestingGuard::enter()?;
        let started = Instant::now();
        let _exclusive = self.gate.exclusive();

        let conn = self.lock_writer();
        for statement in &self.maintenance_statements {
            debug!(statement = %statement, "Running maintenance statement");
            run_statement(&conn, statement)?;
        }

        info!(
            statements = self.maintenance_statements.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Database maintenance complete"
        );

        Ok(())
    }

    /// Number of transactions currently in flight
    pub fn active_transactions(&self) -> usize {
        self.gate.active()
    }

    fn lock_writer(&self) -> MutexGuard<'_, Connection> {
        // A panic inside a transaction rolls back on unwind, so the
        // connection behind a poisoned lock is still usable.
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn checkout_reader(&self) -> RepoResult<Connection> {
        let pooled = self
            .readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match pooled {
            Some(conn) => Ok(conn),
            None => open_connection(&self.path, true),
        }
    }

    fn checkin_reader(&self, conn: Connection) {
        let mut pool = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        if pool.len() < self.reader_pool_size {
            pool.push(conn);
        }
    }
}

fn open_connection(path: &Path, query_only: bool) -> RepoResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    if query_only {
        conn.pragma_update(None, "query_only", "ON")?;
    }
    Ok(conn)
}

/// Execute a statement that may or may not return rows.
fn run_statement(conn: &Connection, sql: &str) -> RepoResult<()> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    while rows.next()?.is_some() {}
    Ok(())
}

fn run_in_tx<'c, T, B, F>(conn: &'c Connection, begin: B, f: F) -> RepoResult<T>
where
    B: FnOnce(&'c Connection) -> RepoResult<Tx<'c>>,
    F: FnOnce(&Connection) -> RepoResult<T>,
{
    let tx = begin(conn)?;
    let value = f(conn)?;
    tx.commit()?;
    Ok(value)
}

/// An open transaction that rolls back unless committed.
struct Tx<'c> {
    conn: &'c Connection,
    open: bool,
}

impl<'c> Tx<'c> {
    fn begin_deferred(conn: &'c Connection) -> RepoResult<Self> {
        conn.execute_batch("BEGIN DEFERRED")?;
        Ok(Self { conn, open: true })
    }

    fn begin_immediate(conn: &'c Connection, warn_after: Duration) -> RepoResult<Self> {
        let started = Instant::now();
        let mut warned = false;

        loop {
            match conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => break,
                Err(e) => {
                    let err = RepoError::from(e);
                    if !err.is_busy() {
                        return Err(err);
                    }
                    if !warned && started.elapsed() >= warn_after {
                        warn!(
                            waited_ms = started.elapsed().as_millis() as u64,
                            "Still waiting for the database write lock"
                        );
                        warned = true;
                    }
                    thread::sleep(BUSY_BACKOFF);
                }
            }
        }

        if warned {
            info!(
                waited_ms = started.elapsed().as_millis() as u64,
                "Acquired database write lock"
            );
        }

        Ok(Self { conn, open: true })
    }

    fn commit(mut self) -> RepoResult<()> {
        self.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to roll back transaction");
            }
        }
    }
}
