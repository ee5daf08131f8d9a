//! Background maintenance thread

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::Database;
use crate::error::RepoResult;

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Sleep for `interval` or until stopped. Returns true once stopped.
    fn wait(&self, interval: Duration) -> bool {
        let stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (stopped, _) = self
            .wake
            .wait_timeout_while(stopped, interval, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }
}

/// Runs [`Database::run_maintenance`] on a fixed interval until dropped
pub struct MaintenanceTask {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceTask {
    pub fn spawn(db: Arc<Database>, interval: Duration) -> RepoResult<Self> {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name("relay-repo-maintenance".to_string())
            .spawn(move || {
                debug!(interval_secs = interval.as_secs(), "Maintenance task started");
                while !thread_signal.wait(interval) {
                    if let Err(e) = db.run_maintenance() {
                        warn!(error = %e, "Database maintenance failed");
                    }
                }
                debug!("Maintenance task stopped");
            })?;

        info!(interval_secs = interval.as_secs(), "Scheduled database maintenance");

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for an in-progress pass to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn test_stop_interrupts_wait() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&DbConfig::at(dir.path().join("repo.db"))).unwrap());

        let task = MaintenanceTask::spawn(Arc::clone(&db), Duration::from_secs(3600)).unwrap();
        let started = Instant::now();
        task.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_runs_repeatedly() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&DbConfig::at(dir.path().join("repo.db"))).unwrap());

        let task = MaintenanceTask::spawn(Arc::clone(&db), Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(task);

        // Store remains usable after the task is gone.
        db.read_write(|conn| {
            conn.execute("INSERT INTO forward_dest (id, name) VALUES (1, 'a')", [])?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.active_transactions(), 0);
    }
}
