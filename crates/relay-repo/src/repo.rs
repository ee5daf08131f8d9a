//! The staging store as a whole

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregateBounds, AggregateStore};
use crate::config::RepoConfig;
use crate::db::{schema, Database, MaintenanceTask};
use crate::dest::ForwardDestStore;
use crate::error::RepoResult;
use crate::forward::{ForwardAggregateStore, ForwardSourceStore, ForwardStore};
use crate::ids::clear_table;
use crate::model::ForwardDest;
use crate::source::{count, SourceStore};

/// Row counts and queue depths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoStats {
    pub sources: i64,
    pub sources_awaiting_examination: i64,
    pub sources_awaiting_forward: i64,
    pub items: i64,
    pub items_awaiting_aggregation: i64,
    pub entries: i64,
    pub aggregates: i64,
    pub open_aggregates: i64,
    pub aggregates_awaiting_forward: i64,
    pub forward_dests: i64,
    pub forward_aggregates: i64,
    pub forward_aggregates_new: i64,
    pub forward_aggregates_retry: i64,
    pub forward_aggregates_failed: i64,
    pub forward_sources: i64,
    pub forward_sources_new: i64,
    pub forward_sources_retry: i64,
    pub forward_sources_failed: i64,
}

/// What one housekeeping pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    pub items_aggregated: usize,
    pub aggregates_closed: usize,
    pub forward_records_created: usize,
    pub orphaned_items_deleted: usize,
    pub sources_deleted: usize,
}

/// Every store over one database, wired together
pub struct ProxyRepo {
    config: RepoConfig,
    db: Arc<Database>,
    sources: SourceStore,
    aggregates: AggregateStore,
    dests: Arc<ForwardDestStore>,
    forward_aggregates: ForwardAggregateStore,
    forward_sources: ForwardSourceStore,
    destinations: RwLock<Vec<ForwardDest>>,
    _maintenance: Option<MaintenanceTask>,
}

impl ProxyRepo {
    /// Open the store, recover lost queue entries, reconcile destinations
    /// and start maintenance.
    pub fn open(config: RepoConfig) -> RepoResult<Self> {
        config.validate()?;

        let db = Arc::new(Database::open(&config.database)?);
        let sources = SourceStore::open(Arc::clone(&db), config.forwarding.direct)?;
        let aggregates = AggregateStore::open(Arc::clone(&db), sources.new_item_queue())?;
        let dests = Arc::new(ForwardDestStore::open(Arc::clone(&db))?);
        let forward_aggregates =
            ForwardStore::open(Arc::clone(&db), Arc::clone(&dests), aggregates.closed_queue())?;
        let forward_sources =
            ForwardStore::open(Arc::clone(&db), Arc::clone(&dests), sources.forward_queue())?;

        let maintenance = match config.database.maintenance_interval() {
            Some(interval) => Some(MaintenanceTask::spawn(Arc::clone(&db), interval)?),
            None => None,
        };

        let repo = Self {
            config,
            db,
            sources,
            aggregates,
            dests,
            forward_aggregates,
            forward_sources,
            destinations: RwLock::new(Vec::new()),
            _maintenance: maintenance,
        };

        let names = repo.config.forwarding.destinations.clone();
        repo.set_destinations(&names)?;

        info!(
            path = %repo.db.path().display(),
            destinations = names.len(),
            direct = repo.config.forwarding.direct,
            "Staging store ready"
        );

        Ok(repo)
    }

    /// Open a store another process may own, for looking only.
    ///
    /// Skips recovery, destination reconciliation and maintenance, so
    /// opening writes nothing beyond creating a missing schema. Configured
    /// destinations that are already registered are reported by
    /// [`ProxyRepo::destinations`]; unknown names are not registered.
    pub fn inspect(config: RepoConfig) -> RepoResult<Self> {
        config.validate()?;

        let db = Arc::new(Database::open(&config.database)?);
        let sources = SourceStore::attach(Arc::clone(&db), config.forwarding.direct)?;
        let aggregates = AggregateStore::open(Arc::clone(&db), sources.new_item_queue())?;
        let dests = Arc::new(ForwardDestStore::open(Arc::clone(&db))?);
        let forward_aggregates =
            ForwardStore::attach(Arc::clone(&db), Arc::clone(&dests), aggregates.closed_queue())?;
        let forward_sources =
            ForwardStore::attach(Arc::clone(&db), Arc::clone(&dests), sources.forward_queue())?;

        let configured: HashSet<&str> = config
            .forwarding
            .destinations
            .iter()
            .map(|name| name.trim())
            .collect();
        let active: Vec<ForwardDest> = dests
            .get_forward_dests()?
            .into_iter()
            .filter(|d| configured.contains(d.name.as_str()))
            .collect();

        debug!(path = %db.path().display(), "Staging store opened for inspection");

        Ok(Self {
            config,
            db,
            sources,
            aggregates,
            dests,
            forward_aggregates,
            forward_sources,
            destinations: RwLock::new(active),
            _maintenance: None,
        })
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn sources(&self) -> &SourceStore {
        &self.sources
    }

    pub fn aggregates(&self) -> &AggregateStore {
        &self.aggregates
    }

    pub fn dests(&self) -> &ForwardDestStore {
        &self.dests
    }

    pub fn forward_aggregates(&self) -> &ForwardAggregateStore {
        &self.forward_aggregates
    }

    pub fn forward_sources(&self) -> &ForwardSourceStore {
        &self.forward_sources
    }

    /// Destinations currently forwarded to
    pub fn destinations(&self) -> Vec<ForwardDest> {
        self.destinations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make `names` the active destination set.
    ///
    /// Registered destinations missing from `names` are retired and their
    /// forward rows removed; outstanding subjects gain rows for the rest.
    /// An empty set retires nothing: data is held until a destination is
    /// configured again.
    pub fn set_destinations(&self, names: &[String]) -> RepoResult<()> {
        if names.is_empty() {
            self.destinations
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            debug!("No destinations configured, reconciliation skipped");
            return Ok(());
        }

        let mut active = Vec::with_capacity(names.len());
        for name in names {
            let dest = self.dests.get_forward_dest(name)?;
            if !active.contains(&dest) {
                active.push(dest);
            }
        }

        let active_ids: HashSet<i64> = active.iter().map(|d| d.id).collect();
        let retired: Vec<ForwardDest> = self
            .dests
            .get_forward_dests()?
            .into_iter()
            .filter(|d| !active_ids.contains(&d.id))
            .collect();

        // Back-fill first so a subject moving between destinations is never
        // left with none.
        let added = self.forward_aggregates.add_new_forward_records(&active)?
            + self.forward_sources.add_new_forward_records(&active)?;
        let removed = self.forward_aggregates.remove_old_forward_records(&retired)?
            + self.forward_sources.remove_old_forward_records(&retired)?;

        debug!(
            active = active.len(),
            retired = retired.len(),
            removed,
            added,
            "Reconciled destinations"
        );

        *self
            .destinations
            .write()
            .unwrap_or_else(PoisonError::into_inner) = active;
        Ok(())
    }

    pub fn bounds(&self) -> AggregateBounds {
        AggregateBounds {
            max_items: self.config.aggregation.max_items_per_aggregate,
            max_bytes: self.config.aggregation.max_uncompressed_byte_size,
        }
    }

    /// Aggregate every queued item
    pub fn aggregate_new_items(&self) -> RepoResult<usize> {
        let limit = self.config.aggregation.close_batch_limit;
        let mut total = 0;
        loop {
            let added = self.aggregates.aggregate_new_items(self.bounds(), limit)?;
            total += added;
            if added < limit {
                return Ok(total);
            }
        }
    }

    /// Close aggregates past the configured age or size bounds
    pub fn close_old_aggregates(&self) -> RepoResult<usize> {
        let aggregation = &self.config.aggregation;
        self.aggregates.close_aggregates(
            self.bounds(),
            aggregation.max_aggregate_age(),
            aggregation.close_batch_limit,
        )
    }

    /// Close every open aggregate regardless of bounds
    pub fn close_all_aggregates(&self) -> RepoResult<usize> {
        self.aggregates
            .close_aggregates(self.bounds(), std::time::Duration::ZERO, i64::MAX as usize)
    }

    /// Fan out queued aggregates, and sources in direct mode
    pub fn create_forward_records(&self) -> RepoResult<usize> {
        let destinations = self.destinations();
        Ok(self.forward_aggregates.create_forward_records(&destinations)?
            + self.forward_sources.create_forward_records(&destinations)?)
    }

    pub fn delete_failed_forwards(&self) -> RepoResult<usize> {
        Ok(self.forward_aggregates.delete_failed_forwards()?
            + self.forward_sources.delete_failed_forwards()?)
    }

    /// Remove orphaned items, then sources with nothing left to forward.
    ///
    /// Returns (orphaned items, sources) deleted.
    pub fn sweep_sources(&self) -> RepoResult<(usize, usize)> {
        let orphaned = self.sources.delete_orphaned_items()?;
        let limit = self.config.aggregation.close_batch_limit;

        let mut deleted = 0;
        loop {
            let ids: Vec<i64> = self
                .sources
                .get_deletable_sources(limit)?
                .into_iter()
                .map(|s| s.id)
                .collect();
            if ids.is_empty() {
                break;
            }
            let removed = self.sources.delete_sources(&ids)?;
            deleted += removed;
            if removed == 0 || ids.len() < limit {
                break;
            }
        }

        Ok((orphaned, deleted))
    }

    /// Aggregate, close, fan out and sweep once.
    pub fn housekeeping(&self) -> RepoResult<HousekeepingReport> {
        let items_aggregated = if self.sources.is_direct() {
            0
        } else {
            self.aggregate_new_items()?
        };
        let aggregates_closed = self.close_old_aggregates()?;
        let forward_records_created = self.create_forward_records()?;
        let (orphaned_items_deleted, sources_deleted) = self.sweep_sources()?;

        Ok(HousekeepingReport {
            items_aggregated,
            aggregates_closed,
            forward_records_created,
            orphaned_items_deleted,
            sources_deleted,
        })
    }

    pub fn stats(&self) -> RepoResult<RepoStats> {
        let fa = &self.forward_aggregates;
        let fs = &self.forward_sources;

        self.db.read_only(|conn| {
            Ok(RepoStats {
                sources: count(conn, "source")?,
                sources_awaiting_examination: self.sources.new_source_queue().len(conn)?,
                sources_awaiting_forward: fs.subject_queue().len(conn)?,
                items: count(conn, "source_item")?,
                items_awaiting_aggregation: self.sources.new_item_queue().len(conn)?,
                entries: count(conn, "source_entry")?,
                aggregates: count(conn, "aggregate")?,
                open_aggregates: conn.query_row(
                    "SELECT COUNT(*) FROM aggregate WHERE complete = 0",
                    [],
                    |row| row.get(0),
                )?,
                aggregates_awaiting_forward: fa.subject_queue().len(conn)?,
                forward_dests: count(conn, "forward_dest")?,
                forward_aggregates: fa.count_in(conn)?,
                forward_aggregates_new: fa.new_queue().len(conn)?,
                forward_aggregates_retry: fa.retry_queue().len(conn)?,
                forward_aggregates_failed: fa.count_failed_in(conn)?,
                forward_sources: fs.count_in(conn)?,
                forward_sources_new: fs.new_queue().len(conn)?,
                forward_sources_retry: fs.retry_queue().len(conn)?,
                forward_sources_failed: fs.count_failed_in(conn)?,
            })
        })
    }

    /// Delete every row and reseed every counter.
    ///
    /// Destinations from the configuration are registered again afterwards.
    pub fn clear(&self) -> RepoResult<()> {
        warn!(path = %self.db.path().display(), "Clearing staging store");

        self.db.read_write(|conn| {
            for table in schema::TABLES_CHILD_FIRST {
                clear_table(conn, table)?;
            }
            Ok(())
        })?;

        // Counters follow the committed state only.
        self.db.read_write(|conn| {
            self.sources.reset(conn)?;
            self.aggregates.reset(conn)?;
            self.dests.reset(conn)?;
            self.forward_aggregates.reset(conn)?;
            self.forward_sources.reset(conn)
        })?;

        let names = self.config.forwarding.destinations.clone();
        self.set_destinations(&names)
    }

    pub fn run_maintenance(&self) -> RepoResult<()> {
        self.db.run_maintenance()
    }
}
