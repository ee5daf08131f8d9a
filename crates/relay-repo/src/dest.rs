//! Destination registry

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::db::Database;
use crate::error::{RepoError, RepoResult};
use crate::ids::IdGenerator;
use crate::model::ForwardDest;

/// Maps destination names to stable ids, creating them on first use.
pub struct ForwardDestStore {
    db: Arc<Database>,
    ids: IdGenerator,
    cache: Mutex<HashMap<String, i64>>,
}

impl ForwardDestStore {
    pub fn open(db: Arc<Database>) -> RepoResult<Self> {
        let (ids, known) = db.read_only(|conn| {
            let ids = IdGenerator::seed(conn, "forward_dest")?;
            let known = load_all(conn)?;
            Ok((ids, known))
        })?;

        Ok(Self {
            db,
            ids,
            cache: Mutex::new(known.into_iter().map(|d| (d.name, d.id)).collect()),
        })
    }

    /// Id for `name`, registering it if it is new
    pub fn get_forward_dest_id(&self, name: &str) -> RepoResult<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RepoError::invalid_argument("Destination name cannot be empty"));
        }

        if let Some(id) = self.lock_cache().get(name) {
            return Ok(*id);
        }

        let id = self.db.read_write(|conn| {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM forward_dest WHERE name = ?1",
                    [name],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }

            let id = self.ids.next();
            conn.execute(
                "INSERT INTO forward_dest (id, name) VALUES (?1, ?2)",
                params![id, name],
            )?;
            info!(dest_id = id, dest = name, "Registered forward destination");
            Ok(id)
        })?;

        self.lock_cache().insert(name.to_string(), id);
        Ok(id)
    }

    pub fn get_forward_dest(&self, name: &str) -> RepoResult<ForwardDest> {
        let id = self.get_forward_dest_id(name)?;
        Ok(ForwardDest {
            id,
            name: name.trim().to_string(),
        })
    }

    /// Every registered destination, by id
    pub fn get_forward_dests(&self) -> RepoResult<Vec<ForwardDest>> {
        self.db.read_only(load_all)
    }

    pub fn count(&self) -> RepoResult<i64> {
        self.db.read_only(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM forward_dest", [], |row| row.get(0))?)
        })
    }

    pub(crate) fn load(&self, conn: &Connection, id: i64) -> RepoResult<ForwardDest> {
        conn.query_row(
            "SELECT id, name FROM forward_dest WHERE id = ?1",
            [id],
            |row| {
                Ok(ForwardDest {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| RepoError::not_found("forward_dest", id))
    }

    pub(crate) fn reset(&self, conn: &Connection) -> RepoResult<()> {
        self.ids.reset(conn)?;
        self.lock_cache().clear();
        Ok(())
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_all(conn: &Connection) -> RepoResult<Vec<ForwardDest>> {
    let mut stmt = conn.prepare("SELECT id, name FROM forward_dest ORDER BY id")?;
    let dests = stmt
        .query_map([], |row| {
            Ok(ForwardDest {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(dests)
}
