//! SQLite schema for the staging store

use rusqlite::Connection;

use crate::error::RepoResult;

/// Tables in the order they must be emptied so no foreign key is left
/// dangling.
pub const TABLES_CHILD_FIRST: &[&str] = &[
    "forward_aggregate",
    "forward_source",
    "source_entry",
    "source_item",
    "aggregate",
    "source",
    "forward_dest",
];

/// Initialize the store schema
pub fn init_schema(conn: &Connection) -> RepoResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS source (
            id INTEGER PRIMARY KEY,
            file_store_id INTEGER NOT NULL UNIQUE,
            feed_name TEXT,
            type_name TEXT,
            last_modified_time_ms INTEGER NOT NULL,

            -- Decomposed into items and entries
            examined BOOLEAN NOT NULL DEFAULT 0,
            -- Every destination accepted the whole source (direct forwarding)
            forwarded BOOLEAN NOT NULL DEFAULT 0,

            -- Queues
            new_position INTEGER UNIQUE,
            forward_position INTEGER UNIQUE
        );

        CREATE TABLE IF NOT EXISTS forward_dest (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS aggregate (
            id INTEGER PRIMARY KEY,
            feed_name TEXT,
            type_name TEXT,
            byte_size INTEGER NOT NULL DEFAULT 0,
            items INTEGER NOT NULL DEFAULT 0,
            create_time_ms INTEGER NOT NULL,
            complete BOOLEAN NOT NULL DEFAULT 0,

            -- Closed and waiting for forward records
            new_position INTEGER UNIQUE
        );

        CREATE TABLE IF NOT EXISTS source_item (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            feed_name TEXT,
            type_name TEXT,
            byte_size INTEGER NOT NULL DEFAULT 0,
            fk_source_id INTEGER NOT NULL,
            -- Weak reference: the aggregate may already be gone
            fk_aggregate_id INTEGER,

            -- Waiting to be aggregated
            new_position INTEGER UNIQUE,

            FOREIGN KEY(fk_source_id) REFERENCES source(id)
        );

        CREATE TABLE IF NOT EXISTS source_entry (
            id INTEGER PRIMARY KEY,
            extension TEXT NOT NULL,
            extension_type INTEGER NOT NULL,
            byte_size INTEGER NOT NULL DEFAULT 0,
            fk_source_item_id INTEGER NOT NULL,

            FOREIGN KEY(fk_source_item_id) REFERENCES source_item(id)
        );

        CREATE TABLE IF NOT EXISTS forward_aggregate (
            id INTEGER PRIMARY KEY,
            update_time_ms INTEGER NOT NULL,
            fk_forward_dest_id INTEGER NOT NULL,
            fk_aggregate_id INTEGER NOT NULL,
            success BOOLEAN NOT NULL DEFAULT 0,
            error TEXT,
            tries INTEGER NOT NULL DEFAULT 0,

            new_position INTEGER UNIQUE,
            retry_position INTEGER UNIQUE,

            UNIQUE(fk_aggregate_id, fk_forward_dest_id),
            FOREIGN KEY(fk_forward_dest_id) REFERENCES forward_dest(id),
            FOREIGN KEY(fk_aggregate_id) REFERENCES aggregate(id)
        );

        CREATE TABLE IF NOT EXISTS forward_source (
            id INTEGER PRIMARY KEY,
            update_time_ms INTEGER NOT NULL,
            fk_forward_dest_id INTEGER NOT NULL,
            fk_source_id INTEGER NOT NULL,
            success BOOLEAN NOT NULL DEFAULT 0,
            error TEXT,
            tries INTEGER NOT NULL DEFAULT 0,

            new_position INTEGER UNIQUE,
            retry_position INTEGER UNIQUE,

            UNIQUE(fk_source_id, fk_forward_dest_id),
            FOREIGN KEY(fk_forward_dest_id) REFERENCES forward_dest(id),
            FOREIGN KEY(fk_source_id) REFERENCES source(id)
        );

        CREATE INDEX IF NOT EXISTS idx_source_item_source ON source_item(fk_source_id);
        CREATE INDEX IF NOT EXISTS idx_source_item_aggregate ON source_item(fk_aggregate_id);
        CREATE INDEX IF NOT EXISTS idx_source_entry_item ON source_entry(fk_source_item_id);
        CREATE INDEX IF NOT EXISTS idx_aggregate_open ON aggregate(feed_name, type_name, complete);
        CREATE INDEX IF NOT EXISTS idx_forward_aggregate_aggregate ON forward_aggregate(fk_aggregate_id);
        CREATE INDEX IF NOT EXISTS idx_forward_aggregate_dest ON forward_aggregate(fk_forward_dest_id);
        CREATE INDEX IF NOT EXISTS idx_forward_source_source ON forward_source(fk_source_id);
        CREATE INDEX IF NOT EXISTS idx_forward_source_dest ON forward_source(fk_forward_dest_id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_init_schema() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables = table_names(&conn);
        for table in TABLES_CHILD_FIRST {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        assert!(init_schema(&conn).is_ok());
    }

    #[test]
    fn test_queue_positions_are_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO aggregate (id, create_time_ms, new_position) VALUES (1, 0, 7)",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO aggregate (id, create_time_ms, new_position) VALUES (2, 0, 7)",
            [],
        );
        assert!(dup.is_err());
    }
}
