use rusqlite::Connection;
use tracing::debug;

use super::ForwardSubject;
use crate::error::RepoResult;
use crate::model::RepoSource;
use crate::source::load_source;

impl ForwardSubject for RepoSource {
    const NAME: &'static str = "source";
    const TABLE: &'static str = "forward_source";
    const FK_COLUMN: &'static str = "fk_source_id";
    const SUBJECT_TABLE: &'static str = "source";
    const QUEUE_COLUMN: &'static str = "forward_position";

    fn load(conn: &Connection, id: i64) -> RepoResult<Option<Self>> {
        load_source(conn, id)
    }

    /// The source stays behind, marked forwarded, until a sweep deletes it.
    fn complete(conn: &Connection, id: i64) -> RepoResult<()> {
        conn.execute("DELETE FROM forward_source WHERE fk_source_id = ?1", [id])?;
        conn.execute(
            "UPDATE source SET forwarded = 1, forward_position = NULL WHERE id = ?1",
            [id],
        )?;
        debug!(source_id = id, "Source forwarded");
        Ok(())
    }
}
