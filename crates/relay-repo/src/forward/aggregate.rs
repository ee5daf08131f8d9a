use rusqlite::Connection;

use super::ForwardSubject;
use crate::aggregate::{delete_aggregate, load_aggregate};
use crate::error::RepoResult;
use crate::model::Aggregate;

impl ForwardSubject for Aggregate {
    const NAME: &'static str = "aggregate";
    const TABLE: &'static str = "forward_aggregate";
    const FK_COLUMN: &'static str = "fk_aggregate_id";
    const SUBJECT_TABLE: &'static str = "aggregate";
    const QUEUE_COLUMN: &'static str = "new_position";

    fn load(conn: &Connection, id: i64) -> RepoResult<Option<Self>> {
        load_aggregate(conn, id)
    }

    fn complete(conn: &Connection, id: i64) -> RepoResult<()> {
        delete_aggregate(conn, id)
    }
}
