use diesel::prelude::*;
use diesel::sqlite::Sqlite;

use super::schema::{addresses, progress};

#[derive(Debug, Insertable)]
#[diesel(table_name = addresses, check_for_backend(Sqlite))]
pub struct NewAddress {
    pub address: String,
}

#[derive(Debug, Queryable, Selectable, Insertable)]
#[diesel(table_name = progress, check_for_backend(Sqlite))]
pub struct Progress {
    pub id: i32,

    /// Highest block height for which ingestion is complete
    pub last_block: i64,
}
