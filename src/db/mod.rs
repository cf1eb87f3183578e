pub mod models;
pub mod schema;

use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace};

use self::models::{NewAddress, Progress};
use self::schema::{addresses, progress};
use crate::config::DbConfig;
use crate::validate::is_valid_address;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

/// Primary key of the one and only progress row
const PROGRESS_ROW: i32 = 1;

/// Marker value written by `initialize` on a fresh store: the first block
pub const DEFAULT_PROGRESS: u64 = 1;

type Conn = SyncConnectionWrapper<SqliteConnection>;

/// Address set and ingestion progress, persisted in SQLite
///
/// Every statement goes through a single connection guarded by a mutex, so the database never
/// sees concurrent writers. Cloning is cheap and shares that connection.
#[derive(Clone)]
pub struct Db {
    url: String,
    conn: Arc<Mutex<Conn>>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("url", &self.url).finish()
    }
}

impl Db {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let mut conn = Conn::establish(&config.url).await?;

        diesel::sql_query("PRAGMA busy_timeout = 5000")
            .execute(&mut conn)
            .await?;

        Ok(Self {
            url: config.url.clone(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates the schema and the progress row if they don't exist yet.
    /// Safe to call on an already initialized store
    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn initialize(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;

        let url = self.url.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = SqliteConnection::establish(&url)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| eyre!("{}", e))
        })
        .await??;

        diesel::insert_or_ignore_into(progress::table)
            .values(Progress {
                id: PROGRESS_ROW,
                last_block: DEFAULT_PROGRESS as i64,
            })
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Inserts `address` unless it is malformed or already known.
    /// Returns whether a new row was written
    pub async fn save_address(&self, address: &str) -> Result<bool> {
        if !is_valid_address(address) {
            trace!(address, "rejecting malformed address");
            return Ok(false);
        }

        let mut conn = self.conn.lock().await;
        let inserted = diesel::insert_or_ignore_into(addresses::table)
            .values(NewAddress {
                address: address.to_owned(),
            })
            .execute(&mut *conn)
            .await?;

        if inserted > 0 {
            debug!(address, "address saved");
        }

        Ok(inserted > 0)
    }

    pub async fn get_progress(&self) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let row = progress::table
            .filter(progress::id.eq(PROGRESS_ROW))
            .select(Progress::as_select())
            .first::<Progress>(&mut *conn)
            .await?;

        Ok(u64::try_from(row.last_block)?)
    }

    /// Overwrites the progress marker. Callers are responsible for never moving it backwards
    pub async fn set_progress(&self, height: u64) -> Result<()> {
        let last_block = i64::try_from(height)?;

        let mut conn = self.conn.lock().await;
        diesel::update(progress::table.filter(progress::id.eq(PROGRESS_ROW)))
            .set(progress::last_block.eq(last_block))
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    pub async fn count_addresses(&self) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let count = addresses::table
            .count()
            .get_result::<i64>(&mut *conn)
            .await?;

        Ok(u64::try_from(count)?)
    }

    /// All stored addresses, sorted
    pub async fn addresses(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        let res = addresses::table
            .select(addresses::address)
            .order(addresses::address.asc())
            .load::<String>(&mut *conn)
            .await?;

        Ok(res)
    }
}
