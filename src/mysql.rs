use crate::db::{MerchantRow, MerchantStore};
use crate::settings::{DatabaseSettings, TableSettings};
use crate::types::{BranchCount, RetailerID, StoreError};

use async_trait::async_trait;
use log::debug;
use secrecy::ExposeSecret;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySqlPool, Row};

/// Merchant table in MySQL, accessed through a bounded connection pool.
pub struct MySqlStore {
    pool: MySqlPool,
    find_query: String,
    update_query: String,
}

impl MySqlStore {
    /// Opens the pool and checks that a connection can be established.
    pub async fn connect(
        database: &DatabaseSettings,
        table: &TableSettings,
    ) -> Result<Self, StoreError> {
        debug!(target: "store", "Connecting to {}", table.name);
        let pool = MySqlPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .max_lifetime(database.max_lifetime())
            .idle_timeout(database.idle_timeout())
            .acquire_timeout(database.acquire_timeout())
            .connect(database.url.expose_secret())
            .await?;

        Ok(Self::with_pool(pool, table))
    }

    /// `table` must already be validated; its identifiers are spliced into the queries.
    pub fn with_pool(pool: MySqlPool, table: &TableSettings) -> Self {
        let (find_query, update_query) = build_queries(table);
        Self {
            pool,
            find_query,
            update_query,
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn build_queries(table: &TableSettings) -> (String, String) {
    let TableSettings {
        name,
        retailer_id_column: id,
        branch_count_column: count,
    } = table;

    let find = format!("SELECT `{id}`, `{count}` FROM `{name}` WHERE `{id}` = ? LIMIT 1");
    let update =
        format!("UPDATE `{name}` SET `{count}` = ? WHERE `{id}` = ? AND `{count}` IS NULL");
    (find, update)
}

#[async_trait]
impl MerchantStore for MySqlStore {
    async fn find_merchant(&self, id: RetailerID) -> Result<Option<MerchantRow>, StoreError> {
        let row = sqlx::query(&self.find_query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(MerchantRow {
                retailer_id: row.try_get(0)?,
                branch_count: row.try_get(1)?,
            })),
            None => Ok(None),
        }
    }

    async fn set_branch_count(
        &self,
        id: RetailerID,
        branch_count: BranchCount,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&self.update_query)
            .bind(branch_count)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
