//! MySQL connection pool wrapper.
//!
//! Grounded on the `gjwang-zero_x_infinity` teacher-adjacent `db::Database`
//! (`connect()` + `health_check()` over a sqlx pool), adapted from
//! Postgres to the MySQL backend spec.md §6 names.

use crate::error::{MonitorError, Result};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

#[derive(Clone)]
pub struct Database {
    pub pool: MySqlPool,
}

impl Database {
    pub async fn connect(dsn: &str, pool_size: u32) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(pool_size)
            .connect(dsn)
            .await
            .map_err(|e| MonitorError::Fatal(format!("mysql connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| MonitorError::Transient(format!("mysql health check failed: {e}")))?;
        Ok(())
    }
}
