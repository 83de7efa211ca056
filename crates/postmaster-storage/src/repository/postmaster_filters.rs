//! Postmaster filter repository

use crate::db::DatabasePool;
use crate::models::{group_filter_rows, PostmasterFilter, PostmasterFilterRow};
use async_trait::async_trait;
use postmaster_common::{Error, Result};
use tracing::debug;

const SELECT_ALL: &str = r#"
    SELECT f_name, f_stop, f_type, f_key, f_value, f_not
    FROM postmaster_filter
    ORDER BY f_name, f_type DESC, f_key
"#;

/// Postmaster filter repository trait
#[async_trait]
pub trait PostmasterFilterRepository: Send + Sync {
    /// All rule groups in name order
    async fn list(&self) -> Result<Vec<PostmasterFilter>>;
}

/// Database postmaster filter repository
#[derive(Clone)]
pub struct DbPostmasterFilterRepository {
    pool: DatabasePool,
}

impl DbPostmasterFilterRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PostmasterFilterRepository for DbPostmasterFilterRepository {
    async fn list(&self) -> Result<Vec<PostmasterFilter>> {
        let rows = sqlx::query_as::<_, PostmasterFilterRow>(SELECT_ALL)
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(rows = rows.len(), "Loaded postmaster filter rows");
        Ok(group_filter_rows(rows))
    }
}
