//! Mail account repository

use crate::db::DatabasePool;
use crate::models::MailAccountRow;
use async_trait::async_trait;
use postmaster_common::types::MailAccount;
use postmaster_common::{Error, Result};

/// Mail account repository trait
#[async_trait]
pub trait MailAccountRepository: Send + Sync {
    /// Accounts with `valid_id = 1`, ordered by id
    async fn list_active(&self) -> Result<Vec<MailAccount>>;
}

/// Database mail account repository
#[derive(Clone)]
pub struct DbMailAccountRepository {
    pool: DatabasePool,
}

impl DbMailAccountRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MailAccountRepository for DbMailAccountRepository {
    async fn list_active(&self) -> Result<Vec<MailAccount>> {
        let rows = sqlx::query_as::<_, MailAccountRow>(
            r#"
            SELECT id, login, pw, host, port, account_type, queue_id,
                   trusted, poll_interval_seconds, valid_id
            FROM mail_account
            WHERE valid_id = 1
            ORDER BY id
            "#,
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(rows.into_iter().map(MailAccount::from).collect())
    }
}
