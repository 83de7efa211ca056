//! POP3 fetcher
//!
//! One call to [`Pop3Fetcher::fetch`] drains a mailbox: every listed
//! message is retrieved and handed to a [`MessageHandler`], and the ones
//! the handler accepted are deleted before the session ends. Transient
//! failures restart the whole session on a fresh connection.
//!
//! Cancellation is observed between commands. A command already on the
//! wire runs to completion so the session can still delete what the
//! handler accepted and QUIT cleanly.

use crate::connector::{Connector, MailboxConnection, MessageId, Pop3Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postmaster_common::config::InboundConfig;
use postmaster_common::types::MailAccount;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A message pulled from a mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    /// Server-assigned unique id
    pub uid: String,
    /// Sequence number within the session that fetched it
    pub seq: u32,
    /// Deduplication key, see [`MailAccount::remote_id`]
    pub remote_id: String,
    /// Raw RFC 5322 bytes
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

/// Consumer of fetched messages
///
/// Returning an error stops the fetch; the failing message and every
/// message after it stay on the server.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &FetchedMessage) -> anyhow::Result<()>;
}

/// Time source for capture timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> DateTime<Utc> + Send + Sync,
{
    fn now(&self) -> DateTime<Utc> {
        self()
    }
}

/// Fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid account: {0}")]
    InvalidAccount(String),

    #[error("pop3 connect: {0}")]
    Connect(#[source] Pop3Error),

    #[error("pop3 auth: {0}")]
    Auth(#[source] Pop3Error),

    #[error("pop3 list: {0}")]
    List(#[source] Pop3Error),

    #[error("pop3 retrieve {uid}: {source}")]
    Retrieve { uid: String, source: Pop3Error },

    #[error("handler failed for {uid}: {source}")]
    Handler { uid: String, source: anyhow::Error },

    #[error("pop3 delete: {0}")]
    Delete(#[source] Pop3Error),

    #[error("fetch cancelled")]
    Cancelled,

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    /// Transient failures are retried on a new session
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Connect(_) | FetchError::List(_) | FetchError::Retrieve { .. }
        )
    }
}

/// Outcome of a successful fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Sessions opened, including failed ones
    pub attempts: u32,
    /// Messages listed by the last session
    pub listed: usize,
    /// Messages the handler accepted
    pub accepted: usize,
    /// Messages that vanished between listing and retrieval
    pub skipped: usize,
    /// Messages marked deleted on the server
    pub deleted: usize,
}

/// Fetcher tuning
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub delete_after_fetch: bool,
    pub max_attempts: u32,
    /// Base delay between attempts, multiplied by the attempt number
    pub backoff: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            delete_after_fetch: true,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl From<&InboundConfig> for FetchOptions {
    fn from(config: &InboundConfig) -> Self {
        Self {
            delete_after_fetch: config.delete_after_fetch,
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Drains POP3 mailboxes through a [`Connector`]
#[derive(Clone)]
pub struct Pop3Fetcher {
    connector: Arc<dyn Connector>,
    options: FetchOptions,
    clock: Arc<dyn Clock>,
}

impl Pop3Fetcher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            options: FetchOptions::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Fetch every message of `account` and pass it to `handler`
    pub async fn fetch(
        &self,
        cancel: &CancellationToken,
        account: &MailAccount,
        handler: &dyn MessageHandler,
    ) -> Result<FetchReport, FetchError> {
        validate_account(account)?;

        let max_attempts = self.options.max_attempts.max(1);
        let mut report = FetchReport::default();
        // uids handed to the handler whose deletion has not been committed
        let mut handled = HashSet::new();

        loop {
            report.attempts += 1;
            let attempt = report.attempts;

            let err = match self
                .run_session(cancel, account, handler, &mut handled, &mut report)
                .await
            {
                Ok(()) => {
                    info!(
                        account_id = account.id,
                        attempts = report.attempts,
                        listed = report.listed,
                        accepted = report.accepted,
                        skipped = report.skipped,
                        deleted = report.deleted,
                        "Mailbox fetch completed"
                    );
                    return Ok(report);
                }
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if attempt >= max_attempts {
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.options.backoff * attempt;
            warn!(
                account_id = account.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Mailbox fetch failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_session(
        &self,
        cancel: &CancellationToken,
        account: &MailAccount,
        handler: &dyn MessageHandler,
        handled: &mut HashSet<String>,
        report: &mut FetchReport,
    ) -> Result<(), FetchError> {
        let session = Uuid::new_v4();
        debug!(account_id = account.id, %session, "Opening mailbox session");

        let mut conn = cancellable(cancel, self.connector.connect(account))
            .await?
            .map_err(FetchError::Connect)?;

        let auth = cancellable(cancel, conn.authenticate(&account.login, &account.password)).await?;
        if let Err(err) = auth {
            safe_quit(account, conn.as_mut()).await;
            return Err(FetchError::Auth(err));
        }

        let (listing, stable_uids) = match list_messages(cancel, conn.as_mut()).await? {
            Ok(listing) => listing,
            Err(err) => {
                safe_quit(account, conn.as_mut()).await;
                return Err(FetchError::List(err));
            }
        };
        report.listed = listing.len();
        debug!(account_id = account.id, %session, messages = listing.len(), "Mailbox listed");

        let mut accepted: Vec<MessageId> = Vec::new();
        let mut outcome = Ok(());

        for id in &listing {
            if cancel.is_cancelled() {
                outcome = Err(FetchError::Cancelled);
                break;
            }

            if stable_uids && handled.contains(&id.uid) {
                debug!(account_id = account.id, uid = %id.uid, "Message already handled by an earlier session, skipping handler");
                accepted.push(id.clone());
                continue;
            }

            let retrieved = conn.retrieve(id.seq).await;
            if cancel.is_cancelled() {
                outcome = Err(FetchError::Cancelled);
                break;
            }

            let raw = match retrieved {
                Ok(raw) => raw,
                Err(err) if err.is_no_such_message() => {
                    warn!(account_id = account.id, uid = %id.uid, error = %err, "Message vanished before retrieval, skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    outcome = Err(FetchError::Retrieve {
                        uid: id.uid.clone(),
                        source: err,
                    });
                    break;
                }
            };

            let message = FetchedMessage {
                uid: id.uid.clone(),
                seq: id.seq,
                remote_id: account.remote_id(&id.uid),
                raw,
                received_at: self.clock.now(),
            };

            if let Err(err) = handler.handle(&message).await {
                outcome = Err(FetchError::Handler {
                    uid: id.uid.clone(),
                    source: err,
                });
                break;
            }

            debug!(account_id = account.id, uid = %id.uid, "Message handled");
            accepted.push(id.clone());
            report.accepted += 1;
        }

        let seqs: Vec<u32> = accepted.iter().map(|id| id.seq).collect();
        let deleted = self.delete_accepted(account, conn.as_mut(), &seqs).await;
        let quit = safe_quit(account, conn.as_mut()).await;

        // Only a clean QUIT commits DELE, anything else leaves the
        // messages on the server for the next session to delete.
        // LIST numbers are not stable across sessions, so those are never carried.
        let committed = quit && deleted.is_ok() && self.options.delete_after_fetch;
        for id in accepted {
            if committed || !stable_uids {
                handled.remove(&id.uid);
            } else {
                handled.insert(id.uid);
            }
        }

        match (outcome, deleted) {
            (Ok(()), Ok(count)) => {
                report.deleted += count;
                Ok(())
            }
            (Ok(()), Err(err)) => Err(err),
            (Err(err), Ok(count)) => {
                report.deleted += count;
                Err(err)
            }
            (Err(err), Err(delete_err)) => {
                warn!(account_id = account.id, error = %delete_err, "Deleting accepted messages failed");
                Err(err)
            }
        }
    }

    async fn delete_accepted(
        &self,
        account: &MailAccount,
        conn: &mut dyn MailboxConnection,
        accepted: &[u32],
    ) -> Result<usize, FetchError> {
        if !self.options.delete_after_fetch || accepted.is_empty() {
            return Ok(0);
        }

        conn.mark_deleted(accepted)
            .await
            .map_err(FetchError::Delete)?;

        debug!(account_id = account.id, count = accepted.len(), "Marked messages deleted");
        Ok(accepted.len())
    }
}

/// Reject accounts the fetcher cannot serve before dialing
pub fn validate_account(account: &MailAccount) -> Result<(), FetchError> {
    if account.protocol().is_none() {
        return Err(FetchError::InvalidAccount(format!(
            "unsupported account type '{}'",
            account.account_type
        )));
    }
    if account.host.trim().is_empty() {
        return Err(FetchError::InvalidAccount("host is required".to_string()));
    }
    if account.login.is_empty() {
        return Err(FetchError::InvalidAccount("login is required".to_string()));
    }
    if account.password.is_empty() {
        return Err(FetchError::InvalidAccount("password is required".to_string()));
    }
    Ok(())
}

/// UIDL, degrading to LIST when the server refuses it
///
/// The flag tells whether the uids came from UIDL.
async fn list_messages(
    cancel: &CancellationToken,
    conn: &mut dyn MailboxConnection,
) -> Result<Result<(Vec<MessageId>, bool), Pop3Error>, FetchError> {
    match cancellable(cancel, conn.list_unique()).await? {
        Ok(listing) => Ok(Ok((listing, true))),
        Err(err) => {
            debug!(error = %err, "UIDL failed, falling back to LIST");
            let listing = cancellable(cancel, conn.list()).await?;
            Ok(listing.map(|listing| (listing, false)))
        }
    }
}

/// QUIT, logging instead of propagating failures
///
/// Returns whether the server acknowledged it.
async fn safe_quit(account: &MailAccount, conn: &mut dyn MailboxConnection) -> bool {
    match conn.quit().await {
        Ok(()) => true,
        Err(err) => {
            warn!(account_id = account.id, error = %err, "POP3 quit failed");
            false
        }
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, FetchError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FetchError::Cancelled),
        out = fut => Ok(out),
    }
}
