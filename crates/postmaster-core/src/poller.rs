//! Mail poller - periodically drains every active account
//!
//! Each cycle resolves the account list (static configuration plus the
//! `mail_account` table when enabled), skips accounts that are not yet
//! due, and fetches the rest in parallel tasks bounded by a semaphore.
//! Fetched messages run through the [`FilterChain`] and are handed to a
//! [`TicketSink`].

use crate::connector::Connector;
use crate::fetcher::{Clock, FetchError, FetchOptions, FetchReport, FetchedMessage, MessageHandler, Pop3Fetcher, SystemClock};
use crate::filters::{Annotations, FilterChain, MessageContext};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use postmaster_common::config::InboundConfig;
use postmaster_common::types::{AccountId, MailAccount};
use postmaster_storage::MailAccountRepository;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of the most recent poll of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Ok,
    Error,
}

/// Per-account poll bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollStatus {
    pub account_id: AccountId,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_status: Option<PollState>,
    pub last_error: Option<String>,
    /// Messages accepted during the last poll
    pub messages_fetched: usize,
    pub next_poll_eta: Option<DateTime<Utc>>,
}

impl PollStatus {
    fn new(account_id: AccountId) -> Self {
        Self {
            account_id,
            last_poll_at: None,
            last_status: None,
            last_error: None,
            messages_fetched: 0,
            next_poll_eta: None,
        }
    }
}

/// Ticket layer collaborator receiving filtered messages
#[async_trait]
pub trait TicketSink: Send + Sync {
    async fn deliver(
        &self,
        account: &MailAccount,
        message: &FetchedMessage,
        annotations: &Annotations,
    ) -> Result<()>;
}

/// Runs the filter chain for one account and forwards to the sink
pub struct PipelineHandler {
    account: MailAccount,
    chain: Arc<FilterChain>,
    sink: Arc<dyn TicketSink>,
}

impl PipelineHandler {
    pub fn new(account: MailAccount, chain: Arc<FilterChain>, sink: Arc<dyn TicketSink>) -> Self {
        Self {
            account,
            chain,
            sink,
        }
    }
}

#[async_trait]
impl MessageHandler for PipelineHandler {
    async fn handle(&self, message: &FetchedMessage) -> Result<()> {
        let mut ctx = MessageContext::new(&self.account, message);
        self.chain.run(&mut ctx).await?;
        let annotations = ctx.into_annotations();

        if annotations.ignore() {
            info!(
                account_id = self.account.id,
                uid = %message.uid,
                "Message marked ignored, acknowledging without ticket"
            );
            return Ok(());
        }

        self.sink.deliver(&self.account, message, &annotations).await
    }
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Accounts fetched this cycle
    pub polled: usize,
    pub failed: usize,
    /// Messages accepted across all accounts
    pub messages: usize,
}

/// Periodic poller over all configured accounts
pub struct MailPoller {
    fetcher: Pop3Fetcher,
    chain: Arc<FilterChain>,
    sink: Arc<dyn TicketSink>,
    config: InboundConfig,
    accounts: Vec<MailAccount>,
    account_repo: Option<Arc<dyn MailAccountRepository>>,
    semaphore: Arc<Semaphore>,
    statuses: Arc<RwLock<HashMap<AccountId, PollStatus>>>,
    clock: Arc<dyn Clock>,
}

impl MailPoller {
    pub fn new(
        connector: Arc<dyn Connector>,
        chain: FilterChain,
        sink: Arc<dyn TicketSink>,
        config: InboundConfig,
    ) -> Self {
        let fetcher = Pop3Fetcher::new(connector).with_options(FetchOptions::from(&config));
        let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));

        Self {
            fetcher,
            chain: Arc::new(chain),
            sink,
            config,
            accounts: Vec::new(),
            account_repo: None,
            semaphore,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            clock: Arc::new(SystemClock),
        }
    }

    /// Accounts polled in addition to the database ones
    pub fn with_accounts(mut self, accounts: Vec<MailAccount>) -> Self {
        self.accounts = accounts;
        self
    }

    /// Load active accounts from storage on every cycle
    pub fn with_account_repository(mut self, repo: Arc<dyn MailAccountRepository>) -> Self {
        self.account_repo = Some(repo);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.fetcher = self.fetcher.with_clock(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    /// Status of every account polled so far, ordered by account id
    pub async fn statuses(&self) -> Vec<PollStatus> {
        let mut statuses: Vec<PollStatus> = self.statuses.read().await.values().cloned().collect();
        statuses.sort_by_key(|s| s.account_id);
        statuses
    }

    pub async fn status(&self, account_id: AccountId) -> Option<PollStatus> {
        self.statuses.read().await.get(&account_id).cloned()
    }

    /// Poll cycles on the configured interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Inbound polling disabled");
            return;
        }

        let period = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = period.as_secs(),
            workers = self.config.worker_count,
            "Mail poller started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.poll_once(&cancel).await {
                Ok(report) => {
                    if report.polled > 0 {
                        info!(
                            polled = report.polled,
                            failed = report.failed,
                            messages = report.messages,
                            "Poll cycle finished"
                        );
                    }
                }
                Err(e) => error!("Poll cycle failed: {}", e),
            }
        }

        info!("Mail poller stopped");
    }

    /// Run one cycle over every account that is due
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let accounts = self.due_accounts().await?;
        let mut report = CycleReport::default();
        if accounts.is_empty() {
            return Ok(report);
        }

        debug!("Polling {} accounts", accounts.len());

        let mut handles = Vec::new();
        for account in accounts {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => permit?,
            };

            let fetcher = self.fetcher.clone();
            let chain = Arc::clone(&self.chain);
            let sink = Arc::clone(&self.sink);
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let handler = PipelineHandler::new(account.clone(), chain, sink);
                let result = fetcher.fetch(&cancel, &account, &handler).await;
                drop(permit);
                (account, result)
            });
            handles.push(handle);
        }

        for handle in handles {
            let (account, result) = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Poll task error: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            report.polled += 1;
            match &result {
                Ok(fetch) => report.messages += fetch.accepted,
                Err(FetchError::Cancelled) => {}
                Err(e) => {
                    report.failed += 1;
                    error!(account_id = account.id, host = %account.host, error = %e, "Mailbox poll failed");
                }
            }
            self.record(&account, &result).await;
        }

        Ok(report)
    }

    async fn record(&self, account: &MailAccount, result: &Result<FetchReport, FetchError>) {
        if matches!(result, Err(FetchError::Cancelled)) {
            return;
        }

        let now = self.clock.now();
        let next = chrono::Duration::from_std(self.interval_for(account))
            .ok()
            .map(|d| now + d);

        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(account.id)
            .or_insert_with(|| PollStatus::new(account.id));
        status.last_poll_at = Some(now);
        status.next_poll_eta = next;

        match result {
            Ok(report) => {
                status.last_status = Some(PollState::Ok);
                status.last_error = None;
                status.messages_fetched = report.accepted;
            }
            Err(e) => {
                status.last_status = Some(PollState::Error);
                status.last_error = Some(e.to_string());
                status.messages_fetched = 0;
            }
        }
    }

    fn interval_for(&self, account: &MailAccount) -> Duration {
        let secs = account
            .poll_interval_secs
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.poll_interval_secs);
        Duration::from_secs(secs)
    }

    /// Active accounts whose next poll time has passed, capped by `max_accounts`
    async fn due_accounts(&self) -> Result<Vec<MailAccount>> {
        let mut accounts = self.accounts.clone();
        if let Some(repo) = &self.account_repo {
            accounts.extend(repo.list_active().await?);
        }

        let now = self.clock.now();
        let statuses = self.statuses.read().await;
        let mut seen = HashSet::new();

        let mut due: Vec<MailAccount> = accounts
            .into_iter()
            .filter(|account| account.active)
            .filter(|account| {
                if seen.insert(account.id) {
                    true
                } else {
                    warn!(account_id = account.id, "Duplicate account id, skipping");
                    false
                }
            })
            .filter(|account| {
                statuses
                    .get(&account.id)
                    .and_then(|s| s.next_poll_eta)
                    .map_or(true, |eta| eta <= now)
            })
            .collect();

        if self.config.max_accounts > 0 && due.len() > self.config.max_accounts {
            debug!(
                due = due.len(),
                max = self.config.max_accounts,
                "Capping accounts polled this cycle"
            );
            due.truncate(self.config.max_accounts);
        }

        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::replay::{ReplayConnector, ReplaySession, ScriptedError};
    use crate::filters::TrustedHeadersFilter;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(AccountId, String, Annotations)>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn delivered(&self) -> Vec<(AccountId, String, Annotations)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TicketSink for RecordingSink {
        async fn deliver(
            &self,
            account: &MailAccount,
            message: &FetchedMessage,
            annotations: &Annotations,
        ) -> Result<()> {
            if self.fail {
                anyhow::bail!("ticket store unavailable");
            }
            self.delivered.lock().unwrap().push((
                account.id,
                message.uid.clone(),
                annotations.clone(),
            ));
            Ok(())
        }
    }

    struct StaticRepo(Vec<MailAccount>);

    #[async_trait]
    impl MailAccountRepository for StaticRepo {
        async fn list_active(&self) -> postmaster_common::Result<Vec<MailAccount>> {
            Ok(self.0.clone())
        }
    }

    fn account(id: AccountId) -> MailAccount {
        MailAccount {
            id,
            account_type: "pop3".to_string(),
            host: "mail.example".to_string(),
            login: "agent".to_string(),
            password: "secret".to_string(),
            allow_trusted_headers: true,
            active: true,
            ..Default::default()
        }
    }

    fn fixed_clock() -> Arc<dyn Clock> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        Arc::new(move || at)
    }

    fn chain() -> FilterChain {
        FilterChain::new().with_filter(Arc::new(TrustedHeadersFilter::default()))
    }

    fn config() -> InboundConfig {
        InboundConfig {
            worker_count: 2,
            backoff_ms: 0,
            ..Default::default()
        }
    }

    fn poller(connector: &ReplayConnector, sink: Arc<RecordingSink>) -> MailPoller {
        MailPoller::new(Arc::new(connector.clone()), chain(), sink, config())
            .with_clock(fixed_clock())
    }

    #[tokio::test]
    async fn test_poll_delivers_annotated_messages() {
        let connector = ReplayConnector::new(ReplaySession::with_messages([
            ("uid-1", "Subject: a\r\nX-GoatFlow-Queue: Sales\r\n\r\nhello"),
            ("uid-2", "Subject: b\r\n\r\nworld"),
        ]));
        let sink = Arc::new(RecordingSink::default());
        let poller = poller(&connector, sink.clone()).with_accounts(vec![account(1)]);

        let report = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                polled: 1,
                failed: 0,
                messages: 2
            }
        );

        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].1, "uid-1");
        assert_eq!(delivered[0].2.queue_name(), Some("Sales"));
        assert!(delivered[1].2.is_empty());
        assert_eq!(connector.record().deleted, vec![1, 2]);

        let status = poller.status(1).await.unwrap();
        assert_eq!(status.last_status, Some(PollState::Ok));
        assert_eq!(status.messages_fetched, 2);
        assert_eq!(
            status.next_poll_eta,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 1, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_ignored_message_acknowledged_without_delivery() {
        let connector = ReplayConnector::new(ReplaySession::with_messages([(
            "uid-1",
            "Subject: auto reply\r\nX-GoatFlow-Ignore: 1\r\n\r\n",
        )]));
        let sink = Arc::new(RecordingSink::default());
        let poller = poller(&connector, sink.clone()).with_accounts(vec![account(1)]);

        poller.poll_once(&CancellationToken::new()).await.unwrap();

        assert!(sink.delivered().is_empty());
        assert_eq!(connector.record().deleted, vec![1]);
    }

    #[tokio::test]
    async fn test_sink_failure_keeps_message_on_server() {
        let connector = ReplayConnector::new(ReplaySession::with_messages([(
            "uid-1",
            "Subject: a\r\n\r\n",
        )]));
        let sink = Arc::new(RecordingSink::failing());
        let poller = poller(&connector, sink).with_accounts(vec![account(1)]);

        let report = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(connector.record().deleted.is_empty());

        let status = poller.status(1).await.unwrap();
        assert_eq!(status.last_status, Some(PollState::Error));
        assert!(status.last_error.unwrap().contains("uid-1"));
    }

    #[tokio::test]
    async fn test_auth_failure_recorded() {
        let connector = ReplayConnector::new(
            ReplaySession::empty().fail_auth(ScriptedError::negative("invalid password")),
        );
        let poller = poller(&connector, Arc::new(RecordingSink::default()))
            .with_accounts(vec![account(4)]);

        poller.poll_once(&CancellationToken::new()).await.unwrap();

        let statuses = poller.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].last_status, Some(PollState::Error));
        assert!(statuses[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("invalid password"));
    }

    #[tokio::test]
    async fn test_accounts_not_due_are_skipped() {
        let connector = ReplayConnector::new(ReplaySession::empty());
        let poller = poller(&connector, Arc::new(RecordingSink::default()))
            .with_accounts(vec![account(1)]);
        let cancel = CancellationToken::new();

        assert_eq!(poller.poll_once(&cancel).await.unwrap().polled, 1);
        assert_eq!(poller.poll_once(&cancel).await.unwrap().polled, 0);
        assert_eq!(connector.record().sessions_opened, 1);
    }

    #[tokio::test]
    async fn test_inactive_and_duplicate_accounts_skipped() {
        let connector = ReplayConnector::new(ReplaySession::empty());
        let mut inactive = account(2);
        inactive.active = false;
        let poller = poller(&connector, Arc::new(RecordingSink::default()))
            .with_accounts(vec![account(1), inactive, account(1)]);

        let report = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.polled, 1);
    }

    #[tokio::test]
    async fn test_max_accounts_caps_cycle() {
        let connector = ReplayConnector::new(ReplaySession::empty());
        let config = InboundConfig {
            worker_count: 1,
            max_accounts: 2,
            ..Default::default()
        };
        let poller = MailPoller::new(
            Arc::new(connector.clone()),
            chain(),
            Arc::new(RecordingSink::default()),
            config,
        )
        .with_clock(fixed_clock())
        .with_accounts(vec![account(1), account(2), account(3)]);

        let report = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.polled, 2);
        let ids: Vec<AccountId> = poller.statuses().await.iter().map(|s| s.account_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_accounts_from_repository() {
        let connector = ReplayConnector::new(ReplaySession::with_messages([(
            "uid-9",
            "Subject: db\r\n\r\n",
        )]));
        let sink = Arc::new(RecordingSink::default());
        let poller = poller(&connector, sink.clone())
            .with_account_repository(Arc::new(StaticRepo(vec![account(42)])));

        poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(sink.delivered()[0].0, 42);
    }

    #[tokio::test]
    async fn test_per_account_interval() {
        let connector = ReplayConnector::new(ReplaySession::empty());
        let mut slow = account(1);
        slow.poll_interval_secs = Some(600);
        let poller = poller(&connector, Arc::new(RecordingSink::default()))
            .with_accounts(vec![slow]);

        poller.poll_once(&CancellationToken::new()).await.unwrap();
        let status = poller.status(1).await.unwrap();
        assert_eq!(
            status.next_poll_eta,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 10, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_run_returns_when_cancelled() {
        let connector = ReplayConnector::new(ReplaySession::empty());
        let poller = poller(&connector, Arc::new(RecordingSink::default()))
            .with_accounts(vec![account(1)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        poller.run(cancel).await;
        assert_eq!(connector.record().sessions_opened, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_cancelled() {
        let connector = ReplayConnector::new(ReplaySession::with_messages([(
            "uid-1",
            "Subject: a\r\n\r\n",
        )]));
        let sink = Arc::new(RecordingSink::default());
        let poller = Arc::new(poller(&connector, sink.clone()).with_accounts(vec![account(1)]));
        let cancel = CancellationToken::new();

        let task = {
            let poller = Arc::clone(&poller);
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(sink.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_poller_does_nothing() {
        let connector = ReplayConnector::new(ReplaySession::empty());
        let config = InboundConfig {
            enabled: false,
            ..Default::default()
        };
        let poller = MailPoller::new(
            Arc::new(connector.clone()),
            chain(),
            Arc::new(RecordingSink::default()),
            config,
        )
        .with_accounts(vec![account(1)]);

        poller.run(CancellationToken::new()).await;
        assert_eq!(connector.record().sessions_opened, 0);
    }
}
