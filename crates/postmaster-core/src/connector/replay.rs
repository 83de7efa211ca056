//! Scripted mailbox sessions
//!
//! [`ReplayConnector`] hands out [`ReplayConnection`]s that answer from a
//! [`ReplaySession`] script and write every side effect to a shared
//! [`ReplayRecord`]. Each `connect` consumes the next script; once the
//! scripts run out the last one is reused.

use super::{Connector, MailboxConnection, MessageId, Pop3Error};
use async_trait::async_trait;
use postmaster_common::types::MailAccount;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Failure a script can inject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedError {
    /// `-ERR <text>` from the server
    Negative(String),
    /// Broken transport
    Io(String),
    /// Command timed out
    Timeout,
}

impl ScriptedError {
    pub fn negative(text: impl Into<String>) -> Self {
        ScriptedError::Negative(text.into())
    }

    pub fn io(text: impl Into<String>) -> Self {
        ScriptedError::Io(text.into())
    }

    fn to_error(&self, operation: &str) -> Pop3Error {
        match self {
            ScriptedError::Negative(text) => Pop3Error::Negative(text.clone()),
            ScriptedError::Io(text) => {
                Pop3Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, text.clone()))
            }
            ScriptedError::Timeout => Pop3Error::Timeout(operation.to_string()),
        }
    }
}

/// Script for one session
#[derive(Debug, Clone, Default)]
pub struct ReplaySession {
    messages: Vec<(String, Vec<u8>)>,
    connect_error: Option<ScriptedError>,
    auth_error: Option<ScriptedError>,
    uidl_error: Option<ScriptedError>,
    list_error: Option<ScriptedError>,
    retrieve_errors: HashMap<u32, ScriptedError>,
    delete_error: Option<ScriptedError>,
    quit_error: Option<ScriptedError>,
    retrieve_delay: Option<Duration>,
}

impl ReplaySession {
    /// Mailbox holding `messages` as `(uid, raw)` pairs, numbered from 1
    pub fn with_messages<I, U, B>(messages: I) -> Self
    where
        I: IntoIterator<Item = (U, B)>,
        U: Into<String>,
        B: Into<Vec<u8>>,
    {
        Self {
            messages: messages
                .into_iter()
                .map(|(uid, raw)| (uid.into(), raw.into()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fail_connect(mut self, error: ScriptedError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn fail_auth(mut self, error: ScriptedError) -> Self {
        self.auth_error = Some(error);
        self
    }

    pub fn fail_uidl(mut self, error: ScriptedError) -> Self {
        self.uidl_error = Some(error);
        self
    }

    pub fn fail_list(mut self, error: ScriptedError) -> Self {
        self.list_error = Some(error);
        self
    }

    pub fn fail_retrieve(mut self, seq: u32, error: ScriptedError) -> Self {
        self.retrieve_errors.insert(seq, error);
        self
    }

    pub fn fail_delete(mut self, error: ScriptedError) -> Self {
        self.delete_error = Some(error);
        self
    }

    pub fn fail_quit(mut self, error: ScriptedError) -> Self {
        self.quit_error = Some(error);
        self
    }

    /// Make every RETR take `delay` before answering
    pub fn slow_retrieve(mut self, delay: Duration) -> Self {
        self.retrieve_delay = Some(delay);
        self
    }

    fn listing(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .enumerate()
            .map(|(idx, (uid, raw))| MessageId {
                seq: idx as u32 + 1,
                uid: uid.clone(),
                size: Some(raw.len() as u64),
            })
            .collect()
    }
}

/// Side effects observed across all sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayRecord {
    pub sessions_opened: usize,
    pub logins: Vec<String>,
    pub retrieved: Vec<u32>,
    /// Sequence numbers accepted by DELE, in order
    pub deleted: Vec<u32>,
    pub quits: usize,
}

/// Connector answering from scripts
#[derive(Clone)]
pub struct ReplayConnector {
    scripts: Arc<Mutex<Vec<ReplaySession>>>,
    record: Arc<Mutex<ReplayRecord>>,
}

impl ReplayConnector {
    /// Every session follows the same script
    pub fn new(session: ReplaySession) -> Self {
        Self::sequence(vec![session])
    }

    /// Sessions follow `sessions` in order, repeating the last one
    pub fn sequence(sessions: Vec<ReplaySession>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(sessions)),
            record: Arc::new(Mutex::new(ReplayRecord::default())),
        }
    }

    /// Snapshot of what happened so far
    pub fn record(&self) -> ReplayRecord {
        lock(&self.record).clone()
    }

    fn next_script(&self) -> ReplaySession {
        let mut scripts = lock(&self.scripts);
        if scripts.len() > 1 {
            scripts.remove(0)
        } else {
            scripts.first().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl Connector for ReplayConnector {
    async fn connect(&self, _account: &MailAccount) -> Result<Box<dyn MailboxConnection>, Pop3Error> {
        let script = self.next_script();
        if let Some(error) = &script.connect_error {
            return Err(error.to_error("connect"));
        }

        lock(&self.record).sessions_opened += 1;
        Ok(Box::new(ReplayConnection {
            script,
            record: Arc::clone(&self.record),
            broken: None,
        }))
    }
}

/// One scripted session
///
/// Like the live client, a transport error or timeout breaks the session
/// and later commands fail with [`Pop3Error::SessionBroken`].
pub struct ReplayConnection {
    script: ReplaySession,
    record: Arc<Mutex<ReplayRecord>>,
    broken: Option<String>,
}

impl ReplayConnection {
    fn ensure_open(&self) -> Result<(), Pop3Error> {
        match &self.broken {
            Some(reason) => Err(Pop3Error::SessionBroken(reason.clone())),
            None => Ok(()),
        }
    }

    fn scripted(&mut self, error: Option<ScriptedError>, operation: &str) -> Result<(), Pop3Error> {
        let Some(error) = error else {
            return Ok(());
        };
        let err = error.to_error(operation);
        if err.breaks_session() {
            self.broken = Some(format!("{} failed: {}", operation, err));
        }
        Err(err)
    }
}

#[async_trait]
impl MailboxConnection for ReplayConnection {
    async fn authenticate(&mut self, user: &str, _password: &str) -> Result<(), Pop3Error> {
        self.ensure_open()?;
        let error = self.script.auth_error.clone();
        self.scripted(error, "PASS")?;
        lock(&self.record).logins.push(user.to_string());
        Ok(())
    }

    async fn list_unique(&mut self) -> Result<Vec<MessageId>, Pop3Error> {
        self.ensure_open()?;
        let error = self.script.uidl_error.clone();
        self.scripted(error, "UIDL")?;
        Ok(self.script.listing())
    }

    async fn list(&mut self) -> Result<Vec<MessageId>, Pop3Error> {
        self.ensure_open()?;
        let error = self.script.list_error.clone();
        self.scripted(error, "LIST")?;
        Ok(self
            .script
            .listing()
            .into_iter()
            .map(|id| MessageId {
                uid: id.seq.to_string(),
                ..id
            })
            .collect())
    }

    async fn retrieve(&mut self, seq: u32) -> Result<Vec<u8>, Pop3Error> {
        self.ensure_open()?;
        if let Some(delay) = self.script.retrieve_delay {
            tokio::time::sleep(delay).await;
        }
        let error = self.script.retrieve_errors.get(&seq).cloned();
        self.scripted(error, "RETR")?;

        let raw = self
            .script
            .messages
            .get((seq as usize).wrapping_sub(1))
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| Pop3Error::Negative("No such message".to_string()))?;

        lock(&self.record).retrieved.push(seq);
        Ok(raw)
    }

    async fn mark_deleted(&mut self, seqs: &[u32]) -> Result<(), Pop3Error> {
        self.ensure_open()?;
        let error = self.script.delete_error.clone();
        self.scripted(error, "DELE")?;
        lock(&self.record).deleted.extend_from_slice(seqs);
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), Pop3Error> {
        self.ensure_open()?;
        lock(&self.record).quits += 1;
        let error = self.script.quit_error.clone();
        self.scripted(error, "QUIT")
    }
}

// A panicking test thread must not hide the record from the others.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
