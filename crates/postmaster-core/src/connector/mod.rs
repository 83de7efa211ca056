//! Mailbox connections
//!
//! [`MailboxConnection`] is the narrow capability the fetcher needs from a
//! mailbox session. [`Connector`] opens a fresh session per attempt. The
//! live implementation speaks POP3 over TCP or TLS; [`replay`] provides a
//! scripted stand-in with the same traits.

mod client;
mod command;
mod response;
mod stream;

pub mod replay;

pub use client::{Pop3Client, Pop3Connector};
pub use command::Pop3Command;
pub use response::Pop3Reply;
pub use stream::MailStream;

use async_trait::async_trait;
use postmaster_common::types::MailAccount;
use thiserror::Error;

/// A message as listed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    /// Session-scoped message number
    pub seq: u32,
    /// Server-assigned unique id, stable across sessions
    pub uid: String,
    /// Size in octets when the listing carries it
    pub size: Option<u64>,
}

/// POP3 session errors
#[derive(Debug, Error)]
pub enum Pop3Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out during {0}")]
    Timeout(String),

    #[error("tls error: {0}")]
    Tls(String),

    /// The server answered `-ERR`
    #[error("server replied -ERR {0}")]
    Negative(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An earlier failure left the session out of sync
    #[error("session unusable after {0}")]
    SessionBroken(String),
}

impl Pop3Error {
    /// Whether the server reported that the message no longer exists
    pub fn is_no_such_message(&self) -> bool {
        match self {
            Pop3Error::Negative(text) => {
                let text = text.to_ascii_lowercase();
                text.contains("no such message")
                    || text.contains("already deleted")
                    || text.contains("message not found")
                    || text.contains("invalid message number")
            }
            _ => false,
        }
    }

    /// Whether the stream can no longer be trusted to line up with replies
    pub fn breaks_session(&self) -> bool {
        !matches!(self, Pop3Error::Negative(_))
    }
}

/// An open mailbox session
#[async_trait]
pub trait MailboxConnection: Send {
    /// USER/PASS login
    async fn authenticate(&mut self, user: &str, password: &str) -> Result<(), Pop3Error>;

    /// UIDL listing
    async fn list_unique(&mut self) -> Result<Vec<MessageId>, Pop3Error>;

    /// LIST listing, the uid of each entry is its sequence number
    async fn list(&mut self) -> Result<Vec<MessageId>, Pop3Error>;

    /// RETR, returning the dot-unstuffed raw message
    async fn retrieve(&mut self, seq: u32) -> Result<Vec<u8>, Pop3Error>;

    /// DELE every sequence number in order
    async fn mark_deleted(&mut self, seqs: &[u32]) -> Result<(), Pop3Error>;

    /// QUIT, which commits deletions on the server
    async fn quit(&mut self) -> Result<(), Pop3Error>;
}

/// Opens mailbox sessions
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailboxConnection>, Pop3Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_such_message_classification() {
        assert!(Pop3Error::Negative("No such message".to_string()).is_no_such_message());
        assert!(Pop3Error::Negative("message 3 already deleted".to_string()).is_no_such_message());
        assert!(!Pop3Error::Negative("mailbox locked".to_string()).is_no_such_message());
        assert!(!Pop3Error::Protocol("no such message".to_string()).is_no_such_message());
    }

    #[test]
    fn test_only_negative_replies_keep_session() {
        assert!(!Pop3Error::Negative("locked".to_string()).breaks_session());
        assert!(Pop3Error::Timeout("RETR".to_string()).breaks_session());
        assert!(Pop3Error::Protocol("bad status".to_string()).breaks_session());
        assert!(Pop3Error::Io(std::io::ErrorKind::BrokenPipe.into()).breaks_session());
    }
}
