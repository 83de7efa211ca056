//! Common types for the postmaster

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a configured mail account
pub type AccountId = i64;

/// Identifier of a ticket queue
pub type QueueId = i64;

/// Default port for plain POP3
pub const POP3_PORT: u16 = 110;

/// Default port for POP3 wrapped in TLS
pub const POP3S_PORT: u16 = 995;

/// Mailbox retrieval protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailProtocol {
    /// POP3 over plain TCP
    Pop3,
    /// POP3 over an implicit TLS connection
    Pop3Tls,
}

impl MailProtocol {
    /// Parse an account type string.
    ///
    /// Accepts the spellings stored in the `mail_account` table:
    /// `pop3`, `pop3s`, `pop3_tls` and `pop3tls` (case-insensitive).
    pub fn parse(account_type: &str) -> Option<Self> {
        match account_type.trim().to_ascii_lowercase().as_str() {
            "pop3" => Some(MailProtocol::Pop3),
            "pop3s" | "pop3_tls" | "pop3tls" => Some(MailProtocol::Pop3Tls),
            _ => None,
        }
    }

    /// Whether the connection is wrapped in TLS from the start
    pub fn uses_tls(&self) -> bool {
        matches!(self, MailProtocol::Pop3Tls)
    }

    /// Port used when the account does not configure one
    pub fn default_port(&self) -> u16 {
        match self {
            MailProtocol::Pop3 => POP3_PORT,
            MailProtocol::Pop3Tls => POP3S_PORT,
        }
    }
}

impl fmt::Display for MailProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailProtocol::Pop3 => write!(f, "pop3"),
            MailProtocol::Pop3Tls => write!(f, "pop3s"),
        }
    }
}

/// A mailbox the poller pulls messages from.
///
/// Immutable for the duration of one poll.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct MailAccount {
    /// Account identifier
    #[serde(default)]
    pub id: AccountId,

    /// Protocol variant as stored ("pop3", "pop3s", ...)
    #[serde(rename = "type", alias = "account_type")]
    pub account_type: String,

    /// Server host name
    pub host: String,

    /// Server port, 0 selects the protocol default
    #[serde(default)]
    pub port: u16,

    /// Login name
    #[serde(default, alias = "username")]
    pub login: String,

    /// Password
    #[serde(default)]
    pub password: String,

    /// Whether mail from this account is considered trusted
    #[serde(default)]
    pub trusted: bool,

    /// Whether X-GoatFlow-* override headers embedded in messages are honored
    #[serde(default)]
    pub allow_trusted_headers: bool,

    /// Queue new tickets land in unless a filter overrides it
    #[serde(default)]
    pub queue_id: Option<QueueId>,

    /// Per-account poll interval in seconds (falls back to the global interval)
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,

    /// Inactive accounts are never polled
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl MailAccount {
    /// Resolve the protocol variant, `None` if unrecognized
    pub fn protocol(&self) -> Option<MailProtocol> {
        MailProtocol::parse(&self.account_type)
    }

    /// Port to dial, applying the protocol default when unset
    pub fn effective_port(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        self.protocol()
            .map(|p| p.default_port())
            .unwrap_or(POP3_PORT)
    }

    /// Build the key used to deduplicate a message across polls.
    ///
    /// `login@host:uid`, or `host:uid` when the account has no login.
    pub fn remote_id(&self, uid: &str) -> String {
        if self.login.is_empty() {
            format!("{}:{}", self.host, uid)
        } else {
            format!("{}@{}:{}", self.login, self.host, uid)
        }
    }
}

impl fmt::Debug for MailAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailAccount")
            .field("id", &self.id)
            .field("account_type", &self.account_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("trusted", &self.trusted)
            .field("allow_trusted_headers", &self.allow_trusted_headers)
            .field("queue_id", &self.queue_id)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("active", &self.active)
            .finish()
    }
}
