//! Repository layer for data access

pub mod mail_accounts;
pub mod postmaster_filters;

pub use mail_accounts::{DbMailAccountRepository, MailAccountRepository};
pub use postmaster_filters::{DbPostmasterFilterRepository, PostmasterFilterRepository};
