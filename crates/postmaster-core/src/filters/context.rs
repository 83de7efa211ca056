//! Per-message filter state

use super::annotations::Annotations;
use super::header::ParsedMessage;
use crate::fetcher::FetchedMessage;
use postmaster_common::types::MailAccount;

/// What a filter sees: the account and message read-only, plus the
/// annotations collected so far
pub struct MessageContext<'a> {
    account: &'a MailAccount,
    message: &'a FetchedMessage,
    parsed: ParsedMessage<'a>,
    annotations: Annotations,
}

impl<'a> MessageContext<'a> {
    pub fn new(account: &'a MailAccount, message: &'a FetchedMessage) -> Self {
        Self {
            account,
            message,
            parsed: ParsedMessage::parse(&message.raw),
            annotations: Annotations::new(),
        }
    }

    pub fn account(&self) -> &'a MailAccount {
        self.account
    }

    pub fn message(&self) -> &'a FetchedMessage {
        self.message
    }

    /// Headers and body of the raw message
    pub fn parsed(&self) -> &ParsedMessage<'a> {
        &self.parsed
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    pub fn into_annotations(self) -> Annotations {
        self.annotations
    }
}
