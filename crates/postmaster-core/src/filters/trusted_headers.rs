//! Routing overrides embedded by trusted senders

use super::annotations::{parse_flag, parse_positive_id, Annotation};
use super::context::MessageContext;
use super::{Filter, FilterError};
use async_trait::async_trait;
use tracing::debug;

const QUEUE_ID_HEADERS: &[&str] = &["X-GoatFlow-QueueID", "X-OTRS-QueueID"];
const QUEUE_NAME_HEADERS: &[&str] = &[
    "X-GoatFlow-Queue",
    "X-GoatFlow-QueueName",
    "X-OTRS-Queue",
    "X-OTRS-QueueName",
];
const PRIORITY_ID_HEADERS: &[&str] = &["X-GoatFlow-PriorityID", "X-OTRS-PriorityID"];
const TITLE_HEADERS: &[&str] = &["X-GoatFlow-Title", "X-OTRS-Title"];
const CUSTOMER_ID_HEADERS: &[&str] = &["X-GoatFlow-CustomerID", "X-OTRS-CustomerID"];
const CUSTOMER_USER_HEADERS: &[&str] = &[
    "X-GoatFlow-CustomerUser",
    "X-GoatFlow-CustomerUserID",
    "X-OTRS-CustomerUser",
    "X-OTRS-CustomerUserID",
];
const IGNORE_HEADERS: &[&str] = &["X-GoatFlow-Ignore", "X-OTRS-Ignore"];

/// Copies `X-GoatFlow-*` (and legacy `X-OTRS-*`) headers into annotations
/// for accounts that allow it.
pub struct TrustedHeadersFilter {
    extra_headers: Vec<String>,
}

impl TrustedHeadersFilter {
    /// `extra_headers` are additional header names stored verbatim as
    /// trusted headers. Blank and duplicate names are dropped.
    pub fn new<I, S>(extra_headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = Vec::new();
        for name in extra_headers {
            let name = name.as_ref().trim();
            if name.is_empty() || names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                continue;
            }
            names.push(name.to_string());
        }
        Self {
            extra_headers: names,
        }
    }

    pub fn extra_headers(&self) -> &[String] {
        &self.extra_headers
    }
}

impl Default for TrustedHeadersFilter {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

#[async_trait]
impl Filter for TrustedHeadersFilter {
    fn id(&self) -> &str {
        "trusted_headers"
    }

    async fn apply(&self, ctx: &mut MessageContext<'_>) -> Result<(), FilterError> {
        if !ctx.account().allow_trusted_headers || ctx.message().raw.is_empty() {
            return Ok(());
        }

        let mut found = Vec::new();
        {
            let parsed = ctx.parsed();
            let text = |names: &[&str]| parsed.first_text_of(names).map(str::to_string);

            if let Some(id) = parsed.first_of(QUEUE_ID_HEADERS).and_then(parse_positive_id) {
                found.push(Annotation::QueueId(id));
            }
            if let Some(name) = text(QUEUE_NAME_HEADERS) {
                found.push(Annotation::QueueName(name));
            }
            if let Some(id) = parsed
                .first_of(PRIORITY_ID_HEADERS)
                .and_then(parse_positive_id)
            {
                found.push(Annotation::PriorityId(id));
            }
            if let Some(title) = text(TITLE_HEADERS) {
                found.push(Annotation::Title(title));
            }
            if let Some(customer) = text(CUSTOMER_ID_HEADERS) {
                found.push(Annotation::CustomerId(customer));
            }
            if let Some(user) = text(CUSTOMER_USER_HEADERS) {
                found.push(Annotation::CustomerUser(user));
            }
            if let Some(flag) = parsed.first_of(IGNORE_HEADERS).and_then(parse_flag) {
                found.push(Annotation::Ignore(flag));
            }

            for name in &self.extra_headers {
                if let Some(value) = parsed.get_text(name).filter(|value| !value.is_empty()) {
                    found.push(Annotation::TrustedHeader {
                        name: name.to_ascii_lowercase(),
                        value: value.to_string(),
                    });
                }
            }
        }

        if !found.is_empty() {
            debug!(
                account_id = ctx.account().id,
                uid = %ctx.message().uid,
                count = found.len(),
                "Applied trusted headers"
            );
        }
        for annotation in found {
            ctx.annotations_mut().set(annotation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchedMessage;
    use crate::filters::Annotations;
    use chrono::Utc;
    use postmaster_common::types::MailAccount;
    use pretty_assertions::assert_eq;

    fn account(trusted: bool) -> MailAccount {
        MailAccount {
            id: 1,
            account_type: "pop3".to_string(),
            host: "mail.example".to_string(),
            login: "agent".to_string(),
            trusted,
            allow_trusted_headers: trusted,
            active: true,
            ..Default::default()
        }
    }

    async fn run(filter: &TrustedHeadersFilter, trusted: bool, raw: &str) -> Annotations {
        let account = account(trusted);
        let message = FetchedMessage {
            uid: "uid-1".to_string(),
            seq: 1,
            remote_id: account.remote_id("uid-1"),
            raw: raw.as_bytes().to_vec(),
            received_at: Utc::now(),
        };
        let mut ctx = MessageContext::new(&account, &message);
        filter.apply(&mut ctx).await.unwrap();
        ctx.into_annotations()
    }

    #[tokio::test]
    async fn test_ignored_without_trust() {
        let raw = "From: a@example.com\r\nX-GoatFlow-PriorityID: 4\r\n\r\nbody";
        let annotations = run(&TrustedHeadersFilter::default(), false, raw).await;
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn test_priority_with_trust() {
        let raw = "From: a@example.com\r\nX-GoatFlow-PriorityID: 4\r\n\r\nbody";
        let annotations = run(&TrustedHeadersFilter::default(), true, raw).await;
        assert_eq!(annotations.priority_id(), Some(4));
        assert_eq!(annotations.len(), 1);
    }

    #[tokio::test]
    async fn test_goatflow_preferred_over_legacy() {
        let raw = "X-OTRS-Queue: Legacy\r\n\
                   X-GoatFlow-Queue: Current\r\n\
                   X-OTRS-QueueID: 9\r\n\
                   X-OTRS-CustomerUserID: jdoe\r\n\r\n";
        let annotations = run(&TrustedHeadersFilter::default(), true, raw).await;
        assert_eq!(annotations.queue_name(), Some("Current"));
        assert_eq!(annotations.queue_id(), Some(9));
        assert_eq!(annotations.customer_user(), Some("jdoe"));
    }

    #[tokio::test]
    async fn test_encoded_words_decoded() {
        let raw = "X-GoatFlow-Title: =?UTF-8?B?Q2Fmw6k=?=\r\n\
                   X-GoatFlow-CustomerID: ACME\r\n\r\n";
        let annotations = run(&TrustedHeadersFilter::default(), true, raw).await;
        assert_eq!(annotations.title(), Some("Café"));
        assert_eq!(annotations.customer_id(), Some("ACME"));
    }

    #[tokio::test]
    async fn test_invalid_values_dropped() {
        let raw = "X-GoatFlow-QueueID: 0\r\n\
                   X-GoatFlow-PriorityID: high\r\n\
                   X-GoatFlow-Ignore: maybe\r\n\r\n";
        let annotations = run(&TrustedHeadersFilter::default(), true, raw).await;
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn test_ignore_flag() {
        let raw = "X-OTRS-Ignore: yes\r\n\r\n";
        let annotations = run(&TrustedHeadersFilter::default(), true, raw).await;
        assert!(annotations.ignore());
    }

    #[tokio::test]
    async fn test_extra_headers() {
        let filter = TrustedHeadersFilter::new(["X-Custom-Team", "x-custom-team", " ", "X-Region"]);
        assert_eq!(filter.extra_headers().len(), 2);

        let raw = "X-Custom-Team: Billing\r\nX-Other: skipped\r\n\r\n";
        let annotations = run(&filter, true, raw).await;
        assert_eq!(annotations.trusted_header("x-custom-team"), Some("Billing"));
        assert_eq!(annotations.trusted_header("x-region"), None);
        assert_eq!(annotations.len(), 1);
    }

    #[tokio::test]
    async fn test_extra_header_encoded_words_decoded() {
        let filter = TrustedHeadersFilter::new(["X-Customer-Tier"]);
        let raw = "X-Customer-Tier: =?UTF-8?Q?VIP_Caf=C3=A9?=\r\n\r\n";
        let annotations = run(&filter, true, raw).await;
        assert_eq!(annotations.trusted_header("x-customer-tier"), Some("VIP Café"));
    }
}
