//! Ticket sink that only logs

use anyhow::Result;
use async_trait::async_trait;
use postmaster_common::types::MailAccount;
use postmaster_core::{Annotations, FetchedMessage, TicketSink};
use tracing::info;

/// Logs each routed message with its annotations as JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTicketSink;

impl LoggingTicketSink {
    pub fn render(annotations: &Annotations) -> Result<String> {
        Ok(serde_json::to_string(annotations)?)
    }
}

#[async_trait]
impl TicketSink for LoggingTicketSink {
    async fn deliver(
        &self,
        account: &MailAccount,
        message: &FetchedMessage,
        annotations: &Annotations,
    ) -> Result<()> {
        let rendered = Self::render(annotations)?;
        info!(
            account_id = account.id,
            queue_id = ?account.queue_id,
            uid = %message.uid,
            remote_id = %message.remote_id,
            size = message.raw.len(),
            annotations = %rendered,
            "Message routed"
        );
        Ok(())
    }
}
