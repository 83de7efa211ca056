//! Postmaster Core - mailbox fetching and routing filters
//!
//! This crate pulls messages from POP3 mailboxes, runs them through the
//! postmaster filter chain and hands the annotated result to the ticket
//! layer.

pub mod connector;
pub mod fetcher;
pub mod filters;
pub mod poller;

pub use connector::{Connector, MailboxConnection, MessageId, Pop3Connector, Pop3Error};
pub use fetcher::{FetchError, FetchOptions, FetchReport, FetchedMessage, MessageHandler, Pop3Fetcher};
pub use filters::{
    Annotation, Annotations, DbSourceFilter, Filter, FilterChain, FilterError, MessageContext,
    PostmasterFilterStore, TrustedHeadersFilter,
};
pub use poller::{CycleReport, MailPoller, PipelineHandler, PollState, PollStatus, TicketSink};
