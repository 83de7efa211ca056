//! Inbound filter chain
//!
//! A [`FilterChain`] runs [`Filter`]s in the order they were added. Each
//! filter inspects the message and records routing decisions in the
//! context's annotations.

pub mod annotations;
pub mod context;
pub mod db_source;
pub mod header;
pub mod trusted_headers;

pub use annotations::{Annotation, Annotations};
pub use context::MessageContext;
pub use db_source::{DbSourceFilter, PostmasterFilterStore};
pub use header::ParsedMessage;
pub use trusted_headers::TrustedHeadersFilter;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors that abort the chain
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter {filter} failed: {message}")]
    Failed { filter: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One step of the chain
#[async_trait]
pub trait Filter: Send + Sync {
    /// Identifier used in logs
    fn id(&self) -> &str;

    async fn apply(&self, ctx: &mut MessageContext<'_>) -> Result<(), FilterError>;
}

/// Ordered list of filters
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain
    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn ids(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Apply every filter in order, stopping at the first error
    pub async fn run(&self, ctx: &mut MessageContext<'_>) -> Result<(), FilterError> {
        for filter in &self.filters {
            debug!(filter = filter.id(), uid = %ctx.message().uid, "Applying filter");
            filter.apply(ctx).await?;
        }
        Ok(())
    }
}
