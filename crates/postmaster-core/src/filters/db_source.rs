//! Database-sourced postmaster rules
//!
//! Rule groups are read from storage on every message, so edits made by
//! administrators apply to the next message without a restart. Problems
//! with the rules themselves (unreachable store, broken patterns) are
//! logged and never abort the chain.

use super::annotations::Annotation;
use super::context::MessageContext;
use super::{Filter, FilterError};
use async_trait::async_trait;
use postmaster_storage::{DbPostmasterFilterRepository, FilterMatch, PostmasterFilter, PostmasterFilterRepository};
use regex::RegexBuilder;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of body bytes visible to `Body` clauses
pub const DEFAULT_BODY_MATCH_LIMIT: usize = 64 * 1024;

/// Compiled pattern size cap
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Source of rule groups, in evaluation order
#[async_trait]
pub trait PostmasterFilterStore: Send + Sync {
    async fn load_filters(&self) -> anyhow::Result<Vec<PostmasterFilter>>;
}

#[async_trait]
impl PostmasterFilterStore for DbPostmasterFilterRepository {
    async fn load_filters(&self) -> anyhow::Result<Vec<PostmasterFilter>> {
        Ok(self.list().await?)
    }
}

/// Applies rule groups from a [`PostmasterFilterStore`]
pub struct DbSourceFilter {
    store: Arc<dyn PostmasterFilterStore>,
    body_match_limit: usize,
}

impl DbSourceFilter {
    pub fn new(store: Arc<dyn PostmasterFilterStore>) -> Self {
        Self {
            store,
            body_match_limit: DEFAULT_BODY_MATCH_LIMIT,
        }
    }

    pub fn with_body_match_limit(mut self, limit: usize) -> Self {
        self.body_match_limit = limit;
        self
    }

    fn group_matches(&self, group: &PostmasterFilter, ctx: &MessageContext<'_>) -> bool {
        group
            .matches
            .iter()
            .all(|clause| self.clause_matches(group, clause, ctx))
    }

    fn clause_matches(
        &self,
        group: &PostmasterFilter,
        clause: &FilterMatch,
        ctx: &MessageContext<'_>,
    ) -> bool {
        let regex = match RegexBuilder::new(&clause.value)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
        {
            Ok(regex) => regex,
            Err(err) => {
                warn!(
                    filter = %group.name,
                    key = %clause.key,
                    error = %err,
                    "Invalid postmaster filter pattern, group skipped"
                );
                return false;
            }
        };

        let value = self.field_value(&clause.key, ctx);
        regex.is_match(&value) != clause.not
    }

    /// Header value, or the body prefix for the `Body` pseudo-field
    fn field_value<'c>(&self, key: &str, ctx: &'c MessageContext<'_>) -> Cow<'c, str> {
        let key = key.trim();
        if key.eq_ignore_ascii_case("body") {
            return ctx.parsed().body_prefix(self.body_match_limit);
        }
        Cow::Borrowed(ctx.parsed().get(key).unwrap_or(""))
    }
}

#[async_trait]
impl Filter for DbSourceFilter {
    fn id(&self) -> &str {
        "db_source"
    }

    async fn apply(&self, ctx: &mut MessageContext<'_>) -> Result<(), FilterError> {
        if ctx.message().raw.is_empty() {
            return Ok(());
        }

        let groups = match self.store.load_filters().await {
            Ok(groups) => groups,
            Err(err) => {
                warn!(error = %err, "Failed to load postmaster filters");
                return Ok(());
            }
        };

        for group in &groups {
            if !self.group_matches(group, ctx) {
                continue;
            }

            debug!(
                filter = %group.name,
                account_id = ctx.account().id,
                uid = %ctx.message().uid,
                "Postmaster filter matched"
            );

            for set in &group.sets {
                match Annotation::from_set_clause(&set.key, &set.value) {
                    Some(annotation) => ctx.annotations_mut().set(annotation),
                    None => debug!(filter = %group.name, key = %set.key, "Set clause ignored"),
                }
            }

            if group.stop {
                debug!(filter = %group.name, "Stop flag set, ending rule evaluation");
                break;
            }
        }

        Ok(())
    }
}
