//! Database models

use postmaster_common::types::MailAccount;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `f_type` value of a Match clause row
pub const FILTER_TYPE_MATCH: &str = "Match";

/// `f_type` value of a Set clause row
pub const FILTER_TYPE_SET: &str = "Set";

/// One row of the `postmaster_filter` table
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct PostmasterFilterRow {
    pub f_name: String,
    pub f_stop: Option<i16>,
    pub f_type: String,
    pub f_key: String,
    pub f_value: String,
    pub f_not: Option<i16>,
}

/// Header condition of a rule group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterMatch {
    /// Header name, or `Body` for the message body
    pub key: String,
    /// Regular expression tested against the field value
    pub value: String,
    /// Invert the result of the pattern test
    #[serde(default)]
    pub not: bool,
}

/// Annotation written when a rule group matches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub key: String,
    pub value: String,
}

/// A named rule group: all Match clauses must hold for the Set clauses to apply
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostmasterFilter {
    pub name: String,
    /// Matching this group ends evaluation for the message
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub matches: Vec<FilterMatch>,
    #[serde(default)]
    pub sets: Vec<FilterSet>,
}

fn is_set(value: Option<i16>) -> bool {
    value == Some(1)
}

/// Fold clause rows into rule groups.
///
/// Rows of one name are collected in the order they arrive, so callers
/// fetch them ordered by `f_type DESC, f_key`. The stop flag is taken from
/// the first row of each group. Groups come back sorted by name and rows
/// with an unknown `f_type` are dropped.
pub fn group_filter_rows<I>(rows: I) -> Vec<PostmasterFilter>
where
    I: IntoIterator<Item = PostmasterFilterRow>,
{
    let mut groups: Vec<PostmasterFilter> = Vec::new();

    for row in rows {
        let index = match groups.iter().position(|g| g.name == row.f_name) {
            Some(index) => index,
            None => {
                groups.push(PostmasterFilter {
                    name: row.f_name.clone(),
                    stop: is_set(row.f_stop),
                    matches: Vec::new(),
                    sets: Vec::new(),
                });
                groups.len() - 1
            }
        };
        let group = &mut groups[index];

        if row.f_type.eq_ignore_ascii_case(FILTER_TYPE_MATCH) {
            group.matches.push(FilterMatch {
                key: row.f_key,
                value: row.f_value,
                not: is_set(row.f_not),
            });
        } else if row.f_type.eq_ignore_ascii_case(FILTER_TYPE_SET) {
            group.sets.push(FilterSet {
                key: row.f_key,
                value: row.f_value,
            });
        }
    }

    groups.sort_by(|a, b| a.name.cmp(&b.name));
    groups
}

/// One row of the `mail_account` table
#[derive(Debug, Clone, FromRow)]
pub struct MailAccountRow {
    pub id: i32,
    pub login: String,
    pub pw: String,
    pub host: String,
    pub port: i32,
    pub account_type: String,
    pub queue_id: i32,
    pub trusted: i16,
    pub poll_interval_seconds: Option<i32>,
    pub valid_id: i16,
}

impl From<MailAccountRow> for MailAccount {
    fn from(row: MailAccountRow) -> Self {
        let trusted = row.trusted == 1;
        MailAccount {
            id: i64::from(row.id),
            account_type: row.account_type,
            host: row.host,
            port: u16::try_from(row.port).unwrap_or(0),
            login: row.login,
            password: row.pw,
            trusted,
            allow_trusted_headers: trusted,
            queue_id: (row.queue_id > 0).then_some(i64::from(row.queue_id)),
            poll_interval_secs: row
                .poll_interval_seconds
                .and_then(|s| u64::try_from(s).ok())
                .filter(|s| *s > 0),
            active: row.valid_id == 1,
        }
    }
}
