//! Routing annotations
//!
//! Filters record their decisions as [`Annotation`]s. Each variant owns a
//! stable string key, and [`Annotations`] keeps at most one value per key
//! (the last write wins). The serialized form is a flat map from key to
//! value, which is what the ticket layer consumes.

use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;

pub const QUEUE_NAME_OVERRIDE: &str = "postmaster.queue_name_override";
pub const QUEUE_ID_OVERRIDE: &str = "postmaster.queue_id_override";
pub const PRIORITY_NAME_OVERRIDE: &str = "postmaster.priority_name_override";
pub const PRIORITY_ID_OVERRIDE: &str = "postmaster.priority_id_override";
pub const TITLE_OVERRIDE: &str = "postmaster.title_override";
pub const CUSTOMER_ID_OVERRIDE: &str = "postmaster.customer_id_override";
pub const CUSTOMER_USER_OVERRIDE: &str = "postmaster.customer_user_override";
pub const IGNORE_MESSAGE: &str = "postmaster.ignore_message";
pub const STATE_OVERRIDE: &str = "postmaster.state_override";
pub const TYPE_OVERRIDE: &str = "postmaster.type_override";
pub const TRUSTED_HEADER_PREFIX: &str = "postmaster.trusted_header.";

/// Header prefixes recognized in Set clauses
const SET_PREFIXES: [&str; 3] = ["x-goatflow-", "x-gotrs-", "x-otrs-"];

/// A single routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    QueueName(String),
    QueueId(i64),
    PriorityName(String),
    PriorityId(i64),
    Title(String),
    CustomerId(String),
    CustomerUser(String),
    /// Acknowledge the message without creating a ticket
    Ignore(bool),
    State(String),
    Type(String),
    /// Any other header a rule or trusted sender supplied; `name` is lower-case
    TrustedHeader { name: String, value: String },
}

impl Annotation {
    /// Stable key used in the serialized annotation map
    pub fn key(&self) -> String {
        match self {
            Annotation::QueueName(_) => QUEUE_NAME_OVERRIDE.to_string(),
            Annotation::QueueId(_) => QUEUE_ID_OVERRIDE.to_string(),
            Annotation::PriorityName(_) => PRIORITY_NAME_OVERRIDE.to_string(),
            Annotation::PriorityId(_) => PRIORITY_ID_OVERRIDE.to_string(),
            Annotation::Title(_) => TITLE_OVERRIDE.to_string(),
            Annotation::CustomerId(_) => CUSTOMER_ID_OVERRIDE.to_string(),
            Annotation::CustomerUser(_) => CUSTOMER_USER_OVERRIDE.to_string(),
            Annotation::Ignore(_) => IGNORE_MESSAGE.to_string(),
            Annotation::State(_) => STATE_OVERRIDE.to_string(),
            Annotation::Type(_) => TYPE_OVERRIDE.to_string(),
            Annotation::TrustedHeader { name, .. } => trusted_header_key(name),
        }
    }

    /// Map a rule's Set clause onto an annotation.
    ///
    /// Keys are matched case-insensitively with an `X-GoatFlow-`,
    /// `X-GOTRS-` or `X-OTRS-` prefix. Unrecognized keys become
    /// [`Annotation::TrustedHeader`]. Returns `None` for empty keys or
    /// values and for values that do not parse (non-positive ids, unknown
    /// boolean spellings).
    pub fn from_set_clause(key: &str, value: &str) -> Option<Self> {
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            return None;
        }

        let lower = key.to_ascii_lowercase();
        let suffix = SET_PREFIXES
            .iter()
            .find_map(|prefix| lower.strip_prefix(prefix));

        let annotation = match suffix {
            Some("queue") | Some("queuename") => Annotation::QueueName(value.to_string()),
            Some("queueid") => Annotation::QueueId(parse_positive_id(value)?),
            Some("priority") => Annotation::PriorityName(value.to_string()),
            Some("priorityid") => Annotation::PriorityId(parse_positive_id(value)?),
            Some("title") => Annotation::Title(value.to_string()),
            Some("customerid") => Annotation::CustomerId(value.to_string()),
            Some("customeruser") | Some("customeruserid") => {
                Annotation::CustomerUser(value.to_string())
            }
            Some("ignore") => Annotation::Ignore(parse_flag(value)?),
            Some("state") => Annotation::State(value.to_string()),
            Some("type") => Annotation::Type(value.to_string()),
            _ => Annotation::TrustedHeader {
                name: key.to_ascii_lowercase(),
                value: value.to_string(),
            },
        };
        Some(annotation)
    }
}

impl Serialize for Annotation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Annotation::QueueId(id) | Annotation::PriorityId(id) => serializer.serialize_i64(*id),
            Annotation::Ignore(flag) => serializer.serialize_bool(*flag),
            Annotation::QueueName(v)
            | Annotation::PriorityName(v)
            | Annotation::Title(v)
            | Annotation::CustomerId(v)
            | Annotation::CustomerUser(v)
            | Annotation::State(v)
            | Annotation::Type(v)
            | Annotation::TrustedHeader { value: v, .. } => serializer.serialize_str(v),
        }
    }
}

/// Key under which a trusted header named `name` is stored
pub fn trusted_header_key(name: &str) -> String {
    format!("{}{}", TRUSTED_HEADER_PREFIX, name.trim().to_ascii_lowercase())
}

/// Parse a strictly positive numeric id
pub fn parse_positive_id(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Parse `1/true/yes/y` and `0/false/no/n`, case-insensitively
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

/// Annotations collected for one message
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct Annotations {
    entries: BTreeMap<String, Annotation>,
}

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `annotation`, replacing any earlier value for its key
    pub fn set(&mut self, annotation: Annotation) {
        self.entries.insert(annotation.key(), annotation);
    }

    pub fn get(&self, key: &str) -> Option<&Annotation> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Annotation> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Annotation)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn queue_name(&self) -> Option<&str> {
        match self.get(QUEUE_NAME_OVERRIDE) {
            Some(Annotation::QueueName(v)) => Some(v),
            _ => None,
        }
    }

    pub fn queue_id(&self) -> Option<i64> {
        match self.get(QUEUE_ID_OVERRIDE) {
            Some(Annotation::QueueId(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn priority_name(&self) -> Option<&str> {
        match self.get(PRIORITY_NAME_OVERRIDE) {
            Some(Annotation::PriorityName(v)) => Some(v),
            _ => None,
        }
    }

    pub fn priority_id(&self) -> Option<i64> {
        match self.get(PRIORITY_ID_OVERRIDE) {
            Some(Annotation::PriorityId(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn title(&self) -> Option<&str> {
        match self.get(TITLE_OVERRIDE) {
            Some(Annotation::Title(v)) => Some(v),
            _ => None,
        }
    }

    pub fn customer_id(&self) -> Option<&str> {
        match self.get(CUSTOMER_ID_OVERRIDE) {
            Some(Annotation::CustomerId(v)) => Some(v),
            _ => None,
        }
    }

    pub fn customer_user(&self) -> Option<&str> {
        match self.get(CUSTOMER_USER_OVERRIDE) {
            Some(Annotation::CustomerUser(v)) => Some(v),
            _ => None,
        }
    }

    /// Whether a filter asked for the message to be dropped
    pub fn ignore(&self) -> bool {
        matches!(self.get(IGNORE_MESSAGE), Some(Annotation::Ignore(true)))
    }

    pub fn state(&self) -> Option<&str> {
        match self.get(STATE_OVERRIDE) {
            Some(Annotation::State(v)) => Some(v),
            _ => None,
        }
    }

    pub fn ticket_type(&self) -> Option<&str> {
        match self.get(TYPE_OVERRIDE) {
            Some(Annotation::Type(v)) => Some(v),
            _ => None,
        }
    }

    pub fn trusted_header(&self, name: &str) -> Option<&str> {
        match self.get(&trusted_header_key(name)) {
            Some(Annotation::TrustedHeader { value, .. }) => Some(value),
            _ => None,
        }
    }
}
