//! Attribute filters and their translation into a backend-neutral predicate.
//!
//! Every filter key becomes one conjunctive clause.  A list-valued filter
//! becomes a disjunction of per-element matches folded into that same
//! conjunction: `{user_id: "u1", tags: ["a", "b"]}` reads as
//! `user_id == "u1" AND (tags ~ "a" OR tags ~ "b")`.  Multi-value filters
//! therefore loosen matching on their own field while staying strict
//! across fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::{Payload, PayloadValue, ScopeIds};

/// Value side of one filter entry.
///
/// `AnyOf` comes first so a JSON array deserialises as a disjunction rather
/// than as a single list value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    AnyOf(Vec<PayloadValue>),
    One(PayloadValue),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        Self::One(PayloadValue::from(s))
    }
}

impl From<PayloadValue> for FilterValue {
    fn from(v: PayloadValue) -> Self {
        match v {
            // A string list given as a filter value means "any of these".
            PayloadValue::StringList(items) => {
                Self::AnyOf(items.into_iter().map(PayloadValue::String).collect())
            }
            other => Self::One(other),
        }
    }
}

/// Caller-supplied `field -> value(s)` filter map.
pub type Filters = BTreeMap<String, FilterValue>;

/// Filters asserting every set scope id.
pub fn scope_filters(scope: &ScopeIds) -> Filters {
    scope
        .pairs()
        .map(|(k, v)| (k.to_string(), FilterValue::from(v)))
        .collect()
}

/// One conjunct of a [`Predicate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Match { key: String, value: PayloadValue },
    AnyOf { key: String, values: Vec<PayloadValue> },
}

impl Clause {
    pub fn key(&self) -> &str {
        match self {
            Self::Match { key, .. } | Self::AnyOf { key, .. } => key,
        }
    }

    fn matches(&self, payload: &Payload) -> bool {
        let Some(field) = payload.get(self.key()) else {
            return false;
        };
        match self {
            Self::Match { value, .. } => field_matches(field, value),
            Self::AnyOf { values, .. } => values.iter().any(|v| field_matches(field, v)),
        }
    }
}

/// Backend-neutral boolean predicate: the conjunction of its clauses.
///
/// An empty predicate matches every payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub must: Vec<Clause>,
}

impl Predicate {
    pub fn translate(filters: &Filters) -> Self {
        let must = filters
            .iter()
            .map(|(key, value)| match value {
                FilterValue::One(v) => Clause::Match {
                    key: key.clone(),
                    value: v.clone(),
                },
                FilterValue::AnyOf(values) => Clause::AnyOf {
                    key: key.clone(),
                    values: values.clone(),
                },
            })
            .collect();
        Self { must }
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        self.must.iter().all(|clause| clause.matches(payload))
    }
}

/// Equality, except that a list-valued payload field matches when it
/// contains the wanted string (the keyword-match semantics vector stores
/// apply to array payloads).
fn field_matches(field: &PayloadValue, wanted: &PayloadValue) -> bool {
    match (field, wanted) {
        (PayloadValue::StringList(items), PayloadValue::String(s)) => items.iter().any(|i| i == s),
        (PayloadValue::Int(a), PayloadValue::Float(b)) | (PayloadValue::Float(b), PayloadValue::Int(a)) => {
            (*a as f64) == *b
        }
        _ => field == wanted,
    }
}
