use std::collections::BTreeMap;

use chrono::{DateTime, Duration, FixedOffset, Offset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Payload key holding the memory text.
pub const KEY_DATA: &str = "data";
/// Payload key holding the content hash of `data` at last write.
pub const KEY_HASH: &str = "hash";
pub const KEY_CREATED_AT: &str = "created_at";
pub const KEY_UPDATED_AT: &str = "updated_at";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_AGENT_ID: &str = "agent_id";
pub const KEY_RUN_ID: &str = "run_id";

/// Keys the service manages itself; everything else in a payload is
/// caller metadata.
pub const RESERVED_KEYS: &[&str] = &[
    KEY_DATA,
    KEY_HASH,
    KEY_CREATED_AT,
    KEY_UPDATED_AT,
    KEY_USER_ID,
    KEY_AGENT_ID,
    KEY_RUN_ID,
];

/// Application-level payload value.
///
/// These five shapes are the only values a backend must round-trip.
/// Variant order matters for untagged deserialisation: integers must be
/// tried before floats so `3` stays an `Int`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
}

impl PayloadValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for PayloadValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for PayloadValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for PayloadValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<Vec<String>> for PayloadValue {
    fn from(v: Vec<String>) -> Self {
        Self::StringList(v)
    }
}

/// Ordered so serialised payloads (and test snapshots) are stable.
pub type Payload = BTreeMap<String, PayloadValue>;

/// The scoping identifiers every pipeline write must carry at least one of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ScopeIds {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().next().is_none()
    }

    /// `(key, value)` for every identifier that is set.
    pub fn pairs(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            (KEY_USER_ID, self.user_id.as_deref()),
            (KEY_AGENT_ID, self.agent_id.as_deref()),
            (KEY_RUN_ID, self.run_id.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
    }

    /// Write every set identifier into `payload`.
    pub fn apply_to(&self, payload: &mut Payload) {
        for (key, value) in self.pairs() {
            payload.insert(key.to_string(), PayloadValue::from(value));
        }
    }

    pub fn from_payload(payload: &Payload) -> Self {
        let pick = |key: &str| payload.get(key).and_then(PayloadValue::as_str).map(String::from);
        Self {
            user_id: pick(KEY_USER_ID),
            agent_id: pick(KEY_AGENT_ID),
            run_id: pick(KEY_RUN_ID),
        }
    }

    /// Stable label used as the per-scope lock key and in log lines.
    pub fn label(&self) -> String {
        self.pairs()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A persisted memory: opaque id, optional embedding, metadata payload.
///
/// `embedding` is `None` when a backend was asked not to return vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub payload: Payload,
}

impl MemoryRecord {
    fn text_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(PayloadValue::as_str)
    }

    pub fn data(&self) -> Option<&str> {
        self.text_field(KEY_DATA)
    }

    pub fn hash(&self) -> Option<&str> {
        self.text_field(KEY_HASH)
    }

    pub fn created_at(&self) -> Option<&str> {
        self.text_field(KEY_CREATED_AT)
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.text_field(KEY_UPDATED_AT)
    }
}

/// One similarity-search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Caller-facing view of a stored memory.
///
/// Scope ids and timestamps are lifted to the top level; every other
/// non-reserved payload key is returned under `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub memory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub scope: ScopeIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default, skip_serializing_if = "Payload::is_empty")]
    pub metadata: Payload,
}

impl MemoryItem {
    pub fn from_payload(id: &str, payload: &Payload, score: Option<f32>) -> Self {
        let text = |key: &str| payload.get(key).and_then(PayloadValue::as_str).map(String::from);
        let metadata = payload
            .iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            id: id.to_string(),
            memory: text(KEY_DATA).unwrap_or_default(),
            hash: text(KEY_HASH),
            created_at: text(KEY_CREATED_AT),
            updated_at: text(KEY_UPDATED_AT),
            scope: ScopeIds::from_payload(payload),
            score,
            metadata,
        }
    }

    pub fn from_record(record: &MemoryRecord) -> Self {
        Self::from_payload(&record.id, &record.payload, None)
    }

    pub fn from_scored(hit: &ScoredRecord) -> Self {
        Self::from_payload(&hit.id, &hit.payload, Some(hit.score))
    }
}

/// Mutation kinds recorded in the history journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HistoryEvent {
    Add,
    Update,
    Delete,
}

impl HistoryEvent {
    pub fn label(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// SHA-256 hex digest of `data`.
pub fn content_hash(data: &str) -> String {
    let mut h = Sha256::new();
    h.update(data.as_bytes());
    format!("{:x}", h.finalize())
}

/// Produces `created_at` / `updated_at` stamps in a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: FixedOffset,
}

impl Default for Clock {
    fn default() -> Self {
        Self::utc()
    }
}

impl Clock {
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    /// Offsets outside +/- 24h fall back to UTC.
    pub fn with_offset_minutes(minutes: i32) -> Self {
        match FixedOffset::east_opt(minutes.saturating_mul(60)) {
            Some(offset) => Self { offset },
            None => Self::utc(),
        }
    }

    pub fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }

    /// RFC 3339 stamp with microsecond precision.
    pub fn stamp(&self) -> String {
        format_stamp(self.now())
    }

    /// A stamp strictly later than `previous`, even when the wall clock has
    /// not advanced (or went backwards) since it was taken.
    pub fn stamp_after(&self, previous: Option<&str>) -> String {
        let now = self.now();
        let prev = previous.and_then(|p| DateTime::parse_from_rfc3339(p).ok());
        match prev {
            Some(prev) if now <= prev => format_stamp(prev + Duration::microseconds(1)),
            _ => format_stamp(now),
        }
    }
}

fn format_stamp(ts: DateTime<FixedOffset>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse a stamp back for ordering; unparseable stamps sort first.
pub fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Truncate `s` to at most `max_chars` characters without splitting a
/// UTF-8 code point.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_value_untagged_keeps_integers_integral() {
        let v: PayloadValue = serde_json::from_str("3").unwrap();
        assert_eq!(v, PayloadValue::Int(3));
        let v: PayloadValue = serde_json::from_str("3.5").unwrap();
        assert_eq!(v, PayloadValue::Float(3.5));
        let v: PayloadValue = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(v, PayloadValue::StringList(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn scope_ids_round_trip_through_payload() {
        let scope = ScopeIds {
            user_id: Some("u1".into()),
            agent_id: None,
            run_id: Some("r9".into()),
        };
        let mut payload = Payload::new();
        scope.apply_to(&mut payload);
        assert_eq!(payload.len(), 2);
        assert_eq!(ScopeIds::from_payload(&payload), scope);
        assert_eq!(scope.label(), "user_id=u1,run_id=r9");
        assert!(ScopeIds::default().is_empty());
    }

    #[test]
    fn memory_item_splits_reserved_keys_from_metadata() {
        let mut payload = Payload::new();
        payload.insert(KEY_DATA.into(), "Likes tea".into());
        payload.insert(KEY_HASH.into(), content_hash("Likes tea").into());
        payload.insert(KEY_USER_ID.into(), "u1".into());
        payload.insert("sentiment".into(), "positive".into());
        let item = MemoryItem::from_payload("m1", &payload, Some(0.93));
        assert_eq!(item.memory, "Likes tea");
        assert_eq!(item.scope.user_id.as_deref(), Some("u1"));
        assert_eq!(item.metadata.len(), 1);
        assert_eq!(item.metadata["sentiment"], PayloadValue::from("positive"));
        assert_eq!(item.score, Some(0.93));
    }

    #[test]
    fn stamp_after_is_strictly_later_than_future_previous() {
        let clock = Clock::utc();
        let future = "2999-01-01T00:00:00.000000+00:00";
        let next = clock.stamp_after(Some(future));
        assert!(parse_stamp(&next).unwrap() > parse_stamp(future).unwrap());
    }

    #[test]
    fn clock_applies_fixed_offset() {
        let clock = Clock::with_offset_minutes(330);
        assert!(clock.stamp().ends_with("+05:30"));
        let clock = Clock::with_offset_minutes(100_000);
        assert!(clock.stamp().ends_with("+00:00"));
    }

    #[test]
    fn history_event_serialises_uppercase() {
        assert_eq!(serde_json::to_string(&HistoryEvent::Delete).unwrap(), "\"DELETE\"");
    }

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("héllo", 2), "hé");
        assert_eq!(truncate_str("hi", 10), "hi");
    }
}
