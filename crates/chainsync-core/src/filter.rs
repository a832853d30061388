//! Declarative filters — what to index, with stable cache identity.
//!
//! A filter's id is its kind tag concatenated with a canonical JSON rendering
//! (keys sorted, addresses lowercased, one-element topic lists collapsed).
//! The id is the primary key for every cache table, so two filters that are
//! equal under canonicalization must produce byte-identical ids.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::types::Log;

// ─── Criteria ────────────────────────────────────────────────────────────────

/// Address constraint of a log filter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AddressCriteria {
    /// No constraint. Elided from the canonical form.
    #[default]
    #[serde(skip)]
    Any,
    /// A single lowercase address.
    Single(String),
    /// A set of lowercase addresses.
    Many(Vec<String>),
    /// Addresses discovered at runtime from a parent event (factory pattern).
    Child(Box<ChildAddressFilter>),
}

impl AddressCriteria {
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Returns `true` iff the criteria is a child-address filter (an object,
    /// not a string or an array).
    pub fn is_child(&self) -> bool {
        matches!(self, Self::Child(_))
    }

    fn normalized(&self) -> Self {
        match self {
            Self::Any => Self::Any,
            Self::Single(a) => Self::Single(a.to_lowercase()),
            Self::Many(addrs) if addrs.len() == 1 => Self::Single(addrs[0].to_lowercase()),
            Self::Many(addrs) => Self::Many(addrs.iter().map(|a| a.to_lowercase()).collect()),
            Self::Child(child) => Self::Child(Box::new(child.normalized())),
        }
    }

    /// Whether `address` (lowercase) satisfies this criteria.
    ///
    /// A child criteria matches unconditionally here — the discovered address
    /// set is resolved separately against the store.
    pub fn matches(&self, address: &str) -> bool {
        match self {
            Self::Any | Self::Child(_) => true,
            Self::Single(a) => a == address,
            Self::Many(addrs) => addrs.iter().any(|a| a == address),
        }
    }
}

/// Per-position topic constraint of a log filter.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TopicCriteria {
    /// Wildcard — encoded as an explicit `null`.
    #[default]
    Any,
    Exact(String),
    OneOf(Vec<String>),
}

impl TopicCriteria {
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    fn normalized(&self) -> Self {
        match self {
            Self::Any => Self::Any,
            Self::Exact(t) => Self::Exact(t.to_lowercase()),
            Self::OneOf(ts) if ts.len() == 1 => Self::Exact(ts[0].to_lowercase()),
            Self::OneOf(ts) => Self::OneOf(ts.iter().map(|t| t.to_lowercase()).collect()),
        }
    }

    /// Whether `topic` (the log's topic at this position, if any) matches.
    pub fn matches(&self, topic: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(t) => topic == Some(t.as_str()),
            Self::OneOf(ts) => topic.is_some_and(|t| ts.iter().any(|c| c == t)),
        }
    }
}

impl Serialize for TopicCriteria {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Any => serializer.serialize_unit(),
            Self::Exact(t) => serializer.serialize_str(t),
            Self::OneOf(ts) => ts.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TopicCriteria {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Self::Any),
            Value::String(t) => Ok(Self::Exact(t)),
            Value::Array(ts) => ts
                .into_iter()
                .map(|t| match t {
                    Value::String(s) => Ok(s),
                    other => Err(D::Error::custom(format!("topic must be a string, got {other}"))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::OneOf),
            other => Err(D::Error::custom(format!("invalid topic criteria: {other}"))),
        }
    }
}

// ─── Child-address filters ───────────────────────────────────────────────────

/// Where in the parent log the 20-byte child address lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildLocation {
    /// `topicN`, N in 1..=3.
    Topic(u8),
    /// `offsetK` — K is the byte offset of the 32-byte data word holding the
    /// address (the address occupies the word's last 20 bytes).
    Offset(u32),
}

impl Serialize for ChildLocation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Topic(n) => serializer.serialize_str(&format!("topic{n}")),
            Self::Offset(k) => serializer.serialize_str(&format!("offset{k}")),
        }
    }
}

impl<'de> Deserialize<'de> for ChildLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if let Some(n) = s.strip_prefix("topic") {
            let n: u8 = n.parse().map_err(D::Error::custom)?;
            if !(1..=3).contains(&n) {
                return Err(D::Error::custom(format!("topic index out of range: {n}")));
            }
            return Ok(Self::Topic(n));
        }
        if let Some(k) = s.strip_prefix("offset") {
            return Ok(Self::Offset(k.parse().map_err(D::Error::custom)?));
        }
        Err(D::Error::custom(format!("invalid child address location: {s}")))
    }
}

/// A filter whose matches *produce addresses* rather than events: logs
/// matching `event_selector` under `address` yield one child address each,
/// read from `location`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildAddressFilter {
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "AddressCriteria::is_any")]
    pub address: AddressCriteria,
    /// First topic of the parent event.
    pub event_selector: String,
    pub child_address_location: ChildLocation,
}

impl ChildAddressFilter {
    fn normalized(&self) -> Self {
        Self {
            chain_id: self.chain_id,
            address: self.address.normalized(),
            event_selector: self.event_selector.to_lowercase(),
            child_address_location: self.child_address_location,
        }
    }

    /// Stable cache id: the `address` tag plus the canonical JSON form.
    pub fn id(&self) -> String {
        filter_id("address", &self.normalized())
    }
}

/// Read the child address out of a matched parent log.
///
/// Returns `None` when the log is too short for the configured location.
pub fn extract_child_address(log: &Log, location: ChildLocation) -> Option<String> {
    let word = match location {
        ChildLocation::Topic(n) => log.topic(n as usize)?.strip_prefix("0x")?.to_string(),
        ChildLocation::Offset(k) => {
            let hex = log.data.strip_prefix("0x")?;
            let start = k as usize * 2;
            hex.get(start..start + 64)?.to_string()
        }
    };
    // The address is the last 20 bytes of the 32-byte word.
    let address = word.get(word.len().checked_sub(40)?..)?;
    Some(format!("0x{}", address.to_lowercase()))
}

// ─── Filters ─────────────────────────────────────────────────────────────────

/// A log-emission filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub chain_id: u64,
    pub from_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_block: Option<u64>,
    #[serde(default, skip_serializing_if = "AddressCriteria::is_any")]
    pub address: AddressCriteria,
    #[serde(
        default,
        skip_serializing_if = "topics_all_any",
        serialize_with = "serialize_topics",
        deserialize_with = "deserialize_topics"
    )]
    pub topics: [TopicCriteria; 4],
}

fn topics_all_any(topics: &[TopicCriteria; 4]) -> bool {
    topics.iter().all(TopicCriteria::is_any)
}

/// Canonical form trims trailing wildcards; explicit interior `null`s stay.
fn serialize_topics<S: Serializer>(
    topics: &[TopicCriteria; 4],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let last = topics.iter().rposition(|t| !t.is_any()).map_or(0, |i| i + 1);
    topics[..last].serialize(serializer)
}

fn deserialize_topics<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<[TopicCriteria; 4], D::Error> {
    let list = Vec::<TopicCriteria>::deserialize(deserializer)?;
    if list.len() > 4 {
        return Err(D::Error::custom("more than four topic positions"));
    }
    let mut topics: [TopicCriteria; 4] = Default::default();
    for (slot, t) in topics.iter_mut().zip(list) {
        *slot = t;
    }
    Ok(topics)
}

/// A matched-block (interval tick) filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockFilter {
    pub chain_id: u64,
    /// Matches block numbers N with `(N − offset) mod interval == 0`.
    pub interval: u64,
    pub offset: u64,
    pub from_block: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_block: Option<u64>,
}

/// What to index: a tagged filter variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Filter {
    Log(LogFilter),
    Block(BlockFilter),
}

impl Filter {
    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Log(f) => f.chain_id,
            Self::Block(f) => f.chain_id,
        }
    }

    pub fn from_block(&self) -> u64 {
        match self {
            Self::Log(f) => f.from_block,
            Self::Block(f) => f.from_block,
        }
    }

    pub fn to_block(&self) -> Option<u64> {
        match self {
            Self::Log(f) => f.to_block,
            Self::Block(f) => f.to_block,
        }
    }

    fn normalized(&self) -> Self {
        match self {
            Self::Log(f) => Self::Log(LogFilter {
                chain_id: f.chain_id,
                from_block: f.from_block,
                to_block: f.to_block,
                address: f.address.normalized(),
                topics: [
                    f.topics[0].normalized(),
                    f.topics[1].normalized(),
                    f.topics[2].normalized(),
                    f.topics[3].normalized(),
                ],
            }),
            Self::Block(f) => Self::Block(f.clone()),
        }
    }

    /// Stable cache id: the `event` tag plus the canonical JSON form.
    pub fn id(&self) -> String {
        filter_id("event", &self.normalized())
    }
}

// ─── Matching ────────────────────────────────────────────────────────────────

/// Whether `log` satisfies the filter's address and topic constraints.
///
/// Block bounds are enforced by the caller (the materialization window).
pub fn matches_log(log: &Log, filter: &LogFilter) -> bool {
    if !filter.address.normalized().matches(&log.address.to_lowercase()) {
        return false;
    }
    filter
        .topics
        .iter()
        .enumerate()
        .all(|(i, criteria)| criteria.normalized().matches(log.topic(i)))
}

/// Whether block `number` is a tick of the block filter.
pub fn matches_block(number: u64, filter: &BlockFilter) -> bool {
    if number < filter.from_block || filter.to_block.is_some_and(|to| number > to) {
        return false;
    }
    let distance = number.abs_diff(filter.offset);
    distance % filter.interval == 0
}

// ─── Canonical JSON ──────────────────────────────────────────────────────────

/// Kind tag + canonical JSON of `value`.
pub fn filter_id<T: Serialize>(kind: &str, value: &T) -> String {
    let json = serde_json::to_value(value).unwrap_or(Value::Null);
    format!("{kind}{}", serde_json::to_string(&canonicalize(json)).unwrap_or_default())
}

/// Rebuild every object with keys in sorted order, recursively.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
