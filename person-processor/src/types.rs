use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type Properties = Map<String, Value>;

pub const IDENTIFY_EVENT: &str = "$identify";
pub const CREATE_ALIAS_EVENT: &str = "$create_alias";
pub const MERGE_DANGEROUSLY_EVENT: &str = "$merge_dangerously";

/// Property holding the secondary identifier of alias-style events.
pub const ALIAS_PROPERTY: &str = "alias";
/// Legacy location of the anonymous id, used when the top-level field is absent.
pub const ANON_DISTINCT_ID_PROPERTY: &str = "$anon_distinct_id";

const SET_PROPERTY: &str = "$set";
const SET_ONCE_PROPERTY: &str = "$set_once";
const UNSET_PROPERTY: &str = "$unset";

/// Person property operations carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyOps {
    #[serde(default, alias = "$set")]
    pub set: Properties,
    #[serde(default, alias = "setOnce", alias = "$set_once")]
    pub set_once: Properties,
    #[serde(default, alias = "$unset")]
    pub unset: Vec<String>,
}

impl PropertyOps {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.set_once.is_empty() && self.unset.is_empty()
    }

    /// Overlay `other` on top of `self`. Keys present in `other` replace ours.
    fn overlay(mut self, other: &PropertyOps) -> Self {
        self.set
            .extend(other.set.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.set_once
            .extend(other.set_once.iter().map(|(k, v)| (k.clone(), v.clone())));
        for key in &other.unset {
            if !self.unset.contains(key) {
                self.unset.push(key.clone());
            }
        }
        self
    }
}

/// An analytics event as it arrives from the intake queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Events whose uuid does not parse are rejected at intake.
    pub uuid: Uuid,
    #[serde(alias = "name")]
    pub event: String,
    #[serde(with = "event_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "distinctId")]
    pub distinct_id: String,
    #[serde(
        default,
        alias = "anonymousDistinctId",
        skip_serializing_if = "Option::is_none"
    )]
    pub anon_distinct_id: Option<String>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default, alias = "propertyOps", skip_serializing_if = "PropertyOps::is_empty")]
    pub property_ops: PropertyOps,
    #[serde(
        default,
        alias = "groupAssociations",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub groups: HashMap<String, String>,
}

/// The identity shape of an event, which decides how it is resolved to a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind<'a> {
    Identify {
        distinct_id: &'a str,
        anon_distinct_id: &'a str,
    },
    Alias {
        primary: &'a str,
        alias: &'a str,
        dangerous: bool,
    },
    Anonymous {
        distinct_id: &'a str,
    },
}

impl Event {
    /// The anonymous id of this event, if it carries a usable one.
    ///
    /// Empty ids and ids equal to `distinct_id` are ignored.
    pub fn anonymous_id(&self) -> Option<&str> {
        let candidate = match self.anon_distinct_id.as_deref() {
            Some(id) => Some(id),
            None => self
                .properties
                .get(ANON_DISTINCT_ID_PROPERTY)
                .and_then(Value::as_str),
        };
        candidate.filter(|id| !id.is_empty() && *id != self.distinct_id)
    }

    fn alias_id(&self) -> Option<&str> {
        self.properties
            .get(ALIAS_PROPERTY)
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty() && *id != self.distinct_id)
    }

    pub fn kind(&self) -> EventKind<'_> {
        let is_alias = self.event == CREATE_ALIAS_EVENT || self.event == MERGE_DANGEROUSLY_EVENT;
        if is_alias {
            if let Some(alias) = self.alias_id() {
                return EventKind::Alias {
                    primary: &self.distinct_id,
                    alias,
                    dangerous: self.event == MERGE_DANGEROUSLY_EVENT,
                };
            }
        }

        match self.anonymous_id() {
            Some(anon_distinct_id) => EventKind::Identify {
                distinct_id: &self.distinct_id,
                anon_distinct_id,
            },
            None => EventKind::Anonymous {
                distinct_id: &self.distinct_id,
            },
        }
    }

    /// Property operations to apply for this event.
    ///
    /// `$set`, `$set_once` and `$unset` found in `properties` are combined with the
    /// explicit `property_ops`; explicit operations win on key collisions.
    pub fn effective_property_ops(&self) -> PropertyOps {
        let embedded = PropertyOps {
            set: object_property(&self.properties, SET_PROPERTY),
            set_once: object_property(&self.properties, SET_ONCE_PROPERTY),
            unset: unset_property(&self.properties),
        };
        embedded.overlay(&self.property_ops)
    }
}

fn object_property(properties: &Properties, key: &str) -> Properties {
    match properties.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Properties::new(),
    }
}

fn unset_property(properties: &Properties) -> Vec<String> {
    match properties.get(UNSET_PROPERTY) {
        Some(Value::Array(keys)) => keys
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        // Some SDKs send $unset as an object of keys to ignored values.
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Event timestamps arrive either as RFC 3339 strings or epoch milliseconds.
mod event_timestamp {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Millis(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| de::Error::custom(format!("timestamp {ms} is out of range"))),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| de::Error::custom(format!("invalid timestamp {text:?}: {e}"))),
        }
    }
}

/// The durable identity events are aggregated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Uuid,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
    /// Bumped by every write. Writers must present the version they read.
    pub version: i64,
    /// Set once the person has been linked by an identify or alias event.
    pub is_identified: bool,
    /// Survivor this person was merged into. A person with a redirect is a tombstone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_into: Option<Uuid>,
}

impl Person {
    pub fn is_live(&self) -> bool {
        self.merged_into.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    AbsorbedAlreadyIdentified,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::AbsorbedAlreadyIdentified => "absorbed_already_identified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    Completed,
    Blocked(BlockReason),
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeOutcome::Completed => write!(f, "completed"),
            MergeOutcome::Blocked(reason) => write!(f, "blocked:{}", reason.as_str()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseMergeOutcomeError(pub String);

impl fmt::Display for ParseMergeOutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid merge outcome", self.0)
    }
}

impl std::error::Error for ParseMergeOutcomeError {}

impl FromStr for MergeOutcome {
    type Err = ParseMergeOutcomeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(MergeOutcome::Completed),
            "blocked:absorbed_already_identified" => Ok(MergeOutcome::Blocked(
                BlockReason::AbsorbedAlreadyIdentified,
            )),
            invalid => Err(ParseMergeOutcomeError(invalid.to_owned())),
        }
    }
}

impl Serialize for MergeOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MergeOutcome {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Audit entry written for every merge attempt that reached the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub surviving_person_id: Uuid,
    pub absorbed_person_id: Uuid,
    pub merged_at: DateTime<Utc>,
    pub outcome: MergeOutcome,
}

impl MergeRecord {
    pub fn completed(surviving_person_id: Uuid, absorbed_person_id: Uuid) -> Self {
        Self {
            surviving_person_id,
            absorbed_person_id,
            merged_at: Utc::now(),
            outcome: MergeOutcome::Completed,
        }
    }

    pub fn blocked(surviving_person_id: Uuid, absorbed_person_id: Uuid, reason: BlockReason) -> Self {
        Self {
            surviving_person_id,
            absorbed_person_id,
            merged_at: Utc::now(),
            outcome: MergeOutcome::Blocked(reason),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == MergeOutcome::Completed
    }
}

/// What the sink receives: the event alongside the person it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedEvent {
    pub event: Event,
    pub person: Person,
}
