//! Event envelope normalization.
//!
//! Inbound transport payloads arrive in several shapes: flat objects,
//! objects wrapping a `payload`/`data` member, identifiers as strings,
//! numbers or populated references. [`normalize`] turns any of them into an
//! [`EventEnvelope`] with a stable `event_id` and flat scope hints, or
//! rejects it when the kind's required fields are absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use super::model::RelatedIds;
use super::routing::RoutingTable;
use crate::{Error, Result};

/// Top-level keys that describe the envelope rather than the event.
const ENVELOPE_KEYS: &[&str] = &["eventId", "event_id", "occurredAt", "timestamp"];

/// Scope-relevant identifiers lifted out of the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chef_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_id: Option<String>,
}

impl ScopeHints {
    fn from_payload(payload: &Map<String, Value>) -> Self {
        Self {
            branch_id: hinted_id(payload, "branch"),
            department_id: hinted_id(payload, "department"),
            chef_id: hinted_id(payload, "chef"),
            order_id: hinted_id(payload, "order"),
            task_id: hinted_id(payload, "task"),
            return_id: hinted_id(payload, "return"),
        }
    }
}

/// A normalized inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub kind: String,
    pub payload: Map<String, Value>,
    pub occurred_at: DateTime<Utc>,
    pub scope_hints: ScopeHints,
    /// The event carried no id and one was minted locally.
    #[serde(default)]
    pub id_generated: bool,
}

impl EventEnvelope {
    /// Build an envelope directly from an id, kind and payload object.
    ///
    /// Non-object payloads become empty. Required fields are not checked.
    pub fn from_parts(event_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            event_id: event_id.into(),
            kind: kind.into(),
            scope_hints: ScopeHints::from_payload(&payload),
            payload,
            occurred_at: Utc::now(),
            id_generated: false,
        }
    }

    /// Identifier-valued payload field, coerced to text.
    pub fn id_field(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(coerce_id)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Departments of the order's line items (`items[*].department`).
    pub fn line_item_departments(&self) -> Vec<String> {
        let Some(items) = self.payload.get("items").and_then(Value::as_array) else {
            return Vec::new();
        };

        items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|item| {
                hinted_id(item, "department").or_else(|| {
                    item.get("product")
                        .and_then(Value::as_object)
                        .and_then(|product| hinted_id(product, "department"))
                })
            })
            .collect()
    }

    /// Related domain identifiers carried by the payload.
    pub fn related_ids(&self) -> RelatedIds {
        RelatedIds {
            order_id: self.scope_hints.order_id.clone(),
            task_id: self.scope_hints.task_id.clone(),
            return_id: self.scope_hints.return_id.clone(),
            sale_id: hinted_id(&self.payload, "sale"),
            branch_id: self.scope_hints.branch_id.clone(),
            chef_id: self.scope_hints.chef_id.clone(),
        }
    }

    /// Content fingerprint: sha256 over the kind and the canonical payload.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(&Value::Object(self.payload.clone())).as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Normalize a raw inbound payload for `kind`.
///
/// The kind is canonicalized through the table's aliases; kinds the table
/// does not know pass through unchanged and require no fields.
pub fn normalize(kind: &str, raw: Value, table: &RoutingTable) -> Result<EventEnvelope> {
    let kind = table
        .canonicalize_kind(kind)
        .map(str::to_string)
        .unwrap_or_else(|| kind.trim().to_string());

    let Value::Object(top) = raw else {
        warn!(kind = %kind, "Dropping event: payload is not an object");
        return Err(Error::malformed(kind, "payload is not an object"));
    };

    let payload = flatten_payload(&top);

    let event_id = ["eventId", "event_id"]
        .iter()
        .find_map(|key| top.get(*key).or_else(|| payload.get(*key)))
        .and_then(coerce_id);
    let id_generated = event_id.is_none();
    let event_id = event_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let occurred_at = ["occurredAt", "timestamp", "createdAt"]
        .iter()
        .find_map(|key| top.get(*key).or_else(|| payload.get(*key)))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let missing: Vec<&str> = table
        .required_fields(&kind)
        .iter()
        .copied()
        .filter(|field| !is_present(&payload, field))
        .collect();
    if !missing.is_empty() {
        let reason = format!("missing required fields: {}", missing.join(", "));
        warn!(kind = %kind, event_id = %event_id, "Dropping event: {}", reason);
        return Err(Error::malformed(kind, reason));
    }

    Ok(EventEnvelope {
        event_id,
        scope_hints: ScopeHints::from_payload(&payload),
        kind,
        payload,
        occurred_at,
        id_generated,
    })
}

/// Top-level fields minus envelope keys, overlaid with a nested
/// `payload`/`data` object when one is present.
fn flatten_payload(top: &Map<String, Value>) -> Map<String, Value> {
    let mut payload: Map<String, Value> = top
        .iter()
        .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str()))
        .filter(|(key, value)| !(matches!(key.as_str(), "payload" | "data") && value.is_object()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for nested in ["data", "payload"] {
        if let Some(Value::Object(inner)) = top.get(nested) {
            for (key, value) in inner {
                payload.insert(key.clone(), value.clone());
            }
        }
    }

    payload
}

/// A field is present when it is non-null and not an empty string. `<name>Id`
/// fields are also satisfied by a populated `<name>` reference.
fn is_present(payload: &Map<String, Value>, field: &str) -> bool {
    let direct = match payload.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    };
    direct
        || field
            .strip_suffix("Id")
            .and_then(|name| payload.get(name))
            .and_then(coerce_id)
            .is_some()
}

/// Coerce an identifier-valued field: strings as-is, numbers to their text,
/// populated references via `_id` / `id`.
fn coerce_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("_id").or_else(|| map.get("id")).and_then(coerce_id),
        _ => None,
    }
}

/// `<name>Id` first, then `<name>` itself.
fn hinted_id(map: &Map<String, Value>, name: &str) -> Option<String> {
    map.get(&format!("{}Id", name))
        .and_then(coerce_id)
        .or_else(|| map.get(name).and_then(coerce_id))
}

/// JSON text with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", Value::String(key.clone()), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}
