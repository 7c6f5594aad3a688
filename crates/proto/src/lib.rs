//! Expo wire vocabulary
//!
//! Types shared between the dispatcher, the transport and stations. Every
//! inbound request carries a JSON scope whose `type` field selects one of the
//! [`RequestKind`] variants; payloads exchanged after that are opaque JSON.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Opaque payload relayed between a client and a worker
pub type Payload = serde_json::Value;

/// Request types understood by the dispatcher, including the legacy names
pub const KNOWN_REQUEST_TYPES: &[&str] = &[
    "join",
    "staff.onduty",
    "leave",
    "staff.offduty",
    "order",
];

/// Worker identifier
///
/// Accepts JSON strings or integers; integers are keyed by their decimal text,
/// so `7` and `"7"` name the same worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for WorkerId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for WorkerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => WorkerId(text),
            Raw::Signed(n) => WorkerId(n.to_string()),
            Raw::Unsigned(n) => WorkerId(n.to_string()),
        })
    }
}

/// Capability tag describing which orders a worker can fulfil
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Speciality(String);

impl Speciality {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Speciality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Speciality {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Typed request scope, tagged on `type`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RequestKind {
    /// A worker comes on duty
    #[serde(rename = "join", alias = "staff.onduty")]
    Join {
        id: WorkerId,
        #[serde(alias = "specialities")]
        speciality: Vec<Speciality>,
    },

    /// A worker goes off duty
    #[serde(rename = "leave", alias = "staff.offduty")]
    Leave { id: WorkerId },

    /// A client places an order for one speciality
    #[serde(rename = "order")]
    Order { speciality: Speciality },
}

impl RequestKind {
    /// Whether `kind` is a request type the dispatcher knows about
    pub fn is_known_type(kind: &str) -> bool {
        KNOWN_REQUEST_TYPES.contains(&kind)
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Join { .. } => "join",
            RequestKind::Leave { .. } => "leave",
            RequestKind::Order { .. } => "order",
        }
    }

    /// Render the scope as a JSON value, as a transport would send it
    pub fn to_scope(&self) -> Payload {
        serde_json::to_value(self).unwrap_or(Payload::Null)
    }
}

/// Explicit failure response delivered to a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Stable machine-readable code, e.g. `no_available_worker`
    pub code: String,

    /// Human-readable detail
    pub message: String,
}

impl Rejection {
    pub const TYPE: &'static str = "rejection";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Encode as a payload: `{"type": "rejection", "code": ..., "message": ...}`
    pub fn to_payload(&self) -> Payload {
        serde_json::json!({
            "type": Self::TYPE,
            "code": self.code,
            "message": self.message,
        })
    }

    /// Decode a payload produced by [`Rejection::to_payload`]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        if payload.get("type")?.as_str()? != Self::TYPE {
            return None;
        }
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_accepts_legacy_name_and_integer_id() {
        let kind: RequestKind = serde_json::from_value(json!({
            "type": "staff.onduty",
            "id": 1,
            "speciality": ["grill", "fry"],
        }))
        .unwrap();

        assert_eq!(
            kind,
            RequestKind::Join {
                id: WorkerId::from(1u64),
                speciality: vec![Speciality::from("grill"), Speciality::from("fry")],
            }
        );
        assert_eq!(kind.name(), "join");
    }

    #[test]
    fn test_leave_and_order_scopes() {
        let leave: RequestKind =
            serde_json::from_value(json!({"type": "staff.offduty", "id": "chef-2"})).unwrap();
        assert_eq!(leave, RequestKind::Leave { id: WorkerId::from("chef-2") });

        let order: RequestKind =
            serde_json::from_value(json!({"type": "order", "speciality": "grill"})).unwrap();
        assert_eq!(order, RequestKind::Order { speciality: Speciality::from("grill") });
    }

    #[test]
    fn test_to_scope_uses_abstract_names() {
        let scope = RequestKind::Leave { id: WorkerId::from("a") }.to_scope();
        assert_eq!(scope, json!({"type": "leave", "id": "a"}));
    }

    #[test]
    fn test_known_types() {
        assert!(RequestKind::is_known_type("order"));
        assert!(RequestKind::is_known_type("staff.onduty"));
        assert!(!RequestKind::is_known_type("refund"));
    }

    #[test]
    fn test_rejection_payload() {
        let rejection = Rejection::new("no_available_worker", "nobody on grill");
        let payload = rejection.to_payload();

        assert_eq!(payload["type"], "rejection");
        assert_eq!(Rejection::from_payload(&payload), Some(rejection));
        assert_eq!(Rejection::from_payload(&json!("cooked-burger")), None);
    }
}
