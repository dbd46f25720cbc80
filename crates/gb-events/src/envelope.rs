//! JSON envelope for outbound events.
//!
//! Every event carries its type and an emission timestamp; the storage
//! target, the request id of the triggering RPC and the emitting agent
//! are attached when known.  Brokers and consumers treat the result as an
//! opaque string.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};

/// Coordinates of the storage entity an event is about.
#[derive(Debug, Clone, Default)]
pub struct EventTarget {
    pub namespace: Option<String>,
    pub account: Option<String>,
    pub user: Option<String>,
    pub path: Option<String>,
    pub content: Option<String>,
}

impl EventTarget {
    fn to_json(&self) -> Value {
        let mut url = Map::new();
        let fields = [
            ("ns", &self.namespace),
            ("account", &self.account),
            ("user", &self.user),
            ("path", &self.path),
            ("content", &self.content),
        ];
        for (name, value) in fields {
            if let Some(value) = value {
                url.insert(name.to_owned(), Value::String(value.clone()));
            }
        }
        Value::Object(url)
    }
}

pub struct EventBuilder {
    event_type: String,
    target: Option<EventTarget>,
    request_id: Option<String>,
    origin: Option<String>,
}

impl EventBuilder {
    pub fn new(event_type: &str) -> EventBuilder {
        EventBuilder {
            event_type: event_type.to_owned(),
            target: None,
            request_id: None,
            origin: None,
        }
    }

    pub fn target(mut self, target: EventTarget) -> EventBuilder {
        self.target = Some(target);
        self
    }

    pub fn request_id(mut self, reqid: &str) -> EventBuilder {
        if !reqid.is_empty() {
            self.request_id = Some(reqid.to_owned());
        }
        self
    }

    /// User agent of the emitting process.
    pub fn origin(mut self, origin: &str) -> EventBuilder {
        if !origin.is_empty() {
            self.origin = Some(origin.to_owned());
        }
        self
    }

    /// Serialize the envelope.
    pub fn build(self) -> String {
        let when = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut envelope = json!({
            "event": self.event_type,
            "when": when,
            "url": self.target.as_ref().map_or(Value::Null, EventTarget::to_json),
        });
        let map = envelope.as_object_mut().expect("envelope is an object");
        if let Some(reqid) = self.request_id {
            map.insert("request_id".to_owned(), Value::String(reqid));
        }
        if let Some(origin) = self.origin {
            map.insert("origin".to_owned(), Value::String(origin));
        }
        envelope.to_string()
    }
}
