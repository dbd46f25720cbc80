//! The typed message exchanged over a frame.
//!
//! Field values are opaque byte strings; the well-known keys below carry
//! ASCII decimal or short ASCII tokens.  Replies reuse the same shape with
//! NAME fixed to `RSP` and the outcome in the STATUS/MESSAGE fields.

use std::collections::BTreeMap;

use crate::status;

/// Reply message NAME.
pub const NAME_REPLY: &str = "RSP";

pub const FIELD_STATUS: &str = "STATUS";
pub const FIELD_MESSAGE: &str = "MESSAGE";
pub const FIELD_TIMEOUT: &str = "TIMEOUT";
pub const FIELD_PERFDATA: &str = "PERFDATA";
pub const FIELD_FORMAT: &str = "FORMAT";
pub const FIELD_FLAGS: &str = "FLAGS";

/// One decoded request or reply.
///
/// `fields` is ordered so that encoding is deterministic, which keeps the
/// wire form stable for a given message and makes tests reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    name: String,
    id: Vec<u8>,
    fields: BTreeMap<String, Vec<u8>>,
    body: Vec<u8>,
}

impl Message {
    /// Build a request selecting the handler registered under `name`.
    pub fn request(name: &str) -> Message {
        Message {
            name: name.to_owned(),
            ..Message::default()
        }
    }

    /// Build a reply carrying a status code and a human-readable message.
    ///
    /// Network-class codes never reach a client verbatim; they are remapped
    /// to the proxy-error code here, at the last encoding step.
    pub fn reply(code: u32, message: &str) -> Message {
        let code = if status::is_network_error(code) {
            status::CODE_PROXY_ERROR
        } else {
            code
        };
        let mut msg = Message::request(NAME_REPLY);
        msg.set_field(FIELD_STATUS, code.to_string().into_bytes());
        if !message.is_empty() {
            msg.set_field(FIELD_MESSAGE, message.as_bytes().to_vec());
        }
        msg
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn set_id(&mut self, id: impl Into<Vec<u8>>) {
        self.id = id.into();
    }

    /// Correlation id rendered for logs: `-` when absent, verbatim when
    /// printable ASCII, hex otherwise.
    pub fn printable_id(&self) -> String {
        if self.id.is_empty() {
            return "-".to_owned();
        }
        if self.id.iter().all(|b| b.is_ascii_graphic()) {
            String::from_utf8_lossy(&self.id).into_owned()
        } else {
            hex::encode(&self.id)
        }
    }

    pub fn field(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    /// Field value as UTF-8, `None` when absent or not valid UTF-8.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Field value parsed as a decimal integer.
    pub fn field_i64(&self, key: &str) -> Option<i64> {
        self.field_str(key).and_then(|s| s.parse().ok())
    }

    pub fn set_field(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.fields.insert(key.to_owned(), value.into());
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// STATUS field of a reply, when present and well-formed.
    pub fn status(&self) -> Option<u32> {
        self.field_str(FIELD_STATUS).and_then(|s| s.parse().ok())
    }
}
