//! Handler-facing reply façade.
//!
//! A [`ReplyContext`] collects headers, at most one body, free-form
//! subject tags and the access-log opt-out, and produces exactly one
//! final reply.  The transport checks the final-sent flag when the
//! handler returns and synthesizes an internal error if it was never set.
//!
//! Replies are handed as complete frames to the connection's writer task,
//! so a handler may emit an informational (1xx) reply mid-flight without
//! holding the socket.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use gb_proto::message::Message;
use gb_proto::{codec, frame, status};

use crate::access::{self, AccessRecord};
use crate::reqlocal;
use crate::server::ServerShared;

/// A client-visible error: a status code plus a human-readable message.
#[derive(Debug, Clone, Error)]
#[error("({code}) {message}")]
pub struct StatusError {
    pub code: u32,
    pub message: String,
}

impl StatusError {
    pub fn new(code: u32, message: impl Into<String>) -> StatusError {
        StatusError {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> StatusError {
        StatusError::new(status::CODE_BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> StatusError {
        StatusError::new(status::CODE_NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> StatusError {
        StatusError::new(status::CODE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> StatusError {
        StatusError::new(status::CODE_INTERNAL_ERROR, message)
    }

    /// Redirect to another endpoint; the endpoint travels in the message
    /// and in the reply body.
    pub fn redirect(endpoint: impl Into<String>) -> StatusError {
        StatusError::new(status::CODE_REDIRECT, endpoint)
    }
}

// ---------------------------------------------------------------------------
// ReplySink
// ---------------------------------------------------------------------------

/// Write side of one connection: encoded frames go through an unbounded
/// channel to the writer task, preserving order across requests.
#[derive(Clone)]
pub struct ReplySink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pub local_name: String,
    pub peer_name: String,
}

impl ReplySink {
    pub fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        local_name: String,
        peer_name: String,
    ) -> ReplySink {
        ReplySink {
            tx,
            local_name,
            peer_name,
        }
    }

    /// Queue one raw frame (or preformatted bytes) for writing.
    pub fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.tx.send(frame).is_ok()
    }
}

// ---------------------------------------------------------------------------
// ReplyContext
// ---------------------------------------------------------------------------

pub struct ReplyContext {
    server: Arc<ServerShared>,
    sink: ReplySink,
    request: Message,
    req_name: String,
    reqid: String,
    req_size: u64,
    arrival: Instant,
    parsed: Instant,
    deadline: Instant,
    headers: Vec<(String, Vec<u8>)>,
    body: Option<Vec<u8>>,
    subject: String,
    access_disabled: bool,
    final_sent: bool,
}

impl ReplyContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        server: Arc<ServerShared>,
        sink: ReplySink,
        request: Message,
        arrival: Instant,
        parsed: Instant,
        deadline: Instant,
        req_size: u64,
    ) -> ReplyContext {
        let req_name = request.name().to_owned();
        let reqid = request.printable_id();
        ReplyContext {
            server,
            sink,
            request,
            req_name,
            reqid,
            req_size,
            arrival,
            parsed,
            deadline,
            headers: Vec::new(),
            body: None,
            subject: String::new(),
            access_disabled: false,
            final_sent: false,
        }
    }

    pub fn request(&self) -> &Message {
        &self.request
    }

    pub fn req_name(&self) -> &str {
        &self.req_name
    }

    pub fn reqid(&self) -> &str {
        &self.reqid
    }

    /// Absolute time past which this request is considered expired.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn parsed(&self) -> Instant {
        self.parsed
    }

    pub fn final_sent(&self) -> bool {
        self.final_sent
    }

    pub(crate) fn server(&self) -> &Arc<ServerShared> {
        &self.server
    }

    /// Append one reply header.  Headers accumulate until the reply that
    /// carries them out.
    pub fn add_header(&mut self, name: &str, value: Vec<u8>) {
        debug_assert!(!self.final_sent, "header after final reply");
        self.headers.push((name.to_owned(), value));
    }

    /// Set the reply body.  At most one body per reply.
    pub fn add_body(&mut self, body: Vec<u8>) {
        debug_assert!(!self.final_sent, "body after final reply");
        debug_assert!(self.body.is_none(), "reply body already set");
        if self.body.is_some() {
            warn!(method = %self.req_name, "reply body already set, ignoring");
            return;
        }
        self.body = Some(body);
    }

    /// Append a `key:value` tag to the access-log subject.
    pub fn subject(&mut self, tag: &str) {
        if !self.subject.is_empty() {
            self.subject.push('\t');
        }
        self.subject.push_str(tag);
    }

    /// Ask for this request to be left out of the access log (subject to
    /// the global suppression flag and the status code).
    pub fn no_access(&mut self) {
        self.access_disabled = true;
    }

    /// Encode and queue one reply.  A final code (>= 200) finalizes the
    /// request: counters and the access log fire, later sends are bugs.
    pub fn send_reply(&mut self, code: u32, text: &str) {
        debug_assert!(!self.final_sent, "reply after final reply");
        if self.final_sent {
            warn!(method = %self.req_name, code, "reply after final reply, dropped");
            return;
        }

        let mut answer = Message::reply(code, text);
        if let Some(body) = self.body.take() {
            answer.set_body(body);
        }
        for (name, value) in self.headers.drain(..) {
            answer.set_field(&name, value);
        }

        let encode_start = Instant::now();
        let out = frame::frame_payload(&codec::encode(&answer));
        let encoded_at = Instant::now();
        let out_len = out.len() as u64;
        self.sink.send_frame(out);
        reqlocal::add_perfdata("resp_encode", encoded_at.duration_since(encode_start));
        reqlocal::add_perfdata("resp_send", encoded_at.elapsed());

        // The network-error remap happened while building the reply.
        let sent_code = answer.status().unwrap_or(code);
        if status::is_final(sent_code) {
            self.final_sent = true;
            access::emit(
                &self.server,
                &AccessRecord {
                    local: &self.sink.local_name,
                    peer: &self.sink.peer_name,
                    method: &self.req_name,
                    code: sent_code,
                    arrival: self.arrival,
                    parsed: self.parsed,
                    end: Instant::now(),
                    bytes_recvd: self.req_size,
                    bytes_sent: out_len,
                    reqid: &self.reqid,
                    db_wait: reqlocal::db_wait(),
                    perfdata: reqlocal::perfdata_snapshot(),
                    subject: &self.subject,
                    access_disabled: self.access_disabled,
                },
            );
        }
    }

    /// Send an error as the final reply.
    ///
    /// A non-zero `code` overrides the error's own code before the
    /// canonical remapping: network-class becomes proxy-error, OK/TEMP on
    /// an error path becomes internal-error.
    pub fn send_error(&mut self, code: u32, mut err: StatusError) {
        debug_assert!(!self.final_sent, "error after final reply");
        if status::is_redirect(err.code) {
            self.subject(&format!(
                "error_code_int:{}\terror:redirect to {}",
                err.code, err.message
            ));
        } else {
            self.subject(&format!("error_code_int:{}\terror:{}", err.code, err.message));
        }
        if code != 0 {
            err.code = code;
        }
        if status::is_network_error(err.code) {
            err.code = status::CODE_PROXY_ERROR;
        } else if status::is_ok(err.code) || status::is_temp(err.code) {
            err.code = status::CODE_INTERNAL_ERROR;
        }
        if status::is_redirect(err.code) && self.body.is_none() {
            self.body = Some(err.message.clone().into_bytes());
        }
        self.send_reply(err.code, &err.message);
    }
}
