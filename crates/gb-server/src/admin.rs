//! Built-in admin handlers, registered on every dispatcher.
//!
//! All of them are local low-level: they touch no storage I/O, so they
//! keep answering while the node reports I/O errors.  That notably keeps
//! PING usable as a liveness probe on a degraded node.

use serde_json::Value;
use tracing::info;

use gb_proto::message::FIELD_FORMAT;
use gb_proto::status;

use crate::dispatch::{HandlerFuture, HandlerScope, RequestDescriptor, RequestHandler};
use crate::prometheus;
use crate::reply::{ReplyContext, StatusError};
use crate::reqlocal;

pub const REQ_PING: &str = "REQ_PING";
pub const REQ_STATS: &str = "REQ_STATS";
pub const REQ_VERSION: &str = "REQ_VERSION";
pub const REQ_HANDLERS: &str = "REQ_HANDLERS";
pub const REQ_GETCFG: &str = "REQ_GETCFG";
pub const REQ_SETCFG: &str = "REQ_SETCFG";
pub const REQ_REDIRECT: &str = "REQ_REDIRECT";
pub const REQ_LEAN: &str = "REQ_LEAN";

pub(crate) fn common_requests() -> Vec<RequestDescriptor> {
    use HandlerScope::LocalLowLevel;
    vec![
        RequestDescriptor::new(REQ_PING, LocalLowLevel, Ping),
        RequestDescriptor::new(REQ_STATS, LocalLowLevel, Stats),
        RequestDescriptor::new(REQ_VERSION, LocalLowLevel, Version),
        RequestDescriptor::new(REQ_HANDLERS, LocalLowLevel, ListHandlers),
        RequestDescriptor::new(REQ_GETCFG, LocalLowLevel, GetCfg),
        RequestDescriptor::new(REQ_SETCFG, LocalLowLevel, SetCfg),
        RequestDescriptor::new(REQ_REDIRECT, LocalLowLevel, Redirect),
        RequestDescriptor::new(REQ_LEAN, LocalLowLevel, Lean),
    ]
}

struct Ping;

impl RequestHandler for Ping {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            reply.no_access();
            reply.add_body(b"OK\r\n".to_vec());
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

struct Version;

impl RequestHandler for Version {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            reply.no_access();
            reply.add_body(env!("CARGO_PKG_VERSION").as_bytes().to_vec());
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

struct ListHandlers;

impl RequestHandler for ListHandlers {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let mut body = String::new();
            if let Some(dispatcher) = reply.server().dispatcher() {
                for name in dispatcher.handler_names() {
                    body.push_str(&name);
                    body.push('\n');
                }
            }
            reply.no_access();
            reply.add_body(body.into_bytes());
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

struct Stats;

impl RequestHandler for Stats {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let server = reply.server().clone();
            let samples = server.stats.snapshot();
            let format = reply.request().field_str(FIELD_FORMAT).unwrap_or("");

            let body = if format == "prometheus" {
                prometheus::stats_to_prometheus(
                    &samples,
                    server.service_id.as_deref(),
                    server.volume.as_deref().unwrap_or(""),
                    &server.namespace,
                )
            } else {
                let mut text = String::with_capacity(samples.len() * 32);
                for (key, value) in &samples {
                    text.push_str(key);
                    text.push(' ');
                    text.push_str(&value.to_string());
                    text.push('\n');
                }
                if let Some(volume) = &server.volume {
                    text.push_str("config volume ");
                    text.push_str(volume);
                    text.push('\n');
                }
                if let Some(service_id) = &server.service_id {
                    text.push_str("config service_id ");
                    text.push_str(service_id);
                    text.push('\n');
                }
                text
            };

            reply.no_access();
            reply.add_body(body.into_bytes());
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

struct GetCfg;

impl RequestHandler for GetCfg {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let dump = reply.server().vars.as_json();
            reply.add_body(dump.to_string().into_bytes());
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

struct SetCfg;

impl RequestHandler for SetCfg {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let parsed: Result<Value, _> = serde_json::from_slice(reply.request().body());
            let entries = match parsed {
                Err(e) => {
                    reply.send_error(0, StatusError::bad_request(e.to_string()));
                    return true;
                }
                Ok(Value::Object(map)) if !map.is_empty() => map,
                Ok(Value::Object(_)) => {
                    reply.send_error(0, StatusError::bad_request("Empty object argument"));
                    return true;
                }
                Ok(_) => {
                    reply.send_error(0, StatusError::bad_request("Object argument expected"));
                    return true;
                }
            };

            let mut outcome = serde_json::Map::new();
            for (name, value) in entries {
                let as_string = match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let applied = reply.server().vars.apply(&name, &as_string);
                outcome.insert(name, Value::Bool(applied));
            }

            reply.add_body(Value::Object(outcome).to_string().into_bytes());
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

struct Redirect;

impl RequestHandler for Redirect {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let endpoint = reply.server().first_endpoint();
            match endpoint {
                Some(endpoint) => reply.send_error(0, StatusError::redirect(endpoint)),
                None => reply.send_error(0, StatusError::internal("No bound endpoint")),
            }
            true
        })
    }
}

struct Lean;

impl RequestHandler for Lean {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            // Decode buffers free themselves with their reservation; there is
            // no allocator trim to ask for here, so this only reports.
            let reserved = reply.server().memory.used();
            info!(
                reserved_bytes = reserved,
                reqid = reqlocal::reqid().as_deref().unwrap_or("-"),
                "LEAN requested"
            );
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}
