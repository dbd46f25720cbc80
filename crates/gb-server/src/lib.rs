// gb-server: Framed RPC transport for gridbus nodes.
//
// A server accepts length-prefixed BER messages over TCP, dispatches each
// to a registered handler under a per-request deadline and a process-wide
// memory budget, and emits one structured access-log line per finalized
// request.  Frame assembly and dispatch are strictly sequential per
// connection; replies go through a per-connection writer task so ordering
// is preserved without holding the socket across handler awaits.

pub mod access;
pub mod admin;
pub mod config;
pub mod dispatch;
pub mod frame_reader;
pub mod memory;
pub mod prometheus;
pub mod reply;
pub mod reqlocal;
pub mod server;
pub mod stats;
pub mod statsd;

pub use config::{ServerConfig, ServerVars};
pub use dispatch::{Dispatcher, HandlerFuture, HandlerScope, RequestDescriptor, RequestHandler};
pub use reply::{ReplyContext, StatusError};
pub use server::RpcServer;
