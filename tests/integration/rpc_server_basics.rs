//! Happy-path suite for the framed RPC server.
//!
//! Covers the built-in admin handlers, custom handler registration, the
//! per-request deadline exposed to handlers, keepalive frames, and reply
//! ordering on a pipelined connection.

use std::sync::Arc;
use std::time::Instant;

use gb_proto::message::{FIELD_MESSAGE, FIELD_TIMEOUT, Message};
use gb_proto::status;
use gb_server::{
    Dispatcher, HandlerFuture, HandlerScope, ReplyContext, RequestDescriptor, RequestHandler,
    RpcServer, ServerConfig,
};
use gb_test_utils::FrameClient;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

async fn start_server(config: ServerConfig, dispatcher: Dispatcher) -> (String, RpcServer) {
    let server = RpcServer::new(config);
    let addr = server
        .bind_host("127.0.0.1:0", Arc::new(dispatcher))
        .await
        .expect("failed to bind server");
    (addr.to_string(), server)
}

async fn start_default() -> (String, RpcServer) {
    start_server(ServerConfig::default(), Dispatcher::new()).await
}

/// Echo handler: body back verbatim, remaining deadline budget in a header.
struct Echo;

impl RequestHandler for Echo {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let remaining = reply.deadline().saturating_duration_since(Instant::now());
            reply.add_header(
                "REMAINING_US",
                remaining.as_micros().to_string().into_bytes(),
            );
            let body = reply.request().body().to_vec();
            reply.add_body(body);
            reply.send_reply(status::CODE_FINAL_OK, "OK");
            true
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ping_replies_ok() {
    let (addr, _server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_PING"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
    assert_eq!(reply.body(), b"OK\r\n");
}

#[tokio::test]
async fn unknown_method_is_counted_and_refused() {
    let (addr, server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_DOES_NOT_EXIST"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_NOT_FOUND));
    assert_eq!(reply.field_str(FIELD_MESSAGE), Some("No handler found"));
    assert_eq!(
        server.shared().stats.get("counter req.hits.UNEXPECTED"),
        1
    );
}

#[tokio::test]
async fn version_and_handler_list() {
    let (addr, _server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_VERSION"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
    assert!(!reply.body().is_empty());

    client
        .send_message(&Message::request("REQ_HANDLERS"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    let listing = String::from_utf8(reply.body().to_vec()).unwrap();
    let names: Vec<&str> = listing.lines().collect();
    assert!(names.contains(&"REQ_PING"));
    assert!(names.contains(&"REQ_SETCFG"));
}

#[tokio::test]
async fn getcfg_and_setcfg_roundtrip() {
    let (addr, server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_GETCFG"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    let dump: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
    assert!(dump.get("server.queue.max_delay").is_some());

    let mut setcfg = Message::request("REQ_SETCFG");
    setcfg.set_body(
        serde_json::json!({
            "server.queue.max_delay": "250",
            "no.such.variable": "1",
        })
        .to_string()
        .into_bytes(),
    );
    client.send_message(&setcfg).await.unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
    let outcome: serde_json::Value = serde_json::from_slice(reply.body()).unwrap();
    assert_eq!(outcome["server.queue.max_delay"], true);
    assert_eq!(outcome["no.such.variable"], false);
    assert_eq!(
        server.shared().vars.queue_max_delay(),
        std::time::Duration::from_millis(250)
    );
}

#[tokio::test]
async fn setcfg_refuses_non_objects() {
    let (addr, _server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    let mut setcfg = Message::request("REQ_SETCFG");
    setcfg.set_body(b"[1,2,3]".to_vec());
    client.send_message(&setcfg).await.unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_BAD_REQUEST));
}

#[tokio::test]
async fn redirect_points_at_the_bound_endpoint() {
    let (addr, _server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_REDIRECT"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_REDIRECT));
    assert_eq!(reply.field_str(FIELD_MESSAGE), Some(addr.as_str()));
    assert_eq!(reply.body(), addr.as_bytes());
}

#[tokio::test]
async fn lean_replies_ok() {
    let (addr, _server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_LEAN"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
}

// ---------------------------------------------------------------------------
// Custom handlers and deadlines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn custom_handler_sees_body_and_deadline() {
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(vec![RequestDescriptor::new(
            "REQ_ECHO",
            HandlerScope::Normal,
            Echo,
        )])
        .unwrap();
    let (addr, _server) = start_server(ServerConfig::default(), dispatcher).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    // With a client-supplied TIMEOUT the deadline tightens to it.
    let mut req = Message::request("REQ_ECHO");
    req.set_id(b"req-1".to_vec());
    req.set_field(FIELD_TIMEOUT, b"2500".to_vec());
    req.set_body(b"payload bytes".to_vec());
    client.send_message(&req).await.unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.body(), b"payload bytes");
    let remaining: u64 = reply.field_str("REMAINING_US").unwrap().parse().unwrap();
    assert!(remaining <= 2_500_000, "deadline not tightened: {remaining}");

    // Without it the server cap (much larger) applies.
    let mut req = Message::request("REQ_ECHO");
    req.set_body(b"x".to_vec());
    client.send_message(&req).await.unwrap();
    let reply = client.recv_reply().await.unwrap();
    let remaining: u64 = reply.field_str("REMAINING_US").unwrap().parse().unwrap();
    assert!(remaining > 2_500_000, "server cap missing: {remaining}");
}

// ---------------------------------------------------------------------------
// Framing behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn keepalive_frames_are_skipped() {
    let (addr, _server) = start_default().await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client.send_raw(&[0, 0, 0, 0]).await.unwrap();
    client
        .send_message(&Message::request("REQ_PING"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
}

#[tokio::test]
async fn pipelined_requests_reply_in_order() {
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(vec![RequestDescriptor::new(
            "REQ_ECHO",
            HandlerScope::Normal,
            Echo,
        )])
        .unwrap();
    let (addr, _server) = start_server(ServerConfig::default(), dispatcher).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    for i in 0..5 {
        let mut req = Message::request("REQ_ECHO");
        req.set_body(format!("message-{i}").into_bytes());
        client.send_message(&req).await.unwrap();
    }
    for i in 0..5 {
        let reply = client.recv_reply().await.unwrap();
        assert_eq!(reply.body(), format!("message-{i}").as_bytes());
    }
}
