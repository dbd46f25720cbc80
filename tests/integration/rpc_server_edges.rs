//! Edge-case suite: hostile framing, resource exhaustion, dispatch gates
//! and the no-reply safety net.

use std::sync::Arc;
use std::time::Duration;

use gb_proto::frame;
use gb_proto::message::{FIELD_MESSAGE, Message};
use gb_proto::status;
use gb_server::{
    Dispatcher, HandlerFuture, HandlerScope, ReplyContext, RequestDescriptor, RequestHandler,
    RpcServer, ServerConfig,
};
use gb_test_utils::FrameClient;

async fn start_server(
    config: ServerConfig,
    dispatcher: Dispatcher,
) -> (String, RpcServer, Arc<Dispatcher>) {
    let server = RpcServer::new(config);
    let dispatcher = Arc::new(dispatcher);
    let addr = server
        .bind_host("127.0.0.1:0", dispatcher.clone())
        .await
        .expect("failed to bind server");
    (addr.to_string(), server, dispatcher)
}

struct Work;

impl RequestHandler for Work {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            reply.send_reply(status::CODE_FINAL_OK, "done");
            true
        })
    }
}

/// Deliberately buggy: returns without producing a final reply.
struct Mute;

impl RequestHandler for Mute {
    fn handle<'a>(&'a self, reply: &'a mut ReplyContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            reply.subject("note:forgot to reply");
            true
        })
    }
}

// ---------------------------------------------------------------------------
// Hostile framing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn http_on_the_binary_port_gets_a_teapot() {
    let (addr, _server, _disp) = start_server(ServerConfig::default(), Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_raw(b"GET /path HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let bounced = client.read_until_close().await.unwrap();
    assert_eq!(bounced, b"HTTP/1.1 418 I'm a teapot\r\n");
}

#[tokio::test]
async fn oversized_request_closes_without_a_reply() {
    let config = ServerConfig {
        max_request_size: 64,
        ..ServerConfig::default()
    };
    let (addr, _server, _disp) = start_server(config, Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client.send_raw(&(65u32).to_be_bytes()).await.unwrap();
    assert!(client.closed_silently().await);
}

#[tokio::test]
async fn malformed_payload_closes_without_a_reply() {
    let (addr, _server, _disp) = start_server(ServerConfig::default(), Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_raw(&frame::frame_payload(b"this is not BER"))
        .await
        .unwrap();
    assert!(client.closed_silently().await);
}

#[tokio::test]
async fn missing_request_name_is_a_bad_request() {
    let (addr, _server, _disp) = start_server(ServerConfig::default(), Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client.send_message(&Message::request("")).await.unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_BAD_REQUEST));
    assert_eq!(
        reply.field_str(FIELD_MESSAGE),
        Some("Invalid/No request name")
    );
}

#[tokio::test]
async fn byte_by_byte_delivery_still_parses() {
    let (addr, _server, _disp) = start_server(ServerConfig::default(), Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    let framed = frame::frame_message(&Message::request("REQ_PING"));
    for byte in framed {
        client.send_raw(&[byte]).await.unwrap();
    }
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
}

// ---------------------------------------------------------------------------
// Resource exhaustion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_exhaustion_replies_unavailable_and_closes() {
    let config = ServerConfig {
        max_memory: 32,
        ..ServerConfig::default()
    };
    let (addr, _server, _disp) = start_server(config, Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_raw(&frame::frame_payload(&[0u8; 100]))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_UNAVAILABLE));
    assert_eq!(reply.field_str(FIELD_MESSAGE), Some("Memory exhausted"));
    assert!(client.closed_silently().await);
}

#[tokio::test]
async fn queued_too_long_is_refused_before_the_handler() {
    let config = ServerConfig {
        queue_max_delay_ms: 50,
        ..ServerConfig::default()
    };
    let (addr, server, _disp) = start_server(config, Dispatcher::new()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    // Trickle the frame so its arrival predates dispatch by >50ms.
    let framed = frame::frame_message(&Message::request("REQ_PING"));
    client.send_raw(&framed[..2]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.send_raw(&framed[2..]).await.unwrap();

    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_GATEWAY_TIMEOUT));
    assert!(
        reply
            .field_str(FIELD_MESSAGE)
            .unwrap()
            .starts_with("Queued for too long"),
        "unexpected message: {:?}",
        reply.field_str(FIELD_MESSAGE)
    );
    assert_eq!(server.shared().stats.get("counter req.hits.OVERLOADED"), 1);
}

// ---------------------------------------------------------------------------
// Dispatch gates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn io_errors_gate_normal_handlers_but_not_local_ones() {
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(vec![RequestDescriptor::new(
            "REQ_WORK",
            HandlerScope::Normal,
            Work,
        )])
        .unwrap();
    let (addr, server, dispatcher) = start_server(ServerConfig::default(), dispatcher).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    dispatcher.notify_io_status(false, "disk dead");

    client
        .send_message(&Message::request("REQ_WORK"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_UNAVAILABLE));
    assert_eq!(
        reply.field_str(FIELD_MESSAGE),
        Some("IO errors reported: disk dead")
    );
    assert_eq!(server.shared().stats.get("counter req.hits.IOERROR"), 1);

    // PING bypasses the gate.
    client
        .send_message(&Message::request("REQ_PING"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));

    // Recovery reopens the gate.
    dispatcher.notify_io_status(true, "all good");
    client
        .send_message(&Message::request("REQ_WORK"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
}

#[tokio::test]
async fn silent_handler_triggers_the_synthetic_reply() {
    let mut dispatcher = Dispatcher::new();
    dispatcher
        .register(vec![RequestDescriptor::new(
            "REQ_MUTE",
            HandlerScope::Normal,
            Mute,
        )])
        .unwrap();
    let (addr, _server, _disp) = start_server(ServerConfig::default(), dispatcher).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_MUTE"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    assert_eq!(reply.status(), Some(status::CODE_INTERNAL_ERROR));
    assert_eq!(reply.field_str(FIELD_MESSAGE), Some("BUG: no reply sent"));
    // The transport no longer trusts the stream after a buggy handler.
    assert!(client.closed_silently().await);
}
