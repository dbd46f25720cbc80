//! STATS output in both formats, plus the event-registry exporter.

use std::sync::Arc;
use std::time::Duration;

use gb_events::queue::EventQueue;
use gb_events::{create_queue, registry};
use gb_proto::message::{FIELD_FORMAT, Message};
use gb_proto::status;
use gb_server::{Dispatcher, RpcServer, ServerConfig};
use gb_test_utils::{FrameClient, MockBeanstalkd};

fn stats_config() -> ServerConfig {
    ServerConfig {
        service_id: Some("s1".to_owned()),
        volume: Some("/srv".to_owned()),
        namespace: "ns".to_owned(),
        ..ServerConfig::default()
    }
}

async fn start_server(config: ServerConfig) -> (String, RpcServer) {
    let server = RpcServer::new(config);
    let addr = server
        .bind_host("127.0.0.1:0", Arc::new(Dispatcher::new()))
        .await
        .expect("failed to bind server");
    (addr.to_string(), server)
}

#[tokio::test]
async fn prometheus_stats_carry_labels_and_counts() {
    let (addr, _server) = start_server(stats_config()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    for _ in 0..7 {
        client
            .send_message(&Message::request("REQ_PING"))
            .await
            .unwrap();
        let reply = client.recv_reply().await.unwrap();
        assert_eq!(reply.status(), Some(status::CODE_FINAL_OK));
    }

    let mut stats = Message::request("REQ_STATS");
    stats.set_field(FIELD_FORMAT, b"prometheus".to_vec());
    client.send_message(&stats).await.unwrap();
    let reply = client.recv_reply().await.unwrap();
    let body = String::from_utf8(reply.body().to_vec()).unwrap();

    assert!(
        body.contains(
            "meta_requests_total{service_id=\"s1\",volume=\"/srv\",namespace=\"ns\",method=\"REQ_PING\"} 7\n"
        ),
        "missing or wrong REQ_PING line in:\n{body}"
    );
    assert!(body.contains("meta_connections_active{"));
    // The per-method duration is seconds with 6 decimals.
    assert!(body.contains("meta_requests_duration_second_total{"));
    // Aggregates must not be exported.
    assert!(!body.contains("meta_requests_total{service_id=\"s1\",volume=\"/srv\",namespace=\"ns\"} "));
}

#[tokio::test]
async fn text_stats_list_seeded_counters_and_trailers() {
    let (addr, _server) = start_server(stats_config()).await;
    let mut client = FrameClient::connect(&addr).await.unwrap();

    client
        .send_message(&Message::request("REQ_STATS"))
        .await
        .unwrap();
    let reply = client.recv_reply().await.unwrap();
    let body = String::from_utf8(reply.body().to_vec()).unwrap();

    // Never-hit handlers are pre-seeded at bind time.
    assert!(body.contains("counter req.hits.REQ_VERSION 0\n"));
    assert!(body.contains("counter req.hits "));
    assert!(body.contains("config volume /srv\n"));
    assert!(body.contains("config service_id s1\n"));
    // Trailers come last, volume first.
    let trailer_pos = body.find("config volume").unwrap();
    assert!(body.find("config service_id").unwrap() > trailer_pos);
}

#[tokio::test]
async fn event_registry_exports_per_type_counters() {
    let broker = MockBeanstalkd::start().await;
    let conn = format!("beanstalk://{}", broker.addr());
    let queue: Arc<dyn EventQueue> = Arc::from(create_queue(&conn, "notif", false).unwrap());
    queue.start().unwrap();

    registry::register("storage.content.new", queue.clone());

    assert!(gb_events::send(
        queue.as_ref(),
        None,
        "{\"event\":\"storage.content.new\"}".to_owned()
    ));
    for _ in 0..250 {
        if queue.total_sent_events() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(queue.total_sent_events(), 1);

    let mut out = String::new();
    registry::to_prometheus("s1", "ns", &mut out);
    assert!(out.contains(
        "meta_event_sent_total{service_id=\"s1\",event_type=\"storage.content.new\",namespace=\"ns\"} 1\n"
    ));
    assert!(out.contains("meta_event_send_time_seconds_total{service_id=\"s1\","));

    registry::unregister("storage.content.new");
    assert_eq!(registry::active_registrations(), 0);
}
