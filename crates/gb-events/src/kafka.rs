//! Kafka-backed event queue, asynchronous variant.
//!
//! Sends go straight into librdkafka's producer buffer and a background
//! poller drives delivery; the delivery callback feeds the counters.  The
//! queue stalls when the producer buffer fills (`QueueFull`), which is
//! also what the fallback drop sink keys on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::DeliveryResult;
use rdkafka::producer::{BaseRecord, ProducerContext, ThreadedProducer};
use tracing::{debug, warn};

use crate::error::EventsError;
use crate::queue::EventQueue;

const MESSAGE_TIMEOUT_MS: &str = "30000";
const ERROR_PENALTY_WINDOW: Duration = Duration::from_secs(60);

/// Counters and health inputs shared with the delivery callback.
pub(crate) struct KafkaStats {
    epoch: Instant,
    sent_events: AtomicU64,
    send_time_us: AtomicU64,
    queue_full: AtomicBool,
    last_error_us: AtomicU64,
}

impl KafkaStats {
    pub fn new() -> Arc<KafkaStats> {
        Arc::new(KafkaStats {
            epoch: Instant::now(),
            sent_events: AtomicU64::new(0),
            send_time_us: AtomicU64::new(0),
            queue_full: AtomicBool::new(false),
            last_error_us: AtomicU64::new(0),
        })
    }

    pub fn account(&self, elapsed: Duration) {
        self.sent_events.fetch_add(1, Ordering::Relaxed);
        self.send_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn note_error(&self) {
        let now = (self.epoch.elapsed().as_micros() as u64).max(1);
        self.last_error_us.store(now, Ordering::Relaxed);
    }

    pub fn set_queue_full(&self, full: bool) {
        self.queue_full.store(full, Ordering::Relaxed);
    }

    pub fn queue_full(&self) -> bool {
        self.queue_full.load(Ordering::Relaxed)
    }

    /// True when a delivery error happened within the penalty window.
    pub fn recent_error(&self) -> bool {
        let last = self.last_error_us.load(Ordering::Relaxed);
        last != 0
            && self.epoch.elapsed().as_micros() as u64 - last
                < ERROR_PENALTY_WINDOW.as_micros() as u64
    }

    pub fn sent_events(&self) -> u64 {
        self.sent_events.load(Ordering::Relaxed)
    }

    pub fn send_time(&self) -> u64 {
        self.send_time_us.load(Ordering::Relaxed)
    }
}

/// Producer context: the delivery callback is the only place librdkafka
/// tells us whether a message made it to the broker.
pub(crate) struct DeliveryTracker {
    pub stats: Arc<KafkaStats>,
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = Box<Instant>;

    fn delivery(&self, result: &DeliveryResult<'_>, enqueued_at: Self::DeliveryOpaque) {
        match result {
            Ok(_) => self.stats.account(enqueued_at.elapsed()),
            Err((e, _)) => {
                warn!(error = %e, "kafka delivery failed");
                self.stats.note_error();
            }
        }
    }
}

pub(crate) fn base_client_config(brokers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", MESSAGE_TIMEOUT_MS);
    config
}

/// Health from the shared inputs: stalled is dead, a recent delivery
/// error is degraded, anything else is fine.
pub(crate) fn kafka_health(stalled: bool, stats: &KafkaStats) -> i64 {
    if stalled {
        0
    } else if stats.recent_error() {
        50
    } else {
        100
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

pub struct KafkaQueue {
    stats: Arc<KafkaStats>,
    brokers: String,
    topic: String,
    producer: OnceLock<ThreadedProducer<DeliveryTracker>>,
}

impl KafkaQueue {
    /// `netloc` is the broker list (`host:port[,host:port]`); the topic
    /// doubles as the queue name.
    pub fn new(netloc: &str, topic: &str) -> KafkaQueue {
        KafkaQueue {
            stats: KafkaStats::new(),
            brokers: netloc.to_owned(),
            topic: topic.to_owned(),
            producer: OnceLock::new(),
        }
    }
}

impl EventQueue for KafkaQueue {
    fn queue_name(&self) -> &str {
        &self.topic
    }

    fn endpoint(&self) -> &str {
        &self.brokers
    }

    fn start(&self) -> Result<(), EventsError> {
        let producer = base_client_config(&self.brokers).create_with_context(DeliveryTracker {
            stats: self.stats.clone(),
        })?;
        self.producer
            .set(producer)
            .map_err(|_| EventsError::AlreadyStarted)
    }

    fn enqueue(&self, key: Option<&str>, payload: String) -> bool {
        let Some(producer) = self.producer.get() else {
            debug!(topic = %self.topic, "kafka queue not started, refusing event");
            return false;
        };

        let mut record: BaseRecord<'_, str, str, Box<Instant>> =
            BaseRecord::with_opaque_to(&self.topic, Box::new(Instant::now()))
                .payload(payload.as_str());
        if let Some(key) = key {
            record = record.key(key);
        }

        match producer.send(record) {
            Ok(()) => {
                self.stats.set_queue_full(false);
                true
            }
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                self.stats.set_queue_full(true);
                false
            }
            Err((e, _)) => {
                warn!(topic = %self.topic, error = %e, "kafka enqueue failed");
                self.stats.note_error();
                false
            }
        }
    }

    fn is_stalled(&self) -> bool {
        self.producer.get().is_none() || self.stats.queue_full()
    }

    fn health(&self) -> i64 {
        kafka_health(self.is_stalled(), &self.stats)
    }

    fn total_send_time(&self) -> u64 {
        self.stats.send_time()
    }

    fn total_sent_events(&self) -> u64 {
        self.stats.sent_events()
    }
}
