//! Kafka-backed event queue, synchronous variant.
//!
//! Same producer plumbing as the asynchronous queue, but every send is
//! followed by a bounded flush so the caller learns whether the broker
//! actually took the event.  Slower, for event types where a silent loss
//! is worse than the latency.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseProducer, BaseRecord, Producer};
use tracing::{debug, warn};

use crate::error::EventsError;
use crate::kafka::{DeliveryTracker, KafkaStats, base_client_config, kafka_health};
use crate::queue::EventQueue;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct KafkaSyncQueue {
    stats: Arc<KafkaStats>,
    brokers: String,
    topic: String,
    producer: OnceLock<BaseProducer<DeliveryTracker>>,
}

impl KafkaSyncQueue {
    pub fn new(netloc: &str, topic: &str) -> KafkaSyncQueue {
        KafkaSyncQueue {
            stats: KafkaStats::new(),
            brokers: netloc.to_owned(),
            topic: topic.to_owned(),
            producer: OnceLock::new(),
        }
    }
}

impl EventQueue for KafkaSyncQueue {
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
            Ok(()) => self.stats.set_queue_full(false),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                self.stats.set_queue_full(true);
                return false;
            }
            Err((e, _)) => {
                warn!(topic = %self.topic, error = %e, "kafka enqueue failed");
                self.stats.note_error();
                return false;
            }
        }

        // Wait for the delivery callback before reporting success.
        let before = self.stats.sent_events();
        if let Err(e) = producer.flush(FLUSH_TIMEOUT) {
            warn!(topic = %self.topic, error = %e, "kafka flush failed");
            self.stats.note_error();
            return false;
        }
        self.stats.sent_events() > before
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stalled_until_started() {
        let q = KafkaSyncQueue::new("127.0.0.1:9092", "notif");
        assert!(q.is_stalled());
        assert!(!q.enqueue(None, "{}".to_owned()));
        let () = q.start().unwrap();
        assert!(!q.is_stalled());
    }
}
