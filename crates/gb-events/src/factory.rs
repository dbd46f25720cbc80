//! Queue construction from a connection string.
//!
//! `beanstalk://host:port` and `kafka://host:port` select a backend; a
//! comma separates shards, each recursively constructed and wrapped in a
//! fanout.  `sync` picks the synchronous kafka variant; beanstalkd
//! ignores it.

use crate::beanstalkd::BeanstalkdQueue;
use crate::error::EventsError;
use crate::fanout::FanoutQueue;
use crate::kafka::KafkaQueue;
use crate::kafka_sync::KafkaSyncQueue;
use crate::queue::EventQueue;

const BEANSTALKD_PREFIX: &str = "beanstalk://";
const KAFKA_PREFIX: &str = "kafka://";
const SHARD_SEPARATOR: char = ',';

/// Build (but do not start) the queue described by `conn`.
///
/// `tube` names the beanstalkd tube or the kafka topic.
pub fn create_queue(
    conn: &str,
    tube: &str,
    sync: bool,
) -> Result<Box<dyn EventQueue>, EventsError> {
    if conn.is_empty() {
        return Err(EventsError::EmptyConnectionString);
    }
    if conn.contains(SHARD_SEPARATOR) {
        return create_fanout(conn, tube, sync);
    }

    if let Some(netloc) = conn.strip_prefix(BEANSTALKD_PREFIX) {
        Ok(Box::new(BeanstalkdQueue::new(netloc, tube)))
    } else if let Some(netloc) = conn.strip_prefix(KAFKA_PREFIX) {
        if sync {
            Ok(Box::new(KafkaSyncQueue::new(netloc, tube)))
        } else {
            Ok(Box::new(KafkaQueue::new(netloc, tube)))
        }
    } else {
        Err(EventsError::UnknownScheme(conn.to_owned()))
    }
}

fn create_fanout(conn: &str, tube: &str, sync: bool) -> Result<Box<dyn EventQueue>, EventsError> {
    let mut children: Vec<Box<dyn EventQueue>> = Vec::new();
    for token in conn.split(SHARD_SEPARATOR).filter(|t| !t.is_empty()) {
        // On failure the children built so far drop here, releasing their
        // channels before anything was started.
        children.push(create_queue(token, tube, sync)?);
    }
    if children.is_empty() {
        return Err(EventsError::EmptyConnectionString);
    }
    Ok(Box::new(FanoutQueue::new(children)?))
}
