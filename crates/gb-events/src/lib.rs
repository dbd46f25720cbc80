// gb-events: Best-effort event emission to broker backends.
//
// Application code builds a JSON envelope, picks the queue registered for
// the event type, and calls the top-level send entry points.  Queues are
// polymorphic over backends (beanstalkd, kafka async/sync, fanout over
// several of those); a stalled queue hands payloads to the fallback drop
// sink instead of blocking the caller.

pub mod beanstalkd;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod fallback;
pub mod fanout;
pub mod kafka;
pub mod kafka_sync;
pub mod queue;
pub mod registry;
mod shared;

pub use error::EventsError;
pub use factory::create_queue;
pub use queue::{EventQueue, flush_overwritable, send, send_overwritable};
