// gridbus: Request transport and event emission for distributed-storage
// nodes.
//
// The root crate re-exports the member crates; see each crate for the
// actual machinery:
// - gb-proto:  frames, messages, the BER codec, the status-code domain
// - gb-server: the framed RPC server (dispatch, deadlines, access logs)
// - gb-events: broker-backed event queues (beanstalkd, kafka, fanout)

pub use gb_events as events;
pub use gb_proto as proto;
pub use gb_server as server;
