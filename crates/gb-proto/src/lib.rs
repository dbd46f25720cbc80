// gb-proto: Wire-level types for the gridbus RPC dialect.
//
// A request or reply travels as one length-prefixed frame whose payload is
// a BER-encoded message: a NAME selecting the handler, an opaque correlation
// ID, a small set of named string fields, and an opaque body.

pub mod codec;
pub mod frame;
pub mod message;
pub mod status;

pub use codec::CodecError;
pub use message::Message;
