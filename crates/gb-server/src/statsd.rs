//! Fire-and-forget statsd timing emission.
//!
//! One UDP datagram per finalized request:
//! `request.<method>.<status>.timing:<millis>|ms`.  Send failures are
//! ignored; metrics must never slow down or break the request path.

use std::io;
use std::net::UdpSocket;

pub struct StatsdClient {
    sock: UdpSocket,
}

impl StatsdClient {
    pub fn new(addr: &str) -> io::Result<StatsdClient> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.connect(addr)?;
        sock.set_nonblocking(true)?;
        Ok(StatsdClient { sock })
    }

    pub fn timing(&self, name: &str, millis: u128) {
        let _ = self.sock.send(format!("{name}:{millis}|ms").as_bytes());
    }
}
