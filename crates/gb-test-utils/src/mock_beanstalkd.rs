//! Scripted beanstalkd broker for queue tests.
//!
//! Understands just enough of the protocol to accept a producer: `use`
//! gets `USING`, `put` reads the announced payload and gets `INSERTED`.
//! Everything received is recorded for assertions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Default)]
struct BrokerState {
    tube: Mutex<Option<String>>,
    payloads: Mutex<Vec<String>>,
}

pub struct MockBeanstalkd {
    addr: SocketAddr,
    state: Arc<BrokerState>,
}

impl MockBeanstalkd {
    /// Bind on a random loopback port and start serving producers.
    pub async fn start() -> MockBeanstalkd {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock broker");
        let addr = listener.local_addr().expect("local_addr after bind");
        let state = Arc::new(BrokerState::default());

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _peer)) = listener.accept().await {
                tokio::spawn(serve_producer(stream, accept_state.clone()));
            }
        });

        MockBeanstalkd { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Tube selected by the last `use` command.
    pub fn tube(&self) -> Option<String> {
        self.state.tube.lock().unwrap().clone()
    }

    /// Payloads received so far, in arrival order.
    pub fn payloads(&self) -> Vec<String> {
        self.state.payloads.lock().unwrap().clone()
    }
}

async fn serve_producer(stream: TcpStream, state: Arc<BrokerState>) {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut line = String::new();

    loop {
        line.clear();
        match rd.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();
        match parts.as_slice() {
            ["use", tube] => {
                *state.tube.lock().unwrap() = Some((*tube).to_owned());
                if wr
                    .write_all(format!("USING {tube}\r\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            ["put", _pri, _delay, _ttr, bytes] => {
                let Ok(len) = bytes.parse::<usize>() else {
                    let _ = wr.write_all(b"BAD_FORMAT\r\n").await;
                    return;
                };
                // Payload plus trailing \r\n.
                let mut payload = vec![0u8; len + 2];
                if rd.read_exact(&mut payload).await.is_err() {
                    return;
                }
                payload.truncate(len);
                let payload = String::from_utf8_lossy(&payload).into_owned();
                let id = {
                    let mut all = state.payloads.lock().unwrap();
                    all.push(payload);
                    all.len()
                };
                if wr
                    .write_all(format!("INSERTED {id}\r\n").as_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            _ => {
                let _ = wr.write_all(b"UNKNOWN_COMMAND\r\n").await;
            }
        }
    }
}
