//! TCP server and per-connection driver.
//!
//! Each accepted connection gets a reader side (frame assembly and
//! dispatch, strictly sequential) and a writer task draining the reply
//! channel, so replies keep arrival order without the dispatch path ever
//! owning the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, tcp::OwnedReadHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use gb_proto::message::{FIELD_PERFDATA, FIELD_TIMEOUT, Message};
use gb_proto::{codec, frame, status};

use crate::access::{self, AccessRecord};
use crate::config::{ServerConfig, ServerVars};
use crate::dispatch::Dispatcher;
use crate::frame_reader::{FrameAssembler, FrameError, InboundFrame};
use crate::memory::MemoryBudget;
use crate::reply::{ReplyContext, ReplySink};
use crate::reqlocal::{self, RequestScope};
use crate::stats::{self, StatsTable};
use crate::statsd::StatsdClient;

const READ_BUF_SIZE: usize = 8192;

/// State shared by every connection of one server.
pub struct ServerShared {
    pub vars: Arc<ServerVars>,
    pub stats: StatsTable,
    pub memory: Arc<MemoryBudget>,
    pub statsd: Option<StatsdClient>,
    pub service_id: Option<String>,
    pub volume: Option<String>,
    pub namespace: String,
    endpoints: RwLock<Vec<String>>,
    dispatcher: OnceLock<Arc<Dispatcher>>,
}

impl ServerShared {
    /// The dispatcher, once `bind_host` installed it.
    pub fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.dispatcher.get().cloned()
    }

    /// First bound endpoint, the canonical address for REDIRECT replies.
    pub fn first_endpoint(&self) -> Option<String> {
        self.endpoints
            .read()
            .expect("endpoints lock poisoned")
            .first()
            .cloned()
    }
}

pub struct RpcServer {
    shared: Arc<ServerShared>,
}

impl RpcServer {
    pub fn new(config: ServerConfig) -> RpcServer {
        let statsd = config.statsd_addr.as_deref().and_then(|addr| {
            StatsdClient::new(addr)
                .map_err(|e| warn!(addr, error = %e, "statsd disabled"))
                .ok()
        });
        let shared = Arc::new(ServerShared {
            vars: Arc::new(ServerVars::from_config(&config)),
            stats: StatsTable::default(),
            memory: MemoryBudget::new(config.max_memory),
            statsd,
            service_id: config.service_id,
            volume: config.volume,
            namespace: config.namespace,
            endpoints: RwLock::new(Vec::new()),
            dispatcher: OnceLock::new(),
        });
        shared.stats.set(
            stats::KEY_THREAD_ACTIVE,
            std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(1),
        );
        RpcServer { shared }
    }

    pub fn shared(&self) -> Arc<ServerShared> {
        self.shared.clone()
    }

    /// Bind a listener and start accepting.  Returns the bound address
    /// (useful with port 0).  May be called for several addresses with the
    /// same dispatcher; registering handlers after the first bind is not
    /// supported.
    pub async fn bind_host(
        &self,
        addr: &str,
        dispatcher: Arc<Dispatcher>,
    ) -> io::Result<SocketAddr> {
        dispatcher.seed_stats(&self.shared.stats);
        let _ = self.shared.dispatcher.set(dispatcher.clone());

        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        self.shared
            .endpoints
            .write()
            .expect("endpoints lock poisoned")
            .push(local.to_string());
        info!(endpoint = %local, "listening");

        let shared = self.shared.clone();
        tokio::spawn(accept_loop(shared, dispatcher, listener));
        Ok(local)
    }
}

async fn accept_loop(
    shared: Arc<ServerShared>,
    dispatcher: Arc<Dispatcher>,
    listener: TcpListener,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                shared.stats.add(stats::KEY_CNX_ACCEPT, 1);
                shared.stats.add(stats::KEY_CNX_CLIENT, 1);
                let shared = shared.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    handle_client(shared.clone(), dispatcher, stream, peer).await;
                    shared.stats.sub(stats::KEY_CNX_CLIENT, 1);
                    shared.stats.add(stats::KEY_CNX_CLOSE, 1);
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_client(
    shared: Arc<ServerShared>,
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let local_name = stream
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if wr.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    let sink = ReplySink::new(tx, local_name, peer.to_string());
    let mut assembler = FrameAssembler::new(shared.vars.clone(), shared.memory.clone());
    let mut readbuf = vec![0u8; READ_BUF_SIZE];

    'conn: loop {
        let n = match read_slab(&mut rd, &mut readbuf, shared.vars.idle_timeout()).await {
            Some(0) | None => break 'conn,
            Some(n) => n,
        };
        assembler.push(&readbuf[..n]);

        loop {
            match assembler.next_frame() {
                Ok(Some(inbound)) => {
                    if !process_request(&shared, &dispatcher, &sink, inbound).await {
                        break 'conn;
                    }
                }
                Ok(None) => break,
                Err(e @ FrameError::TooBig { .. }) => {
                    warn!(peer = %sink.peer_name, "{e}");
                    break 'conn;
                }
                Err(e @ FrameError::HttpRequest) => {
                    warn!(peer = %sink.peer_name, "{e}");
                    sink.send_frame(b"HTTP/1.1 418 I'm a teapot\r\n".to_vec());
                    break 'conn;
                }
                Err(e @ FrameError::MemoryExhausted { .. }) => {
                    warn!(
                        peer = %sink.peer_name,
                        max_memory = shared.memory.capacity(),
                        "{e}"
                    );
                    sink.send_frame(frame::frame_message(&Message::reply(
                        status::CODE_UNAVAILABLE,
                        "Memory exhausted",
                    )));
                    break 'conn;
                }
            }
        }
    }

    // Dropping the sink closes the channel; the writer flushes what is
    // queued (the teapot line or a final error) and shuts the socket down.
    drop(sink);
    let _ = writer.await;
    debug!(peer = %peer, "client done");
}

async fn read_slab(rd: &mut OwnedReadHalf, buf: &mut [u8], idle: Duration) -> Option<usize> {
    if idle.is_zero() {
        return rd.read(buf).await.ok();
    }
    match tokio::time::timeout(idle, rd.read(buf)).await {
        Err(_) => {
            debug!("idle timeout");
            None
        }
        Ok(result) => result.ok(),
    }
}

/// Decode and dispatch one frame.  Returns whether the connection should
/// keep going.
async fn process_request(
    shared: &Arc<ServerShared>,
    dispatcher: &Arc<Dispatcher>,
    sink: &ReplySink,
    inbound: InboundFrame,
) -> bool {
    let parsed_at = Instant::now();
    let _reservation = inbound.reservation;

    let message = match codec::decode(&inbound.payload) {
        Ok(message) => message,
        Err(e) => {
            info!(peer = %sink.peer_name, error = %e, "message decoder error");
            access::emit(
                shared,
                &AccessRecord {
                    local: &sink.local_name,
                    peer: &sink.peer_name,
                    method: "-",
                    code: status::CODE_BAD_REQUEST,
                    arrival: inbound.arrived_at,
                    parsed: parsed_at,
                    end: Instant::now(),
                    bytes_recvd: inbound.frame_len as u64,
                    bytes_sent: 0,
                    reqid: "-",
                    db_wait: Duration::ZERO,
                    perfdata: None,
                    subject: "",
                    access_disabled: false,
                },
            );
            return false;
        }
    };
    drop(inbound.payload);

    let perfdata_enabled = shared.vars.perfdata_enabled()
        || message.field_i64(FIELD_PERFDATA).unwrap_or(0) != 0;
    let deadline = reqlocal::compute_deadline(
        inbound.arrived_at,
        shared.vars.max_run_time(),
        message.field_i64(FIELD_TIMEOUT),
    );
    let missing_name = message.name().is_empty();

    let mut reply = ReplyContext::new(
        shared.clone(),
        sink.clone(),
        message,
        inbound.arrived_at,
        parsed_at,
        deadline,
        inbound.frame_len as u64,
    );
    reply.subject(&format!(
        "timeout_float:{:.6}",
        deadline.saturating_duration_since(parsed_at).as_secs_f64()
    ));

    let scope = RequestScope::new(reply.reqid().to_owned(), deadline, perfdata_enabled);
    reqlocal::with_scope(scope, async {
        reqlocal::add_perfdata(
            "req_decode",
            parsed_at.saturating_duration_since(inbound.arrived_at),
        );

        if missing_name {
            reply.send_reply(status::CODE_BAD_REQUEST, "Invalid/No request name");
            return true;
        }

        let mut rc = dispatcher.dispatch(&mut reply).await;
        if !reply.final_sent() {
            // The handler is buggy; answer something final and give up on
            // the connection.
            reply.send_reply(status::CODE_INTERNAL_ERROR, "BUG: no reply sent");
            rc = false;
        }
        rc
    })
    .await
}
