//! Beanstalkd-backed event queue.
//!
//! One worker task owns the broker connection: it selects the tube, then
//! drains the bounded channel with one `put` per event, reading the
//! `INSERTED` confirmation before the next.  Connection loss re-queues
//! the in-flight event and reconnects with capped exponential backoff;
//! the queue reports stalled while disconnected.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::EventsError;
use crate::fallback;
use crate::queue::EventQueue;
use crate::shared::{QueueCore, QueuedEvent};

const PUT_PRIORITY: u32 = 1024;
const PUT_TTR_SECONDS: u32 = 120;
const WORKER_TICK: Duration = Duration::from_millis(250);
const BACKOFF_START: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct BeanstalkdQueue {
    core: Arc<QueueCore>,
    tube: String,
}

impl BeanstalkdQueue {
    /// `netloc` is `host:port`; `tube` names both the beanstalkd tube and
    /// the queue itself.
    pub fn new(netloc: &str, tube: &str) -> BeanstalkdQueue {
        BeanstalkdQueue {
            core: Arc::new(QueueCore::new(tube.to_owned(), netloc.to_owned())),
            tube: tube.to_owned(),
        }
    }
}

impl EventQueue for BeanstalkdQueue {
    fn queue_name(&self) -> &str {
        &self.core.queue_name
    }

    fn endpoint(&self) -> &str {
        &self.core.endpoint
    }

    fn start(&self) -> Result<(), EventsError> {
        let rx = self
            .core
            .take_receiver()
            .ok_or(EventsError::AlreadyStarted)?;
        tokio::spawn(worker(self.core.clone(), self.tube.clone(), rx));
        Ok(())
    }

    fn enqueue(&self, key: Option<&str>, payload: String) -> bool {
        self.core.push(key, payload)
    }

    fn is_stalled(&self) -> bool {
        self.core.is_stalled()
    }

    fn health(&self) -> i64 {
        self.core.health()
    }

    fn set_buffering(&self, delay: Duration) {
        self.core.set_buffering(delay);
    }

    fn supports_overwritable(&self) -> bool {
        true
    }

    fn enqueue_overwritable(&self, tag: &str, payload: String) -> bool {
        self.core.buffer_overwritable(tag, payload);
        true
    }

    fn flush_overwritable(&self, tag: &str) {
        if let Some(payload) = self.core.take_overwritable(tag)
            && !self.core.push(None, payload.clone())
        {
            warn!(queue = %self.core.queue_name, tag, "flush with a full channel, dropping");
            fallback::drop_event(&self.core.queue_name, None, &payload);
        }
    }

    fn total_send_time(&self) -> u64 {
        self.core.total_send_time()
    }

    fn total_sent_events(&self) -> u64 {
        self.core.total_sent_events()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn worker(core: Arc<QueueCore>, tube: String, mut rx: mpsc::Receiver<QueuedEvent>) {
    let mut backoff = BACKOFF_START;
    let mut carry: Option<QueuedEvent> = None;

    'reconnect: loop {
        let stream = match TcpStream::connect(core.endpoint.as_str()).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(endpoint = %core.endpoint, error = %e, "beanstalkd connect failed");
                core.set_connected(false);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };
        let (rd, mut wr) = stream.into_split();
        let mut rd = BufReader::new(rd);

        match select_tube(&mut wr, &mut rd, &tube).await {
            Ok(()) => {}
            Err(e) => {
                warn!(endpoint = %core.endpoint, error = %e, "beanstalkd tube selection failed");
                core.set_connected(false);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        }
        core.set_connected(true);
        backoff = BACKOFF_START;

        loop {
            let event = match carry.take() {
                Some(event) => Some(event),
                None => match timeout(WORKER_TICK, rx.recv()).await {
                    Ok(Some(event)) => Some(event),
                    Ok(None) => {
                        // Producer side is gone: final overwritable flush.
                        for payload in core.take_due_overwritable(true) {
                            let _ = put(&mut wr, &mut rd, &core, &payload).await;
                        }
                        core.set_connected(false);
                        return;
                    }
                    Err(_) => None,
                },
            };

            match event {
                Some(event) => match put(&mut wr, &mut rd, &core, &event.payload).await {
                    Ok(()) => {}
                    Err(e) => {
                        warn!(endpoint = %core.endpoint, error = %e, "beanstalkd send failed");
                        core.set_connected(false);
                        carry = Some(event);
                        continue 'reconnect;
                    }
                },
                None => {
                    for payload in core.take_due_overwritable(false) {
                        if let Err(e) = put(&mut wr, &mut rd, &core, &payload).await {
                            warn!(endpoint = %core.endpoint, error = %e,
                                "beanstalkd send failed, dropping buffered event");
                            fallback::drop_event(&core.queue_name, None, &payload);
                            core.set_connected(false);
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

async fn select_tube(
    wr: &mut OwnedWriteHalf,
    rd: &mut BufReader<OwnedReadHalf>,
    tube: &str,
) -> io::Result<()> {
    wr.write_all(format!("use {tube}\r\n").as_bytes()).await?;
    let line = read_reply(rd).await?;
    if line.starts_with("USING") {
        Ok(())
    } else {
        Err(io::Error::other(format!("unexpected reply to use: {line}")))
    }
}

/// One `put`, confirmed.  A non-INSERTED reply is logged and the event
/// dropped (the broker refused it; retrying would refuse again).
async fn put(
    wr: &mut OwnedWriteHalf,
    rd: &mut BufReader<OwnedReadHalf>,
    core: &QueueCore,
    payload: &str,
) -> io::Result<()> {
    let started = Instant::now();
    let header = format!(
        "put {PUT_PRIORITY} 0 {PUT_TTR_SECONDS} {}\r\n",
        payload.len()
    );
    wr.write_all(header.as_bytes()).await?;
    wr.write_all(payload.as_bytes()).await?;
    wr.write_all(b"\r\n").await?;

    let line = read_reply(rd).await?;
    if line.starts_with("INSERTED") {
        core.account_send(started.elapsed());
    } else {
        warn!(queue = %core.queue_name, reply = %line, "beanstalkd refused event");
    }
    Ok(())
}

async fn read_reply(rd: &mut BufReader<OwnedReadHalf>) -> io::Result<String> {
    let mut line = String::new();
    let n = rd.read_line(&mut line).await?;
    if n == 0 {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(line.trim_end().to_owned())
}
