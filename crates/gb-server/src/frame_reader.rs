//! Per-connection frame assembly.
//!
//! The assembler consumes byte slabs in whatever partition the socket
//! delivers them and yields complete payloads with their memory
//! reservation attached.  The frame sequence is independent of slab
//! boundaries.
//!
//! Policies applied per frame, in order: empty payloads are skipped; a
//! payload above the configured maximum closes the connection; a payload
//! length above 1 GiB whose bytes spell an HTTP verb triggers the teapot
//! bounce instead of a gigabyte-long read; the memory budget is prechecked
//! at header time and actually reserved once the frame is complete.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use gb_proto::frame;

use crate::config::ServerVars;
use crate::memory::{MemoryBudget, MemoryReservation};

/// How many bytes to look at before deciding a huge frame is HTTP traffic.
pub const HTTP_READAHEAD: usize = 4096;

/// Payload lengths above this only happen when an HTTP verb was read as a
/// length, or on a genuinely enormous request.
const HTTP_SIZE_THRESHOLD: u32 = 1 << 30;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Request too big ({size} > {max})")]
    TooBig { size: u32, max: u32 },
    #[error("Received an HTTP request, BER expected")]
    HttpRequest,
    #[error("Memory exhausted, cannot decode request of {size} bytes")]
    MemoryExhausted { size: u32 },
}

/// One complete frame, ready for the codec.
pub struct InboundFrame {
    pub payload: Vec<u8>,
    pub reservation: MemoryReservation,
    /// When the first byte of this frame was buffered.
    pub arrived_at: Instant,
    /// Wire size including the 4-byte header.
    pub frame_len: usize,
}

pub struct FrameAssembler {
    vars: Arc<ServerVars>,
    budget: Arc<MemoryBudget>,
    buf: Vec<u8>,
    started_at: Option<Instant>,
}

impl FrameAssembler {
    pub fn new(vars: Arc<ServerVars>, budget: Arc<MemoryBudget>) -> FrameAssembler {
        FrameAssembler {
            vars,
            budget,
            buf: Vec::with_capacity(256),
            started_at: None,
        }
    }

    /// Buffer one slab read from the socket.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.buf.is_empty() && !chunk.is_empty() && self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame, if one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed.  Errors are terminal for the
    /// connection; the caller decides what (if anything) to write back.
    pub fn next_frame(&mut self) -> Result<Option<InboundFrame>, FrameError> {
        loop {
            if self.buf.len() < frame::HEADER_LEN {
                return Ok(None);
            }
            let size = frame::payload_len(&self.buf[..frame::HEADER_LEN]);

            if size == 0 {
                // keepalive
                self.consume(frame::HEADER_LEN);
                continue;
            }

            let max = self.vars.max_request_size();
            if max > 0 && size > max {
                return Err(FrameError::TooBig { size, max });
            }

            if size > HTTP_SIZE_THRESHOLD {
                match detect_http(size, &self.buf) {
                    HttpProbe::Http => return Err(FrameError::HttpRequest),
                    HttpProbe::NeedMore => return Ok(None),
                    HttpProbe::NotHttp => {}
                }
            }

            if !self.budget.has_free(u64::from(size)) {
                return Err(FrameError::MemoryExhausted { size });
            }

            let total = frame::HEADER_LEN + size as usize;
            if self.buf.len() < total {
                return Ok(None);
            }

            // The precheck passed a moment ago; commit for real now.
            let Some(reservation) = self.budget.try_reserve(u64::from(size)) else {
                return Err(FrameError::MemoryExhausted { size });
            };

            let payload = self.buf[frame::HEADER_LEN..total].to_vec();
            let arrived_at = self.started_at.take().unwrap_or_else(Instant::now);
            self.consume(total);
            return Ok(Some(InboundFrame {
                payload,
                reservation,
                arrived_at,
                frame_len: total,
            }));
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        if self.buf.is_empty() {
            self.started_at = None;
        } else {
            self.started_at = Some(Instant::now());
        }
    }
}

enum HttpProbe {
    Http,
    NotHttp,
    NeedMore,
}

/// Guess whether a huge payload length is really an HTTP request line.
///
/// The four length bytes are re-read as an HTTP verb; a match is confirmed
/// by finding ` HTTP/1.` within the readahead window.
fn detect_http(payload_size: u32, buf: &[u8]) -> HttpProbe {
    match payload_size {
        1_145_392_197   // "DELE"
        | 1_195_725_856 // "GET "
        | 1_212_498_244 // "HEAD"
        | 1_330_664_521 // "OPTI"
        | 1_347_375_956 // "POST"
        | 1_347_769_376 => {} // "PUT "
        _ => return HttpProbe::NotHttp,
    }

    let window = &buf[..buf.len().min(HTTP_READAHEAD)];
    let needle = b" HTTP/1.";
    let found = window.len() > frame::HEADER_LEN
        && window[frame::HEADER_LEN..]
            .windows(needle.len())
            .any(|w| w == needle);
    if found {
        HttpProbe::Http
    } else if buf.len() >= HTTP_READAHEAD {
        HttpProbe::NotHttp
    } else {
        HttpProbe::NeedMore
    }
}
