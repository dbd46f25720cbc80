//! Minimal framed RPC client for tests.
//!
//! Sends one message per frame and reads framed replies back.  Raw access
//! is exposed so tests can also speak garbage (HTTP lines, truncated
//! frames) at the server.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use gb_proto::message::Message;
use gb_proto::{codec, frame};

pub struct FrameClient {
    stream: TcpStream,
}

impl FrameClient {
    pub async fn connect(addr: &str) -> io::Result<FrameClient> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(FrameClient { stream })
    }

    pub async fn send_message(&mut self, msg: &Message) -> io::Result<()> {
        self.stream.write_all(&frame::frame_message(msg)).await
    }

    /// Write arbitrary bytes, bypassing the frame encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    /// Read one framed reply and decode it.
    pub async fn recv_reply(&mut self) -> io::Result<Message> {
        let mut header = [0u8; frame::HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let len = frame::payload_len(&header) as usize;
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await?;
        codec::decode(&payload).map_err(io::Error::other)
    }

    /// Read whatever the server sends until it closes the connection.
    pub async fn read_until_close(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// True when the server closed the connection without sending bytes.
    pub async fn closed_silently(&mut self) -> bool {
        matches!(self.read_until_close().await.as_deref(), Ok(&[]))
    }
}
