//! BER codec for [`Message`].
//!
//! The payload is one definite-length SEQUENCE with four context-tagged
//! members, always present (possibly empty):
//!
//! ```text
//! Message ::= SEQUENCE {                    -- 0x30
//!     name    [0] IMPLICIT OCTET STRING,    -- 0x80
//!     id      [1] IMPLICIT OCTET STRING,    -- 0x81
//!     fields  [2] IMPLICIT SEQUENCE OF      -- 0xa2
//!                 SEQUENCE { key OCTET STRING, value OCTET STRING },
//!     body    [3] IMPLICIT OCTET STRING,    -- 0x83
//! }
//! ```
//!
//! Lengths are definite, long form past 127 bytes.  The decoder rejects
//! indefinite lengths and trailing garbage inside a parent value.

use thiserror::Error;

use crate::message::Message;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NAME: u8 = 0x80;
const TAG_ID: u8 = 0x81;
const TAG_FIELDS: u8 = 0xa2;
const TAG_BODY: u8 = 0x83;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("truncated message: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unexpected tag 0x{found:02x} at offset {offset} (expected 0x{expected:02x})")]
    UnexpectedTag {
        offset: usize,
        expected: u8,
        found: u8,
    },
    #[error("unsupported length form at offset {offset}")]
    BadLength { offset: usize },
    #[error("message NAME is not valid UTF-8")]
    BadName,
    #[error("field key is not valid UTF-8")]
    BadFieldKey,
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn write_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
}

fn write_tlv(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    write_len(out, value.len());
    out.extend_from_slice(value);
}

/// Encode `msg` into its BER payload (no frame header).
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut fields = Vec::new();
    for (key, value) in msg.fields() {
        let mut pair = Vec::with_capacity(key.len() + value.len() + 8);
        write_tlv(&mut pair, TAG_OCTET_STRING, key.as_bytes());
        write_tlv(&mut pair, TAG_OCTET_STRING, value);
        write_tlv(&mut fields, TAG_SEQUENCE, &pair);
    }

    let mut inner = Vec::with_capacity(64 + msg.body().len() + fields.len());
    write_tlv(&mut inner, TAG_NAME, msg.name().as_bytes());
    write_tlv(&mut inner, TAG_ID, msg.id());
    write_tlv(&mut inner, TAG_FIELDS, &fields);
    write_tlv(&mut inner, TAG_BODY, msg.body());

    let mut out = Vec::with_capacity(inner.len() + 8);
    write_tlv(&mut out, TAG_SEQUENCE, &inner);
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                offset: self.pos,
                needed: n - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_tlv(&mut self, expected: u8) -> Result<&'a [u8], CodecError> {
        let offset = self.pos;
        let tag = self.take(1)?[0];
        if tag != expected {
            return Err(CodecError::UnexpectedTag {
                offset,
                expected,
                found: tag,
            });
        }
        let first = self.take(1)?[0];
        let len = if first < 0x80 {
            first as usize
        } else {
            let n = (first & 0x7f) as usize;
            // 0x80 alone would be an indefinite length; refuse it.
            if n == 0 || n > std::mem::size_of::<usize>() {
                return Err(CodecError::BadLength { offset });
            }
            let mut len = 0usize;
            for b in self.take(n)? {
                len = (len << 8) | usize::from(*b);
            }
            len
        };
        self.take(len)
    }
}

/// Decode one BER payload into a [`Message`].
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let mut outer = Reader::new(buf);
    let inner = outer.read_tlv(TAG_SEQUENCE)?;

    let mut r = Reader::new(inner);
    let name = r.read_tlv(TAG_NAME)?;
    let id = r.read_tlv(TAG_ID)?;
    let fields = r.read_tlv(TAG_FIELDS)?;
    let body = r.read_tlv(TAG_BODY)?;

    let name = std::str::from_utf8(name).map_err(|_| CodecError::BadName)?;
    let mut msg = Message::request(name);
    msg.set_id(id.to_vec());
    msg.set_body(body.to_vec());

    let mut fr = Reader::new(fields);
    while fr.remaining() > 0 {
        let pair = fr.read_tlv(TAG_SEQUENCE)?;
        let mut pr = Reader::new(pair);
        let key = pr.read_tlv(TAG_OCTET_STRING)?;
        let value = pr.read_tlv(TAG_OCTET_STRING)?;
        let key = std::str::from_utf8(key).map_err(|_| CodecError::BadFieldKey)?;
        msg.set_field(key, value.to_vec());
    }

    Ok(msg)
}
