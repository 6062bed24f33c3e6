//! Line framing for IRC connections.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Codec for CRLF-terminated IRC lines.
///
/// IRC carries no charset information, so bytes that are not UTF-8 are
/// replaced instead of failing the stream. Lines longer than the limit are
/// skipped whole.
pub struct IrcCodec {
    max_len: usize,
    /// Index of the next byte to check for a newline.
    next_index: usize,
    /// Inside an over-long line: drop everything up to the next newline.
    discarding: bool,
}

impl IrcCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            next_index: 0,
            discarding: false,
        }
    }
}

fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for IrcCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match newline {
                Some(end) if self.discarding => {
                    src.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                Some(end) => {
                    let line = src.split_to(end + 1);
                    self.next_index = 0;
                    if end > self.max_len {
                        warn!(length = end, "Skipping over-long IRC line");
                        continue;
                    }
                    return Ok(Some(to_line(&line[..end])));
                }
                None if self.discarding => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                None if src.len() > self.max_len => {
                    warn!(length = src.len(), "Skipping over-long IRC line");
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(None);
                }
                None => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        // Unterminated last line
        let rest = src.split();
        Ok(Some(to_line(&rest)))
    }
}

impl Encoder<String> for IrcCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> io::Result<()> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
