//! Length-prefixed sandesh message envelope.
//!
//! Wire form: `<sandesh length="DDDDDDDDDD">BODY</sandesh>` where the
//! ten-digit zero-padded decimal is the byte length of the whole envelope,
//! open tag and close tag included.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Literal prefix of the envelope open tag.
pub const OPEN_PREFIX: &[u8] = b"<sandesh length=\"";
/// Literal suffix of the envelope open tag.
pub const OPEN_SUFFIX: &[u8] = b"\">";
/// Envelope close tag.
pub const CLOSE_TAG: &[u8] = b"</sandesh>";
/// Width of the zero-padded decimal length field.
pub const LENGTH_WIDTH: usize = 10;
/// Total byte length of the open tag.
pub const OPEN_LEN: usize = OPEN_PREFIX.len() + LENGTH_WIDTH + OPEN_SUFFIX.len();

/// Smallest well-formed envelope: open tag plus close tag, empty body.
pub const MIN_ENVELOPE_LEN: usize = OPEN_LEN + CLOSE_TAG.len();

/// Encodes a body into a complete envelope.
pub fn encode_envelope(body: &[u8]) -> BytesMut {
    let total = OPEN_LEN + body.len() + CLOSE_TAG.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(OPEN_PREFIX);
    buf.put_slice(format!("{:0width$}", total, width = LENGTH_WIDTH).as_bytes());
    buf.put_slice(OPEN_SUFFIX);
    buf.put_slice(body);
    buf.put_slice(CLOSE_TAG);
    buf
}

/// Incremental envelope reader.
///
/// Accumulates raw transport bytes and yields complete message bodies,
/// supporting multiple pipelined envelopes per read. A malformed open or
/// close tag drops the frame and resynchronizes on the next open tag, so a
/// single bad frame never kills the connection.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
    drops: u64,
}

impl FrameReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of raw bytes read from the transport.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of malformed frames dropped so far.
    pub fn drops(&self) -> u64 {
        self.drops
    }

    /// Bytes currently buffered but not yet extracted.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extracts the next complete body, if the buffer holds one.
    pub fn next_body(&mut self) -> Option<Bytes> {
        loop {
            let total = match self.parse_open_tag() {
                Ok(Some(total)) => total,
                Ok(None) => return None,
                Err(err) => {
                    tracing::error!(error = %err, "dropping malformed frame");
                    self.drops += 1;
                    self.resync();
                    continue;
                }
            };
            if self.buf.len() < total {
                return None;
            }
            let close_at = total - CLOSE_TAG.len();
            if &self.buf[close_at..total] != CLOSE_TAG {
                tracing::error!("dropping frame with bad close tag");
                self.drops += 1;
                self.resync();
                continue;
            }
            let frame = self.buf.split_to(total).freeze();
            return Some(frame.slice(OPEN_LEN..close_at));
        }
    }

    /// Parses the open tag at the head of the buffer. `Ok(None)` means more
    /// data is needed; the returned length is the total envelope length.
    fn parse_open_tag(&self) -> Result<Option<usize>> {
        if self.buf.len() < OPEN_LEN {
            // A short buffer can still be rejected early if the bytes seen
            // so far cannot be the start of an open tag.
            let n = self.buf.len().min(OPEN_PREFIX.len());
            if self.buf[..n] != OPEN_PREFIX[..n] {
                return Err(TransportError::InvalidFrame {
                    reason: "bad open tag prefix".into(),
                });
            }
            return Ok(None);
        }
        if &self.buf[..OPEN_PREFIX.len()] != OPEN_PREFIX {
            return Err(TransportError::InvalidFrame {
                reason: "bad open tag prefix".into(),
            });
        }
        if &self.buf[OPEN_LEN - OPEN_SUFFIX.len()..OPEN_LEN] != OPEN_SUFFIX {
            return Err(TransportError::InvalidFrame {
                reason: "bad open tag suffix".into(),
            });
        }
        let digits = &self.buf[OPEN_PREFIX.len()..OPEN_PREFIX.len() + LENGTH_WIDTH];
        let text = std::str::from_utf8(digits).map_err(|_| TransportError::InvalidFrame {
            reason: "length field is not UTF-8".into(),
        })?;
        let total: usize = text.parse().map_err(|_| TransportError::InvalidFrame {
            reason: format!("invalid length field [{}]", text),
        })?;
        if total < MIN_ENVELOPE_LEN {
            return Err(TransportError::InvalidFrame {
                reason: format!("envelope length {} below minimum", total),
            });
        }
        Ok(Some(total))
    }

    /// Discards bytes up to the next candidate open tag.
    fn resync(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let next = self.buf[1..]
            .windows(OPEN_PREFIX.len())
            .position(|w| w == OPEN_PREFIX);
        match next {
            Some(pos) => {
                let _ = self.buf.split_to(pos + 1);
            }
            None => {
                // Keep a tail that could be the start of an open tag split
                // across reads.
                let keep = longest_open_prefix_suffix(&self.buf);
                let cut = self.buf.len() - keep;
                let _ = self.buf.split_to(cut.max(1));
            }
        }
    }
}

/// Length of the longest trailing slice of `buf` that is a proper prefix of
/// the open tag.
fn longest_open_prefix_suffix(buf: &[u8]) -> usize {
    let max = OPEN_PREFIX.len().saturating_sub(1).min(buf.len().saturating_sub(1));
    for k in (1..=max).rev() {
        if buf[buf.len() - k..] == OPEN_PREFIX[..k] {
            return k;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: &[u8]) -> BytesMut {
        encode_envelope(body)
    }

    #[test]
    fn test_round_trip() {
        let body = b"{\"seq\":1}{\"v\":2}";
        let wire = envelope(body);

        // The length field states the exact byte length of the envelope.
        let digits = &wire[OPEN_PREFIX.len()..OPEN_PREFIX.len() + LENGTH_WIDTH];
        let parsed: usize = std::str::from_utf8(digits).unwrap().parse().unwrap();
        assert_eq!(parsed, wire.len());

        let mut reader = FrameReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_body().unwrap().as_ref(), body);
        assert!(reader.next_body().is_none());
        assert_eq!(reader.drops(), 0);
    }

    #[test]
    fn test_empty_body() {
        let wire = envelope(b"");
        let mut reader = FrameReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_body().unwrap().len(), 0);
    }

    #[test]
    fn test_pipelined_envelopes_single_feed() {
        let mut wire = envelope(b"first");
        wire.extend_from_slice(&envelope(b"second"));
        wire.extend_from_slice(&envelope(b"third"));

        let mut reader = FrameReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_body().unwrap().as_ref(), b"first");
        assert_eq!(reader.next_body().unwrap().as_ref(), b"second");
        assert_eq!(reader.next_body().unwrap().as_ref(), b"third");
        assert!(reader.next_body().is_none());
    }

    #[test]
    fn test_envelope_split_across_feeds() {
        let wire = envelope(b"split body");
        let mut reader = FrameReader::new();
        for byte in wire.iter() {
            reader.feed(&[*byte]);
        }
        assert_eq!(reader.next_body().unwrap().as_ref(), b"split body");
    }

    #[test]
    fn test_partial_envelope_needs_more_data() {
        let wire = envelope(b"pending");
        let mut reader = FrameReader::new();
        reader.feed(&wire[..OPEN_LEN + 3]);
        assert!(reader.next_body().is_none());
        reader.feed(&wire[OPEN_LEN + 3..]);
        assert_eq!(reader.next_body().unwrap().as_ref(), b"pending");
    }

    #[test]
    fn test_garbage_resyncs_to_next_frame() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(b"garbage bytes");
        wire.extend_from_slice(&envelope(b"survivor"));

        let mut reader = FrameReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_body().unwrap().as_ref(), b"survivor");
        assert!(reader.drops() >= 1);
    }

    #[test]
    fn test_bad_close_tag_drops_frame_only() {
        let mut broken = envelope(b"abc");
        let at = broken.len() - CLOSE_TAG.len();
        broken[at] = b'X';
        let mut wire = broken;
        wire.extend_from_slice(&envelope(b"good"));

        let mut reader = FrameReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_body().unwrap().as_ref(), b"good");
        assert_eq!(reader.drops(), 1);
    }

    #[test]
    fn test_bad_length_field_drops_frame() {
        let mut broken = envelope(b"abc");
        broken[OPEN_PREFIX.len()] = b'x';
        let mut wire = broken;
        wire.extend_from_slice(&envelope(b"good"));

        let mut reader = FrameReader::new();
        reader.feed(&wire);
        assert_eq!(reader.next_body().unwrap().as_ref(), b"good");
        assert!(reader.drops() >= 1);
    }
}
