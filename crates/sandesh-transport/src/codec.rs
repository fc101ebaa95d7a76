//! Structured record codec for sandesh message bodies.
//!
//! A message BODY is the header record followed by the message record, each
//! run through this codec. The codec is a sealed boundary: callers hand in
//! serde records and get opaque byte fragments back. Nothing outside this
//! module may assume the encoded shape.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};

/// Encodes a single record into an opaque body fragment.
pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| TransportError::CodecError(e.to_string()))
}

/// Pulls successive records out of a message body.
///
/// A body holding a header record followed by a message record decodes as
/// two [`RecordDecoder::next`] calls.
pub struct RecordDecoder<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> RecordDecoder<'a> {
    /// Creates a decoder over a complete body.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    /// Decodes the next record in the body.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut iter =
            serde_json::Deserializer::from_slice(&self.buf[self.offset..]).into_iter::<T>();
        match iter.next() {
            Some(Ok(record)) => {
                self.offset += iter.byte_offset();
                Ok(record)
            }
            Some(Err(e)) => Err(TransportError::CodecError(e.to_string())),
            None => Err(TransportError::CodecError("empty record".into())),
        }
    }

    /// Bytes of the body not yet consumed by [`RecordDecoder::next`].
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Header {
        module: String,
        sequence: u32,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        value: i64,
    }

    #[test]
    fn test_two_records_round_trip() {
        let header = Header {
            module: "vrouter-agent".into(),
            sequence: 7,
        };
        let payload = Payload { value: -42 };

        let mut body = encode_record(&header).unwrap();
        body.extend_from_slice(&encode_record(&payload).unwrap());

        let mut decoder = RecordDecoder::new(&body);
        let got_header: Header = decoder.next().unwrap();
        let got_payload: Payload = decoder.next().unwrap();
        assert_eq!(got_header, header);
        assert_eq!(got_payload, payload);
        assert!(decoder.remaining().is_empty());
    }

    #[test]
    fn test_truncated_record_fails() {
        let body = encode_record(&Header {
            module: "collector".into(),
            sequence: 1,
        })
        .unwrap();
        let mut decoder = RecordDecoder::new(&body[..body.len() - 2]);
        assert!(decoder.next::<Header>().is_err());
    }

    #[test]
    fn test_empty_body_fails() {
        let mut decoder = RecordDecoder::new(b"");
        assert!(decoder.next::<Payload>().is_err());
    }
}
