//! Envelope codec for UDP datagrams and byte streams.
//!
//! Wire format: 13-byte little-endian header + payload (see [`crate::envelope`]).

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::{Envelope, Header};
use crate::{ProtocolError, ENVELOPE_HEADER_SIZE};

/// Codec for framing Envelope values.
///
/// A malformed header discards everything buffered: datagrams cannot be
/// resynchronised, and leaving the bytes would yield the same error forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENVELOPE_HEADER_SIZE {
            return Ok(None);
        }

        let header = match Header::parse(src) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(discarded = src.len(), "codec: bad envelope header: {e}");
                src.clear();
                return Err(e);
            }
        };

        let total = ENVELOPE_HEADER_SIZE + header.payload_size;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        Envelope::deserialize(&frame).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(envelope) => Ok(Some(envelope)),
            None if src.is_empty() => Ok(None),
            None => {
                let len = src.len();
                tracing::debug!(len, "codec: truncated envelope at end of input");
                src.clear();
                Err(ProtocolError::Truncated { len })
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Envelope>>::encode(self, &item, dst)
    }
}

impl<'a> Encoder<&'a Envelope> for EnvelopeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &'a Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if !item.validate() {
            return Err(ProtocolError::InvalidEnvelope);
        }
        item.encode(dst);
        Ok(())
    }
}
