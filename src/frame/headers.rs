use crate::frame::{Error, Head, StreamId};

use bytes::BytesMut;

use std::fmt;

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;

/// A single decoded header field. Names are kept in wire form (lower-case,
/// pseudo fields prefixed with `:`); values are required to be UTF-8, which
/// every legal RPC header is.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> HeaderField {
        HeaderField {
            name: name.into(),
            value: value.into(),
        }
    }

    /// The size of an entry per RFC 7541 §4.1, used for header-list-size
    /// accounting.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

impl fmt::Debug for HeaderField {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}: {}", self.name, self.value)
    }
}

/// A "meta-headers" frame: HEADERS plus any CONTINUATION frames, with the
/// header block already run through HPACK.
#[derive(Debug)]
pub struct Headers {
    stream_id: StreamId,
    fields: Vec<HeaderField>,
    flags: u8,
}

impl Headers {
    /// Parses the non-header-block portion of a HEADERS frame, returning the
    /// frame and the header block fragment. The fragment is fed to
    /// `load_hpack` once END_HEADERS is reached.
    pub fn load(head: Head, mut payload: BytesMut) -> Result<(Headers, BytesMut), Error> {
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let flags = head.flag();
        let mut pad_len = 0;

        if flags & PADDED == PADDED {
            if payload.is_empty() {
                return Err(Error::TooMuchPadding);
            }
            pad_len = payload[0] as usize;
            let _ = payload.split_to(1);
        }

        if flags & PRIORITY == PRIORITY {
            // Stream priority is deprecated and ignored, but the five bytes
            // still have to come off the front of the block.
            if payload.len() < 5 {
                return Err(Error::BadFrameSize);
            }
            let _ = payload.split_to(5);
        }

        if pad_len > payload.len() {
            return Err(Error::TooMuchPadding);
        }
        payload.truncate(payload.len() - pad_len);

        let headers = Headers {
            stream_id: head.stream_id(),
            fields: Vec::new(),
            flags,
        };

        Ok((headers, payload))
    }

    /// Decodes the complete header block into fields, enforcing the local
    /// maximum header list size and pseudo-header ordering.
    pub fn load_hpack(
        &mut self,
        src: &BytesMut,
        max_header_list_size: usize,
        decoder: &mut fluke_hpack::Decoder<'_>,
    ) -> Result<(), Error> {
        let raw = decoder.decode(src).map_err(Error::Hpack)?;

        let mut size = 0;
        let mut seen_regular = false;

        for (name, value) in raw {
            let name = String::from_utf8(name).map_err(|_| Error::MalformedMessage)?;
            let value = String::from_utf8(value).map_err(|_| Error::MalformedMessage)?;

            if name.is_empty() || name.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(Error::MalformedMessage);
            }
            if name.starts_with(':') {
                // Pseudo-header fields MUST appear in the header block before
                // regular header fields.
                if seen_regular {
                    return Err(Error::MalformedMessage);
                }
            } else {
                seen_regular = true;
            }

            let field = HeaderField { name, value };
            size += field.size();
            if size > max_header_list_size {
                return Err(Error::HeaderListTooLarge);
            }
            self.fields.push(field);
        }

        Ok(())
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags & END_STREAM == END_STREAM
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags & END_HEADERS == END_HEADERS
    }

    pub fn set_end_headers(&mut self) {
        self.flags |= END_HEADERS;
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<HeaderField> {
        self.fields
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Kind;

    fn decode(flags: u8, block: &[u8]) -> Result<Headers, Error> {
        let head = Head::new(Kind::Headers, flags | END_HEADERS, StreamId::new(1));
        let (mut headers, fragment) = Headers::load(head, BytesMut::from(block))?;
        let mut decoder = fluke_hpack::Decoder::new();
        headers.load_hpack(&fragment, 16 << 20, &mut decoder)?;
        Ok(headers)
    }

    #[test]
    fn decodes_literal_header_block() {
        // Literal w/o indexing: ":status: 200" via the static table index 8.
        let headers = decode(0, &[0x88]).unwrap();
        assert_eq!(headers.fields().len(), 1);
        assert_eq!(headers.fields()[0], HeaderField::new(":status", "200"));
        assert!(!headers.is_end_stream());
    }

    #[test]
    fn pseudo_header_after_regular_is_malformed() {
        let mut encoder = fluke_hpack::Encoder::new();
        let block = encoder.encode(vec![
            (&b"grpc-status"[..], &b"0"[..]),
            (&b":status"[..], &b"200"[..]),
        ]);
        assert!(matches!(decode(0, &block), Err(Error::MalformedMessage)));
    }

    #[test]
    fn header_list_size_is_enforced() {
        let head = Head::new(Kind::Headers, END_HEADERS, StreamId::new(1));
        let mut encoder = fluke_hpack::Encoder::new();
        let block = encoder.encode(vec![(&b"x-filler"[..], &[b'a'; 128][..])]);
        let (mut headers, fragment) = Headers::load(head, BytesMut::from(&block[..])).unwrap();
        let mut decoder = fluke_hpack::Decoder::new();
        assert!(matches!(
            headers.load_hpack(&fragment, 64, &mut decoder),
            Err(Error::HeaderListTooLarge)
        ));
    }
}
