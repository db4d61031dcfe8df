//! Line framing for the client-to-client wire: NMDC frames are
//! `|`-terminated, ADC frames are `\n`-terminated. Both are
//! served by the same growable-buffer-plus-delimiter-search discipline, so
//! one [`tokio_util::codec::Decoder`] handles either, parameterized by the
//! delimiter byte once the dialect is known.
//!
//! An oversized frame (no delimiter found within `max_len` bytes) is a
//! protocol error, not a buffering problem — the caller is expected to
//! disconnect rather than keep growing the buffer indefinitely.
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use tigerwire_proto::Dialect;

/// Default cap on a single C-C frame. Generous for file-list GET/SND
/// headers and bloom parameter lines; anything longer is almost certainly a
/// hostile or broken peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame exceeded the maximum allowed size of {0} bytes")]
    TooLong(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Decodes one delimiter-terminated frame at a time, with the delimiter
/// stripped. `delimiter` is fixed for the lifetime of one `CC` once its
/// dialect has been detected from the peer's first byte, before this codec
/// is ever used for decoding.
pub struct DelimitedCodec {
    delimiter: u8,
    max_len: usize,
}

impl DelimitedCodec {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            delimiter: match dialect {
                Dialect::Nmdc => b'|',
                Dialect::Adc => b'\n',
            },
            max_len: MAX_FRAME_LEN,
        }
    }

    #[cfg(test)]
    fn with_max_len(dialect: Dialect, max_len: usize) -> Self {
        Self {
            max_len,
            ..Self::new(dialect)
        }
    }
}

impl Decoder for DelimitedCodec {
    type Item = String;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, FramingError> {
        match memchr::memchr(self.delimiter, src) {
            Some(pos) => {
                let frame = src.split_to(pos);
                src.advance(1); // the delimiter itself
                let s = String::from_utf8_lossy(&frame).into_owned();
                Ok(Some(s))
            }
            None => {
                if src.len() >= self.max_len {
                    Err(FramingError::TooLong(self.max_len))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Encoder<String> for DelimitedCodec {
    type Error = FramingError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), FramingError> {
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(&[self.delimiter]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_one_nmdc_frame_at_a_time() {
        let mut codec = DelimitedCodec::new(Dialect::Nmdc);
        let mut buf = BytesMut::from(&b"$MyNick foo|$Lock bar Pk=baz|"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("$MyNick foo"));
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("$Lock bar Pk=baz")
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decodes_adc_on_newline() {
        let mut codec = DelimitedCodec::new(Dialect::Adc);
        let mut buf = BytesMut::from(&b"CSUP ADBASE\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("CSUP ADBASE"));
    }

    #[test]
    fn incomplete_frame_yields_none_until_delimiter_arrives() {
        let mut codec = DelimitedCodec::new(Dialect::Adc);
        let mut buf = BytesMut::from(&b"CSUP ADB"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"ASE\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("CSUP ADBASE"));
    }

    #[test]
    fn oversized_frame_without_delimiter_is_an_error() {
        let mut codec = DelimitedCodec::with_max_len(Dialect::Adc, 8);
        let mut buf = BytesMut::from(&b"CSUP ADBASE"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::TooLong(8))
        ));
    }

    #[test]
    fn encode_appends_delimiter() {
        let mut codec = DelimitedCodec::new(Dialect::Nmdc);
        let mut buf = BytesMut::new();
        codec.encode("$MyNick foo".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"$MyNick foo|");
    }
}
