//! Relay line codec. Frames a byte stream into newline-terminated lines.
//!
//! Splits on `\n` (a preceding `\r` is dropped) and hands back the raw line
//! text. Decoding the line into a [`Command`](super::message::Command) is
//! left to the handler so the reader never blocks on protocol work.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default maximum line length (excluding the terminator).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Codec error: an oversized line, a non-UTF-8 line or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({0} bytes)")]
    LineTooLong(usize),
    #[error("line is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames relay lines on `\n` boundaries.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                if pos > self.max_length {
                    return Err(CodecError::LineTooLong(self.max_length));
                }

                let mut line_bytes = src.split_to(pos);
                src.advance(1); // skip \n
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.truncate(line_bytes.len() - 1);
                }

                let line = std::str::from_utf8(&line_bytes)?;
                Ok(Some(line.to_owned()))
            }
            None => {
                if src.len() > self.max_length {
                    return Err(CodecError::LineTooLong(self.max_length));
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
