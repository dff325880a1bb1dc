use std::io;

use bytes::{Buf, BytesMut};
use proto::{Message, format, parse};
use tokio_util::codec::{Decoder, Encoder};

pub type ParseResult<T = Message, E = parse::Error> = std::result::Result<T, E>;

/// Maximum line length including the line terminator, allowing for IRCv3
/// message tags on top of the classic 512 byte limit.
pub const MAX_LINE_LENGTH: usize = 8191;

/// Frames a byte stream into IRC lines.
///
/// Each decoded item is the parse result of a single line, so a malformed
/// line never terminates the stream. Lines longer than [`MAX_LINE_LENGTH`]
/// are discarded.
#[derive(Debug, Default)]
pub struct Codec {
    skipping: bool,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn line_end(src: &BytesMut) -> Option<(usize, usize)> {
    src.iter().position(|b| *b == b'\n').map(|i| {
        if i > 0 && src[i - 1] == b'\r' {
            (i - 1, i + 1)
        } else {
            (i, i + 1)
        }
    })
}

impl Decoder for Codec {
    type Item = ParseResult;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some((content, end)) = line_end(src) else {
                if src.len() > MAX_LINE_LENGTH {
                    log::warn!("discarding oversized line ({} bytes so far)", src.len());
                    src.clear();
                    self.skipping = true;
                }
                return Ok(None);
            };

            if self.skipping || content > MAX_LINE_LENGTH {
                log::warn!("discarded oversized line tail ({end} bytes)");
                src.advance(end);
                self.skipping = false;
                continue;
            }

            if content == 0 {
                src.advance(end);
                continue;
            }

            let message = parse::line(&src[..content]);
            src.advance(end);

            return Ok(Some(message));
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = format::message(message);

        dst.extend(encoded.into_bytes());

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
}
