//! Line codec for control channel streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! misbehaving peer cannot make the reader allocate without bound. Each
//! newline-terminated UTF-8 line carries exactly one [`Message`].
//!
//! [`Message`]: crate::channel::message::Message

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted by the decoder: 16 MiB.
///
/// Replies may carry page payloads, so the limit is generous; lines beyond it
/// are rejected with [`AppError::Channel`]`("line too long: …")`.
pub const MAX_LINE_BYTES: usize = 16 * 1_048_576;

/// Newline-delimited JSON codec for the control channel.
#[derive(Debug)]
pub struct ChannelCodec(LinesCodec);

impl ChannelCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for ChannelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChannelCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for ChannelCodec {
    type Error = AppError;

    /// Encode `item` as a `\n`-terminated line. The length limit only
    /// applies when decoding.
    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Channel(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
