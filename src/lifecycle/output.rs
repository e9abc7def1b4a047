//! Line-buffered log sinks for child process output.
//!
//! A sink keeps reading until EOF whatever the child prints. Closing the
//! read end early would turn the child's next write into `SIGPIPE`.

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::{debug, warn};

/// Longest output line forwarded whole; longer lines are skipped.
const MAX_OUTPUT_LINE: usize = 64 * 1024;

/// One framed piece of child output.
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputChunk {
    /// A line, lossily decoded, without its terminator.
    Line(String),
    /// A line over [`MAX_OUTPUT_LINE`] that was discarded.
    Oversize,
}

/// Newline framing that never fails on content: invalid UTF-8 is replaced
/// and oversize lines are reported and skipped.
#[derive(Debug)]
struct OutputCodec(AnyDelimiterCodec);

impl OutputCodec {
    fn new() -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            b"\n".to_vec(),
            MAX_OUTPUT_LINE,
        ))
    }
}

impl Decoder for OutputCodec {
    type Item = OutputChunk;
    type Error = AnyDelimiterCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OutputChunk>, Self::Error> {
        to_chunk(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<OutputChunk>, Self::Error> {
        to_chunk(self.0.decode_eof(src))
    }
}

fn to_chunk(
    decoded: Result<Option<Bytes>, AnyDelimiterCodecError>,
) -> Result<Option<OutputChunk>, AnyDelimiterCodecError> {
    match decoded {
        Ok(line) => Ok(line.map(|bytes| {
            let text = String::from_utf8_lossy(&bytes);
            OutputChunk::Line(text.trim_end_matches('\r').to_owned())
        })),
        Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(OutputChunk::Oversize)),
        Err(err) => Err(err),
    }
}

/// Forward every line of `reader` to the log at `DEBUG`, tagged with the
/// producing process (`source`) and stream name.
///
/// The task ends at EOF or on a read error.
pub fn pipe_lines<R>(source: &'static str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, OutputCodec::new());
        while let Some(item) = lines.next().await {
            match item {
                Ok(OutputChunk::Line(line)) => debug!(source, stream, "{line}"),
                Ok(OutputChunk::Oversize) => {
                    warn!(source, stream, limit = MAX_OUTPUT_LINE, "oversize output line skipped");
                }
                Err(err) => {
                    warn!(source, stream, %err, "output sink stopped");
                    break;
                }
            }
        }
    });
}
