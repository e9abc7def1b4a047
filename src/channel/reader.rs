//! Control channel reader task.
//!
//! Drives a [`FramedRead`] over the peer's read half with [`ChannelCodec`],
//! parses each line into a [`Message`], and hands it to the channel's
//! dispatch table. Malformed lines are logged and skipped; EOF or an I/O
//! error closes the channel, which fails every pending call and wait.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::codec::ChannelCodec;
use crate::channel::message::Message;
use crate::channel::Shared;
use crate::AppError;

pub(crate) async fn run_reader<R>(shared: Arc<Shared>, reader: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let label = shared.label.clone();
    let mut framed = FramedRead::new(reader, ChannelCodec::new());

    let reason = loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(channel = %label, "channel reader: cancellation received, stopping");
                break "channel closed".to_owned();
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(channel = %label, "channel reader: EOF detected");
                        break "channel closed by peer".to_owned();
                    }

                    Some(Err(AppError::Channel(ref msg))) => {
                        warn!(channel = %label, error = msg.as_str(), "channel reader: framing error, skipping");
                    }

                    Some(Err(e)) => {
                        warn!(channel = %label, error = %e, "channel reader: IO error, stopping");
                        break format!("channel stream error: {e}");
                    }

                    Some(Ok(line)) => match Message::parse(&line) {
                        Ok(Some(message)) => shared.deliver(message),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(channel = %label, error = %e, raw_line = %line, "channel reader: parse error, skipping line");
                        }
                    },
                }
            }
        }
    };

    shared.close(&reason);
    cancel.cancel();
}
