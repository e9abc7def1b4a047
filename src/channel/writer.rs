//! Control channel writer task.
//!
//! Receives outbound [`Message`]s from an unbounded queue so that `emit`
//! never blocks, frames each one with [`ChannelCodec`], and writes it to the
//! peer. A failed write closes the channel; callers observe it through their
//! pending calls rather than at the emit site.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::codec::ChannelCodec;
use crate::channel::message::Message;
use crate::channel::Shared;

pub(crate) async fn run_writer<W>(
    shared: Arc<Shared>,
    writer: W,
    mut msg_rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    let label = shared.label.clone();
    let mut writer = writer;
    let mut codec = ChannelCodec::new();
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(channel = %label, "channel writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(message) = msg else {
                    debug!(channel = %label, "channel writer: message queue closed, stopping");
                    break;
                };

                let line = match message.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(channel = %label, event = %message.event, error = %e, "channel writer: dropping unserialisable message");
                        continue;
                    }
                };

                buf.clear();
                if let Err(e) = codec.encode(line, &mut buf) {
                    warn!(channel = %label, error = %e, "channel writer: framing failed");
                    continue;
                }

                let written = match writer.write_all(&buf).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };

                if let Err(e) = written {
                    warn!(channel = %label, error = %e, "channel writer: write failed");
                    shared.close(&format!("write failed: {e}"));
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}
