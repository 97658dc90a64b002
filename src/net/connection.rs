//! Framed Connection
//!
//! Reader and writer halves of one peer link. The writer owns the ordered
//! outbound channel of a session; the reader hands each decoded frame to the
//! owning side's handler.

use crate::error::Result;
use crate::protocol::{decode_frame, encode_frame, frame_codec, Frame};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Why the reader stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The peer closed the stream
    Eof,
    Cancelled,
}

/// Decode frames until EOF or cancellation, awaiting the handler for each
/// frame before reading the next. A handler error ends the loop and is
/// returned.
pub async fn read_frames<R, M, F, Fut>(
    reader: R,
    token: CancellationToken,
    mut on_frame: F,
) -> Result<ReadEnd>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
    F: FnMut(Frame<M>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut frames = FramedRead::new(reader, frame_codec());
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(ReadEnd::Cancelled),
            next = frames.next() => match next {
                Some(Ok(bytes)) => {
                    trace!("Read frame of {} bytes", bytes.len());
                    on_frame(decode_frame(&bytes)?).await?;
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(ReadEnd::Eof),
            },
        }
    }
}

/// Write queued frames in channel order. On cancellation the frames already
/// queued are still written before the stream is shut down.
pub async fn write_frames<W, M>(
    writer: W,
    mut outbound: mpsc::UnboundedReceiver<Frame<M>>,
    token: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let mut sink = FramedWrite::new(writer, frame_codec());
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => sink.send(encode_frame(&frame)?).await?,
                None => break,
            },
            _ = token.cancelled() => {
                while let Ok(frame) = outbound.try_recv() {
                    sink.feed(encode_frame(&frame)?).await?;
                }
                break;
            }
        }
    }
    SinkExt::<Bytes>::close(&mut sink).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeName;
    use crate::error::Error;
    use crate::protocol::{ControllerMessage, SatelliteMessage};
    use assert_matches::assert_matches;
    use std::future::ready;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_frames_cross_the_link_in_order() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        for _ in 0..3 {
            tx.send(Frame::oneway(ControllerMessage::Ping)).unwrap();
        }
        tx.send(Frame::call(9, ControllerMessage::Ping)).unwrap();
        drop(tx);
        write_frames(client, rx, token.clone()).await.unwrap();

        let mut seen = Vec::new();
        let end = read_frames(server, token, |frame: Frame<ControllerMessage>| {
            seen.push(frame.kind);
            ready(Ok(()))
        })
        .await
        .unwrap();

        assert_eq!(end, ReadEnd::Eof);
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[3], crate::protocol::FrameKind::Call(9));
    }

    #[tokio::test]
    async fn test_cancelled_writer_flushes_queue() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        tx.send(Frame::oneway(SatelliteMessage::Pong)).unwrap();
        tx.send(Frame::oneway(SatelliteMessage::ChangedAck)).unwrap();
        token.cancel();
        write_frames(client, rx, token).await.unwrap();

        let mut count = 0;
        read_frames(server, CancellationToken::new(), |_: Frame<SatelliteMessage>| {
            count += 1;
            ready(Ok(()))
        })
        .await
        .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_handler_error_ends_reader() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Frame::oneway(SatelliteMessage::Pong)).unwrap();
        drop(tx);
        write_frames(client, rx, CancellationToken::new()).await.unwrap();

        let result = read_frames(server, CancellationToken::new(), |_: Frame<SatelliteMessage>| {
            ready(Err(Error::PeerNotConnected {
                node: NodeName::new("node-a").to_string(),
            }))
        })
        .await;
        assert_matches!(result, Err(Error::PeerNotConnected { .. }));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_invalid_payload() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(&[0, 0, 0, 3, b'x', b'y', b'z']).await.unwrap();
        drop(client);

        let result = read_frames(server, CancellationToken::new(), |_: Frame<SatelliteMessage>| {
            ready(Ok(()))
        })
        .await;
        assert_matches!(result, Err(Error::InvalidPayload(_)));
    }
}
