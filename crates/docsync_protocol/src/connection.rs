//! Framed message connection over any byte stream.
//!
//! A [`Connection`] owns the write half of a stream and a background task
//! that reads frames from the read half into a channel. Receiving is
//! therefore cancel-safe and can sit in a `tokio::select!` next to change
//! notifications and shutdown signals.

use crate::codec::{read_frame, write_frame};
use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Message;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A bidirectional byte stream usable as a replication transport.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Boxed transport stream (TCP, TLS or in-process pipe).
pub type BoxStream = Box<dyn Stream>;

/// Number of decoded frames buffered ahead of the consumer.
const INCOMING_BUFFER: usize = 64;

/// A message connection to a replication peer.
pub struct Connection {
    writer: WriteHalf<BoxStream>,
    incoming: mpsc::Receiver<ProtocolResult<Message>>,
    reader: JoinHandle<()>,
    peer: String,
}

impl Connection {
    /// Wraps a stream. Must be called within a tokio runtime.
    pub fn new(stream: BoxStream, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        let (mut read_half, writer) = tokio::io::split(stream);
        let (tx, incoming) = mpsc::channel(INCOMING_BUFFER);

        let reader_peer = peer.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = read_frame(&mut read_half).await;
                let done = !matches!(frame, Ok(Some(_)));
                let item = match frame {
                    Ok(Some(message)) => Ok(message),
                    Ok(None) => Err(ProtocolError::ConnectionClosed),
                    Err(e) => Err(e),
                };
                if tx.send(item).await.is_err() || done {
                    break;
                }
            }
            tracing::trace!(peer = %reader_peer, "connection reader finished");
        });

        Self {
            writer,
            incoming,
            reader,
            peer,
        }
    }

    /// Returns the peer description given at construction.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Sends a message.
    pub async fn send(&mut self, message: &Message) -> ProtocolResult<()> {
        tracing::trace!(peer = %self.peer, kind = message.kind(), "send");
        write_frame(&mut self.writer, message).await
    }

    /// Receives the next message. Cancel-safe.
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] once the peer has closed
    /// the stream.
    pub async fn recv(&mut self) -> ProtocolResult<Message> {
        match self.incoming.recv().await {
            Some(Ok(message)) => {
                tracing::trace!(peer = %self.peer, kind = message.kind(), "recv");
                Ok(message)
            }
            Some(Err(e)) => Err(e),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Shuts down the write side, signalling end of stream to the peer.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
