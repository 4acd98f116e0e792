//! # TCP Transport Adapter
//!
//! Frames [`WireMessage`]s over a `tokio` TCP stream. The write half
//! implements the [`MessageSink`] port; the read half is driven by
//! [`read_message`], which the runtime loops on per session.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::codec::{
    decode_frame_header, decode_payload, encode_message, FRAME_HEADER_SIZE,
};
use crate::domain::errors::ProtocolError;
use crate::domain::message::WireMessage;
use crate::ports::outbound::MessageSink;

/// Write half of a framed TCP connection.
pub struct TcpMessageSink {
    magic: [u8; 4],
    writer: Mutex<Option<OwnedWriteHalf>>,
}

/// Read half of a framed TCP connection.
pub struct TcpMessageSource {
    magic: [u8; 4],
    reader: OwnedReadHalf,
}

/// Split a connected stream into the sink/source pair for one session.
pub fn split(magic: [u8; 4], stream: TcpStream) -> (Arc<TcpMessageSink>, TcpMessageSource) {
    let (reader, writer) = stream.into_split();
    (
        Arc::new(TcpMessageSink {
            magic,
            writer: Mutex::new(Some(writer)),
        }),
        TcpMessageSource { magic, reader },
    )
}

impl TcpMessageSource {
    /// Read one complete frame and decode it.
    ///
    /// Errors map to [`ProtocolError::Transport`] for I/O trouble and the
    /// codec's own errors for protocol trouble; both end the session.
    pub async fn read_message(&mut self) -> Result<WireMessage, ProtocolError> {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        self.reader
            .read_exact(&mut header_bytes)
            .await
            .map_err(io_error)?;
        let header = decode_frame_header(self.magic, &header_bytes)?;

        let mut payload = vec![0u8; header.length as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(io_error)?;

        let message = decode_payload(&header.command, &payload, header.checksum)?;
        debug!(command = %header.command, bytes = header.length, "Frame received");
        Ok(message)
    }
}

#[async_trait]
impl MessageSink for TcpMessageSink {
    async fn send(&self, message: WireMessage) -> Result<(), ProtocolError> {
        let frame = encode_message(self.magic, &message);
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ProtocolError::Transport {
                message: "connection already closed".to_string(),
            });
        };
        writer.write_all(&frame).await.map_err(io_error)?;
        debug!(command = message.command(), bytes = frame.len(), "Frame sent");
        Ok(())
    }

    async fn close(&self) {
        // Dropping the write half closes our direction; the read loop
        // observes EOF and unwinds.
        let _ = self.writer.lock().await.take();
    }
}

fn io_error(err: std::io::Error) -> ProtocolError {
    ProtocolError::Transport {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::NetworkParams;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frames_cross_a_socket() {
        let magic = NetworkParams::regtest().magic;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (_sink, mut source) = split(magic, stream);
            source.read_message().await.unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (sink, _source) = split(magic, stream);
        sink.send(WireMessage::Ping { nonce: 99 }).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, WireMessage::Ping { nonce: 99 });
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let magic = NetworkParams::regtest().magic;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (sink, _source) = split(magic, stream);
        sink.close().await;

        let err = sink.send(WireMessage::Verack).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Transport { .. }));
        drop(accept);
    }
}
