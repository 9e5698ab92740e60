//! Frame transports for a kernel session.
//!
//! A [`KernelTransport`] is a pair of a frame sink and a frame stream.
//! [`connect_websocket`] builds one over `tokio-tungstenite`;
//! [`memory_pair`] builds an in-process one whose other end is a
//! [`MemoryBackend`], used by the loopback kernel and in tests.

use std::pin::Pin;

use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::KernelError;
use crate::messages::{parse_frame, KernelFrame};

pub type FrameSink = Pin<Box<dyn Sink<KernelFrame, Error = KernelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<KernelFrame, KernelError>> + Send>>;

/// Both directions of a kernel connection.
pub struct KernelTransport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Connect to a kernel's WebSocket endpoint.
///
/// Text frames are decoded with [`parse_frame`]; malformed frames are logged
/// and skipped. Binary, ping and pong frames are ignored. The stream ends
/// after the peer's close frame.
pub async fn connect_websocket(ws_url: &str) -> Result<KernelTransport, KernelError> {
    let (ws_stream, _response) = connect_async(ws_url).await.map_err(|e| {
        KernelError::NoBackend(format!("Failed to connect to kernel at {ws_url}: {e}"))
    })?;

    tracing::info!(url = %ws_url, "Connected to kernel WebSocket");

    let (ws_sink, ws_source) = ws_stream.split();

    let sink = ws_sink.with(|frame: KernelFrame| async move {
        let text = frame
            .to_text()
            .map_err(|e| KernelError::Protocol(format!("Failed to encode frame: {e}")))?;
        Ok::<Message, KernelError>(Message::Text(text))
    });

    let stream = ws_source.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => match parse_frame(&text) {
                Ok(frame) => Some(Ok(frame)),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Failed to parse kernel frame",
                    );
                    None
                }
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "Kernel WebSocket closed");
                None
            }
            Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                None
            }
            Err(e) => Some(Err(KernelError::from(e))),
        }
    });

    Ok(KernelTransport {
        sink: Box::pin(sink),
        stream: Box::pin(stream),
    })
}

/// The kernel side of an in-memory transport.
pub struct MemoryBackend {
    /// Frames sent by the client.
    pub from_client: mpsc::UnboundedReceiver<KernelFrame>,
    /// Frames delivered to the client. Dropping this ends the client's
    /// stream, which the session treats as a disconnect.
    pub to_client: mpsc::UnboundedSender<KernelFrame>,
}

impl MemoryBackend {
    /// Deliver a frame to the client.
    pub fn send(&self, frame: KernelFrame) -> Result<(), KernelError> {
        self.to_client
            .unbounded_send(frame)
            .map_err(|e| KernelError::Transport(e.to_string()))
    }

    /// Wait for the next frame from the client.
    pub async fn recv(&mut self) -> Option<KernelFrame> {
        self.from_client.next().await
    }
}

/// Build a connected in-memory transport.
pub fn memory_pair() -> (KernelTransport, MemoryBackend) {
    let (client_tx, from_client) = mpsc::unbounded();
    let (to_client, client_rx) = mpsc::unbounded();

    let sink = client_tx.sink_map_err(|e| KernelError::Transport(e.to_string()));
    let stream = client_rx.map(Ok::<KernelFrame, KernelError>);

    (
        KernelTransport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        },
        MemoryBackend {
            from_client,
            to_client,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_carries_frames_both_ways() {
        let (mut transport, mut backend) = memory_pair();

        transport
            .sink
            .send(KernelFrame::comm_open("c1", "target"))
            .await
            .unwrap();
        let received = backend.recv().await.unwrap();
        assert_eq!(received.comm_id(), "c1");

        backend
            .send(KernelFrame::comm_msg("c1", serde_json::json!({"result": 2})))
            .unwrap();
        let reply = transport.stream.next().await.unwrap().unwrap();
        assert_eq!(reply.msg_type(), "comm_msg");
    }

    #[tokio::test]
    async fn dropping_backend_ends_client_stream() {
        let (mut transport, backend) = memory_pair();
        drop(backend);
        assert!(transport.stream.next().await.is_none());
    }

    #[tokio::test]
    async fn connect_to_unreachable_kernel_is_no_backend() {
        let result = connect_websocket("ws://127.0.0.1:1/kernel").await;
        assert!(matches!(result, Err(KernelError::NoBackend(_))));
    }
}
