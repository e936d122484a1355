//! Realtime endpoint WebSocket transport
//!
//! Encoded microphone chunks go out as binary messages, one chunk per
//! message. Binary messages from the endpoint are handed to the decode
//! worker untouched. Text messages belong to the AI protocol and are only
//! logged.
//!
//! # Retry Strategy
//!
//! The initial connection is attempted 3 times with exponential backoff
//! (1s, 2s). A mid-session disconnect ends `run`; the caller decides
//! whether to set up a new session.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::capture::EncodedChunk;
use crate::decode::DecoderInput;
use crate::error::TransportError;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum attempts for the initial connection
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry)
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

const INCOMING_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Why `run` returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportExit {
    /// The chunk channel closed (pipeline torn down).
    CaptureEnded,
    /// The decode worker stopped accepting frames.
    DecoderClosed,
    /// The caller's stop signal fired (Ctrl-C in the binary).
    Interrupted,
}

/// An open connection to the realtime endpoint.
pub struct RealtimeTransport {
    write: WsSink,
    incoming_rx: mpsc::Receiver<Vec<u8>>,
    receiver_task: tokio::task::JoinHandle<()>,
    url: String,
}

impl RealtimeTransport {
    /// Connect to `url`, retrying with backoff.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        install_crypto_provider();

        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                log::info!(
                    "Transport: retrying connection in {:?} (attempt {}/{})",
                    delay,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(delay).await;
            }

            match Self::try_connect(url).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    log::warn!("Transport: connection attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::ConnectionFailed("Max retries exceeded".to_string())
        }))
    }

    async fn try_connect(url: &str) -> Result<Self, TransportError> {
        let request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        log::info!("Transport: connecting to {}", url);

        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(request, None, true),
        )
        .await
        .map_err(|_| TransportError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (write, mut read) = ws_stream.split();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);

        let receiver_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Binary(data)) => {
                        if incoming_tx.send(data).await.is_err() {
                            log::debug!("Transport: incoming channel closed");
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        log::debug!("Transport: ignoring text message ({} bytes)", text.len());
                    }
                    Ok(Message::Close(frame)) => {
                        log::info!("Transport: closed by server ({:?})", frame);
                        break;
                    }
                    Err(e) => {
                        log::warn!("Transport: WebSocket error: {}", e);
                        break;
                    }
                    _ => {} // ping/pong handled by tungstenite
                }
            }
            log::debug!("Transport: receiver task exiting");
        });

        log::info!("Transport: connected");

        Ok(Self {
            write,
            incoming_rx,
            receiver_task,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one encoded chunk as a binary message.
    pub async fn send_chunk(&mut self, chunk: EncodedChunk) -> Result<(), TransportError> {
        self.write
            .send(Message::Binary(chunk.into_data()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Pump audio both ways until one side ends.
    ///
    /// Returns an error if the endpoint disconnects or a send fails.
    pub async fn run(
        &mut self,
        chunks: mpsc::Receiver<EncodedChunk>,
        decoder: DecoderInput,
    ) -> Result<TransportExit, TransportError> {
        self.run_until(chunks, decoder, std::future::pending::<()>())
            .await
    }

    /// Like [`run`](Self::run), but also returns `Interrupted` once `stop`
    /// completes.
    pub async fn run_until<S>(
        &mut self,
        mut chunks: mpsc::Receiver<EncodedChunk>,
        decoder: DecoderInput,
        stop: S,
    ) -> Result<TransportExit, TransportError>
    where
        S: Future<Output = ()>,
    {
        let mut sent = 0u64;
        let mut received = 0u64;
        tokio::pin!(stop);

        let exit = loop {
            tokio::select! {
                _ = &mut stop => break TransportExit::Interrupted,
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => {
                        self.send_chunk(chunk).await?;
                        sent += 1;
                    }
                    None => break TransportExit::CaptureEnded,
                },
                packet = self.incoming_rx.recv() => match packet {
                    Some(packet) => {
                        if decoder.send(packet).await.is_err() {
                            break TransportExit::DecoderClosed;
                        }
                        received += 1;
                    }
                    None => {
                        log::info!(
                            "Transport: endpoint disconnected after {} sent / {} received",
                            sent,
                            received
                        );
                        return Err(TransportError::Disconnected(
                            "Endpoint closed the connection".to_string(),
                        ));
                    }
                },
            }
        };

        log::info!(
            "Transport: stopped ({:?}) after {} sent / {} received",
            exit,
            sent,
            received
        );
        Ok(exit)
    }

    /// Send a close frame and stop the receiver.
    pub async fn disconnect(mut self) {
        log::info!("Transport: disconnecting");
        self.receiver_task.abort();
        if let Err(e) = self.write.close().await {
            log::warn!("Transport: error closing WebSocket: {}", e);
        }
    }
}

impl Drop for RealtimeTransport {
    fn drop(&mut self) {
        self.receiver_task.abort();
    }
}

/// rustls needs a process-wide provider before the first `wss://` handshake.
fn install_crypto_provider() {
    // Err means one is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecKind, EncodeEngine, Pcm16Encoder};
    use crate::decode::{DecodeWorker, DecoderConfig};
    use crate::graph::worklet::{port_channel, WorkletMessage};
    use crate::stats::PipelineStats;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    /// Local endpoint that echoes binary messages and sends one text message.
    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("{\"type\":\"session.created\"}".to_string()))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => {
                        if ws.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failure() {
        tokio::time::pause();
        let err = RealtimeTransport::connect("ws://127.0.0.1:9").await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_fails() {
        tokio::time::pause();
        let err = RealtimeTransport::connect("not a url").await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_chunks_round_trip_through_endpoint() {
        let url = echo_server().await;
        let mut transport = RealtimeTransport::connect(&url).await.unwrap();
        assert_eq!(transport.url(), url);

        let (port, mut worklet_rx) = port_channel();
        let (_mic_tx, mic_rx) = watch::channel(0.0);
        let mut worker = DecodeWorker::spawn(
            CodecKind::Pcm16.decoder().unwrap(),
            DecoderConfig::new(24000, 0),
            port,
            mic_rx,
            Arc::new(PipelineStats::new()),
        )
        .await
        .unwrap();

        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let packet = Pcm16Encoder.encode(&[0.5; 960]).unwrap();
        chunk_tx.send(EncodedChunk::new(packet, 0.02)).await.unwrap();

        let decoder = worker.input();
        let run = tokio::spawn(async move {
            let exit = transport.run(chunk_rx, decoder).await;
            transport.disconnect().await;
            exit
        });

        let WorkletMessage::Audio { frame, .. } = worklet_rx.recv().await.unwrap();
        assert_eq!(frame.len(), 960);
        assert!((frame[0] - 0.5).abs() < 1e-3);

        drop(chunk_tx);
        assert_eq!(run.await.unwrap().unwrap(), TransportExit::CaptureEnded);
        worker.close();
    }

    #[tokio::test]
    async fn test_stop_signal_reports_interrupted() {
        let url = echo_server().await;
        let mut transport = RealtimeTransport::connect(&url).await.unwrap();

        let (port, _worklet_rx) = port_channel();
        let (_mic_tx, mic_rx) = watch::channel(0.0);
        let mut worker = DecodeWorker::spawn(
            CodecKind::Pcm16.decoder().unwrap(),
            DecoderConfig::new(24000, 0),
            port,
            mic_rx,
            Arc::new(PipelineStats::new()),
        )
        .await
        .unwrap();

        // Sender stays open so only the stop signal can end the run
        let (_chunk_tx, chunk_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let decoder = worker.input();
        let run = tokio::spawn(async move {
            let exit = transport
                .run_until(chunk_rx, decoder, async {
                    let _ = stop_rx.await;
                })
                .await;
            transport.disconnect().await;
            exit
        });

        stop_tx.send(()).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, TransportExit::Interrupted);
        worker.close();
    }

    #[tokio::test]
    #[ignore] // Requires a running realtime endpoint on localhost:8000
    async fn test_local_endpoint() {
        let transport = RealtimeTransport::connect("ws://localhost:8000").await;
        assert!(transport.is_ok(), "Connection failed: {:?}", transport.err());
        transport.unwrap().disconnect().await;
    }
}
