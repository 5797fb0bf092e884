//! Bidirectional framed transport over the worker's stdio pipes.
//!
//! The write half serializes one JSON message per Content-Length frame (see
//! [`drover_protocol::framing`]) and flushes after every message. The read
//! half is a pump: it decodes frames off the stream and forwards them, along
//! with end-of-stream and corruption notices, through an unbounded channel
//! to whoever owns the [`StreamEvent`] receiver. The pump never interprets
//! message contents; classification happens in the connection layer.

use std::future::Future;
use std::pin::Pin;

use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use drover_protocol::framing::{self, FramingError};

use crate::error::Result;

/// Something the read pump observed on the byte stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// One decoded message.
    Frame(Value),
    /// The stream produced bytes that do not frame correctly. All buffered
    /// input was discarded; decoding resumes with whatever arrives next.
    Corrupt(FramingError),
    /// The stream ended, cleanly or not. No further events will follow.
    Closed { reason: String },
}

/// Write half of the transport.
pub trait Transport: Send {
    /// Frame and write one message, flushing before returning.
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Read half of the transport. `run` pumps the stream until it ends.
pub trait TransportReceiver: Send {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Both halves plus the event channel, ready to hand to a connection.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub event_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Framed transport over a pair of byte streams, usually the worker child's
/// stdin and stdout.
pub struct PipeTransport<W, R> {
    stdin: W,
    stdout: R,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl<W, R> PipeTransport<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wrap the worker's pipes. Returns the transport and the receiver for
    /// decoded traffic.
    pub fn new(stdin: W, stdout: R) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            PipeTransport {
                stdin,
                stdout,
                event_tx,
            },
            event_rx,
        )
    }

    /// Split into boxed halves for a connection to own.
    pub fn into_transport_parts(
        self,
        event_rx: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> TransportParts {
        TransportParts {
            sender: Box::new(PipeSender {
                stdin: self.stdin,
                buf: BytesMut::new(),
            }),
            receiver: Box::new(PipeReceiver {
                stdout: self.stdout,
                event_tx: self.event_tx,
            }),
            event_rx,
        }
    }

    /// Run the read pump directly, discarding the write half. Useful when
    /// only inbound traffic matters.
    pub async fn run(self) -> Result<()> {
        let receiver = PipeReceiver {
            stdout: self.stdout,
            event_tx: self.event_tx,
        };
        receiver.pump().await
    }
}

struct PipeSender<W> {
    stdin: W,
    buf: BytesMut,
}

impl<W> Transport for PipeSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let body = serde_json::to_vec(&message)?;
            self.buf.clear();
            framing::encode_frame(&body, &mut self.buf);
            self.stdin.write_all(&self.buf).await?;
            self.stdin.flush().await?;
            Ok(())
        })
    }
}

struct PipeReceiver<R> {
    stdout: R,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl<R> PipeReceiver<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn pump(mut self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            // Drain every complete frame already buffered before reading more.
            loop {
                match framing::decode_frame(&mut buf, framing::MAX_FRAME_BYTES) {
                    Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                        Ok(value) => {
                            if self.event_tx.send(StreamEvent::Frame(value)).is_err() {
                                // Nobody is listening anymore; stop pumping.
                                return Ok(());
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "discarding frame with unparseable JSON body");
                        }
                    },
                    Ok(None) => break,
                    Err(error) => {
                        tracing::error!(
                            %error,
                            discarded = buf.len(),
                            "framing error; discarding buffered input"
                        );
                        buf.clear();
                        let _ = self.event_tx.send(StreamEvent::Corrupt(error));
                    }
                }
            }

            match self.stdout.read_buf(&mut buf).await {
                Ok(0) => {
                    let _ = self.event_tx.send(StreamEvent::Closed {
                        reason: "worker closed its output stream".to_string(),
                    });
                    return Ok(());
                }
                Ok(_) => {}
                Err(error) => {
                    let _ = self.event_tx.send(StreamEvent::Closed {
                        reason: format!("read failed: {error}"),
                    });
                    return Err(error.into());
                }
            }
        }
    }
}

impl<R> TransportReceiver for PipeReceiver<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(self.pump())
    }
}
