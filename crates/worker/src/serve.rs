//! The worker's serving loop.
//!
//! [`serve`] speaks Content-Length frames over any byte pair; [`serve_stdio`]
//! binds it to the process pipes the client's supervisor sets up. The loop:
//!
//! 1. announces readiness with the handshake frame,
//! 2. decodes inbound frames and spawns one task per command, so a slow
//!    handler never stalls the stream,
//! 3. funnels dispatcher output through a single writer task,
//! 4. leaves when the exit command fires the shutdown signal or the stream
//!    ends, sweeping whatever the client left behind.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use drover_protocol::framing::{self, MAX_FRAME_BYTES};
use drover_protocol::{Inbound, ready_frame};

use crate::coordinator::DEFAULT_CONTINUATION_CEILING;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;

/// Tunables for one serving session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServeOptions {
    /// How long a suspended operation waits for `callback.continue` before
    /// falling back to its default.
    pub continuation_ceiling: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            continuation_ceiling: DEFAULT_CONTINUATION_CEILING,
        }
    }
}

/// Serve the worker protocol over an arbitrary byte pair until the client
/// says exit or the stream ends.
pub async fn serve<R, W>(
    engine: Arc<dyn Engine>,
    reader: R,
    writer: W,
    options: ServeOptions,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (dispatcher, notice_rx) = Dispatcher::new(
        engine,
        out_tx.clone(),
        shutdown_tx,
        options.continuation_ceiling,
    );

    let writer_handle = tokio::spawn(write_frames(writer, out_rx));
    let notice_handle = tokio::spawn(Arc::clone(&dispatcher).run_notices(notice_rx));

    // The client blocks on this before sending anything.
    let _ = out_tx.send(ready_frame());
    tracing::debug!("worker ready");

    let mut reader = reader;
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        // Drain every complete frame already buffered before reading more.
        loop {
            match framing::decode_frame(&mut buf, MAX_FRAME_BYTES) {
                Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                    Ok(value) => dispatch_frame(&dispatcher, value),
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
                }
            }
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::debug!("exit requested; leaving serve loop");
                    break;
                }
            }
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        tracing::debug!("command stream closed by the client");
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::error!(%error, "command stream read failed");
                        break;
                    }
                }
            }
        }
    }

    // Sweep whatever is still open; after a clean exit this finds nothing.
    dispatcher.shutdown_cleanup().await;
    notice_handle.abort();
    drop(dispatcher);
    drop(out_tx);
    // The writer drains queued frames (the exit reply among them) and ends
    // once every sender is gone.
    if tokio::time::timeout(Duration::from_secs(2), writer_handle)
        .await
        .is_err()
    {
        tracing::warn!("frame writer did not drain in time");
    }
    Ok(())
}

/// Serve on the process's own stdin and stdout. Blocks until the session
/// ends.
pub async fn serve_stdio(engine: Arc<dyn Engine>, options: ServeOptions) -> io::Result<()> {
    serve(engine, tokio::io::stdin(), tokio::io::stdout(), options).await
}

fn dispatch_frame(dispatcher: &Arc<Dispatcher>, value: Value) {
    match Inbound::classify(value) {
        Inbound::Command(command) => {
            let dispatcher = Arc::clone(dispatcher);
            tokio::spawn(async move {
                dispatcher.dispatch(command).await;
            });
        }
        Inbound::Response(_) | Inbound::Event(_) | Inbound::Ready { .. } => {
            // Those travel worker-to-client; one coming back is a confused
            // peer, not a fault.
            tracing::debug!("ignoring non-command frame from the client");
        }
        Inbound::Unknown(value) => {
            tracing::debug!(%value, "ignoring frame with no recognizable shape");
        }
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    while let Some(frame) = frames.recv().await {
        let body = match serde_json::to_vec(&frame) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(%error, "dropping unserializable frame");
                continue;
            }
        };
        buf.clear();
        framing::encode_frame(&body, &mut buf);
        if let Err(error) = writer.write_all(&buf).await {
            tracing::error!(%error, "frame write failed; stopping writer");
            break;
        }
        if let Err(error) = writer.flush().await {
            tracing::error!(%error, "frame flush failed; stopping writer");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCall, MockEngine};
    use serde_json::json;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    struct ClientEnd {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        buf: BytesMut,
    }

    impl ClientEnd {
        async fn send(&mut self, message: Value) {
            let body = serde_json::to_vec(&message).unwrap();
            let mut framed = BytesMut::new();
            framing::encode_frame(&body, &mut framed);
            self.writer.write_all(&framed).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let frame = async {
                loop {
                    if let Some(body) =
                        framing::decode_frame(&mut self.buf, MAX_FRAME_BYTES).unwrap()
                    {
                        return serde_json::from_slice(&body).unwrap();
                    }
                    let n = self.reader.read_buf(&mut self.buf).await.unwrap();
                    assert!(n > 0, "stream ended while waiting for a frame");
                }
            };
            tokio::time::timeout(Duration::from_secs(2), frame)
                .await
                .expect("timed out waiting for a frame")
        }
    }

    fn start_worker(engine: &MockEngine) -> (ClientEnd, JoinHandle<io::Result<()>>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);

        let handle = tokio::spawn(serve(
            Arc::new(engine.clone()),
            server_read,
            server_write,
            ServeOptions::default(),
        ));
        (
            ClientEnd {
                reader: client_read,
                writer: client_write,
                buf: BytesMut::new(),
            },
            handle,
        )
    }

    #[tokio::test]
    async fn ready_frame_leads_the_stream() {
        let engine = MockEngine::new();
        let (mut client, _handle) = start_worker(&engine);

        let first = client.recv().await;
        assert_eq!(first["type"], "ready");
    }

    #[tokio::test]
    async fn exit_gets_answered_before_the_loop_stops() {
        let engine = MockEngine::new();
        let (mut client, handle) = start_worker(&engine);
        assert_eq!(client.recv().await["type"], "ready");

        client.send(json!({ "action": "launch", "requestId": 1 })).await;
        assert_eq!(client.recv().await["browserId"], "browser_1");

        client.send(json!({ "action": "exit", "requestId": 2 })).await;
        let reply = client.recv().await;
        assert_eq!(reply["requestId"], 2);
        assert!(reply["error"].is_null());

        handle.await.unwrap().unwrap();
        assert!(engine.calls().contains(&MockCall::CloseBrowser));
    }

    #[tokio::test]
    async fn client_disappearing_sweeps_open_resources() {
        let engine = MockEngine::new();
        let (mut client, handle) = start_worker(&engine);
        assert_eq!(client.recv().await["type"], "ready");

        client.send(json!({ "action": "launch", "requestId": 1 })).await;
        assert_eq!(client.recv().await["browserId"], "browser_1");

        drop(client);
        handle.await.unwrap().unwrap();
        assert!(engine.calls().contains(&MockCall::CloseBrowser));
    }

    #[tokio::test]
    async fn framing_garbage_does_not_kill_the_session() {
        let engine = MockEngine::new();
        let (mut client, _handle) = start_worker(&engine);
        assert_eq!(client.recv().await["type"], "ready");

        client
            .writer
            .write_all(b"Content-Length: nope\r\n\r\n")
            .await
            .unwrap();
        client.writer.flush().await.unwrap();
        // Give the loop a beat to discard the buffered garbage before the
        // next well-formed frame lands.
        tokio::time::sleep(Duration::from_millis(200)).await;

        client.send(json!({ "action": "launch", "requestId": 1 })).await;
        assert_eq!(client.recv().await["browserId"], "browser_1");
    }
}
