use agentbox_types::{AttachClientFrame, AttachServerFrame};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::platform::ExecSession;

/// Chunk size for copying pod output onto the socket.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Bridge one WebSocket to one live exec session. JSON frames in
/// (`{"type":"stdin","data":…}`), JSON frames out (`stdout`/`stderr`/`exit`).
/// Both directions tear down as soon as either the socket or the pod exec
/// stream closes.
pub async fn serve(socket: WebSocket, session: ExecSession) {
    let ExecSession {
        stdin,
        stdout,
        stderr,
        status,
    } = session;
    let (sender, mut receiver) = socket.split();
    let cancel = CancellationToken::new();
    let (frame_tx, frame_rx) = mpsc::channel::<AttachServerFrame>(64);

    tokio::spawn(sender_main(sender, frame_rx, cancel.clone()));

    if let Some(reader) = stdout {
        tokio::spawn(pump_output(reader, frame_tx.clone(), cancel.clone(), false));
    }
    if let Some(reader) = stderr {
        tokio::spawn(pump_output(reader, frame_tx.clone(), cancel.clone(), true));
    }

    // Exit watcher: one final frame with the exit code, then teardown.
    tokio::spawn({
        let frame_tx = frame_tx.clone();
        let cancel = cancel.clone();
        async move {
            let exit_code = status.await;
            let _ = frame_tx
                .send(AttachServerFrame::Exit { exit_code })
                .await;
            cancel.cancel();
        }
    });

    tracing::debug!("attach session established");
    let mut stdin = stdin;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<AttachClientFrame>(&text) {
                        Ok(AttachClientFrame::Stdin { data }) => {
                            let Some(writer) = stdin.as_mut() else { continue };
                            if writer.write_all(data.as_bytes()).await.is_err() {
                                break;
                            }
                            let _ = writer.flush().await;
                        }
                        Err(e) => {
                            tracing::debug!("ignoring malformed attach frame: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong frames carry nothing here
                Some(Err(e)) => {
                    tracing::error!("websocket error: {}", e);
                    break;
                }
            }
        }
    }
    cancel.cancel();
    tracing::debug!("attach session closed");
}

async fn sender_main(
    mut sender: SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<AttachServerFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Drain anything already queued (the exit frame in particular).
                while let Ok(frame) = frame_rx.try_recv() {
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = sender.close().await;
}

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &AttachServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).expect("attach frames serialise");
    sender.send(Message::Text(text.into())).await
}

/// Copy one pod output stream onto the frame channel until EOF.
async fn pump_output<R>(
    mut reader: R,
    frame_tx: mpsc::Sender<AttachServerFrame>,
    cancel: CancellationToken,
    is_stderr: bool,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let data = String::from_utf8_lossy(&buf[..n]).into_owned();
                    let frame = if is_stderr {
                        AttachServerFrame::Stderr { data }
                    } else {
                        AttachServerFrame::Stdout { data }
                    };
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
