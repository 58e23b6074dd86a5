use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant};
use uuid::Uuid;

use crate::chat::ingest::MessageIngest;
use crate::state::AppState;

/// Server-side ping schedule. A connection whose pong does not arrive within
/// `pong_timeout` of a ping is closed and removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

/// Run one upgraded WebSocket connection until it closes.
///
/// Splits the socket into reader and writer halves:
/// - Writer task: owns the sink, drains the connection's bounded queue
/// - Reader loop: feeds inbound frames to [`MessageIngest`]
///
/// The queue sender is what the registry holds, so broadcasts never touch the
/// socket directly.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::now_v7();
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(state.outbound_queue.max(1));

    state.connections.add(connection_id, tx.clone());
    tracing::info!(
        connection_id = %connection_id,
        connections = state.connections.len(),
        "WebSocket connection opened"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // The ping task only ends when the peer is gone: either the writer died
    // or a pong never came back. The reader loop treats that as a close.
    let keepalive = state.keepalive;
    let ping_tx = tx.clone();
    let mut ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(keepalive.interval);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx
                .send(Message::Ping(vec![1, 2, 3, 4].into()))
                .await
                .is_err()
            {
                break;
            }

            match timeout(keepalive.pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!(connection_id = %connection_id, "Pong timeout, closing connection");
                    let _ = ping_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "Pong timeout".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut ingest = MessageIngest::new(connection_id, tx.clone(), state.clone());
    let idle_timeout = state.idle_timeout;
    let mut idle_deadline = idle_timeout.map(|d| Instant::now() + d);

    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut ping_handle => {
                tracing::info!(connection_id = %connection_id, "Keepalive failed, dropping connection");
                break;
            }
            _ = idle_elapsed(idle_deadline) => {
                tracing::info!(connection_id = %connection_id, "Idle timeout, closing connection");
                let _ = tx
                    .send(Message::Close(Some(CloseFrame {
                        code: 1000,
                        reason: "Idle timeout".into(),
                    })))
                    .await;
                break;
            }
        };

        match next {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Text(text) => text.as_str().as_bytes().to_vec(),
                    Message::Binary(data) => data.to_vec(),
                    Message::Pong(_) => {
                        let _ = pong_tx.send(());
                        continue;
                    }
                    // Answered by the transport itself.
                    Message::Ping(_) => continue,
                    Message::Close(frame) => {
                        tracing::info!(
                            connection_id = %connection_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                };

                if let Some(d) = idle_timeout {
                    idle_deadline = Some(Instant::now() + d);
                }

                if let Err(e) = ingest.handle_frame(&data).await {
                    tracing::info!(
                        connection_id = %connection_id,
                        error = %e,
                        "Malformed frame, closing connection"
                    );
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(connection_id = %connection_id, "WebSocket stream ended");
                break;
            }
        }
    }

    state.connections.remove(connection_id);
    let user_id = ingest.identity().map(|identity| identity.id);

    // Let a queued close frame flush before tearing the writer down.
    drop(ingest);
    drop(tx);
    ping_handle.abort();
    if timeout(Duration::from_millis(100), &mut writer_handle)
        .await
        .is_err()
    {
        writer_handle.abort();
    }

    tracing::info!(
        connection_id = %connection_id,
        user_id = ?user_id,
        connections = state.connections.len(),
        "WebSocket connection closed"
    );
}

/// Resolves at the idle deadline, or never when idle timeout is disabled.
async fn idle_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Writer task: drains the connection queue into the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
