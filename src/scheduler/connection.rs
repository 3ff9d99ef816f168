use std::net::SocketAddr;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::protocol::{decode_frame, Inbound, Message};
use crate::scheduler::{Scheduler, Session};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Frame>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Accept executor connections until `cancel` fires.
pub(crate) async fn accept_loop(
    scheduler: Scheduler,
    listener: TcpListener,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(scheduler.clone(), stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept executor connection");
                }
            }
        }
    }
    tracing::debug!("Accept loop stopped");
}

async fn handle_connection(scheduler: Scheduler, stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (tx, rx) = mpsc::channel(scheduler.config().outbound_capacity);
    let session = scheduler.connect_executor(peer.to_string(), tx);
    let (sink, stream) = ws.split();

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        session.token().clone(),
        session.executor_id().to_string(),
    ));
    read_loop(&scheduler, &session, stream).await;

    scheduler.disconnect_executor(&session);
    let _ = writer.await;
}

async fn read_loop(scheduler: &Scheduler, session: &Session, mut stream: WsStream) {
    let executor_id = session.executor_id();
    loop {
        let frame = tokio::select! {
            _ = session.token().cancelled() => break,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(executor_id, error = %e, "Executor connection error");
                break;
            }
            None => break,
        };

        match decode_frame(frame) {
            Ok(Inbound::Message(message)) => {
                tracing::debug!(executor_id, kind = message.kind(), "Received message");
                scheduler.handle_message(session, message);
            }
            Ok(Inbound::Heartbeat) => scheduler.heartbeat(session),
            Ok(Inbound::Closed) => break,
            Err(e) => {
                tracing::warn!(executor_id, error = %e, "Closing connection after undecodable frame");
                break;
            }
        }
    }
}

/// Forward queued messages to the socket. On cancellation, whatever is
/// already queued (typically `kill`) is flushed before the close frame.
async fn write_loop(
    mut sink: WsSink,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    executor_id: String,
) {
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => {
                    if let Err(e) = send(&mut sink, &message).await {
                        tracing::warn!(executor_id = %executor_id, error = %e, "Failed to send to executor");
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    if send(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
    cancel.cancel();
}

async fn send(sink: &mut WsSink, message: &Message) -> crate::error::Result<()> {
    sink.send(message.to_frame()?).await?;
    Ok(())
}
