//! One connection to the scheduler: register, then serve tasks until the
//! socket drops, the scheduler says `kill`, or shutdown is requested.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::heartbeat::HeartbeatSender;
use super::Executor;
use crate::error::Result;
use crate::protocol::{
    decode_frame, ExecutorRegister, Inbound, Message, TaskMessage, UpdateStatus,
};
use crate::scheduler::task::TaskStatus;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<Socket, Frame>;
type WsStream = SplitStream<Socket>;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Killed,
    Shutdown,
    Lost,
}

pub(crate) async fn connect(url: &str) -> Result<Socket> {
    let (socket, _response) = connect_async(url).await?;
    Ok(socket)
}

pub(crate) async fn serve(
    executor: &Executor,
    socket: Socket,
    shutdown: &CancellationToken,
) -> Result<SessionEnd> {
    let (mut sink, mut stream) = socket.split();
    let config = executor.config();

    let register = Message::ExecutorRegister(ExecutorRegister {
        executor_id: config.executor_id.clone(),
        host: config.host.clone(),
        port: config.port,
        max_tasks: config.max_tasks,
        capabilities: config.capabilities.clone(),
    });
    send(&mut sink, &register).await?;

    if let Some(end) = await_registration(&mut stream, shutdown).await {
        let _ = sink.close().await;
        return Ok(end);
    }
    tracing::info!(executor_id = %config.executor_id, "Registered with scheduler");

    let cancel = shutdown.child_token();
    let (tick_tx, mut tick_rx) = mpsc::channel(1);
    let heartbeat = HeartbeatSender::new(config.heartbeat_interval);
    let ticker = tokio::spawn({
        let cancel = cancel.clone();
        async move { heartbeat.run(tick_tx, cancel).await }
    });

    let end = message_loop(executor, &mut sink, &mut stream, &mut tick_rx, shutdown).await;

    cancel.cancel();
    let _ = ticker.await;
    let _ = sink.close().await;
    end
}

/// Wait for `register_response`. Returns `Some` when the connection ends
/// first.
async fn await_registration(
    stream: &mut WsStream,
    shutdown: &CancellationToken,
) -> Option<SessionEnd> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Some(SessionEnd::Shutdown),
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Connection lost before registration completed");
                return Some(SessionEnd::Lost);
            }
            None => return Some(SessionEnd::Lost),
        };

        match decode_frame(frame) {
            Ok(Inbound::Message(Message::RegisterResponse(response))) => {
                if !response.is_success() {
                    tracing::warn!(
                        status = %response.status,
                        message = %response.message,
                        "Scheduler rejected registration"
                    );
                }
                return None;
            }
            Ok(Inbound::Message(Message::Kill)) => return Some(SessionEnd::Killed),
            Ok(Inbound::Message(other)) => {
                tracing::warn!(kind = other.kind(), "Unexpected message while registering");
            }
            Ok(Inbound::Heartbeat) => {}
            Ok(Inbound::Closed) => return Some(SessionEnd::Lost),
            Err(e) => tracing::warn!(error = %e, "Ignoring undecodable frame"),
        }
    }
}

async fn message_loop(
    executor: &Executor,
    sink: &mut WsSink,
    stream: &mut WsStream,
    ticks: &mut mpsc::Receiver<()>,
    shutdown: &CancellationToken,
) -> Result<SessionEnd> {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SessionEnd::Shutdown),
            Some(()) = ticks.recv() => {
                sink.send(Frame::Ping(Vec::new())).await?;
                continue;
            }
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Scheduler connection error");
                return Ok(SessionEnd::Lost);
            }
            None => return Ok(SessionEnd::Lost),
        };

        match decode_frame(frame) {
            Ok(Inbound::Message(Message::Task(task))) => {
                let outcome = run_task(executor, sink, task).await;
                executor.set_current_task(None);
                outcome?;
            }
            Ok(Inbound::Message(Message::Kill)) => {
                tracing::info!("Received kill from scheduler");
                return Ok(SessionEnd::Killed);
            }
            Ok(Inbound::Message(other)) => {
                tracing::debug!(kind = other.kind(), "Ignoring message");
            }
            Ok(Inbound::Heartbeat) => {}
            Ok(Inbound::Closed) => return Ok(SessionEnd::Lost),
            Err(e) => tracing::warn!(error = %e, "Ignoring undecodable frame"),
        }
    }
}

/// Report RUNNING, execute inline, report the result.
async fn run_task(executor: &Executor, sink: &mut WsSink, task: TaskMessage) -> Result<()> {
    let task_id = task.task_id;
    executor.set_current_task(Some(task_id));
    let running = Message::UpdateStatus(UpdateStatus {
        task_id,
        status: TaskStatus::Running,
    });
    send(sink, &running).await?;

    let result = executor.execute(task).await;
    send(sink, &Message::TaskResult(result)).await
}

async fn send(sink: &mut WsSink, message: &Message) -> Result<()> {
    sink.send(message.to_frame()?).await?;
    Ok(())
}
