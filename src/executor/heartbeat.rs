use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Ticks at a fixed interval so the connection loop knows when to ping the
/// scheduler.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Send a tick on `tx` every interval until `cancel` fires or the
    /// receiver is dropped. The first tick is one full interval away.
    pub async fn run(&self, tx: mpsc::Sender<()>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let sender = HeartbeatSender::new(Duration::from_secs(15));
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { sender.run(tx, cancel).await }
        });

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());

        cancel.cancel();
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = HeartbeatSender::new(Duration::from_millis(10));
        sender.run(tx, CancellationToken::new()).await;
    }
}
