//! Cancellable watch subscriptions.
//!
//! A pump task forwards a server-push stream into a bounded channel until the
//! stream ends or the subscription is cancelled. Closing (or dropping) the
//! subscription always stops the pump, so no watch connection outlives its owner.

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetcheck_core::{FleetResult, WatchEvent};

fn queue_cap() -> usize {
    std::env::var("FLEET_WATCH_QUEUE_CAP").ok().and_then(|s| s.parse().ok()).unwrap_or(256)
}

/// Cancellation handle for an in-flight watch.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(&mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// Live watch session. Events arrive in server emission order.
pub struct WatchSubscription {
    rx: mpsc::Receiver<WatchEvent>,
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
    ctx: String,
}

impl WatchSubscription {
    /// Start pumping `stream` into a new subscription. `ctx` labels log lines.
    pub fn spawn<S>(stream: S, ctx: impl Into<String>) -> Self
    where
        S: Stream<Item = FleetResult<WatchEvent>> + Send + 'static,
    {
        let ctx = ctx.into();
        let (tx, rx) = mpsc::channel::<WatchEvent>(queue_cap());
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(pump_events(stream, tx, cancel_rx, ctx.clone()));
        info!(ctx = %ctx, "watch opened");
        Self { rx, cancel: CancelHandle { tx: Some(cancel_tx) }, task: Some(task), ctx }
    }

    /// Next event, or `None` once the underlying stream has ended.
    pub async fn next(&mut self) -> Option<WatchEvent> { self.rx.recv().await }

    /// Stop the stream and wait for the pump to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() { warn!(ctx = %self.ctx, error = %e, "watch pump panicked"); }
            }
        }
        info!(ctx = %self.ctx, "watch closed");
    }
}

impl Drop for WatchSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            debug!(ctx = %self.ctx, "watch dropped without close; aborting pump");
            task.abort();
        }
    }
}

async fn pump_events<S>(stream: S, tx: mpsc::Sender<WatchEvent>, mut cancel_rx: oneshot::Receiver<()>, ctx: String)
where
    S: Stream<Item = FleetResult<WatchEvent>> + Send,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = &mut cancel_rx => { debug!(ctx = %ctx, "watch pump cancelled"); break; }
            next = stream.next() => {
                match next {
                    Some(Ok(ev)) => {
                        // Backpressure from a slow reader must not block cancellation.
                        tokio::select! {
                            _ = &mut cancel_rx => { debug!(ctx = %ctx, "watch pump cancelled"); break; }
                            sent = tx.send(ev) => { if sent.is_err() { break; } }
                        }
                    }
                    Some(Err(e)) => { warn!(ctx = %ctx, error = %e, "watch stream error"); break; }
                    None => { debug!(ctx = %ctx, "watch stream ended"); break; }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_core::{Document, EventType};
    use std::time::Duration;

    fn ev(name: &str) -> WatchEvent {
        WatchEvent::new(EventType::Added, Document::from(serde_json::json!({"metadata": {"name": name}})))
    }

    #[tokio::test]
    async fn delivers_in_order_then_ends() {
        let s = futures::stream::iter(vec![Ok::<_, fleetcheck_core::FleetError>(ev("a")), Ok(ev("b"))]);
        let mut sub = WatchSubscription::spawn(s, "test");
        assert_eq!(sub.next().await.and_then(|e| e.name().map(String::from)).as_deref(), Some("a"));
        assert_eq!(sub.next().await.and_then(|e| e.name().map(String::from)).as_deref(), Some("b"));
        assert!(sub.next().await.is_none());
        sub.close().await;
    }

    #[tokio::test]
    async fn close_stops_an_endless_stream() {
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                yield Ok::<_, fleetcheck_core::FleetError>(ev("tick"));
            }
        };
        let mut sub = WatchSubscription::spawn(s, "endless");
        assert!(sub.next().await.is_some());
        tokio::time::timeout(Duration::from_secs(1), sub.close()).await.expect("pump did not stop");
    }

    #[tokio::test]
    async fn stream_error_ends_subscription() {
        let s = futures::stream::iter(vec![Ok(ev("a")), Err(fleetcheck_core::FleetError::Api("gone".into())), Ok(ev("b"))]);
        let mut sub = WatchSubscription::spawn(s, "err");
        assert!(sub.next().await.is_some());
        assert!(sub.next().await.is_none());
        sub.close().await;
    }
}
