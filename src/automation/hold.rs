use crate::state::EntityChange;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Entering the condition arms a timer, leaving it disarms. The handler
/// runs only if the timer elapses.
pub(super) fn hold<E, L, H>(
    mut changes: broadcast::Receiver<EntityChange>,
    enter: E,
    leave: L,
    duration: Duration,
    handler: H,
) -> JoinHandle<()>
where
    E: Fn(&EntityChange) -> bool + Send + 'static,
    L: Fn(&EntityChange) -> bool + Send + 'static,
    H: Fn(EntityChange) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        let mut pending: Option<JoinHandle<()>> = None;
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Hold trigger lagging, skipped {} updates", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if leave(&change) {
                if let Some(timer) = pending.take() {
                    timer.abort();
                }
            }
            if enter(&change) {
                if let Some(timer) = pending.take() {
                    timer.abort();
                }
                let handler = handler.clone();
                pending = Some(tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    handler(change);
                }));
            }
        }
    })
}
