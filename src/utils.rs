use crate::automation::Tracker;
use crate::consts;
use crate::props::EntityProps;
use crate::service::ServiceCaller;
use crate::state::StateCache;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const STABLE_POLL: Duration = Duration::from_millis(100);

/// Keep two on/off entities in the same state. A change of either one that
/// leaves them different switches both to the changed entity's state, then
/// ignores further changes for a short while so the echo of our own call
/// does not bounce back.
pub fn sync_states(
    tracker: &Tracker,
    services: &ServiceCaller,
    cache: Arc<StateCache>,
    entity_a: &str,
    entity_b: &str,
) -> [JoinHandle<()>; 2] {
    let locked = Arc::new(AtomicBool::new(false));
    let ids = vec![entity_a.to_string(), entity_b.to_string()];
    let services = services.clone();

    let handler = move |change: crate::state::EntityChange| {
        if cache.state(&ids[0]) == cache.state(&ids[1]) {
            return;
        }
        if locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("Syncing {:?} to {}", ids, change.next.state);

        let services = services.clone();
        let target = ids.clone();
        let on = change.next.state == "on";
        tokio::spawn(async move {
            if on {
                services.turn_on(target).await;
            } else {
                services.turn_off(target).await;
            }
        });

        let locked = locked.clone();
        tokio::spawn(async move {
            tokio::time::sleep(consts::SYNC_LOCK_TIME).await;
            locked.store(false, Ordering::SeqCst);
        });
    };

    let handler = Arc::new(handler);
    let first = handler.clone();
    [
        tracker.state(entity_a, move |change| first(change)),
        tracker.state(entity_b, move |change| handler(change)),
    ]
}

/// Whether `entity_id` stays in `state` for the whole `window`. Returns
/// `false` as soon as it is seen in another state.
pub async fn is_state_stable(cache: &StateCache, entity_id: &str, state: &str, window: Duration) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if !cache.state_is(entity_id, state) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep(STABLE_POLL.min(deadline - now)).await;
    }
}
