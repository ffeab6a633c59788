//! Reactive trigger helpers.
//!
//! Derived from two sources: the raw HA event bus and the stream of entity
//! snapshot diffs. Every state / attribute / event stream is memoized by
//! key, so registering the same trigger twice shares one filtering task.

mod schedule;
mod hold;

pub use schedule::normalize_cron;

use crate::consts;
use crate::homeassistant::HassEvent;
use crate::state::{EntityChange, StateCache};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Streams<T> = Mutex<HashMap<String, broadcast::Sender<T>>>;

/// Declarative trigger, used with [`Tracker::on`] and [`Tracker::multiple`].
#[derive(Debug, Clone)]
pub enum Trigger {
    Event(String),
    State(String),
    StateTo(String, String),
    StateFrom(String, String),
    Attr(String, String),
    AttrTo(String, String, Value),
    AttrFrom(String, String, Value),
    Cron(String),
    Started,
}

pub struct Tracker {
    events: broadcast::Sender<HassEvent>,
    cache: Arc<StateCache>,
    event_streams: Streams<HassEvent>,
    entity_streams: Streams<EntityChange>,
    state_streams: Streams<EntityChange>,
    attr_streams: Streams<EntityChange>,
}

impl Tracker {
    pub fn new(events: broadcast::Sender<HassEvent>, cache: Arc<StateCache>) -> Self {
        Self {
            events,
            cache,
            event_streams: Mutex::new(HashMap::new()),
            entity_streams: Mutex::new(HashMap::new()),
            state_streams: Mutex::new(HashMap::new()),
            attr_streams: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to a memoized stream, spawning its feeder on first use.
    fn memoized<T, F>(streams: &Streams<T>, key: &str, feed: F) -> broadcast::Receiver<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(broadcast::Sender<T>),
    {
        let mut streams = match streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(sender) = streams.get(key) {
            return sender.subscribe();
        }
        debug!("Creating stream for {}", key);
        let (sender, receiver) = broadcast::channel(consts::CHANNEL_CAPACITY);
        feed(sender.clone());
        streams.insert(key.to_string(), sender);
        receiver
    }

    /// Number of distinct memoized streams; debugging aid.
    pub fn stream_count(&self) -> usize {
        [
            self.event_streams.lock().map(|s| s.len()).unwrap_or(0),
            self.entity_streams.lock().map(|s| s.len()).unwrap_or(0),
            self.state_streams.lock().map(|s| s.len()).unwrap_or(0),
            self.attr_streams.lock().map(|s| s.len()).unwrap_or(0),
        ]
        .iter()
        .sum()
    }

    /// Events of a single type.
    pub fn event_stream(&self, event_type: &str) -> broadcast::Receiver<HassEvent> {
        let source = self.events.subscribe();
        let wanted = event_type.to_string();
        Self::memoized(&self.event_streams, event_type, move |sender| {
            forward(source, sender, move |event: HassEvent| {
                (event.event_type == wanted).then_some(event)
            });
        })
    }

    /// Changes of an entity present in both snapshots.
    pub fn entity_stream(&self, entity_id: &str) -> broadcast::Receiver<EntityChange> {
        let source = self.cache.subscribe();
        let id = entity_id.to_string();
        Self::memoized(&self.entity_streams, entity_id, move |sender| {
            forward(source, sender, move |diff: crate::state::EntityDiff| {
                diff.entity(&id)
            });
        })
    }

    /// Changes of `state`.
    pub fn state_stream(&self, entity_id: &str) -> broadcast::Receiver<EntityChange> {
        let source = self.entity_stream(entity_id);
        Self::memoized(&self.state_streams, entity_id, move |sender| {
            forward(source, sender, |change: EntityChange| {
                (change.prev.state != change.next.state).then_some(change)
            });
        })
    }

    /// Changes of a (dotted path) attribute.
    pub fn attr_stream(&self, entity_id: &str, attribute: &str) -> broadcast::Receiver<EntityChange> {
        let source = self.entity_stream(entity_id);
        let key = format!("{}.{}", entity_id, attribute);
        let path = attribute.to_string();
        Self::memoized(&self.attr_streams, &key, move |sender| {
            forward(source, sender, move |change: EntityChange| {
                (change.prev.attribute(&path) != change.next.attribute(&path)).then_some(change)
            });
        })
    }

    pub fn event<H>(&self, event_type: &str, handler: H) -> JoinHandle<()>
    where
        H: Fn(Value) + Send + Sync + 'static,
    {
        listen(self.event_stream(event_type), move |event: HassEvent| {
            handler(event.data)
        })
    }

    /// HA finished starting.
    pub fn started<H>(&self, handler: H) -> JoinHandle<()>
    where
        H: Fn(Value) + Send + Sync + 'static,
    {
        self.event(consts::HA_STARTED_EVENT, handler)
    }

    pub fn state<H>(&self, entity_id: &str, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        listen(self.state_stream(entity_id), handler)
    }

    pub fn state_to<H>(&self, entity_id: &str, value: &str, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let value = value.to_string();
        listen(self.state_stream(entity_id), move |change: EntityChange| {
            if change.next.state == value {
                handler(change)
            }
        })
    }

    pub fn state_from<H>(&self, entity_id: &str, value: &str, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let value = value.to_string();
        listen(self.state_stream(entity_id), move |change: EntityChange| {
            if change.prev.state == value {
                handler(change)
            }
        })
    }

    pub fn attr<H>(&self, entity_id: &str, attribute: &str, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        listen(self.attr_stream(entity_id, attribute), handler)
    }

    pub fn attr_to<H>(&self, entity_id: &str, attribute: &str, value: Value, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let path = attribute.to_string();
        listen(self.attr_stream(entity_id, attribute), move |change: EntityChange| {
            if change.next.attribute(&path) == Some(&value) {
                handler(change)
            }
        })
    }

    pub fn attr_from<H>(&self, entity_id: &str, attribute: &str, value: Value, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let path = attribute.to_string();
        listen(self.attr_stream(entity_id, attribute), move |change: EntityChange| {
            if change.prev.attribute(&path) == Some(&value) {
                handler(change)
            }
        })
    }

    /// Fire once the entity stayed in `value` for `duration`.
    pub fn state_to_hold<H>(&self, entity_id: &str, value: &str, duration: Duration, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let (enter, leave) = (value.to_string(), value.to_string());
        hold::hold(
            self.state_stream(entity_id),
            move |change| change.next.state == enter,
            move |change| change.prev.state == leave,
            duration,
            handler,
        )
    }

    /// Fire once the entity stayed out of `value` for `duration`.
    pub fn state_from_hold<H>(&self, entity_id: &str, value: &str, duration: Duration, handler: H) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let (enter, leave) = (value.to_string(), value.to_string());
        hold::hold(
            self.state_stream(entity_id),
            move |change| change.prev.state == enter,
            move |change| change.next.state == leave,
            duration,
            handler,
        )
    }

    pub fn attr_to_hold<H>(
        &self,
        entity_id: &str,
        attribute: &str,
        value: Value,
        duration: Duration,
        handler: H,
    ) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let (enter_path, leave_path) = (attribute.to_string(), attribute.to_string());
        let (enter, leave) = (value.clone(), value);
        hold::hold(
            self.attr_stream(entity_id, attribute),
            move |change| change.next.attribute(&enter_path) == Some(&enter),
            move |change| change.prev.attribute(&leave_path) == Some(&leave),
            duration,
            handler,
        )
    }

    pub fn attr_from_hold<H>(
        &self,
        entity_id: &str,
        attribute: &str,
        value: Value,
        duration: Duration,
        handler: H,
    ) -> JoinHandle<()>
    where
        H: Fn(EntityChange) + Send + Sync + 'static,
    {
        let (enter_path, leave_path) = (attribute.to_string(), attribute.to_string());
        let (enter, leave) = (value.clone(), value);
        hold::hold(
            self.attr_stream(entity_id, attribute),
            move |change| change.prev.attribute(&enter_path) == Some(&enter),
            move |change| change.next.attribute(&leave_path) == Some(&leave),
            duration,
            handler,
        )
    }

    /// Run `handler` on every match of a cron expression (5 or 6 fields,
    /// local time).
    pub fn cron<H>(&self, expression: &str, handler: H) -> crate::Result<JoinHandle<()>>
    where
        H: Fn() + Send + Sync + 'static,
    {
        schedule::spawn(expression, handler)
    }

    /// Register `handler` for a single declarative trigger.
    pub fn on<H>(&self, trigger: Trigger, handler: H) -> crate::Result<JoinHandle<()>>
    where
        H: Fn() + Send + Sync + 'static,
    {
        let handle = match trigger {
            Trigger::Event(event_type) => self.event(&event_type, move |_| handler()),
            Trigger::Started => self.started(move |_| handler()),
            Trigger::State(id) => self.state(&id, move |_| handler()),
            Trigger::StateTo(id, value) => self.state_to(&id, &value, move |_| handler()),
            Trigger::StateFrom(id, value) => self.state_from(&id, &value, move |_| handler()),
            Trigger::Attr(id, attribute) => self.attr(&id, &attribute, move |_| handler()),
            Trigger::AttrTo(id, attribute, value) => {
                self.attr_to(&id, &attribute, value, move |_| handler())
            }
            Trigger::AttrFrom(id, attribute, value) => {
                self.attr_from(&id, &attribute, value, move |_| handler())
            }
            Trigger::Cron(expression) => self.cron(&expression, handler)?,
        };
        Ok(handle)
    }

    /// Same handler for any of `triggers`.
    pub fn multiple<H>(&self, triggers: Vec<Trigger>, handler: H) -> crate::Result<Vec<JoinHandle<()>>>
    where
        H: Fn() + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        triggers
            .into_iter()
            .map(|trigger| {
                let handler = handler.clone();
                self.on(trigger, move || handler())
            })
            .collect()
    }
}

/// Pipe `source` into `sink`, keeping items mapped to `Some`.
fn forward<S, T, F>(mut source: broadcast::Receiver<S>, sink: broadcast::Sender<T>, map: F)
where
    S: Clone + Send + 'static,
    T: Clone + Send + 'static,
    F: Fn(S) -> Option<T> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(item) => {
                    if let Some(item) = map(item) {
                        // No listeners right now is fine.
                        let _ = sink.send(item);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Trigger stream lagging, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Call `handler` for every item of `source`.
fn listen<T, H>(mut source: broadcast::Receiver<T>, handler: H) -> JoinHandle<()>
where
    T: Clone + Send + 'static,
    H: Fn(T) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(item) => handler(item),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Handler lagging, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Entities, EntityState};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (broadcast::Sender<HassEvent>, Arc<StateCache>, Tracker) {
        let (events, _) = broadcast::channel(16);
        let cache = Arc::new(StateCache::new());
        let tracker = Tracker::new(events.clone(), cache.clone());
        (events, cache, tracker)
    }

    fn set(cache: &StateCache, id: &str, state: &str, attrs: Value) {
        let mut entities = (*cache.snapshot()).clone();
        let mut entity = EntityState::new(id, state);
        if let Value::Object(map) = attrs {
            entity.attributes = map;
        }
        entities.insert(id.to_string(), entity);
        cache.replace(entities);
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn streams_are_memoized() {
        let (_events, _cache, tracker) = setup();
        let _a = tracker.state_stream("light.a");
        let _b = tracker.state_stream("light.a");
        // entity stream + state stream
        assert_eq!(tracker.stream_count(), 2);

        let _c = tracker.attr_stream("light.a", "brightness");
        let _d = tracker.attr_stream("light.a", "brightness");
        assert_eq!(tracker.stream_count(), 3);

        let _e = tracker.event_stream("call_service");
        let _f = tracker.event_stream("call_service");
        assert_eq!(tracker.stream_count(), 4);
    }

    #[tokio::test]
    async fn state_triggers_filter_transitions() {
        let (_events, cache, tracker) = setup();
        set(&cache, "light.a", "off", json!({}));

        let any = Arc::new(AtomicUsize::new(0));
        let to_on = Arc::new(AtomicUsize::new(0));
        let from_on = Arc::new(AtomicUsize::new(0));
        {
            let any = any.clone();
            tracker.state("light.a", move |_| {
                any.fetch_add(1, Ordering::SeqCst);
            });
            let to_on = to_on.clone();
            tracker.state_to("light.a", "on", move |_| {
                to_on.fetch_add(1, Ordering::SeqCst);
            });
            let from_on = from_on.clone();
            tracker.state_from("light.a", "on", move |_| {
                from_on.fetch_add(1, Ordering::SeqCst);
            });
        }

        set(&cache, "light.a", "on", json!({}));
        settle().await;
        // Attribute-only update is not a state change.
        set(&cache, "light.a", "on", json!({"brightness": 10}));
        settle().await;
        set(&cache, "light.a", "off", json!({"brightness": 10}));
        settle().await;

        assert_eq!(any.load(Ordering::SeqCst), 2);
        assert_eq!(to_on.load(Ordering::SeqCst), 1);
        assert_eq!(from_on.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_entities_are_not_changes() {
        let (_events, cache, tracker) = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        tracker.state("sensor.new", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        set(&cache, "sensor.new", "1", json!({}));
        settle().await;
        cache.replace(Entities::new());
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn attribute_triggers_follow_paths() {
        let (_events, cache, tracker) = setup();
        set(&cache, "climate.a", "heat", json!({"target": {"temp": 20}}));

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            tracker.attr_to("climate.a", "target.temp", json!(22), move |change| {
                seen.lock().unwrap().push(change.next.attribute("target.temp").cloned());
            });
        }
        let any = Arc::new(AtomicUsize::new(0));
        {
            let any = any.clone();
            tracker.attr("climate.a", "target.temp", move |_| {
                any.fetch_add(1, Ordering::SeqCst);
            });
        }

        set(&cache, "climate.a", "heat", json!({"target": {"temp": 21}}));
        settle().await;
        set(&cache, "climate.a", "off", json!({"target": {"temp": 21}}));
        settle().await;
        set(&cache, "climate.a", "off", json!({"target": {"temp": 22}}));
        settle().await;

        assert_eq!(any.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec![Some(json!(22))]);
    }

    #[tokio::test]
    async fn event_triggers_pass_data() {
        let (events, _cache, tracker) = setup();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            tracker.event("my_event", move |data| seen.lock().unwrap().push(data));
        }
        let started = Arc::new(AtomicUsize::new(0));
        {
            let started = started.clone();
            tracker.started(move |_| {
                started.fetch_add(1, Ordering::SeqCst);
            });
        }

        events.send(HassEvent::new("other", json!(1))).unwrap();
        events.send(HassEvent::new("my_event", json!({"x": 1}))).unwrap();
        events.send(HassEvent::new("homeassistant_started", json!({}))).unwrap();
        settle().await;

        assert_eq!(*seen.lock().unwrap(), vec![json!({"x": 1})]);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_shares_handler() {
        let (events, cache, tracker) = setup();
        set(&cache, "switch.a", "off", json!({}));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let count = count.clone();
            tracker
                .multiple(
                    vec![
                        Trigger::Event("ping".into()),
                        Trigger::StateTo("switch.a".into(), "on".into()),
                    ],
                    move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }

        events.send(HassEvent::new("ping", Value::Null)).unwrap();
        set(&cache, "switch.a", "on", json!({}));
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_cron_is_rejected() {
        let (_events, _cache, tracker) = setup();
        assert!(tracker.on(Trigger::Cron("not a cron".into()), || {}).is_err());
    }
}
