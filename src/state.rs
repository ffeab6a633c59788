//! Last known snapshot of all Home Assistant entities.
//!
//! Snapshots are immutable and swapped wholesale; every swap is announced as
//! an [`EntityDiff`] with both the previous and the next snapshot.

use crate::consts;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Single entity record, as HA reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<f64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl EntityState {
    pub fn new(entity_id: &str, state: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            state: state.to_string(),
            attributes: Map::new(),
            last_changed: None,
            last_updated: None,
            context: Value::Null,
        }
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Attribute lookup by dotted path, eg. `color.hs.0`.
    pub fn attribute(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.attributes.get(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(list) => list.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set attribute by dotted path, creating intermediate objects.
    pub fn set_attribute(&mut self, path: &str, value: Value) {
        let mut parts: Vec<&str> = path.split('.').collect();
        let last = match parts.pop() {
            Some(last) => last,
            None => return,
        };

        let mut current = &mut self.attributes;
        for part in parts {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
        current.insert(last.to_string(), value);
    }
}

pub type Entities = HashMap<String, EntityState>;
pub type Snapshot = Arc<Entities>;

/// Two consecutive snapshots.
#[derive(Debug, Clone)]
pub struct EntityDiff {
    pub prev: Snapshot,
    pub next: Snapshot,
}

/// A single entity present in both snapshots of a diff.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub prev: EntityState,
    pub next: EntityState,
}

impl EntityDiff {
    /// Entity as seen in both snapshots. `None` if it was added or removed.
    pub fn entity(&self, entity_id: &str) -> Option<EntityChange> {
        let prev = self.prev.get(entity_id)?;
        let next = self.next.get(entity_id)?;
        Some(EntityChange {
            prev: prev.clone(),
            next: next.clone(),
        })
    }
}

pub struct StateCache {
    current: RwLock<Snapshot>,
    updates: broadcast::Sender<EntityDiff>,
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCache {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(consts::CHANNEL_CAPACITY);
        Self {
            current: RwLock::new(Arc::new(Entities::new())),
            updates,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.snapshot().get(entity_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityDiff> {
        self.updates.subscribe()
    }

    /// Replace the snapshot and announce the diff.
    pub fn replace(&self, next: Entities) {
        let next = Arc::new(next);
        let prev = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, next.clone())
        };
        // No receivers is fine - nobody is tracking anything yet.
        let _ = self.updates.send(EntityDiff { prev, next });
    }

    /// Apply a compressed `subscribe_entities` event on top of the current
    /// snapshot.
    pub fn apply_compressed(&self, update: &Value) {
        let mut next = (*self.snapshot()).clone();
        apply_compressed(&mut next, update);
        self.replace(next);
    }
}

/// Apply HA compressed entity update (`a` - added, `c` - changed,
/// `r` - removed) to a map of entities.
pub fn apply_compressed(entities: &mut Entities, update: &Value) {
    if let Some(added) = update.get("a").and_then(Value::as_object) {
        for (entity_id, compressed) in added {
            let mut entity = EntityState::new(entity_id, "");
            merge_compressed(&mut entity, compressed);
            entities.insert(entity_id.clone(), entity);
        }
    }

    if let Some(changed) = update.get("c").and_then(Value::as_object) {
        for (entity_id, diff) in changed {
            let entity = match entities.get_mut(entity_id) {
                Some(entity) => entity,
                None => {
                    warn!("Received change for unknown entity {}", entity_id);
                    continue;
                }
            };
            if let Some(plus) = diff.get("+") {
                merge_compressed(entity, plus);
            }
            if let Some(removed) = diff
                .get("-")
                .and_then(|minus| minus.get("a"))
                .and_then(Value::as_array)
            {
                for key in removed.iter().filter_map(Value::as_str) {
                    entity.attributes.remove(key);
                }
            }
        }
    }

    if let Some(removed) = update.get("r").and_then(Value::as_array) {
        for entity_id in removed.iter().filter_map(Value::as_str) {
            debug!("Entity {} removed", entity_id);
            entities.remove(entity_id);
        }
    }
}

fn merge_compressed(entity: &mut EntityState, compressed: &Value) {
    if let Some(state) = compressed.get("s").and_then(Value::as_str) {
        entity.state = state.to_string();
    }
    if let Some(attributes) = compressed.get("a").and_then(Value::as_object) {
        for (key, value) in attributes {
            entity.attributes.insert(key.clone(), value.clone());
        }
    }
    if let Some(context) = compressed.get("c") {
        entity.context = context.clone();
    }
    // `lu` is only sent when it differs from `lc`.
    let changed = compressed.get("lc").and_then(Value::as_f64);
    let updated = compressed.get("lu").and_then(Value::as_f64);
    if let Some(changed) = changed {
        entity.last_changed = Some(changed);
    }
    if let Some(updated) = updated.or(changed) {
        entity.last_updated = Some(updated);
        if entity.last_changed.is_none() {
            entity.last_changed = Some(updated);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compressed_add_change_remove() {
        let mut entities = Entities::new();
        apply_compressed(
            &mut entities,
            &json!({"a": {
                "light.kitchen": {"s": "off", "a": {"brightness": 0, "friendly_name": "Kitchen"}, "lu": 10.0},
                "sun.sun": {"s": "above_horizon", "a": {}, "lc": 5.0}
            }}),
        );
        assert_eq!(entities.len(), 2);
        assert_eq!(entities["light.kitchen"].state, "off");
        assert_eq!(entities["sun.sun"].last_changed, Some(5.0));

        apply_compressed(
            &mut entities,
            &json!({
                "c": {"light.kitchen": {"+": {"s": "on", "a": {"brightness": 255}, "lc": 20.0}, "-": {"a": ["friendly_name"]}}},
                "r": ["sun.sun"]
            }),
        );
        let kitchen = &entities["light.kitchen"];
        assert_eq!(kitchen.state, "on");
        assert_eq!(kitchen.attributes["brightness"], json!(255));
        assert!(kitchen.attributes.get("friendly_name").is_none());
        assert_eq!(kitchen.last_changed, Some(20.0));
        assert!(!entities.contains_key("sun.sun"));
    }

    #[test]
    fn compressed_timestamps_are_independent() {
        let mut entities = Entities::new();
        apply_compressed(
            &mut entities,
            &json!({"a": {
                "sensor.power": {"s": "120", "a": {}, "lc": 5.0, "lu": 9.0},
                "sensor.energy": {"s": "3", "a": {}, "lc": 7.0}
            }}),
        );
        assert_eq!(entities["sensor.power"].last_changed, Some(5.0));
        assert_eq!(entities["sensor.power"].last_updated, Some(9.0));
        assert_eq!(entities["sensor.energy"].last_changed, Some(7.0));
        assert_eq!(entities["sensor.energy"].last_updated, Some(7.0));

        apply_compressed(
            &mut entities,
            &json!({"c": {"sensor.power": {"+": {"a": {"unit": "W"}, "lu": 12.0}}}}),
        );
        assert_eq!(entities["sensor.power"].last_changed, Some(5.0));
        assert_eq!(entities["sensor.power"].last_updated, Some(12.0));
    }

    #[test]
    fn change_for_unknown_entity_is_ignored() {
        let mut entities = Entities::new();
        apply_compressed(&mut entities, &json!({"c": {"x.y": {"+": {"s": "on"}}}}));
        assert!(entities.is_empty());
    }

    #[test]
    fn dotted_attribute_paths() {
        let mut entity = EntityState::new("light.a", "on")
            .with_attribute("hs_color", json!([30.0, 80.0]))
            .with_attribute("nested", json!({"deep": {"value": 3}}));
        assert_eq!(entity.attribute("hs_color.1"), Some(&json!(80.0)));
        assert_eq!(entity.attribute("nested.deep.value"), Some(&json!(3)));
        assert_eq!(entity.attribute("nested.missing"), None);
        assert_eq!(entity.attribute("hs_color.x"), None);

        entity.set_attribute("nested.deep.other", json!("x"));
        entity.set_attribute("fresh.path", json!(true));
        assert_eq!(entity.attribute("nested.deep.other"), Some(&json!("x")));
        assert_eq!(entity.attribute("nested.deep.value"), Some(&json!(3)));
        assert_eq!(entity.attribute("fresh.path"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn replace_announces_prev_and_next() {
        let cache = StateCache::new();
        let mut rx = cache.subscribe();

        let mut first = Entities::new();
        first.insert("switch.a".into(), EntityState::new("switch.a", "off"));
        cache.replace(first);
        cache.apply_compressed(&json!({"c": {"switch.a": {"+": {"s": "on"}}}}));

        let diff = rx.recv().await.unwrap();
        assert!(diff.entity("switch.a").is_none());

        let diff = rx.recv().await.unwrap();
        let change = diff.entity("switch.a").unwrap();
        assert_eq!(change.prev.state, "off");
        assert_eq!(change.next.state, "on");
        assert_eq!(cache.get("switch.a").unwrap().state, "on");
    }
}
