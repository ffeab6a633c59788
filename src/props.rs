//! Read-only queries against the current snapshot.

use crate::state::{EntityState, Snapshot, StateCache};
use serde_json::Value;

pub trait EntityProps {
    fn entity(&self, entity_id: &str) -> Option<EntityState>;

    fn entities(&self) -> Snapshot;

    fn state(&self, entity_id: &str) -> Option<String> {
        self.entity(entity_id).map(|entity| entity.state)
    }

    fn state_is(&self, entity_id: &str, state: &str) -> bool {
        self.state(entity_id).as_deref() == Some(state)
    }

    /// True also for unknown entities.
    fn state_not(&self, entity_id: &str, state: &str) -> bool {
        !self.state_is(entity_id, state)
    }

    /// Attribute by dotted path.
    fn attr(&self, entity_id: &str, attribute: &str) -> Option<Value> {
        self.entity(entity_id)
            .and_then(|entity| entity.attribute(attribute).cloned())
    }

    fn attr_is(&self, entity_id: &str, attribute: &str, value: &Value) -> bool {
        self.attr(entity_id, attribute).as_ref() == Some(value)
    }

    fn attr_not(&self, entity_id: &str, attribute: &str, value: &Value) -> bool {
        !self.attr_is(entity_id, attribute, value)
    }
}

impl EntityProps for StateCache {
    fn entity(&self, entity_id: &str) -> Option<EntityState> {
        self.get(entity_id)
    }

    fn entities(&self) -> Snapshot {
        self.snapshot()
    }
}
