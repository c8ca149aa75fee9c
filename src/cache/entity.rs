//! Entity state snapshots and the per-entity cache (spec §3, §4.2).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::wire::RawEntityState;

/// Immutable snapshot of one HA entity. Replaced wholesale on update, never
/// mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub attributes: serde_json::Map<String, Value>,
}

impl EntityState {
    fn from_raw(raw: &RawEntityState) -> Option<Self> {
        Some(Self {
            entity_id: raw.entity_id.clone(),
            state: raw.state.clone(),
            last_changed: DateTime::parse_from_rfc3339(&raw.last_changed).ok()?.with_timezone(&Utc),
            last_updated: DateTime::parse_from_rfc3339(&raw.last_updated).ok()?.with_timezone(&Utc),
            attributes: raw.attributes.clone(),
        })
    }

    /// Ported from `domovoy/plugins/hass/core.py::EntityState`: has the
    /// entity held its *current* state continuously for at least `duration`?
    pub fn has_been_in_current_state_for_at_least(&self, duration: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_changed);
        elapsed >= chrono::Duration::from_std(duration).unwrap_or_default()
    }

    /// Has the entity been in `state` continuously for at least `duration`,
    /// i.e. it currently holds `state` and has held it long enough.
    pub fn has_been_in_state_for_at_least(&self, state: &str, duration: Duration) -> bool {
        self.state == state && self.has_been_in_current_state_for_at_least(duration)
    }

    /// Reconstructs a snapshot from the `old_state`/`new_state` shape
    /// `CacheActor` re-serializes onto [`crate::cache::Deliver`] messages.
    pub fn from_json(value: &Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        let raw: RawEntityState = serde_json::from_value(value.clone()).ok()?;
        Self::from_raw(&raw)
    }
}

pub enum UpdateOutcome {
    /// The snapshot was accepted and replaced the cached one (or inserted).
    Applied(EntityState),
    /// `new_state` was null: the entity was evicted.
    Evicted,
    /// Same or older `last_updated` than what's cached; ignored.
    Stale,
    /// Malformed payload (unparseable timestamps).
    Invalid,
}

/// Concurrent `entity_id -> EntityState` map. Cheaply `Clone`, sharing the
/// same backing table (grounded on the dashmap-based caches used for
/// multi-reader state across this repo's sibling example crates).
#[derive(Clone, Default)]
pub struct EntityCache {
    inner: Arc<DashMap<String, EntityState>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.inner.get(entity_id).map(|r| r.clone())
    }

    pub fn get_all_entities(&self) -> Vec<EntityState> {
        self.inner.iter().map(|r| r.value().clone()).collect()
    }

    pub fn get_all_entity_ids(&self) -> Vec<String> {
        self.inner.iter().map(|r| r.key().clone()).collect()
    }

    /// Every entity whose attribute map contains `attribute`, optionally
    /// filtered to entities where that attribute equals `value`.
    pub fn get_entity_id_by_attribute(&self, attribute: &str, value: Option<&Value>) -> Vec<String> {
        self.inner
            .iter()
            .filter(|r| match r.value().attributes.get(attribute) {
                Some(found) => value.map_or(true, |want| found == want),
                None => false,
            })
            .map(|r| r.key().clone())
            .collect()
    }

    /// Evict or replace an entity per the HA `state_changed` contract:
    /// `new_state=null` evicts; otherwise the snapshot wins only if it is
    /// strictly newer than whatever is cached (spec §4.2).
    pub fn apply_state_changed(&self, entity_id: &str, new_state: Option<&RawEntityState>) -> UpdateOutcome {
        let Some(raw) = new_state else {
            self.inner.remove(entity_id);
            return UpdateOutcome::Evicted;
        };
        let Some(parsed) = EntityState::from_raw(raw) else {
            return UpdateOutcome::Invalid;
        };

        match self.inner.entry(entity_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(parsed.clone());
                UpdateOutcome::Applied(parsed)
            }
            Entry::Occupied(mut slot) => {
                if parsed.last_updated > slot.get().last_updated {
                    slot.insert(parsed.clone());
                    UpdateOutcome::Applied(parsed)
                } else {
                    UpdateOutcome::Stale
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(state: &str, last_updated: &str) -> RawEntityState {
        RawEntityState {
            entity_id: "light.kitchen".to_string(),
            state: state.to_string(),
            last_changed: last_updated.to_string(),
            last_updated: last_updated.to_string(),
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn monotonic_updates_win_stale_updates_are_dropped() {
        let cache = EntityCache::new();
        let r1 = raw("off", "2024-01-01T00:00:00Z");
        assert!(matches!(cache.apply_state_changed("light.kitchen", Some(&r1)), UpdateOutcome::Applied(_)));

        let newer = raw("on", "2024-01-01T00:00:01Z");
        assert!(matches!(cache.apply_state_changed("light.kitchen", Some(&newer)), UpdateOutcome::Applied(_)));
        assert_eq!(cache.get("light.kitchen").unwrap().state, "on");

        let stale = raw("off", "2024-01-01T00:00:00.500Z");
        assert!(matches!(cache.apply_state_changed("light.kitchen", Some(&stale)), UpdateOutcome::Stale));
        assert_eq!(cache.get("light.kitchen").unwrap().state, "on");

        let equal = raw("off", "2024-01-01T00:00:01Z");
        assert!(matches!(cache.apply_state_changed("light.kitchen", Some(&equal)), UpdateOutcome::Stale));
        assert_eq!(cache.get("light.kitchen").unwrap().state, "on");
    }

    #[test]
    fn null_new_state_evicts() {
        let cache = EntityCache::new();
        let r1 = raw("off", "2024-01-01T00:00:00Z");
        cache.apply_state_changed("light.kitchen", Some(&r1));
        assert!(matches!(cache.apply_state_changed("light.kitchen", None), UpdateOutcome::Evicted));
        assert!(cache.get("light.kitchen").is_none());
    }

    #[test]
    fn lookup_by_attribute() {
        let cache = EntityCache::new();
        let mut r1 = raw("on", "2024-01-01T00:00:00Z");
        r1.entity_id = "sensor.garage".to_string();
        r1.attributes.insert("device_class".to_string(), Value::String("door".to_string()));
        cache.apply_state_changed("sensor.garage", Some(&r1));

        let found = cache.get_entity_id_by_attribute("device_class", Some(&Value::String("door".to_string())));
        assert_eq!(found, vec!["sensor.garage".to_string()]);
        assert!(cache.get_entity_id_by_attribute("device_class", Some(&Value::String("window".to_string()))).is_empty());
    }
}
