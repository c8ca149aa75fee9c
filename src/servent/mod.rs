//! Servent Entities (H, spec §4.6): HA entities whose authoritative state is
//! owned by this runtime. Grounded on `domovoy/plugins/servents`: a
//! `servents.create_entity` service call describes the entity, the runtime
//! then polls the cache for the entity HA assigns it (~50×100ms), and
//! `set_to` forwards writes via `servents.update_state`.
//!
//! Unlike `domovoy`'s per-category subclasses (`ServEntSensor`,
//! `ServEntBinarySensor`, ...), this is a single generic type: the core does
//! not interpret HA service schemas (spec §4 Non-goals), so `device`,
//! `category` and `value_domain` are opaque JSON passed straight through to
//! the `servents.create_entity` call.

use std::time::Duration;

use serde_json::{json, Value};

use crate::cache::EntityState;
use crate::errors::FacadeError;
use crate::facade::HassFacade;

const CREATION_POLL_ATTEMPTS: u32 = 50;
const CREATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Describes a servent entity to create. `device`/`category`/`value_domain`
/// are passed through verbatim to HA; `local_id` is namespaced by the
/// owning app into the runtime-wide `servent_id`.
pub struct ServentEntityConfig {
    pub local_id: String,
    pub device: Value,
    pub category: String,
    pub value_domain: String,
    /// Any additional fields `servents.create_entity` accepts, merged
    /// alongside the fields above.
    pub extra: Value,
}

/// A local handle to an app-owned HA entity.
pub struct ServentEntity {
    facade: HassFacade,
    servent_id: String,
    entity_id: String,
}

impl ServentEntity {
    /// Creates the entity via `servents.create_entity`, then polls the
    /// cache for its assigned `entity_id` (spec §4.6's "~50×100ms" window).
    pub async fn create(facade: &HassFacade, app_name: &str, config: ServentEntityConfig) -> Result<Self, FacadeError> {
        let servent_id = format!("{app_name}-{}", config.local_id);

        let mut entity = serde_json::Map::new();
        if let Value::Object(extra) = config.extra {
            entity.extend(extra);
        }
        entity.insert("servent_id".to_string(), json!(servent_id));
        entity.insert("device".to_string(), config.device);
        entity.insert("category".to_string(), json!(config.category));
        entity.insert("value_domain".to_string(), json!(config.value_domain));

        facade
            .call_service("servents", "create_entity", Some(json!({ "entities": [Value::Object(entity)] })), None, false)
            .await?;

        for attempt in 0..CREATION_POLL_ATTEMPTS {
            let matches = facade.get_entity_id_by_attribute("servent_id", Some(&json!(servent_id)));
            if let Some(entity_id) = matches.into_iter().next() {
                return Ok(Self { facade: facade.clone(), servent_id, entity_id });
            }
            if attempt + 1 < CREATION_POLL_ATTEMPTS {
                tokio::time::sleep(CREATION_POLL_INTERVAL).await;
            }
        }

        Err(FacadeError::UnknownEntity(servent_id))
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Plain cache lookup (spec §4.6 "Reads are plain cache lookups").
    pub fn get_state(&self) -> Option<String> {
        self.facade.get_state(&self.entity_id)
    }

    pub fn get_full_state(&self) -> Option<EntityState> {
        self.facade.get_full_state(&self.entity_id)
    }

    /// Forwards the write via `servents.update_state`.
    pub async fn set_to(&self, state: Value, attributes: Option<Value>) -> Result<Value, FacadeError> {
        self.facade
            .call_service(
                "servents",
                "update_state",
                Some(json!({ "servent_id": self.servent_id, "state": state, "attributes": attributes })),
                None,
                false,
            )
            .await
    }
}
