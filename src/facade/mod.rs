//! HA Facade (E): typed wrappers over the Wire Client (A) and State Cache
//! (B) a running app actually calls, plus the Callback Register (D) sugar
//! needed to build `wait_for_state_to_be` on top of `listen_state` (spec
//! §2, §4.6). Grounded on `domovoy`'s `HassPlugin`/`CallbacksPlugin` split,
//! folded into a single capability struct per the engine's §9 capability
//! pattern.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix::Addr;
use chrono::{DateTime, NaiveTime};
use chrono_tz::Tz;
use serde_json::Value;

use crate::callback::{EventCallbackFn, StateCallbackFn, StateDelivery, TriggerCallbackFn};
use crate::cache::{EntityCache, EntityState};
use crate::engine::{AddEventCallback, AddSchedulerCallback, AddTriggerCallback, CancelCallback, EngineActor, ListenState};
use crate::errors::{FacadeError, WireError};
use crate::scheduler::{Interval, SunEvent, TriggerSpec};
use crate::wire::{CallService, FireEvent, GetServices, GetStates, SearchRelated, SendCommand, WireClient};

fn mailbox_gone() -> FacadeError {
    FacadeError::Wire(WireError::NotConnected)
}

/// Handed to a running app via [`crate::engine::AppContext::hass`].
#[derive(Clone)]
pub struct HassFacade {
    app_name: String,
    engine: Addr<EngineActor>,
    wire: Addr<WireClient>,
    entities: EntityCache,
}

impl HassFacade {
    pub(crate) fn new(app_name: String, engine: Addr<EngineActor>, wire: Addr<WireClient>, entities: EntityCache) -> Self {
        Self { app_name, engine, wire, entities }
    }

    // --- B: cache reads, plain lookups, no RPC round trip ---

    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.entities.get(entity_id).map(|s| s.state)
    }

    pub fn get_full_state(&self, entity_id: &str) -> Option<EntityState> {
        self.entities.get(entity_id)
    }

    pub fn get_all_entities(&self) -> Vec<EntityState> {
        self.entities.get_all_entities()
    }

    pub fn get_all_entity_ids(&self) -> Vec<String> {
        self.entities.get_all_entity_ids()
    }

    pub fn get_entity_id_by_attribute(&self, attribute: &str, value: Option<&Value>) -> Vec<String> {
        self.entities.get_entity_id_by_attribute(attribute, value)
    }

    // --- A: thin RPCs ---

    /// Calls a service. If HA rejects the call because it requires a
    /// response but the caller didn't ask for one, retries once with
    /// `return_response=true` (spec §7's Command error policy).
    pub async fn call_service(
        &self,
        domain: impl Into<String>,
        service: impl Into<String>,
        service_data: Option<Value>,
        entity_id: Option<String>,
        return_response: bool,
    ) -> Result<Value, FacadeError> {
        let domain = domain.into();
        let service = service.into();
        match self.raw_call_service(domain.clone(), service.clone(), service_data.clone(), entity_id.clone(), return_response).await {
            Err(FacadeError::Wire(WireError::CommandErr { message, .. }))
                if !return_response && message.to_lowercase().contains("requires response") =>
            {
                self.raw_call_service(domain, service, service_data, entity_id, true).await
            }
            other => other,
        }
    }

    async fn raw_call_service(
        &self,
        domain: String,
        service: String,
        service_data: Option<Value>,
        entity_id: Option<String>,
        return_response: bool,
    ) -> Result<Value, FacadeError> {
        self.wire
            .send(CallService { domain, service, service_data, entity_id, return_response })
            .await
            .map_err(|_| mailbox_gone())?
            .map_err(FacadeError::from)
    }

    pub async fn fire_event(&self, event_type: impl Into<String>, event_data: Option<Value>) -> Result<Value, FacadeError> {
        self.wire.send(FireEvent { event_type: event_type.into(), event_data }).await.map_err(|_| mailbox_gone())?.map_err(FacadeError::from)
    }

    pub async fn get_states(&self) -> Result<Value, FacadeError> {
        self.wire.send(GetStates).await.map_err(|_| mailbox_gone())?.map_err(FacadeError::from)
    }

    pub async fn get_services(&self) -> Result<Value, FacadeError> {
        self.wire.send(GetServices).await.map_err(|_| mailbox_gone())?.map_err(FacadeError::from)
    }

    pub async fn search_related(&self, item_type: impl Into<String>, item_id: impl Into<String>) -> Result<Value, FacadeError> {
        self.wire
            .send(SearchRelated { item_type: item_type.into(), item_id: item_id.into() })
            .await
            .map_err(|_| mailbox_gone())?
            .map_err(FacadeError::from)
    }

    /// Low-level escape hatch for commands not otherwise wrapped (spec §4.1
    /// `send_command`).
    pub async fn send_command(&self, msg_type: impl Into<String>, payload: Value) -> Result<Value, FacadeError> {
        self.wire.send(SendCommand::new(msg_type, payload)).await.map_err(|_| mailbox_gone())?.map_err(FacadeError::from)
    }

    /// `subscribe_trigger`, owned directly by A (spec §2 `listen_trigger`).
    pub async fn listen_trigger(&self, trigger: Value, callback: TriggerCallbackFn) -> Result<String, FacadeError> {
        self.engine
            .send(AddTriggerCallback { app_name: self.app_name.clone(), trigger, callback })
            .await
            .map_err(|_| mailbox_gone())?
            .map_err(FacadeError::from)
    }

    // --- D sugar: listen_state is sugar for listen_attribute("state", ..) ---

    pub async fn listen_attribute(
        &self,
        entity_id: impl Into<String>,
        attribute: impl Into<String>,
        immediate: bool,
        oneshot: bool,
        callback: StateCallbackFn,
    ) -> Result<String, FacadeError> {
        self.engine
            .send(ListenState { app_name: self.app_name.clone(), entity_id: entity_id.into(), attribute: attribute.into(), immediate, oneshot, callback })
            .await
            .map_err(|_| mailbox_gone())?
            .map_err(FacadeError::from)
    }

    pub async fn listen_state(&self, entity_id: impl Into<String>, immediate: bool, oneshot: bool, callback: StateCallbackFn) -> Result<String, FacadeError> {
        self.listen_attribute(entity_id, "state", immediate, oneshot, callback).await
    }

    pub async fn listen_event(&self, events: Vec<String>, callback: EventCallbackFn) -> Result<String, FacadeError> {
        self.engine.send(AddEventCallback { app_name: self.app_name.clone(), events, callback }).await.map_err(|_| mailbox_gone())?.map_err(FacadeError::from)
    }

    pub async fn cancel_callback(&self, callback_id: impl Into<String>) -> Result<(), FacadeError> {
        self.engine
            .send(CancelCallback { app_name: self.app_name.clone(), callback_id: callback_id.into() })
            .await
            .map_err(|_| mailbox_gone())?
            .map_err(FacadeError::from)
    }

    // --- D sugar: the scheduler (C) trigger shapes, as `run_*` helpers ---

    pub async fn run_at(&self, at: DateTime<Tz>, description: impl Into<String>, callback: crate::callback::SchedulerCallbackFn) -> Result<String, FacadeError> {
        self.add_scheduler_callback(TriggerSpec::Once(at), description, callback).await
    }

    pub async fn run_every(
        &self,
        interval: Interval,
        start: Option<DateTime<Tz>>,
        description: impl Into<String>,
        callback: crate::callback::SchedulerCallbackFn,
    ) -> Result<String, FacadeError> {
        self.add_scheduler_callback(TriggerSpec::Interval { interval, start }, description, callback).await
    }

    pub async fn run_daily(&self, time: NaiveTime, description: impl Into<String>, callback: crate::callback::SchedulerCallbackFn) -> Result<String, FacadeError> {
        self.add_scheduler_callback(TriggerSpec::Daily(time), description, callback).await
    }

    pub async fn run_daily_on_sun_event(
        &self,
        event: SunEvent,
        delta: Option<chrono::Duration>,
        description: impl Into<String>,
        callback: crate::callback::SchedulerCallbackFn,
    ) -> Result<String, FacadeError> {
        self.add_scheduler_callback(TriggerSpec::DailySunEvent { event, delta }, description, callback).await
    }

    async fn add_scheduler_callback(
        &self,
        trigger: TriggerSpec,
        description: impl Into<String>,
        callback: crate::callback::SchedulerCallbackFn,
    ) -> Result<String, FacadeError> {
        self.engine
            .send(AddSchedulerCallback { app_name: self.app_name.clone(), trigger, description: description.into(), callback })
            .await
            .map_err(|_| mailbox_gone())?
            .map_err(FacadeError::from)
    }

    /// Waits for `entity_id` to reach one of `states`, optionally requiring
    /// it to hold that state continuously for `duration`, optionally bounded
    /// by an outer `timeout` (spec §4.6).
    ///
    /// Built atop `listen_state(immediate=true)`: the listener ignores
    /// values outside `states`; if `duration` is set and the entity hasn't
    /// been there long enough yet, it sleeps the remainder plus 0.5s and
    /// re-checks before resolving.
    pub async fn wait_for_state_to_be(
        &self,
        entity_id: impl Into<String>,
        states: Vec<String>,
        duration: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<(), FacadeError> {
        let fut = self.wait_for_state_to_be_inner(entity_id.into(), states, duration);
        match timeout {
            Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| FacadeError::Timeout)?,
            None => fut.await,
        }
    }

    async fn wait_for_state_to_be_inner(&self, entity_id: String, states: Vec<String>, duration: Option<Duration>) -> Result<(), FacadeError> {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let callback_id_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let facade = self.clone();
        let id_slot = callback_id_slot.clone();
        let callback: StateCallbackFn = Arc::new(move |delivery: StateDelivery| {
            let states = states.clone();
            let tx = tx.clone();
            let facade = facade.clone();
            let id_slot = id_slot.clone();
            Box::pin(async move { wait_for_state_step(facade, id_slot, tx, delivery, states, duration).await })
        });

        let id = self.listen_state(&entity_id, true, false, callback).await?;
        *callback_id_slot.lock().unwrap() = Some(id);

        rx.await.map_err(|_| FacadeError::Timeout)
    }
}

async fn wait_for_state_step(
    facade: HassFacade,
    id_slot: Arc<Mutex<Option<String>>>,
    tx: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
    delivery: StateDelivery,
    states: Vec<String>,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    let Some(new) = delivery.new.as_ref() else { return Ok(()) };
    if !states.iter().any(|s| s == &new.state) {
        return Ok(());
    }

    if let Some(duration) = duration {
        if !new.has_been_in_current_state_for_at_least(duration) {
            let elapsed = chrono::Utc::now().signed_duration_since(new.last_changed);
            let remaining = chrono::Duration::from_std(duration).unwrap_or_default() - elapsed + chrono::Duration::milliseconds(500);
            if let Ok(sleep_for) = remaining.to_std() {
                tokio::time::sleep(sleep_for).await;
            }
            let Some(recheck) = facade.get_full_state(&delivery.entity_id) else { return Ok(()) };
            if !recheck.has_been_in_current_state_for_at_least(duration) {
                return Ok(());
            }
        }
    }

    let maybe_id = id_slot.lock().unwrap().take();
    if let Some(id) = maybe_id {
        let _ = facade.cancel_callback(id).await;
    }
    if let Some(tx) = tx.lock().unwrap().take() {
        let _ = tx.send(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_gone_maps_to_not_connected() {
        assert!(matches!(mailbox_gone(), FacadeError::Wire(WireError::NotConnected)));
    }
}
