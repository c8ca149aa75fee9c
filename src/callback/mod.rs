//! Callback Register (D): the id discipline and bookkeeping shared by every
//! user-supplied reaction, regardless of whether it is ultimately driven by
//! the scheduler or the event bus. The App Engine (F, `crate::engine`) owns
//! the actual registration table per spec §4.4's "D + F" pairing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::EntityState;
use crate::errors::CallbackError;
use crate::scheduler::TriggerSpec;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Delivered to a state/attribute listener.
pub struct StateDelivery {
    pub entity_id: String,
    pub attribute: String,
    pub old: Option<EntityState>,
    pub new: Option<EntityState>,
}

/// Delivered to a plain event listener.
pub struct EventDelivery {
    pub event_type: String,
    pub data: serde_json::Value,
}

pub type StateCallbackFn = Arc<dyn Fn(StateDelivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type EventCallbackFn = Arc<dyn Fn(EventDelivery) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type SchedulerCallbackFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type TriggerCallbackFn = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// What kind of trigger owns a registration, for introspection (§6) and for
/// the cancellation fan-out (remove from B/C as appropriate).
pub enum CallbackAction {
    State { entity_id: String, attribute: String, oneshot: bool, callback: StateCallbackFn },
    Event { events: Vec<String>, callback: EventCallbackFn },
    Scheduler { description: String, trigger: TriggerSpec, callback: SchedulerCallbackFn },
    /// A `subscribe_trigger` listener owned directly by the Wire Client (A),
    /// not the event bus (B). The subscription id A assigns is tracked
    /// separately by the engine (`EngineActor::trigger_subs`), since it is
    /// only known once the subscribe RPC completes.
    Trigger { trigger: serde_json::Value, callback: TriggerCallbackFn },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Scheduler,
    Event,
}

pub struct CallbackRegistration {
    pub id: String,
    pub is_registered: bool,
    pub times_called: u64,
    pub last_call: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub action: CallbackAction,
}

impl CallbackRegistration {
    pub fn kind(&self) -> CallbackKind {
        match self.action {
            CallbackAction::Scheduler { .. } => CallbackKind::Scheduler,
            CallbackAction::State { .. } | CallbackAction::Event { .. } | CallbackAction::Trigger { .. } => CallbackKind::Event,
        }
    }

    pub fn event_names(&self) -> Vec<String> {
        match &self.action {
            CallbackAction::State { entity_id, .. } => vec![format!("state_changed={entity_id}")],
            CallbackAction::Event { events, .. } => events.clone(),
            CallbackAction::Scheduler { .. } => vec![],
            CallbackAction::Trigger { trigger, .. } => vec![format!("trigger={trigger}")],
        }
    }

    pub fn trigger_description(&self) -> Option<String> {
        match &self.action {
            CallbackAction::Scheduler { description, .. } => Some(description.clone()),
            _ => None,
        }
    }
}

/// Allocate a fresh scheduler-owned callback id (`scheduler-<uuid>`).
pub fn new_scheduler_id() -> String {
    format!("scheduler-{}", Uuid::new_v4())
}

/// Allocate a fresh event/state-owned callback id (`event-<uuid>`).
pub fn new_event_id() -> String {
    format!("event-{}", Uuid::new_v4())
}

/// Allocate an ephemeral id for an `immediate=true` synthetic delivery.
/// Never stored in the registration table (spec §4.4).
pub fn new_ephemeral_id() -> String {
    format!("ephemeral-{}", Uuid::new_v4())
}

/// Validate a callback id carries one of the three recognized prefixes.
pub fn validate_prefix(id: &str) -> Result<(), CallbackError> {
    if id.starts_with("scheduler-") || id.starts_with("event-") || id.starts_with("ephemeral-") {
        Ok(())
    } else {
        Err(CallbackError::InvalidCallbackId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn generated_ids_carry_expected_prefixes() {
        assert!(new_scheduler_id().starts_with("scheduler-"));
        assert!(new_event_id().starts_with("event-"));
        assert!(new_ephemeral_id().starts_with("ephemeral-"));
    }

    #[rstest]
    #[case("scheduler-abc", true)]
    #[case("event-abc", true)]
    #[case("ephemeral-abc", true)]
    #[case("bogus-abc", false)]
    #[case("", false)]
    fn validate_prefix_rejects_unknown_prefixes(#[case] id: &str, #[case] expected_ok: bool) {
        assert_eq!(validate_prefix(id).is_ok(), expected_ok);
    }
}
