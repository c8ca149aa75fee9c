//! Actix `Message` definitions for the Wire Client actor (A).

use actix::prelude::*;
use serde_json::Value;

use crate::errors::WireError;
use crate::wire::model::{CallServiceCommand, TargetEntity};

/// Connection lifecycle notifications forwarded to whoever supervises the
/// client (the engine, via the state cache).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    AuthenticationFailed,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ConnectionEvent {
    pub state: ConnectionState,
}

/// A single inbound HA event, already classified by subscription id.
#[derive(Message)]
#[rtype(result = "()")]
pub struct InboundEvent {
    pub subscription_id: u32,
    pub event_type: Option<String>,
    pub data: Value,
}

/// A single inbound trigger firing.
#[derive(Message)]
#[rtype(result = "()")]
pub struct InboundTrigger {
    pub subscription_id: u32,
    pub variables: Value,
}

/// Generic opaque command (spec §4.1 `send_command`).
#[derive(Message)]
#[rtype(result = "Result<Value, WireError>")]
pub struct SendCommand {
    pub msg_type: String,
    pub payload: Value,
}

impl SendCommand {
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self { msg_type: msg_type.into(), payload }
    }
}

#[derive(Message)]
#[rtype(result = "Result<Value, WireError>")]
pub struct CallService {
    pub domain: String,
    pub service: String,
    pub service_data: Option<Value>,
    pub entity_id: Option<String>,
    pub return_response: bool,
}

impl From<&CallService> for CallServiceCommand {
    fn from(c: &CallService) -> Self {
        CallServiceCommand {
            domain: c.domain.clone(),
            service: c.service.clone(),
            service_data: c.service_data.clone(),
            target: c.entity_id.clone().map(|entity_id| TargetEntity { entity_id }),
            return_response: c.return_response,
        }
    }
}

#[derive(Message)]
#[rtype(result = "Result<Value, WireError>")]
pub struct FireEvent {
    pub event_type: String,
    pub event_data: Option<Value>,
}

#[derive(Message)]
#[rtype(result = "Result<Value, WireError>")]
pub struct GetStates;

#[derive(Message)]
#[rtype(result = "Result<Value, WireError>")]
pub struct GetServices;

#[derive(Message)]
#[rtype(result = "Result<Value, WireError>")]
pub struct SearchRelated {
    pub item_type: String,
    pub item_id: String,
}

/// Subscribe to an HA event stream; `Recipient` receives every matching
/// [`InboundEvent`] until [`UnsubscribeEvents`] is sent.
#[derive(Message)]
#[rtype(result = "Result<u32, WireError>")]
pub struct SubscribeEvents {
    pub event_type: Option<String>,
    pub recipient: Recipient<InboundEvent>,
}

#[derive(Message)]
#[rtype(result = "Result<u32, WireError>")]
pub struct SubscribeTrigger {
    pub trigger: Value,
    pub recipient: Recipient<InboundTrigger>,
}

#[derive(Message)]
#[rtype(result = "Result<(), WireError>")]
pub struct UnsubscribeEvents {
    pub subscription_id: u32,
}

/// Request a forced reconnect, used by tests and supervisory code.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Reconnect;
