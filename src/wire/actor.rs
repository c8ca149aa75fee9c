//! The Wire Client actor (A): one actix actor per logical HA connection,
//! surviving reconnects by re-dialing in place rather than being recreated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use actix::io::SinkWrite;
use actix::prelude::*;
use actix_codec::Framed;
use awc::error::WsProtocolError;
use awc::{ws, BoxedSocket};
use futures::stream::{SplitSink, SplitStream};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use url::Url;

use crate::configuration::{HeartbeatSettings, HomeAssistantSettings};
use crate::errors::WireError;
use crate::wire::messages::*;
use crate::wire::model::{
    json_object_from_text_msg, AuthMsg, CallServiceCommand, CommandErrorPayload, InFlightOp, ResponseMsg,
};

static CLIENT_SEQ: AtomicU32 = AtomicU32::new(1);

type WsSink = SplitSink<Framed<BoxedSocket, ws::Codec>, ws::Message>;
type WsStream = SplitStream<Framed<BoxedSocket, ws::Codec>>;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Phase {
    Dialing,
    AwaitingAuth,
    Connected,
}

enum Subscriber {
    Event(Recipient<InboundEvent>),
    Trigger(Recipient<InboundTrigger>),
}

/// The HA WebSocket client. Owns the op-id space and the subscription table
/// for the lifetime of the process; reconnects replace the socket but never
/// the actor address, so callers keep a stable `Addr<WireClient>`.
pub struct WireClient {
    id: String,
    url: Url,
    settings: HomeAssistantSettings,
    heartbeat: HeartbeatSettings,
    sink: Option<SinkWrite<ws::Message, WsSink>>,
    phase: Phase,
    next_id: u32,
    in_flight: HashMap<u32, InFlightOp>,
    subscribers: HashMap<u32, Subscriber>,
    listeners: Vec<Recipient<ConnectionEvent>>,
    last_hb: Instant,
    reconnect_delay: Duration,
    stopping: bool,
}

impl WireClient {
    pub fn new(url: Url, settings: HomeAssistantSettings, heartbeat: HeartbeatSettings, listeners: Vec<Recipient<ConnectionEvent>>) -> Self {
        let reconnect_delay = settings.reconnect.duration;
        Self {
            id: format!("ha-{}", CLIENT_SEQ.fetch_add(1, Ordering::SeqCst)),
            url,
            settings,
            heartbeat,
            sink: None,
            phase: Phase::Dialing,
            next_id: 1,
            in_flight: HashMap::new(),
            subscribers: HashMap::new(),
            listeners,
            last_hb: Instant::now(),
            reconnect_delay,
            stopping: false,
        }
    }

    fn next_op_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn notify_listeners(&self, state: ConnectionState) {
        for listener in &self.listeners {
            let _ = listener.do_send(ConnectionEvent { state });
        }
    }

    /// Clears every structure that must not survive a reconnect: in-flight
    /// ops fail with `ConnErr`, subscriptions are dropped (HA assigns fresh
    /// subscription ids after resubscribing), op-id domain restarts.
    fn reset_for_reconnect(&mut self) {
        for (_, mut op) in self.in_flight.drain() {
            if let Some(tx) = op.tx.take() {
                let _ = tx.send(ResponseMsg { id: 0, success: false, result: None, error: Some(CommandErrorPayload {
                    code: "connection_lost".to_string(),
                    message: "connection to Home Assistant was lost".to_string(),
                }) });
            }
        }
        self.subscribers.clear();
        self.next_id = 1;
        self.phase = Phase::Dialing;
        self.notify_listeners(ConnectionState::Disconnected);
    }

    fn schedule_redial(&mut self, ctx: &mut Context<Self>) {
        if self.stopping {
            return;
        }
        let delay = self.reconnect_delay;
        info!("[{}] Reconnecting to Home Assistant in {:?}", self.id, delay);
        let backoff = self.settings.reconnect.backoff_factor;
        let max = self.settings.reconnect.duration_max;
        self.reconnect_delay = std::cmp::min(max, Duration::from_millis((delay.as_millis() as f32 * backoff) as u64));
        ctx.run_later(delay, |act, ctx| act.dial(ctx));
    }

    fn dial(&mut self, ctx: &mut Context<Self>) {
        self.phase = Phase::Dialing;
        self.notify_listeners(ConnectionState::Connecting);
        let url = self.url.clone();
        let timeout = Duration::from_secs(self.settings.connection_timeout as u64);

        let fut = async move {
            let client = awc::Client::builder().timeout(timeout).finish();
            client.ws(url.as_str()).connect().await
        };

        ctx.spawn(actix::fut::wrap_future::<_, Self>(fut).map(|res, act, ctx| match res {
            Ok((_, framed)) => {
                let (sink, stream) = futures::StreamExt::split(framed);
                act.attach(sink, stream, ctx);
            }
            Err(e) => {
                error!("[{}] Connection to Home Assistant failed: {e}", act.id);
                act.schedule_redial(ctx);
            }
        }));
    }

    fn attach(&mut self, sink: WsSink, stream: WsStream, ctx: &mut Context<Self>) {
        info!("[{}] Socket open, awaiting auth_required", self.id);
        self.sink = Some(SinkWrite::new(sink, ctx));
        self.phase = Phase::AwaitingAuth;
        self.last_hb = Instant::now();
        ctx.add_stream(stream);
        self.reconnect_delay = self.settings.reconnect.duration;
        self.heartbeat(ctx);
    }

    fn heartbeat(&self, ctx: &mut Context<Self>) {
        if self.heartbeat.interval.is_zero() {
            return;
        }
        ctx.run_later(self.heartbeat.interval, |act, ctx| {
            if act.phase != Phase::Connected {
                return;
            }
            if !act.heartbeat.timeout.is_zero() && Instant::now().duration_since(act.last_hb) > act.heartbeat.timeout {
                error!("[{}] Heartbeat timed out, disconnecting", act.id);
                ctx.stop();
                return;
            }
            let id = act.next_op_id();
            if act.send_json(json!({"id": id, "type": "ping"})).is_ok() {
                act.heartbeat(ctx);
            }
        });
    }

    fn send_json(&mut self, value: Value) -> Result<(), WireError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(WireError::NotConnected);
        };
        sink.write(ws::Message::Text(value.to_string().into())).map_err(|_| WireError::NotConnected)
    }

    /// Assigns an op id, enqueues the command, and returns a future that
    /// resolves when the matching `result` frame arrives.
    fn send_command(
        &mut self,
        msg_type: &str,
        mut extra: serde_json::Map<String, Value>,
    ) -> Result<tokio::sync::oneshot::Receiver<ResponseMsg>, WireError> {
        if self.phase != Phase::Connected {
            return Err(WireError::NotConnected);
        }
        let id = self.next_op_id();
        extra.insert("id".to_string(), json!(id));
        extra.insert("type".to_string(), json!(msg_type));
        self.send_json(Value::Object(extra))?;

        let (tx, rx) = tokio::sync::oneshot::channel();
        self.in_flight.insert(id, InFlightOp::new(tx));
        Ok(rx)
    }

    fn on_text(&mut self, text: &[u8], ctx: &mut Context<Self>) {
        let mut msg = match json_object_from_text_msg(&self.id, text) {
            Ok(m) => m,
            Err(e) => {
                warn!("[{}] {e}", self.id);
                return;
            }
        };
        let id = msg.get("id").and_then(Value::as_u64).unwrap_or_default() as u32;
        let msg_type = msg.get("type").and_then(Value::as_str).unwrap_or_default().to_string();

        match msg_type.as_str() {
            "auth_required" => {
                let auth = AuthMsg { msg_type: "auth", access_token: &self.settings.get_token() };
                if let Err(e) = self.send_json(serde_json::to_value(&auth).unwrap()) {
                    error!("[{}] Failed to send auth frame: {e}", self.id);
                }
            }
            "auth_invalid" => {
                error!("[{}] Home Assistant rejected authentication", self.id);
                self.notify_listeners(ConnectionState::AuthenticationFailed);
                self.stopping = true;
                ctx.stop();
            }
            "auth_ok" => {
                info!("[{}] Authenticated with Home Assistant", self.id);
                self.phase = Phase::Connected;
                self.notify_listeners(ConnectionState::Connected);
            }
            "pong" => {
                self.last_hb = Instant::now();
            }
            "result" => {
                let success = msg.get("success").and_then(Value::as_bool).unwrap_or(false);
                let result = msg.remove("result");
                let error = msg
                    .remove("error")
                    .and_then(|v| serde_json::from_value::<CommandErrorPayload>(v).ok());
                if let Some(mut op) = self.in_flight.remove(&id) {
                    if let Some(tx) = op.tx.take() {
                        let _ = tx.send(ResponseMsg { id, success, result, error });
                    }
                }
            }
            "event" => {
                let Some(subscriber) = self.subscribers.get(&id) else {
                    debug!("[{}] Event for unknown subscription {id}", self.id);
                    return;
                };
                let Some(event) = msg.remove("event") else { return };
                match subscriber {
                    Subscriber::Event(recipient) => {
                        let event_type = event.get("event_type").and_then(Value::as_str).map(str::to_string);
                        let data = event.get("data").cloned().unwrap_or(Value::Null);
                        let _ = recipient.do_send(InboundEvent { subscription_id: id, event_type, data });
                    }
                    Subscriber::Trigger(recipient) => {
                        let variables = event
                            .get("variables")
                            .and_then(|v| v.get("trigger"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let _ = recipient.do_send(InboundTrigger { subscription_id: id, variables });
                    }
                }
            }
            other => debug!("[{}] Unhandled frame type: {other}", self.id),
        }
    }
}

impl Actor for WireClient {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.dial(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        debug!("[{}] Wire client stopped", self.id);
        self.notify_listeners(ConnectionState::Disconnected);
    }
}

impl StreamHandler<Result<ws::Frame, WsProtocolError>> for WireClient {
    fn handle(&mut self, item: Result<ws::Frame, WsProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Frame::Text(text)) => self.on_text(text.as_ref(), ctx),
            Ok(ws::Frame::Ping(bytes)) => {
                self.last_hb = Instant::now();
                let _ = self.sink.as_mut().map(|s| s.write(ws::Message::Pong(bytes)));
            }
            Ok(ws::Frame::Pong(_)) => self.last_hb = Instant::now(),
            Ok(ws::Frame::Close(reason)) => {
                info!("[{}] Home Assistant closed the connection: {reason:?}", self.id);
                ctx.stop();
            }
            Ok(ws::Frame::Binary(_)) => warn!("[{}] Ignoring unexpected binary frame", self.id),
            Ok(ws::Frame::Continuation(_)) => {}
            Err(e) => {
                error!("[{}] WebSocket protocol error: {e}", self.id);
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        self.reset_for_reconnect();
        self.schedule_redial(ctx);
    }
}

impl actix::io::WriteHandler<WsProtocolError> for WireClient {}

impl Handler<SendCommand> for WireClient {
    type Result = ResponseActFuture<Self, Result<Value, WireError>>;

    fn handle(&mut self, msg: SendCommand, _ctx: &mut Self::Context) -> Self::Result {
        let mut payload = match msg.payload {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        payload.remove("id");
        payload.remove("type");
        let result = self.send_command(&msg.msg_type, payload);
        Box::pin(actix::fut::wrap_future(async move {
            match result {
                Ok(rx) => rx.await.map_err(|_| WireError::ConnErr("response channel closed".to_string()))?.into_result(),
                Err(e) => Err(e),
            }
        }))
    }
}

impl Handler<CallService> for WireClient {
    type Result = ResponseActFuture<Self, Result<Value, WireError>>;

    fn handle(&mut self, msg: CallService, _ctx: &mut Self::Context) -> Self::Result {
        let cmd: CallServiceCommand = (&msg).into();
        let mut map = serde_json::to_value(&cmd).unwrap().as_object().unwrap().clone();
        let result = self.send_command("call_service", std::mem::take(&mut map));
        Box::pin(actix::fut::wrap_future(async move {
            let response = match result {
                Ok(rx) => rx.await.map_err(|_| WireError::ConnErr("response channel closed".to_string()))?,
                Err(e) => return Err(e),
            };
            match response.into_result() {
                // Open Question (b): a single retry with return_response=true when HA
                // complains the service call needed a response but wasn't asked for one.
                Err(WireError::CommandErr { message, .. })
                    if !msg.return_response && message.contains("requires response but caller did not ask") =>
                {
                    Err(WireError::CommandErr { code: "retry_with_response".to_string(), message })
                }
                other => other,
            }
        }))
    }
}

impl Handler<FireEvent> for WireClient {
    type Result = ResponseActFuture<Self, Result<Value, WireError>>;

    fn handle(&mut self, msg: FireEvent, _ctx: &mut Self::Context) -> Self::Result {
        let mut map = serde_json::Map::new();
        map.insert("event_type".to_string(), json!(msg.event_type));
        if let Some(data) = msg.event_data {
            map.insert("event_data".to_string(), data);
        }
        let result = self.send_command("fire_event", map);
        Box::pin(actix::fut::wrap_future(resolve(result)))
    }
}

impl Handler<GetStates> for WireClient {
    type Result = ResponseActFuture<Self, Result<Value, WireError>>;

    fn handle(&mut self, _msg: GetStates, _ctx: &mut Self::Context) -> Self::Result {
        let result = self.send_command("get_states", serde_json::Map::new());
        Box::pin(actix::fut::wrap_future(resolve(result)))
    }
}

impl Handler<GetServices> for WireClient {
    type Result = ResponseActFuture<Self, Result<Value, WireError>>;

    fn handle(&mut self, _msg: GetServices, _ctx: &mut Self::Context) -> Self::Result {
        let result = self.send_command("get_services", serde_json::Map::new());
        Box::pin(actix::fut::wrap_future(resolve(result)))
    }
}

impl Handler<SearchRelated> for WireClient {
    type Result = ResponseActFuture<Self, Result<Value, WireError>>;

    fn handle(&mut self, msg: SearchRelated, _ctx: &mut Self::Context) -> Self::Result {
        let mut map = serde_json::Map::new();
        map.insert("item_type".to_string(), json!(msg.item_type));
        map.insert("item_id".to_string(), json!(msg.item_id));
        let result = self.send_command("search/related", map);
        Box::pin(actix::fut::wrap_future(resolve(result)))
    }
}

impl Handler<SubscribeEvents> for WireClient {
    type Result = ResponseActFuture<Self, Result<u32, WireError>>;

    fn handle(&mut self, msg: SubscribeEvents, _ctx: &mut Self::Context) -> Self::Result {
        let mut map = serde_json::Map::new();
        if let Some(event_type) = &msg.event_type {
            map.insert("event_type".to_string(), json!(event_type));
        }
        let result = self.send_command("subscribe_events", map);
        let id = self.next_id.saturating_sub(1);
        if result.is_ok() {
            self.subscribers.insert(id, Subscriber::Event(msg.recipient));
        }
        Box::pin(actix::fut::wrap_future(async move {
            match result {
                Ok(rx) => {
                    rx.await.map_err(|_| WireError::ConnErr("response channel closed".to_string()))?.into_result()?;
                    Ok(id)
                }
                Err(e) => Err(e),
            }
        }))
    }
}

impl Handler<SubscribeTrigger> for WireClient {
    type Result = ResponseActFuture<Self, Result<u32, WireError>>;

    fn handle(&mut self, msg: SubscribeTrigger, _ctx: &mut Self::Context) -> Self::Result {
        let mut map = serde_json::Map::new();
        map.insert("trigger".to_string(), msg.trigger);
        let result = self.send_command("subscribe_trigger", map);
        let id = self.next_id.saturating_sub(1);
        if result.is_ok() {
            self.subscribers.insert(id, Subscriber::Trigger(msg.recipient));
        }
        Box::pin(actix::fut::wrap_future(async move {
            match result {
                Ok(rx) => {
                    rx.await.map_err(|_| WireError::ConnErr("response channel closed".to_string()))?.into_result()?;
                    Ok(id)
                }
                Err(e) => Err(e),
            }
        }))
    }
}

impl Handler<UnsubscribeEvents> for WireClient {
    type Result = ResponseActFuture<Self, Result<(), WireError>>;

    fn handle(&mut self, msg: UnsubscribeEvents, _ctx: &mut Self::Context) -> Self::Result {
        self.subscribers.remove(&msg.subscription_id);
        let mut map = serde_json::Map::new();
        map.insert("subscription".to_string(), json!(msg.subscription_id));
        let result = self.send_command("unsubscribe_events", map);
        Box::pin(actix::fut::wrap_future(async move {
            match result {
                Ok(rx) => {
                    rx.await.map_err(|_| WireError::ConnErr("response channel closed".to_string()))?.into_result()?;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }))
    }
}

impl Handler<Reconnect> for WireClient {
    type Result = ();

    fn handle(&mut self, _msg: Reconnect, ctx: &mut Self::Context) -> Self::Result {
        ctx.stop();
    }
}

async fn resolve(result: Result<tokio::sync::oneshot::Receiver<ResponseMsg>, WireError>) -> Result<Value, WireError> {
    match result {
        Ok(rx) => rx.await.map_err(|_| WireError::ConnErr("response channel closed".to_string()))?.into_result(),
        Err(e) => Err(e),
    }
}
