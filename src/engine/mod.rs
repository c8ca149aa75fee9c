//! App Engine (F) and, per spec §4.4, the Callback Register's (D) owning
//! side: registration table, lifecycle transitions, and the dispatch path
//! that turns cache/scheduler deliveries into instrumented user-callback
//! invocations.

pub mod app;
mod instrument;
pub mod status;

pub use app::{App, AppContext, AppFactory, AppInstance, AppRegistration};
pub use status::AppStatus;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use actix::prelude::*;
use actix::MessageResult;
use futures::future::join_all;
use log::{error, info, warn};
use serde_json::Value;

use crate::callback::{
    self, BoxFuture, CallbackAction, CallbackKind, CallbackRegistration, EventCallbackFn, EventDelivery, SchedulerCallbackFn,
    StateCallbackFn, StateDelivery, TriggerCallbackFn,
};
use crate::cache::{CacheActor, Deliver, EntityCache, EntityState, Subscribe, Unsubscribe};
use crate::errors::{CallbackError, EngineError};
use crate::scheduler::{JobFired, RemoveJob, ScheduleJob, SchedulerActor, TriggerSpec};
use crate::wire::{ConnectionEvent, ConnectionState, InboundEvent, InboundTrigger, SubscribeEvents, SubscribeTrigger, UnsubscribeEvents, WireClient};

use status::AppStatusMachineInput;
pub use status::AppStatusMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    HassRestart,
    ConnectionLost,
    Manual,
}

#[derive(Message)]
#[rtype(result = "Result<(), EngineError>")]
pub struct RegisterApp {
    pub app_name: String,
    pub source_path: PathBuf,
    pub class_descriptor: String,
    pub config: Value,
    pub logging_config_name: String,
    pub factory: Arc<dyn AppFactory>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct TerminateApp {
    pub app_name: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct ReloadApp {
    pub app_name: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct BulkStopApps {
    pub reason: StopReason,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct BulkStartApps {
    pub after_unexpected_disconnect: bool,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct TerminateAllAppsBeforeEngineStop;

/// Reload Driver (G) entry point (spec §4.5): terminates and drops the
/// registration of every app whose source file is in `paths`, ahead of the
/// loader re-registering the reverse/forward closure it was computed from.
#[derive(Message)]
#[rtype(result = "()")]
pub struct TerminateAppsForPaths {
    pub paths: Vec<PathBuf>,
}

#[derive(Message)]
#[rtype(result = "()")]
struct DropRegistration {
    app_name: String,
}

#[derive(Message)]
#[rtype(result = "Result<String, EngineError>")]
pub struct AddSchedulerCallback {
    pub app_name: String,
    pub trigger: TriggerSpec,
    pub description: String,
    pub callback: SchedulerCallbackFn,
}

#[derive(Message)]
#[rtype(result = "Result<String, EngineError>")]
pub struct AddEventCallback {
    pub app_name: String,
    pub events: Vec<String>,
    pub callback: EventCallbackFn,
}

/// `listen_trigger` (spec §4.1/§2, component E): owned directly by the Wire
/// Client's `subscribe_trigger`, not by B's event bus.
#[derive(Message)]
#[rtype(result = "Result<String, EngineError>")]
pub struct AddTriggerCallback {
    pub app_name: String,
    pub trigger: Value,
    pub callback: TriggerCallbackFn,
}

/// Internal: records the subscription id A assigned once a deferred
/// `subscribe_trigger` RPC completes, so [`Handler<InboundTrigger>`] can
/// route inbound firings back to the owning callback.
#[derive(Message)]
#[rtype(result = "()")]
struct TriggerSubscribed {
    callback_id: String,
    subscription_id: u32,
}

#[derive(Message)]
#[rtype(result = "Result<String, EngineError>")]
pub struct ListenState {
    pub app_name: String,
    pub entity_id: String,
    pub attribute: String,
    pub immediate: bool,
    pub oneshot: bool,
    pub callback: StateCallbackFn,
}

#[derive(Message)]
#[rtype(result = "Result<(), CallbackError>")]
pub struct CancelCallback {
    pub app_name: String,
    pub callback_id: String,
}

#[derive(Clone, serde::Serialize)]
pub struct AppSummary {
    pub app_name: String,
    pub class_descriptor: String,
    pub source_path: String,
    pub status: AppStatus,
}

#[derive(Clone, serde::Serialize)]
pub struct CallbackSummary {
    pub id: String,
    pub kind: &'static str,
    pub is_registered: bool,
    pub times_called: u64,
    pub last_call: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    pub trigger_description: Option<String>,
    pub events: Vec<String>,
}

#[derive(Message)]
#[rtype(result = "Vec<AppSummary>")]
pub struct ListApps;

#[derive(Message)]
#[rtype(result = "Result<Vec<CallbackSummary>, EngineError>")]
pub struct ListCallbacks {
    pub app_name: String,
}

pub struct EngineActor {
    registrations: HashMap<String, AppRegistration>,
    last_status: HashMap<String, AppStatus>,
    cache: Addr<CacheActor>,
    scheduler: Addr<SchedulerActor>,
    wire: Addr<WireClient>,
    entities: EntityCache,
    /// `subscription_id -> callback_id` for active `listen_trigger`
    /// registrations (populated once A's `subscribe_trigger` RPC returns).
    trigger_subs: HashMap<u32, String>,
    connected: bool,
    had_disconnect: bool,
}

impl EngineActor {
    pub fn new(cache: Addr<CacheActor>, scheduler: Addr<SchedulerActor>, wire: Addr<WireClient>, entities: EntityCache) -> Self {
        Self {
            registrations: HashMap::new(),
            last_status: HashMap::new(),
            cache,
            scheduler,
            wire,
            entities,
            trigger_subs: HashMap::new(),
            connected: false,
            had_disconnect: false,
        }
    }

    pub fn wire(&self) -> Addr<WireClient> {
        self.wire.clone()
    }

    pub fn entities(&self) -> EntityCache {
        self.entities.clone()
    }

    fn set_status(&mut self, app_name: &str, status: AppStatus) {
        self.last_status.insert(app_name.to_string(), status);
    }

    fn start_app(&mut self, app_name: String, ctx: &mut Context<Self>) {
        let Some(registration) = self.registrations.get_mut(&app_name) else { return };
        if registration.active_instance.is_some() {
            return;
        }
        let mut instance = AppInstance::new(registration.factory.create());
        let _ = instance.status_machine.consume(&AppStatusMachineInput::Initialize);
        let app = instance.app.take();
        let config = registration.config.clone();
        registration.active_instance = Some(instance);
        self.set_status(&app_name, AppStatus::Initializing);

        let app_context =
            AppContext { app_name: app_name.clone(), config, engine: ctx.address(), wire: self.wire.clone(), entities: self.entities.clone() };
        let logger_target = self.app_logger_target(&app_name);

        let fut = crate::context::scoped(logger_target, async move {
            let mut app = app;
            let result = match app.as_mut() {
                Some(app) => app.initialize(app_context).await,
                None => Err(anyhow::anyhow!("app factory produced no instance")),
            };
            (app, result)
        });

        ctx.spawn(actix::fut::wrap_future::<_, Self>(fut).map(move |(app, result), act, ctx| {
            let Some(registration) = act.registrations.get_mut(&app_name) else { return };
            let Some(instance) = registration.active_instance.as_mut() else { return };
            instance.app = app;
            match result {
                Ok(()) => {
                    let _ = instance.status_machine.consume(&AppStatusMachineInput::InitSucceeded);
                    act.set_status(&app_name, AppStatus::Running);
                    act.flush_deferred(&app_name, ctx);
                }
                Err(e) => {
                    error!("app `{app_name}` failed to initialize: {e:?}");
                    let _ = instance.status_machine.consume(&AppStatusMachineInput::InitFailed);
                    act.set_status(&app_name, AppStatus::Failed);
                    act.terminate_app(app_name, ctx);
                }
            }
        }));
    }

    fn flush_deferred(&mut self, app_name: &str, ctx: &mut Context<Self>) {
        let Some(registration) = self.registrations.get_mut(app_name) else { return };
        let Some(instance) = registration.active_instance.as_mut() else { return };
        let ids = std::mem::take(&mut instance.deferred);
        for id in ids {
            if let Some(reg) = instance.callbacks.get_mut(&id) {
                reg.is_registered = true;
            }
            Self::register_with_owner(&self.scheduler, &self.cache, &self.wire, instance, &id, ctx);
        }
    }

    /// Sends the registration to C (scheduler), B (event bus), or A directly
    /// (trigger subscriptions), whichever owns this callback's action.
    fn register_with_owner(
        scheduler: &Addr<SchedulerActor>,
        cache: &Addr<CacheActor>,
        wire: &Addr<WireClient>,
        instance: &AppInstance,
        id: &str,
        ctx: &mut Context<EngineActor>,
    ) {
        let Some(reg) = instance.callbacks.get(id) else { return };
        match &reg.action {
            CallbackAction::Scheduler { trigger, .. } => {
                let recipient = ctx.address().recipient::<JobFired>();
                let scheduler = scheduler.clone();
                let job_id = id.to_string();
                let trigger = trigger.clone();
                actix::spawn(async move {
                    if let Err(e) = scheduler.send(ScheduleJob { job_id, trigger, recipient }).await {
                        error!("failed to reach scheduler: {e}");
                    }
                });
            }
            CallbackAction::State { entity_id, .. } => {
                let recipient = ctx.address().recipient::<Deliver>();
                let _ = cache.do_send(Subscribe {
                    event_name: format!("state_changed={entity_id}"),
                    registration_id: id.to_string(),
                    recipient,
                });
            }
            CallbackAction::Event { events, .. } => {
                for event in events {
                    let recipient = ctx.address().recipient::<Deliver>();
                    let _ = cache.do_send(Subscribe { event_name: event.clone(), registration_id: id.to_string(), recipient });
                }
            }
            CallbackAction::Trigger { trigger, .. } => {
                let recipient = ctx.address().recipient::<InboundTrigger>();
                let wire = wire.clone();
                let self_addr = ctx.address();
                let callback_id = id.to_string();
                let trigger = trigger.clone();
                actix::spawn(async move {
                    match wire.send(SubscribeTrigger { trigger, recipient }).await {
                        Ok(Ok(subscription_id)) => {
                            self_addr.do_send(TriggerSubscribed { callback_id, subscription_id });
                        }
                        Ok(Err(e)) => error!("listen_trigger: subscribe_trigger failed: {e}"),
                        Err(e) => error!("listen_trigger: failed to reach wire client: {e}"),
                    }
                });
            }
        }
    }

    fn terminate_app(&mut self, app_name: String, ctx: &mut Context<Self>) {
        let Some(registration) = self.registrations.get_mut(&app_name) else { return };
        let Some(mut instance) = registration.active_instance.take() else { return };

        for (id, reg) in instance.callbacks.drain() {
            self.cancel_side_effects(&id, &reg);
        }

        let was_failed = instance.status() == AppStatus::Failed;
        if !was_failed {
            let _ = instance.status_machine.consume(&AppStatusMachineInput::Terminate);
            self.set_status(&app_name, AppStatus::Finalizing);
        }

        let app = instance.app.take();
        let logger_target = self.app_logger_target(&app_name);
        let fut = crate::context::scoped(logger_target, async move {
            let mut app = app;
            if let Some(app) = app.as_mut() {
                if let Err(e) = app.finalize().await {
                    warn!("app `{app_name}` finalize() failed (swallowed): {e:?}");
                }
            }
            app_name
        });

        ctx.spawn(actix::fut::wrap_future::<_, Self>(fut).map(move |app_name, act, _ctx| {
            act.set_status(&app_name, AppStatus::Terminated);
            if let Some(registration) = act.registrations.get_mut(&app_name) {
                registration.active_instance = None;
            }
        }));
    }

    fn cancel_side_effects(&mut self, id: &str, reg: &CallbackRegistration) {
        if !reg.is_registered {
            return;
        }
        match &reg.action {
            CallbackAction::Scheduler { .. } => {
                let _ = self.scheduler.do_send(RemoveJob { job_id: id.to_string() });
            }
            CallbackAction::State { entity_id, .. } => {
                let _ = self.cache.do_send(Unsubscribe { event_name: format!("state_changed={entity_id}"), registration_id: id.to_string() });
            }
            CallbackAction::Event { events, .. } => {
                for event in events {
                    let _ = self.cache.do_send(Unsubscribe { event_name: event.clone(), registration_id: id.to_string() });
                }
            }
            CallbackAction::Trigger { .. } => {
                let subscription_id = self.trigger_subs.iter().find(|(_, cb_id)| cb_id.as_str() == id).map(|(sub_id, _)| *sub_id);
                if let Some(subscription_id) = subscription_id {
                    self.trigger_subs.remove(&subscription_id);
                    let _ = self.wire.do_send(UnsubscribeEvents { subscription_id });
                }
            }
        }
    }

    /// Establishes B's master `subscribe_events` listener: individual apps'
    /// `listen_state`/`listen_event` registrations ride on this single
    /// upstream subscription rather than opening one per app (spec §4.2).
    fn subscribe_master_events(&self) {
        let wire = self.wire.clone();
        let recipient = self.cache.clone().recipient::<InboundEvent>();
        actix::spawn(async move {
            if let Err(e) = wire.send(SubscribeEvents { event_type: None, recipient }).await {
                error!("failed to subscribe the state cache to Home Assistant's event stream: {e}");
            }
        });
    }

    /// Subscription ids are not carried across a reconnect (spec §4.1), so
    /// the master `subscribe_events` feed and every live trigger subscription
    /// must be redone once the wire client is back up (spec §9 open question
    /// (a)). State/event listeners live entirely inside B and need no action.
    fn resubscribe_after_reconnect(&mut self, ctx: &mut Context<Self>) {
        self.trigger_subs.clear();
        self.subscribe_master_events();

        for registration in self.registrations.values() {
            let Some(instance) = registration.active_instance.as_ref() else { continue };
            for (id, reg) in &instance.callbacks {
                if !reg.is_registered {
                    continue;
                }
                if let CallbackAction::Trigger { trigger, .. } = &reg.action {
                    let recipient = ctx.address().recipient::<InboundTrigger>();
                    let wire = self.wire.clone();
                    let self_addr = ctx.address();
                    let callback_id = id.clone();
                    let trigger = trigger.clone();
                    actix::spawn(async move {
                        match wire.send(SubscribeTrigger { trigger, recipient }).await {
                            Ok(Ok(subscription_id)) => {
                                self_addr.do_send(TriggerSubscribed { callback_id, subscription_id });
                            }
                            Ok(Err(e)) => error!("failed to re-subscribe trigger `{callback_id}` after reconnect: {e}"),
                            Err(e) => error!("failed to reach wire client to re-subscribe trigger `{callback_id}`: {e}"),
                        }
                    });
                }
            }
        }
    }

    fn app_logger_target(&self, app_name: &str) -> String {
        let logging_name = self.registrations.get(app_name).map(|r| r.logging_config_name.clone()).unwrap_or_else(|| "default".to_string());
        format!("apps::{logging_name}::{app_name}")
    }
}

impl Actor for EngineActor {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        self.subscribe_master_events();
    }
}

impl Handler<RegisterApp> for EngineActor {
    type Result = Result<(), EngineError>;

    fn handle(&mut self, msg: RegisterApp, ctx: &mut Self::Context) -> Self::Result {
        if self.registrations.contains_key(&msg.app_name) {
            return Err(EngineError::AppAlreadyRegistered(msg.app_name));
        }
        let registration = AppRegistration {
            app_name: msg.app_name.clone(),
            source_path: msg.source_path,
            class_descriptor: msg.class_descriptor,
            config: msg.config,
            logging_config_name: msg.logging_config_name,
            factory: msg.factory,
            active_instance: None,
        };
        self.registrations.insert(msg.app_name.clone(), registration);
        self.set_status(&msg.app_name, AppStatus::Created);
        self.start_app(msg.app_name, ctx);
        Ok(())
    }
}

impl Handler<TerminateApp> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: TerminateApp, ctx: &mut Self::Context) -> Self::Result {
        self.terminate_app(msg.app_name, ctx);
    }
}

impl Handler<ReloadApp> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: ReloadApp, ctx: &mut Self::Context) -> Self::Result {
        self.terminate_app(msg.app_name.clone(), ctx);
        ctx.run_later(std::time::Duration::from_millis(0), move |act, ctx| act.start_app(msg.app_name, ctx));
    }
}

impl Handler<TerminateAllAppsBeforeEngineStop> for EngineActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, _msg: TerminateAllAppsBeforeEngineStop, ctx: &mut Self::Context) -> Self::Result {
        let names: Vec<String> = self.registrations.keys().cloned().collect();
        let addr = ctx.address();
        Box::pin(actix::fut::wrap_future(async move {
            join_all(names.into_iter().map(|name| {
                let addr = addr.clone();
                async move {
                    let _ = addr.send(TerminateApp { app_name: name }).await;
                }
            }))
            .await;
        }))
    }
}

impl Handler<TerminateAppsForPaths> for EngineActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: TerminateAppsForPaths, ctx: &mut Self::Context) -> Self::Result {
        let paths: std::collections::HashSet<PathBuf> = msg.paths.into_iter().collect();
        let names: Vec<String> =
            self.registrations.iter().filter(|(_, reg)| paths.contains(&reg.source_path)).map(|(name, _)| name.clone()).collect();
        let addr = ctx.address();
        Box::pin(actix::fut::wrap_future(async move {
            join_all(names.into_iter().map(|name| {
                let addr = addr.clone();
                async move {
                    let _ = addr.send(TerminateApp { app_name: name.clone() }).await;
                    let _ = addr.send(DropRegistration { app_name: name }).await;
                }
            }))
            .await;
        }))
    }
}

impl Handler<DropRegistration> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: DropRegistration, _ctx: &mut Self::Context) -> Self::Result {
        self.registrations.remove(&msg.app_name);
    }
}

/// Bridges the Wire Client's (A) connection lifecycle into the same
/// bulk-stop/bulk-start machinery the `homeassistant_stop`/`_started`
/// HA-side events drive (spec §4.2), for the transport-level case where the
/// WebSocket itself drops and reconnects.
impl Handler<ConnectionEvent> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: ConnectionEvent, ctx: &mut Self::Context) -> Self::Result {
        match msg.state {
            ConnectionState::Disconnected | ConnectionState::AuthenticationFailed => {
                if self.connected {
                    self.connected = false;
                    self.had_disconnect = true;
                    ctx.notify(BulkStopApps { reason: StopReason::ConnectionLost });
                }
            }
            ConnectionState::Connected => {
                let was_connected = self.connected;
                self.connected = true;
                if !was_connected && self.had_disconnect {
                    self.resubscribe_after_reconnect(ctx);
                    ctx.notify(BulkStartApps { after_unexpected_disconnect: true });
                }
            }
            ConnectionState::Connecting => {}
        }
    }
}

impl Handler<BulkStopApps> for EngineActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: BulkStopApps, ctx: &mut Self::Context) -> Self::Result {
        info!("bulk stop: reason={:?}", msg.reason);
        let names: Vec<String> = self.registrations.values().filter(|r| r.active_instance.is_some()).map(|r| r.app_name.clone()).collect();
        let addr = ctx.address();
        Box::pin(actix::fut::wrap_future(async move {
            join_all(names.into_iter().map(|name| {
                let addr = addr.clone();
                async move {
                    let _ = addr.send(TerminateApp { app_name: name }).await;
                }
            }))
            .await;
        }))
    }
}

impl Handler<BulkStartApps> for EngineActor {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: BulkStartApps, ctx: &mut Self::Context) -> Self::Result {
        let names: Vec<String> = self.registrations.values().filter(|r| r.active_instance.is_none()).map(|r| r.app_name.clone()).collect();
        let addr = ctx.address();
        let wire = self.wire.clone();
        Box::pin(actix::fut::wrap_future(async move {
            if msg.after_unexpected_disconnect {
                wait_for_hass_up(&wire).await;
            }
            join_all(names.into_iter().map(|name| {
                let addr = addr.clone();
                async move { addr.do_send(crate::engine::StartApp { app_name: name }) }
            }))
            .await;
        }))
    }
}

/// Internal message used to re-arm `start_app` after the async gather in
/// `BulkStartApps` (which cannot hold `&mut self` across the probe).
#[derive(Message)]
#[rtype(result = "()")]
pub struct StartApp {
    pub app_name: String,
}

impl Handler<StartApp> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: StartApp, ctx: &mut Self::Context) -> Self::Result {
        self.start_app(msg.app_name, ctx);
    }
}

async fn wait_for_hass_up(wire: &Addr<WireClient>) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(300);
    loop {
        if wire.send(crate::wire::GetStates).await.is_ok_and(|r| r.is_ok()) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("Home Assistant did not report ready within 5 minutes, starting apps anyway");
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

impl Handler<AddSchedulerCallback> for EngineActor {
    type Result = Result<String, EngineError>;

    fn handle(&mut self, msg: AddSchedulerCallback, ctx: &mut Self::Context) -> Self::Result {
        let registration = self.registrations.get_mut(&msg.app_name).ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;
        let instance = registration.active_instance.as_mut().ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;

        let id = callback::new_scheduler_id();
        let running = instance.status() == AppStatus::Running;
        instance.callbacks.insert(
            id.clone(),
            CallbackRegistration {
                id: id.clone(),
                is_registered: running,
                times_called: 0,
                last_call: None,
                last_error: None,
                action: CallbackAction::Scheduler { description: msg.description, trigger: msg.trigger, callback: msg.callback },
            },
        );
        if running {
            Self::register_with_owner(&self.scheduler, &self.cache, &self.wire, instance, &id, ctx);
        } else {
            instance.deferred.push(id.clone());
        }
        Ok(id)
    }
}

impl Handler<AddEventCallback> for EngineActor {
    type Result = Result<String, EngineError>;

    fn handle(&mut self, msg: AddEventCallback, ctx: &mut Self::Context) -> Self::Result {
        let registration = self.registrations.get_mut(&msg.app_name).ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;
        let instance = registration.active_instance.as_mut().ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;

        let id = callback::new_event_id();
        let running = instance.status() == AppStatus::Running;
        instance.callbacks.insert(
            id.clone(),
            CallbackRegistration {
                id: id.clone(),
                is_registered: running,
                times_called: 0,
                last_call: None,
                last_error: None,
                action: CallbackAction::Event { events: msg.events.clone(), callback: msg.callback },
            },
        );
        if running {
            for event in &msg.events {
                let recipient = ctx.address().recipient::<Deliver>();
                let _ = self.cache.do_send(Subscribe { event_name: event.clone(), registration_id: id.clone(), recipient });
            }
        } else {
            instance.deferred.push(id.clone());
        }
        Ok(id)
    }
}

impl Handler<ListenState> for EngineActor {
    type Result = Result<String, EngineError>;

    fn handle(&mut self, msg: ListenState, ctx: &mut Self::Context) -> Self::Result {
        let registration = self.registrations.get_mut(&msg.app_name).ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;
        let instance = registration.active_instance.as_mut().ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;

        let id = callback::new_event_id();
        let running = instance.status() == AppStatus::Running;
        instance.callbacks.insert(
            id.clone(),
            CallbackRegistration {
                id: id.clone(),
                is_registered: running,
                times_called: 0,
                last_call: None,
                last_error: None,
                action: CallbackAction::State {
                    entity_id: msg.entity_id.clone(),
                    attribute: msg.attribute,
                    oneshot: msg.oneshot,
                    callback: msg.callback.clone(),
                },
            },
        );
        if running {
            let recipient = ctx.address().recipient::<Deliver>();
            let _ = self.cache.do_send(Subscribe { event_name: format!("state_changed={}", msg.entity_id), registration_id: id.clone(), recipient });
        } else {
            instance.deferred.push(id.clone());
        }

        if msg.immediate {
            let current = self.entities.get(&msg.entity_id);
            let ephemeral_id = callback::new_ephemeral_id();
            let callback = msg.callback;
            let entity_id = msg.entity_id;
            let logger_target = self.app_logger_target(&msg.app_name);
            actix::spawn(async move {
                let delivery = StateDelivery { entity_id, attribute: "state".to_string(), old: None, new: current };
                let outcome = instrument::run_instrumented(logger_target, ephemeral_id, callback(delivery)).await;
                if let Some(err) = outcome.error {
                    trace_immediate_failure(&err);
                }
            });
        }
        Ok(id)
    }
}

fn trace_immediate_failure(err: &str) {
    log::trace!("immediate listener delivery failed: {err}");
}

impl Handler<CancelCallback> for EngineActor {
    type Result = Result<(), CallbackError>;

    fn handle(&mut self, msg: CancelCallback, _ctx: &mut Self::Context) -> Self::Result {
        callback::validate_prefix(&msg.callback_id)?;
        let Some(registration) = self.registrations.get_mut(&msg.app_name) else {
            // App already gone (e.g. FAILED then terminated): at-most-once cancel is a no-op.
            return Ok(());
        };
        let Some(instance) = registration.active_instance.as_mut() else { return Ok(()) };
        if let Some(reg) = instance.callbacks.remove(&msg.callback_id) {
            self.cancel_side_effects(&msg.callback_id, &reg);
        }
        Ok(())
    }
}

impl Handler<AddTriggerCallback> for EngineActor {
    type Result = Result<String, EngineError>;

    fn handle(&mut self, msg: AddTriggerCallback, ctx: &mut Self::Context) -> Self::Result {
        let registration = self.registrations.get_mut(&msg.app_name).ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;
        let instance = registration.active_instance.as_mut().ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;

        let id = callback::new_event_id();
        let running = instance.status() == AppStatus::Running;
        instance.callbacks.insert(
            id.clone(),
            CallbackRegistration {
                id: id.clone(),
                is_registered: running,
                times_called: 0,
                last_call: None,
                last_error: None,
                action: CallbackAction::Trigger { trigger: msg.trigger, callback: msg.callback },
            },
        );
        if running {
            Self::register_with_owner(&self.scheduler, &self.cache, &self.wire, instance, &id, ctx);
        } else {
            instance.deferred.push(id.clone());
        }
        Ok(id)
    }
}

impl Handler<TriggerSubscribed> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: TriggerSubscribed, _ctx: &mut Self::Context) -> Self::Result {
        self.trigger_subs.insert(msg.subscription_id, msg.callback_id);
    }
}

impl Handler<InboundTrigger> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: InboundTrigger, ctx: &mut Self::Context) -> Self::Result {
        let Some(callback_id) = self.trigger_subs.get(&msg.subscription_id).cloned() else { return };
        let Some(app_name) = self.owner_of(&callback_id) else { return };
        let logger_target = self.app_logger_target(&app_name);

        let Some(registration) = self.registrations.get_mut(&app_name) else { return };
        let Some(instance) = registration.active_instance.as_mut() else { return };
        if instance.status() != AppStatus::Running {
            instrument::warn_not_running(&logger_target, &callback_id, &app_name);
            return;
        }
        let Some(reg) = instance.callbacks.get_mut(&callback_id) else { return };
        let CallbackAction::Trigger { callback, .. } = &reg.action else { return };
        reg.times_called += 1;
        reg.last_call = Some(instrument::now());
        let callback = callback.clone();

        ctx.spawn(
            actix::fut::wrap_future(instrument::run_instrumented(logger_target, callback_id.clone(), callback(msg.variables))).map(
                move |outcome, act: &mut EngineActor, _ctx| {
                    if let Some(registration) = act.registrations.get_mut(&app_name) {
                        if let Some(instance) = registration.active_instance.as_mut() {
                            if let Some(reg) = instance.callbacks.get_mut(&callback_id) {
                                reg.last_error = outcome.error;
                            }
                        }
                    }
                },
            ),
        );
    }
}

impl Handler<ListApps> for EngineActor {
    type Result = MessageResult<ListApps>;

    fn handle(&mut self, _msg: ListApps, _ctx: &mut Self::Context) -> Self::Result {
        let summaries = self
            .registrations
            .values()
            .map(|r| AppSummary {
                app_name: r.app_name.clone(),
                class_descriptor: r.class_descriptor.clone(),
                source_path: r.source_path.display().to_string(),
                status: *self.last_status.get(&r.app_name).unwrap_or(&AppStatus::Created),
            })
            .collect();
        MessageResult(summaries)
    }
}

impl Handler<ListCallbacks> for EngineActor {
    type Result = Result<Vec<CallbackSummary>, EngineError>;

    fn handle(&mut self, msg: ListCallbacks, _ctx: &mut Self::Context) -> Self::Result {
        let registration = self.registrations.get(&msg.app_name).ok_or_else(|| EngineError::UnknownApp(msg.app_name.clone()))?;
        let Some(instance) = registration.active_instance.as_ref() else { return Ok(vec![]) };
        Ok(instance
            .callbacks
            .values()
            .map(|reg| CallbackSummary {
                id: reg.id.clone(),
                kind: match reg.kind() {
                    CallbackKind::Scheduler => "scheduler",
                    CallbackKind::Event => "event",
                },
                is_registered: reg.is_registered,
                times_called: reg.times_called,
                last_call: reg.last_call,
                last_error: reg.last_error.clone(),
                trigger_description: reg.trigger_description(),
                events: reg.event_names(),
            })
            .collect())
    }
}

enum DeliveryPlan {
    Skip,
    Invoke { fut: BoxFuture<'static, anyhow::Result<()>>, remove_after: bool },
}

impl Handler<Deliver> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) -> Self::Result {
        let app_name = match self.owner_of(&msg.registration_id) {
            Some(name) => name,
            None => return,
        };
        let logger_target = self.app_logger_target(&app_name);

        let Some(registration) = self.registrations.get_mut(&app_name) else { return };
        let Some(instance) = registration.active_instance.as_mut() else { return };
        if instance.status() != AppStatus::Running {
            instrument::warn_not_running(&logger_target, &msg.registration_id, &app_name);
            return;
        }

        let plan = {
            let Some(reg) = instance.callbacks.get_mut(&msg.registration_id) else { return };
            match &mut reg.action {
                CallbackAction::Event { callback, .. } => {
                    reg.times_called += 1;
                    reg.last_call = Some(instrument::now());
                    let callback = callback.clone();
                    let delivery = EventDelivery { event_type: msg.event_type.clone(), data: msg.data.clone() };
                    DeliveryPlan::Invoke { fut: callback(delivery), remove_after: false }
                }
                CallbackAction::State { attribute, callback, oneshot, entity_id, .. } => {
                    let old = msg.data.get("old_state").cloned().unwrap_or(Value::Null);
                    let new = msg.data.get("new_state").cloned().unwrap_or(Value::Null);
                    let old_state = EntityState::from_json(&old);
                    let new_state = EntityState::from_json(&new);

                    let deliver = match attribute.as_str() {
                        "all" => true,
                        "state" => old_state.as_ref().map(|s| &s.state) != new_state.as_ref().map(|s| &s.state),
                        attr => {
                            old_state.as_ref().and_then(|s| s.attributes.get(attr)) != new_state.as_ref().and_then(|s| s.attributes.get(attr))
                        }
                    };
                    if !deliver {
                        DeliveryPlan::Skip
                    } else {
                        reg.times_called += 1;
                        reg.last_call = Some(instrument::now());
                        let callback = callback.clone();
                        let remove_after = *oneshot;
                        let delivery =
                            StateDelivery { entity_id: entity_id.clone(), attribute: attribute.clone(), old: old_state, new: new_state };
                        DeliveryPlan::Invoke { fut: callback(delivery), remove_after }
                    }
                }
                CallbackAction::Scheduler { .. } => DeliveryPlan::Skip,
                CallbackAction::Trigger { .. } => DeliveryPlan::Skip,
            }
        };

        let fut = match plan {
            DeliveryPlan::Skip => return,
            DeliveryPlan::Invoke { fut, remove_after } => {
                if remove_after {
                    // Deregister strictly before the callback body runs (spec §4.4/§8.5).
                    if let Some(reg) = instance.callbacks.remove(&msg.registration_id) {
                        self.cancel_side_effects(&msg.registration_id, &reg);
                    }
                }
                fut
            }
        };

        let callback_id = msg.registration_id.clone();
        ctx.spawn(
            actix::fut::wrap_future(instrument::run_instrumented(logger_target, callback_id.clone(), fut)).map(move |outcome, act: &mut EngineActor, _ctx| {
                if let Some(registration) = act.registrations.get_mut(&app_name) {
                    if let Some(instance) = registration.active_instance.as_mut() {
                        if let Some(reg) = instance.callbacks.get_mut(&callback_id) {
                            reg.last_error = outcome.error;
                        }
                    }
                }
            }),
        );
    }
}

impl Handler<JobFired> for EngineActor {
    type Result = ();

    fn handle(&mut self, msg: JobFired, ctx: &mut Self::Context) -> Self::Result {
        let app_name = match self.owner_of(&msg.job_id) {
            Some(name) => name,
            None => return,
        };
        let logger_target = self.app_logger_target(&app_name);

        let Some(registration) = self.registrations.get_mut(&app_name) else { return };
        let Some(instance) = registration.active_instance.as_mut() else { return };
        if instance.status() != AppStatus::Running {
            instrument::warn_not_running(&logger_target, &msg.job_id, &app_name);
            return;
        }
        let Some(reg) = instance.callbacks.get_mut(&msg.job_id) else { return };
        let CallbackAction::Scheduler { callback, .. } = &reg.action else { return };
        reg.times_called += 1;
        reg.last_call = Some(instrument::now());
        let callback = callback.clone();

        let job_id = msg.job_id.clone();
        ctx.spawn(actix::fut::wrap_future(instrument::run_instrumented(logger_target, job_id.clone(), callback())).map(
            move |outcome, act: &mut EngineActor, _ctx| {
                if let Some(registration) = act.registrations.get_mut(&app_name) {
                    if let Some(instance) = registration.active_instance.as_mut() {
                        if let Some(reg) = instance.callbacks.get_mut(&job_id) {
                            reg.last_error = outcome.error;
                        }
                    }
                }
            },
        ));
    }
}

impl EngineActor {
    fn owner_of(&self, callback_id: &str) -> Option<String> {
        self.registrations
            .values()
            .find(|r| r.active_instance.as_ref().is_some_and(|i| i.callbacks.contains_key(callback_id)))
            .map(|r| r.app_name.clone())
    }
}
