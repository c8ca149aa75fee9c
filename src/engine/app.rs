//! App registration/instance records and the capability struct handed to
//! user code (spec §3 `AppRegistration`/`AppInstance`, §9 "Deep inheritance").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use actix::Addr;

use crate::callback::{BoxFuture, CallbackRegistration};
use crate::cache::EntityCache;
use crate::engine::status::{AppStatus, AppStatusMachine};
use crate::engine::EngineActor;
use crate::facade::HassFacade;
use crate::wire::WireClient;

/// Two hooks are all user code provides; everything else is reached through
/// the capability struct passed into `initialize`.
pub trait App: Send {
    fn initialize(&mut self, ctx: AppContext) -> BoxFuture<'_, anyhow::Result<()>>;
    fn finalize(&mut self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

pub trait AppFactory: Send + Sync {
    fn create(&self) -> Box<dyn App>;
}

/// Capability struct passed to `initialize`/`finalize` in place of deep
/// inheritance (spec §9): apps reach the engine, facade and scheduler only
/// through this handle.
#[derive(Clone)]
pub struct AppContext {
    pub app_name: String,
    pub config: serde_json::Value,
    pub engine: Addr<EngineActor>,
    pub(crate) wire: Addr<WireClient>,
    pub(crate) entities: EntityCache,
}

impl AppContext {
    /// Typed wrappers over the Wire Client (A) and State Cache (B), plus the
    /// Callback Register (D) sugar a running app actually calls (spec §9).
    pub fn hass(&self) -> HassFacade {
        HassFacade::new(self.app_name.clone(), self.engine.clone(), self.wire.clone(), self.entities.clone())
    }

    /// The `log` target this app's `initialize`/`finalize`/callback
    /// invocation is currently scoped under, for app code that wants to log
    /// through the same per-app routing the engine uses internally.
    pub fn log_target(&self) -> String {
        crate::context::current_logger_target()
    }
}

/// Durable descriptor of an app: survives reload, created once by
/// `register_app`.
pub struct AppRegistration {
    pub app_name: String,
    pub source_path: PathBuf,
    pub class_descriptor: String,
    pub config: serde_json::Value,
    pub logging_config_name: String,
    pub factory: Arc<dyn AppFactory>,
    pub active_instance: Option<AppInstance>,
}

/// Runtime embodiment of a registration; created on start, destroyed on
/// terminate.
///
/// `app` is `None` only while its `initialize`/`finalize` future is
/// in flight elsewhere (moved out so the engine can keep mutating
/// `callbacks`/`deferred` — e.g. a callback an app registers on itself
/// during `initialize` — without waiting on that future).
pub struct AppInstance {
    pub status_machine: rust_fsm::StateMachine<AppStatusMachine>,
    pub app: Option<Box<dyn App>>,
    pub callbacks: HashMap<String, CallbackRegistration>,
    /// Callback ids registered on this instance but not yet flushed into
    /// B/C because the instance wasn't RUNNING yet (spec §4.4).
    pub deferred: Vec<String>,
}

impl AppInstance {
    pub fn new(app: Box<dyn App>) -> Self {
        Self {
            status_machine: rust_fsm::StateMachine::new(),
            app: Some(app),
            callbacks: HashMap::new(),
            deferred: Vec::new(),
        }
    }

    pub fn status(&self) -> AppStatus {
        AppStatus::from(self.status_machine.state())
    }
}
