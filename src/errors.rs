//! Runtime error taxonomy with conversions from common and 3rd-party errors.

use derive_more::Display;

/// Errors from the Wire Client (A): transport, auth and command failures.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum WireError {
    #[display("Authentication with Home Assistant failed")]
    AuthFailed,
    #[display("Connection lost or unreachable: {_0}")]
    ConnErr(String),
    #[display("Home Assistant returned an error (code {code}): {message}")]
    CommandErr { code: String, message: String },
    #[display("Malformed frame: {_0}")]
    Parse(String),
    #[display("The connection is closed or closing")]
    NotConnected,
}

impl std::error::Error for WireError {}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Parse(e.to_string())
    }
}

/// Errors from the Scheduler (C).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[display("run_at datetime is in the past")]
    PastDatetime,
    #[display("interval must have at least one non-zero component")]
    EmptyInterval,
    #[display("job id `{_0}` is already registered")]
    DuplicateJobId(String),
    #[display("job id `{_0}` is not registered")]
    UnknownJobId(String),
}

impl std::error::Error for SchedulerError {}

/// Errors from the Callback Register (D).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum CallbackError {
    #[display("invalid callback id `{_0}`: missing or unknown prefix")]
    InvalidCallbackId(String),
    #[display("unknown plugin: {_0}")]
    UnknownPlugin(String),
}

impl std::error::Error for CallbackError {}

/// Errors from the App Engine (F).
#[derive(Debug, Display, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[display("app `{_0}` is already registered")]
    AppAlreadyRegistered(String),
    #[display("app `{_0}` is not registered")]
    UnknownApp(String),
    #[display("initialize() failed for app `{app}`: {reason}")]
    InitFailed { app: String, reason: String },
}

impl std::error::Error for EngineError {}

/// Errors from the HA Facade (E), including waits.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum FacadeError {
    #[display("{_0}")]
    Wire(WireError),
    #[display("timed out waiting for condition")]
    Timeout,
    #[display("unknown entity: {_0}")]
    UnknownEntity(String),
    #[display("{_0}")]
    Engine(EngineError),
    #[display("{_0}")]
    Callback(CallbackError),
}

impl std::error::Error for FacadeError {}

impl From<WireError> for FacadeError {
    fn from(e: WireError) -> Self {
        FacadeError::Wire(e)
    }
}

impl From<EngineError> for FacadeError {
    fn from(e: EngineError) -> Self {
        FacadeError::Engine(e)
    }
}

impl From<CallbackError> for FacadeError {
    fn from(e: CallbackError) -> Self {
        FacadeError::Callback(e)
    }
}

/// Single error currency for the binary's top-level `Result`.
#[derive(Debug, Display)]
pub enum RuntimeError {
    #[display("{_0}")]
    Wire(WireError),
    #[display("{_0}")]
    Scheduler(SchedulerError),
    #[display("{_0}")]
    Callback(CallbackError),
    #[display("{_0}")]
    Engine(EngineError),
    #[display("{_0}")]
    Facade(FacadeError),
    #[display("configuration error: {_0}")]
    Configuration(String),
    #[display("I/O error: {_0}")]
    Io(String),
}

impl std::error::Error for RuntimeError {}

impl From<WireError> for RuntimeError {
    fn from(e: WireError) -> Self {
        RuntimeError::Wire(e)
    }
}

impl From<SchedulerError> for RuntimeError {
    fn from(e: SchedulerError) -> Self {
        RuntimeError::Scheduler(e)
    }
}

impl From<CallbackError> for RuntimeError {
    fn from(e: CallbackError) -> Self {
        RuntimeError::Callback(e)
    }
}

impl From<EngineError> for RuntimeError {
    fn from(e: EngineError) -> Self {
        RuntimeError::Engine(e)
    }
}

impl From<FacadeError> for RuntimeError {
    fn from(e: FacadeError) -> Self {
        RuntimeError::Facade(e)
    }
}

impl From<config::ConfigError> for RuntimeError {
    fn from(e: config::ConfigError) -> Self {
        RuntimeError::Configuration(e.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e.to_string())
    }
}
