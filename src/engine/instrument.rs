//! The callback instrumentation wrapper (spec §4.4): every user callback
//! invocation goes through here so bookkeeping and failure isolation are
//! applied uniformly regardless of whether the call came from the scheduler
//! or the event bus.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use log::{error, trace, warn};

use crate::callback::BoxFuture;

/// Marker error an app can return to have a failure logged quietly (spec
/// §4.4's `LogOnDebug` family) instead of as a loud application error —
/// e.g. an expected race during shutdown.
#[derive(Debug)]
pub struct LogOnDebug(pub String);

impl fmt::Display for LogOnDebug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for LogOnDebug {}

/// Bound on a single user-callback invocation (spec §4.1/§5). Enforced here
/// rather than at the wire layer: the wire client already dispatches to
/// subscribers through non-blocking actor mailboxes, so the only place a
/// callback can actually run unboundedly long is where its body executes.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct InvocationOutcome {
    pub error: Option<String>,
}

/// Runs `fut`, classifying the outcome the way spec §4.4 describes. Callers
/// are expected to have already checked app status and bumped
/// `times_called`/`last_call` synchronously before this future is polled.
pub async fn run_instrumented(logger_target: String, callback_id: String, fut: BoxFuture<'static, anyhow::Result<()>>) -> InvocationOutcome {
    let fut = crate::context::scoped(logger_target.clone(), fut);
    match tokio::time::timeout(CALLBACK_TIMEOUT, fut).await {
        Ok(Ok(())) => InvocationOutcome { error: None },
        Ok(Err(e)) => {
            if let Some(quiet) = e.downcast_ref::<LogOnDebug>() {
                trace!(target: &logger_target, "[{callback_id}] {quiet}");
            } else {
                error!(target: &logger_target, "[{callback_id}] callback failed: {e:?}");
            }
            InvocationOutcome { error: Some(e.to_string()) }
        }
        Err(_) => {
            trace!(target: &logger_target, "[{callback_id}] callback exceeded {CALLBACK_TIMEOUT:?}, dropping invocation");
            InvocationOutcome { error: Some(format!("timed out after {CALLBACK_TIMEOUT:?}")) }
        }
    }
}

pub fn warn_not_running(logger_target: &str, callback_id: &str, app_name: &str) {
    warn!(target: logger_target, "[{callback_id}] refusing to invoke callback: app `{app_name}` is not RUNNING");
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
