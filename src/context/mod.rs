//! Per-invocation logging context: lets app code log through the same
//! per-app `log` target the engine uses to instrument callbacks (spec §6
//! logging configuration), without threading the target string through
//! every `App` method signature.

tokio::task_local! {
    static CURRENT_LOGGER_TARGET: String;
}

/// Runs `fut` with `target` bound as the current logger target, readable via
/// [`current_logger_target`] from anywhere inside `fut`'s call tree.
pub async fn scoped<F: std::future::Future>(target: String, fut: F) -> F::Output {
    CURRENT_LOGGER_TARGET.scope(target, fut).await
}

/// The logger target for the app/callback currently executing, falling back
/// to `"default"` outside of any scoped invocation (e.g. early engine
/// startup, tests).
pub fn current_logger_target() -> String {
    CURRENT_LOGGER_TARGET.try_with(|t| t.clone()).unwrap_or_else(|_| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn falls_back_to_default_outside_scope() {
        assert_eq!(current_logger_target(), "default");
    }

    #[tokio::test]
    async fn reads_back_the_scoped_target() {
        let target = scoped("apps::default::porch_light".to_string(), async { current_logger_target() }).await;
        assert_eq!(target, "apps::default::porch_light");
    }
}
