//! Wires the Reload Driver's (G) generic file-graph machinery to this
//! binary's app source tree. Turning a `*_apps` file into registered apps is
//! left to an embedder-supplied [`SourceLoader`](hearth_apps::reload::SourceLoader):
//! unlike the interpreted language this runtime's design is modeled on,
//! compiled Rust app code has no ABI-stable hot-reload story without a
//! dynamic-library plugin mechanism, which is out of scope here (see
//! DESIGN.md). This default scans `app_path` once at startup purely to seed
//! the dependency graph and report what it found.

use std::path::{Path, PathBuf};

use actix::{Addr, AsyncContext};
use log::{info, warn};

use hearth_apps::engine::EngineActor;
use hearth_apps::reload::{ImportResolver, SourceLoader};

/// No-op: this binary does not parse app source for `use`/`import`
/// statements, so every file is treated as having no forward imports. An
/// embedder with real app-loading also owns import extraction.
pub struct NoImports;

impl ImportResolver for NoImports {
    fn imports(&self, _path: &Path) -> anyhow::Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Reports that a file would be (re)loaded without attempting it (see module
/// docs). Replace with a real loader to actually register apps on reload.
pub struct LogOnlyLoader;

impl SourceLoader for LogOnlyLoader {
    fn load(&self, path: &Path) -> anyhow::Result<()> {
        warn!("reload: {} changed but no app loader is configured, skipping", path.display());
        Ok(())
    }
}

/// Logs the app-definition files found under `app_path` at startup. Does not
/// register any apps; see module docs.
pub async fn discover_apps(app_path: &Path, app_suffix: &str, _engine: &Addr<EngineActor>) {
    let mut found = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(app_path).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_app_definition = path.file_stem().and_then(|s| s.to_str()).map(|s| s.ends_with(app_suffix)).unwrap_or(false);
            if is_app_definition {
                found.push(path);
            }
        }
    }

    if found.is_empty() {
        info!("No app-definition files found under {}", app_path.display());
    } else {
        for path in &found {
            info!("Found app-definition file: {}", path.display());
        }
        warn!("App loading is not wired up in this binary; no apps were registered (see DESIGN.md)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_imports_resolver_reports_no_imports() {
        assert_eq!(NoImports.imports(Path::new("lights_apps.rs")).unwrap(), Vec::<PathBuf>::new());
    }

    #[test]
    fn log_only_loader_never_fails() {
        assert!(LogOnlyLoader.load(Path::new("lights_apps.rs")).is_ok());
    }

    #[actix::test]
    async fn discover_apps_scans_directory_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lights_apps.rs"), "").unwrap();
        std::fs::write(dir.path().join("helpers.rs"), "").unwrap();

        let engine_ctx: actix::Context<EngineActor> = actix::Context::new();
        let engine_addr = engine_ctx.address();
        discover_apps(dir.path(), "_apps", &engine_addr).await;
    }
}
