//! Reload Driver (G, spec §4.5): watches app source files on disk and
//! re-executes the lifecycle of the apps a changed file affects.
//!
//! The core only knows files and an "imports" relation between them; it does
//! not parse or compile anything itself (spec §1 Non-goals: the reload model
//! is language-neutral). Two collaborators are supplied by whatever embeds
//! this runtime: an [`ImportResolver`] that extracts a file's forward imports,
//! and a [`SourceLoader`] that turns a file back into registered apps (by
//! calling [`RegisterApp`](crate::engine::RegisterApp) as a side effect of
//! loading an app-definition file).

mod graph;

pub use graph::DependencyGraph;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use actix::prelude::*;
use log::{error, info, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::engine::{EngineActor, TerminateAppsForPaths};

const DEBOUNCE: Duration = Duration::from_millis(500);

/// A file changed on disk, already debounced to one event per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Deleted,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct PathChanged {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Extracts a file's forward imports. Implementations are free to interpret
/// "imports" however the embedding app-authoring language defines it.
pub trait ImportResolver: Send + Sync {
    fn imports(&self, path: &Path) -> anyhow::Result<Vec<PathBuf>>;
}

/// Turns a file into registered apps. Called once per node in a reload
/// closure, leaves (files with no further imports) first, so a module's
/// imports are already loaded by the time it loads itself.
pub trait SourceLoader: Send + Sync {
    fn load(&self, path: &Path) -> anyhow::Result<()>;
}

fn is_app_definition(path: &Path, app_suffix: &str) -> bool {
    path.file_stem().and_then(|s| s.to_str()).map(|stem| stem.ends_with(app_suffix)).unwrap_or(false)
}

/// Owns the dependency graph and turns debounced filesystem events into
/// terminate/load work against the engine. Runs as an ordinary actor so its
/// graph mutations are serialized with no locking of its own.
pub struct ReloadActor {
    graph: DependencyGraph,
    app_suffix: String,
    resolver: Arc<dyn ImportResolver>,
    loader: Arc<dyn SourceLoader>,
    engine: Addr<EngineActor>,
}

impl ReloadActor {
    pub fn new(app_suffix: String, resolver: Arc<dyn ImportResolver>, loader: Arc<dyn SourceLoader>, engine: Addr<EngineActor>) -> Self {
        Self { graph: DependencyGraph::new(), app_suffix, resolver, loader, engine }
    }

    fn handle_modified(&mut self, path: PathBuf, ctx: &mut Context<Self>) {
        let imports = match self.resolver.imports(&path) {
            Ok(imports) => imports,
            Err(e) => {
                warn!("reload: failed to resolve imports for {}: {e}", path.display());
                return;
            }
        };
        self.graph.set_imports(&path, imports);

        let mut affected: HashSet<PathBuf> = self.graph.forward_closure(&path);
        affected.extend(self.graph.reverse_closure(&path));

        if !affected.iter().any(|p| is_app_definition(p, &self.app_suffix)) {
            return;
        }

        let order = self.graph.leaves_first(&affected);
        let engine = self.engine.clone();
        let loader = self.loader.clone();
        let paths: Vec<PathBuf> = order.clone();

        ctx.spawn(actix::fut::wrap_future(async move {
            if let Err(e) = engine.send(TerminateAppsForPaths { paths }).await {
                error!("reload: failed to reach engine to terminate affected apps: {e}");
                return;
            }
            for path in order {
                if let Err(e) = loader.load(&path) {
                    error!("reload: failed to load {}: {e}", path.display());
                }
            }
        }));
    }

    fn handle_deleted(&mut self, path: PathBuf, ctx: &mut Context<Self>) {
        self.graph.remove_node(&path);
        let engine = self.engine.clone();
        ctx.spawn(actix::fut::wrap_future(async move {
            if let Err(e) = engine.send(TerminateAppsForPaths { paths: vec![path] }).await {
                error!("reload: failed to reach engine to terminate removed app: {e}");
            }
        }));
    }
}

impl Actor for ReloadActor {
    type Context = Context<Self>;
}

impl Handler<PathChanged> for ReloadActor {
    type Result = ();

    fn handle(&mut self, msg: PathChanged, ctx: &mut Self::Context) -> Self::Result {
        match msg.kind {
            ChangeKind::Modified => self.handle_modified(msg.path, ctx),
            ChangeKind::Deleted => self.handle_deleted(msg.path, ctx),
        }
    }
}

/// Spawns the filesystem watcher on its own OS thread (`notify`'s callback
/// runs off-runtime) and debounces per path on `runtime` before posting
/// [`PathChanged`] onto `reload`'s mailbox. The returned watcher must be kept
/// alive for the duration of the watch.
pub fn spawn_watcher(root: PathBuf, reload: Addr<ReloadActor>, runtime: tokio::runtime::Handle) -> notify::Result<RecommendedWatcher> {
    let last_seen: Arc<Mutex<std::collections::HashMap<PathBuf, Instant>>> = Arc::new(Mutex::new(std::collections::HashMap::new()));

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(e) => {
                warn!("reload: filesystem watch error: {e}");
                return;
            }
        };
        let kind = match event.kind {
            notify::EventKind::Remove(_) => ChangeKind::Deleted,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_) => ChangeKind::Modified,
            _ => return,
        };
        for path in event.paths {
            let seen_at = Instant::now();
            last_seen.lock().unwrap().insert(path.clone(), seen_at);

            let reload = reload.clone();
            let last_seen = last_seen.clone();
            runtime.spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                let is_latest = last_seen.lock().unwrap().get(&path).copied() == Some(seen_at);
                if !is_latest {
                    return;
                }
                reload.do_send(PathChanged { path, kind });
            });
        }
    })?;

    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!("reload: watching {} for app source changes", root.display());
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_definition_matches_configured_suffix() {
        assert!(is_app_definition(Path::new("lights_apps.rs"), "_apps"));
        assert!(!is_app_definition(Path::new("lights_apps_helpers.rs"), "_apps"));
    }

    #[test]
    fn non_app_definition_files_do_not_match() {
        assert!(!is_app_definition(Path::new("helpers.rs"), "_apps"));
        assert!(!is_app_definition(Path::new("apps_lights.rs"), "_apps"));
    }

    #[test]
    fn path_with_no_stem_does_not_match() {
        assert!(!is_app_definition(Path::new("/"), "_apps"));
    }
}
