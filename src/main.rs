// Copyright (c) 2022 Unfolded Circle ApS, Markus Zehnder <markus.z@unfoldedcircle.com>
// SPDX-License-Identifier: MPL-2.0

#![forbid(non_ascii_idents)]
#![deny(unsafe_code)]

use std::io;
use std::path::Path;

use actix::{Actor, AsyncContext, Context};
use clap::{arg, Command};
use const_format::formatcp;
use log::{error, info, warn};

use hearth_apps::cache::CacheActor;
use hearth_apps::configuration::{get_configuration, DEF_CONFIG_FILE};
use hearth_apps::engine::EngineActor;
use hearth_apps::logging::DispatchLogger;
use hearth_apps::query;
use hearth_apps::reload::{self, ReloadActor};
use hearth_apps::scheduler::SchedulerActor;
use hearth_apps::wire::WireClient;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const APP_VERSION: &str = formatcp!(
    "{}{}",
    match built_info::GIT_VERSION {
        Some(v) => v,
        None => formatcp!("{}-non-git", built_info::PKG_VERSION),
    },
    match built_info::GIT_DIRTY {
        Some(_) => "-dirty",
        None => "",
    }
);

mod bootstrap;

#[actix_web::main]
async fn main() -> io::Result<()> {
    let args = Command::new(built_info::PKG_NAME)
        .author("Unfolded Circle Aps")
        .version(APP_VERSION)
        .about("Multi-tenant automation runtime for Home Assistant")
        .arg(arg!(-c --config <FILE> "Configuration file").required(false))
        .get_matches();

    let cfg_file = match args.get_one::<String>("config").map(String::as_str) {
        None if Path::new(DEF_CONFIG_FILE).exists() => {
            info!("Loading default configuration file: {DEF_CONFIG_FILE}");
            Some(DEF_CONFIG_FILE)
        }
        other => other,
    };
    let settings = get_configuration(cfg_file).expect("Failed to read configuration");

    DispatchLogger::build(&settings.logging)
        .and_then(|logger| logger.install().map_err(|e| io::Error::new(io::ErrorKind::Other, e)))
        .expect("Failed to install logger");

    // The engine, cache and wire client form a cycle: cache and wire need the
    // engine's address to report lifecycle/connection events, but the engine
    // needs their addresses to be constructed. `Context::new` hands out the
    // engine's `Addr` before the actor itself exists; messages queue in its
    // mailbox until `ctx.run` starts it below.
    let engine_ctx: Context<EngineActor> = Context::new();
    let engine_addr = engine_ctx.address();

    let timezone: chrono_tz::Tz = settings.timezone.parse().unwrap_or_else(|_| {
        warn!("Invalid configured timezone `{}`, falling back to UTC", settings.timezone);
        chrono_tz::UTC
    });
    let scheduler = SchedulerActor::new(timezone, settings.location.clone()).start();

    let cache_actor = CacheActor::new(engine_addr.clone().recipient(), engine_addr.clone().recipient());
    let entities = cache_actor.entities();
    let cache = cache_actor.start();

    let wire = WireClient::new(
        settings.hass.get_url(),
        settings.hass.clone(),
        settings.hass.heartbeat,
        vec![engine_addr.clone().recipient()],
    )
    .start();

    let engine = EngineActor::new(cache, scheduler, wire, entities);
    let _ = engine_ctx.run(engine);

    let reload_actor = ReloadActor::new(
        settings.app_suffix.clone(),
        std::sync::Arc::new(bootstrap::NoImports),
        std::sync::Arc::new(bootstrap::LogOnlyLoader),
        engine_addr.clone(),
    )
    .start();
    let _watcher = reload::spawn_watcher(settings.app_path.clone(), reload_actor, tokio::runtime::Handle::current())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    bootstrap::discover_apps(&settings.app_path, &settings.app_suffix, &engine_addr).await;

    let server = query::build_server(engine_addr.clone(), &settings.introspection.interface, settings.introspection.port)?;
    let server_handle = server.handle();
    actix::spawn(async move {
        if let Err(e) = server.await {
            error!("Query view server stopped with an error: {e}");
        }
    });

    info!("{} {} started", built_info::PKG_NAME, APP_VERSION);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server_handle.stop(true).await;
    if let Err(e) = engine_addr.send(hearth_apps::engine::TerminateAllAppsBeforeEngineStop).await {
        error!("Failed to terminate apps cleanly: {e}");
    }

    Ok(())
}
