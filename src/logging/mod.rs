//! Per-logger configurable logging: stdout/stderr streams, files and
//! HTTP-JSON shipping, dispatched by logger name.
//!
//! External collaborator per spec.md §6: the core only needs a `log` target
//! per app (`apps::<logging_config_name>::<app_name>`) to exist; this module
//! is the concrete backend wired in by the binary.

mod http_json;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

pub use http_json::HttpJsonHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString, strum::Display, serde::Deserialize, serde::Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConfiguredLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl From<ConfiguredLevel> for LevelFilter {
    fn from(value: ConfiguredLevel) -> Self {
        match value {
            ConfiguredLevel::Trace => LevelFilter::Trace,
            ConfiguredLevel::Debug => LevelFilter::Debug,
            ConfiguredLevel::Info => LevelFilter::Info,
            ConfiguredLevel::Warning => LevelFilter::Warn,
            ConfiguredLevel::Error | ConfiguredLevel::Critical => LevelFilter::Error,
        }
    }
}

#[derive(Clone, serde::Deserialize, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HandlerConfig {
    Stream {
        #[serde(default = "default_stream_target")]
        target: StreamTarget,
    },
    File {
        filename: String,
    },
    HttpJson {
        url: String,
        username: String,
        password: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamTarget {
    Stdout,
    Stderr,
}

fn default_stream_target() -> StreamTarget {
    StreamTarget::Stdout
}

#[derive(Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerSettings {
    pub log_level: ConfiguredLevel,
    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
    #[serde(default = "default_formatter")]
    pub formatter: String,
    #[serde(default = "default_formatter_with_app_name")]
    pub formatter_with_app_name: String,
}

fn default_formatter() -> String {
    "[{level}] {target}: {message}".to_string()
}

fn default_formatter_with_app_name() -> String {
    "[{level}] {target} ({app_name}): {message}".to_string()
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            log_level: ConfiguredLevel::Info,
            handlers: vec![HandlerConfig::Stream {
                target: StreamTarget::Stdout,
            }],
            formatter: default_formatter(),
            formatter_with_app_name: default_formatter_with_app_name(),
        }
    }
}

enum Handler {
    Stream(StreamTarget),
    File(Mutex<std::fs::File>),
    Http(HttpJsonHandler),
}

struct ResolvedLogger {
    level: LevelFilter,
    handlers: Vec<Handler>,
    formatter: String,
    formatter_with_app_name: String,
}

/// `log::Log` implementation dispatching by target name, falling back to the
/// `"default"` entry when the record's target has no dedicated configuration.
pub struct DispatchLogger {
    loggers: HashMap<String, ResolvedLogger>,
    max_level: LevelFilter,
}

impl DispatchLogger {
    pub fn build(config: &HashMap<String, LoggerSettings>) -> std::io::Result<Self> {
        let mut loggers = HashMap::new();
        let mut max_level = LevelFilter::Off;

        let mut config = config.clone();
        config.entry("default".to_string()).or_default();

        for (name, settings) in config {
            let level: LevelFilter = settings.log_level.into();
            max_level = max_level.max(level);

            let mut handlers = Vec::with_capacity(settings.handlers.len());
            for handler in &settings.handlers {
                handlers.push(match handler {
                    HandlerConfig::Stream { target } => Handler::Stream(*target),
                    HandlerConfig::File { filename } => {
                        let file = OpenOptions::new().create(true).append(true).open(filename)?;
                        Handler::File(Mutex::new(file))
                    }
                    HandlerConfig::HttpJson { url, username, password } => {
                        Handler::Http(HttpJsonHandler::new(url.clone(), username.clone(), password.clone()))
                    }
                });
            }

            loggers.insert(
                name,
                ResolvedLogger {
                    level,
                    handlers,
                    formatter: settings.formatter.clone(),
                    formatter_with_app_name: settings.formatter_with_app_name.clone(),
                },
            );
        }

        Ok(Self { loggers, max_level })
    }

    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Install this logger as the process-wide `log` backend.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let max_level = self.max_level();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(max_level);
        Ok(())
    }

    fn resolve(&self, target: &str) -> &ResolvedLogger {
        // Longest configured prefix wins, falling back to "default".
        self.loggers
            .iter()
            .filter(|(name, _)| *name != "default" && target.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, logger)| logger)
            .unwrap_or_else(|| &self.loggers["default"])
    }
}

fn extract_app_name(target: &str) -> Option<&str> {
    // Per-app targets follow `apps::<logging_config_name>::<app_name>`.
    target.rsplit("::").next().filter(|_| target.starts_with("apps::"))
}

impl Log for DispatchLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.resolve(metadata.target()).level >= metadata.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let logger = self.resolve(record.target());
        let app_name = extract_app_name(record.target());
        let formatted = format_message(
            if app_name.is_some() {
                &logger.formatter_with_app_name
            } else {
                &logger.formatter
            },
            record.level(),
            record.target(),
            app_name,
            &record.args().to_string(),
        );

        for handler in &logger.handlers {
            match handler {
                Handler::Stream(StreamTarget::Stdout) => println!("{formatted}"),
                Handler::Stream(StreamTarget::Stderr) => eprintln!("{formatted}"),
                Handler::File(file) => {
                    if let Ok(mut file) = file.lock() {
                        let _ = writeln!(file, "{formatted}");
                    }
                }
                Handler::Http(http) => http.submit(record.level(), record.target(), app_name, &record.args().to_string()),
            }
        }
    }

    fn flush(&self) {}
}

fn format_message(template: &str, level: Level, target: &str, app_name: Option<&str>, message: &str) -> String {
    template
        .replace("{level}", &level.to_string())
        .replace("{target}", target)
        .replace("{app_name}", app_name.unwrap_or(""))
        .replace("{message}", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_name_extracted_from_app_target() {
        assert_eq!(extract_app_name("apps::apps::porch_light"), Some("porch_light"));
        assert_eq!(extract_app_name("hearth_apps::engine"), None);
    }

    #[test]
    fn default_level_filter_maps_critical_to_error() {
        let filter: LevelFilter = ConfiguredLevel::Critical.into();
        assert_eq!(filter, LevelFilter::Error);
    }
}
