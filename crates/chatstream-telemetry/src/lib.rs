//! Logging setup shared by the engine binaries.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "chatstream_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// Filter directives equivalent to this config, in `RUST_LOG` syntax.
    pub fn filter_directives(&self) -> String {
        directives(&level_directive(self.log_level), &self.module_levels)
    }
}

fn level_directive(level: Level) -> String {
    level.to_string().to_lowercase()
}

fn directives(base: &str, module_levels: &[(String, Level)]) -> String {
    let mut filter = base.to_string();
    for (module, level) in module_levels {
        filter.push_str(&format!(",{}={}", module, level_directive(*level)));
    }
    filter
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;
type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;

/// Handle returned by [`init_telemetry`]. Keep it alive for the life of the
/// process.
pub struct TelemetryGuard {
    base: String,
    module_levels: Arc<RwLock<Vec<(String, Level)>>>,
    handle: FilterHandle,
    installed: bool,
}

impl TelemetryGuard {
    /// Change one module's level on the live subscriber.
    pub fn set_module_level(&self, module: &str, level: Level) -> Result<(), reload::Error> {
        let filter = {
            let mut levels = self.module_levels.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            directives(&self.base, &levels)
        };
        self.handle.reload(EnvFilter::new(filter))
    }

    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.module_levels.read().clone()
    }

    /// False when another global subscriber was already installed.
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// Initialize logging. Output goes to stderr so stdout stays free for
/// command output. `RUST_LOG`, when set, replaces the configured levels.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let (base, module_levels) = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.trim().is_empty() => (env, Vec::new()),
        _ => (level_directive(config.log_level), config.module_levels),
    };

    let (subscriber, mut guard) = build(base, module_levels, config.format);
    guard.installed = subscriber.try_init().is_ok();
    if !guard.installed {
        eprintln!("chatstream-telemetry: a global subscriber is already set");
    }
    guard
}

fn build(
    base: String,
    module_levels: Vec<(String, Level)>,
    format: LogFormat,
) -> (impl Subscriber + Send + Sync + 'static, TelemetryGuard) {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(directives(&base, &module_levels)));

    let fmt_layer: Box<dyn Layer<FilteredRegistry> + Send + Sync> = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    let guard = TelemetryGuard {
        base,
        module_levels: Arc::new(RwLock::new(module_levels)),
        handle,
        installed: false,
    };
    (subscriber, guard)
}
