//! Stderr diagnostics through `tracing`, with a debug switch that can be
//! flipped while the REPL runs.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const QUIET_DIRECTIVE: &str = "warn";
const DEBUG_DIRECTIVE: &str = "switchboard=debug,warn";

/// `RUST_LOG` wins over the quiet default but not over an explicit debug
/// request.
pub fn filter_directive(debug: bool, rust_log: Option<&str>) -> String {
    match (debug, rust_log.map(str::trim).filter(|value| !value.is_empty())) {
        (true, _) => DEBUG_DIRECTIVE.to_string(),
        (false, Some(env)) => env.to_string(),
        (false, None) => QUIET_DIRECTIVE.to_string(),
    }
}

pub struct Diagnostics {
    handle: Option<reload::Handle<EnvFilter, Registry>>,
    debug: AtomicBool,
}

impl Diagnostics {
    /// Installs the global subscriber. A second call (or a subscriber set by
    /// someone else) leaves the existing one in place and the returned
    /// handle cannot change levels.
    pub fn init(debug: bool) -> Self {
        let (filter, handle) = reload::Layer::new(Self::filter(debug));
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
            .is_ok();

        Self {
            handle: installed.then_some(handle),
            debug: AtomicBool::new(debug),
        }
    }

    fn filter(debug: bool) -> EnvFilter {
        let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
        EnvFilter::try_new(filter_directive(debug, env.as_deref()))
            .unwrap_or_else(|_| EnvFilter::new(QUIET_DIRECTIVE))
    }

    pub fn is_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug(&self, enabled: bool) -> Result<(), String> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| "diagnostics are managed elsewhere".to_string())?;
        handle
            .reload(Self::filter(enabled))
            .map_err(|err| err.to_string())?;
        self.debug.store(enabled, Ordering::Relaxed);
        Ok(())
    }
}
