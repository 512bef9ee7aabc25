//! Console logging for the UI thread and the worker crates.
//!
//! Each wasm instance installs the backend at most once; worker crates label
//! their events with a permanently entered span so interleaved console
//! output can be told apart by origin.

use std::cell::Cell;
use tracing::Level;

thread_local! {
    // One wasm instance per execution context, so a plain flag makes
    // installation idempotent.
    static INSTALLED: Cell<bool> = const { Cell::new(false) };
}

/// Backend configuration; `install` consumes it.
pub struct Telemetry {
    level: Level,
    component: Option<String>,
}

impl Telemetry {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            component: None,
        }
    }

    /// Label every event from this context with a worker name.
    pub fn component(mut self, name: &str) -> Self {
        self.component = Some(name.to_string());
        self
    }

    /// Install the console backend. Later calls in the same context are
    /// no-ops.
    pub fn install(self) {
        if INSTALLED.with(|flag| flag.replace(true)) {
            return;
        }
        console_error_panic_hook::set_once();

        let mut config = tracing_wasm::WASMLayerConfigBuilder::new();
        config
            .set_max_level(self.level)
            .set_console_config(tracing_wasm::ConsoleConfig::ReportWithConsoleColor)
            .set_report_logs_in_timings(true);
        tracing_wasm::set_as_global_default_with_config(config.build());

        if let Some(name) = self.component {
            // The label must outlive the context, and so must its guard;
            // both leak exactly once per worker.
            let span = Box::leak(Box::new(tracing::info_span!("worker", component = %name)));
            std::mem::forget(span.enter());
        }

        tracing::info!("tracing installed (level={})", self.level);
    }
}

pub fn init(level: Level) {
    Telemetry::new(level).install();
}

pub fn init_with_component(level: Level, component: &str) {
    Telemetry::new(level).component(component).install();
}
