use std::sync::Once;

use env_logger::Env;
use log::{debug, warn, LevelFilter};

use crate::errors::DriverError;

static RUST_LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("MCP39F501_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Parse a level name, falling back to `MCP39F501_LOG`/`RUST_LOG`.
pub fn resolve_level(input: Option<&str>) -> LevelFilter {
    input
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or_else(env_level)
}

/// Variable holding the filter directives: `MCP39F501_LOG` when set, else `RUST_LOG`.
fn filter_var(is_set: impl Fn(&str) -> bool) -> &'static str {
    if is_set("MCP39F501_LOG") {
        "MCP39F501_LOG"
    } else {
        "RUST_LOG"
    }
}

fn builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .format_timestamp_millis()
        .format_module_path(true)
        .format_target(true);
    builder
}

/// Initialize logging for Rust binaries (stderr formatter) from the directives in
/// `MCP39F501_LOG`, or `RUST_LOG` when the former is unset. Defaults to `info`.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let var = filter_var(|name| std::env::var_os(name).is_some());
        let env = Env::new().filter_or(var, level_to_str(LevelFilter::Info));
        builder().parse_env(env).init();
    });
}

/// Same as [`init_rust_logging`] with an explicit level that ignores the environment.
/// Only the first call of either function has an effect.
pub fn init_rust_logging_with(level: LevelFilter) {
    RUST_LOG_ONCE.call_once(|| {
        builder().filter_level(level).init();
    });
}

/// Tracepoints of one command/response exchange.
///
/// The session calls these in order: `frame_sent` (skipped when nothing was
/// queued), `frame_received` with every byte accumulated, then exactly one of
/// `exchange_ok` or `exchange_failed`.
pub trait ExchangeObserver {
    fn frame_sent(&mut self, _frame: &[u8]) {}

    fn frame_received(&mut self, _raw: &[u8]) {}

    fn exchange_ok(&mut self, _payload: &[u8]) {}

    fn exchange_failed(&mut self, _error: &DriverError) {}
}

/// Forwards tracepoints to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ExchangeObserver for LogObserver {
    fn frame_sent(&mut self, frame: &[u8]) {
        debug!("frame sent: {:02X?}", frame);
    }

    fn frame_received(&mut self, raw: &[u8]) {
        debug!("frame received: {:02X?}", raw);
    }

    fn exchange_ok(&mut self, payload: &[u8]) {
        debug!("exchange ok: payload_len={}", payload.len());
    }

    fn exchange_failed(&mut self, error: &DriverError) {
        match error.exchange() {
            Some(e) if e.is_retriable() => warn!("exchange failed (retriable): {}", e),
            Some(e) => warn!("exchange failed: {}", e),
            None => warn!("transport failure: {}", error),
        }
    }
}

/// Drops every tracepoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ExchangeObserver for NullObserver {}
