use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::PanicHookInfo;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Layer, filter::EnvFilter, fmt};

const ENV_DEBUG: &str = "EPOCHFLOW_DEBUG";

/// How log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// Flattened JSON at `info`.
    Json,
    /// Human readable text at `debug`.
    Text,
}

impl LogFormat {
    fn from_debug_flag(flag: Option<&str>) -> Self {
        match flag {
            Some(v) if v.eq_ignore_ascii_case("true") => LogFormat::Text,
            _ => LogFormat::Json,
        }
    }

    fn default_level(self) -> Level {
        match self {
            LogFormat::Json => Level::INFO,
            LogFormat::Text => Level::DEBUG,
        }
    }
}

/// One line for the panic: `file:line:column: message`, or the full report with the backtrace
/// when one was captured (RUST_BACKTRACE / RUST_LIB_BACKTRACE).
fn panic_report(panic_info: &PanicHookInfo<'_>, backtrace: &Backtrace) -> String {
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload) {
        (Some(location), Some(payload)) if backtrace.status() != BacktraceStatus::Captured => {
            format!(
                "{}:{}:{}: {payload}",
                location.file(),
                location.line(),
                location.column()
            )
        }
        _ => format!("{panic_info}\n{backtrace}"),
    }
}

/// Installs the global subscriber, filtered by RUST_LOG on top of the format's default level, and
/// routes panics into the same log stream.
pub(crate) fn register() {
    let format = LogFormat::from_debug_flag(std::env::var(ENV_DEBUG).ok().as_deref());

    let filter = EnvFilter::builder()
        .with_default_directive(format.default_level().into())
        .from_env_lossy();

    let layer = match format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer()
            .with_ansi(false)
            .json()
            .flatten_event(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .init();

    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::capture();
        tracing::error!("{}", panic_report(panic_info, &backtrace));
    }));
}
