//! Structured logging setup, shared by the daemon binary and its tests.

use anyhow::Result;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Log a successful operation.
#[macro_export]
macro_rules! log_success {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, status = "success", "{}", format!($($arg)*))
    };
}

/// Log an error with its source attached as a structured field.
#[macro_export]
macro_rules! log_error {
    ($component:expr, $err:expr, $($arg:tt)*) => {
        tracing::error!(
            component = $component,
            error = %$err,
            "{} | error: {}",
            format!($($arg)*),
            $err
        )
    };
}

/// Log a warning.
#[macro_export]
macro_rules! log_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, "{}", format!($($arg)*))
    };
}

/// A helper that logs an operation's duration on completion.
///
/// Unlike a plain span, this lets a caller report success or failure
/// explicitly; a `TimedOperation` dropped without either logs a warning so
/// that forgotten call sites are visible in the logs rather than silent.
pub struct TimedOperation {
    operation: String,
    start: std::time::Instant,
    finished: bool,
}

impl TimedOperation {
    pub fn new(operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(operation = %operation, "starting");
        Self {
            operation,
            start: std::time::Instant::now(),
            finished: false,
        }
    }

    pub fn success(mut self) {
        let ms = self.start.elapsed().as_millis();
        tracing::info!(operation = %self.operation, duration_ms = %ms, "completed");
        self.finished = true;
    }

    pub fn failure(mut self, error: &str) {
        let ms = self.start.elapsed().as_millis();
        tracing::error!(operation = %self.operation, duration_ms = %ms, error = %error, "failed");
        self.finished = true;
    }
}

impl Drop for TimedOperation {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                operation = %self.operation,
                duration_ms = %self.start.elapsed().as_millis(),
                "ended without explicit success/failure"
            );
        }
    }
}

/// Initialize logging with human-readable console output.
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string()))
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();

    Ok(())
}

/// Initialize logging with JSON output, suitable for log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true),
        )
        .init();

    Ok(())
}

/// Trait for components that want a standardized logging vocabulary.
pub trait Loggable {
    /// Component name attached to every log line this component emits.
    fn log_component(&self) -> &'static str;

    fn log_debug(&self, msg: &str) {
        tracing::debug!(component = self.log_component(), "{}", msg);
    }

    fn log_info(&self, msg: &str) {
        tracing::info!(component = self.log_component(), "{}", msg);
    }

    fn log_warn(&self, msg: &str) {
        tracing::warn!(component = self.log_component(), "{}", msg);
    }

    fn log_error(&self, msg: &str, err: &dyn std::error::Error) {
        tracing::error!(component = self.log_component(), error = %err, "{}", msg);
    }
}

/// Log a short diagnostic banner on startup (hostname, kernel, memory).
pub fn log_system_diagnostics() {
    tracing::info!("system diagnostics:");

    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        tracing::info!(hostname = %hostname.trim(), "host");
    }

    if let Ok(output) = std::process::Command::new("uname").arg("-r").output() {
        tracing::info!(kernel = %String::from_utf8_lossy(&output.stdout).trim(), "kernel");
    }

    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(total) = meminfo.lines().find(|l| l.starts_with("MemTotal")) {
            tracing::info!(mem_total = %total.trim(), "memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_operation_success_does_not_panic() {
        let op = TimedOperation::new("test_operation");
        op.success();
    }

    #[test]
    fn timed_operation_failure_does_not_panic() {
        let op = TimedOperation::new("test_operation");
        op.failure("boom");
    }
}
