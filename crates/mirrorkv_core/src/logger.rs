//! Pluggable store logger.

use std::fmt;

/// Sink for the store's diagnostics.
///
/// Every call carries the store name so one logger can serve multiple
/// stores. All sinks are optional in spirit: implementations may drop
/// any level.
pub trait Logger: Send + Sync {
    /// Informational message (load timing, GC completion, large-value
    /// spills).
    fn info(&self, name: &str, message: &str);

    /// Recoverable problem (mirror fallback, commit retry).
    fn warning(&self, name: &str, message: &str);

    /// Failure (corrupt data, I/O errors, mode degradation).
    fn error(&self, name: &str, message: &str);
}

/// Default logger: forwards to the `tracing` macros with the store name
/// as a field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, name: &str, message: &str) {
        tracing::info!(store = name, "{message}");
    }

    fn warning(&self, name: &str, message: &str) {
        tracing::warn!(store = name, "{message}");
    }

    fn error(&self, name: &str, message: &str) {
        tracing::error!(store = name, "{message}");
    }
}

impl fmt::Debug for dyn Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Captures messages for assertions.
    pub(crate) struct CapturingLogger(pub Arc<Mutex<Vec<(String, String)>>>);

    impl Logger for CapturingLogger {
        fn info(&self, name: &str, message: &str) {
            self.0.lock().push((name.into(), format!("info: {message}")));
        }
        fn warning(&self, name: &str, message: &str) {
            self.0.lock().push((name.into(), format!("warn: {message}")));
        }
        fn error(&self, name: &str, message: &str) {
            self.0.lock().push((name.into(), format!("error: {message}")));
        }
    }

    #[test]
    fn custom_logger_receives_store_name() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let logger = CapturingLogger(sink.clone());
        logger.info("prefs", "loaded");
        logger.warning("prefs", "mirror B invalid");
        let entries = sink.lock();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "prefs");
        assert!(entries[1].1.contains("mirror B"));
    }
}
