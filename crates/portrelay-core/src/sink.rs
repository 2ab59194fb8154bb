//! Logging capability handed to forwarders and registries
//!
//! The core never logs through a global subscriber. Callers pass an
//! `Arc<dyn LogSink>` at construction; [`NoopSink`] discards everything and
//! [`TracingSink`] forwards onto `tracing`.

use std::sync::Arc;

/// Receiver for informational and error events emitted by the core
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);

    fn error(&self, message: &str);

    /// Recoverable problems. Routed to `error` unless overridden.
    fn warn(&self, message: &str) {
        self.error(message);
    }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl LogSink for NoopSink {
    fn info(&self, _message: &str) {}

    fn error(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}
}

/// Sink backed by the `tracing` macros
#[derive(Debug, Clone)]
pub struct TracingSink {
    component: &'static str,
}

impl TracingSink {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new("portrelay")
    }
}

impl LogSink for TracingSink {
    fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(component = self.component, "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(component = self.component, "{}", message);
    }
}

/// Shared no-op sink, handy for tests and embedders that do not care
pub fn noop() -> Arc<dyn LogSink> {
    Arc::new(NoopSink)
}
