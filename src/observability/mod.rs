//! Observability for the document storage core
//!
//! Typed observable events, structured JSON logs, per-message log
//! throttling for hot copy loops, and a counters-only metrics registry.

mod events;
mod logger;
mod metrics;
mod throttle;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::MetricsRegistry;
pub use throttle::LogThrottle;
