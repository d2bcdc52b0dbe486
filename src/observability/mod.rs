//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every call through a built stack:
//!     → tracing.rs (span with method and request id)
//!     → logging.rs (one structured event per call)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Request ID flows from the transport through every layer
//! - Resilience components report state changes through metrics.rs

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use logging::{init_logging, LoggingMiddleware};
pub use self::metrics::{init_metrics, InstrumentingMiddleware};
pub use self::tracing::TracingMiddleware;
