//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Log one event per endpoint call with its outcome
//!
//! # Design Decisions
//! - JSON format for production, pretty format for development
//! - `RUST_LOG` overrides the configured level
//! - Failed calls log at `warn`, successes at `debug`

use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, ObservabilityConfig};
use crate::endpoint::{Endpoint, Middleware};

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let registry = tracing_subscriber::registry().with(filter);
    let res = match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if res.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Logs each call with its duration and outcome.
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    method: String,
}

impl LoggingMiddleware {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into() }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for LoggingMiddleware
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: Endpoint<Req, Resp>) -> Endpoint<Req, Resp> {
        let method = self.method.clone();
        Endpoint::new(move |ctx, req| {
            let next = next.clone();
            let method = method.clone();
            async move {
                let request_id = ctx.request_id().to_string();
                let start = Instant::now();
                let res = next.call(ctx, req).await;
                let took_ms = start.elapsed().as_millis() as u64;
                match &res {
                    Ok(_) => tracing::debug!(%method, %request_id, took_ms, "Call succeeded"),
                    Err(e) => tracing::warn!(
                        %method,
                        %request_id,
                        took_ms,
                        kind = %e.kind(),
                        error = %e,
                        "Call failed"
                    ),
                }
                res
            }
        })
    }
}
