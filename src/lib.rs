//! Endpoint and middleware toolkit for RPC services.
//!
//! # Architecture Overview
//!
//! ```text
//!   Server side                                  Client side
//!
//!   wire request                                 domain request
//!       │                                            │
//!       ▼                                            ▼
//!   transport::Server (decode)            tracing / logging / metrics
//!       │                                            │
//!       ▼                                            ▼
//!   endpoint::Chain                        resilience::Retry ◀── load_balancer
//!   tracing → logging → metrics                      │               ▲
//!   → breaker → limiter                              ▼               │
//!       │                                  breaker → limiter    discovery::Endpointer
//!       ▼                                            │               ▲
//!   business Endpoint                                ▼               │
//!       │                                  transport::Client    discovery::Instancer
//!       ▼                                  (http.rs, bus.rs)         ▲
//!   transport::Server (encode)                                   Registry
//! ```
//!
//! Cross-cutting: `config` (TOML schema), `observability` (tracing,
//! metrics), `lifecycle` (shutdown), `error` (cause-tagged errors).

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod resilience;
pub mod stack;
pub mod transport;

pub use config::schema::ClientConfig;
pub use endpoint::{BusinessError, Chain, Context, Endpoint, Middleware, Reply};
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::Shutdown;
pub use stack::{DiscoveredEndpoint, Stack};
