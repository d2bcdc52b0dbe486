//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → every subscribed background task
//!         - RegistryInstancer watch loops exit
//!         - HTTP bindings stop accepting and drain
//! ```
//!
//! # Design Decisions
//! - One broadcast coordinator per process; tasks subscribe at spawn time
//! - A dropped coordinator is not a shutdown signal

pub mod shutdown;

pub use shutdown::Shutdown;
