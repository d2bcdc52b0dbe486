//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! Registry (memory.rs, file.rs)
//!     → instancer.rs (list + watch, full InstanceSet per change)
//!     → endpointer.rs (one Endpoint per instance via a factory)
//!     → load_balancer (pick one per attempt)
//!     → resilience::retries (retry across picks)
//! ```
//!
//! # Design Decisions
//! - The core only needs an instance lister with change notifications;
//!   any catalog can implement [`Registry`]
//! - Registry errors never wipe the last good instance set
//! - Endpoint resources are released exactly once when an instance leaves

pub mod endpointer;
pub mod file;
pub mod instance;
pub mod instancer;
pub mod memory;
pub mod registry;

pub use endpointer::{Closer, Endpointer, EndpointerOptions, Factory};
pub use file::FileRegistry;
pub use instance::{Health, Instance, InstanceSet};
pub use instancer::{Broadcaster, Event, FixedInstancer, Instancer, RegistryInstancer, Subscription};
pub use memory::MemoryRegistry;
pub use registry::{Query, Registry};
