//! ARXON client core.
//!
//! Backend-health circuit breaking, stale-while-revalidate caching with
//! request coalescing, and password-recovery session resolution.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod observability;
pub mod recovery;
pub mod resilience;
pub mod status;

pub use config::AppConfig;
pub use context::AppContext;
pub use lifecycle::Shutdown;
