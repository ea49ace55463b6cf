//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to the backend origin:
//!     → guarded.rs (short-circuit while open, tag with request ID, send)
//!     → circuit_breaker.rs (count 5xx/429/transport failures, open on threshold)
//!     → timeouts.rs (optional deadline around any awaited call)
//! ```
//!
//! # Design Decisions
//! - Open-circuit rejections never touch the network
//! - The core never retries on its own; callers decide, or the user resets
//! - Aborted calls are not failures

pub mod circuit_breaker;
pub mod guarded;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitState, CircuitStatus, Subscription};
pub use guarded::{FetchError, GuardedClient, X_REQUEST_ID};
pub use timeouts::{with_timeout, TimeoutError};
