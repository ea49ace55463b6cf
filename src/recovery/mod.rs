//! Password-recovery session resolution.
//!
//! # Data Flow
//! ```text
//! Recovery link
//!     → params.rs (fragment + query → strategy)
//!     → resolver.rs (subscribe, establish, race event vs poll)
//!     → provider.rs / http_provider.rs (auth backend, through the guarded client)
//!     → RecoverySessionState {checking, is_valid_session} on a watch channel
//! ```

pub mod http_provider;
pub mod params;
pub mod provider;
pub mod resolver;

pub use http_provider::HttpAuthProvider;
pub use params::{canonical_recovery_url, EstablishStrategy, RecoveryUrlParams};
pub use provider::{AuthError, AuthEvent, AuthProvider, AuthResult, Session};
pub use resolver::{
    RecoveryHandle, RecoveryOutcome, RecoveryPhase, RecoveryResolver, RecoverySessionState, ResolutionPath,
};
