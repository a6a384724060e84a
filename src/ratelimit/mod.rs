//! Rate limiting logic and state management.

pub mod backend;
pub mod backoff;
pub mod exempt;
pub mod identity;
pub mod limiter;
pub mod local;
pub mod rules;
pub mod shared;
pub mod sweeper;

pub use backend::{RateLimitBackend, RateLimitResult, WindowCheck};
pub use backoff::BackoffPolicy;
pub use exempt::ExemptionChecker;
pub use identity::{Caller, ClientIdentifier, Credential, KeyGenerator, RoleResolver};
pub use limiter::{Evaluation, RateLimitEngine, RateLimitEngineBuilder};
pub use local::LocalSlidingWindow;
pub use rules::{RateLimitRule, RuleTable, RuleTableConfig};
pub use shared::SharedSlidingWindow;
pub use sweeper::Sweeper;
