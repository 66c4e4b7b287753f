//! Rate limiting logic and state management.

mod action;
mod backend;
mod clock;
mod limiter;
mod registry;
mod store;
mod token;

pub use action::Action;
pub use backend::PolicyBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{sender_domain, RateLimiter, DEFAULT_DEFER_MESSAGE, DEFAULT_LIMIT, DEFAULT_WINDOW};
pub use registry::{RegistryStats, SnapshotLoad, TokenRegistry};
pub use store::KeyValueStore;
pub use token::{bucket_start, CountOverflow, RateToken};
