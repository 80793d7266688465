//! Sliding-window throttling logic.

mod clock;
mod identity;
mod limiter;
mod rate;
mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::{AddressResolver, ConnectionMeta, IdentityResolver, PrincipalResolver};
pub use limiter::{Consistency, Decision, Throttle, ThrottleBuilder, CACHE_KEY_PREFIX, DEFAULT_MAX_RETRIES};
pub use rate::{RateSpec, TimeWindow};
pub use registry::ScopeRegistry;
