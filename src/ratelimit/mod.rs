//! Rate limiting logic and state management.

mod backend;
mod clock;
mod distributed;
mod janitor;
mod key;
mod limiter;
mod local;
mod rules;
pub mod shared;
mod window;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::DistributedRateLimiter;
pub use janitor::{Janitor, DEFAULT_SWEEP_INTERVAL};
pub use key::{escape_component, KeyBuilder, RequestContext, DEFAULT_KEY_PREFIX};
pub use limiter::RateLimiter;
pub use local::LocalWindowStore;
pub use rules::{
    KeyBy, KeyFn, Preset, RateLimitConfig, RouteRule, RouteTable, RulesFile, SkipFn,
    DEFAULT_MAX_REQUESTS, DEFAULT_MESSAGE, DEFAULT_WINDOW_MS,
};
pub use shared::{
    BackendError, MemorySortedSet, RedisSortedSet, SharedWindowStore, SortedSetBackend,
    DEFAULT_NAMESPACE,
};
pub use window::{ActiveEntry, Algorithm, RateLimitVerdict, SweepReport, UsageInfo, WindowRecord};
