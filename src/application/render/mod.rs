//! Headless rendering: the worker pool, its circuit breaker and the browser
//! engine contract it drives.

pub mod backoff;
pub mod breaker;
pub mod engine;
mod pool;
mod types;

pub use backoff::{Backoff, BackoffKind};
pub use breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use engine::{BrowserEngine, BrowserSession, NetworkEvent, PageContent, WaitCondition};
pub use pool::{PoolStats, RenderPool};
pub use types::{PoolConfig, RenderError};
