pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod response;
pub mod rules;
pub mod server;
pub mod throttle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use limiter::RateLimitEngine;
pub use server::create_app;
