pub mod algorithms;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod rate_limiter;
pub mod response;
pub mod server;
pub mod store;
pub mod token_bucket;

pub use algorithms::{RateLimitDecision, RateLimiter, Strategy};
pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use rate_limiter::build_rate_limiter;
pub use response::ApiResponse;
pub use server::create_app;
