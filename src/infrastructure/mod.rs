//! Infrastructure - everything around the session core
//!
//! - Configuration and credentials loading
//! - Logging and metrics
//! - Caller-side retry policy

pub mod config;
pub mod credentials;
pub mod logging;
pub mod metrics;
pub mod retry;

pub use config::{Config, ConfigError, LoggingConfig, SessionConfig};
pub use credentials::{Credentials, CredentialsError};
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use retry::RetryPolicy;
