//! # authgate
//!
//! Composes identity resolution and database access into one shared
//! service context.
//!
//! - [`AppConfig`]: environment input validated into typed sections, with
//!   every problem reported at once
//! - [`AppContext`]: the identity resolver, credential provider, pool and
//!   user store, built once per process
//! - [`ApiError`]: client-facing errors with explicit HTTP status codes
//! - [`telemetry::init`]: `tracing` subscriber installation
//!
//! ```no_run
//! use authgate::{AppConfig, AppContext, telemetry};
//!
//! # async fn example(headers: http::HeaderMap) -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::from_env()?;
//! telemetry::init(config.log_format)?;
//! let context = AppContext::from_config(config)?;
//!
//! match context.current_user(&headers).await {
//!     Ok(current) => println!("hello {}", current.user.name),
//!     Err(e) => {
//!         let body = e.body(context.config().environment);
//!         println!("{} {}", e.status(), serde_json::to_string(&body)?);
//!     },
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Service wiring.
pub mod context;
/// Configuration, API and startup errors.
pub mod error;
/// Environment configuration.
pub mod settings;
/// Logging setup.
pub mod telemetry;
/// Current-user lookup.
pub mod users;

pub use context::AppContext;
pub use error::{ApiError, ConfigError, ErrorBody, FieldError, InitError};
pub use settings::{AppConfig, AuthConfig, DatabaseConfig, DatabaseCredentials, EnvSettings, Environment};
pub use telemetry::LogFormat;
pub use users::{CurrentUser, current_user};
