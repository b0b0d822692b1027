//! pkg-gateway — npm, yarn and pnpm behind one tool-callable surface
//!
//! Detects the package manager a project uses, maps logical operations to
//! that manager's CLI, runs them with recovery from stale tracker state,
//! and serves registry lookups through a TTL cache.

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod executor;
pub mod pkg;
pub mod process;
pub mod registry;
pub mod testing;

pub use error::{GatewayError, Result};
pub use executor::{Dispatcher, ExecuteResponse};
pub use pkg::service::PackageService;
