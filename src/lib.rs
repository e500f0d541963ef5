//! etcd-backed service registry.
//!
//! A process registers itself under a namespace with
//! [`ServiceRegistry::register`], is kept alive by a self-renewing lease
//! and gets a locally cached, watch-driven view of every other
//! registered server and of the published key material.
//!
//! ```no_run
//! use sd_registry::{Metadata, RegisterParams, RegistryConfig, ServiceRegistry};
//!
//! # async fn run() -> sd_registry::Result<()> {
//! let params = RegisterParams::new(
//!     "app",
//!     "/prod",
//!     "http://127.0.0.1:2379",
//!     Metadata::http("10.0.0.1", "8080"),
//! );
//! let registry = ServiceRegistry::register(params, &RegistryConfig::default()).await?;
//!
//! if let Some((host, port)) = registry.random_http_endpoint("billing") {
//!     println!("calling billing at {host}:{port}");
//! }
//!
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
pub(crate) mod constants;
mod errors;
pub mod metrics;
mod registry;
mod store;
pub mod utils;

pub use cache::*;
pub use config::*;
pub use errors::*;
pub use registry::*;
pub use store::*;


//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
