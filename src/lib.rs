// bundlehub: syncs versioned asset bundles into a local store and serves them
// through a dependency-aware, reference-counted cache.

pub mod cache;
pub mod config;
pub mod error;
pub mod hub;
pub mod manifest;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use config::HubConfig;
pub use error::{HubError, Result};
pub use hub::{Hub, HubBuilder};
pub use manifest::{BundleInfo, Manifest};
