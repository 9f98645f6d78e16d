// In-memory layer: opened bundles, extracted assets and scoped load groups.

pub mod bundle;
pub mod group;
pub mod local_cache;

pub use bundle::{AssetKind, AssetObject, Bundle, BundleReader, BundleWriter, PackedBundle, PackedBundleReader};
pub use group::AssetGroup;
pub use local_cache::{CacheContext, LocalCache};
