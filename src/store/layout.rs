use std::path::{Path, PathBuf};

use crate::config::HubConfig;

/// Flat durable store: one file per bundle named by its manifest name, plus
/// the manifest and the version table. Downloads land in the staging
/// directory first, each under its own unique name.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    base_url: String,
    store_dir: PathBuf,
    staging_dir: PathBuf,
    manifest_name: String,
    version_table_name: String,
}

impl StoreLayout {
    pub fn from_config(config: &HubConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            store_dir: config.store_dir.clone(),
            staging_dir: config.staging_dir.clone(),
            manifest_name: config.manifest_name.clone(),
            version_table_name: config.version_table_name.clone(),
        }
    }

    pub fn bundle_url(&self, bundle_name: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), bundle_name)
    }

    pub fn bundle_path(&self, bundle_name: &str) -> PathBuf {
        self.store_dir.join(bundle_name)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.store_dir.join(&self.manifest_name)
    }

    pub fn version_table_path(&self) -> PathBuf {
        self.store_dir.join(&self.version_table_name)
    }

    /// A fresh staging file path; never reused across requests.
    pub fn new_staging_path(&self) -> PathBuf {
        self.staging_dir
            .join(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let config = HubConfig {
            base_url: "http://cdn.local/ab/".to_string(),
            store_dir: PathBuf::from("/data/ab"),
            staging_dir: PathBuf::from("/tmp/ab"),
            ..HubConfig::default()
        };
        let layout = StoreLayout::from_config(&config);
        assert_eq!(layout.bundle_url("Sprites"), "http://cdn.local/ab/Sprites");
        assert_eq!(layout.bundle_path("Sprites"), PathBuf::from("/data/ab/Sprites"));
        assert_eq!(
            layout.manifest_path(),
            PathBuf::from("/data/ab/AssetBundleList.json")
        );

        let a = layout.new_staging_path();
        let b = layout.new_staging_path();
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/ab"));
    }
}
