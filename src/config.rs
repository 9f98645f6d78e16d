use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HubError, Result};
use crate::store::cipher::XorCipher;

/// Per-request transfer timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum number of bundle transfers running at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// File name of the manifest inside the store directory.
pub const DEFAULT_MANIFEST_NAME: &str = "AssetBundleList.json";

/// File name of the local version table inside the store directory.
pub const DEFAULT_VERSION_TABLE_NAME: &str = "LocalAssetBundleTable.json";

/// Extra attempts after a connection failure. Zero leaves retry out of the chain.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Read buffer used when hashing staged files (64 KB).
pub const HASH_BUFFER_BYTES: usize = 64 * 1024;

/// Checksum algorithm the manifest's `fileHash` was produced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityAlgorithm {
    #[default]
    Md5,
    Sha256,
}

/// Top-level configuration for a hub instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Remote directory bundles are fetched from (`{base_url}/{bundle}`).
    pub base_url: String,
    /// Full URL of the remote manifest.
    pub manifest_url: String,
    pub manifest_name: String,
    pub version_table_name: String,
    /// Durable store: promoted bundles, the manifest and the version table.
    pub store_dir: PathBuf,
    /// Scratch directory for in-flight downloads.
    pub staging_dir: PathBuf,
    pub timeout_secs: u64,
    pub max_concurrency: usize,
    pub max_retries: u32,
    /// Randomise request order on each run.
    pub shuffle: bool,
    /// Enables the XOR stream cipher for bundles, manifest and version table.
    pub crypt_key: Option<String>,
    pub integrity: IntegrityAlgorithm,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            manifest_url: String::new(),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            version_table_name: DEFAULT_VERSION_TABLE_NAME.to_string(),
            store_dir: PathBuf::from("SaveData/AB"),
            staging_dir: PathBuf::from("Temp/AB"),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            shuffle: true,
            crypt_key: None,
            integrity: IntegrityAlgorithm::default(),
        }
    }
}

impl HubConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build the configured cipher, if any.
    pub fn cipher(&self) -> Result<Option<XorCipher>> {
        match &self.crypt_key {
            None => Ok(None),
            Some(key) => XorCipher::new(key.as_bytes()).map(Some),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(HubError::InvalidState(
                "max_concurrency must be >= 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(HubError::InvalidState(
                "timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.manifest_name, "AssetBundleList.json");
        assert!(config.cipher().unwrap().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: HubConfig = serde_json::from_str(
            r#"{"base_url":"http://cdn.local/ab","integrity":"sha256","crypt_key":"k3y"}"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "http://cdn.local/ab");
        assert_eq!(config.integrity, IntegrityAlgorithm::Sha256);
        assert!(config.cipher().unwrap().is_some());
        assert!(config.shuffle);
    }

    #[test]
    fn test_empty_key_rejected() {
        let config = HubConfig {
            crypt_key: Some(String::new()),
            ..HubConfig::default()
        };
        assert!(config.cipher().is_err());
    }
}
