// Hub context: owns the collaborators and hands out downloaders, the cache and groups.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::{AssetGroup, BundleReader, CacheContext, LocalCache, PackedBundleReader};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::manifest::Manifest;
use crate::store::hasher::hasher_for;
use crate::store::{FileHasher, SharedVersionTable, StoreLayout, VersionTable, XorCipher};
use crate::sync::{exists_new_release, Downloader, SyncContext};
use crate::transport::{FetchRequest, Pipeline};

struct Loaded {
    manifest: Arc<Manifest>,
    cache: Arc<LocalCache>,
}

/// Explicitly constructed context holding every collaborator. Nothing is
/// global: two hubs over different stores never share state.
pub struct Hub {
    config: HubConfig,
    layout: StoreLayout,
    cipher: Option<XorCipher>,
    pipeline: Pipeline,
    hasher: Arc<dyn FileHasher>,
    reader: Arc<dyn BundleReader>,
    versions: SharedVersionTable,
    loaded: RwLock<Option<Loaded>>,
}

/// Overrides for the default collaborators.
pub struct HubBuilder {
    config: HubConfig,
    pipeline: Option<Pipeline>,
    hasher: Option<Arc<dyn FileHasher>>,
    reader: Option<Arc<dyn BundleReader>>,
}

impl HubBuilder {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            pipeline: None,
            hasher: None,
            reader: None,
        }
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn FileHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn reader(mut self, reader: Arc<dyn BundleReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Validates the config and loads the local version table.
    pub fn build(self) -> Result<Hub> {
        let config = self.config;
        config.validate()?;

        let cipher = config.cipher()?;
        let layout = StoreLayout::from_config(&config);
        let pipeline = match self.pipeline {
            Some(pipeline) => pipeline,
            None => Pipeline::with_defaults(config.max_concurrency, config.max_retries)?,
        };
        let hasher = self.hasher.unwrap_or_else(|| hasher_for(config.integrity));
        let reader = self
            .reader
            .unwrap_or_else(|| Arc::new(PackedBundleReader::new(cipher.clone())));
        let versions = Arc::new(RwLock::new(VersionTable::load_or_default(
            layout.version_table_path(),
            cipher.clone(),
        )));

        info!(
            "hub ready store={} stages={} hash={}",
            layout.store_dir().display(),
            pipeline.len(),
            hasher.algorithm()
        );
        Ok(Hub {
            config,
            layout,
            cipher,
            pipeline,
            hasher,
            reader,
            versions,
            loaded: RwLock::new(None),
        })
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Result<Self> {
        HubBuilder::new(config).build()
    }

    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder::new(config)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn version_table(&self) -> &SharedVersionTable {
        &self.versions
    }

    pub fn exists_manifest(&self) -> bool {
        self.layout.manifest_path().is_file()
    }

    /// Download the remote manifest through the transport pipeline and swap
    /// it into the store. Call `load_manifest` afterwards to start using it.
    pub async fn pull_manifest(&self, cancel: &CancellationToken) -> Result<()> {
        if self.config.manifest_url.is_empty() {
            return Err(HubError::InvalidState("manifest_url is not configured".to_string()));
        }
        let staging = self.layout.new_staging_path();
        let request = FetchRequest::new(&self.config.manifest_url, &staging, self.config.timeout());
        self.pipeline.execute(&request, cancel).await?;

        let dest = self.layout.manifest_path();
        let store_dir = self.layout.store_dir();
        tokio::fs::create_dir_all(store_dir)
            .await
            .map_err(|e| HubError::io(store_dir, e))?;
        match tokio::fs::remove_file(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HubError::io(&dest, e)),
        }
        tokio::fs::rename(&staging, &dest)
            .await
            .map_err(|e| HubError::io(&dest, e))?;
        info!("manifest pulled into {}", dest.display());
        Ok(())
    }

    /// Read the local manifest and install it. Replaces any manifest loaded
    /// before, together with its cache; holders of the old cache keep it.
    pub fn load_manifest(&self) -> Result<Arc<Manifest>> {
        let manifest = Arc::new(Manifest::load(
            &self.layout.manifest_path(),
            self.cipher.as_ref(),
        )?);
        let cache = Arc::new(LocalCache::new(CacheContext {
            manifest: Arc::clone(&manifest),
            versions: Arc::clone(&self.versions),
            layout: self.layout.clone(),
            reader: Arc::clone(&self.reader),
        }));
        info!(
            "manifest v{} loaded: {} bundles",
            manifest.version(),
            manifest.len()
        );
        *self.loaded.write() = Some(Loaded {
            manifest: Arc::clone(&manifest),
            cache,
        });
        Ok(manifest)
    }

    pub fn manifest(&self) -> Result<Arc<Manifest>> {
        self.loaded
            .read()
            .as_ref()
            .map(|loaded| Arc::clone(&loaded.manifest))
            .ok_or_else(not_loaded)
    }

    /// Whether `bundle_name` needs downloading. False for names the
    /// manifest does not know.
    pub fn exists_new_release(&self, bundle_name: &str) -> Result<bool> {
        let manifest = self.manifest()?;
        let versions = self.versions.read();
        Ok(exists_new_release(&manifest, &versions, bundle_name))
    }

    pub fn create_downloader(&self) -> Result<Downloader> {
        Ok(Downloader::new(SyncContext {
            manifest: self.manifest()?,
            layout: self.layout.clone(),
            pipeline: self.pipeline.clone(),
            hasher: Arc::clone(&self.hasher),
            versions: Arc::clone(&self.versions),
            timeout: self.config.timeout(),
            shuffle: self.config.shuffle,
        }))
    }

    pub fn cache(&self) -> Result<Arc<LocalCache>> {
        self.loaded
            .read()
            .as_ref()
            .map(|loaded| Arc::clone(&loaded.cache))
            .ok_or_else(not_loaded)
    }

    pub fn create_group(&self) -> Result<AssetGroup> {
        Ok(AssetGroup::new(self.cache()?))
    }
}

fn not_loaded() -> HubError {
    HubError::InvalidState("manifest not loaded".to_string())
}
