// Resolves requested assets to a download set and drives retryable sync runs over it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::run::SyncRun;
use super::stages::{run_stages, StageDeps};
use crate::error::{HubError, Result};
use crate::manifest::Manifest;
use crate::store::{FileHasher, SharedVersionTable, StoreLayout, VersionTable};
use crate::transport::Pipeline;

/// Everything a sync run needs, snapshotted when the downloader is created.
#[derive(Clone)]
pub struct SyncContext {
    pub manifest: Arc<Manifest>,
    pub layout: StoreLayout,
    pub pipeline: Pipeline,
    pub hasher: Arc<dyn FileHasher>,
    pub versions: SharedVersionTable,
    pub timeout: Duration,
    pub shuffle: bool,
}

/// True when `bundle_name` has no local version or an outdated one. Bundles
/// unknown to the manifest are never considered new.
pub fn exists_new_release(manifest: &Manifest, versions: &VersionTable, bundle_name: &str) -> bool {
    let info = match manifest.bundle_info(bundle_name) {
        Ok(info) => info,
        Err(_) => {
            error!("bundle info not found: {}", bundle_name);
            return false;
        }
    };
    match versions.get(bundle_name) {
        None => true,
        Some(local) => local != info.version_hash,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    Idle,
    Running,
    Completed,
    Failed,
}

// Byte counts are u128 so totals over many large bundles cannot overflow.
struct Progress {
    state: DownloadState,
    target: Vec<String>,
    download_size: u128,
    // Bytes already secured when the current or last run started.
    start_bytes: u128,
    // Bytes secured once the last run settled.
    settled_bytes: u128,
    current: Option<Arc<SyncRun>>,
}

/// Settles the downloader when a run ends, including when the `run` future
/// is dropped before it finishes.
struct ActiveRun<'a> {
    downloader: &'a Downloader,
    run: Arc<SyncRun>,
    settled: bool,
}

impl ActiveRun<'_> {
    fn settle(mut self, result: &Result<()>) {
        self.settled = true;
        self.downloader.settle(&self.run, Some(result));
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.downloader.settle(&self.run, None);
        }
    }
}

fn saturate(bytes: u128) -> u64 {
    u64::try_from(bytes).unwrap_or(u64::MAX)
}

/// Reusable across retries: `run` only fetches what is still stale, so a
/// failed run can simply be run again.
pub struct Downloader {
    ctx: SyncContext,
    progress: Mutex<Progress>,
}

impl Downloader {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            progress: Mutex::new(Progress {
                state: DownloadState::Idle,
                target: Vec::new(),
                download_size: 0,
                start_bytes: 0,
                settled_bytes: 0,
                current: None,
            }),
        }
    }

    /// Resolve `asset_names` to their owning bundles plus transitive
    /// dependencies, keeping those without a current local version. Resets
    /// the downloader to `Idle`. Rejected while a run is in progress.
    pub fn set_target<S: AsRef<str>>(&self, asset_names: &[S]) -> Result<()> {
        let manifest = &self.ctx.manifest;
        let mut bundles = BTreeSet::new();
        for asset in asset_names {
            let asset = asset.as_ref();
            let owner = manifest
                .bundle_for_asset(asset)
                .ok_or_else(|| HubError::NotFound(format!("no bundle contains asset {}", asset)))?;
            bundles.insert(owner.to_string());
            bundles.extend(manifest.transitive_dependencies(owner)?);
        }

        let target: Vec<String> = {
            let versions = self.ctx.versions.read();
            bundles
                .into_iter()
                .filter(|name| exists_new_release(manifest, &versions, name))
                .collect()
        };
        let mut download_size = 0u128;
        for name in &target {
            download_size += u128::from(manifest.bundle_info(name)?.size_bytes);
        }

        let mut progress = self.progress.lock();
        if progress.state == DownloadState::Running {
            return Err(HubError::InvalidState("downloader is running".to_string()));
        }
        info!(
            "download target set: {} bundles, {} bytes",
            target.len(),
            download_size
        );
        progress.state = DownloadState::Idle;
        progress.target = target;
        progress.download_size = download_size;
        progress.start_bytes = 0;
        progress.settled_bytes = 0;
        progress.current = None;
        Ok(())
    }

    /// Synchronise whatever part of the target is still stale. Valid from
    /// `Idle` or `Failed`. Dropping the returned future part way leaves the
    /// downloader `Failed`, ready for another run.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let run = match self.prepare()? {
            Some(run) => run,
            None => return Ok(()),
        };
        let active = ActiveRun {
            downloader: self,
            run: Arc::clone(&run),
            settled: false,
        };

        let deps = StageDeps {
            pipeline: &self.ctx.pipeline,
            hasher: self.ctx.hasher.as_ref(),
            versions: &self.ctx.versions,
        };
        let result = run_stages(&run, &deps, cancel).await;
        active.settle(&result);
        result
    }

    // `None` means the run was abandoned before it returned.
    fn settle(&self, run: &SyncRun, result: Option<&Result<()>>) {
        let merged_bytes: u128 = run
            .merged()
            .iter()
            .filter_map(|name| self.ctx.manifest.bundle_info(name).ok())
            .map(|info| u128::from(info.size_bytes))
            .sum();

        let mut progress = self.progress.lock();
        progress.current = None;
        progress.settled_bytes = (progress.start_bytes + merged_bytes).min(progress.download_size);
        match result {
            Some(Ok(())) => {
                progress.state = DownloadState::Completed;
                progress.settled_bytes = progress.download_size;
                info!("download completed: {} bytes", progress.download_size);
            }
            Some(Err(e)) => {
                progress.state = DownloadState::Failed;
                warn!(
                    "download failed after {} of {} bytes: {}",
                    progress.settled_bytes, progress.download_size, e
                );
            }
            None => {
                progress.state = DownloadState::Failed;
                warn!(
                    "download abandoned after {} of {} bytes",
                    progress.settled_bytes, progress.download_size
                );
            }
        }
    }

    // Computes the residual set and moves to Running. None when nothing is
    // left to fetch, in which case the downloader is already Completed.
    fn prepare(&self) -> Result<Option<Arc<SyncRun>>> {
        let mut progress = self.progress.lock();
        match progress.state {
            DownloadState::Idle | DownloadState::Failed => {}
            state => {
                return Err(HubError::InvalidState(format!(
                    "downloader cannot run from {:?}",
                    state
                )))
            }
        }

        let manifest = &self.ctx.manifest;
        let mut residual = Vec::new();
        let mut secured = 0u128;
        {
            let versions = self.ctx.versions.read();
            for name in &progress.target {
                if exists_new_release(manifest, &versions, name) {
                    residual.push(name.clone());
                } else {
                    secured += u128::from(manifest.bundle_info(name)?.size_bytes);
                }
            }
        }
        progress.start_bytes = secured.min(progress.download_size);

        if residual.is_empty() {
            progress.state = DownloadState::Completed;
            progress.settled_bytes = progress.download_size;
            info!("download target already current");
            return Ok(None);
        }

        let run = Arc::new(SyncRun::new(
            residual,
            Arc::clone(manifest),
            self.ctx.layout.clone(),
            self.ctx.timeout,
            self.ctx.shuffle,
        )?);
        info!(
            "download running: {} bundles, {} of {} bytes already secured",
            run.bundles().len(),
            progress.start_bytes,
            progress.download_size
        );
        progress.state = DownloadState::Running;
        progress.current = Some(Arc::clone(&run));
        Ok(Some(run))
    }

    pub fn state(&self) -> DownloadState {
        self.progress.lock().state
    }

    /// Total bytes of the target set, as declared by the manifest.
    /// Saturates at `u64::MAX`.
    pub fn download_size(&self) -> u64 {
        saturate(self.progress.lock().download_size)
    }

    pub fn downloaded_size(&self) -> u64 {
        let progress = self.progress.lock();
        let bytes = match &progress.current {
            Some(run) => (progress.start_bytes + run.transferred_bytes()).min(progress.download_size),
            None => progress.settled_bytes,
        };
        saturate(bytes)
    }

    /// Overall fraction in `0.0..=1.0`. While running this interpolates from
    /// the bytes secured before the run to 1.0 using the run's own progress.
    pub fn progress(&self) -> f64 {
        let progress = self.progress.lock();
        if progress.state == DownloadState::Completed {
            return 1.0;
        }
        if progress.download_size == 0 {
            return 0.0;
        }
        let size = progress.download_size as f64;
        match &progress.current {
            Some(run) => {
                let start = progress.start_bytes as f64 / size;
                (start + (1.0 - start) * run.calc_progress()).clamp(0.0, 1.0)
            }
            None => (progress.settled_bytes as f64 / size).clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::config::HubConfig;
    use crate::manifest::BundleInfo;
    use crate::store::Md5Hasher;

    fn info(name: &str, size: u64) -> BundleInfo {
        BundleInfo {
            name: name.to_string(),
            version_hash: "v1".to_string(),
            integrity_hash: String::new(),
            size_bytes: size,
            direct_dependencies: Vec::new(),
            asset_names: vec![format!("{}/asset", name)],
        }
    }

    fn downloader(dir: &std::path::Path, bundles: Vec<BundleInfo>) -> Downloader {
        let config = HubConfig {
            store_dir: dir.join("store"),
            staging_dir: dir.join("staging"),
            ..HubConfig::default()
        };
        let layout = StoreLayout::from_config(&config);
        let versions = VersionTable::new(layout.version_table_path(), None);
        Downloader::new(SyncContext {
            manifest: Arc::new(Manifest::new(1, bundles).unwrap()),
            layout,
            pipeline: Pipeline::new(Vec::new()),
            hasher: Arc::new(Md5Hasher),
            versions: Arc::new(RwLock::new(versions)),
            timeout: config.timeout(),
            shuffle: false,
        })
    }

    #[test]
    fn test_target_larger_than_u64() {
        let dir = tempfile::tempdir().unwrap();
        let half = u64::MAX / 2 + 1;
        let downloader = downloader(dir.path(), vec![info("A", half), info("B", half)]);

        downloader.set_target(&["A/asset", "B/asset"]).unwrap();
        assert_eq!(downloader.state(), DownloadState::Idle);
        assert_eq!(downloader.download_size(), u64::MAX);
        assert_eq!(downloader.downloaded_size(), 0);
        assert_eq!(downloader.progress(), 0.0);
    }

    #[test]
    fn test_unknown_bundle_is_not_new() {
        let versions = VersionTable::new("/nonexistent/table.json", None);
        let manifest = Manifest::new(1, vec![info("A", 1)]).unwrap();
        assert!(exists_new_release(&manifest, &versions, "A"));
        assert!(!exists_new_release(&manifest, &versions, "Z"));
    }
}
