// Shared state of one sync run: inputs, per-bundle progress and the stage outputs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{HubError, Result};
use crate::manifest::Manifest;
use crate::store::StoreLayout;
use crate::transport::{FetchRequest, ProgressFn};

#[derive(Default)]
struct RunOutputs {
    progress: HashMap<String, f32>,
    staged: Vec<String>,
    broken: Vec<String>,
    merged: Vec<String>,
    error: Option<HubError>,
}

/// Context threaded through the fetch, verify, promote and record stages.
///
/// Every target bundle gets exactly one staging path for the lifetime of the
/// run. Outputs are mutated from concurrent fetch tasks, so they live behind
/// a single mutex.
pub struct SyncRun {
    bundles: Vec<String>,
    manifest: Arc<Manifest>,
    layout: StoreLayout,
    timeout: Duration,
    shuffle: bool,
    staging: HashMap<String, PathBuf>,
    // Aggregates are u128 so sums of u64 sizes cannot overflow.
    total_bytes: u128,
    outputs: Mutex<RunOutputs>,
}

impl SyncRun {
    /// Fails with `NotFound` if a name is not in the manifest.
    pub fn new(
        bundles: Vec<String>,
        manifest: Arc<Manifest>,
        layout: StoreLayout,
        timeout: Duration,
        shuffle: bool,
    ) -> Result<Self> {
        let mut staging = HashMap::with_capacity(bundles.len());
        let mut total_bytes = 0u128;
        for name in &bundles {
            total_bytes += u128::from(manifest.bundle_info(name)?.size_bytes);
            staging.insert(name.clone(), layout.new_staging_path());
        }
        Ok(Self {
            bundles,
            manifest,
            layout,
            timeout,
            shuffle,
            staging,
            total_bytes,
            outputs: Mutex::new(RunOutputs::default()),
        })
    }

    pub fn bundles(&self) -> &[String] {
        &self.bundles
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    /// Sum of manifest sizes over the run's bundles.
    pub fn total_bytes(&self) -> u128 {
        self.total_bytes
    }

    pub fn staging_path(&self, bundle_name: &str) -> Result<&PathBuf> {
        self.staging
            .get(bundle_name)
            .ok_or_else(|| HubError::NotFound(format!("{} is not part of this run", bundle_name)))
    }

    /// The transport request for one bundle; progress lands in this run.
    pub fn fetch_request(self: &Arc<Self>, bundle_name: &str) -> Result<FetchRequest> {
        let destination = self.staging_path(bundle_name)?.clone();
        let run = Arc::clone(self);
        let name = bundle_name.to_string();
        let progress: ProgressFn = Arc::new(move |fraction| run.set_progress(&name, fraction));
        Ok(FetchRequest::new(self.layout.bundle_url(bundle_name), destination, self.timeout)
            .with_progress(progress))
    }

    pub fn set_progress(&self, bundle_name: &str, fraction: f32) {
        self.outputs
            .lock()
            .progress
            .insert(bundle_name.to_string(), fraction);
    }

    /// Bytes transferred so far, weighted by manifest size.
    pub fn transferred_bytes(&self) -> u128 {
        let outputs = self.outputs.lock();
        let mut transferred = 0u128;
        for name in &self.bundles {
            let Some(&fraction) = outputs.progress.get(name) else {
                continue;
            };
            let Ok(info) = self.manifest.bundle_info(name) else {
                continue;
            };
            if fraction >= 1.0 {
                transferred += u128::from(info.size_bytes);
            } else if fraction > 0.0 {
                transferred += (info.size_bytes as f64 * fraction as f64) as u128;
            }
        }
        transferred
    }

    /// Fraction of the run's bytes transferred, 0.0 for an empty run.
    pub fn calc_progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.transferred_bytes() as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }

    pub fn mark_staged(&self, bundle_name: &str) {
        let mut outputs = self.outputs.lock();
        outputs.progress.insert(bundle_name.to_string(), 1.0);
        outputs.staged.push(bundle_name.to_string());
    }

    pub fn staged(&self) -> Vec<String> {
        self.outputs.lock().staged.clone()
    }

    /// Removes the bundle from the staged set and flags the run broken.
    pub fn mark_broken(&self, bundle_name: &str) {
        let mut outputs = self.outputs.lock();
        outputs.staged.retain(|name| name != bundle_name);
        if !outputs.broken.iter().any(|name| name == bundle_name) {
            outputs.broken.push(bundle_name.to_string());
        }
    }

    pub fn broken(&self) -> Vec<String> {
        self.outputs.lock().broken.clone()
    }

    pub fn is_broken(&self) -> bool {
        !self.outputs.lock().broken.is_empty()
    }

    pub fn mark_merged(&self, bundle_name: &str) {
        self.outputs.lock().merged.push(bundle_name.to_string());
    }

    pub fn merged(&self) -> Vec<String> {
        self.outputs.lock().merged.clone()
    }

    /// Record a stage-level error. Only the first one is kept; returns
    /// whether this call recorded it.
    pub fn record_error(&self, error: HubError) -> bool {
        let mut outputs = self.outputs.lock();
        if outputs.error.is_some() {
            return false;
        }
        outputs.error = Some(error);
        true
    }

    pub fn has_error(&self) -> bool {
        self.outputs.lock().error.is_some()
    }

    pub(crate) fn take_error(&self) -> Option<HubError> {
        self.outputs.lock().error.take()
    }
}
