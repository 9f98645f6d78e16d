// Scoped batch of asset loads released together.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::local_cache::LocalCache;
use crate::error::{HubError, Result};

/// Loads assets in batches and releases exactly the ones it registered.
///
/// A name is registered only when its load charged a reference: on success
/// and on cancellation. Failed loads charge nothing and are not registered,
/// so they can be requested again. Dropping the group releases it.
pub struct AssetGroup {
    cache: Arc<LocalCache>,
    registered: BTreeSet<String>,
    released: bool,
    ignore_ref_count: bool,
}

impl AssetGroup {
    pub fn new(cache: Arc<LocalCache>) -> Self {
        Self {
            cache,
            registered: BTreeSet::new(),
            released: false,
            ignore_ref_count: false,
        }
    }

    /// Release with `ignore_ref_count`, dropping every reference of the
    /// owning bundles rather than one each.
    pub fn with_ignore_ref_count(mut self, ignore_ref_count: bool) -> Self {
        self.ignore_ref_count = ignore_ref_count;
        self
    }

    /// Load every asset not already registered here, concurrently. Returns
    /// the first failure, or `Cancelled` if any load was cancelled; the
    /// successful loads stay registered either way. Each load is registered
    /// as soon as it completes, so dropping this future part way still
    /// leaves the group owning every charge taken so far.
    pub async fn load_all<S: AsRef<str>>(
        &mut self,
        asset_names: &[S],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.released {
            return Err(HubError::InvalidState("asset group already released".to_string()));
        }

        let pending: BTreeSet<&str> = asset_names
            .iter()
            .map(|name| name.as_ref())
            .filter(|name| !self.registered.contains(*name))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let cache = Arc::clone(&self.cache);
        let mut loads: FuturesUnordered<_> = pending
            .into_iter()
            .map(|name| {
                let cache = &cache;
                async move { (name, cache.load_any(name, cancel).await) }
            })
            .collect();

        let mut failure = None;
        let mut cancelled = false;
        while let Some((name, outcome)) = loads.next().await {
            match outcome {
                Ok(_) => {
                    self.registered.insert(name.to_string());
                }
                Err(HubError::Cancelled) => {
                    self.registered.insert(name.to_string());
                    cancelled = true;
                }
                Err(e) => {
                    warn!("group load of {} failed: {}", name, e);
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None if cancelled => Err(HubError::Cancelled),
            None => Ok(()),
        }
    }

    pub fn contains(&self, asset_name: &str) -> bool {
        self.registered.contains(asset_name)
    }

    pub fn registered(&self) -> impl Iterator<Item = &str> {
        self.registered.iter().map(String::as_str)
    }

    /// Unload every registered asset once. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for name in std::mem::take(&mut self.registered) {
            if let Err(e) = self.cache.release_asset(&name, self.ignore_ref_count) {
                warn!("group release of {} failed: {}", name, e);
            }
        }
        debug!("asset group released");
    }
}

impl Drop for AssetGroup {
    fn drop(&mut self) {
        self.release();
    }
}
