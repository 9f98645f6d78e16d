// Dependency-aware, reference-counted cache of opened bundles and extracted assets.

use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bundle::{AssetObject, Bundle, BundleReader};
use crate::error::{HubError, Result};
use crate::manifest::Manifest;
use crate::store::{SharedVersionTable, StoreLayout};

/// How an in-flight load ended.
#[derive(Debug, Clone)]
enum Settled {
    Loaded,
    Failed(String),
    // The loading future was dropped; a waiter may start its own load.
    Abandoned,
}

/// Rendezvous for callers that find a load already in progress.
#[derive(Default)]
struct InFlight {
    notify: Notify,
    finished: AtomicBool,
    settled: Mutex<Option<Settled>>,
}

impl InFlight {
    async fn wait(&self) -> Settled {
        // Registered before the flag check, so a finish in between still wakes us.
        let notified = self.notify.notified();
        if !self.finished.load(Ordering::SeqCst) {
            notified.await;
        }
        self.settled.lock().clone().unwrap_or(Settled::Abandoned)
    }

    fn finish(&self, settled: Settled) {
        *self.settled.lock() = Some(settled);
        self.finished.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

fn settled_from<T>(result: &Result<T>) -> Settled {
    match result {
        Ok(_) => Settled::Loaded,
        Err(e) => Settled::Failed(e.to_string()),
    }
}

/// Owns the `Loading` slot of a bundle open. If the open is dropped before
/// it settles, the slot is removed and waiters are told to retry.
struct PendingBundle<'a> {
    cache: &'a LocalCache,
    bundle_name: &'a str,
    inflight: Arc<InFlight>,
    settled: bool,
}

impl PendingBundle<'_> {
    fn settle(mut self, result: &Result<Arc<dyn Bundle>>) {
        self.settled = true;
        let mut state = self.cache.state.lock();
        match result {
            Ok(bundle) => {
                state.bundles.insert(
                    self.bundle_name.to_string(),
                    Slot::Resident(BundleRef {
                        bundle: Arc::clone(bundle),
                        count: 1,
                    }),
                );
                info!("bundle {} loaded", self.bundle_name);
            }
            Err(e) => {
                state.bundles.remove(self.bundle_name);
                warn!("bundle {} failed to load: {}", self.bundle_name, e);
            }
        }
        self.inflight.finish(settled_from(result));
    }
}

impl Drop for PendingBundle<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.cache.state.lock();
        if matches!(
            state.bundles.get(self.bundle_name),
            Some(Slot::Loading(current)) if Arc::ptr_eq(current, &self.inflight)
        ) {
            state.bundles.remove(self.bundle_name);
        }
        self.inflight.finish(Settled::Abandoned);
        warn!("load of bundle {} abandoned", self.bundle_name);
    }
}

/// Dependencies charged while opening a bundle. Released again on drop
/// unless the open committed them.
struct DependencyCharge<'a> {
    cache: &'a LocalCache,
    charged: Vec<&'a str>,
}

impl<'a> DependencyCharge<'a> {
    fn commit(mut self) {
        self.charged.clear();
    }
}

impl Drop for DependencyCharge<'_> {
    fn drop(&mut self) {
        if !self.charged.is_empty() {
            self.cache.release_all(&self.charged);
        }
    }
}

/// Owns the in-flight marker of an asset extraction.
struct PendingAsset<'a> {
    cache: &'a LocalCache,
    asset_name: &'a str,
    inflight: Arc<InFlight>,
    settled: bool,
}

impl PendingAsset<'_> {
    fn settle(mut self, result: &Result<AssetObject>) {
        self.settled = true;
        self.cache.state.lock().loading_assets.remove(self.asset_name);
        self.inflight.finish(settled_from(result));
    }
}

impl Drop for PendingAsset<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.cache.state.lock();
        if matches!(
            state.loading_assets.get(self.asset_name),
            Some(current) if Arc::ptr_eq(current, &self.inflight)
        ) {
            state.loading_assets.remove(self.asset_name);
        }
        self.inflight.finish(Settled::Abandoned);
        warn!("load of asset {} abandoned", self.asset_name);
    }
}

struct BundleRef {
    bundle: Arc<dyn Bundle>,
    count: usize,
}

enum Slot {
    Loading(Arc<InFlight>),
    Resident(BundleRef),
}

enum AssetEntry {
    Ready(AssetObject),
    // Owning bundle was disposed or the entry was evicted.
    Cleared,
}

#[derive(Default)]
struct CacheState {
    bundles: HashMap<String, Slot>,
    assets: HashMap<String, AssetEntry>,
    // bundle name -> asset names extracted from it
    assets_by_bundle: HashMap<String, Vec<String>>,
    loading_assets: HashMap<String, Arc<InFlight>>,
}

enum BundleStep {
    Ready(Arc<dyn Bundle>),
    Wait(Arc<InFlight>),
    Open(Arc<InFlight>),
}

/// Collaborators the cache reads from.
#[derive(Clone)]
pub struct CacheContext {
    pub manifest: Arc<Manifest>,
    pub versions: SharedVersionTable,
    pub layout: StoreLayout,
    pub reader: Arc<dyn BundleReader>,
}

/// Bundles are `Absent`, `Loading` or `Resident(count)`. Every load charges
/// one reference on the bundle and, along each dependency edge, one on every
/// dependency; unloading reverses exactly the same walk. A bundle is disposed
/// when its count reaches zero, which clears the assets extracted from it.
///
/// Concurrent loads of the same bundle or asset share a single open or
/// extraction. All bookkeeping lives behind one mutex that is never held
/// across an await.
pub struct LocalCache {
    ctx: CacheContext,
    state: Mutex<CacheState>,
}

impl LocalCache {
    pub fn new(ctx: CacheContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.ctx.manifest
    }

    /// Load a bundle and its dependencies, charging one reference each.
    ///
    /// If `cancel` fired by the time the load settles, `Cancelled` is
    /// returned but the reference stays charged and must still be unloaded.
    pub async fn load_bundle(
        &self,
        bundle_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Bundle>> {
        let bundle = self.acquire(bundle_name).await?;
        if cancel.is_cancelled() {
            debug!("load of {} cancelled after bookkeeping", bundle_name);
            return Err(HubError::Cancelled);
        }
        Ok(bundle)
    }

    fn acquire<'a>(&'a self, bundle_name: &'a str) -> BoxFuture<'a, Result<Arc<dyn Bundle>>> {
        async move {
            loop {
                let step = {
                    let mut state = self.state.lock();
                    let loading = match state.bundles.get(bundle_name) {
                        Some(Slot::Resident(_)) => None,
                        Some(Slot::Loading(inflight)) => Some(Some(Arc::clone(inflight))),
                        None => Some(None),
                    };
                    match loading {
                        None => match self.retain_locked(&mut state, bundle_name) {
                            Some(bundle) => BundleStep::Ready(bundle),
                            None => {
                                return Err(HubError::InvalidState(format!(
                                    "bundle {} vanished while resident",
                                    bundle_name
                                )))
                            }
                        },
                        Some(Some(inflight)) => BundleStep::Wait(inflight),
                        Some(None) => {
                            let inflight = Arc::new(InFlight::default());
                            state
                                .bundles
                                .insert(bundle_name.to_string(), Slot::Loading(Arc::clone(&inflight)));
                            BundleStep::Open(inflight)
                        }
                    }
                };

                match step {
                    BundleStep::Ready(bundle) => return Ok(bundle),
                    BundleStep::Open(inflight) => return self.open_fresh(bundle_name, inflight).await,
                    BundleStep::Wait(inflight) => {
                        debug!("waiting for in-flight load of {}", bundle_name);
                        match inflight.wait().await {
                            Settled::Failed(reason) => {
                                return Err(HubError::LoadFailed {
                                    name: bundle_name.to_string(),
                                    reason,
                                })
                            }
                            // The next pass finds it resident, or absent and
                            // opens it here.
                            Settled::Loaded | Settled::Abandoned => {}
                        }
                    }
                }
            }
        }
        .boxed()
    }

    // Charge `bundle_name` and, edge by edge, its dependencies.
    fn retain_locked(&self, state: &mut CacheState, bundle_name: &str) -> Option<Arc<dyn Bundle>> {
        let bundle = match state.bundles.get_mut(bundle_name) {
            Some(Slot::Resident(entry)) => {
                entry.count += 1;
                Arc::clone(&entry.bundle)
            }
            _ => return None,
        };
        if let Ok(info) = self.ctx.manifest.bundle_info(bundle_name) {
            for dep in &info.direct_dependencies {
                if self.retain_locked(state, dep).is_none() {
                    warn!("dependency {} of {} is not resident", dep, bundle_name);
                }
            }
        }
        Some(bundle)
    }

    async fn open_fresh(&self, bundle_name: &str, inflight: Arc<InFlight>) -> Result<Arc<dyn Bundle>> {
        let pending = PendingBundle {
            cache: self,
            bundle_name,
            inflight,
            settled: false,
        };
        let result = self.open_with_dependencies(bundle_name).await;
        pending.settle(&result);
        result
    }

    // Dependencies first, then the payload. On failure, or if this future is
    // dropped, every dependency charged here is released again.
    async fn open_with_dependencies(&self, bundle_name: &str) -> Result<Arc<dyn Bundle>> {
        let info = self.ctx.manifest.bundle_info(bundle_name)?;

        let mut charge = DependencyCharge {
            cache: self,
            charged: Vec::with_capacity(info.direct_dependencies.len()),
        };
        for dep in &info.direct_dependencies {
            self.acquire(dep).await?;
            charge.charged.push(dep);
        }

        let bundle = self.open_payload(bundle_name).await?;
        charge.commit();
        Ok(bundle)
    }

    async fn open_payload(&self, bundle_name: &str) -> Result<Arc<dyn Bundle>> {
        if !self.ctx.versions.read().contains(bundle_name) {
            return Err(HubError::NotDownloaded(bundle_name.to_string()));
        }
        let path = self.ctx.layout.bundle_path(bundle_name);
        self.ctx
            .reader
            .open(bundle_name, &path)
            .await
            .map_err(|source| HubError::Open {
                name: bundle_name.to_string(),
                source,
            })
    }

    fn release_all(&self, bundle_names: &[&str]) {
        let mut state = self.state.lock();
        for name in bundle_names {
            self.release_locked(&mut state, name);
        }
    }

    // One decrement of `bundle_name`, repeated along every dependency edge.
    fn release_locked(&self, state: &mut CacheState, bundle_name: &str) {
        let disposed = match state.bundles.get_mut(bundle_name) {
            Some(Slot::Resident(entry)) => {
                entry.count -= 1;
                entry.count == 0
            }
            Some(Slot::Loading(_)) => {
                warn!("release of {} skipped: still loading", bundle_name);
                return;
            }
            None => {
                debug!("release of {} skipped: not resident", bundle_name);
                return;
            }
        };
        if disposed {
            self.dispose_locked(state, bundle_name);
        }
        if let Ok(info) = self.ctx.manifest.bundle_info(bundle_name) {
            for dep in &info.direct_dependencies {
                self.release_locked(state, dep);
            }
        }
    }

    fn dispose_locked(&self, state: &mut CacheState, bundle_name: &str) {
        state.bundles.remove(bundle_name);
        if let Some(assets) = state.assets_by_bundle.remove(bundle_name) {
            for asset in assets {
                if let Some(entry) = state.assets.get_mut(&asset) {
                    *entry = AssetEntry::Cleared;
                }
            }
        }
        info!("bundle {} disposed", bundle_name);
    }

    /// Drop one reference, or all of them with `ignore_ref_count`, walking the
    /// dependency edges the same way loading did. A bundle that is still
    /// loading cannot be unloaded; the call is logged and ignored.
    pub fn unload_bundle(&self, bundle_name: &str, ignore_ref_count: bool) -> Result<()> {
        let mut state = self.state.lock();
        let count = match state.bundles.get(bundle_name) {
            Some(Slot::Resident(entry)) => entry.count,
            Some(Slot::Loading(_)) => {
                warn!("unload of {} rejected: still loading", bundle_name);
                return Ok(());
            }
            None => {
                return Err(HubError::InvalidState(format!(
                    "bundle {} is not loaded",
                    bundle_name
                )))
            }
        };
        let times = if ignore_ref_count { count } else { 1 };
        for _ in 0..times {
            self.release_locked(&mut state, bundle_name);
        }
        Ok(())
    }

    /// Hard reset: drops every resident bundle regardless of its count.
    pub fn unload_all(&self) {
        let mut state = self.state.lock();
        let resident: Vec<String> = state
            .bundles
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Resident(_)))
            .map(|(name, _)| name.clone())
            .collect();
        for name in resident {
            let count = match state.bundles.get(&name) {
                Some(Slot::Resident(entry)) => entry.count,
                _ => continue,
            };
            for _ in 0..count {
                self.release_locked(&mut state, &name);
            }
        }
        info!("all bundles unloaded");
    }

    pub fn is_bundle_loaded(&self, bundle_name: &str) -> bool {
        matches!(
            self.state.lock().bundles.get(bundle_name),
            Some(Slot::Resident(_))
        )
    }

    pub fn is_bundle_loading(&self, bundle_name: &str) -> bool {
        matches!(
            self.state.lock().bundles.get(bundle_name),
            Some(Slot::Loading(_))
        )
    }

    pub fn bundle_ref_count(&self, bundle_name: &str) -> Option<usize> {
        match self.state.lock().bundles.get(bundle_name) {
            Some(Slot::Resident(entry)) => Some(entry.count),
            _ => None,
        }
    }

    /// Snapshot of resident bundles and their counts.
    pub fn resident_bundles(&self) -> BTreeMap<String, usize> {
        self.state
            .lock()
            .bundles
            .iter()
            .filter_map(|(name, slot)| match slot {
                Slot::Resident(entry) => Some((name.clone(), entry.count)),
                Slot::Loading(_) => None,
            })
            .collect()
    }

    fn resident_handle(&self, bundle_name: &str) -> Option<Arc<dyn Bundle>> {
        match self.state.lock().bundles.get(bundle_name) {
            Some(Slot::Resident(entry)) => Some(Arc::clone(&entry.bundle)),
            _ => None,
        }
    }

    /// Load the bundle that holds `scene_name`. Scenes are opened once: a
    /// scene bundle that is already resident is returned without taking
    /// another reference.
    pub async fn load_scene(
        &self,
        scene_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Bundle>> {
        let bundle_name = self.owning_bundle(scene_name)?;
        if let Some(bundle) = self.resident_handle(&bundle_name) {
            warn!("scene bundle {} already loaded", bundle_name);
            return Ok(bundle);
        }
        self.load_bundle(&bundle_name, cancel).await
    }

    pub fn unload_scene(&self, scene_name: &str) -> Result<()> {
        let bundle_name = self.owning_bundle(scene_name)?;
        self.unload_bundle(&bundle_name, false)
    }

    pub fn is_scene_loaded(&self, scene_name: &str) -> bool {
        match self.owning_bundle(scene_name) {
            Ok(bundle_name) => self.is_bundle_loaded(&bundle_name),
            Err(e) => {
                error!("{}", e);
                false
            }
        }
    }

    fn owning_bundle(&self, asset_name: &str) -> Result<String> {
        self.ctx
            .manifest
            .bundle_for_asset(asset_name)
            .map(str::to_string)
            .ok_or_else(|| HubError::NotFound(format!("no bundle contains asset {}", asset_name)))
    }

    /// Load an asset, charging one reference on its owning bundle. The first
    /// load extracts it; later loads reuse the cached object.
    pub async fn load_any(&self, asset_name: &str, cancel: &CancellationToken) -> Result<AssetObject> {
        let bundle_name = self.owning_bundle(asset_name)?;

        let inflight = loop {
            let other = {
                let mut state = self.state.lock();
                match state.loading_assets.get(asset_name) {
                    Some(other) => Arc::clone(other),
                    None => {
                        let inflight = Arc::new(InFlight::default());
                        state
                            .loading_assets
                            .insert(asset_name.to_string(), Arc::clone(&inflight));
                        break inflight;
                    }
                }
            };
            if let Settled::Failed(reason) = other.wait().await {
                return Err(HubError::LoadFailed {
                    name: asset_name.to_string(),
                    reason,
                });
            }
        };

        let pending = PendingAsset {
            cache: self,
            asset_name,
            inflight,
            settled: false,
        };
        let result = self.extract(asset_name, &bundle_name).await;
        pending.settle(&result);

        let object = result?;
        if cancel.is_cancelled() {
            debug!("load of asset {} cancelled after bookkeeping", asset_name);
            return Err(HubError::Cancelled);
        }
        Ok(object)
    }

    async fn extract(&self, asset_name: &str, bundle_name: &str) -> Result<AssetObject> {
        let bundle = self.acquire(bundle_name).await?;

        let cached = match self.state.lock().assets.get(asset_name) {
            Some(AssetEntry::Ready(object)) => Some(Arc::clone(object)),
            _ => None,
        };
        let object = match cached {
            Some(object) => object,
            None => match bundle.load_asset(asset_name) {
                Ok(object) => object,
                Err(source) => {
                    self.release_all(&[bundle_name]);
                    return Err(HubError::Open {
                        name: asset_name.to_string(),
                        source,
                    });
                }
            },
        };

        let mut state = self.state.lock();
        state
            .assets
            .insert(asset_name.to_string(), AssetEntry::Ready(Arc::clone(&object)));
        let extracted = state
            .assets_by_bundle
            .entry(bundle_name.to_string())
            .or_default();
        if !extracted.iter().any(|name| name == asset_name) {
            extracted.push(asset_name.to_string());
        }
        Ok(object)
    }

    /// Typed load. A type mismatch releases the reference the load charged.
    pub async fn load_asset<T: Any + Send + Sync>(
        &self,
        asset_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<T>> {
        let object = self.load_any(asset_name, cancel).await?;
        match object.downcast::<T>() {
            Ok(asset) => Ok(asset),
            Err(_) => {
                let bundle_name = self.owning_bundle(asset_name)?;
                self.release_all(&[bundle_name.as_str()]);
                Err(HubError::TypeMismatch {
                    name: asset_name.to_string(),
                    requested: type_name::<T>(),
                })
            }
        }
    }

    /// Read a loaded asset without touching any count.
    pub fn get_asset<T: Any + Send + Sync>(&self, asset_name: &str) -> Result<Arc<T>> {
        let object = match self.state.lock().assets.get(asset_name) {
            Some(AssetEntry::Ready(object)) => Arc::clone(object),
            Some(AssetEntry::Cleared) => {
                return Err(HubError::InvalidState(format!(
                    "asset {} was unloaded",
                    asset_name
                )))
            }
            None => return Err(HubError::NotFound(format!("asset {} is not loaded", asset_name))),
        };
        object.downcast::<T>().map_err(|_| HubError::TypeMismatch {
            name: asset_name.to_string(),
            requested: type_name::<T>(),
        })
    }

    /// Release one reference of the asset's owning bundle, or all of them
    /// with `ignore_ref_count`. Ignored while the asset is still loading.
    pub fn unload_asset(&self, asset_name: &str, ignore_ref_count: bool) -> Result<()> {
        if self.state.lock().loading_assets.contains_key(asset_name) {
            warn!("unload of asset {} rejected: still loading", asset_name);
            return Ok(());
        }
        self.release_asset(asset_name, ignore_ref_count)
    }

    // Release without the loading check, for holders whose charge is settled.
    pub(crate) fn release_asset(&self, asset_name: &str, ignore_ref_count: bool) -> Result<()> {
        let bundle_name = self.owning_bundle(asset_name)?;
        if !self.is_bundle_loaded(&bundle_name) {
            debug!("asset {} already unloaded", asset_name);
            return Ok(());
        }
        self.unload_bundle(&bundle_name, ignore_ref_count)
    }

    /// Clear a cached asset object. Returns whether one was cached.
    pub fn evict_asset(&self, asset_name: &str) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.assets.get_mut(asset_name) else {
            return false;
        };
        if matches!(*entry, AssetEntry::Ready(_)) {
            *entry = AssetEntry::Cleared;
            true
        } else {
            false
        }
    }
}
