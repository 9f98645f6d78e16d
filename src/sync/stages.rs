// Fetch -> verify -> promote -> record. Each stage reads and writes the shared SyncRun.

use std::path::Path;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::run::SyncRun;
use crate::error::{HubError, Result};
use crate::store::hasher::{hashes_match, FileHasher};
use crate::store::SharedVersionTable;
use crate::transport::Pipeline;

/// Collaborators the stages need besides the run itself.
pub struct StageDeps<'a> {
    pub pipeline: &'a Pipeline,
    pub hasher: &'a dyn FileHasher,
    pub versions: &'a SharedVersionTable,
}

/// Run all four stages in order and fold the outputs into one result:
/// `AssetBundleBroken` if any bundle failed verification, else the first
/// fetch error, else `Cancelled` if the caller cancelled, else `Ok`.
///
/// Stages after a failed or cancelled fetch still run over whatever was
/// staged, so a retry only needs to fetch what is left.
pub async fn run_stages(
    run: &Arc<SyncRun>,
    deps: &StageDeps<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    fetch(run, deps.pipeline, cancel).await;
    verify_integrity(run, deps.hasher).await;
    promote(run).await;
    record_versions(run, deps.versions);

    let broken = run.broken();
    if !broken.is_empty() {
        return Err(HubError::AssetBundleBroken(broken));
    }
    if let Some(e) = run.take_error() {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(HubError::Cancelled);
    }
    Ok(())
}

/// Issue one transfer per bundle through the pipeline. The first error is
/// recorded. A transport error also cancels the transfers still queued or
/// running; a local error only fails its own bundle. Cancellation, whether
/// from the caller or from that internal cancel, is not an error here.
pub async fn fetch(run: &Arc<SyncRun>, pipeline: &Pipeline, cancel: &CancellationToken) {
    let mut order: Vec<String> = run.bundles().to_vec();
    if run.shuffle() {
        order.shuffle(&mut rand::thread_rng());
    }

    let stage_cancel = cancel.child_token();
    let mut pending = FuturesUnordered::new();
    for name in order {
        let request = match run.fetch_request(&name) {
            Ok(request) => request,
            Err(e) => {
                run.record_error(e);
                stage_cancel.cancel();
                break;
            }
        };
        let stage_cancel = &stage_cancel;
        pending.push(async move {
            let result = pipeline.execute(&request, stage_cancel).await;
            (name, result)
        });
    }

    while let Some((name, result)) = pending.next().await {
        match result {
            Ok(response) => {
                debug!("staged {} bytes={}", name, response.bytes_written);
                run.mark_staged(&name);
            }
            Err(HubError::Cancelled) => debug!("fetch of {} cancelled", name),
            Err(e) => {
                warn!("fetch of {} failed: {}", name, e);
                let abort = e.is_transport();
                run.record_error(e);
                if abort {
                    stage_cancel.cancel();
                }
            }
        }
    }
}

/// Hash every staged file against its manifest checksum. Mismatches leave
/// the staged set and their files are deleted; the others are untouched.
pub async fn verify_integrity(run: &SyncRun, hasher: &dyn FileHasher) {
    let staged = run.staged();
    let checks = staged.iter().map(|name| async move {
        let verdict = check_one(run, hasher, name).await;
        (name, verdict)
    });

    for (name, verdict) in futures::future::join_all(checks).await {
        match verdict {
            Ok(()) => {}
            Err(e) => {
                warn!("bundle {} is broken: {}", name, e);
                run.mark_broken(name);
                if let Ok(path) = run.staging_path(name) {
                    remove_quietly(path).await;
                }
            }
        }
    }
}

async fn check_one(run: &SyncRun, hasher: &dyn FileHasher, name: &str) -> Result<()> {
    let expected = &run.manifest().bundle_info(name)?.integrity_hash;
    let actual = hasher.hash_file(run.staging_path(name)?).await?;
    if hashes_match(&actual, expected) {
        Ok(())
    } else {
        Err(HubError::DataProcessingFailure(format!(
            "{} mismatch: want {} got {}",
            hasher.algorithm(),
            expected,
            actual
        )))
    }
}

/// Move each verified file into the durable store, replacing what was there.
pub async fn promote(run: &SyncRun) {
    for name in run.staged() {
        match promote_one(run, &name).await {
            Ok(()) => {
                debug!("promoted {}", name);
                run.mark_merged(&name);
            }
            Err(e) => {
                error!("failed to promote {}: {}", name, e);
                run.record_error(e);
                if let Ok(path) = run.staging_path(&name) {
                    remove_quietly(path).await;
                }
            }
        }
    }
}

async fn promote_one(run: &SyncRun, name: &str) -> Result<()> {
    let src = run.staging_path(name)?;
    let dest = run.layout().bundle_path(name);
    if let Some(dir) = dest.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| HubError::io(dir, e))?;
    }
    match tokio::fs::remove_file(&dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(HubError::io(&dest, e)),
    }
    tokio::fs::rename(src, &dest)
        .await
        .map_err(|e| HubError::io(&dest, e))
}

/// Persist the manifest version of every promoted bundle.
pub fn record_versions(run: &SyncRun, versions: &SharedVersionTable) {
    let merged = run.merged();
    if merged.is_empty() {
        return;
    }
    let values: Vec<(String, String)> = merged
        .iter()
        .filter_map(|name| {
            let info = run.manifest().bundle_info(name).ok()?;
            Some((name.clone(), info.version_hash.clone()))
        })
        .collect();

    let count = values.len();
    if let Err(e) = versions.write().bulk_set(values) {
        error!("failed to record bundle versions: {}", e);
        run.record_error(e);
        return;
    }
    info!("recorded {} bundle versions", count);
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), e);
        }
    }
}
