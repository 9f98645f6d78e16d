mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use bundlehub::sync::DownloadState;
use bundlehub::transport::{FetchRequest, FetchResponse, Next, Pipeline, TransportStage};
use bundlehub::{Hub, HubError, Result};

use common::*;

/// Terminal stage serving bundles from memory. Each transfer reports half
/// progress, then waits for a permit from `gate` before writing the file.
struct MemoryStage {
    files: HashMap<String, Vec<u8>>,
    gate: Semaphore,
}

#[async_trait]
impl TransportStage for MemoryStage {
    async fn handle(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        _next: Next<'_>,
    ) -> Result<FetchResponse> {
        let name = request.url.rsplit('/').next().unwrap_or_default();
        let body = self
            .files
            .get(name)
            .cloned()
            .ok_or_else(|| HubError::ProtocolFailure(format!("no such file {}", name)))?;
        request.report_progress(0.5);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(HubError::Cancelled),
            permit = self.gate.acquire() => {
                if let Ok(permit) = permit {
                    permit.forget();
                }
            }
        }

        let dir = request.destination.parent().unwrap();
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(&request.destination, &body).await.unwrap();
        request.report_progress(1.0);
        Ok(FetchResponse {
            bytes_written: body.len() as u64,
        })
    }
}

/// Terminal stage whose disk write fails for one bundle. The others take a
/// short pause before writing so a run-wide abort would reach them first.
struct DiskFaultStage {
    files: HashMap<String, Vec<u8>>,
    failing: &'static str,
}

#[async_trait]
impl TransportStage for DiskFaultStage {
    async fn handle(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
        _next: Next<'_>,
    ) -> Result<FetchResponse> {
        let name = request.url.rsplit('/').next().unwrap_or_default();
        if name == self.failing {
            return Err(HubError::Io {
                path: request.destination.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(HubError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
        let body = &self.files[name];
        let dir = request.destination.parent().unwrap();
        tokio::fs::create_dir_all(dir).await.unwrap();
        tokio::fs::write(&request.destination, body).await.unwrap();
        Ok(FetchResponse {
            bytes_written: body.len() as u64,
        })
    }
}

fn write_manifest(config: &bundlehub::HubConfig, bundles: &[FixtureBundle]) {
    std::fs::create_dir_all(&config.store_dir).unwrap();
    std::fs::write(
        config.store_dir.join(&config.manifest_name),
        fixture_manifest(bundles).to_json().unwrap(),
    )
    .unwrap();
}

fn gated_hub(dir: &std::path::Path, bundles: &[FixtureBundle]) -> (Hub, Arc<MemoryStage>) {
    let config = test_config(dir, "mem://cdn/ab");
    write_manifest(&config, bundles);

    let stage = Arc::new(MemoryStage {
        files: bundles
            .iter()
            .map(|b| (b.info.name.clone(), b.bytes.clone()))
            .collect(),
        gate: Semaphore::new(0),
    });
    let stages: Vec<Arc<dyn TransportStage>> = vec![stage.clone()];
    let hub = Hub::builder(config)
        .pipeline(Pipeline::new(stages))
        .build()
        .unwrap();
    hub.load_manifest().unwrap();
    (hub, stage)
}

#[tokio::test]
async fn test_state_transitions_and_running_guards() {
    let bundles = fixture_bundles();
    let dir = tempfile::tempdir().unwrap();
    let (hub, stage) = gated_hub(dir.path(), &bundles);

    let downloader = Arc::new(hub.create_downloader().unwrap());
    assert_eq!(downloader.state(), DownloadState::Idle);
    downloader.set_target(&[CUBE_PREFAB]).unwrap();
    assert_eq!(downloader.download_size(), size_of(&bundles, &["Prefabs003"]));

    let task = {
        let downloader = Arc::clone(&downloader);
        tokio::spawn(async move { downloader.run(&CancellationToken::new()).await })
    };
    eventually("run to start", || downloader.state() == DownloadState::Running).await;
    eventually("half progress", || downloader.progress() > 0.4).await;
    assert!(downloader.progress() < 1.0);
    let mid = downloader.downloaded_size();
    assert!(mid > 0 && mid < downloader.download_size());

    assert!(matches!(
        downloader.set_target(&[SCENE]),
        Err(HubError::InvalidState(_))
    ));
    assert!(matches!(
        downloader.run(&CancellationToken::new()).await,
        Err(HubError::InvalidState(_))
    ));

    stage.gate.add_permits(1);
    task.await.unwrap().unwrap();
    assert_eq!(downloader.state(), DownloadState::Completed);
    assert_eq!(downloader.progress(), 1.0);

    // Completed is terminal until a new target is set.
    assert!(matches!(
        downloader.run(&CancellationToken::new()).await,
        Err(HubError::InvalidState(_))
    ));
    downloader.set_target(&[CUBE_PREFAB]).unwrap();
    assert_eq!(downloader.state(), DownloadState::Idle);
    assert_eq!(downloader.download_size(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_finished_bundles() {
    let bundles = fixture_bundles();
    let dir = tempfile::tempdir().unwrap();
    let (hub, stage) = gated_hub(dir.path(), &bundles);

    let downloader = Arc::new(hub.create_downloader().unwrap());
    downloader.set_target(&[ATTACK_PREFAB]).unwrap();
    let cancel = CancellationToken::new();
    let task = {
        let downloader = Arc::clone(&downloader);
        let cancel = cancel.clone();
        tokio::spawn(async move { downloader.run(&cancel).await })
    };

    // Let exactly one of the three transfers finish, then cancel the rest.
    eventually("transfers parked", || downloader.progress() > 0.4).await;
    stage.gate.add_permits(1);
    eventually("one bundle done", || {
        downloader.downloaded_size() > downloader.download_size() / 2
    })
    .await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Cancelled));
    assert_eq!(downloader.state(), DownloadState::Failed);
    assert_eq!(hub.version_table().read().len(), 1);
    let settled = downloader.downloaded_size();
    assert!(settled > 0 && settled < downloader.download_size());

    stage.gate.add_permits(2);
    downloader.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(downloader.state(), DownloadState::Completed);
    assert_eq!(hub.version_table().read().len(), 3);
    assert!(std::fs::read_dir(hub.layout().staging_dir())
        .map(|entries| entries.count() == 0)
        .unwrap_or(true));
}

#[tokio::test]
async fn test_dropped_run_leaves_downloader_reusable() {
    let bundles = fixture_bundles();
    let dir = tempfile::tempdir().unwrap();
    let (hub, stage) = gated_hub(dir.path(), &bundles);

    let downloader = hub.create_downloader().unwrap();
    downloader.set_target(&[CUBE_PREFAB]).unwrap();

    // The gate stays shut, so the run future is dropped while Running.
    let cancel = CancellationToken::new();
    let elapsed = tokio::time::timeout(Duration::from_millis(100), downloader.run(&cancel)).await;
    assert!(elapsed.is_err());
    assert_eq!(downloader.state(), DownloadState::Failed);

    stage.gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), downloader.run(&cancel))
        .await
        .expect("second run should not report Running")
        .unwrap();
    assert_eq!(downloader.state(), DownloadState::Completed);
    assert_eq!(hub.version_table().read().len(), 1);
}

#[tokio::test]
async fn test_local_error_does_not_abort_sibling_fetches() {
    let bundles = fixture_bundles();
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "mem://cdn/ab");
    write_manifest(&config, &bundles);

    let stage = Arc::new(DiskFaultStage {
        files: bundles
            .iter()
            .map(|b| (b.info.name.clone(), b.bytes.clone()))
            .collect(),
        failing: "Sprites",
    });
    let stages: Vec<Arc<dyn TransportStage>> = vec![stage];
    let hub = Hub::builder(config)
        .pipeline(Pipeline::new(stages))
        .build()
        .unwrap();
    hub.load_manifest().unwrap();

    let downloader = hub.create_downloader().unwrap();
    downloader.set_target(&[ATTACK_PREFAB]).unwrap();
    let err = downloader.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, HubError::Io { .. }));
    assert!(!err.is_transport());
    assert_eq!(downloader.state(), DownloadState::Failed);

    let table = hub.version_table();
    let table = table.read();
    assert_eq!(table.len(), 2);
    assert!(table.get("Prefabs001").is_some());
    assert!(table.get("PrefabsDep").is_some());
    assert!(table.get("Sprites").is_none());
}
