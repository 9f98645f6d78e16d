// Shared fixtures: a small bundle set, a fake upstream and store helpers.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use bundlehub::cache::BundleWriter;
use bundlehub::store::{FileHasher, Md5Hasher, VersionTable};
use bundlehub::{BundleInfo, HubConfig, Manifest};

pub const ATTACK_PREFAB: &str = "Prefabs/001/BaseAttackPrefab";
pub const HP_PREFAB: &str = "Prefabs/002/BaseHPPrefab";
pub const CUBE_PREFAB: &str = "Prefabs/003/Cube";
pub const SCENE: &str = "Scenes/Scene01";
pub const SPRITE_ATTACK: &str = "Sprites/base_attack";
pub const SPRITE_HP: &str = "Sprites/base_hp";
pub const CIRCLE: &str = "Prefabs/Dep/Circle";

pub struct FixtureBundle {
    pub info: BundleInfo,
    pub bytes: Vec<u8>,
}

fn bundle(name: &str, deps: &[&str], writer: &BundleWriter) -> FixtureBundle {
    let bytes = writer.to_bytes();
    let hash = Md5Hasher.hash_bytes(&bytes);
    FixtureBundle {
        info: BundleInfo {
            name: name.to_string(),
            version_hash: format!("v1-{}", &hash[..8]),
            integrity_hash: hash,
            size_bytes: bytes.len() as u64,
            direct_dependencies: deps.iter().map(|d| d.to_string()).collect(),
            asset_names: Vec::new(),
        },
        bytes,
    }
}

/// Prefabs001/Prefabs002/Scenes depend on PrefabsDep and Sprites.
/// Prefabs003 stands alone.
pub fn fixture_bundles() -> Vec<FixtureBundle> {
    let mut out = Vec::new();

    let mut w = BundleWriter::new();
    w.add_json(ATTACK_PREFAB, &serde_json::json!({"kind": "attack", "power": 12}))
        .unwrap();
    out.push(bundle("Prefabs001", &["PrefabsDep", "Sprites"], &w));

    let mut w = BundleWriter::new();
    w.add_json(HP_PREFAB, &serde_json::json!({"kind": "hp", "max": 100}))
        .unwrap();
    out.push(bundle("Prefabs002", &["PrefabsDep", "Sprites"], &w));

    let mut w = BundleWriter::new();
    w.add_bytes(CUBE_PREFAB, vec![7u8; 2048]);
    out.push(bundle("Prefabs003", &[], &w));

    let mut w = BundleWriter::new();
    w.add_text(SCENE, "scene: sample");
    out.push(bundle("Scenes", &["PrefabsDep", "Sprites"], &w));

    let mut w = BundleWriter::new();
    w.add_bytes(SPRITE_ATTACK, vec![1u8; 512])
        .add_bytes(SPRITE_HP, vec![2u8; 256]);
    out.push(bundle("Sprites", &[], &w));

    let mut w = BundleWriter::new();
    w.add_bytes(CIRCLE, vec![3u8; 128]);
    out.push(bundle("PrefabsDep", &[], &w));

    let assets: HashMap<&str, Vec<&str>> = HashMap::from([
        ("Prefabs001", vec![ATTACK_PREFAB]),
        ("Prefabs002", vec![HP_PREFAB]),
        ("Prefabs003", vec![CUBE_PREFAB]),
        ("Scenes", vec![SCENE]),
        ("Sprites", vec![SPRITE_ATTACK, SPRITE_HP]),
        ("PrefabsDep", vec![CIRCLE]),
    ]);
    for b in &mut out {
        b.info.asset_names = assets[b.info.name.as_str()]
            .iter()
            .map(|a| a.to_string())
            .collect();
    }
    out
}

pub fn fixture_manifest(bundles: &[FixtureBundle]) -> Manifest {
    Manifest::new(1, bundles.iter().map(|b| b.info.clone()).collect()).unwrap()
}

pub fn size_of(bundles: &[FixtureBundle], names: &[&str]) -> u64 {
    bundles
        .iter()
        .filter(|b| names.contains(&b.info.name.as_str()))
        .map(|b| b.info.size_bytes)
        .sum()
}

/// Config rooted in `dir`, deterministic request order, short timeout.
pub fn test_config(dir: &Path, base_url: &str) -> HubConfig {
    HubConfig {
        base_url: base_url.to_string(),
        manifest_url: format!("{}/AssetBundleList.json", base_url.trim_end_matches("/ab")),
        store_dir: dir.join("store"),
        staging_dir: dir.join("staging"),
        timeout_secs: 5,
        shuffle: false,
        ..HubConfig::default()
    }
}

/// Lay the fixture out as if it had already been synced: bundle files,
/// manifest and version table in the store directory.
pub fn install_local(config: &HubConfig, bundles: &[FixtureBundle]) {
    std::fs::create_dir_all(&config.store_dir).unwrap();
    for b in bundles {
        std::fs::write(config.store_dir.join(&b.info.name), &b.bytes).unwrap();
    }
    let manifest = fixture_manifest(bundles);
    std::fs::write(
        config.store_dir.join(&config.manifest_name),
        manifest.to_json().unwrap(),
    )
    .unwrap();
    let mut table = VersionTable::new(config.store_dir.join(&config.version_table_name), None);
    table
        .bulk_set(
            bundles
                .iter()
                .map(|b| (b.info.name.clone(), b.info.version_hash.clone())),
        )
        .unwrap();
}

/// Fake CDN serving `/ab/{name}` and `/AssetBundleList.json`.
#[derive(Default)]
pub struct Upstream {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub hits: Mutex<HashMap<String, usize>>,
    pub fail_once: Mutex<HashSet<String>>,
    pub manifest: Mutex<Vec<u8>>,
}

impl Upstream {
    pub fn hits(&self, name: &str) -> usize {
        self.hits.lock().get(name).copied().unwrap_or(0)
    }
}

async fn serve_bundle(
    State(upstream): State<Arc<Upstream>>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    *upstream.hits.lock().entry(name.clone()).or_default() += 1;
    if upstream.fail_once.lock().remove(&name) {
        return (StatusCode::SERVICE_UNAVAILABLE, "try again").into_response();
    }
    let body = upstream.files.lock().get(&name).cloned();
    match body {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn serve_manifest(State(upstream): State<Arc<Upstream>>) -> Response {
    let body = upstream.manifest.lock().clone();
    (StatusCode::OK, body).into_response()
}

/// Returns the bundle base URL (`http://addr/ab`).
pub async fn start_upstream(bundles: &[FixtureBundle]) -> (String, Arc<Upstream>) {
    let upstream = Arc::new(Upstream::default());
    {
        let mut files = upstream.files.lock();
        for b in bundles {
            files.insert(b.info.name.clone(), b.bytes.clone());
        }
    }
    *upstream.manifest.lock() = fixture_manifest(bundles).to_json().unwrap();

    let app = Router::new()
        .route("/ab/{name}", get(serve_bundle))
        .route("/AssetBundleList.json", get(serve_manifest))
        .with_state(Arc::clone(&upstream));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/ab", addr), upstream)
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
