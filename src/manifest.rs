// Immutable description of every known bundle, its hashes, size and dependency edges.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HubError, Result};
use crate::store::cipher::XorCipher;

/// One bundle entry of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub name: String,
    /// Remote content revision; a change triggers a re-download.
    #[serde(rename = "hash")]
    pub version_hash: String,
    /// Checksum of the bundle file bytes; a mismatch marks a download broken.
    #[serde(rename = "fileHash")]
    pub integrity_hash: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "directDependencies", default)]
    pub direct_dependencies: Vec<String>,
    #[serde(rename = "assetNames", default)]
    pub asset_names: Vec<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestFile {
    #[serde(default = "default_format_version")]
    version: u32,
    asset_bundle_info_list: Vec<BundleInfo>,
}

fn default_format_version() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct Manifest {
    version: u32,
    order: Vec<String>,
    infos: HashMap<String, BundleInfo>,
    // asset name -> owning bundle name
    asset_index: HashMap<String, String>,
}

impl Manifest {
    /// Build a manifest. Names must be unique and non-empty, and the
    /// dependency edges between present entries must not form a cycle.
    /// Edges to absent entries are accepted here and reported on lookup.
    pub fn new(version: u32, bundles: Vec<BundleInfo>) -> Result<Self> {
        let mut order = Vec::with_capacity(bundles.len());
        let mut infos = HashMap::with_capacity(bundles.len());
        for info in bundles {
            if info.name.is_empty() {
                return Err(HubError::InvalidState(
                    "manifest contains a bundle with an empty name".to_string(),
                ));
            }
            if infos.contains_key(&info.name) {
                return Err(HubError::InvalidState(format!(
                    "manifest lists bundle {} twice",
                    info.name
                )));
            }
            order.push(info.name.clone());
            infos.insert(info.name.clone(), info);
        }

        let mut asset_index: HashMap<String, String> = HashMap::new();
        for name in &order {
            for asset in &infos[name].asset_names {
                if let Some(existing) = asset_index.get(asset) {
                    warn!(
                        "asset {} is listed in both {} and {}, keeping {}",
                        asset, existing, name, existing
                    );
                    continue;
                }
                asset_index.insert(asset.clone(), name.clone());
            }
        }

        let manifest = Self {
            version,
            order,
            infos,
            asset_index,
        };
        manifest.check_acyclic()?;
        Ok(manifest)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let file: ManifestFile = serde_json::from_slice(bytes)?;
        Self::new(file.version, file.asset_bundle_info_list)
    }

    /// Read a manifest file, decrypting it when a cipher is configured.
    pub fn load(path: &Path, cipher: Option<&XorCipher>) -> Result<Self> {
        let file = File::open(path).map_err(|e| HubError::io(path, e))?;
        let reader = BufReader::new(file);
        let file: ManifestFile = match cipher {
            Some(cipher) => serde_json::from_reader(cipher.reader(reader))?,
            None => serde_json::from_reader(reader)?,
        };
        Self::new(file.version, file.asset_bundle_info_list)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let file = ManifestFile {
            version: self.version,
            asset_bundle_info_list: self.bundles().cloned().collect(),
        };
        Ok(serde_json::to_vec(&file)?)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Bundles in manifest order.
    pub fn bundles(&self) -> impl Iterator<Item = &BundleInfo> {
        self.order.iter().map(move |name| &self.infos[name])
    }

    pub fn contains(&self, bundle_name: &str) -> bool {
        self.infos.contains_key(bundle_name)
    }

    pub fn bundle_info(&self, bundle_name: &str) -> Result<&BundleInfo> {
        self.infos
            .get(bundle_name)
            .ok_or_else(|| HubError::NotFound(format!("bundle {}", bundle_name)))
    }

    pub fn bundle_for_asset(&self, asset_name: &str) -> Option<&str> {
        self.asset_index.get(asset_name).map(String::as_str)
    }

    /// Every bundle reachable through `direct_dependencies`, excluding
    /// `bundle_name` itself. Fails if any bundle on the walk is missing.
    pub fn transitive_dependencies(&self, bundle_name: &str) -> Result<BTreeSet<String>> {
        let mut deps = BTreeSet::new();
        let mut stack = vec![bundle_name.to_string()];
        self.collect_dependencies(bundle_name, bundle_name, &mut stack, &mut deps)?;
        Ok(deps)
    }

    fn collect_dependencies(
        &self,
        source: &str,
        target: &str,
        stack: &mut Vec<String>,
        deps: &mut BTreeSet<String>,
    ) -> Result<()> {
        let info = self.infos.get(target).ok_or_else(|| {
            HubError::NotFound(format!("bundle {} (required by {})", target, source))
        })?;

        for dep in &info.direct_dependencies {
            if stack.iter().any(|s| s == dep) {
                let mut path = stack.clone();
                path.push(dep.clone());
                return Err(HubError::DependencyCycle { path });
            }
            if deps.insert(dep.clone()) {
                stack.push(dep.clone());
                self.collect_dependencies(source, dep, stack, deps)?;
                stack.pop();
            }
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.order.len());
        for root in &self.order {
            if marks.contains_key(root.as_str()) {
                continue;
            }
            // (node, index of the next dependency to visit)
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            marks.insert(root.as_str(), Mark::Visiting);

            while let Some((node, next)) = stack.last().copied() {
                let deps = &self.infos[node].direct_dependencies;
                if next == deps.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                let dep = deps[next].as_str();
                if !self.infos.contains_key(dep) {
                    continue;
                }
                match marks.get(dep) {
                    Some(Mark::Done) => {}
                    Some(Mark::Visiting) => {
                        let start = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                        path.push(dep.to_string());
                        return Err(HubError::DependencyCycle { path });
                    }
                    None => {
                        marks.insert(dep, Mark::Visiting);
                        stack.push((dep, 0));
                    }
                }
            }
        }
        Ok(())
    }
}
