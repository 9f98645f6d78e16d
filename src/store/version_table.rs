// Durable record of bundles known good on this device: name -> version hash.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use super::cipher::XorCipher;
use crate::error::{HubError, Result};

/// Only updated after a bundle has been verified and promoted, so an entry
/// here means the bytes at the bundle's durable path are current.
#[derive(Debug)]
pub struct VersionTable {
    path: PathBuf,
    cipher: Option<XorCipher>,
    entries: BTreeMap<String, String>,
}

impl VersionTable {
    pub fn new(path: impl Into<PathBuf>, cipher: Option<XorCipher>) -> Self {
        Self {
            path: path.into(),
            cipher,
            entries: BTreeMap::new(),
        }
    }

    /// Load the table from disk. A missing file yields an empty table; an
    /// unreadable one is logged and also treated as empty, which only causes
    /// bundles to be downloaded again.
    pub fn load_or_default(path: impl Into<PathBuf>, cipher: Option<XorCipher>) -> Self {
        let path = path.into();
        let mut table = Self::new(path.clone(), cipher);
        match table.read() {
            Ok(Some(entries)) => {
                debug!("version table loaded path={} entries={}", path.display(), entries.len());
                table.entries = entries;
            }
            Ok(None) => {}
            Err(e) => error!("version table unreadable, starting empty: {}", e),
        }
        table
    }

    fn read(&self) -> Result<Option<BTreeMap<String, String>>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HubError::io(&self.path, e)),
        };
        let reader = BufReader::new(file);
        let entries = match &self.cipher {
            Some(cipher) => serde_json::from_reader(cipher.reader(reader))?,
            None => serde_json::from_reader(reader)?,
        };
        Ok(Some(entries))
    }

    pub fn get(&self, bundle_name: &str) -> Option<&str> {
        self.entries.get(bundle_name).map(String::as_str)
    }

    pub fn contains(&self, bundle_name: &str) -> bool {
        self.entries.contains_key(bundle_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge `values` and rewrite the file wholesale.
    pub fn bulk_set<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, hash) in values {
            self.entries.insert(name, hash);
        }
        self.persist()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| HubError::io(dir, e))?;
        }

        let contents = serde_json::to_vec_pretty(&self.entries)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path).map_err(|e| HubError::io(&tmp_path, e))?;
            let file = match &self.cipher {
                Some(cipher) => {
                    let mut writer = cipher.writer(file);
                    writer
                        .write_all(&contents)
                        .map_err(|e| HubError::io(&tmp_path, e))?;
                    writer.into_inner()
                }
                None => {
                    let mut file = file;
                    file.write_all(&contents)
                        .map_err(|e| HubError::io(&tmp_path, e))?;
                    file
                }
            };
            file.sync_all().map_err(|e| HubError::io(&tmp_path, e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| HubError::io(&self.path, e))?;
        debug!("version table saved path={} entries={}", self.path.display(), self.entries.len());
        Ok(())
    }
}
