// Opened bundle handles, the reader seam, and the packed on-disk container.

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, ensure, Context};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{HubError, Result};
use crate::store::XorCipher;

/// A type-erased asset extracted from a bundle. Callers downcast to the type
/// they asked for.
pub type AssetObject = Arc<dyn Any + Send + Sync>;

/// An opened bundle. Dropping the last handle releases its payload.
pub trait Bundle: Send + Sync {
    fn name(&self) -> &str;
    fn asset_names(&self) -> Vec<String>;
    fn contains(&self, asset_name: &str) -> bool;
    fn load_asset(&self, asset_name: &str) -> anyhow::Result<AssetObject>;
}

/// Opens a promoted bundle file.
#[async_trait]
pub trait BundleReader: Send + Sync {
    async fn open(&self, bundle_name: &str, path: &Path) -> anyhow::Result<Arc<dyn Bundle>>;
}

const MAGIC: &[u8; 4] = b"BHB1";

// name_len (2) is read separately; kind (1) + offset (8) + length (8).
const ENTRY_FIXED_BYTES: usize = 17;

/// How an entry's bytes are decoded on extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// Raw bytes, extracted as `bytes::Bytes`.
    Bytes,
    /// UTF-8 text, extracted as `String`.
    Text,
    /// JSON document, extracted as `serde_json::Value`.
    Json,
}

impl AssetKind {
    fn tag(self) -> u8 {
        match self {
            AssetKind::Bytes => 0,
            AssetKind::Text => 1,
            AssetKind::Json => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(AssetKind::Bytes),
            1 => Some(AssetKind::Text),
            2 => Some(AssetKind::Json),
            _ => None,
        }
    }
}

/// Builds packed bundle files.
///
/// Layout: `BHB1`, entry count (u32 LE), then per entry the name length
/// (u16 LE), name, kind tag (u8), offset and length (u64 LE, relative to the
/// data region), followed by the data region.
#[derive(Default)]
pub struct BundleWriter {
    entries: Vec<(String, AssetKind, Vec<u8>)>,
}

impl BundleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push((name.into(), AssetKind::Bytes, data.into()));
        self
    }

    pub fn add_text(&mut self, name: impl Into<String>, text: &str) -> &mut Self {
        self.entries
            .push((name.into(), AssetKind::Text, text.as_bytes().to_vec()));
        self
    }

    pub fn add_json<T: Serialize>(&mut self, name: impl Into<String>, value: &T) -> Result<&mut Self> {
        let data = serde_json::to_vec(value)?;
        self.entries.push((name.into(), AssetKind::Json, data));
        Ok(self)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let table_len: usize = self
            .entries
            .iter()
            .map(|(name, _, _)| 2 + name.len() + ENTRY_FIXED_BYTES)
            .sum();
        let data_len: usize = self.entries.iter().map(|(_, _, data)| data.len()).sum();

        let mut out = BytesMut::with_capacity(8 + table_len + data_len);
        out.put_slice(MAGIC);
        out.put_u32_le(self.entries.len() as u32);
        let mut offset = 0u64;
        for (name, kind, data) in &self.entries {
            out.put_u16_le(name.len() as u16);
            out.put_slice(name.as_bytes());
            out.put_u8(kind.tag());
            out.put_u64_le(offset);
            out.put_u64_le(data.len() as u64);
            offset += data.len() as u64;
        }
        for (_, _, data) in &self.entries {
            out.put_slice(data);
        }
        out.to_vec()
    }

    /// Write the container to `path`, XOR-encrypted when a cipher is given.
    pub fn write_to(&self, path: &Path, cipher: Option<&XorCipher>) -> Result<()> {
        let mut bytes = self.to_bytes();
        if let Some(cipher) = cipher {
            cipher.apply(0, &mut bytes);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| HubError::io(dir, e))?;
        }
        fs::write(path, bytes).map_err(|e| HubError::io(path, e))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: AssetKind,
    offset: usize,
    len: usize,
}

/// A packed bundle held in memory. Extraction slices the payload without
/// copying raw entries.
pub struct PackedBundle {
    name: String,
    entries: HashMap<String, Entry>,
    payload: Bytes,
}

impl PackedBundle {
    pub fn parse(name: &str, data: Bytes) -> anyhow::Result<Self> {
        let mut cursor = data;
        ensure!(
            cursor.remaining() >= 8 && &cursor[..4] == MAGIC,
            "{} is not a packed bundle",
            name
        );
        cursor.advance(4);
        let count = cursor.get_u32_le() as usize;
        // Every entry needs at least its fixed fields plus the name length.
        ensure!(
            count <= cursor.remaining() / (2 + ENTRY_FIXED_BYTES),
            "{}: entry count {} exceeds the file size",
            name,
            count
        );

        let mut entries = HashMap::with_capacity(count);
        for index in 0..count {
            ensure!(cursor.remaining() >= 2, "{}: entry table truncated at {}", name, index);
            let name_len = cursor.get_u16_le() as usize;
            ensure!(
                cursor.remaining() >= name_len + ENTRY_FIXED_BYTES,
                "{}: entry table truncated at {}",
                name,
                index
            );
            let asset = String::from_utf8(cursor.split_to(name_len).to_vec())
                .with_context(|| format!("{}: entry {} has a non-utf8 name", name, index))?;
            let tag = cursor.get_u8();
            let kind = AssetKind::from_tag(tag)
                .ok_or_else(|| anyhow!("{}: unknown asset kind {} for {}", name, tag, asset))?;
            let offset = usize::try_from(cursor.get_u64_le())?;
            let len = usize::try_from(cursor.get_u64_le())?;
            entries.insert(asset, Entry { kind, offset, len });
        }

        let payload = cursor;
        for (asset, entry) in &entries {
            let end = entry
                .offset
                .checked_add(entry.len)
                .ok_or_else(|| anyhow!("{}: entry {} overflows", name, asset))?;
            if end > payload.len() {
                bail!("{}: entry {} runs past the data region", name, asset);
            }
        }

        Ok(Self {
            name: name.to_string(),
            entries,
            payload,
        })
    }
}

impl Bundle for PackedBundle {
    fn name(&self) -> &str {
        &self.name
    }

    fn asset_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    fn contains(&self, asset_name: &str) -> bool {
        self.entries.contains_key(asset_name)
    }

    fn load_asset(&self, asset_name: &str) -> anyhow::Result<AssetObject> {
        let entry = self
            .entries
            .get(asset_name)
            .ok_or_else(|| anyhow!("{} does not contain {}", self.name, asset_name))?;
        let raw = self.payload.slice(entry.offset..entry.offset + entry.len);
        let object: AssetObject = match entry.kind {
            AssetKind::Bytes => Arc::new(raw),
            AssetKind::Text => Arc::new(
                String::from_utf8(raw.to_vec())
                    .with_context(|| format!("{} in {} is not utf8", asset_name, self.name))?,
            ),
            AssetKind::Json => Arc::new(
                serde_json::from_slice::<serde_json::Value>(&raw)
                    .with_context(|| format!("{} in {} is not json", asset_name, self.name))?,
            ),
        };
        Ok(object)
    }
}

/// Default reader: loads the whole file, decrypts it when a cipher is
/// configured, and parses the packed container.
#[derive(Debug, Default, Clone)]
pub struct PackedBundleReader {
    cipher: Option<XorCipher>,
}

impl PackedBundleReader {
    pub fn new(cipher: Option<XorCipher>) -> Self {
        Self { cipher }
    }
}

#[async_trait]
impl BundleReader for PackedBundleReader {
    async fn open(&self, bundle_name: &str, path: &Path) -> anyhow::Result<Arc<dyn Bundle>> {
        let mut data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        if let Some(cipher) = &self.cipher {
            cipher.apply(0, &mut data);
        }
        let bundle = PackedBundle::parse(bundle_name, Bytes::from(data))?;
        Ok(Arc::new(bundle))
    }
}
