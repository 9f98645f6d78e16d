use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::config::{IntegrityAlgorithm, HASH_BUFFER_BYTES};
use crate::error::{HubError, Result};

/// Content checksum of a staged bundle file, compared against `fileHash`.
#[async_trait]
pub trait FileHasher: Send + Sync {
    fn algorithm(&self) -> &'static str;
    fn hash_bytes(&self, data: &[u8]) -> String;
    async fn hash_file(&self, path: &Path) -> Result<String>;
}

pub struct Md5Hasher;

pub struct Sha256Hasher;

#[async_trait]
impl FileHasher for Md5Hasher {
    fn algorithm(&self) -> &'static str {
        "md5"
    }

    fn hash_bytes(&self, data: &[u8]) -> String {
        to_hex(&Md5::digest(data))
    }

    async fn hash_file(&self, path: &Path) -> Result<String> {
        digest_file::<Md5>(path).await
    }
}

#[async_trait]
impl FileHasher for Sha256Hasher {
    fn algorithm(&self) -> &'static str {
        "sha256"
    }

    fn hash_bytes(&self, data: &[u8]) -> String {
        to_hex(&Sha256::digest(data))
    }

    async fn hash_file(&self, path: &Path) -> Result<String> {
        digest_file::<Sha256>(path).await
    }
}

pub fn hasher_for(algorithm: IntegrityAlgorithm) -> Arc<dyn FileHasher> {
    match algorithm {
        IntegrityAlgorithm::Md5 => Arc::new(Md5Hasher),
        IntegrityAlgorithm::Sha256 => Arc::new(Sha256Hasher),
    }
}

/// Hex digests from different producers may differ in case.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

async fn digest_file<D: Digest + Send>(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| HubError::io(path, e))?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buf).await.map_err(|e| HubError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
