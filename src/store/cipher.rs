// Keyed XOR stream transform applied to bundles, the manifest and the version table.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::error::{HubError, Result};

/// Symmetric XOR keystream. The key byte used for a given stream offset is
/// `key[offset % key.len()]`, so any slice can be transformed independently
/// as long as its absolute offset is known.
#[derive(Clone)]
pub struct XorCipher {
    key: Arc<[u8]>,
}

impl XorCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(HubError::InvalidState(
                "xor cipher key must not be empty".to_string(),
            ));
        }
        Ok(Self { key: key.into() })
    }

    /// Transform `buf` in place, treating its first byte as stream offset `offset`.
    pub fn apply(&self, offset: u64, buf: &mut [u8]) {
        let key_len = self.key.len();
        let mut key_index = (offset % key_len as u64) as usize;
        for byte in buf.iter_mut() {
            *byte ^= self.key[key_index];
            key_index += 1;
            if key_index == key_len {
                key_index = 0;
            }
        }
    }

    pub fn reader<R: Read>(&self, inner: R) -> XorReader<R> {
        XorReader {
            inner,
            cipher: self.clone(),
            position: 0,
        }
    }

    pub fn writer<W: Write>(&self, inner: W) -> XorWriter<W> {
        XorWriter {
            inner,
            cipher: self.clone(),
            position: 0,
        }
    }
}

impl fmt::Debug for XorCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XorCipher(key_len={})", self.key.len())
    }
}

/// Decrypting reader. Position starts at zero when wrapped.
pub struct XorReader<R> {
    inner: R,
    cipher: XorCipher,
    position: u64,
}

impl<R: Read> Read for XorReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply(self.position, &mut buf[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

/// Encrypting writer. Only bytes the inner writer accepted advance the keystream.
pub struct XorWriter<W> {
    inner: W,
    cipher: XorCipher,
    position: u64,
}

impl<W: Write> XorWriter<W> {
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for XorWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut encrypted = buf.to_vec();
        self.cipher.apply(self.position, &mut encrypted);
        let n = self.inner.write(&encrypted)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
