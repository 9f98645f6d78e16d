// Durable local store: paths, version table, integrity hashing and the XOR cipher.

use std::sync::Arc;

use parking_lot::RwLock;

pub mod cipher;
pub mod hasher;
pub mod layout;
pub mod version_table;

pub use cipher::XorCipher;
pub use hasher::{FileHasher, Md5Hasher, Sha256Hasher};
pub use layout::StoreLayout;
pub use version_table::VersionTable;

pub type SharedVersionTable = Arc<RwLock<VersionTable>>;
