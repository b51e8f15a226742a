//! Table manifest: the durable form of the catalog and its policies.
//!
//! ```text
//! | magic "EBMF" | version: u16 LE | body_len: u32 LE | crc32: u32 LE | CBOR body |
//! ```

use crate::catalog::{CatalogRecord, PartitionCatalog};
use crate::compression::CompressionPolicy;
use crate::config::RetentionPolicy;
use crate::error::{LifecycleError, LifecycleResult};
use crate::tier::TierConfig;
use crate::window::PendingDrop;
use ebbtide_storage::TableStructure;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Magic bytes for manifest file.
pub const MANIFEST_MAGIC: [u8; 4] = *b"EBMF";

/// Current manifest version.
pub const MANIFEST_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 4 + 4;

/// Everything a table needs to resume after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Partitions and identity counter.
    pub catalog: CatalogRecord,
    /// Tier layout.
    pub tiers: TierConfig,
    /// Compression rule.
    pub compression: CompressionPolicy,
    /// Retention rule.
    pub retention: RetentionPolicy,
    /// Table layout.
    pub structure: TableStructure,
    /// A drop that switched data out but has not merged yet.
    pub pending_drop: Option<PendingDrop>,
}

impl Manifest {
    /// Builds a manifest for a fresh table.
    #[must_use]
    pub fn new(
        catalog: &PartitionCatalog,
        tiers: TierConfig,
        compression: CompressionPolicy,
        retention: RetentionPolicy,
        structure: TableStructure,
    ) -> Self {
        Self {
            catalog: catalog.to_record(),
            tiers,
            compression,
            retention,
            structure,
            pending_drop: None,
        }
    }

    /// Encodes the manifest to bytes.
    pub fn encode(&self) -> LifecycleResult<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::into_writer(self, &mut body)?;
        let body_len = u32::try_from(body.len())
            .map_err(|_| LifecycleError::invalid_format("manifest body exceeds 4 GiB"))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
        buf.extend_from_slice(&MANIFEST_MAGIC);
        buf.extend_from_slice(&MANIFEST_VERSION.to_le_bytes());
        buf.extend_from_slice(&body_len.to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decodes a manifest from bytes.
    pub fn decode(data: &[u8]) -> LifecycleResult<Self> {
        if data.len() < 4 || data[0..4] != MANIFEST_MAGIC {
            return Err(LifecycleError::invalid_format("invalid manifest magic"));
        }
        if data.len() < HEADER_SIZE {
            return Err(LifecycleError::invalid_format("manifest too short"));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version > MANIFEST_VERSION {
            return Err(LifecycleError::invalid_format(format!(
                "unsupported manifest version: {version}"
            )));
        }

        let body_len = u32::from_le_bytes([data[6], data[7], data[8], data[9]]) as usize;
        let expected = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);
        let Some(body) = data.get(HEADER_SIZE..HEADER_SIZE + body_len) else {
            return Err(LifecycleError::invalid_format(format!(
                "manifest body truncated: expected {body_len} bytes, found {}",
                data.len() - HEADER_SIZE
            )));
        };

        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(LifecycleError::ChecksumMismatch { expected, actual });
        }

        let manifest: Self = ciborium::from_reader(body)?;
        Ok(manifest)
    }

    /// Rebuilds and validates the catalog.
    pub fn catalog(&self) -> LifecycleResult<PartitionCatalog> {
        PartitionCatalog::from_record(self.catalog.clone())
    }
}

/// Durable home of a table's manifest.
///
/// # Implementors
///
/// - [`crate::TableDir`] - atomic file replacement inside the table directory
/// - [`InMemoryManifestStore`] - keeps the last encoded manifest in memory
pub trait ManifestStore: Send + Sync {
    /// Loads the manifest, or `None` for a table that was never saved.
    fn load(&self) -> LifecycleResult<Option<Manifest>>;

    /// Replaces the stored manifest.
    fn save(&self, manifest: &Manifest) -> LifecycleResult<()>;
}

/// Manifest store holding the encoded bytes in memory.
///
/// Saving encodes and loading decodes, so the full format is exercised.
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    bytes: RwLock<Option<Vec<u8>>>,
    saves: RwLock<u64>,
}

impl InMemoryManifestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many times the manifest was saved.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        *self.saves.read()
    }
}

impl ManifestStore for InMemoryManifestStore {
    fn load(&self) -> LifecycleResult<Option<Manifest>> {
        self.bytes
            .read()
            .as_deref()
            .map(Manifest::decode)
            .transpose()
    }

    fn save(&self, manifest: &Manifest) -> LifecycleResult<()> {
        let encoded = manifest.encode()?;
        *self.bytes.write() = Some(encoded);
        *self.saves.write() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ebbtide_storage::{CompressionMode, PartitionKey, TierId};

    fn sample() -> Manifest {
        let mut catalog = PartitionCatalog::new(TierId(1));
        let jan = PartitionKey::from_ymd(2022, 1, 1).unwrap();
        let feb = PartitionKey::from_ymd(2022, 2, 1).unwrap();
        let id = catalog.split(jan).unwrap();
        catalog.split(feb).unwrap();
        catalog.set_row_count(id, 1234).unwrap();
        catalog.set_compression(id, CompressionMode::Row).unwrap();
        catalog.set_tier(id, TierId(2)).unwrap();
        Manifest::new(
            &catalog,
            TierConfig::default(),
            CompressionPolicy::default(),
            RetentionPolicy::default(),
            TableStructure::with_columns(["ts:timestamp"]),
        )
    }

    #[test]
    fn round_trip_preserves_catalog_exactly() {
        let manifest = sample();
        let decoded = Manifest::decode(&manifest.encode().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
        assert_eq!(
            decoded.catalog().unwrap().partitions().as_slice(),
            manifest.catalog().unwrap().partitions().as_slice()
        );
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data = sample().encode().unwrap();
        data[0] = b'X';
        assert!(matches!(Manifest::decode(&data), Err(LifecycleError::InvalidFormat { .. })));
    }

    #[test]
    fn future_version_rejected() {
        let mut data = sample().encode().unwrap();
        data[4..6].copy_from_slice(&(MANIFEST_VERSION + 1).to_le_bytes());
        let err = Manifest::decode(&data).unwrap_err();
        assert!(err.to_string().contains("unsupported manifest version"));
    }

    #[test]
    fn truncated_body_rejected() {
        let data = sample().encode().unwrap();
        assert!(Manifest::decode(&data[..data.len() - 1]).is_err());
        assert!(Manifest::decode(&data[..8]).is_err());
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let mut data = sample().encode().unwrap();
        let last = data.len() - 1;
        data[last] ^= 0x55;
        assert!(matches!(Manifest::decode(&data), Err(LifecycleError::ChecksumMismatch { .. })));
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store = InMemoryManifestStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
        assert_eq!(store.save_count(), 1);
    }
}
