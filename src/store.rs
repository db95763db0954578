//! Hash-verified persistence for licenses and device certificates.
//!
//! Records are prost-serialized [`StoredFile`] payloads wrapped in a
//! [`HashedFile`] envelope carrying a SHA-256 digest of the payload. Files
//! live under a security-level-scoped directory; a one-shot migration moves
//! records written by older builds into place before first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use prost::Message;
use sha2::{Digest, Sha256};

use crate::crypto::SecurityLevel;
use crate::error::{Error, Result};
use crate::protocol::{FileKind, HashedFile, StoredCertificate, StoredFile, StoredLicense};

/// Fixed filename of the persisted device certificate record.
const CERTIFICATE_FILE: &str = "device.cert";
/// Extension appended to key-set ids to form license filenames.
const LICENSE_EXT: &str = "lic";
/// Subdirectory holding opaque usage-report records.
const USAGE_DIR: &str = "usage";
/// Record format version written by this build.
const FILE_VERSION: i32 = 1;

/// Raw file access used by the store. Implementations are synchronous and
/// blocking; callers needing bounded latency must wrap calls themselves.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn remove(&self, path: &Path) -> Result<()>;
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Direct filesystem implementation.
#[derive(Debug, Default)]
pub struct DiskFileStore;

impl FileStore for DiskFileStore {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(std::fs::read(path)?)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(std::fs::write(path, data)?)
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn remove(&self, path: &Path) -> Result<()> {
        Ok(std::fs::remove_file(path)?)
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                out.push(entry.path());
            }
        }
        Ok(out)
    }
}

/// In-memory implementation for hosts without durable storage and for tests.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files
            .lock()
            .ok()
            .and_then(|f| f.get(path).cloned())
            .ok_or_else(|| {
                Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    path.display().to_string(),
                ))
            })
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.to_path_buf(), data.to_vec());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files
            .lock()
            .map(|f| f.contains_key(path))
            .unwrap_or(false)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let removed = self
            .files
            .lock()
            .ok()
            .and_then(|mut f| f.remove(path));
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            ))),
        }
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .files
            .lock()
            .map(|f| {
                f.keys()
                    .filter(|p| p.parent() == Some(dir))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Persistent license and certificate store for one security level.
pub struct LicenseStore {
    files: Arc<dyn FileStore>,
    base: PathBuf,
}

impl LicenseStore {
    /// Open the store for a security level, migrating any legacy records
    /// found at the storage root into the level-scoped directory.
    ///
    /// Migration runs exactly once, here; retrieval never re-checks.
    pub fn open(
        files: Arc<dyn FileStore>,
        root: impl Into<PathBuf>,
        level: SecurityLevel,
    ) -> Result<Self> {
        let root = root.into();
        let base = root.join(level.as_str());
        let store = Self { files, base };
        store.migrate_legacy(&root)?;
        Ok(store)
    }

    /// Move records written at the unscoped root by older builds.
    fn migrate_legacy(&self, root: &Path) -> Result<()> {
        for path in self.files.list(root)? {
            let migrate = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => {
                    name == CERTIFICATE_FILE || name.ends_with(&format!(".{}", LICENSE_EXT))
                }
                None => false,
            };
            if !migrate {
                continue;
            }

            let target = match path.file_name() {
                Some(name) => self.base.join(name),
                None => continue,
            };
            if self.files.exists(&target) {
                // scoped record wins; drop the stale legacy copy
                self.files.remove(&path)?;
                continue;
            }

            log::info!("migrating legacy record {} to {}", path.display(), target.display());
            let data = self.files.read(&path)?;
            self.files.write(&target, &data)?;
            self.files.remove(&path)?;
        }
        Ok(())
    }

    fn license_path(&self, key_set_id: &str) -> PathBuf {
        self.base.join(format!("{}.{}", key_set_id, LICENSE_EXT))
    }

    fn certificate_path(&self) -> PathBuf {
        self.base.join(CERTIFICATE_FILE)
    }

    /// Whether a license record exists for the key set id.
    pub fn license_exists(&self, key_set_id: &str) -> bool {
        self.files.exists(&self.license_path(key_set_id))
    }

    /// Persist a license record under the key set id.
    pub fn store_license(&self, key_set_id: &str, record: &StoredLicense) -> Result<()> {
        let file = StoredFile {
            kind: Some(FileKind::License as i32),
            version: Some(FILE_VERSION),
            license: Some(record.clone()),
            certificate: None,
        };
        self.files
            .write(&self.license_path(key_set_id), &wrap(&file))
    }

    /// Load and verify a license record.
    pub fn load_license(&self, key_set_id: &str) -> Result<StoredLicense> {
        let path = self.license_path(key_set_id);
        if !self.files.exists(&path) {
            return Err(Error::InvalidKeySet(key_set_id.to_string()));
        }
        let file = unwrap(&self.files.read(&path)?)?;
        if file.kind != Some(FileKind::License as i32) {
            return Err(Error::StoreIntegrity(format!(
                "Record {} is not a license",
                key_set_id
            )));
        }
        file.license
            .ok_or_else(|| Error::StoreIntegrity(format!("Record {} has no license body", key_set_id)))
    }

    /// Remove a license record.
    pub fn remove_license(&self, key_set_id: &str) -> Result<()> {
        let path = self.license_path(key_set_id);
        if !self.files.exists(&path) {
            return Err(Error::InvalidKeySet(key_set_id.to_string()));
        }
        self.files.remove(&path)
    }

    /// Whether a device certificate record has been provisioned.
    pub fn certificate_exists(&self) -> bool {
        self.files.exists(&self.certificate_path())
    }

    /// Persist the device certificate record. Written once after
    /// provisioning.
    pub fn store_certificate(&self, record: &StoredCertificate) -> Result<()> {
        let file = StoredFile {
            kind: Some(FileKind::DeviceCertificate as i32),
            version: Some(FILE_VERSION),
            license: None,
            certificate: Some(record.clone()),
        };
        self.files.write(&self.certificate_path(), &wrap(&file))
    }

    fn usage_path(&self, name: &str) -> PathBuf {
        self.base.join(USAGE_DIR).join(name)
    }

    /// Persist an opaque usage-report record. The bytes pass through
    /// untouched; the reporting server defines their format.
    pub fn store_usage_record(&self, name: &str, data: &[u8]) -> Result<()> {
        self.files.write(&self.usage_path(name), data)
    }

    /// Load a usage-report record.
    pub fn load_usage_record(&self, name: &str) -> Result<Vec<u8>> {
        self.files.read(&self.usage_path(name))
    }

    /// Remove a usage-report record once the server has receipted it.
    pub fn remove_usage_record(&self, name: &str) -> Result<()> {
        self.files.remove(&self.usage_path(name))
    }

    /// Names of all persisted usage-report records.
    pub fn list_usage_records(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .files
            .list(&self.base.join(USAGE_DIR))?
            .into_iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Load and verify the device certificate record.
    pub fn load_certificate(&self) -> Result<StoredCertificate> {
        let path = self.certificate_path();
        if !self.files.exists(&path) {
            return Err(Error::NeedProvisioning(
                "No device certificate record".to_string(),
            ));
        }
        let file = unwrap(&self.files.read(&path)?)?;
        if file.kind != Some(FileKind::DeviceCertificate as i32) {
            return Err(Error::StoreIntegrity(
                "Record is not a device certificate".to_string(),
            ));
        }
        file.certificate
            .ok_or_else(|| Error::StoreIntegrity("Record has no certificate body".to_string()))
    }
}

fn wrap(file: &StoredFile) -> Vec<u8> {
    let payload = file.encode_to_vec();
    let hash = Sha256::digest(&payload).to_vec();
    HashedFile {
        payload: Some(payload),
        hash: Some(hash),
    }
    .encode_to_vec()
}

fn unwrap(data: &[u8]) -> Result<StoredFile> {
    let envelope = HashedFile::decode(data)
        .map_err(|e| Error::StoreIntegrity(format!("Bad envelope: {}", e)))?;
    let payload = envelope
        .payload
        .ok_or_else(|| Error::StoreIntegrity("Envelope has no payload".to_string()))?;
    let hash = envelope
        .hash
        .ok_or_else(|| Error::StoreIntegrity("Envelope has no hash".to_string()))?;

    if Sha256::digest(&payload).as_slice() != hash.as_slice() {
        return Err(Error::StoreIntegrity("Payload hash mismatch".to_string()));
    }

    StoredFile::decode(payload.as_slice())
        .map_err(|e| Error::StoreIntegrity(format!("Bad payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LicenseState;

    fn record() -> StoredLicense {
        StoredLicense {
            state: Some(LicenseState::Active as i32),
            pssh_data: Some(b"pssh".to_vec()),
            license_request: Some(b"request".to_vec()),
            license: Some(b"response".to_vec()),
            renewal_request: Some(b"renewal-request".to_vec()),
            renewal: Some(b"renewal".to_vec()),
            release_server_url: Some("https://license.example.com/release".to_string()),
        }
    }

    fn open_store(files: Arc<dyn FileStore>) -> LicenseStore {
        LicenseStore::open(files, "/cdm", SecurityLevel::L1).expect("open store")
    }

    #[test]
    fn license_roundtrip_is_byte_identical() {
        let store = open_store(Arc::new(MemoryFileStore::default()));
        store.store_license("ks1", &record()).expect("store");

        let loaded = store.load_license("ks1").expect("load");
        assert_eq!(loaded, record());
    }

    #[test]
    fn corrupting_one_byte_fails_the_hash_check() {
        let files = Arc::new(MemoryFileStore::default());
        let store = open_store(files.clone());
        store.store_license("ks1", &record()).expect("store");

        let path = PathBuf::from("/cdm/L1/ks1.lic");
        let mut data = files.read(&path).expect("raw read");
        // flip one byte inside the serialized payload
        let mid = data.len() / 2;
        data[mid] ^= 0x01;
        files.write(&path, &data).expect("raw write");

        assert!(matches!(
            store.load_license("ks1"),
            Err(Error::StoreIntegrity(_))
        ));
    }

    #[test]
    fn missing_key_set_reports_invalid() {
        let store = open_store(Arc::new(MemoryFileStore::default()));
        assert!(matches!(
            store.load_license("missing"),
            Err(Error::InvalidKeySet(_))
        ));
        assert!(store.remove_license("missing").is_err());
    }

    #[test]
    fn certificate_roundtrip() {
        let store = open_store(Arc::new(MemoryFileStore::default()));
        assert!(!store.certificate_exists());

        let cert = StoredCertificate {
            certificate: Some(b"cert".to_vec()),
            wrapped_private_key: Some(b"wrapped".to_vec()),
        };
        store.store_certificate(&cert).expect("store");
        assert!(store.certificate_exists());
        assert_eq!(store.load_certificate().expect("load"), cert);
    }

    #[test]
    fn legacy_records_migrate_once_on_open() {
        let files = Arc::new(MemoryFileStore::default());

        // write a record at the unscoped root, as an older build would
        {
            let legacy = LicenseStore {
                files: files.clone(),
                base: PathBuf::from("/cdm"),
            };
            legacy.store_license("old", &record()).expect("store");
        }
        assert!(files.exists(&PathBuf::from("/cdm/old.lic")));

        let store = open_store(files.clone());
        assert!(!files.exists(&PathBuf::from("/cdm/old.lic")));
        assert!(files.exists(&PathBuf::from("/cdm/L1/old.lic")));
        assert_eq!(store.load_license("old").expect("load"), record());
    }

    #[test]
    fn migration_prefers_scoped_record() {
        let files = Arc::new(MemoryFileStore::default());

        let mut stale = record();
        stale.license = Some(b"stale".to_vec());
        let legacy = LicenseStore {
            files: files.clone(),
            base: PathBuf::from("/cdm"),
        };
        legacy.store_license("ks", &stale).expect("store legacy");

        let scoped = LicenseStore {
            files: files.clone(),
            base: PathBuf::from("/cdm/L1"),
        };
        scoped.store_license("ks", &record()).expect("store scoped");

        let store = open_store(files.clone());
        assert_eq!(store.load_license("ks").expect("load"), record());
        assert!(!files.exists(&PathBuf::from("/cdm/ks.lic")));
    }

    #[test]
    fn usage_records_pass_through_untouched() {
        let store = open_store(Arc::new(MemoryFileStore::default()));
        assert!(store.list_usage_records().expect("list").is_empty());

        store
            .store_usage_record("stop-1", b"opaque-receipt")
            .expect("store");
        assert_eq!(
            store.load_usage_record("stop-1").expect("load"),
            b"opaque-receipt"
        );
        assert_eq!(
            store.list_usage_records().expect("list"),
            vec!["stop-1".to_string()]
        );

        store.remove_usage_record("stop-1").expect("remove");
        assert!(store.load_usage_record("stop-1").is_err());
    }

    #[test]
    fn disk_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LicenseStore::open(
            Arc::new(DiskFileStore),
            dir.path().to_path_buf(),
            SecurityLevel::L3,
        )
        .expect("open");

        store.store_license("ks1", &record()).expect("store");
        assert!(store.license_exists("ks1"));
        assert_eq!(store.load_license("ks1").expect("load"), record());
        store.remove_license("ks1").expect("remove");
        assert!(!store.license_exists("ks1"));
    }
}
