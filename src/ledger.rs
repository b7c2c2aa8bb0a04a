use crate::{
    digest::{ContentDigest, DigestAlgorithm},
    manifest::InstallTarget,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

pub const LEDGER_FILE: &str = "install.json";
pub const LOCK_FILE: &str = "install.lock";

const LOCK_RETRIES: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("install ledger {path:?} is corrupt ({reason}); fix or remove it by hand")]
    Corrupt { path: PathBuf, reason: String },
    #[error("another install is already running in {0:?}")]
    Locked(PathBuf),
    #[error("ledger io at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LedgerError {
    fn io(path: &Path, source: io::Error) -> Self {
        LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable record of what the previous install wrote into a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallLedger {
    pub identity: String,
    pub pack_id: String,
    pub version_id: String,
    #[serde(default)]
    pub target: InstallTarget,
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, ContentDigest>,
}

impl InstallLedger {
    pub fn new(
        pack_id: &str,
        version_id: &str,
        target: InstallTarget,
        algorithm: DigestAlgorithm,
    ) -> Self {
        Self {
            identity: Uuid::new_v4().to_string(),
            pack_id: pack_id.to_string(),
            version_id: version_id.to_string(),
            target,
            algorithm,
            updated_at: None,
            entries: BTreeMap::new(),
        }
    }

    pub fn digest_for(&self, path: &str) -> Option<&ContentDigest> {
        self.entries.get(path)
    }

    /// Same identity, fresh entries: the starting point for the next run.
    pub fn successor(&self, version_id: &str, target: InstallTarget) -> Self {
        Self {
            identity: self.identity.clone(),
            pack_id: self.pack_id.clone(),
            version_id: version_id.to_string(),
            target,
            algorithm: self.algorithm,
            updated_at: None,
            entries: BTreeMap::new(),
        }
    }
}

pub fn ledger_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LEDGER_FILE)
}

/// Missing ledger is `Ok(None)`; anything unreadable is `Corrupt`.
pub fn load_ledger(data_dir: &Path) -> Result<Option<InstallLedger>, LedgerError> {
    let path = ledger_path(data_dir);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return Err(LedgerError::Corrupt {
                path,
                reason: err.to_string(),
            })
        }
        Err(err) => return Err(LedgerError::io(&path, err)),
    };
    let ledger: InstallLedger =
        serde_json::from_str(&raw).map_err(|err| LedgerError::Corrupt {
            path: path.clone(),
            reason: err.to_string(),
        })?;
    if ledger.identity.trim().is_empty() || ledger.pack_id.trim().is_empty() {
        return Err(LedgerError::Corrupt {
            path,
            reason: "missing identity".to_string(),
        });
    }
    Ok(Some(ledger))
}

pub fn save_ledger(data_dir: &Path, ledger: &InstallLedger) -> Result<(), LedgerError> {
    fs::create_dir_all(data_dir).map_err(|err| LedgerError::io(data_dir, err))?;
    let path = ledger_path(data_dir);
    let mut ledger = ledger.clone();
    ledger.updated_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
    let raw = serde_json::to_string_pretty(&ledger).map_err(|err| {
        LedgerError::io(&path, io::Error::new(io::ErrorKind::InvalidData, err))
    })?;
    let temp = path.with_extension("json.tmp");
    // Synced before the rename.
    let mut file = File::create(&temp).map_err(|err| LedgerError::io(&temp, err))?;
    file.write_all(raw.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|err| LedgerError::io(&temp, err))?;
    drop(file);
    fs::rename(&temp, &path).map_err(|err| LedgerError::io(&path, err))?;
    debug!(path = %path.display(), entries = ledger.entries.len(), "ledger committed");
    Ok(())
}

/// Exclusive advisory lock on a destination, held for a whole run.
#[derive(Debug)]
pub struct LedgerLock {
    file: File,
}

impl LedgerLock {
    pub fn acquire(data_dir: &Path) -> Result<Self, LedgerError> {
        fs::create_dir_all(data_dir).map_err(|err| LedgerError::io(data_dir, err))?;
        let path = data_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| LedgerError::io(&path, err))?;

        for attempt in 0..LOCK_RETRIES {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Self { file }),
                Err(_) if attempt + 1 < LOCK_RETRIES => {
                    thread::sleep(Duration::from_millis(50 * (1 << attempt)));
                }
                Err(_) => break,
            }
        }
        Err(LedgerError::Locked(
            data_dir.parent().unwrap_or(data_dir).to_path_buf(),
        ))
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
