use crate::{
    cancel::CancelToken,
    catalog::ClientArchives,
    digest::{self, ContentDigest, DigestAlgorithm, FileProbe},
    fetch::{self, FetchError, FileFetcher},
    ledger::{self, InstallLedger, LedgerError, LedgerLock},
    loader::{LoaderError, LoaderInstaller, LoaderOutcome, LoaderSettings},
    manifest::{
        is_single_component, join_slash_path, normalize_relative_path, relative_slash_path,
        InstallTarget, ManifestEntry, PackManifest,
    },
    native::NativeInstaller,
};
use rayon::prelude::*;
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Install-wide settings, fixed for the lifetime of a [`Reconciler`].
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub max_workers: usize,
    /// Top-level directories the deletion walk never enters.
    pub excluded_dirs: Vec<String>,
    pub data_dir_name: String,
    pub loader: LoaderSettings,
}

impl InstallerConfig {
    fn is_excluded(&self, top_level: &str) -> bool {
        top_level == self.data_dir_name || self.excluded_dirs.iter().any(|dir| dir == top_level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Install,
    SkipUnchanged,
    /// The user changed a tracked file; stage the new version beside it.
    PreserveDiverged,
    Delete,
    /// Dropped from the pack but changed by the user; leave it.
    Retain,
}

/// Per-entry decision from the three digests that matter: what is on disk,
/// what the pack wants, and what the last install wrote.
pub fn decide(
    disk: Option<&ContentDigest>,
    wanted: &ContentDigest,
    recorded: Option<&ContentDigest>,
) -> Decision {
    match (disk, recorded) {
        (None, _) => Decision::Install,
        (Some(disk), _) if disk == wanted => Decision::SkipUnchanged,
        (Some(_), None) => Decision::Install,
        (Some(disk), Some(recorded)) if disk == recorded => Decision::Install,
        (Some(_), Some(_)) => Decision::PreserveDiverged,
    }
}

/// Decision for a ledgered file the new version no longer ships.
pub fn decide_dropped(disk: &ContentDigest, recorded: &ContentDigest) -> Decision {
    if disk == recorded {
        Decision::Delete
    } else {
        Decision::Retain
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("{path}: {source}")]
    Fetch {
        path: String,
        #[source]
        source: FetchError,
    },
    #[error("{path}: digest mismatch, expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: ContentDigest,
        actual: ContentDigest,
    },
    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0:?} is not a safe relative path")]
    UnsafePath(String),
    #[error("{path}: published digest is not a {algorithm} digest")]
    MalformedDigest {
        path: String,
        algorithm: DigestAlgorithm,
    },
}

impl FileError {
    fn from_fetch(path: &str, err: FetchError) -> Self {
        match err {
            FetchError::DigestMismatch { expected, actual } => FileError::DigestMismatch {
                path: path.to_string(),
                expected,
                actual,
            },
            FetchError::Io(source) => FileError::Io {
                path: path.to_string(),
                source,
            },
            source => FileError::Fetch {
                path: path.to_string(),
                source,
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("{destination:?} already holds pack {installed}; refusing to install pack {requested} over it")]
    PackMismatch {
        destination: PathBuf,
        installed: String,
        requested: String,
    },
    #[error("version id {0:?} cannot name a staging directory")]
    UnsafeVersionId(String),
    #[error("ledger digests use {ledger} but the pack publishes {manifest}")]
    AlgorithmMismatch {
        ledger: DigestAlgorithm,
        manifest: DigestAlgorithm,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("cannot prepare {path:?}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("fetch pool: {0}")]
    WorkerPool(String),
    #[error("install cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct LoaderReport {
    pub component: String,
    pub result: Result<LoaderOutcome, LoaderError>,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub skipped: Vec<String>,
    pub preserved_conflicts: Vec<String>,
    pub deleted: Vec<String>,
    pub retained: Vec<String>,
    pub errors: Vec<FileError>,
    pub loaders: Vec<LoaderReport>,
}

impl InstallReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.loaders.iter().all(|loader| loader.result.is_ok())
    }
}

struct FetchJob<'a> {
    path: String,
    entry: &'a ManifestEntry,
    dest: PathBuf,
    staged: bool,
}

pub struct Reconciler {
    config: InstallerConfig,
    fetcher: Arc<dyn FileFetcher>,
    runner: Arc<dyn NativeInstaller>,
    client_archives: Arc<dyn ClientArchives>,
    cancel: CancelToken,
}

impl Reconciler {
    pub fn new(
        config: InstallerConfig,
        fetcher: Arc<dyn FileFetcher>,
        runner: Arc<dyn NativeInstaller>,
        client_archives: Arc<dyn ClientArchives>,
    ) -> Self {
        Self {
            config,
            fetcher,
            runner,
            client_archives,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn data_dir(&self, destination: &Path) -> PathBuf {
        destination.join(&self.config.data_dir_name)
    }

    /// Converges `destination` onto the applicable files of `manifest`, then
    /// installs its loader components. The ledger is only committed when the
    /// file pass ran to completion.
    pub fn install_pack_version(
        &self,
        target: InstallTarget,
        destination: &Path,
        manifest: &PackManifest,
    ) -> Result<InstallReport, InstallError> {
        info!("installing {} ({target})", manifest.display_name());
        // Staged conflicts land in <data dir>/<version id>.
        if !is_single_component(&manifest.version_id) {
            return Err(InstallError::UnsafeVersionId(manifest.version_id.clone()));
        }
        fs::create_dir_all(destination).map_err(|source| InstallError::Destination {
            path: destination.to_path_buf(),
            source,
        })?;
        let data_dir = self.data_dir(destination);
        let _lock = LedgerLock::acquire(&data_dir)?;

        let prior = ledger::load_ledger(&data_dir)?;
        if let Some(prior) = &prior {
            info!(
                "existing installation of {} v{} detected",
                prior.pack_id, prior.version_id
            );
            if prior.pack_id != manifest.pack_id {
                return Err(InstallError::PackMismatch {
                    destination: destination.to_path_buf(),
                    installed: prior.pack_id.clone(),
                    requested: manifest.pack_id.clone(),
                });
            }
            if prior.algorithm != manifest.algorithm {
                return Err(InstallError::AlgorithmMismatch {
                    ledger: prior.algorithm,
                    manifest: manifest.algorithm,
                });
            }
        }
        let mut next = match &prior {
            Some(prior) => prior.successor(&manifest.version_id, target),
            None => InstallLedger::new(
                &manifest.pack_id,
                &manifest.version_id,
                target,
                manifest.algorithm,
            ),
        };
        let recorded = |path: &str| prior.as_ref().and_then(|ledger| ledger.digest_for(path));

        let mut report = InstallReport::default();
        let mut wanted = HashSet::new();
        let mut jobs = Vec::new();
        let staging = data_dir.join(&manifest.version_id);

        for entry in manifest.applicable(target) {
            if self.cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let Some(path) = normalize_relative_path(&entry.path) else {
                report.errors.push(FileError::UnsafePath(entry.path.clone()));
                continue;
            };
            if !wanted.insert(path.clone()) {
                warn!("{path} is listed more than once; keeping the first entry");
                continue;
            }
            if entry.digest.as_bytes().len() != manifest.algorithm.output_len() {
                if let Some(previous) = recorded(&path) {
                    next.entries.insert(path.clone(), previous.clone());
                }
                report.errors.push(FileError::MalformedDigest {
                    path,
                    algorithm: manifest.algorithm,
                });
                continue;
            }
            let dest = join_slash_path(destination, &path);
            let disk = match digest::probe(&dest, manifest.algorithm, &self.cancel) {
                FileProbe::Present(digest) => Some(digest),
                FileProbe::Absent => None,
                FileProbe::Error(_) if self.cancel.is_cancelled() => {
                    return Err(InstallError::Cancelled)
                }
                FileProbe::Error(source) => {
                    if let Some(previous) = recorded(&path) {
                        next.entries.insert(path.clone(), previous.clone());
                    }
                    report.errors.push(FileError::Io { path, source });
                    continue;
                }
            };

            let decision = decide(disk.as_ref(), &entry.digest, recorded(&path));
            debug!(path = %path, ?decision, "planned");
            match decision {
                Decision::SkipUnchanged => {
                    next.entries.insert(path.clone(), entry.digest.clone());
                    report.skipped.push(path);
                }
                Decision::Install => jobs.push(FetchJob {
                    path,
                    entry,
                    dest,
                    staged: false,
                }),
                Decision::PreserveDiverged => {
                    if let Some(previous) = recorded(&path) {
                        next.entries.insert(path.clone(), previous.clone());
                    }
                    jobs.push(FetchJob {
                        dest: join_slash_path(&staging, &path),
                        path,
                        entry,
                        staged: true,
                    });
                }
                Decision::Delete | Decision::Retain => {}
            }
        }

        for (job, result) in self.run_fetches(&jobs, manifest.algorithm)? {
            match result {
                Ok(()) if job.staged => {
                    warn!(
                        "{} has been modified locally and was left in place; the new version is at {}",
                        job.path,
                        job.dest.display()
                    );
                    report.preserved_conflicts.push(job.path.clone());
                }
                Ok(()) => {
                    info!("installed {}", job.path);
                    next.entries
                        .insert(job.path.clone(), job.entry.digest.clone());
                    report.installed.push(job.path.clone());
                }
                Err(FetchError::Cancelled) => return Err(InstallError::Cancelled),
                Err(err) => {
                    warn!("failed to fetch {}: {err}", job.path);
                    if job.staged {
                        report.preserved_conflicts.push(job.path.clone());
                    } else if let Some(previous) = recorded(&job.path) {
                        next.entries.insert(job.path.clone(), previous.clone());
                    }
                    report.errors.push(FileError::from_fetch(&job.path, err));
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        if let Some(prior) = &prior {
            self.remove_dropped(
                destination,
                prior,
                manifest.algorithm,
                &wanted,
                &mut next,
                &mut report,
            )?;
        }

        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        ledger::save_ledger(&data_dir, &next)?;
        info!(
            installed = report.installed.len(),
            skipped = report.skipped.len(),
            deleted = report.deleted.len(),
            conflicts = report.preserved_conflicts.len() + report.retained.len(),
            errors = report.errors.len(),
            "files reconciled"
        );

        self.install_loaders(target, destination, manifest, &mut report);
        Ok(report)
    }

    fn run_fetches<'j>(
        &self,
        jobs: &'j [FetchJob<'j>],
        algorithm: DigestAlgorithm,
    ) -> Result<Vec<(&'j FetchJob<'j>, Result<(), FetchError>)>, InstallError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let total: u64 = jobs.iter().filter_map(|job| job.entry.size).sum();
        info!(
            "fetching {} files ({:.2} MB) with {} workers",
            jobs.len(),
            total as f64 / 1_048_576.0,
            self.config.max_workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers.max(1))
            .thread_name(|index| format!("packsmith-fetch-{index}"))
            .build()
            .map_err(|err| InstallError::WorkerPool(err.to_string()))?;
        let fetcher = self.fetcher.as_ref();
        let cancel = &self.cancel;
        Ok(pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    debug!(path = %job.path, url = %job.entry.url, "fetching");
                    let result = fetch::fetch_verified(
                        fetcher,
                        &job.entry.url,
                        &job.dest,
                        algorithm,
                        &job.entry.digest,
                        cancel,
                    );
                    (job, result)
                })
                .collect()
        }))
    }

    /// Deletes ledgered files the new version dropped, unless the user
    /// changed them.
    fn remove_dropped(
        &self,
        destination: &Path,
        prior: &InstallLedger,
        algorithm: DigestAlgorithm,
        wanted: &HashSet<String>,
        next: &mut InstallLedger,
        report: &mut InstallReport,
    ) -> Result<(), InstallError> {
        // The walk never enters excluded directories, so their entries are
        // kept until the pack ships the path again.
        for (path, digest) in &prior.entries {
            let excluded = path
                .split_once('/')
                .is_some_and(|(top, _)| self.config.is_excluded(top));
            if excluded && !wanted.contains(path) {
                debug!("{path} is under an excluded directory; keeping its ledger entry");
                next.entries.insert(path.clone(), digest.clone());
            }
        }

        let mut dropped = Vec::new();
        let walker = WalkDir::new(destination)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() != 1
                    || !entry.file_type().is_dir()
                    || !self.config.is_excluded(&entry.file_name().to_string_lossy())
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(|path| relative_slash_path(destination, path))
                        .unwrap_or_default();
                    report.errors.push(FileError::Io {
                        path,
                        source: err.into(),
                    });
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(rel) = relative_slash_path(destination, entry.path()) else {
                continue;
            };
            if wanted.contains(&rel) {
                continue;
            }
            if let Some(recorded) = prior.digest_for(&rel) {
                dropped.push((rel, entry.into_path(), recorded.clone()));
            }
        }

        for (rel, path, recorded) in dropped {
            if self.cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let on_disk = if path.is_symlink() {
                None
            } else {
                match digest::digest_file(algorithm, &path, &self.cancel) {
                    Ok(digest) => Some(digest),
                    Err(_) if self.cancel.is_cancelled() => return Err(InstallError::Cancelled),
                    Err(source) => {
                        next.entries.insert(rel.clone(), recorded);
                        report.errors.push(FileError::Io { path: rel, source });
                        continue;
                    }
                }
            };
            let decision = match &on_disk {
                Some(digest) => decide_dropped(digest, &recorded),
                None => Decision::Retain,
            };
            match decision {
                Decision::Delete => match fs::remove_file(&path) {
                    Ok(()) => {
                        info!("{rel} was removed from the pack and deleted");
                        prune_empty_parents(destination, &path);
                        report.deleted.push(rel);
                    }
                    Err(source) => {
                        next.entries.insert(rel.clone(), recorded);
                        report.errors.push(FileError::Io { path: rel, source });
                    }
                },
                _ => {
                    warn!(
                        "{rel} was removed from the pack but has local changes, so it was kept; \
                         delete it, or drop its line from {}/{} to stop this warning",
                        self.config.data_dir_name,
                        ledger::LEDGER_FILE
                    );
                    next.entries.insert(rel.clone(), recorded);
                    report.retained.push(rel);
                }
            }
        }
        Ok(())
    }

    fn install_loaders(
        &self,
        target: InstallTarget,
        destination: &Path,
        manifest: &PackManifest,
        report: &mut InstallReport,
    ) {
        let installer = LoaderInstaller {
            settings: &self.config.loader,
            fetcher: self.fetcher.as_ref(),
            runner: self.runner.as_ref(),
            client_archives: self.client_archives.as_ref(),
            cancel: &self.cancel,
        };
        for component in &manifest.loaders {
            let result = installer.install(
                component,
                target,
                destination,
                manifest.game_version.as_deref(),
            );
            match &result {
                Ok(LoaderOutcome::Installed) => info!("installed {}", component.label()),
                Ok(LoaderOutcome::AlreadyInstalled) => {
                    debug!("{} already present", component.label())
                }
                Err(err) => warn!("{} failed: {err}", component.label()),
            }
            report.loaders.push(LoaderReport {
                component: component.label(),
                result,
            });
        }
    }
}

/// Removes directories emptied by a deletion, stopping below `root`.
fn prune_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::RemoteArtifact,
        fetch::testing::MemoryFetcher,
        ledger::LEDGER_FILE,
        loader::GameVersion,
        manifest::{LoaderComponent, Side},
        native::testing::RecordingInstaller,
    };
    use tempfile::TempDir;

    struct Offline;

    impl ClientArchives for Offline {
        fn client_archive(&self, _game: &GameVersion) -> anyhow::Result<RemoteArtifact> {
            anyhow::bail!("offline")
        }
    }

    fn sha1(content: &str) -> ContentDigest {
        ContentDigest::of_bytes(DigestAlgorithm::Sha1, content.as_bytes())
    }

    struct Fixture {
        dir: TempDir,
        fetcher: Arc<MemoryFetcher>,
        reconciler: Reconciler,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let fetcher = Arc::new(MemoryFetcher::new());
            let config = InstallerConfig {
                max_workers: 2,
                excluded_dirs: vec!["saves".to_string()],
                data_dir_name: ".packsmith".to_string(),
                loader: LoaderSettings {
                    maven_root: "https://maven.test".to_string(),
                    client_tool_jar: None,
                    launcher_dir: dir.path().join("launcher"),
                },
            };
            let reconciler = Reconciler::new(
                config,
                fetcher.clone(),
                Arc::new(RecordingInstaller::exiting_with(0)),
                Arc::new(Offline),
            );
            Self {
                dir,
                fetcher,
                reconciler,
            }
        }

        fn dest(&self) -> PathBuf {
            self.dir.path().join("instance")
        }

        fn path(&self, rel: &str) -> PathBuf {
            join_slash_path(&self.dest(), rel)
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.path(rel)).unwrap()
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.path(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        /// Manifest whose files are served by the in-memory fetcher.
        fn manifest(&self, pack: &str, version: &str, files: &[(&str, &str)]) -> PackManifest {
            let files = files
                .iter()
                .map(|(path, content)| {
                    let url = format!("https://cdn.test/{version}/{path}");
                    self.fetcher.insert(&url, content.as_bytes().to_vec());
                    ManifestEntry {
                        path: path.to_string(),
                        digest: sha1(content),
                        side: Side::Both,
                        url,
                        size: Some(content.len() as u64),
                    }
                })
                .collect();
            PackManifest {
                pack_id: pack.to_string(),
                version_id: version.to_string(),
                name: "Test Pack".to_string(),
                game_version: Some("1.12.2".to_string()),
                algorithm: DigestAlgorithm::Sha1,
                files,
                loaders: Vec::new(),
            }
        }

        fn install(&self, manifest: &PackManifest) -> Result<InstallReport, InstallError> {
            self.reconciler
                .install_pack_version(InstallTarget::Client, &self.dest(), manifest)
        }

        fn ledger(&self) -> InstallLedger {
            ledger::load_ledger(&self.dest().join(".packsmith"))
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn decision_table() {
        let (a, b, c) = (sha1("a"), sha1("b"), sha1("c"));
        assert_eq!(decide(None, &a, None), Decision::Install);
        assert_eq!(decide(None, &a, Some(&b)), Decision::Install);
        assert_eq!(decide(Some(&a), &a, Some(&b)), Decision::SkipUnchanged);
        assert_eq!(decide(Some(&b), &a, None), Decision::Install);
        assert_eq!(decide(Some(&b), &a, Some(&b)), Decision::Install);
        assert_eq!(decide(Some(&c), &a, Some(&b)), Decision::PreserveDiverged);
        assert_eq!(decide_dropped(&a, &a), Decision::Delete);
        assert_eq!(decide_dropped(&a, &b), Decision::Retain);
    }

    #[test]
    fn fresh_install_ledger_matches_manifest() {
        let fx = Fixture::new();
        let manifest = fx.manifest(
            "35",
            "1",
            &[("mods/foo.jar", "foo"), ("./config/foo.cfg", "a=1")],
        );
        let report = fx.install(&manifest).unwrap();

        assert_eq!(report.installed.len(), 2);
        assert!(report.is_clean());
        assert_eq!(fx.read("mods/foo.jar"), "foo");
        assert_eq!(fx.read("config/foo.cfg"), "a=1");
        let ledger = fx.ledger();
        assert_eq!(ledger.pack_id, "35");
        assert_eq!(ledger.version_id, "1");
        assert_eq!(ledger.entries.len(), 2);
        assert_eq!(ledger.entries["mods/foo.jar"], sha1("foo"));
        assert_eq!(ledger.entries["config/foo.cfg"], sha1("a=1"));
    }

    #[test]
    fn second_run_skips_everything() {
        let fx = Fixture::new();
        let manifest = fx.manifest(
            "35",
            "1",
            &[
                ("mods/foo.jar", "foo"),
                ("mods/bar.jar", "bar"),
                ("config/foo.cfg", "cfg"),
                ("options.txt", "opts"),
            ],
        );
        fx.install(&manifest).unwrap();
        let first = fx.ledger();
        let fetched = fx.fetcher.requests().len();

        let report = fx.install(&manifest).unwrap();
        assert!(report.installed.is_empty());
        assert!(report.is_clean());
        assert_eq!(
            report.skipped,
            vec!["mods/foo.jar", "mods/bar.jar", "config/foo.cfg", "options.txt"]
        );
        assert_eq!(fx.fetcher.requests().len(), fetched);
        let second = fx.ledger();
        assert_eq!(second.identity, first.identity);
        assert_eq!(second.pack_id, first.pack_id);
        assert_eq!(second.version_id, first.version_id);
        assert_eq!(second.entries, first.entries);
        assert_eq!(second.entries.len(), 4);
    }

    #[test]
    fn divergences_keep_reporting_on_later_runs() {
        let fx = Fixture::new();
        fx.install(&fx.manifest(
            "35",
            "1",
            &[
                ("config/a.cfg", "c1"),
                ("mods/old.jar", "o1"),
                ("mods/keep.jar", "k"),
            ],
        ))
        .unwrap();
        fx.write("config/a.cfg", "mine");
        fx.write("mods/old.jar", "patched");

        let v2 = fx.manifest("35", "2", &[("config/a.cfg", "c2"), ("mods/keep.jar", "k")]);
        let second = fx.install(&v2).unwrap();
        let after_second = fx.ledger();
        let third = fx.install(&v2).unwrap();

        for report in [&second, &third] {
            assert_eq!(report.preserved_conflicts, vec!["config/a.cfg"]);
            assert_eq!(report.retained, vec!["mods/old.jar"]);
            assert_eq!(report.skipped, vec!["mods/keep.jar"]);
            assert!(report.installed.is_empty());
            assert!(report.deleted.is_empty());
        }
        assert_eq!(fx.read("config/a.cfg"), "mine");
        assert_eq!(fx.read("mods/old.jar"), "patched");
        assert_eq!(fx.read(".packsmith/2/config/a.cfg"), "c2");

        let after_third = fx.ledger();
        assert_eq!(after_third.entries, after_second.entries);
        assert_eq!(after_third.entries["config/a.cfg"], sha1("c1"));
        assert_eq!(after_third.entries["mods/old.jar"], sha1("o1"));
    }

    #[test]
    fn escaping_version_id_is_refused() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("config/a.cfg", "d1")]))
            .unwrap();
        fx.write("config/a.cfg", "user");
        let outside = fx.dir.path().parent().unwrap().join("escaped");
        let fetched = fx.fetcher.requests().len();

        for version in ["../../../escaped", "/tmp/escaped", "..", "a/b", "a\\b", ""] {
            let err = fx
                .install(&fx.manifest("35", version, &[("config/a.cfg", "d2")]))
                .unwrap_err();
            assert!(
                matches!(&err, InstallError::UnsafeVersionId(id) if id == version),
                "{version:?}: {err}"
            );
        }
        assert!(!outside.join("config").join("a.cfg").exists());
        assert_eq!(fx.fetcher.requests().len(), fetched);
        assert_eq!(fx.read("config/a.cfg"), "user");
        let ledger = fx.ledger();
        assert_eq!(ledger.version_id, "1");
        assert_eq!(ledger.entries["config/a.cfg"], sha1("d1"));
    }

    #[test]
    fn user_edit_is_preserved_and_new_version_staged() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("config/a.cfg", "d1")]))
            .unwrap();
        fx.write("config/a.cfg", "d2");

        let report = fx
            .install(&fx.manifest("35", "2", &[("config/a.cfg", "d3")]))
            .unwrap();
        assert_eq!(report.preserved_conflicts, vec!["config/a.cfg"]);
        assert_eq!(fx.read("config/a.cfg"), "d2");
        assert_eq!(fx.read(".packsmith/2/config/a.cfg"), "d3");
        assert_eq!(fx.ledger().entries["config/a.cfg"], sha1("d1"));
    }

    #[test]
    fn untouched_tracked_file_is_upgraded() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("mods/foo.jar", "old")]))
            .unwrap();
        let report = fx
            .install(&fx.manifest("35", "2", &[("mods/foo.jar", "new")]))
            .unwrap();
        assert_eq!(report.installed, vec!["mods/foo.jar"]);
        assert_eq!(fx.read("mods/foo.jar"), "new");
        assert_eq!(fx.ledger().entries["mods/foo.jar"], sha1("new"));
    }

    #[test]
    fn unknown_file_at_pack_path_is_overwritten() {
        let fx = Fixture::new();
        fx.write("options.txt", "mine");
        let report = fx
            .install(&fx.manifest("35", "1", &[("options.txt", "pack")]))
            .unwrap();
        assert_eq!(report.installed, vec!["options.txt"]);
        assert_eq!(fx.read("options.txt"), "pack");
    }

    #[test]
    fn dropped_files_are_deleted_unless_modified() {
        let fx = Fixture::new();
        fx.install(&fx.manifest(
            "35",
            "1",
            &[
                ("mods/keep.jar", "keep"),
                ("mods/old/gone.jar", "gone"),
                ("config/edited.cfg", "v1"),
            ],
        ))
        .unwrap();
        fx.write("config/edited.cfg", "mine");
        fx.write("notes.txt", "user file");

        let report = fx
            .install(&fx.manifest("35", "2", &[("mods/keep.jar", "keep")]))
            .unwrap();
        assert_eq!(report.deleted, vec!["mods/old/gone.jar"]);
        assert!(!fx.path("mods/old").exists());
        assert!(fx.path("mods").exists());
        assert_eq!(report.retained, vec!["config/edited.cfg"]);
        assert_eq!(fx.read("config/edited.cfg"), "mine");
        assert_eq!(fx.read("notes.txt"), "user file");

        let ledger = fx.ledger();
        assert_eq!(ledger.entries["config/edited.cfg"], sha1("v1"));
        assert!(!ledger.entries.contains_key("mods/old/gone.jar"));
        assert!(!ledger.entries.contains_key("notes.txt"));
    }

    #[test]
    fn excluded_file_edit_survives_drop_and_readd() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("saves/w.dat", "d1"), ("mods/a.jar", "a")]))
            .unwrap();
        fx.install(&fx.manifest("35", "2", &[("mods/a.jar", "a")]))
            .unwrap();
        assert_eq!(fx.ledger().entries["saves/w.dat"], sha1("d1"));
        fx.write("saves/w.dat", "user edit");

        let report = fx
            .install(&fx.manifest("35", "3", &[("saves/w.dat", "d3"), ("mods/a.jar", "a")]))
            .unwrap();
        assert_eq!(report.preserved_conflicts, vec!["saves/w.dat"]);
        assert!(report.installed.is_empty());
        assert_eq!(fx.read("saves/w.dat"), "user edit");
        assert_eq!(fx.read(".packsmith/3/saves/w.dat"), "d3");
        assert_eq!(fx.ledger().entries["saves/w.dat"], sha1("d1"));
    }

    #[test]
    fn excluded_directories_are_never_touched() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("saves/default.dat", "world")]))
            .unwrap();
        let report = fx.install(&fx.manifest("35", "2", &[])).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(fx.read("saves/default.dat"), "world");
        assert!(fx.path(".packsmith").join(LEDGER_FILE).exists());
    }

    #[test]
    fn other_pack_is_refused_before_any_change() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("mods/foo.jar", "foo")]))
            .unwrap();
        let fetched = fx.fetcher.requests().len();

        let err = fx
            .install(&fx.manifest("99", "1", &[("mods/bar.jar", "bar")]))
            .unwrap_err();
        assert!(matches!(err, InstallError::PackMismatch { .. }));
        assert_eq!(fx.fetcher.requests().len(), fetched);
        assert!(!fx.path("mods/bar.jar").exists());
        assert_eq!(fx.ledger().pack_id, "35");
    }

    #[test]
    fn corrupt_ledger_aborts() {
        let fx = Fixture::new();
        fx.write(".packsmith/install.json", "{ broken");
        let err = fx
            .install(&fx.manifest("35", "1", &[("mods/foo.jar", "foo")]))
            .unwrap_err();
        assert!(matches!(
            err,
            InstallError::Ledger(LedgerError::Corrupt { .. })
        ));
        assert!(fx.fetcher.requests().is_empty());
        assert_eq!(fx.read(".packsmith/install.json"), "{ broken");
    }

    #[test]
    fn cancelled_run_keeps_prior_ledger() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("mods/foo.jar", "foo")]))
            .unwrap();
        fx.reconciler.cancel_token().cancel();

        let err = fx
            .install(&fx.manifest("35", "2", &[("mods/foo.jar", "bar")]))
            .unwrap_err();
        assert!(matches!(err, InstallError::Cancelled));
        assert_eq!(fx.ledger().version_id, "1");
        assert_eq!(fx.read("mods/foo.jar"), "foo");
    }

    #[test]
    fn digest_mismatch_is_a_per_file_error() {
        let fx = Fixture::new();
        let mut manifest = fx.manifest("35", "1", &[("mods/a.jar", "a"), ("mods/b.jar", "b")]);
        fx.fetcher.insert(&manifest.files[0].url, b"tampered".to_vec());
        manifest.files[0].size = None;

        let report = fx.install(&manifest).unwrap();
        assert_eq!(report.installed, vec!["mods/b.jar"]);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            &report.errors[0],
            FileError::DigestMismatch { path, .. } if path == "mods/a.jar"
        ));
        assert!(!fx.path("mods/a.jar").exists());
        assert!(!fx.ledger().entries.contains_key("mods/a.jar"));
    }

    #[test]
    fn failed_fetch_carries_prior_entry() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("mods/foo.jar", "foo")]))
            .unwrap();
        let mut next = fx.manifest("35", "2", &[]);
        next.files.push(ManifestEntry {
            path: "mods/foo.jar".to_string(),
            digest: sha1("foo2"),
            side: Side::Both,
            url: "https://cdn.test/missing".to_string(),
            size: None,
        });

        let report = fx.install(&next).unwrap();
        assert!(matches!(&report.errors[0], FileError::Fetch { .. }));
        assert_eq!(fx.read("mods/foo.jar"), "foo");
        assert_eq!(fx.ledger().entries["mods/foo.jar"], sha1("foo"));
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn server_install_skips_client_only_files() {
        let fx = Fixture::new();
        let mut manifest = fx.manifest("35", "1", &[("mods/common.jar", "c"), ("mods/gui.jar", "g")]);
        manifest.files[1].side = Side::Client;
        let report = fx
            .reconciler
            .install_pack_version(InstallTarget::Server, &fx.dest(), &manifest)
            .unwrap();
        assert_eq!(report.installed, vec!["mods/common.jar"]);
        assert!(!fx.path("mods/gui.jar").exists());
        assert_eq!(fx.ledger().target, InstallTarget::Server);
    }

    #[test]
    fn unsafe_paths_are_rejected() {
        let fx = Fixture::new();
        let report = fx
            .install(&fx.manifest("35", "1", &[("../escape.jar", "x"), ("mods/ok.jar", "ok")]))
            .unwrap();
        assert!(matches!(&report.errors[0], FileError::UnsafePath(_)));
        assert_eq!(report.installed, vec!["mods/ok.jar"]);
        assert!(!fx.dir.path().join("escape.jar").exists());
    }

    #[test]
    fn malformed_digest_keeps_tracked_file() {
        let fx = Fixture::new();
        fx.install(&fx.manifest("35", "1", &[("mods/foo.jar", "foo")]))
            .unwrap();
        let mut next = fx.manifest("35", "2", &[("mods/foo.jar", "foo2")]);
        next.files[0].digest = ContentDigest::from_hex("abcd").unwrap();

        let report = fx.install(&next).unwrap();
        assert!(matches!(
            &report.errors[0],
            FileError::MalformedDigest { path, .. } if path == "mods/foo.jar"
        ));
        assert!(report.deleted.is_empty());
        assert_eq!(fx.read("mods/foo.jar"), "foo");
        assert_eq!(fx.ledger().entries["mods/foo.jar"], sha1("foo"));
    }

    #[test]
    fn loader_failure_does_not_undo_files() {
        let fx = Fixture::new();
        let mut manifest = fx.manifest("35", "1", &[("mods/foo.jar", "foo")]);
        manifest.game_version = Some("1.4.7".to_string());
        manifest.loaders.push(LoaderComponent::Forge {
            version: "6.6.2.534".to_string(),
        });

        let report = fx.install(&manifest).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.installed, vec!["mods/foo.jar"]);
        assert!(matches!(
            report.loaders[0].result,
            Err(LoaderError::UnsupportedVersion { .. })
        ));
        assert_eq!(fx.ledger().entries.len(), 1);
    }
}
