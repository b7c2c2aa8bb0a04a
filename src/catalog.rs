use crate::{
    digest::{ContentDigest, DigestAlgorithm},
    fetch::{FetchError, FileFetcher},
    loader::GameVersion,
    manifest::{
        is_single_component, normalize_relative_path, LoaderComponent, ManifestEntry, PackManifest,
        Side,
    },
};
use anyhow::{anyhow, Context, Result};
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

pub const MODPACKS_API: &str = "https://api.modpacks.ch";
pub const MOJANG_VERSION_MANIFEST: &str =
    "https://launchermeta.mojang.com/mc/game/version_manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("pack {pack} version {version} was not found")]
    NotFound { pack: String, version: String },
    #[error("catalog request failed: {0}")]
    Network(String),
    #[error("catalog response could not be decoded: {0}")]
    Decode(String),
}

/// Source of pack manifests.
pub trait PackCatalog {
    fn manifest(&self, pack: &str, version: &str) -> Result<PackManifest, CatalogError>;
}

fn read_json<T: DeserializeOwned>(
    fetcher: &dyn FileFetcher,
    url: &str,
    pack: &str,
    version: &str,
) -> Result<T, CatalogError> {
    let reader = fetcher.fetch(url).map_err(|err| match err {
        FetchError::Status { status: 404, .. } => CatalogError::NotFound {
            pack: pack.to_string(),
            version: version.to_string(),
        },
        other => CatalogError::Network(other.to_string()),
    })?;
    serde_json::from_reader(reader).map_err(|err| CatalogError::Decode(format!("{url}: {err}")))
}

#[derive(Debug, Deserialize)]
struct ModpacksPack {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ModpacksVersion {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    files: Vec<ModpacksFile>,
    #[serde(default)]
    targets: Vec<ModpacksTarget>,
}

#[derive(Debug, Deserialize)]
struct ModpacksFile {
    path: String,
    name: String,
    url: String,
    sha1: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    clientonly: bool,
    #[serde(default)]
    serveronly: bool,
}

#[derive(Debug, Deserialize)]
struct ModpacksTarget {
    name: String,
    version: String,
    #[serde(rename = "type")]
    kind: String,
}

/// Reads pack versions from the modpacks.ch public API.
pub struct ModpacksCatalog {
    base_url: String,
    fetcher: Arc<dyn FileFetcher>,
}

impl ModpacksCatalog {
    pub fn new(base_url: &str, fetcher: Arc<dyn FileFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            fetcher,
        }
    }
}

impl PackCatalog for ModpacksCatalog {
    fn manifest(&self, pack: &str, version: &str) -> Result<PackManifest, CatalogError> {
        let not_found = || CatalogError::NotFound {
            pack: pack.to_string(),
            version: version.to_string(),
        };
        let pack_url = format!("{}/public/modpack/{pack}", self.base_url);
        let info: ModpacksPack = read_json(self.fetcher.as_ref(), &pack_url, pack, version)?;
        // The API answers unknown ids with 200 and a status field.
        if info.status.as_deref() == Some("error") {
            return Err(not_found());
        }
        let version_url = format!("{pack_url}/{version}");
        let body: ModpacksVersion = read_json(self.fetcher.as_ref(), &version_url, pack, version)?;
        if body.status.as_deref() == Some("error") {
            return Err(not_found());
        }
        debug!(pack, version, files = body.files.len(), "fetched modpacks.ch version");
        manifest_from_modpacks(pack, &info.name, body)
    }
}

fn manifest_from_modpacks(
    pack: &str,
    pack_name: &str,
    version: ModpacksVersion,
) -> Result<PackManifest, CatalogError> {
    let mut files = Vec::with_capacity(version.files.len());
    for file in version.files {
        let joined = format!("{}/{}", file.path, file.name);
        let path = normalize_relative_path(&joined)
            .ok_or_else(|| CatalogError::Decode(format!("unsafe file path {joined:?}")))?;
        let digest = ContentDigest::from_hex(&file.sha1)
            .map_err(|err| CatalogError::Decode(format!("{path}: {err}")))?;
        files.push(ManifestEntry {
            path,
            digest,
            side: Side::from_flags(file.clientonly, file.serveronly),
            url: file.url,
            size: file.size,
        });
    }

    let mut game_version = None;
    let mut loaders = Vec::new();
    for target in version.targets {
        match (target.kind.as_str(), target.name.as_str()) {
            ("game", _) => {
                if game_version.is_none() {
                    game_version = Some(target.version);
                }
            }
            ("modloader", "forge") => loaders.push(LoaderComponent::Forge {
                version: target.version,
            }),
            (kind, name) => warn!("ignoring unsupported {kind} target {name} {}", target.version),
        }
    }

    let version_id = if version.id == 0 {
        version.name.clone()
    } else {
        version.id.to_string()
    };
    let name = if version.name.is_empty() {
        pack_name.to_string()
    } else {
        format!("{pack_name} {}", version.name).trim().to_string()
    };
    let mut manifest = PackManifest {
        pack_id: pack.to_string(),
        version_id,
        name,
        game_version,
        algorithm: DigestAlgorithm::Sha1,
        files,
        loaders,
    };
    manifest.infer_client_splice();
    Ok(manifest)
}


/// Manifests stored as `<root>/<pack>/<version>.json`.
pub struct LocalCatalog {
    root: PathBuf,
}

impl LocalCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn manifest_path(&self, pack: &str, version: &str) -> Result<PathBuf, CatalogError> {
        if !is_single_component(pack) || !is_single_component(version) {
            return Err(CatalogError::NotFound {
                pack: pack.to_string(),
                version: version.to_string(),
            });
        }
        Ok(self.root.join(pack).join(format!("{version}.json")))
    }
}

impl PackCatalog for LocalCatalog {
    fn manifest(&self, pack: &str, version: &str) -> Result<PackManifest, CatalogError> {
        let path = self.manifest_path(pack, version)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CatalogError::NotFound {
                    pack: pack.to_string(),
                    version: version.to_string(),
                })
            }
            Err(err) => return Err(CatalogError::Network(format!("{}: {err}", path.display()))),
        };
        let mut manifest: PackManifest = serde_json::from_str(&raw)
            .map_err(|err| CatalogError::Decode(format!("{}: {err}", path.display())))?;
        manifest.infer_client_splice();
        Ok(manifest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    pub url: String,
    pub sha1: Option<ContentDigest>,
}

/// Locates the vanilla client archive for a game version.
pub trait ClientArchives {
    fn client_archive(&self, game: &GameVersion) -> Result<RemoteArtifact>;
}

#[derive(Debug, Deserialize)]
struct VersionManifest {
    versions: Vec<VersionManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct VersionManifestEntry {
    id: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct VersionDocument {
    downloads: VersionDownloads,
}

#[derive(Debug, Deserialize)]
struct VersionDownloads {
    client: Download,
}

#[derive(Debug, Deserialize)]
struct Download {
    url: String,
    #[serde(default)]
    sha1: Option<String>,
}

/// Mojang launcher metadata.
pub struct MojangVersions {
    manifest_url: String,
    fetcher: Arc<dyn FileFetcher>,
}

impl MojangVersions {
    pub fn new(fetcher: Arc<dyn FileFetcher>) -> Self {
        Self::with_manifest_url(MOJANG_VERSION_MANIFEST, fetcher)
    }

    pub fn with_manifest_url(manifest_url: &str, fetcher: Arc<dyn FileFetcher>) -> Self {
        Self {
            manifest_url: manifest_url.to_string(),
            fetcher,
        }
    }

    fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let reader = self
            .fetcher
            .fetch(url)
            .with_context(|| format!("request {url}"))?;
        serde_json::from_reader(reader).with_context(|| format!("parse {url}"))
    }
}

impl ClientArchives for MojangVersions {
    fn client_archive(&self, game: &GameVersion) -> Result<RemoteArtifact> {
        let id = game.to_string();
        let manifest: VersionManifest = self.get(&self.manifest_url)?;
        let entry = manifest
            .versions
            .iter()
            .find(|version| version.id == id)
            .ok_or_else(|| anyhow!("game version {id} is not in the launcher manifest"))?;
        let document: VersionDocument = self.get(&entry.url)?;
        let sha1 = document
            .downloads
            .client
            .sha1
            .as_deref()
            .map(ContentDigest::from_hex)
            .transpose()
            .context("parse client sha1")?;
        Ok(RemoteArtifact {
            url: document.downloads.client.url,
            sha1,
        })
    }
}

pub fn catalog_for(
    local_dir: Option<&Path>,
    api_url: &str,
    fetcher: Arc<dyn FileFetcher>,
) -> Box<dyn PackCatalog> {
    match local_dir {
        Some(dir) => Box::new(LocalCatalog::new(dir)),
        None => Box::new(ModpacksCatalog::new(api_url, fetcher)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing::MemoryFetcher;
    use tempfile::TempDir;

    const FOO_SHA1: &str = "0beec7b5ea3f0fdbc95d0dd47f3c5bc275da8a33";

    fn version_json() -> String {
        format!(
            r#"{{
                "id": 180, "name": "1.2.0", "status": "success",
                "files": [
                    {{"path": "./mods/", "name": "foo.jar", "url": "https://cdn/foo.jar",
                      "sha1": "{FOO_SHA1}", "size": 3, "clientonly": false, "serveronly": false}},
                    {{"path": "./mods/", "name": "gui.jar", "url": "https://cdn/gui.jar",
                      "sha1": "{FOO_SHA1}", "clientonly": true, "serveronly": false}}
                ],
                "targets": [
                    {{"name": "minecraft", "version": "1.12.2", "type": "game"}},
                    {{"name": "forge", "version": "14.23.5.2855", "type": "modloader"}},
                    {{"name": "java", "version": "8", "type": "runtime"}}
                ]
            }}"#
        )
    }

    fn modpacks() -> (Arc<MemoryFetcher>, ModpacksCatalog) {
        let fetcher = Arc::new(MemoryFetcher::new());
        let catalog = ModpacksCatalog::new("https://api.test/", fetcher.clone());
        (fetcher, catalog)
    }

    #[test]
    fn maps_modpacks_version_into_manifest() {
        let (fetcher, catalog) = modpacks();
        fetcher.insert(
            "https://api.test/public/modpack/35",
            r#"{"status":"success","name":"Revelation"}"#,
        );
        fetcher.insert("https://api.test/public/modpack/35/180", version_json());

        let manifest = catalog.manifest("35", "180").unwrap();
        assert_eq!(manifest.pack_id, "35");
        assert_eq!(manifest.version_id, "180");
        assert_eq!(manifest.name, "Revelation 1.2.0");
        assert_eq!(manifest.game_version.as_deref(), Some("1.12.2"));
        assert_eq!(manifest.algorithm, DigestAlgorithm::Sha1);
        assert_eq!(manifest.files[0].path, "mods/foo.jar");
        assert_eq!(manifest.files[0].digest.to_hex(), FOO_SHA1);
        assert_eq!(manifest.files[0].side, Side::Both);
        assert_eq!(manifest.files[1].side, Side::Client);
        assert_eq!(
            manifest.loaders,
            vec![LoaderComponent::Forge {
                version: "14.23.5.2855".to_string()
            }]
        );
    }

    #[test]
    fn error_status_is_not_found() {
        let (fetcher, catalog) = modpacks();
        fetcher.insert(
            "https://api.test/public/modpack/999",
            r#"{"status":"error","message":"Modpack not found"}"#,
        );
        assert!(matches!(
            catalog.manifest("999", "1"),
            Err(CatalogError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.manifest("404", "1"),
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    fn escaping_file_path_is_a_decode_error() {
        let body: ModpacksVersion = serde_json::from_str(&format!(
            r#"{{"id": 1, "files": [{{"path": "../", "name": "evil.jar",
                "url": "u", "sha1": "{FOO_SHA1}"}}]}}"#
        ))
        .unwrap();
        assert!(matches!(
            manifest_from_modpacks("1", "p", body),
            Err(CatalogError::Decode(_))
        ));
    }

    #[test]
    fn local_catalog_reads_manifest_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("demo")).unwrap();
        fs::write(
            dir.path().join("demo").join("2.json"),
            format!(
                r#"{{"pack_id":"demo","version_id":"2","game_version":"1.16.5",
                    "files":[{{"path":"mods/foo.jar","digest":"{FOO_SHA1}","url":"https://cdn/foo.jar"}}],
                    "loaders":[{{"kind":"forge","version":"36.2.39"}}]}}"#
            ),
        )
        .unwrap();

        let catalog = LocalCatalog::new(dir.path());
        let manifest = catalog.manifest("demo", "2").unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].side, Side::Both);
        assert!(matches!(
            catalog.manifest("demo", "3"),
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[test]
    fn local_catalog_refuses_names_outside_its_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("catalog");
        fs::create_dir_all(root.join("demo")).unwrap();
        fs::write(
            dir.path().join("secret.json"),
            r#"{"pack_id":"demo","version_id":"x"}"#,
        )
        .unwrap();
        fs::write(root.join("demo").join("1.json"), r#"{"pack_id":"demo","version_id":"1"}"#)
            .unwrap();

        let catalog = LocalCatalog::new(&root);
        for (pack, version) in [
            ("demo", "../../secret"),
            ("..", "secret"),
            ("demo/..", "1"),
            ("demo\\..", "1"),
            ("", "1"),
            ("demo", ""),
        ] {
            assert!(
                matches!(catalog.manifest(pack, version), Err(CatalogError::NotFound { .. })),
                "{pack:?} {version:?} was accepted"
            );
        }
        assert_eq!(catalog.manifest("demo", "1").unwrap().version_id, "1");
    }

    #[test]
    fn local_catalog_splices_shipped_runtime_archive() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tekkit")).unwrap();
        fs::write(
            dir.path().join("tekkit").join("1.2.9.json"),
            format!(
                r#"{{"pack_id":"tekkit","version_id":"1.2.9","game_version":"1.7.10",
                    "files":[{{"path":"bin/modpack.jar","digest":"{FOO_SHA1}","url":"https://cdn/m.jar"}}]}}"#
            ),
        )
        .unwrap();

        let manifest = LocalCatalog::new(dir.path()).manifest("tekkit", "1.2.9").unwrap();
        assert_eq!(
            manifest.loaders,
            vec![LoaderComponent::ClientSplice {
                payload: "bin/modpack.jar".to_string(),
                version_name: "1.7.10-tekkit-1.2.9".to_string(),
                version_json: None,
            }]
        );
    }

    #[test]
    fn mojang_versions_resolve_client_download() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(
            "https://meta.test/manifest.json",
            r#"{"latest":{},"versions":[
                {"id":"1.7.10","type":"release","url":"https://meta.test/1.7.10.json"}]}"#,
        );
        fetcher.insert(
            "https://meta.test/1.7.10.json",
            format!(
                r#"{{"id":"1.7.10","downloads":{{"client":{{"url":"https://cdn/client.jar","sha1":"{FOO_SHA1}"}}}}}}"#
            ),
        );
        let versions = MojangVersions::with_manifest_url("https://meta.test/manifest.json", fetcher);

        let artifact = versions
            .client_archive(&GameVersion::new(1, 7, 10))
            .unwrap();
        assert_eq!(artifact.url, "https://cdn/client.jar");
        assert_eq!(artifact.sha1.unwrap().to_hex(), FOO_SHA1);
        assert!(versions.client_archive(&GameVersion::new(1, 2, 5)).is_err());
    }
}
