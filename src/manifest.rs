use crate::digest::{ContentDigest, DigestAlgorithm};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallTarget {
    #[default]
    Client,
    Server,
}

impl InstallTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallTarget::Client => "client",
            InstallTarget::Server => "server",
        }
    }
}

impl fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" | "c" => Ok(InstallTarget::Client),
            "server" | "s" => Ok(InstallTarget::Server),
            other => Err(anyhow::anyhow!("unknown install target {other}")),
        }
    }
}

/// Which install targets a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    #[default]
    Both,
    Client,
    Server,
}

impl Side {
    pub fn from_flags(client_only: bool, server_only: bool) -> Self {
        match (client_only, server_only) {
            (true, false) => Side::Client,
            (false, true) => Side::Server,
            _ => Side::Both,
        }
    }

    pub fn applies_to(self, target: InstallTarget) -> bool {
        match self {
            Side::Both => true,
            Side::Client => target == InstallTarget::Client,
            Side::Server => target == InstallTarget::Server,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub digest: ContentDigest,
    #[serde(default)]
    pub side: Side,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoaderComponent {
    Forge { version: String },
    /// Splice the archive at `payload` (relative to the destination) over the
    /// vanilla client archive and register it as launcher version
    /// `version_name`. A pack-supplied `version_json` becomes the launcher
    /// descriptor with its id rewritten.
    ClientSplice {
        payload: String,
        version_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_json: Option<String>,
    },
}

/// Runtime archive a pack ships for splicing over the client.
pub const SPLICE_PAYLOAD: &str = "bin/modpack.jar";
/// Launcher descriptor a pack may ship beside the payload.
pub const SPLICE_VERSION_JSON: &str = "bin/version.json";

impl LoaderComponent {
    pub fn label(&self) -> String {
        match self {
            LoaderComponent::Forge { version } => format!("forge {version}"),
            LoaderComponent::ClientSplice { version_name, .. } => {
                format!("client splice {version_name}")
            }
        }
    }
}

/// One pack version's desired file state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    pub pack_id: String,
    pub version_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub game_version: Option<String>,
    #[serde(default)]
    pub algorithm: DigestAlgorithm,
    #[serde(default)]
    pub files: Vec<ManifestEntry>,
    #[serde(default)]
    pub loaders: Vec<LoaderComponent>,
}

impl PackManifest {
    /// Adds a client splice when the pack ships a runtime archive but does not
    /// declare one itself.
    pub fn infer_client_splice(&mut self) {
        let declared = self
            .loaders
            .iter()
            .any(|loader| matches!(loader, LoaderComponent::ClientSplice { .. }));
        let ships = |wanted: &str| {
            self.files
                .iter()
                .any(|entry| normalize_relative_path(&entry.path).as_deref() == Some(wanted))
        };
        if declared || !ships(SPLICE_PAYLOAD) {
            return;
        }
        let Some(game) = self.game_version.as_deref() else {
            return;
        };
        let version_json = ships(SPLICE_VERSION_JSON).then(|| SPLICE_VERSION_JSON.to_string());
        let version_name = format!("{game}-{}-{}", self.pack_id, self.version_id);
        self.loaders.push(LoaderComponent::ClientSplice {
            payload: SPLICE_PAYLOAD.to_string(),
            version_name,
            version_json,
        });
    }

    pub fn applicable(&self, target: InstallTarget) -> impl Iterator<Item = &ManifestEntry> {
        self.files
            .iter()
            .filter(move |entry| entry.side.applies_to(target))
    }

    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("{} {}", self.pack_id, self.version_id)
        } else {
            format!("{} {}", self.name, self.version_id)
        }
    }
}

/// Canonical slash-separated form of a pack-relative path. Returns `None`
/// for paths that would escape the destination.
pub fn normalize_relative_path(raw: &str) -> Option<String> {
    let raw = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() || raw.starts_with('/') {
        return None;
    }
    Some(parts.join("/"))
}

/// True when `value` is one plain path component, such as a directory name.
pub fn is_single_component(value: &str) -> bool {
    let mut components = Path::new(value).components();
    normalize_relative_path(value).as_deref() == Some(value)
        && matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
}

/// Slash path of `path` under `root`, if it lies beneath it.
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn join_slash_path(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
