use crate::{
    archive::{self, ArchiveError},
    cancel::CancelToken,
    catalog::ClientArchives,
    digest::DigestAlgorithm,
    fetch::{self, FetchError, FileFetcher},
    manifest::{join_slash_path, normalize_relative_path, InstallTarget, LoaderComponent},
    native::{build_classpath, NativeInstaller},
};
use serde::Serialize;
use std::{
    ffi::OsString,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use tracing::info;
use zip::ZipArchive;

const FORGE_CLIENT_TOOL_CLASS: &str = "ModernForgeClientTool";
const INSTALL_PROFILE: &str = "install_profile.json";

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("invalid version {0:?}")]
    InvalidVersion(String),
    #[error("the pack does not declare a game version")]
    MissingGameVersion,
    #[error("forge {loader} for {game} is not supported")]
    UnsupportedVersion { game: String, loader: String },
    #[error("{component} cannot be installed for a {target} target")]
    UnsupportedTarget {
        component: String,
        target: InstallTarget,
    },
    #[error("client install tool is not configured (client_tool_jar)")]
    MissingTool,
    #[error("pack payload {0:?} is missing")]
    MissingPayload(PathBuf),
    #[error("install profile: {0}")]
    InstallProfile(String),
    #[error("launcher descriptor {path:?}: {reason}")]
    LauncherDescriptor { path: String, reason: String },
    #[error("client archive for {game}: {reason}")]
    ClientArchive { game: String, reason: String },
    #[error("installer exited with {}", .0.map(|code| code.to_string()).unwrap_or_else(|| "a signal".to_string()))]
    ExitStatus(Option<i32>),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GameVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl GameVersion {
    pub fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            revision,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, LoaderError> {
        let invalid = || LoaderError::InvalidVersion(raw.to_string());
        let mut parts = raw.trim().split('.');
        let major = parse_part(parts.next()).ok_or_else(invalid)?;
        let minor = parse_part(parts.next()).ok_or_else(invalid)?;
        let revision = match parts.next() {
            Some(part) => parse_part(Some(part)).ok_or_else(invalid)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self::new(major, minor, revision))
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.revision == 0 {
            write!(f, "{}.{}", self.major, self.minor)
        } else {
            write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
        }
    }
}

fn parse_part(part: Option<&str>) -> Option<u32> {
    part.filter(|part| !part.is_empty())?.parse().ok()
}

/// Dotted numeric loader version such as `14.23.5.2855`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderVersion {
    raw: String,
    parts: Vec<u32>,
}

impl LoaderVersion {
    pub fn parse(raw: &str) -> Result<Self, LoaderError> {
        let raw = raw.trim();
        let parts = raw
            .split('.')
            .map(|part| parse_part(Some(part)))
            .collect::<Option<Vec<u32>>>()
            .ok_or_else(|| LoaderError::InvalidVersion(raw.to_string()))?;
        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    pub fn build(&self) -> u32 {
        self.parts.last().copied().unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForgeStrategy {
    /// Single combined installer, run as a subprocess.
    Modern,
    /// Entries pulled straight out of the installer archive.
    Universal,
    Unsupported,
}

struct StrategyRule {
    strategy: ForgeStrategy,
    applies: fn(&GameVersion, &LoaderVersion) -> bool,
}

fn modern_format(game: &GameVersion, _loader: &LoaderVersion) -> bool {
    game.at_least(1, 13)
}

fn late_legacy_build(game: &GameVersion, loader: &LoaderVersion) -> bool {
    game.major == 1 && game.minor == 12 && loader.build() >= 2851
}

fn universal_range(game: &GameVersion, _loader: &LoaderVersion) -> bool {
    game.at_least(1, 5) && !game.at_least(1, 13)
}

/// Evaluated top to bottom; the first matching rule wins.
const FORGE_RULES: &[StrategyRule] = &[
    StrategyRule {
        strategy: ForgeStrategy::Modern,
        applies: modern_format,
    },
    StrategyRule {
        strategy: ForgeStrategy::Modern,
        applies: late_legacy_build,
    },
    StrategyRule {
        strategy: ForgeStrategy::Universal,
        applies: universal_range,
    },
];

pub fn select_forge_strategy(game: &GameVersion, loader: &LoaderVersion) -> ForgeStrategy {
    FORGE_RULES
        .iter()
        .find(|rule| (rule.applies)(game, loader))
        .map(|rule| rule.strategy)
        .unwrap_or(ForgeStrategy::Unsupported)
}

/// A forge version resolved against its game version.
#[derive(Debug, Clone)]
pub struct ForgePlan {
    pub game: GameVersion,
    pub loader: LoaderVersion,
    pub strategy: ForgeStrategy,
}

impl ForgePlan {
    pub fn resolve(game: GameVersion, loader: &str) -> Result<Self, LoaderError> {
        let loader = LoaderVersion::parse(loader)?;
        let strategy = select_forge_strategy(&game, &loader);
        Ok(Self {
            game,
            loader,
            strategy,
        })
    }

    /// `{game}-{loader}`, the form forge's maven and jars use.
    pub fn combined_version(&self) -> String {
        format!("{}-{}", self.game, self.loader.as_str())
    }

    pub fn installer_url(&self, maven_root: &str) -> String {
        let version = self.combined_version();
        format!(
            "{}/net/minecraftforge/forge/{version}/forge-{version}-installer.jar",
            maven_root.trim_end_matches('/')
        )
    }

    fn client_library(&self, root: &Path) -> PathBuf {
        let version = self.combined_version();
        root.join("libraries")
            .join("net")
            .join("minecraftforge")
            .join("forge")
            .join(&version)
            .join(format!("forge-{version}.jar"))
    }

    fn client_version_name(&self) -> String {
        format!("{}-forge{}", self.game, self.combined_version())
    }

    /// Final artifact whose presence means the install already happened.
    pub fn artifact_path(&self, target: InstallTarget, root: &Path) -> Option<PathBuf> {
        let version = self.combined_version();
        match (self.strategy, target) {
            (ForgeStrategy::Unsupported, _) => None,
            (_, InstallTarget::Client) => Some(self.client_library(root)),
            (ForgeStrategy::Modern, InstallTarget::Server) => {
                Some(root.join(format!("forge-{version}.jar")))
            }
            (ForgeStrategy::Universal, InstallTarget::Server) => {
                Some(root.join(format!("forge-{version}-universal.jar")))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderOutcome {
    Installed,
    AlreadyInstalled,
}

#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub maven_root: String,
    pub client_tool_jar: Option<PathBuf>,
    /// Where client loaders go; server loaders go into the pack destination.
    pub launcher_dir: PathBuf,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LauncherVersion<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    inherits_from: String,
}

pub struct LoaderInstaller<'a> {
    pub settings: &'a LoaderSettings,
    pub fetcher: &'a dyn FileFetcher,
    pub runner: &'a dyn NativeInstaller,
    pub client_archives: &'a dyn ClientArchives,
    pub cancel: &'a CancelToken,
}

impl LoaderInstaller<'_> {
    pub fn install(
        &self,
        component: &LoaderComponent,
        target: InstallTarget,
        destination: &Path,
        game_version: Option<&str>,
    ) -> Result<LoaderOutcome, LoaderError> {
        let game = GameVersion::parse(game_version.ok_or(LoaderError::MissingGameVersion)?)?;
        match component {
            LoaderComponent::Forge { version } => {
                let plan = ForgePlan::resolve(game, version)?;
                let root = match target {
                    InstallTarget::Client => self.settings.launcher_dir.clone(),
                    InstallTarget::Server => destination.to_path_buf(),
                };
                self.install_forge(&plan, target, &root)
            }
            LoaderComponent::ClientSplice {
                payload,
                version_name,
                version_json,
            } => {
                if target != InstallTarget::Client {
                    return Err(LoaderError::UnsupportedTarget {
                        component: component.label(),
                        target,
                    });
                }
                let payload = normalize_relative_path(payload)
                    .map(|payload| join_slash_path(destination, &payload))
                    .ok_or_else(|| LoaderError::MissingPayload(PathBuf::from(payload)))?;
                if version_name.is_empty()
                    || version_name.contains(['/', '\\'])
                    || version_name.starts_with('.')
                {
                    return Err(LoaderError::InvalidVersion(version_name.clone()));
                }
                let version_json = version_json
                    .as_deref()
                    .map(|raw| {
                        normalize_relative_path(raw)
                            .map(|path| join_slash_path(destination, &path))
                            .ok_or_else(|| LoaderError::LauncherDescriptor {
                                path: raw.to_string(),
                                reason: "path leaves the destination".to_string(),
                            })
                    })
                    .transpose()?;
                self.install_client_splice(&game, &payload, version_json.as_deref(), version_name)
            }
        }
    }

    fn install_forge(
        &self,
        plan: &ForgePlan,
        target: InstallTarget,
        root: &Path,
    ) -> Result<LoaderOutcome, LoaderError> {
        let Some(artifact) = plan.artifact_path(target, root) else {
            return Err(LoaderError::UnsupportedVersion {
                game: plan.game.to_string(),
                loader: plan.loader.as_str().to_string(),
            });
        };
        if artifact.exists() {
            info!(artifact = %artifact.display(), "forge {} already installed", plan.combined_version());
            return Ok(LoaderOutcome::AlreadyInstalled);
        }
        if plan.strategy == ForgeStrategy::Modern
            && target == InstallTarget::Client
            && self.settings.client_tool_jar.is_none()
        {
            return Err(LoaderError::MissingTool);
        }

        info!(
            "installing forge {} with the {:?} procedure",
            plan.combined_version(),
            plan.strategy
        );
        let url = plan.installer_url(&self.settings.maven_root);
        let installer = fetch::fetch_to_temp(self.fetcher, &url, None, self.cancel)?;
        fs::create_dir_all(root)?;

        if plan.strategy == ForgeStrategy::Modern {
            self.run_modern(target, root, installer.path())?;
        } else {
            extract_universal(plan, target, root, installer.path())?;
        }
        Ok(LoaderOutcome::Installed)
    }

    fn run_modern(
        &self,
        target: InstallTarget,
        root: &Path,
        installer: &Path,
    ) -> Result<(), LoaderError> {
        let mut args: Vec<OsString> = Vec::new();
        match target {
            InstallTarget::Client => {
                let tool = self
                    .settings
                    .client_tool_jar
                    .as_ref()
                    .ok_or(LoaderError::MissingTool)?;
                args.push("-cp".into());
                args.push(build_classpath([tool.as_os_str(), installer.as_os_str()])?);
                args.push(FORGE_CLIENT_TOOL_CLASS.into());
                args.push(root.as_os_str().to_os_string());
            }
            InstallTarget::Server => {
                args.push("-jar".into());
                args.push(installer.as_os_str().to_os_string());
                args.push("--installServer".into());
                args.push(root.as_os_str().to_os_string());
            }
        }
        match self.runner.run(&args)? {
            Some(0) => Ok(()),
            code => Err(LoaderError::ExitStatus(code)),
        }
    }

    fn install_client_splice(
        &self,
        game: &GameVersion,
        payload: &Path,
        version_json: Option<&Path>,
        version_name: &str,
    ) -> Result<LoaderOutcome, LoaderError> {
        let version_dir = self.settings.launcher_dir.join("versions").join(version_name);
        let output = version_dir.join(format!("{version_name}.jar"));
        if output.exists() {
            info!(artifact = %output.display(), "version {version_name} already installed");
            return Ok(LoaderOutcome::AlreadyInstalled);
        }
        if !payload.is_file() {
            return Err(LoaderError::MissingPayload(payload.to_path_buf()));
        }

        let remote = self
            .client_archives
            .client_archive(game)
            .map_err(|err| LoaderError::ClientArchive {
                game: game.to_string(),
                reason: format!("{err:#}"),
            })?;
        info!("splicing {} over the {game} client", payload.display());
        let expected = remote
            .sha1
            .as_ref()
            .map(|digest| (DigestAlgorithm::Sha1, digest));
        let client = fetch::fetch_to_temp(self.fetcher, &remote.url, expected, self.cancel)?;

        fs::create_dir_all(&version_dir)?;
        let descriptor = version_dir.join(format!("{version_name}.json"));
        if !descriptor.exists() {
            let raw = match version_json.filter(|path| path.is_file()) {
                Some(shipped) => rename_launcher_descriptor(shipped, version_name)?,
                None => {
                    let version = LauncherVersion {
                        id: version_name,
                        kind: "release",
                        inherits_from: game.to_string(),
                    };
                    serde_json::to_string_pretty(&version)
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?
                }
            };
            fs::write(&descriptor, raw)?;
        }
        archive::splice_client_archive(&output, payload, client.path())?;
        Ok(LoaderOutcome::Installed)
    }
}

/// Pack-supplied launcher descriptor with its `id` replaced by `version_name`.
fn rename_launcher_descriptor(shipped: &Path, version_name: &str) -> Result<String, LoaderError> {
    let invalid = |reason: String| LoaderError::LauncherDescriptor {
        path: shipped.display().to_string(),
        reason,
    };
    let mut profile: serde_json::Value =
        serde_json::from_slice(&fs::read(shipped)?).map_err(|err| invalid(err.to_string()))?;
    let Some(fields) = profile.as_object_mut() else {
        return Err(invalid("not a JSON object".to_string()));
    };
    fields.insert("id".to_string(), version_name.into());
    serde_json::to_string_pretty(&profile).map_err(|err| invalid(err.to_string()))
}

fn extract_universal(
    plan: &ForgePlan,
    target: InstallTarget,
    root: &Path,
    installer: &Path,
) -> Result<(), LoaderError> {
    let version = plan.combined_version();
    let mut archive = ZipArchive::new(fs::File::open(installer)?).map_err(ArchiveError::from)?;
    let profile: serde_json::Value =
        serde_json::from_slice(&archive::read_entry(&mut archive, INSTALL_PROFILE)?)
            .map_err(|err| LoaderError::InstallProfile(err.to_string()))?;
    let version_info = profile
        .get("versionInfo")
        .filter(|value| value.is_object())
        .ok_or_else(|| LoaderError::InstallProfile("missing versionInfo".to_string()))?;
    let descriptor = serde_json::to_string_pretty(version_info)
        .map_err(|err| LoaderError::InstallProfile(err.to_string()))?;

    let universal = format!("forge-{version}-universal.jar");
    let (descriptor_path, library_path) = match target {
        InstallTarget::Client => {
            let name = plan.client_version_name();
            let version_dir = root.join("versions").join(&name);
            (
                version_dir.join(format!("{name}.json")),
                plan.client_library(root),
            )
        }
        InstallTarget::Server => (
            root.join(format!("forge-{version}-universal.json")),
            root.join(&universal),
        ),
    };

    if let Some(parent) = descriptor_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&descriptor_path, descriptor)?;

    // The library is the idempotence marker, so it only appears once whole.
    let partial = library_path.with_extension("jar.part");
    let placed = archive::extract_entry(&mut archive, &universal, &partial)
        .map_err(LoaderError::from)
        .and_then(|()| fs::rename(&partial, &library_path).map_err(LoaderError::from));
    if placed.is_err() {
        let _ = fs::remove_file(&partial);
    }
    placed
}
