use crate::{catalog::MODPACKS_API, loader::LoaderSettings, reconcile::InstallerConfig};
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};

pub const DEFAULT_MAVEN_ROOT: &str = "https://maven.minecraftforge.net";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,
    #[serde(default = "default_data_dir_name")]
    pub data_dir_name: String,
    #[serde(default = "default_java")]
    pub java: PathBuf,
    #[serde(default = "default_maven_root")]
    pub maven_root: String,
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Overrides the detected game launcher directory.
    #[serde(default)]
    pub launcher_dir: Option<PathBuf>,
    /// Helper jar that drives modern forge installers for client installs.
    #[serde(default)]
    pub client_tool_jar: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            excluded_dirs: default_excluded_dirs(),
            data_dir_name: default_data_dir_name(),
            java: default_java(),
            maven_root: default_maven_root(),
            catalog_url: default_catalog_url(),
            user_agent: default_user_agent(),
            launcher_dir: None,
            client_tool_jar: None,
        }
    }
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let base_dir = base_data_dir()?;
        fs::create_dir_all(&base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn installer_config(&self) -> Result<InstallerConfig> {
        let launcher_dir = match &self.launcher_dir {
            Some(dir) => dir.clone(),
            None => detect_launcher_dir()?,
        };
        Ok(InstallerConfig {
            max_workers: self.max_workers.max(1),
            excluded_dirs: self.excluded_dirs.clone(),
            data_dir_name: self.data_dir_name.clone(),
            loader: LoaderSettings {
                maven_root: self.maven_root.clone(),
                client_tool_jar: self.client_tool_jar.clone(),
                launcher_dir,
            },
        })
    }
}

/// Default game launcher directory for this platform.
pub fn detect_launcher_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    let dir = if cfg!(windows) {
        base.config_dir().join(".minecraft")
    } else if cfg!(target_os = "macos") {
        base.data_dir().join("minecraft")
    } else {
        base.home_dir().join(".minecraft")
    };
    Ok(dir)
}

fn default_max_workers() -> usize {
    8
}

fn default_excluded_dirs() -> Vec<String> {
    vec!["saves".to_string()]
}

fn default_data_dir_name() -> String {
    ".packsmith".to_string()
}

fn default_java() -> PathBuf {
    PathBuf::from("java")
}

fn default_maven_root() -> String {
    DEFAULT_MAVEN_ROOT.to_string()
}

fn default_catalog_url() -> String {
    MODPACKS_API.to_string()
}

fn default_user_agent() -> String {
    format!("packsmith/{}", env!("CARGO_PKG_VERSION"))
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("packsmith"))
}
