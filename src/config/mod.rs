use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

const DEFAULT_LISTEN_PORT: u16 = 8080;
const DEFAULT_ADDRESS: &str = "0.0.0.0";
const DEFAULT_CACHE_FOLDER: &str = "cache";
const DEFAULT_CACHE_TMP_FOLDER: &str = "tmp";
const DEFAULT_UPDATE_INTERVAL: u64 = 3;
const DEFAULT_MAX_CACHE_SIZE: usize = 0; // 0 = unlimited
const DEFAULT_IMAGE_QUALITY: u8 = 60;
const DEFAULT_REQUEST_TIMEOUT: u64 = 30;
const DEFAULT_REMOTES: [&str; 2] = [
    "https://api.nyan.xyz/httpapi/sexphoto",
    "https://loliapi.com/acg",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file error ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Config parse error ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Never fetch remotely while the cache can serve.
    Local,
    /// Fetch-eligible, subject to the update interval.
    Remote,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => write!(f, "local"),
            Mode::Remote => write!(f, "remote"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppConfig {
    pub listen_port: u16,
    pub address: String,
    pub log_file_name: String,
    pub mode: Mode,
    pub cache_folder: String,
    pub cache_tmp_folder: String,
    pub update_interval: u64,
    pub max_cache_size: usize,
    pub image_quality: u8,
    pub request_timeout: u64,
    pub remotes: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            address: DEFAULT_ADDRESS.to_string(),
            log_file_name: String::new(),
            mode: Mode::Remote,
            cache_folder: DEFAULT_CACHE_FOLDER.to_string(),
            cache_tmp_folder: DEFAULT_CACHE_TMP_FOLDER.to_string(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            image_quality: DEFAULT_IMAGE_QUALITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            remotes: DEFAULT_REMOTES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

// On-disk shape. Every field is optional and loosely typed so that a bad value
// is replaced by its default instead of rejecting the whole file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct RawConfig {
    listen_port: Option<i64>,
    address: Option<String>,
    log_file_name: Option<String>,
    mode: Option<String>,
    cache_folder: Option<String>,
    cache_tmp_folder: Option<String>,
    update_interval: Option<i64>,
    max_cache_size: Option<i64>,
    image_quality: Option<i64>,
    request_timeout: Option<i64>,
    remotes: Option<Vec<String>>,
}

fn is_single_segment(folder: &str) -> bool {
    !folder.is_empty()
        && folder != "."
        && folder != ".."
        && !folder.contains(['/', '\\'])
}

impl AppConfig {
    /// Builds a config from the raw file contents, replacing every missing or
    /// out-of-range field with its default. Returns one warning per replaced
    /// field.
    fn from_raw(raw: RawConfig) -> (Self, Vec<String>) {
        let defaults = AppConfig::default();
        let mut config = defaults.clone();
        let mut warnings = Vec::new();

        match raw.listen_port {
            Some(port) if (1024..=65535).contains(&port) => config.listen_port = port as u16,
            _ => warnings.push(format!(
                "ListenPort out of range, using default value {}",
                defaults.listen_port
            )),
        }

        match raw.address {
            Some(address) if !address.trim().is_empty() => config.address = address,
            _ => warnings.push(format!(
                "Address is empty, using default value {}",
                defaults.address
            )),
        }

        match raw.log_file_name {
            Some(name) if !name.is_empty() => config.log_file_name = name,
            _ => warnings.push("LogFileName is empty, disabling log file".to_string()),
        }

        match raw.mode.as_deref() {
            Some("local") => config.mode = Mode::Local,
            Some("remote") => config.mode = Mode::Remote,
            _ => warnings.push(format!("Mode invalid, using default value {}", defaults.mode)),
        }

        match raw.cache_folder {
            Some(folder) if is_single_segment(&folder) => config.cache_folder = folder,
            _ => warnings.push(format!(
                "CacheFolder invalid, using default value {}",
                defaults.cache_folder
            )),
        }

        match raw.cache_tmp_folder {
            Some(folder) if is_single_segment(&folder) => config.cache_tmp_folder = folder,
            _ => warnings.push(format!(
                "CacheTmpFolder invalid, using default value {}",
                defaults.cache_tmp_folder
            )),
        }

        match raw.update_interval {
            Some(interval) if interval > 0 => config.update_interval = interval as u64,
            _ => warnings.push(format!(
                "UpdateInterval out of range, using default value {}",
                defaults.update_interval
            )),
        }

        match raw.max_cache_size {
            Some(size) if size >= 0 => config.max_cache_size = size as usize,
            _ => warnings.push(format!(
                "MaxCacheSize out of range, using default value {}",
                defaults.max_cache_size
            )),
        }

        match raw.image_quality {
            Some(quality) if (1..=100).contains(&quality) => config.image_quality = quality as u8,
            _ => warnings.push(format!(
                "ImageQuality out of range, using default value {}",
                defaults.image_quality
            )),
        }

        match raw.request_timeout {
            Some(timeout) if timeout > 0 => config.request_timeout = timeout as u64,
            _ => warnings.push(format!(
                "RequestTimeout out of range, using default value {}",
                defaults.request_timeout
            )),
        }

        match raw.remotes {
            Some(remotes) if !remotes.is_empty() => config.remotes = remotes,
            _ => warnings.push(format!(
                "Remotes invalid, using default value [{}]",
                defaults.remotes.join(", ")
            )),
        }

        (config, warnings)
    }

    /// Pretty JSON rendering used when logging the active configuration.
    pub fn to_pretty_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Owns the config file and the active, validated configuration.
pub struct ConfigStore {
    path: PathBuf,
    base_dir: PathBuf,
    current: RwLock<AppConfig>,
}

impl ConfigStore {
    /// Reads the config file (creating it with defaults if absent), normalises
    /// it, and writes it back. Returns the store together with the validation
    /// warnings so the caller can log them once logging is set up.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Self, Vec<String>), ConfigError> {
        let path = path.into();
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let (config, warnings) = Self::load(&path)?;
        write_config(&path, &config)?;

        let store = Self {
            path,
            base_dir,
            current: RwLock::new(config),
        };
        Ok((store, warnings))
    }

    fn load(path: &Path) -> Result<(AppConfig, Vec<String>), ConfigError> {
        let raw = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<RawConfig>(&bytes).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No config file found at {}, creating one", path.display());
                return Ok((AppConfig::default(), Vec::new()));
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        info!("Config file found at {}", path.display());
        Ok(AppConfig::from_raw(raw))
    }

    /// Re-reads the file from disk. On failure the previous config stays active.
    pub fn reload(&self) -> Result<AppConfig, ConfigError> {
        let (config, warnings) = Self::load(&self.path)?;
        for warning in &warnings {
            warn!("{}", warning);
        }

        let mut current = self.current.write();
        write_config(&self.path, &config)?;
        *current = config.clone();
        info!("Reloaded config:\n{}", config.to_pretty_string());
        Ok(config)
    }

    pub fn snapshot(&self) -> AppConfig {
        self.current.read().clone()
    }

    /// Switches to local mode and persists the change. The write lock is held
    /// across the file write so a concurrent reload cannot interleave.
    pub fn switch_to_local(&self) -> Result<(), ConfigError> {
        let mut current = self.current.write();
        if current.mode == Mode::Local {
            return Ok(());
        }
        let mut updated = current.clone();
        updated.mode = Mode::Local;
        write_config(&self.path, &updated)?;
        *current = updated;
        Ok(())
    }

    /// Directory relative folder paths in the config resolve against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let mut json = serde_json::to_vec_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    json.push(b'\n');
    fs::write(path, json).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
