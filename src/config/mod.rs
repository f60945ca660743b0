//! App registry (`config.toml`) and service settings.
//!
//! The registry maps app names to an executable path plus default launch
//! arguments. Declaration order in the file is the user-visible order
//! (`list`, tray menus) and survives load/save round trips.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50505";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config format: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("app '{name}' is invalid: {reason}")]
    InvalidApp { name: String, reason: String },

    #[error("app '{0}' already exists")]
    AppExists(String),

    #[error("app '{0}' not found")]
    AppNotFound(String),
}

/// A registered build of the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSpec {
    pub name: String,
    pub path: String,
    pub args: Vec<String>,
}

/// Service knobs, read from the optional `[service]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub listen_addr: String,
    /// 0 disables idle exit
    pub idle_exit_secs: u64,
    pub kill_poll_interval_ms: u64,
    pub kill_timeout_ms: u64,
    pub restart_confirm_retries: u32,
    pub adopt_poll_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub clear_discovered_args_on_switch: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            idle_exit_secs: 60,
            kill_poll_interval_ms: 100,
            kill_timeout_ms: 5_000,
            restart_confirm_retries: 40,
            adopt_poll_interval_ms: 1_000,
            read_timeout_ms: 10_000,
            clear_discovered_args_on_switch: false,
        }
    }
}

impl ServiceSettings {
    /// Apply `EVS_LISTEN_ADDR` / `EVS_IDLE_EXIT_SECS` on top of the file values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("EVS_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr.trim().to_string();
            }
        }
        if let Ok(secs) = std::env::var("EVS_IDLE_EXIT_SECS") {
            match secs.trim().parse::<u64>() {
                Ok(v) => self.idle_exit_secs = v,
                Err(e) => tracing::warn!("Ignoring EVS_IDLE_EXIT_SECS='{}': {}", secs, e),
            }
        }
        self
    }

    pub fn idle_exit_grace(&self) -> Option<Duration> {
        (self.idle_exit_secs > 0).then(|| Duration::from_secs(self.idle_exit_secs))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Deserialize)]
struct RawRegistry {
    #[serde(default)]
    activate: String,
    // preserve_order: toml::Table iterates in declaration order
    #[serde(default)]
    apps: toml::Table,
    #[serde(default)]
    service: Option<ServiceSettings>,
}

#[derive(Serialize, Deserialize)]
struct RawApp {
    path: String,
    #[serde(default)]
    args: Vec<String>,
}

/// One loaded snapshot of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    pub activate: String,
    apps: Vec<AppSpec>,
    service: Option<ServiceSettings>,
}

impl Registry {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawRegistry = toml::from_str(text)?;
        let mut apps = Vec::with_capacity(raw.apps.len());
        for (name, value) in raw.apps {
            let app = value.try_into::<RawApp>().map_err(|e| ConfigError::InvalidApp {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            apps.push(AppSpec {
                name,
                path: app.path,
                args: app.args,
            });
        }
        Ok(Self {
            activate: raw.activate,
            apps,
            service: raw.service,
        })
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        let mut apps = toml::Table::new();
        for app in &self.apps {
            let raw = RawApp {
                path: app.path.clone(),
                args: app.args.clone(),
            };
            apps.insert(app.name.clone(), toml::Value::try_from(raw)?);
        }

        let mut root = toml::Table::new();
        root.insert("activate".into(), toml::Value::String(self.activate.clone()));
        root.insert("apps".into(), toml::Value::Table(apps));
        if let Some(service) = &self.service {
            root.insert("service".into(), toml::Value::try_from(service)?);
        }
        Ok(toml::to_string_pretty(&root)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, name: &str) -> Option<&AppSpec> {
        self.apps.iter().find(|a| a.name == name)
    }

    pub fn active(&self) -> Option<&AppSpec> {
        self.get(&self.activate)
    }

    /// Apps in declaration order.
    pub fn apps(&self) -> &[AppSpec] {
        &self.apps
    }

    pub fn app_order(&self) -> Vec<String> {
        self.apps.iter().map(|a| a.name.clone()).collect()
    }

    pub fn settings(&self) -> ServiceSettings {
        self.service.clone().unwrap_or_default()
    }

    pub fn add(&mut self, app: AppSpec) -> Result<(), ConfigError> {
        if app.name.trim().is_empty() {
            return Err(ConfigError::InvalidApp {
                name: app.name,
                reason: "empty name".into(),
            });
        }
        if self.get(&app.name).is_some() {
            return Err(ConfigError::AppExists(app.name));
        }
        self.apps.push(app);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<AppSpec, ConfigError> {
        let pos = self
            .apps
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| ConfigError::AppNotFound(name.to_string()))?;
        Ok(self.apps.remove(pos))
    }

    pub fn set_active(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.get(name).is_none() {
            return Err(ConfigError::AppNotFound(name.to_string()));
        }
        self.activate = name.to_string();
        Ok(())
    }
}

/// Resolve the registry file: `EVS_CONFIG` or `config.toml`.
/// A relative path missing from the working directory is also looked up
/// in the parent directory.
pub fn config_path() -> PathBuf {
    let configured = std::env::var("EVS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    resolve_config_path(Path::new(&configured))
}

pub fn resolve_config_path(path: &Path) -> PathBuf {
    if path.exists() || path.is_absolute() {
        return path.to_path_buf();
    }
    if let Ok(cwd) = std::env::current_dir() {
        if let Some(parent) = cwd.parent() {
            let candidate = parent.join(path);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    path.to_path_buf()
}

#[derive(Default)]
struct StoreInner {
    snapshot: Option<Arc<Registry>>,
    stamp: Option<FileStamp>,
}

/// 파일 변경 감지용. mtime 해상도가 낮은 파일시스템을 위해 길이도 비교
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Hot-reloadable holder of the current registry snapshot.
///
/// Readers get an `Arc<Registry>`; a reload replaces the snapshot
/// wholesale. A failed reload keeps the previous snapshot.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<StoreInner>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Option<Arc<Registry>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).snapshot.clone()
    }

    /// Re-read the file if its modification time or size changed.
    /// Returns `true` when a new snapshot was installed.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let stamp = self.file_stamp()?;
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if inner.snapshot.is_some() && stamp.modified.is_some() && inner.stamp == Some(stamp) {
                return Ok(false);
            }
        }
        self.load_into_cache(stamp)?;
        Ok(true)
    }

    /// Re-read the file unconditionally.
    pub fn force_reload(&self) -> Result<(), ConfigError> {
        let stamp = self.file_stamp()?;
        self.load_into_cache(stamp)
    }

    /// Persist a new active app name and install the updated snapshot.
    ///
    /// The file is re-read first so apps added or removed by another
    /// writer since the last load survive the save.
    pub fn set_active(&self, name: &str) -> Result<(), ConfigError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut registry = match Registry::load(&self.path) {
            Ok(registry) => registry,
            // 파일이 지워졌으면 캐시로 다시 만듦
            Err(ConfigError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => inner
                .snapshot
                .as_deref()
                .cloned()
                .ok_or_else(|| ConfigError::AppNotFound(name.to_string()))?,
            Err(e) => return Err(e),
        };
        registry.set_active(name)?;
        registry.save(&self.path)?;
        inner.stamp = self.file_stamp().ok();
        inner.snapshot = Some(Arc::new(registry));
        tracing::info!("Active app persisted as '{}' in {}", name, self.path.display());
        Ok(())
    }

    fn file_stamp(&self) -> Result<FileStamp, ConfigError> {
        let meta = std::fs::metadata(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }

    fn load_into_cache(&self, stamp: FileStamp) -> Result<(), ConfigError> {
        let registry = Registry::load(&self.path)?;
        tracing::info!(
            "Loaded {} apps from {} (active: '{}')",
            registry.apps().len(),
            self.path.display(),
            registry.activate
        );
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.snapshot = Some(Arc::new(registry));
        inner.stamp = Some(stamp);
        Ok(())
    }
}
