use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, IoContext, Result};

/// Immutable engine configuration.
///
/// Built once at startup — from defaults, optionally a TOML file, and the
/// environment — and then threaded through the store and the worker.
/// Nothing mutates it during a run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the store paths themselves.
    pub store_dir: PathBuf,

    /// Read-only data directory.
    pub data_dir: PathBuf,

    /// Mutable state: the metadata database, GC roots, temp roots.
    pub state_dir: PathBuf,

    /// Per-build log files.
    pub log_dir: PathBuf,

    /// Metadata database directory; defaults to `<state_dir>/db`.
    pub db_dir: PathBuf,

    /// Configuration directory.
    pub conf_dir: PathBuf,

    /// Platform this coordinator builds for, e.g. `x86_64-linux`.
    pub platform: String,

    /// Maximum number of concurrent build/substituter slots.
    pub max_build_jobs: u32,

    /// Keep realising sibling goals after a failure.
    pub keep_going: bool,

    /// Build locally when a substitute fails instead of giving up.
    pub try_fallback: bool,

    /// Keep the temporary directory of a failed build for inspection.
    pub keep_failed: bool,

    /// Mirror builder log output onto the coordinator's stderr.
    pub print_build_output: bool,

    /// External build hook consulted before every local build.
    pub build_hook: Option<PathBuf>,

    /// Directory the distributed hook uses for load/slot files.
    pub current_load_dir: Option<PathBuf>,

    /// Remote machines file for the distributed hook.
    pub remote_systems_file: Option<PathBuf>,

    /// Alternate local stores to substitute from, searched in order.
    pub other_stores: Vec<PathBuf>,

    /// Seconds without builder output after which a *remote* driver may
    /// kill a build. The local driver records but does not enforce it.
    pub max_silent_time: Option<u64>,

    /// Allow the store directory to be reached through symlinks.
    pub ignore_symlink_store: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let state_dir = PathBuf::from("/nix/var/nix");
        Settings {
            store_dir: PathBuf::from("/nix/store"),
            data_dir: PathBuf::from("/nix/share"),
            log_dir: PathBuf::from("/nix/var/log/nix"),
            db_dir: state_dir.join("db"),
            conf_dir: PathBuf::from("/etc/nix"),
            state_dir,
            platform: default_platform(),
            max_build_jobs: 1,
            keep_going: false,
            try_fallback: false,
            keep_failed: false,
            print_build_output: false,
            build_hook: None,
            current_load_dir: None,
            remote_systems_file: None,
            other_stores: Vec::new(),
            max_silent_time: None,
            ignore_symlink_store: false,
        }
    }
}

fn default_platform() -> String {
    format!("{}-{}", env::consts::ARCH, env::consts::OS)
}

impl Settings {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Settings {
        let mut settings = Settings::default();
        settings.apply_env();
        settings
    }

    /// TOML file overridden by the environment.
    pub fn from_file(path: &Path) -> Result<Settings> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("cannot read configuration file `{}`", path.display()))?;
        let mut settings: Settings = toml::from_str(&contents)
            .map_err(|e| Error::Usage(format!("cannot parse `{}`: {e}", path.display())))?;
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Some(dir) = env_path("NIX_STORE_DIR") {
            self.store_dir = dir;
        }
        if let Some(dir) = env_path("NIX_DATA_DIR") {
            self.data_dir = dir;
        }
        if let Some(dir) = env_path("NIX_STATE_DIR") {
            self.db_dir = dir.join("db");
            self.state_dir = dir;
        }
        if let Some(dir) = env_path("NIX_LOG_DIR") {
            self.log_dir = dir;
        }
        if let Some(dir) = env_path("NIX_DB_DIR") {
            self.db_dir = dir;
        }
        if let Some(dir) = env_path("NIX_CONF_DIR") {
            self.conf_dir = dir;
        }
        // An empty NIX_BUILD_HOOK disables the hook.
        if let Ok(hook) = env::var("NIX_BUILD_HOOK") {
            self.build_hook = if hook.is_empty() {
                None
            } else {
                Some(PathBuf::from(hook))
            };
        }
        if let Some(dir) = env_path("NIX_CURRENT_LOAD") {
            self.current_load_dir = Some(dir);
        }
        if let Some(file) = env_path("NIX_REMOTE_SYSTEMS") {
            self.remote_systems_file = Some(file);
        }
        if let Ok(stores) = env::var("NIX_OTHER_STORES") {
            self.other_stores = stores
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if env::var_os("NIX_IGNORE_SYMLINK_STORE").is_some() {
            self.ignore_symlink_store = true;
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}
