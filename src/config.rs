//! Directory layout for the prefix, cellar and caches.
//!
//! Every path the engine touches is derived from one [`Paths`] value that is
//! resolved once per process (or built explicitly by library callers and tests):
//!
//! ```text
//! <prefix>/
//!   Cellar/<name>/<version>/     kegs
//!   bin/ lib/ share/ ...         symlink farm into kegs
//!   opt/<name>                   version-independent keg pointer
//!   var/brewkit/linked/<name>    record of the currently linked keg
//!   var/brewkit/locks/           advisory per-formula locks
//! ```
//!
//! Environment overrides:
//! - `BREWKIT_PREFIX`, `BREWKIT_CELLAR`
//! - `BREWKIT_CACHE`, `BREWKIT_LOGS`, `BREWKIT_TEMP`

use std::path::{Path, PathBuf};

/// Resolved directory layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub prefix: PathBuf,
    pub cellar: PathBuf,
    pub cache: PathBuf,
    pub logs: PathBuf,
    pub temp: PathBuf,
}

impl Paths {
    /// Resolve the layout from the environment, falling back to platform defaults
    pub fn from_env() -> Self {
        let prefix = env_path("BREWKIT_PREFIX").unwrap_or_else(default_prefix);
        let cellar = env_path("BREWKIT_CELLAR").unwrap_or_else(|| prefix.join("Cellar"));
        let home = env_path("HOME").unwrap_or_else(|| PathBuf::from("."));
        let cache =
            env_path("BREWKIT_CACHE").unwrap_or_else(|| home.join(".cache/brewkit/downloads"));
        let logs = env_path("BREWKIT_LOGS").unwrap_or_else(|| home.join(".cache/brewkit/logs"));
        let temp = env_path("BREWKIT_TEMP").unwrap_or_else(|| PathBuf::from("/tmp"));

        Self {
            prefix,
            cellar,
            cache,
            logs,
            temp,
        }
    }

    /// A self-contained layout with everything under `prefix`
    pub fn with_prefix(prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        Self {
            cellar: prefix.join("Cellar"),
            cache: prefix.join("var/brewkit/cache"),
            logs: prefix.join("var/brewkit/logs"),
            temp: prefix.join("var/brewkit/tmp"),
            prefix,
        }
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.prefix.join("opt")
    }

    pub fn opt_record(&self, name: &str) -> PathBuf {
        self.opt_dir().join(name)
    }

    pub fn linked_dir(&self) -> PathBuf {
        self.prefix.join("var/brewkit/linked")
    }

    pub fn linked_record(&self, name: &str) -> PathBuf {
        self.linked_dir().join(name)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.prefix.join("var/brewkit/locks")
    }

    pub fn rack(&self, name: &str) -> PathBuf {
        self.cellar.join(name)
    }

    pub fn keg_path(&self, name: &str, version: &str) -> PathBuf {
        self.rack(name).join(version)
    }

    pub fn formula_logs(&self, name: &str) -> PathBuf {
        self.logs.join(name)
    }

    /// Whether `path` lies inside the cellar
    pub fn in_cellar(&self, path: &Path) -> bool {
        path.starts_with(&self.cellar)
    }

    pub fn prefix_str(&self) -> String {
        self.prefix.to_string_lossy().into_owned()
    }

    pub fn cellar_str(&self) -> String {
        self.cellar.to_string_lossy().into_owned()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var_os(var)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn default_prefix() -> PathBuf {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    {
        PathBuf::from("/opt/homebrew")
    }
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    {
        PathBuf::from("/usr/local")
    }
}
