//! Install receipts ("tabs").
//!
//! Every keg carries an `INSTALL_RECEIPT.json` describing how it got there:
//!
//! ```text
//! <cellar>/wget/1.24.5/
//!   INSTALL_RECEIPT.json     # options, build vs pour, provenance
//!   bin/
//!   share/
//! ```
//!
//! The receipt is what later installs consult to decide whether an installed
//! dependency was built with the options a dependent asks for.

use crate::error::{BrewError, Result};
use crate::options::BuildOptions;
use crate::platform;
use crate::recipe::{ActiveSpec, Recipe, SpecKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// A runtime dependency as resolved at install time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeDependency {
    pub full_name: String,
    pub pkg_version: String,
}

/// Where the keg's recipe came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Which spec was installed: stable, devel, head or bottle
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
}

/// Install receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub built_with: String,
    #[serde(default)]
    pub used_options: Vec<String>,
    #[serde(default)]
    pub unused_options: Vec<String>,
    #[serde(default)]
    pub built_as_bottle: bool,
    #[serde(default)]
    pub poured_from_bottle: bool,
    #[serde(default)]
    pub installed_as_dependency: bool,
    #[serde(default)]
    pub installed_on_request: bool,
    /// Unix timestamp
    pub time: i64,
    #[serde(default)]
    pub runtime_dependencies: Vec<RuntimeDependency>,
    pub source: SourceInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl InstallReceipt {
    /// Receipt for a keg about to be built or poured
    pub fn new(
        recipe: &Recipe,
        active: &ActiveSpec<'_>,
        options: &BuildOptions,
        poured: bool,
        installed_on_request: bool,
    ) -> Self {
        let tap = recipe.name.rsplit_once('/').map(|(tap, _)| tap.to_string());

        Self {
            built_with: format!("brewkit/{}", env!("CARGO_PKG_VERSION")),
            used_options: options.used_options(),
            unused_options: options.unused_options(),
            built_as_bottle: poured,
            poured_from_bottle: poured,
            installed_as_dependency: !installed_on_request,
            installed_on_request,
            time: chrono::Utc::now().timestamp(),
            runtime_dependencies: Vec::new(),
            source: SourceInfo {
                spec: match active.kind {
                    SpecKind::Bottle => SpecKind::Stable.to_string(),
                    kind => kind.to_string(),
                },
                path: recipe
                    .path
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                tap,
            },
            arch: Some(platform::homebrew_arch().to_string()),
        }
    }

    pub fn read(keg: &Path) -> Result<Self> {
        let path = keg.join(RECEIPT_FILE);
        let contents = fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => BrewError::NoSuchKeg(keg.to_path_buf()),
            _ => BrewError::IoError(e),
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn write(&self, keg: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(keg.join(RECEIPT_FILE), json)?;
        Ok(())
    }

    pub fn with_runtime_dependencies(mut self, deps: Vec<RuntimeDependency>) -> Self {
        self.runtime_dependencies = deps;
        self
    }

    pub fn is_used(&self, option: &str) -> bool {
        self.used_options.iter().any(|o| o == option)
    }

    /// Requested options this keg was not built with
    pub fn missing_options<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        requested
            .iter()
            .map(String::as_str)
            .filter(|o| !self.is_used(o))
            .collect()
    }

    /// The receipt's used options as build options for `recipe`
    pub fn build_options(&self, recipe: &Recipe) -> BuildOptions {
        recipe.build_options(&self.used_options)
    }

    /// Receipt-less kegs (installed by other tools, or damaged) are treated
    /// as plain stable installs with no options
    pub fn read_or_default(keg: &Path) -> Self {
        Self::read(keg).unwrap_or_else(|_| Self {
            built_with: String::new(),
            used_options: Vec::new(),
            unused_options: Vec::new(),
            built_as_bottle: false,
            poured_from_bottle: false,
            installed_as_dependency: false,
            installed_on_request: true,
            time: 0,
            runtime_dependencies: Vec::new(),
            source: SourceInfo {
                spec: SpecKind::Stable.to_string(),
                path: None,
                tap: None,
            },
            arch: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::SpecRequest;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let recipe = Recipe::new("wget", "https://example.com/wget-1.0.tgz", "1.0");
        let active = recipe.active_spec(SpecRequest::default(), false).unwrap();
        let options = recipe.build_options(Vec::<String>::new());

        let receipt = InstallReceipt::new(&recipe, &active, &options, false, true)
            .with_runtime_dependencies(vec![RuntimeDependency {
                full_name: "openssl".to_string(),
                pkg_version: "3.0".to_string(),
            }]);
        receipt.write(tmp.path()).unwrap();

        let read = InstallReceipt::read(tmp.path()).unwrap();
        assert_eq!(read, receipt);
        assert_eq!(read.source.spec, "stable");
        assert!(read.installed_on_request);
        assert!(!read.poured_from_bottle);
    }

    #[test]
    fn test_missing_options() {
        let tmp = TempDir::new().unwrap();
        let mut receipt = InstallReceipt::read_or_default(tmp.path());
        receipt.used_options = vec!["with-ssl".to_string()];

        let requested = vec!["with-ssl".to_string(), "with-ipv6".to_string()];
        assert_eq!(receipt.missing_options(&requested), vec!["with-ipv6"]);
    }

    #[test]
    fn test_missing_receipt_is_no_such_keg() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            InstallReceipt::read(tmp.path()),
            Err(BrewError::NoSuchKeg(_))
        ));
    }

    #[test]
    fn test_tolerates_unknown_fields() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join(RECEIPT_FILE),
            r#"{"built_with":"other","time":1,"source":{"spec":"head"},"compiler":"clang"}"#,
        )
        .unwrap();
        let receipt = InstallReceipt::read(tmp.path()).unwrap();
        assert_eq!(receipt.source.spec, "head");
        assert!(receipt.used_options.is_empty());
    }
}
