//! Bottles: precompiled kegs, per platform tag.
//!
//! A recipe's [`BottleSpec`] lists one sha256 per platform tag plus the
//! prefix and cellar its binaries were built against. Lookup for the host tag
//! falls back in this order:
//!
//! 1. the exact tag (`arm64_sonoma`)
//! 2. the generic Altivec tag for PowerPC hosts (`tiger_g4e` → `tiger_altivec`)
//! 3. the newest `X_or_later` tag whose OS version is not newer than the host
//! 4. `all`
//!
//! [`bake_bottle`] goes the other way and archives an installed keg.

use crate::config::Paths;
use crate::download;
use crate::error::Result;
use crate::keg::Keg;
use crate::linkage::LinkageTool;
use crate::platform::BottleTag;
use crate::relocate;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DEFAULT_PREFIX: &str = "/usr/local";
pub const DEFAULT_CELLAR: &str = "/usr/local/Cellar";
pub const DEFAULT_ROOT_URL: &str = "https://ghcr.io/v2/homebrew/core";

/// Where a bottle may be poured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BottleCellar {
    /// Relocatable into any cellar
    Any,
    /// Relocatable, and contains no paths at all
    AnySkipRelocation,
    /// Only pourable into this exact cellar
    Path(String),
}

impl From<String> for BottleCellar {
    fn from(s: String) -> Self {
        match s.trim_start_matches(':') {
            "any" => BottleCellar::Any,
            "any_skip_relocation" => BottleCellar::AnySkipRelocation,
            _ => BottleCellar::Path(s),
        }
    }
}

impl From<BottleCellar> for String {
    fn from(cellar: BottleCellar) -> Self {
        cellar.to_string()
    }
}

impl fmt::Display for BottleCellar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BottleCellar::Any => f.write_str("any"),
            BottleCellar::AnySkipRelocation => f.write_str("any_skip_relocation"),
            BottleCellar::Path(p) => f.write_str(p),
        }
    }
}

/// Bottle block of a recipe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleSpec {
    #[serde(default = "default_root_url")]
    pub root_url: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_cellar")]
    pub cellar: BottleCellar,
    #[serde(default)]
    pub rebuild: u32,
    /// sha256 per platform tag
    #[serde(default, alias = "sha256")]
    pub checksums: BTreeMap<String, String>,
}

fn default_root_url() -> String {
    DEFAULT_ROOT_URL.to_string()
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_cellar() -> BottleCellar {
    BottleCellar::Path(DEFAULT_CELLAR.to_string())
}

impl Default for BottleSpec {
    fn default() -> Self {
        Self {
            root_url: default_root_url(),
            prefix: default_prefix(),
            cellar: default_cellar(),
            rebuild: 0,
            checksums: BTreeMap::new(),
        }
    }
}

/// A bottle chosen for the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bottle {
    pub name: String,
    pub tag: BottleTag,
    pub sha256: String,
    pub url: String,
    pub filename: String,
    pub prefix: String,
    pub cellar: BottleCellar,
}

impl BottleSpec {
    /// The checksum entry serving `host`, and the tag it is filed under
    pub fn find(&self, host: &BottleTag) -> Option<(BottleTag, &str)> {
        let entry = |tag: &str| {
            self.checksums
                .get(tag)
                .map(|sum| (BottleTag::from(tag), sum.as_str()))
        };

        if let Some(found) = entry(host.as_str()) {
            return Some(found);
        }

        if let Some(found) = host.altivec_variant().and_then(|tag| entry(tag.as_str())) {
            return Some(found);
        }

        let or_later = self
            .checksums
            .keys()
            .map(|k| BottleTag::from(k.as_str()))
            .filter(|key| host.is_covered_by_or_later(key))
            .max_by_key(|key| key.or_later_base().and_then(|b| b.os_version()));
        if let Some(found) = or_later.and_then(|tag| entry(tag.as_str())) {
            return Some(found);
        }

        entry("all")
    }

    /// Bottles for another cellar would carry wrong hard-coded paths
    pub fn compatible_cellar(&self, paths: &Paths) -> bool {
        match &self.cellar {
            BottleCellar::Any | BottleCellar::AnySkipRelocation => true,
            BottleCellar::Path(p) => Path::new(p) == paths.cellar,
        }
    }

    pub fn skip_relocation(&self) -> bool {
        self.cellar == BottleCellar::AnySkipRelocation
    }

    /// The recorded prefix and cellar when they differ from `paths`
    pub fn recorded_paths(&self, paths: &Paths) -> Option<(&str, &str)> {
        let cellar = match &self.cellar {
            BottleCellar::Path(p) => p.as_str(),
            _ => DEFAULT_CELLAR,
        };
        let differs = Path::new(&self.prefix) != paths.prefix || Path::new(cellar) != paths.cellar;
        differs.then_some((self.prefix.as_str(), cellar))
    }

    pub fn url(&self, name: &str, pkg_version: &str, tag: &BottleTag) -> String {
        format!(
            "{}/{}",
            self.root_url.trim_end_matches('/'),
            filename(name, pkg_version, tag, self.rebuild)
        )
    }

    /// The bottle for `host`, if one is published
    pub fn resolve(&self, name: &str, pkg_version: &str, host: &BottleTag) -> Option<Bottle> {
        let (tag, sha256) = self.find(host)?;
        debug!("{}: bottle tag {} serves {}", name, tag, host);
        Some(Bottle {
            name: name.to_string(),
            url: self.url(name, pkg_version, &tag),
            filename: filename(name, pkg_version, &tag, self.rebuild),
            sha256: sha256.to_string(),
            prefix: self.prefix.clone(),
            cellar: self.cellar.clone(),
            tag,
        })
    }
}

/// `<name>-<pkg_version>.<tag>.bottle[.<rebuild>].tar.gz`
pub fn filename(name: &str, pkg_version: &str, tag: &BottleTag, rebuild: u32) -> String {
    let rebuild = if rebuild > 0 {
        format!(".{}", rebuild)
    } else {
        String::new()
    };
    format!("{}-{}.{}.bottle{}.tar.gz", name, pkg_version, tag, rebuild)
}

/// Result of baking a keg
#[derive(Debug, Clone)]
pub struct BakedBottle {
    pub path: PathBuf,
    pub sha256: String,
    pub tag: BottleTag,
    /// A bottle block describing the new archive
    pub spec: BottleSpec,
}

/// Archive an installed keg as a portable bottle in `out_dir`.
///
/// Host paths are swapped for placeholders while the archive is written and
/// restored afterwards. If nothing in the baked keg still mentions the
/// prefix or cellar the bottle is marked relocatable (`cellar: any`). A
/// failed bake leaves no archive behind.
pub fn bake_bottle(
    keg: &Keg,
    tool: &dyn LinkageTool,
    out_dir: &Path,
    tag: &BottleTag,
    rebuild: u32,
) -> Result<BakedBottle> {
    let paths = keg.paths();
    fs::create_dir_all(out_dir)?;
    let path = out_dir.join(filename(keg.name(), keg.version(), tag, rebuild));
    info!("Baking {} into {}", keg.path().display(), path.display());

    let baked = relocate::with_baked(keg.path(), paths, tool, || {
        write_archive(keg, &path)?;
        let relocatable = !relocate::keg_contains(keg.path(), &paths.prefix_str())
            && !relocate::keg_contains(keg.path(), &paths.cellar_str());
        Ok(relocatable)
    });

    let relocatable = match baked {
        Ok(relocatable) => relocatable,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
    };

    let sha256 = match download::sha256_file(&path) {
        Ok(sum) => sum,
        Err(e) => {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
    };

    let spec = BottleSpec {
        root_url: default_root_url(),
        prefix: paths.prefix_str(),
        cellar: if relocatable {
            BottleCellar::Any
        } else {
            BottleCellar::Path(paths.cellar_str())
        },
        rebuild,
        checksums: BTreeMap::from([(tag.to_string(), sha256.clone())]),
    };

    Ok(BakedBottle {
        path,
        sha256,
        tag: tag.clone(),
        spec,
    })
}

/// `tar czf` with entries under `<name>/<version>/`
fn write_archive(keg: &Keg, path: &Path) -> Result<()> {
    let file = fs::File::create(path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(format!("{}/{}", keg.name(), keg.version()), keg.path())?;
    builder.into_inner()?.finish()?;
    Ok(())
}
