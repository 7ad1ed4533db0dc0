//! Kegs: versioned install directories under the cellar.
//!
//! ```text
//! <cellar>/wget/1.21_1/      ← a keg
//!   INSTALL_RECEIPT.json
//!   bin/ share/ ...
//! ```
//!
//! A keg is *linked* when `<prefix>/var/brewkit/linked/<name>` resolves to it.
//! `<prefix>/opt/<name>` always points at the most recently installed keg.

use crate::config::Paths;
use crate::error::{BrewError, Result};
use crate::link;
use crate::receipt::InstallReceipt;
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One installed version of a package
#[derive(Debug, Clone)]
pub struct Keg {
    path: PathBuf,
    name: String,
    version: String,
    paths: Paths,
}

impl Keg {
    /// Open the keg at `<cellar>/<name>/<version>`
    pub fn open(paths: &Paths, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(BrewError::NoSuchKeg(path));
        }

        let rack = path.parent().ok_or_else(|| BrewError::NotAKeg(path.clone()))?;
        let cellar = rack.parent().ok_or_else(|| BrewError::NotAKeg(path.clone()))?;
        if !same_dir(cellar, &paths.cellar) {
            return Err(BrewError::NotAKeg(path));
        }

        let name = file_name(rack).ok_or_else(|| BrewError::NotAKeg(path.clone()))?;
        let version = file_name(&path).ok_or_else(|| BrewError::NotAKeg(path.clone()))?;

        Ok(Self {
            path,
            name,
            version,
            paths: paths.clone(),
        })
    }

    /// The keg containing `path`, found by walking up to the cellar
    pub fn for_path(paths: &Paths, path: &Path) -> Result<Self> {
        let mut current = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let cellar = fs::canonicalize(&paths.cellar).unwrap_or_else(|_| paths.cellar.clone());

        loop {
            let is_keg = current
                .parent()
                .and_then(Path::parent)
                .is_some_and(|c| c == cellar);
            if is_keg {
                // Rebuild under the configured cellar spelling
                let rel = current.strip_prefix(&cellar).unwrap_or(&current);
                return Self::open(paths, paths.cellar.join(rel));
            }
            if !current.pop() {
                return Err(BrewError::NotAKeg(path.to_path_buf()));
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn rack(&self) -> PathBuf {
        self.paths.rack(&self.name)
    }

    pub fn linked_record(&self) -> PathBuf {
        self.paths.linked_record(&self.name)
    }

    pub fn opt_record(&self) -> PathBuf {
        self.paths.opt_record(&self.name)
    }

    /// True when the linked record resolves to this keg
    pub fn is_linked(&self) -> bool {
        linked_keg_path(&self.paths, &self.name).is_some_and(|p| same_dir(&p, &self.path))
    }

    /// A keg with no entries counts as not installed
    pub fn is_empty(&self) -> bool {
        fs::read_dir(&self.path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    pub fn receipt(&self) -> Result<InstallReceipt> {
        InstallReceipt::read(&self.path)
    }

    /// Point `<prefix>/opt/<name>` at this keg, replacing whatever was there
    pub fn optlink(&self) -> Result<()> {
        let opt = self.opt_record();
        remove_any(&opt)?;
        link::make_relative_symlink(&opt, &self.path)?;
        debug!("opt: {} -> {}", opt.display(), self.path.display());
        Ok(())
    }

    pub fn remove_optlink(&self) -> Result<()> {
        let opt = self.opt_record();
        if resolved_path(&opt).is_some_and(|p| same_dir(&p, &self.path)) {
            fs::remove_file(&opt)?;
        }
        Ok(())
    }

    /// Delete the keg, then the rack if nothing else is in it
    pub fn uninstall(&self) -> Result<()> {
        self.remove_optlink()?;
        fs::remove_dir_all(&self.path)?;
        rmdir_if_possible(&self.rack());
        Ok(())
    }
}

impl PartialEq for Keg {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

/// The keg currently linked for `name`, if any
pub fn linked_keg_path(paths: &Paths, name: &str) -> Option<PathBuf> {
    let record = paths.linked_record(name);
    resolved_path(&record).filter(|p| p.is_dir())
}

/// Every keg in the cellar, racks in name order
pub fn installed_kegs(paths: &Paths) -> Result<Vec<Keg>> {
    if !paths.cellar.exists() {
        return Ok(vec![]);
    }

    let mut racks: Vec<String> = fs::read_dir(&paths.cellar)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| !n.starts_with('.'))
        .collect();
    racks.sort();

    let mut kegs = Vec::new();
    for name in racks {
        kegs.extend(installed_versions(paths, &name)?);
    }
    Ok(kegs)
}

/// All installed versions of `name`, newest first
pub fn installed_versions(paths: &Paths, name: &str) -> Result<Vec<Keg>> {
    let rack = paths.rack(name);
    if !rack.is_dir() {
        return Ok(vec![]);
    }

    let mut kegs = Vec::new();
    for entry in fs::read_dir(&rack)? {
        let entry = entry?;
        let version = entry.file_name().to_string_lossy().to_string();
        if version.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        kegs.push(Keg::open(paths, entry.path())?);
    }

    // [0] is always the newest
    kegs.sort_by(|a, b| compare_versions(b.version(), a.version()));
    Ok(kegs)
}

/// Compare two package versions (`1.2.10` > `1.2.9`, `1.0_1` > `1.0`)
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (a_ver, a_rev) = split_revision(a);
    let (b_ver, b_rev) = split_revision(b);

    let a_parts: Vec<u64> = numeric_parts(a_ver);
    let b_parts: Vec<u64> = numeric_parts(b_ver);

    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_part = a_parts.get(i).unwrap_or(&0);
        let b_part = b_parts.get(i).unwrap_or(&0);
        match a_part.cmp(b_part) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    a_rev.cmp(&b_rev).then_with(|| a_ver.cmp(b_ver))
}

fn split_revision(v: &str) -> (&str, u32) {
    match v.rsplit_once('_') {
        Some((ver, rev)) => match rev.parse() {
            Ok(rev) => (ver, rev),
            Err(_) => (v, 0),
        },
        None => (v, 0),
    }
}

fn numeric_parts(v: &str) -> Vec<u64> {
    v.split(|c: char| c == '.' || c == '-')
        .filter_map(|s| s.parse::<u64>().ok())
        .collect()
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

/// Compare directories, resolving symlinks where possible
pub(crate) fn same_dir(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Where a symlink points, made absolute against its directory
pub(crate) fn resolved_path(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    if target.is_absolute() {
        Some(target)
    } else {
        link.parent().map(|p| link::normalize_path(&p.join(target)))
    }
}

/// Remove a file, symlink or empty directory at `path` if present
pub(crate) fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Remove `dir` if it is empty (a lone `.DS_Store` does not count)
pub(crate) fn rmdir_if_possible(dir: &Path) -> bool {
    match fs::remove_dir(dir) {
        Ok(()) => true,
        Err(_) => {
            let ds_store = dir.join(".DS_Store");
            let only_ds_store = fs::read_dir(dir)
                .map(|entries| {
                    let names: Vec<_> = entries.filter_map(|e| e.ok()).collect();
                    names.len() == 1 && names[0].file_name() == ".DS_Store"
                })
                .unwrap_or(false);
            only_ds_store && fs::remove_file(&ds_store).is_ok() && fs::remove_dir(dir).is_ok()
        }
    }
}
