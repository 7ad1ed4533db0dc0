//! Unpacking bottles into the cellar and sources into a build staging dir.
//!
//! Bottles are tar.gz files whose entries already carry the keg path:
//!
//! ```text
//! Input:  wget-1.24.5.arm64_sonoma.bottle.tar.gz
//! Entries: wget/1.24.5/bin/wget, wget/1.24.5/INSTALL_RECEIPT.json, ...
//! Extract to: <cellar>/wget/1.24.5/
//! ```
//!
//! Source archives are unpacked into a fresh staging directory; when the
//! archive holds a single top-level directory (the usual `foo-1.0/`) the
//! build runs inside it.

use crate::config::Paths;
use crate::error::{BrewError, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::debug;
use walkdir::WalkDir;

/// Extract a bottle into the cellar and return the keg it produced
pub fn pour_bottle(bottle: &Path, paths: &Paths, name: &str, pkg_version: &str) -> Result<PathBuf> {
    fs::create_dir_all(&paths.cellar)?;

    let file = fs::File::open(bottle)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);
    archive.unpack(&paths.cellar)?;

    // A rebuilt bottle may carry a revision suffix (1.0_1)
    let rack = paths.rack(name);
    let exact = rack.join(pkg_version);
    if exact.is_dir() {
        return Ok(exact);
    }

    let revised = fs::read_dir(&rack)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .find(|dir| {
            dir.strip_prefix(pkg_version)
                .and_then(|rest| rest.strip_prefix('_'))
                .is_some_and(|rev| rev.chars().all(|c| c.is_ascii_digit()))
        })
        .ok_or_else(|| BrewError::NoSuchKeg(exact.clone()))?;

    Ok(rack.join(revised))
}

/// Put the fetched source into `staging` and return the directory to build in
pub fn stage_source(source: &Path, staging: &Path) -> Result<PathBuf> {
    fs::create_dir_all(staging)?;

    if source.is_dir() {
        copy_tree(source, staging)?;
        return Ok(staging.to_path_buf());
    }

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = fs::File::open(source)?;
        Archive::new(GzDecoder::new(file)).unpack(staging)?;
    } else if name.ends_with(".tar") {
        let file = fs::File::open(source)?;
        Archive::new(file).unpack(staging)?;
    } else {
        // Anything else is used as-is, e.g. a single script
        let target = staging.join(strip_cache_prefix(&name));
        fs::copy(source, &target)?;
        return Ok(staging.to_path_buf());
    }

    Ok(single_top_level_dir(staging)?.unwrap_or_else(|| staging.to_path_buf()))
}

/// Cache entries are named `<formula>--<file>`
fn strip_cache_prefix(name: &str) -> &str {
    name.split_once("--").map_or(name, |(_, file)| file)
}

fn single_top_level_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.file_name().is_some_and(|n| n != std::ffi::OsStr::new(".DS_Store")))
        .collect();

    match entries.as_slice() {
        [only] if only.is_dir() => Ok(Some(only.clone())),
        _ => Ok(None),
    }
}

/// Copy a checkout, without its VCS metadata
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let walker = WalkDir::new(from)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !matches!(e.file_name().to_str(), Some(".git") | Some(".hg")));

    for entry in walker {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let dest = to.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(target, &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    debug!("Copied {} to {}", from.display(), to.display());
    Ok(())
}
