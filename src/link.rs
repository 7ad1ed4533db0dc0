//! Keg linking: merge a keg into the shared prefix as relative symlinks.
//!
//! Each top-level directory of a keg is walked in file-name order and every
//! entry gets a [`Disposition`]. Directories that several packages populate
//! (`lib/pkgconfig`, `share/man/man1`, `etc`, ...) are created as real
//! directories; everything else is symlinked as high up the tree as possible.
//!
//! When a directory this keg wants to populate is currently a symlink into
//! another keg, that symlink is replaced by a real directory and the other
//! keg's entries are relinked inside it. Since walks are sorted, the result
//! only depends on the order in which kegs are linked.
//!
//! Any failure unlinks everything this keg had linked so far.

use crate::config::Paths;
use crate::error::{BrewError, Result};
use crate::keg::{self, Keg};
use regex::Regex;
use std::fs;
use std::io;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directories of a keg that are merged into the prefix
pub const TOP_LEVEL_DIRECTORIES: &[&str] = &[
    "bin",
    "etc",
    "include",
    "lib",
    "sbin",
    "share",
    "var",
    "Frameworks",
];

/// Paths under `share` that are always real directories in the prefix
const SHARE_PATHS: &[&str] = &[
    "aclocal",
    "doc",
    "info",
    "locale",
    "man",
    "man/man1",
    "man/man2",
    "man/man3",
    "man/man4",
    "man/man5",
    "man/man6",
    "man/man7",
    "man/man8",
    "man/cat1",
    "man/cat2",
    "man/cat3",
    "man/cat4",
    "man/cat5",
    "man/cat6",
    "man/cat7",
    "man/cat8",
    "applications",
    "gnome",
    "gnome/help",
    "icons",
    "mime-info",
    "pixmaps",
    "sounds",
];

/// Directories under `lib` that language runtimes share
const LIB_SHARED_DIRS: &[&str] = &["pkgconfig", "dtrace", "ghc", "lua", "php", "ruby"];

// language[_territory][.codeset][@modifier]
static LOCALEDIR_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(locale|man)/([a-z]{2}|C|POSIX)(_[A-Z]{2})?(\.[a-zA-Z\-0-9]+(@.+)?)?")
        .expect("valid regex")
});
static INFOFILE_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"info/([^.].*?\.info|dir)$").expect("valid regex"));
static ICON_CACHE_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^icons/.*/icon-theme\.cache$").expect("valid regex"));
static LIB_PREFIX_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(gdk-pixbuf|node|ocaml|perl5|python[23]\.\d)").expect("valid regex")
});
static FRAMEWORK_RX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^/]*\.framework(/Versions)?$").expect("valid regex"));

/// What to do with one entry of a keg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Symlink it (directories: the whole subtree)
    Link,
    /// Real directory in the prefix, keep walking
    MkPath,
    SkipFile,
    SkipDir,
    /// Link and register with the info index
    Info,
}

/// Disposition for `rel`, a path relative to the top-level directory `top`
pub fn disposition(top: &str, rel: &str) -> Disposition {
    match top {
        "etc" | "var" => Disposition::MkPath,
        "bin" | "sbin" => Disposition::SkipDir,
        "include" => Disposition::Link,
        "share" => share_disposition(rel),
        "lib" => lib_disposition(rel),
        "Frameworks" => {
            // Foo.framework and Foo.framework/Versions collect several versions
            if FRAMEWORK_RX.is_match(rel) {
                Disposition::MkPath
            } else {
                Disposition::Link
            }
        }
        _ => Disposition::Link,
    }
}

fn share_disposition(rel: &str) -> Disposition {
    if rel == "locale/locale.alias" || ICON_CACHE_RX.is_match(rel) {
        Disposition::SkipFile
    } else if INFOFILE_RX.is_match(rel) {
        Disposition::Info
    } else if LOCALEDIR_RX.is_match(rel)
        || SHARE_PATHS.contains(&rel)
        || rel.starts_with("icons/")
        || rel.starts_with("zsh")
    {
        Disposition::MkPath
    } else {
        Disposition::Link
    }
}

fn lib_disposition(rel: &str) -> Disposition {
    if rel == "charset.alias" {
        Disposition::SkipFile
    } else if LIB_SHARED_DIRS.contains(&rel) || LIB_PREFIX_RX.is_match(rel) {
        Disposition::MkPath
    } else {
        Disposition::Link
    }
}

/// Link options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkMode {
    /// Report what would happen, touch nothing
    pub dry_run: bool,
    /// Replace conflicting files instead of failing
    pub overwrite: bool,
}

/// What a link call did (or would do, in dry-run mode)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    /// Symlinks created
    pub links: usize,
    /// Dry run: prefix paths that would become symlinks
    pub would_link: Vec<PathBuf>,
    /// Dry run with overwrite: existing prefix paths that would be replaced
    pub would_overwrite: Vec<PathBuf>,
}

/// Link `keg` into the prefix.
///
/// Fails with [`BrewError::AlreadyLinked`] before touching anything when
/// another keg of the same name is linked. Relinking the linked keg itself
/// only creates missing links.
pub fn link(keg: &Keg, mode: LinkMode) -> Result<LinkReport> {
    let paths = keg.paths();
    if let Some(linked) = keg::linked_keg_path(paths, keg.name()) {
        if !keg::same_dir(&linked, keg.path()) {
            return Err(BrewError::AlreadyLinked {
                formula: keg.name().to_string(),
                linked,
            });
        }
    }

    let mut linker = Linker {
        paths,
        mode,
        report: LinkReport::default(),
    };

    match linker.link_keg(keg) {
        Ok(()) => {
            debug!("Linked {} ({} links)", keg.name(), linker.report.links);
            Ok(linker.report)
        }
        Err(e) => {
            warn!("Could not link {}. Unlinking...", keg.name());
            if !mode.dry_run {
                if let Err(unlink_err) = unlink(keg) {
                    warn!("Unlinking {} failed: {}", keg.name(), unlink_err);
                }
            }
            Err(e)
        }
    }
}

struct Linker<'a> {
    paths: &'a Paths,
    mode: LinkMode,
    report: LinkReport,
}

impl Linker<'_> {
    fn link_keg(&mut self, keg: &Keg) -> Result<()> {
        for top in TOP_LEVEL_DIRECTORIES {
            let root = keg.path().join(top);
            self.link_dir(keg, &root, &|rel| disposition(top, rel))?;
        }

        if !self.mode.dry_run {
            let record = keg.linked_record();
            keg::remove_any(&record)?;
            make_relative_symlink(&record, keg.path())?;
            keg.optlink()?;
        }
        Ok(())
    }

    /// Walk `root` (inside `keg`) and mirror it into the prefix
    fn link_dir(
        &mut self,
        keg: &Keg,
        root: &Path,
        dispose: &dyn Fn(&str) -> Disposition,
    ) -> Result<()> {
        if !root.exists() {
            return Ok(());
        }

        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry?;
            let src = entry.path();
            let rel_keg = src.strip_prefix(keg.path()).unwrap_or(src);
            let dst = self.paths.prefix.join(rel_keg);
            let rel = slash_path(src.strip_prefix(root).unwrap_or(src));

            // Symlinks inside the keg are judged by what they point at
            let Ok(meta) = fs::metadata(src) else {
                continue;
            };

            if meta.is_file() {
                if entry.file_name() == ".DS_Store" {
                    continue;
                }
                // Python rewrites these, they would block the next link
                if src.extension().is_some_and(|e| e == "pyc")
                    && src.to_string_lossy().contains("site-packages")
                {
                    continue;
                }

                match dispose(&rel) {
                    Disposition::SkipFile => {}
                    Disposition::Info => {
                        if entry.file_name() == "dir" {
                            continue;
                        }
                        self.link_entry(&dst, src)?;
                        if !self.mode.dry_run {
                            install_info(&dst);
                        }
                    }
                    _ => self.link_entry(&dst, src)?,
                }
            } else if meta.is_dir() {
                if entry.path_is_symlink() {
                    // e.g. Frameworks/Foo.framework -> ../lib/Foo.framework
                    if !dst.exists() {
                        self.link_entry(&dst, src)?;
                    }
                    continue;
                }

                if is_real_dir(&dst) {
                    continue;
                }

                if src.extension().is_some_and(|e| e == "app") {
                    walker.skip_current_dir();
                    continue;
                }

                match dispose(&rel) {
                    Disposition::SkipDir => walker.skip_current_dir(),
                    Disposition::MkPath => {
                        if !self.resolve_conflict(&dst, src)? {
                            self.mkpath(&dst, src)?;
                        }
                    }
                    _ => {
                        if !self.resolve_conflict(&dst, src)? {
                            self.link_entry(&dst, src)?;
                            walker.skip_current_dir();
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// A directory symlink into another keg becomes a real directory that
    /// both kegs populate. Returns whether that happened.
    fn resolve_conflict(&mut self, dst: &Path, ours: &Path) -> Result<bool> {
        let is_symlink = fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink());
        if !is_symlink || !dst.is_dir() {
            return Ok(false);
        }

        let Some(src) = keg::resolved_path(dst) else {
            return Ok(false);
        };
        if src == ours {
            return Ok(false);
        }
        let other = match Keg::for_path(self.paths, &src) {
            Ok(k) => k,
            Err(_) => {
                debug!(
                    "Won't resolve conflicts for symlink {} as it doesn't resolve into the cellar",
                    dst.display()
                );
                return Ok(false);
            }
        };

        debug!(
            "Expanding {} into a directory shared with {}",
            dst.display(),
            other.name()
        );
        if !self.mode.dry_run {
            fs::remove_file(dst)?;
            fs::create_dir_all(dst)?;
        }
        self.link_dir(&other, &src, &|_| Disposition::MkPath)?;
        Ok(true)
    }

    fn mkpath(&mut self, dst: &Path, src: &Path) -> Result<()> {
        if self.mode.dry_run {
            return Ok(());
        }
        if fs::symlink_metadata(dst).is_ok() && !is_real_dir(dst) {
            return Err(BrewError::LinkConflict {
                source_path: src.to_path_buf(),
                target: dst.to_path_buf(),
                existing: fs::read_link(dst).ok(),
            });
        }
        fs::create_dir_all(dst)?;
        Ok(())
    }

    fn link_entry(&mut self, dst: &Path, src: &Path) -> Result<()> {
        let exists = dst.exists();
        let is_symlink = fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink());

        if is_symlink && exists && keg::resolved_path(dst).is_some_and(|p| p == src) {
            debug!("Skipping; link already exists: {}", dst.display());
            return Ok(());
        }

        if self.mode.dry_run {
            if self.mode.overwrite {
                if is_symlink || exists {
                    self.report.would_overwrite.push(dst.to_path_buf());
                }
            } else {
                self.report.would_link.push(dst.to_path_buf());
            }
            return Ok(());
        }

        if self.mode.overwrite && (exists || is_symlink) {
            keg::remove_any(dst)?;
        }

        make_relative_symlink(dst, src)?;
        self.report.links += 1;
        Ok(())
    }
}

/// Remove the prefix symlinks that point into `keg`, then any directories
/// left empty. Returns the number of symlinks removed.
pub fn unlink(keg: &Keg) -> Result<usize> {
    let paths = keg.paths();
    let mut dirs = Vec::new();
    let mut removed = 0;

    for top in TOP_LEVEL_DIRECTORIES {
        let root = keg.path().join(top);
        if !root.exists() {
            continue;
        }

        let mut walker = WalkDir::new(&root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry?;
            let src = entry.path();
            let dst = paths.prefix.join(src.strip_prefix(keg.path()).unwrap_or(src));

            if is_real_dir(&dst) {
                dirs.push(dst.clone());
            }

            let is_symlink = fs::symlink_metadata(&dst).is_ok_and(|m| m.file_type().is_symlink());
            if !is_symlink || !dst.exists() {
                continue;
            }
            if keg::resolved_path(&dst).is_none_or(|p| p != src) {
                continue;
            }

            if INFOFILE_RX.is_match(&slash_path(&dst)) {
                uninstall_info(&dst);
            }
            fs::remove_file(&dst)?;
            debug!("rm {}", dst.display());
            removed += 1;

            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
        }
    }

    let record = keg.linked_record();
    let points_here = keg::resolved_path(&record).is_some_and(|p| keg::same_dir(&p, keg.path()));
    let dangling = fs::symlink_metadata(&record).is_ok() && !record.exists();
    if points_here || dangling {
        fs::remove_file(&record)?;
    }

    for dir in dirs.iter().rev() {
        if keg::rmdir_if_possible(dir) {
            debug!("rmdir {}", dir.display());
        }
    }

    Ok(removed)
}

/// Make `link` a relative symlink to `target`, creating parent directories.
///
/// Fails with [`BrewError::LinkConflict`] if something already exists at `link`.
pub fn make_relative_symlink(link: &Path, target: &Path) -> Result<()> {
    let parent = link
        .parent()
        .ok_or_else(|| BrewError::Other(anyhow::anyhow!("{} has no parent", link.display())))?;
    fs::create_dir_all(parent)?;

    let relative = pathdiff::diff_paths(target, parent).unwrap_or_else(|| target.to_path_buf());

    match unix_fs::symlink(&relative, link) {
        Ok(()) => {
            debug!("ln -s {} {}", relative.display(), link.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(BrewError::LinkConflict {
            source_path: target.to_path_buf(),
            target: link.to_path_buf(),
            existing: keg::resolved_path(link),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}

fn slash_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn install_info(dst: &Path) {
    run_install_info(dst, false);
}

fn uninstall_info(dst: &Path) {
    run_install_info(dst, true);
}

/// Keep `share/info/dir` in sync; a missing `install-info` is not an error
fn run_install_info(dst: &Path, delete: bool) {
    let Ok(tool) = which::which("install-info") else {
        return;
    };
    let Some(dir_file) = dst.parent().map(|p| p.join("dir")) else {
        return;
    };

    let mut cmd = Command::new(tool);
    if delete {
        cmd.arg("--delete");
    }
    cmd.arg("--quiet").arg(dst).arg(&dir_file);

    match cmd.output() {
        Ok(out) if !out.status.success() => {
            debug!(
                "install-info failed for {}: {}",
                dst.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Err(e) => debug!("install-info failed for {}: {}", dst.display(), e),
        _ => {}
    }
}
