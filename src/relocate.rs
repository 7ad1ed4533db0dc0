//! Keg relocation: rewrite absolute paths embedded in installed files.
//!
//! Three directions share one rule engine:
//!
//! - **pour**: bottles carry `@@HOMEBREW_PREFIX@@` and `@@HOMEBREW_CELLAR@@`
//!   placeholders that are replaced with the host's real paths once, after
//!   extraction
//! - **bake**: the reverse, applied temporarily while a keg is archived into a
//!   bottle and always undone afterwards
//! - **fix**: after a source build, load paths that still point into the build
//!   temp directory are repointed at the keg through its opt record
//!
//! Binaries are edited through a [`LinkageTool`]; package-config (`.pc`),
//! libtool (`.la`) and `*-config` scripts get a plain text replacement.

use crate::config::Paths;
use crate::error::Result;
use crate::linkage::LinkageTool;
use crate::receipt::RECEIPT_FILE;
use rayon::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const PREFIX_PLACEHOLDER: &str = "@@HOMEBREW_PREFIX@@";
pub const CELLAR_PLACEHOLDER: &str = "@@HOMEBREW_CELLAR@@";

/// One `old → new` path-prefix substitution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub old: String,
    pub new: String,
}

/// Ordered rewrite rules; the first rule whose `old` matches wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relocation {
    rules: Vec<Rule>,
}

impl Relocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Identical or empty substitutions are ignored.
    pub fn add(&mut self, old: impl Into<String>, new: impl Into<String>) -> &mut Self {
        let (old, new) = (old.into(), new.into());
        if !old.is_empty() && old != new && !self.rules.iter().any(|r| r.old == old) {
            self.rules.push(Rule { old, new });
        }
        self
    }

    /// Placeholders → host paths
    pub fn pour(paths: &Paths) -> Self {
        let mut relocation = Self::new();
        relocation
            .add(CELLAR_PLACEHOLDER, paths.cellar_str())
            .add(PREFIX_PLACEHOLDER, paths.prefix_str());
        relocation
    }

    /// Host paths → placeholders. The cellar goes first because it
    /// usually lives inside the prefix.
    pub fn bake(paths: &Paths) -> Self {
        let mut relocation = Self::new();
        relocation
            .add(paths.cellar_str(), CELLAR_PLACEHOLDER)
            .add(paths.prefix_str(), PREFIX_PLACEHOLDER);
        relocation
    }

    /// Paths recorded in a bottle built elsewhere → host paths
    pub fn between(old_prefix: &str, old_cellar: &str, paths: &Paths) -> Self {
        let mut relocation = Self::new();
        relocation
            .add(old_cellar, paths.cellar_str())
            .add(old_prefix, paths.prefix_str());
        relocation
    }

    /// The same substitutions in the opposite direction
    pub fn inverse(&self) -> Self {
        let mut relocation = Self::new();
        for rule in &self.rules {
            relocation.add(rule.new.clone(), rule.old.clone());
        }
        relocation
    }

    /// Append all of `other`'s rules after ours
    pub fn extend(&mut self, other: &Relocation) -> &mut Self {
        for rule in &other.rules {
            self.add(rule.old.clone(), rule.new.clone());
        }
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite a load path whose prefix matches a rule
    pub fn apply(&self, path: &str) -> Option<String> {
        self.rules.iter().find_map(|rule| {
            path.strip_prefix(rule.old.as_str())
                .filter(|rest| rest.is_empty() || rest.starts_with('/') || is_placeholder(&rule.old))
                .map(|rest| format!("{}{}", rule.new, rest))
        })
    }

    /// Replace every occurrence of every rule in one left-to-right pass, so
    /// replaced text is never matched again. Where several rules match at
    /// the same position the first one wins.
    pub fn apply_text(&self, text: &str) -> Option<String> {
        if !self.rules.iter().any(|r| text.contains(r.old.as_str())) {
            return None;
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            match self.rules.iter().find(|r| rest.starts_with(r.old.as_str())) {
                Some(rule) => {
                    out.push_str(&rule.new);
                    rest = &rest[rule.old.len()..];
                }
                None => {
                    out.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        (out != text).then_some(out)
    }
}

fn is_placeholder(s: &str) -> bool {
    s == PREFIX_PLACEHOLDER || s == CELLAR_PLACEHOLDER
}

/// What a relocation pass touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationReport {
    pub binaries: usize,
    pub text_files: usize,
    pub edits: usize,
}

impl RelocationReport {
    fn add(&mut self, other: RelocationReport) {
        self.binaries += other.binaries;
        self.text_files += other.text_files;
        self.edits += other.edits;
    }
}

/// Files in a keg that may carry paths
struct Candidates {
    binaries: Vec<PathBuf>,
    text: Vec<PathBuf>,
}

fn scan(keg: &Path, tool: &dyn LinkageTool) -> Candidates {
    // WalkDir keeps directory handles open, so collect paths first
    let files: Vec<PathBuf> = WalkDir::new(keg)
        .follow_links(false)
        .max_open(64)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    let (binaries, rest): (Vec<PathBuf>, Vec<PathBuf>) =
        files.into_par_iter().partition(|p| tool.is_linkable(p));
    let text = rest.into_iter().filter(|p| is_text_metadata(p)).collect();

    Candidates { binaries, text }
}

/// `.pc`, `.la` and `*-config` files carry paths as plain text
fn is_text_metadata(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    let ext = path.extension().and_then(|e| e.to_str());
    matches!(ext, Some("pc") | Some("la")) || name.ends_with("-config")
}

/// Apply `relocation` to every binary and text metadata file in the keg
pub fn relocate_keg(
    keg: &Path,
    relocation: &Relocation,
    tool: &dyn LinkageTool,
) -> Result<RelocationReport> {
    if relocation.is_empty() {
        return Ok(RelocationReport::default());
    }
    let candidates = scan(keg, tool);
    debug!(
        "Relocating {}: {} binaries, {} text files",
        keg.display(),
        candidates.binaries.len(),
        candidates.text.len()
    );

    // Each file edit is independent
    let results: Vec<Result<RelocationReport>> = candidates
        .binaries
        .par_iter()
        .map(|file| relocate_binary(file, relocation, tool))
        .chain(
            candidates
                .text
                .par_iter()
                .map(|file| relocate_text_file(file, relocation)),
        )
        .collect();

    let mut report = RelocationReport::default();
    for result in results {
        report.add(result?);
    }
    Ok(report)
}

fn relocate_binary(
    file: &Path,
    relocation: &Relocation,
    tool: &dyn LinkageTool,
) -> Result<RelocationReport> {
    let linkage = tool.inspect(file)?;
    let new_id = linkage.id.as_deref().and_then(|id| relocation.apply(id));
    let changes: Vec<(String, String)> = linkage
        .libraries
        .iter()
        .filter_map(|lib| relocation.apply(lib).map(|new| (lib.clone(), new)))
        .collect();

    if new_id.is_none() && changes.is_empty() {
        return Ok(RelocationReport::default());
    }

    let mut edits = 0;
    with_writable(file, || {
        if let Some(id) = &new_id {
            tool.change_id(file, id)?;
            edits += 1;
        }
        for (old, new) in &changes {
            tool.change_install_name(file, old, new)?;
            edits += 1;
        }
        Ok(())
    })?;

    Ok(RelocationReport {
        binaries: 1,
        text_files: 0,
        edits,
    })
}

fn relocate_text_file(file: &Path, relocation: &Relocation) -> Result<RelocationReport> {
    let Ok(text) = fs::read_to_string(file) else {
        debug!("Skipping non-UTF-8 file {}", file.display());
        return Ok(RelocationReport::default());
    };

    match relocation.apply_text(&text) {
        Some(updated) => {
            with_writable(file, || Ok(fs::write(file, &updated)?))?;
            Ok(RelocationReport {
                binaries: 0,
                text_files: 1,
                edits: 1,
            })
        }
        None => Ok(RelocationReport::default()),
    }
}

/// Run `f` with the owner write bit set, restoring the mode afterwards
fn with_writable<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    let readonly = mode & 0o200 == 0;
    if readonly {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o200))?;
    }

    let result = f();

    if readonly {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    result
}

/// Rewrite bottle placeholders, and any paths a foreign bottle recorded, to
/// the host layout
pub fn pour(
    keg: &Path,
    paths: &Paths,
    recorded: Option<(&str, &str)>,
    tool: &dyn LinkageTool,
) -> Result<RelocationReport> {
    let mut relocation = Relocation::pour(paths);
    if let Some((old_prefix, old_cellar)) = recorded {
        relocation.extend(&Relocation::between(old_prefix, old_cellar, paths));
    }
    relocate_keg(keg, &relocation, tool)
}

/// Temporarily bake placeholders into `keg`, run `f`, then restore.
///
/// The restore pass runs whether baking or `f` failed; the keg never stays
/// in its baked form.
pub fn with_baked<T, F>(keg: &Path, paths: &Paths, tool: &dyn LinkageTool, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let bake = Relocation::bake(paths);
    let outcome = relocate_keg(keg, &bake, tool).and_then(|_| f());

    let restored = relocate_keg(keg, &bake.inverse(), tool);
    match (outcome, restored) {
        (Ok(value), Ok(_)) => Ok(value),
        (Err(e), Ok(_)) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(restore)) => {
            warn!("Failed to restore {} after baking: {}", keg.display(), restore);
            Err(e)
        }
    }
}

/// Repoint load paths a source build left behind.
///
/// A library id becomes `<opt>/<path in keg>`. Dependent names that are
/// rooted in the build temp directory, relative, or still carry a
/// placeholder are rewritten; `@loader_path`-style names and other absolute
/// paths are left alone. Names that cannot be resolved are reported and kept.
/// ELF sonames and needed entries are bare names by nature, so only
/// temp-rooted run paths are touched there.
pub fn fix_install_names(
    keg: &Path,
    opt: &Path,
    paths: &Paths,
    tool: &dyn LinkageTool,
) -> Result<RelocationReport> {
    let temp = paths.temp.to_string_lossy().into_owned();
    let placeholders = Relocation::pour(paths);
    let candidates = scan(keg, tool);
    let mut report = RelocationReport::default();

    for file in &candidates.binaries {
        let linkage = tool.inspect(file)?;
        let rel = file.strip_prefix(keg).unwrap_or(file);
        let new_id = linkage
            .id
            .as_deref()
            .filter(|_| tool.names_are_paths())
            .map(|id| (id, opt.join(rel).to_string_lossy().into_owned()))
            .filter(|(id, new)| *id != new.as_str());
        let bad_libs: Vec<&String> = linkage
            .libraries
            .iter()
            .filter(|l| is_bad_name(l, &temp) || (tool.names_are_paths() && is_fixable_name(l)))
            .collect();
        if new_id.is_none() && bad_libs.is_empty() {
            continue;
        }

        let mut edits = 0;
        with_writable(file, || {
            if let Some((id, new)) = &new_id {
                debug!("{}: id {} -> {}", file.display(), id, new);
                tool.change_id(file, new)?;
                edits += 1;
            }

            let fixer = NameFixer {
                keg,
                opt,
                file,
                is_library: linkage.id.is_some(),
                binaries: &candidates.binaries,
                placeholders: &placeholders,
                loader: tool.loader_relative(),
            };
            for lib in bad_libs {
                match fixer.fixed_name(lib) {
                    Some(new) => {
                        debug!("{}: {} -> {}", file.display(), lib, new);
                        tool.change_install_name(file, lib, &new)?;
                        edits += 1;
                    }
                    None => warn!("{}: could not fix install name {}", file.display(), lib),
                }
            }
            Ok(())
        })?;

        if edits > 0 {
            report.add(RelocationReport {
                binaries: 1,
                text_files: 0,
                edits,
            });
        }
    }

    Ok(report)
}

/// Absolute names rooted in the build temp directory
fn is_bad_name(name: &str, temp: &str) -> bool {
    !temp.is_empty() && name.starts_with(temp) && name[temp.len()..].starts_with('/')
}

/// Relative names and leftover placeholders; `@rpath` and friends are
/// already relocatable
fn is_fixable_name(name: &str) -> bool {
    name.starts_with("@@HOMEBREW_")
        || !(name.starts_with('/') || name.starts_with('@') || name.starts_with('$'))
}

/// Resolves one bad name of one binary
struct NameFixer<'a> {
    keg: &'a Path,
    opt: &'a Path,
    file: &'a Path,
    is_library: bool,
    binaries: &'a [PathBuf],
    placeholders: &'a Relocation,
    loader: Option<&'static str>,
}

impl NameFixer<'_> {
    fn fixed_name(&self, name: &str) -> Option<String> {
        if let Some(poured) = self.placeholders.apply(name) {
            return Some(poured);
        }

        if !name.starts_with('/') {
            // Next to a library, it can load the name relative to itself
            if let (true, Some(loader)) = (self.is_library, self.loader) {
                if self.file.parent().is_some_and(|dir| dir.join(name).exists()) {
                    return Some(format!("{}/{}", loader, name));
                }
            }
            if self.keg.join("lib").join(name).exists() {
                return Some(self.opt.join("lib").join(name).to_string_lossy().into_owned());
            }
        }

        find_in_keg(self.binaries, self.keg, name)
            .map(|rel| self.opt.join(rel).to_string_lossy().into_owned())
    }
}

fn find_in_keg<'a>(binaries: &'a [PathBuf], keg: &Path, lib: &str) -> Option<&'a Path> {
    let wanted = Path::new(lib).file_name()?;
    binaries
        .iter()
        .filter(|p| p.file_name() == Some(wanted))
        .find_map(|p| p.strip_prefix(keg).ok())
}

/// Whether any file in the keg, other than its install receipt, still
/// mentions `needle`
pub fn keg_contains(keg: &Path, needle: &str) -> bool {
    let needle = needle.as_bytes();
    if needle.is_empty() {
        return false;
    }

    let files: Vec<PathBuf> = WalkDir::new(keg)
        .follow_links(false)
        .max_open(64)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name() != std::ffi::OsStr::new(RECEIPT_FILE))
        .map(|e| e.into_path())
        .collect();

    files.par_iter().any(|file| match fs::read(file) {
        Ok(bytes) => bytes.windows(needle.len()).any(|w| w == needle),
        Err(e) => {
            debug!("Skipping unreadable {}: {}", file.display(), e);
            false
        }
    })
}
