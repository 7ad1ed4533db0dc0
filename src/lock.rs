//! Advisory per-formula locks.
//!
//! An install holds `<prefix>/var/brewkit/locks/<name>.formula.lock` for its
//! root formula and every dependency in its plan. Acquisition never blocks:
//! a lock held elsewhere, including by another handle in this process, is
//! [`BrewError::OperationInProgress`]. Locks are released on drop.

use crate::config::Paths;
use crate::error::{BrewError, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// An exclusive lock on one formula name
#[derive(Debug)]
pub struct FormulaLock {
    name: String,
    path: PathBuf,
    // Kept open to hold the lock
    file: File,
}

impl FormulaLock {
    pub fn lock_path(paths: &Paths, name: &str) -> PathBuf {
        // Tap-qualified names share the lock of their short name
        let short = name.rsplit('/').next().unwrap_or(name);
        paths.locks_dir().join(format!("{}.formula.lock", short))
    }

    /// Try to take the lock without waiting
    pub fn try_acquire(paths: &Paths, name: &str) -> Result<Self> {
        let path = Self::lock_path(paths, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Locked {}", path.display());
                Ok(Self {
                    name: name.to_string(),
                    path,
                    file,
                })
            }
            Err(e) if is_contended(&e) => Err(BrewError::OperationInProgress(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FormulaLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Unlocked {}", self.path.display());
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Locks held by one top-level operation
#[derive(Debug, Default)]
pub struct LockSet {
    held: Vec<FormulaLock>,
}

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holds(&self, name: &str) -> bool {
        self.held.iter().any(|l| l.name == name)
    }

    /// Lock every name not already held here. All or nothing: if any lock is
    /// unavailable, the ones taken by this call are released again.
    pub fn acquire<I, S>(&mut self, paths: &Paths, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut taken = Vec::new();
        for name in names {
            let name = name.as_ref();
            if self.holds(name) || taken.iter().any(|l: &FormulaLock| l.name == name) {
                continue;
            }
            taken.push(FormulaLock::try_acquire(paths, name)?);
        }
        self.held.extend(taken);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_is_refused() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(tmp.path());

        let first = FormulaLock::try_acquire(&paths, "wget").unwrap();
        assert!(first.path().ends_with("wget.formula.lock"));
        assert!(matches!(
            FormulaLock::try_acquire(&paths, "wget"),
            Err(BrewError::OperationInProgress(name)) if name == "wget"
        ));

        drop(first);
        assert!(FormulaLock::try_acquire(&paths, "wget").is_ok());
    }

    #[test]
    fn test_lock_set_is_all_or_nothing() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(tmp.path());
        let _other = FormulaLock::try_acquire(&paths, "openssl").unwrap();

        let mut set = LockSet::new();
        let err = set.acquire(&paths, ["curl", "openssl"]).unwrap_err();
        assert!(matches!(err, BrewError::OperationInProgress(_)));
        assert!(set.is_empty());
        // curl was released again
        assert!(FormulaLock::try_acquire(&paths, "curl").is_ok());
    }

    #[test]
    fn test_lock_set_skips_names_it_holds() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::with_prefix(tmp.path());
        let mut set = LockSet::new();
        set.acquire(&paths, ["a", "b"]).unwrap();
        set.acquire(&paths, ["b", "c"]).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.holds("c"));

        drop(set);
        assert!(FormulaLock::try_acquire(&paths, "a").is_ok());
    }
}
