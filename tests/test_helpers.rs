// Test helpers for isolated testing
// Provides safe test environments that don't modify the system
#![allow(dead_code)]

use brewkit::Result;
use brewkit::bottle::{self, BottleCellar, BottleSpec};
use brewkit::config::Paths;
use brewkit::download::sha256_file;
use brewkit::formulary::InMemorySource;
use brewkit::installer::Installer;
use brewkit::keg::Keg;
use brewkit::linkage::{Linkage, LinkageTool};
use brewkit::platform::BottleTag;
use brewkit::recipe::Recipe;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Platform tag the tests pretend to run on
pub const HOST_TAG: &str = "arm64_sonoma";

/// Isolated test environment using temporary directories
/// Automatically cleaned up when dropped (RAII pattern)
///
/// Layout:
/// - temp/
///   - prefix/     (Paths::with_prefix: Cellar, opt, var/brewkit/...)
///   - sources/    (source archives served over file://)
///   - bottles/    (bottle archives served over file://)
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub paths: Paths,
    pub prefix: PathBuf,
    pub cellar: PathBuf,
    pub sources: PathBuf,
    pub bottles: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let prefix = temp_dir.path().join("prefix");
        let paths = Paths::with_prefix(&prefix);
        let sources = temp_dir.path().join("sources");
        let bottles = temp_dir.path().join("bottles");

        fs::create_dir_all(&paths.cellar).unwrap();
        fs::create_dir_all(&sources).unwrap();
        fs::create_dir_all(&bottles).unwrap();

        Self {
            cellar: paths.cellar.clone(),
            temp_dir,
            paths,
            prefix,
            sources,
            bottles,
        }
    }

    /// Create `<cellar>/<name>/<version>` with the given files
    pub fn make_keg(&self, name: &str, version: &str, files: &[(&str, &str)]) -> Keg {
        let path = self.paths.keg_path(name, version);
        for (rel, body) in files {
            let file = path.join(rel);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(&file, body).unwrap();
        }
        fs::create_dir_all(&path).unwrap();
        Keg::open(&self.paths, path).unwrap()
    }

    /// A `<name>-<version>.tar.gz` source archive with a `<name>-<version>/`
    /// top directory. Returns its file:// URL and sha256.
    pub fn source_archive(&self, name: &str, version: &str, files: &[(&str, &str)]) -> (String, String) {
        let path = self.sources.join(format!("{}-{}.tar.gz", name, version));
        let top = format!("{}-{}", name, version);
        let entries: Vec<(String, &str)> = files
            .iter()
            .map(|(rel, body)| (format!("{}/{}", top, rel), *body))
            .collect();
        write_tarball(&path, &entries);
        let sha = sha256_file(&path).unwrap();
        (format!("file://{}", path.display()), sha)
    }

    /// A relocatable bottle for `HOST_TAG` with entries under `<name>/<version>/`
    pub fn bottle_archive(&self, name: &str, version: &str, files: &[(&str, &str)]) -> BottleSpec {
        let tag = BottleTag::from(HOST_TAG);
        let path = self.bottles.join(bottle::filename(name, version, &tag, 0));
        let entries: Vec<(String, &str)> = files
            .iter()
            .map(|(rel, body)| (format!("{}/{}/{}", name, version, rel), *body))
            .collect();
        write_tarball(&path, &entries);
        let sha = sha256_file(&path).unwrap();

        BottleSpec {
            root_url: format!("file://{}", self.bottles.display()),
            cellar: BottleCellar::Any,
            checksums: BTreeMap::from([(HOST_TAG.to_string(), sha)]),
            ..BottleSpec::default()
        }
    }

    /// A recipe built from a generated source archive by `steps`
    pub fn source_recipe(&self, name: &str, version: &str, files: &[(&str, &str)], steps: &[&str]) -> Recipe {
        let (url, sha) = self.source_archive(name, version, files);
        let mut recipe = Recipe::new(name, url, version);
        if let Some(stable) = recipe.stable.as_mut() {
            stable.sha256 = Some(sha);
        }
        recipe.install = steps.iter().map(|s| s.to_string()).collect();
        recipe
    }

    /// A recipe that installs one executable `bin/<name>` from source
    pub fn simple_recipe(&self, name: &str, version: &str) -> Recipe {
        let copy = format!("cp run.sh \"$PREFIX/bin/{}\"", name);
        self.source_recipe(
            name,
            version,
            &[("run.sh", "#!/bin/sh\necho ok\n")],
            &["mkdir -p \"$PREFIX/bin\"", copy.as_str()],
        )
    }

    pub fn installer(&self, recipes: Vec<Recipe>) -> Installer {
        Installer::new(
            self.paths.clone(),
            Arc::new(InMemorySource::new(recipes)),
            Arc::new(FakeLinkageTool),
            BottleTag::from(HOST_TAG),
        )
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

fn write_tarball(path: &Path, entries: &[(String, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, body) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

const FAKE_MAGIC: &str = "FAKEBIN\n";

/// Contents of a fake binary understood by [`FakeLinkageTool`]
pub fn fake_binary(id: Option<&str>, libraries: &[&str]) -> String {
    let mut out = String::from(FAKE_MAGIC);
    if let Some(id) = id {
        out.push_str(&format!("id {}\n", id));
    }
    for lib in libraries {
        out.push_str(&format!("lib {}\n", lib));
    }
    out
}

/// Stands in for otool/patchelf: a "binary" is a text file starting with
/// `FAKEBIN` followed by `id <name>` and `lib <name>` lines
pub struct FakeLinkageTool;

impl FakeLinkageTool {
    fn rewrite(path: &Path, edit: impl Fn(&str) -> Option<String>) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let updated: String = text
            .lines()
            .map(|line| edit(line).unwrap_or_else(|| line.to_string()) + "\n")
            .collect();
        fs::write(path, updated)?;
        Ok(())
    }
}

impl LinkageTool for FakeLinkageTool {
    fn is_linkable(&self, path: &Path) -> bool {
        fs::read(path).is_ok_and(|b| b.starts_with(FAKE_MAGIC.as_bytes()))
    }

    fn inspect(&self, path: &Path) -> Result<Linkage> {
        let text = fs::read_to_string(path)?;
        let mut linkage = Linkage::default();
        for line in text.lines() {
            if let Some(id) = line.strip_prefix("id ") {
                linkage.id = Some(id.to_string());
            } else if let Some(lib) = line.strip_prefix("lib ") {
                linkage.libraries.push(lib.to_string());
            }
        }
        Ok(linkage)
    }

    fn change_id(&self, path: &Path, id: &str) -> Result<()> {
        Self::rewrite(path, |line| line.starts_with("id ").then(|| format!("id {}", id)))
    }

    fn change_install_name(&self, path: &Path, old: &str, new: &str) -> Result<()> {
        Self::rewrite(path, |line| {
            (line.strip_prefix("lib ") == Some(old)).then(|| format!("lib {}", new))
        })
    }

    fn loader_relative(&self) -> Option<&'static str> {
        Some("@loader_path")
    }
}

/// Every path under `root` that is not inside one of `except`, relative to `root`
pub fn tree(root: &Path, except: &[&str]) -> Vec<String> {
    let mut entries: Vec<String> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .filter(|rel| !except.iter().any(|x| rel == x || rel.starts_with(&format!("{}/", x))))
        .collect();
    entries.sort();
    entries
}

pub fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new();

        assert!(env.cellar.exists());
        assert!(env.sources.exists());
        assert!(env.bottles.exists());
        assert_eq!(env.paths.prefix, env.prefix);
    }

    #[test]
    fn test_environment_cleanup() {
        let cellar_path = {
            let env = TestEnvironment::new();
            env.cellar.clone()
        };

        // After env is dropped, temp directory should be cleaned up
        assert!(!cellar_path.exists());
    }

    #[test]
    fn test_fake_linkage_tool() {
        let env = TestEnvironment::new();
        let file = env.temp_dir.path().join("libfoo.dylib");
        fs::write(&file, fake_binary(Some("/old/libfoo.dylib"), &["/old/libbar.dylib"])).unwrap();

        let tool = FakeLinkageTool;
        assert!(tool.is_linkable(&file));
        tool.change_id(&file, "/new/libfoo.dylib").unwrap();
        tool.change_install_name(&file, "/old/libbar.dylib", "/new/libbar.dylib").unwrap();

        let linkage = tool.inspect(&file).unwrap();
        assert_eq!(linkage.id.as_deref(), Some("/new/libfoo.dylib"));
        assert_eq!(linkage.libraries, vec!["/new/libbar.dylib"]);
    }
}
