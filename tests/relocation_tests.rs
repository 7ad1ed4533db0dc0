// Integration tests for keg relocation
//
// Binaries are fake text files edited through FakeLinkageTool, so the same
// tests run on any host without otool or patchelf.

mod test_helpers;

use anyhow::Result;
use brewkit::BrewError;
use brewkit::bottle::{self, BottleCellar};
use brewkit::linkage::LinkageTool;
use brewkit::platform::BottleTag;
use brewkit::relocate::{self, CELLAR_PLACEHOLDER, PREFIX_PLACEHOLDER};
use flate2::read::GzDecoder;
use pretty_assertions::assert_eq;
use std::fs;
use std::io::Read;
use std::path::Path;
use test_helpers::{FakeLinkageTool, HOST_TAG, TestEnvironment, fake_binary};

/// Contents of every file under `root`, keyed by relative path
fn snapshot(root: &Path) -> Vec<(String, String)> {
    let mut files: Vec<(String, String)> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
            (rel, fs::read_to_string(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

/// A keg whose library and pkg-config file point at the host layout
fn host_keg(env: &TestEnvironment) -> brewkit::keg::Keg {
    let cellar = env.paths.cellar_str();
    let prefix = env.paths.prefix_str();
    let id = format!("{}/foo/1.0/lib/libfoo.dylib", cellar);
    let dep = format!("{}/opt/bar/lib/libbar.dylib", prefix);
    let library = fake_binary(Some(&id), &[&dep, "/usr/lib/libSystem.B.dylib"]);
    let pc = format!("prefix={}/foo/1.0\nlibdir={}/opt/foo/lib\n", cellar, prefix);

    env.make_keg(
        "foo",
        "1.0",
        &[
            ("lib/libfoo.dylib", library.as_str()),
            ("lib/pkgconfig/foo.pc", pc.as_str()),
            ("share/doc/README", "plain text"),
        ],
    )
}

#[test]
fn test_baking_is_undone_after_archiving() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = host_keg(&env);
    let before = snapshot(keg.path());
    let lib = keg.path().join("lib/libfoo.dylib");
    let pc = keg.path().join("lib/pkgconfig/foo.pc");

    let (baked_lib, baked_pc) = relocate::with_baked(keg.path(), &env.paths, &FakeLinkageTool, || {
        Ok((fs::read_to_string(&lib)?, fs::read_to_string(&pc)?))
    })?;

    assert!(baked_lib.contains(&format!("id {}/foo/1.0/lib/libfoo.dylib", CELLAR_PLACEHOLDER)));
    assert!(baked_lib.contains(&format!("lib {}/opt/bar/lib/libbar.dylib", PREFIX_PLACEHOLDER)));
    assert!(baked_lib.contains("lib /usr/lib/libSystem.B.dylib"));
    assert!(!baked_lib.contains(&env.paths.prefix_str()));
    assert_eq!(
        baked_pc,
        format!(
            "prefix={}/foo/1.0\nlibdir={}/opt/foo/lib\n",
            CELLAR_PLACEHOLDER, PREFIX_PLACEHOLDER
        )
    );

    assert_eq!(snapshot(keg.path()), before);
    Ok(())
}

#[test]
fn test_keg_is_restored_when_archiving_fails() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = host_keg(&env);
    let before = snapshot(keg.path());

    let result: brewkit::Result<()> =
        relocate::with_baked(keg.path(), &env.paths, &FakeLinkageTool, || Err(BrewError::Interrupted));

    assert!(matches!(result, Err(BrewError::Interrupted)));
    assert_eq!(snapshot(keg.path()), before);
    Ok(())
}

#[test]
fn test_pour_replaces_placeholders() -> Result<()> {
    let env = TestEnvironment::new();
    let id = format!("{}/foo/1.0/lib/libfoo.dylib", CELLAR_PLACEHOLDER);
    let dep = format!("{}/opt/bar/lib/libbar.dylib", PREFIX_PLACEHOLDER);
    let library = fake_binary(Some(&id), &[&dep]);
    let keg = env.make_keg(
        "foo",
        "1.0",
        &[
            ("lib/libfoo.dylib", library.as_str()),
            ("bin/foo-config", "echo @@HOMEBREW_PREFIX@@/include\n"),
        ],
    );

    let report = relocate::pour(keg.path(), &env.paths, None, &FakeLinkageTool)?;
    assert_eq!(report.binaries, 1);
    assert_eq!(report.text_files, 1);

    let linkage = FakeLinkageTool.inspect(&keg.path().join("lib/libfoo.dylib"))?;
    assert_eq!(
        linkage.id,
        Some(format!("{}/foo/1.0/lib/libfoo.dylib", env.paths.cellar_str()))
    );
    assert_eq!(
        linkage.libraries,
        vec![format!("{}/opt/bar/lib/libbar.dylib", env.paths.prefix_str())]
    );
    assert_eq!(
        fs::read_to_string(keg.path().join("bin/foo-config"))?,
        format!("echo {}/include\n", env.paths.prefix_str())
    );
    Ok(())
}

#[test]
fn test_pour_rewrites_paths_recorded_by_foreign_bottle() -> Result<()> {
    let env = TestEnvironment::new();
    let library = fake_binary(
        Some("/usr/local/Cellar/foo/1.0/lib/libfoo.dylib"),
        &["/usr/local/opt/bar/lib/libbar.dylib", "/usr/localized/lib/libx.dylib"],
    );
    let keg = env.make_keg("foo", "1.0", &[("lib/libfoo.dylib", library.as_str())]);

    relocate::pour(
        keg.path(),
        &env.paths,
        Some(("/usr/local", "/usr/local/Cellar")),
        &FakeLinkageTool,
    )?;

    let linkage = FakeLinkageTool.inspect(&keg.path().join("lib/libfoo.dylib"))?;
    assert_eq!(
        linkage.id,
        Some(format!("{}/foo/1.0/lib/libfoo.dylib", env.paths.cellar_str()))
    );
    assert_eq!(
        linkage.libraries,
        vec![
            format!("{}/opt/bar/lib/libbar.dylib", env.paths.prefix_str()),
            "/usr/localized/lib/libx.dylib".to_string(),
        ]
    );
    Ok(())
}

#[test]
fn test_fix_install_names_repoints_build_paths() -> Result<()> {
    let env = TestEnvironment::new();
    let temp = env.paths.temp.display().to_string();
    let build_id = format!("{}/foo-build/lib/libfoo.dylib", temp);
    let build_dep = format!("{}/foo-build/lib/libfoo.dylib", temp);
    let lost = format!("{}/foo-build/lib/libgone.dylib", temp);

    let library = fake_binary(Some(&build_id), &["/usr/lib/libSystem.B.dylib"]);
    let program = fake_binary(None, &[&build_dep, &lost]);
    let keg = env.make_keg(
        "foo",
        "1.0",
        &[("lib/libfoo.dylib", library.as_str()), ("bin/foo", program.as_str())],
    );
    let opt = env.paths.opt_record("foo");

    let report = relocate::fix_install_names(keg.path(), &opt, &env.paths, &FakeLinkageTool)?;
    assert_eq!(report.binaries, 2);
    assert_eq!(report.edits, 2);

    let lib = FakeLinkageTool.inspect(&keg.path().join("lib/libfoo.dylib"))?;
    assert_eq!(lib.id, Some(opt.join("lib/libfoo.dylib").display().to_string()));
    assert_eq!(lib.libraries, vec!["/usr/lib/libSystem.B.dylib"]);

    // The missing library is left as it was
    let bin = FakeLinkageTool.inspect(&keg.path().join("bin/foo"))?;
    assert_eq!(
        bin.libraries,
        vec![opt.join("lib/libfoo.dylib").display().to_string(), lost]
    );
    Ok(())
}

#[test]
fn test_fix_install_names_resolves_relative_names() -> Result<()> {
    let env = TestEnvironment::new();
    let placeholder = format!("{}/opt/baz/lib/libbaz.dylib", PREFIX_PLACEHOLDER);
    let cellar_id = format!("{}/foo/1.0/lib/libbar.dylib", env.paths.cellar.display());

    let libfoo = fake_binary(Some("libfoo.1.dylib"), &["libbar.dylib"]);
    let libbar = fake_binary(Some(&cellar_id), &[]);
    let program = fake_binary(
        None,
        &["libfoo.1.dylib", "@rpath/libz.dylib", &placeholder, "libmissing.dylib"],
    );
    let keg = env.make_keg(
        "foo",
        "1.0",
        &[
            ("lib/libfoo.1.dylib", libfoo.as_str()),
            ("lib/libbar.dylib", libbar.as_str()),
            ("bin/foo", program.as_str()),
        ],
    );
    let opt = env.paths.opt_record("foo");

    let report = relocate::fix_install_names(keg.path(), &opt, &env.paths, &FakeLinkageTool)?;
    assert_eq!(report.binaries, 3);
    assert_eq!(report.edits, 5);

    // A library finds its sibling relative to itself
    let lib = FakeLinkageTool.inspect(&keg.path().join("lib/libfoo.1.dylib"))?;
    assert_eq!(lib.id, Some(opt.join("lib/libfoo.1.dylib").display().to_string()));
    assert_eq!(lib.libraries, vec!["@loader_path/libbar.dylib"]);

    let lib = FakeLinkageTool.inspect(&keg.path().join("lib/libbar.dylib"))?;
    assert_eq!(lib.id, Some(opt.join("lib/libbar.dylib").display().to_string()));

    let bin = FakeLinkageTool.inspect(&keg.path().join("bin/foo"))?;
    assert_eq!(
        bin.libraries,
        vec![
            opt.join("lib/libfoo.1.dylib").display().to_string(),
            "@rpath/libz.dylib".to_string(),
            env.paths.prefix.join("opt/baz/lib/libbaz.dylib").display().to_string(),
            "libmissing.dylib".to_string(),
        ]
    );
    Ok(())
}

/// Read one entry of a bottle archive
fn archived(archive: &Path, entry: &str) -> Result<String> {
    let mut tar = tar::Archive::new(GzDecoder::new(fs::File::open(archive)?));
    for file in tar.entries()? {
        let mut file = file?;
        if file.path()?.to_string_lossy() == entry {
            let mut body = String::new();
            file.read_to_string(&mut body)?;
            return Ok(body);
        }
    }
    anyhow::bail!("{} not found in {}", entry, archive.display())
}

#[test]
fn test_bake_bottle_produces_relocatable_archive() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = host_keg(&env);
    let before = snapshot(keg.path());
    let out = env.temp_dir.path().join("out");
    let tag = BottleTag::from(HOST_TAG);

    let baked = bottle::bake_bottle(&keg, &FakeLinkageTool, &out, &tag, 0)?;

    assert_eq!(baked.path, out.join("foo-1.0.arm64_sonoma.bottle.tar.gz"));
    assert_eq!(baked.spec.cellar, BottleCellar::Any);
    assert_eq!(baked.spec.checksums.get(HOST_TAG), Some(&baked.sha256));
    assert_eq!(snapshot(keg.path()), before);

    let pc = archived(&baked.path, "foo/1.0/lib/pkgconfig/foo.pc")?;
    assert!(pc.starts_with(&format!("prefix={}/foo/1.0", CELLAR_PLACEHOLDER)));
    let lib = archived(&baked.path, "foo/1.0/lib/libfoo.dylib")?;
    assert!(lib.contains(PREFIX_PLACEHOLDER));
    Ok(())
}

#[test]
fn test_bake_bottle_pins_cellar_when_paths_remain() -> Result<()> {
    let env = TestEnvironment::new();
    // A prefix mention in a file relocation does not rewrite
    let notes = format!("installed under {}\n", env.paths.prefix_str());
    let keg = env.make_keg("foo", "1.0", &[("share/doc/NOTES", notes.as_str())]);
    let out = env.temp_dir.path().join("out");

    let baked = bottle::bake_bottle(&keg, &FakeLinkageTool, &out, &BottleTag::from(HOST_TAG), 1)?;

    assert_eq!(baked.spec.cellar, BottleCellar::Path(env.paths.cellar_str()));
    assert_eq!(baked.spec.rebuild, 1);
    assert!(baked.path.ends_with("foo-1.0.arm64_sonoma.bottle.1.tar.gz"));
    assert_eq!(archived(&baked.path, "foo/1.0/share/doc/NOTES")?, notes);
    Ok(())
}
