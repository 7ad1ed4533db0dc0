// Integration tests for keg linking
//
// Kegs are laid out on disk in a temporary cellar and linked into the
// temporary prefix; nothing outside the TempDir is touched.

mod test_helpers;

use anyhow::Result;
use brewkit::BrewError;
use brewkit::keg;
use brewkit::link::{self, LinkMode};
use std::fs;
use test_helpers::{TestEnvironment, is_symlink, tree};

/// Prefix entries that are bookkeeping rather than the symlink farm
const BOOKKEEPING: &[&str] = &["Cellar", "opt", "var"];

fn foo_files() -> Vec<(&'static str, &'static str)> {
    vec![
        ("bin/foo", "#!/bin/sh\necho foo\n"),
        ("include/foo/foo.h", "int foo(void);\n"),
        ("lib/libfoo.dylib", "fake library"),
        ("lib/pkgconfig/foo.pc", "prefix=/usr/local\n"),
        ("share/man/man1/foo.1", ".TH FOO 1\n"),
        ("share/foo/data.txt", "data"),
        ("lib/charset.alias", "skip me"),
        ("share/.DS_Store", "junk"),
    ]
}

#[test]
fn test_link_then_unlink_restores_prefix() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = env.make_keg("foo", "1.0", &foo_files());
    let before = tree(&env.prefix, BOOKKEEPING);

    let report = link::link(&keg, LinkMode::default())?;
    assert!(report.links > 0);
    assert!(keg.is_linked());

    // Plain files and whole directories become symlinks
    assert!(is_symlink(&env.prefix.join("bin/foo")));
    assert!(is_symlink(&env.prefix.join("include/foo")));
    assert!(is_symlink(&env.prefix.join("share/foo")));
    // Shared directories are real
    assert!(!is_symlink(&env.prefix.join("lib/pkgconfig")));
    assert!(is_symlink(&env.prefix.join("lib/pkgconfig/foo.pc")));
    assert!(!is_symlink(&env.prefix.join("share/man/man1")));
    // Never linked
    assert!(!env.prefix.join("lib/charset.alias").exists());
    assert!(!env.prefix.join("share/.DS_Store").exists());

    // Links are relative and resolve into the keg
    let target = fs::read_link(env.prefix.join("bin/foo"))?;
    assert!(target.is_relative());
    assert_eq!(fs::read_to_string(env.prefix.join("bin/foo"))?, "#!/bin/sh\necho foo\n");

    let removed = link::unlink(&keg)?;
    assert_eq!(removed, report.links);
    assert!(!keg.is_linked());
    assert_eq!(tree(&env.prefix, BOOKKEEPING), before);

    // The opt record outlives unlinking
    assert!(is_symlink(&keg.opt_record()));
    Ok(())
}

#[test]
fn test_link_is_idempotent() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = env.make_keg("foo", "1.0", &foo_files());

    let first = link::link(&keg, LinkMode::default())?;
    let second = link::link(&keg, LinkMode::default())?;

    assert!(first.links > 0);
    assert_eq!(second.links, 0);
    Ok(())
}

#[test]
fn test_two_packages_share_mkpath_directories() -> Result<()> {
    let env = TestEnvironment::new();
    let foo = env.make_keg("foo", "1.0", &[("lib/pkgconfig/foo.pc", "foo"), ("share/man/man1/foo.1", "foo")]);
    let bar = env.make_keg("bar", "2.0", &[("lib/pkgconfig/bar.pc", "bar"), ("share/man/man1/bar.1", "bar")]);

    link::link(&foo, LinkMode::default())?;
    link::link(&bar, LinkMode::default())?;

    for file in ["lib/pkgconfig/foo.pc", "lib/pkgconfig/bar.pc", "share/man/man1/foo.1", "share/man/man1/bar.1"] {
        assert!(is_symlink(&env.prefix.join(file)), "{} not linked", file);
    }

    // Unlinking one leaves the other's files and the shared directory
    link::unlink(&foo)?;
    assert!(!env.prefix.join("lib/pkgconfig/foo.pc").exists());
    assert!(is_symlink(&env.prefix.join("lib/pkgconfig/bar.pc")));
    Ok(())
}

#[test]
fn test_directory_symlink_is_expanded_for_second_package() -> Result<()> {
    let env = TestEnvironment::new();
    let foo = env.make_keg("foo", "1.0", &[("share/common/foo.txt", "foo")]);
    let bar = env.make_keg("bar", "1.0", &[("share/common/bar.txt", "bar")]);

    link::link(&foo, LinkMode::default())?;
    assert!(is_symlink(&env.prefix.join("share/common")));

    link::link(&bar, LinkMode::default())?;
    let common = env.prefix.join("share/common");
    assert!(!is_symlink(&common));
    assert!(is_symlink(&common.join("foo.txt")));
    assert!(is_symlink(&common.join("bar.txt")));
    assert_eq!(fs::read_to_string(common.join("foo.txt"))?, "foo");

    link::unlink(&bar)?;
    assert!(!common.join("bar.txt").exists());
    assert!(common.join("foo.txt").exists());
    Ok(())
}

#[test]
fn test_second_version_of_same_package_is_refused() -> Result<()> {
    let env = TestEnvironment::new();
    let old = env.make_keg("foo", "1.0", &[("bin/foo", "1.0")]);
    let new = env.make_keg("foo", "2.0", &[("bin/foo", "2.0"), ("bin/foo-extra", "2.0")]);

    link::link(&old, LinkMode::default())?;
    let before = tree(&env.prefix, &["Cellar"]);

    match link::link(&new, LinkMode::default()) {
        Err(BrewError::AlreadyLinked { formula, linked }) => {
            assert_eq!(formula, "foo");
            assert!(keg::linked_keg_path(&env.paths, "foo").is_some());
            assert!(linked.ends_with("foo/1.0"));
        }
        other => panic!("expected AlreadyLinked, got {:?}", other),
    }

    assert_eq!(tree(&env.prefix, &["Cellar"]), before);
    assert_eq!(fs::read_to_string(env.prefix.join("bin/foo"))?, "1.0");
    Ok(())
}

#[test]
fn test_conflict_rolls_back_partial_links() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = env.make_keg("foo", "1.0", &[("bin/aaa", "a"), ("bin/zzz", "z")]);

    // A stray file the keg wants to own, reached after bin/aaa was linked
    fs::create_dir_all(env.prefix.join("bin"))?;
    fs::write(env.prefix.join("bin/zzz"), "not ours")?;

    let err = link::link(&keg, LinkMode::default()).unwrap_err();
    assert!(matches!(err, BrewError::LinkConflict { .. }), "{:?}", err);

    assert!(!env.prefix.join("bin/aaa").exists());
    assert_eq!(fs::read_to_string(env.prefix.join("bin/zzz"))?, "not ours");
    assert!(!keg.is_linked());
    Ok(())
}

#[test]
fn test_dry_run_touches_nothing() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = env.make_keg("foo", "1.0", &foo_files());
    let before = tree(&env.prefix, &["Cellar"]);

    let report = link::link(
        &keg,
        LinkMode {
            dry_run: true,
            overwrite: false,
        },
    )?;

    assert_eq!(report.links, 0);
    assert!(report.would_link.contains(&env.prefix.join("bin/foo")));
    assert!(report.would_link.contains(&env.prefix.join("lib/pkgconfig/foo.pc")));
    assert_eq!(tree(&env.prefix, &["Cellar"]), before);
    Ok(())
}

#[test]
fn test_overwrite_replaces_conflicting_files() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = env.make_keg("foo", "1.0", &[("bin/foo", "ours")]);
    fs::create_dir_all(env.prefix.join("bin"))?;
    fs::write(env.prefix.join("bin/foo"), "theirs")?;

    let dry = link::link(
        &keg,
        LinkMode {
            dry_run: true,
            overwrite: true,
        },
    )?;
    assert_eq!(dry.would_overwrite, vec![env.prefix.join("bin/foo")]);
    assert_eq!(fs::read_to_string(env.prefix.join("bin/foo"))?, "theirs");

    link::link(
        &keg,
        LinkMode {
            dry_run: false,
            overwrite: true,
        },
    )?;
    assert!(is_symlink(&env.prefix.join("bin/foo")));
    assert_eq!(fs::read_to_string(env.prefix.join("bin/foo"))?, "ours");
    Ok(())
}

#[test]
fn test_unlink_leaves_foreign_files() -> Result<()> {
    let env = TestEnvironment::new();
    let keg = env.make_keg("foo", "1.0", &[("bin/foo", "ours")]);
    link::link(&keg, LinkMode::default())?;
    fs::write(env.prefix.join("bin/other"), "someone else's")?;

    assert_eq!(link::unlink(&keg)?, 1);
    assert!(env.prefix.join("bin/other").exists());
    assert!(env.prefix.join("bin").is_dir());
    Ok(())
}
