//! Reading and editing the dynamic-library metadata of binaries.
//!
//! Relocation only needs four primitives: recognise a linkable file, list its
//! own identity plus the libraries it loads, and rewrite either one. Mach-O
//! files are handled with `otool`/`install_name_tool`, ELF files are read with
//! goblin and edited with `patchelf`. Both editors may grow the file, callers
//! never have to preserve byte lengths.

use crate::error::{BrewError, Result};
use goblin::elf::Elf;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::Command;

/// Load metadata of one binary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Linkage {
    /// Install name (Mach-O) or soname (ELF) of a shared library
    pub id: Option<String>,
    /// Libraries the file loads, plus ELF run paths
    pub libraries: Vec<String>,
}

/// Binary-metadata editing primitive
pub trait LinkageTool: Send + Sync {
    /// Whether `path` is a binary this tool understands
    fn is_linkable(&self, path: &Path) -> bool;

    fn inspect(&self, path: &Path) -> Result<Linkage>;

    fn change_id(&self, path: &Path, id: &str) -> Result<()>;

    fn change_install_name(&self, path: &Path, old: &str, new: &str) -> Result<()>;

    /// Prefix a binary can use for paths relative to itself, e.g. `@loader_path`
    fn loader_relative(&self) -> Option<&'static str> {
        None
    }

    /// Whether ids and load names are file paths (Mach-O) rather than bare
    /// sonames (ELF)
    fn names_are_paths(&self) -> bool {
        true
    }
}

/// The tool for the host's binary format
pub fn native() -> Box<dyn LinkageTool> {
    if cfg!(target_os = "macos") {
        Box::new(MachOTool)
    } else {
        Box::new(ElfTool)
    }
}

fn read_magic(path: &Path) -> Option<[u8; 4]> {
    // Only the first 4 bytes, never the whole file
    let mut file = fs::File::open(path).ok()?;
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes).ok()?;
    Some(bytes)
}

fn tool_failed(path: &Path, tool: &str, stderr: &[u8]) -> BrewError {
    BrewError::Relocation {
        path: path.to_path_buf(),
        reason: format!("{} failed: {}", tool, String::from_utf8_lossy(stderr).trim()),
    }
}

/// Mach-O via Xcode command line tools
#[derive(Debug, Clone, Copy, Default)]
pub struct MachOTool;

impl MachOTool {
    fn otool(&self, flag: &str, path: &Path) -> Result<String> {
        let output = Command::new("otool")
            .arg(flag)
            .arg(path)
            .output()
            .map_err(|e| BrewError::Relocation {
                path: path.to_path_buf(),
                reason: format!("failed to run otool: {}", e),
            })?;
        if !output.status.success() {
            return Err(tool_failed(path, "otool", &output.stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn install_name_tool(&self, path: &Path, args: &[&str]) -> Result<()> {
        let output = Command::new("install_name_tool")
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| BrewError::Relocation {
                path: path.to_path_buf(),
                reason: format!("failed to run install_name_tool: {}", e),
            })?;

        if !output.status.success() {
            // Code signature warnings are noise
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("warning:") {
                return Err(tool_failed(path, "install_name_tool", &output.stderr));
            }
        }
        Ok(())
    }
}

/// `path (compatibility version X, current version Y)` → `path`
fn otool_entry(line: &str) -> Option<&str> {
    let entry = line.trim().split(" (").next()?.trim();
    (!entry.is_empty()).then_some(entry)
}

impl LinkageTool for MachOTool {
    fn is_linkable(&self, path: &Path) -> bool {
        match read_magic(path) {
            Some(bytes) => matches!(
                u32::from_be_bytes(bytes),
                0xfeedface | 0xfeedfacf | 0xcefaedfe | 0xcffaedfe | 0xcafebabe | 0xbebafeca
            ),
            None => false,
        }
    }

    fn inspect(&self, path: &Path) -> Result<Linkage> {
        // otool -D prints the file name, then the id if there is one
        let id = self
            .otool("-D", path)?
            .lines()
            .nth(1)
            .and_then(otool_entry)
            .map(String::from);

        let libraries = self
            .otool("-L", path)?
            .lines()
            .skip(1)
            .filter_map(otool_entry)
            .filter(|lib| Some(*lib) != id.as_deref())
            .map(String::from)
            .collect();

        Ok(Linkage { id, libraries })
    }

    fn change_id(&self, path: &Path, id: &str) -> Result<()> {
        self.install_name_tool(path, &["-id", id])
    }

    fn change_install_name(&self, path: &Path, old: &str, new: &str) -> Result<()> {
        self.install_name_tool(path, &["-change", old, new])
    }

    fn loader_relative(&self) -> Option<&'static str> {
        Some("@loader_path")
    }
}

/// ELF: goblin for reading, patchelf for editing
#[derive(Debug, Clone, Copy, Default)]
pub struct ElfTool;

impl ElfTool {
    fn patchelf(&self, path: &Path, args: &[&str]) -> Result<()> {
        let output = Command::new("patchelf")
            .args(args)
            .arg(path)
            .output()
            .map_err(|e| BrewError::Relocation {
                path: path.to_path_buf(),
                reason: format!("failed to run patchelf: {}", e),
            })?;
        if !output.status.success() {
            return Err(tool_failed(path, "patchelf", &output.stderr));
        }
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<(Option<String>, Vec<String>, Vec<String>)> {
        let bytes = fs::read(path)?;
        let elf = Elf::parse(&bytes).map_err(|e| BrewError::Relocation {
            path: path.to_path_buf(),
            reason: format!("unreadable ELF: {}", e),
        })?;

        let soname = elf.soname.map(String::from);
        let needed = elf.libraries.iter().map(|l| l.to_string()).collect();
        let run_paths = elf
            .runpaths
            .iter()
            .chain(elf.rpaths.iter())
            .flat_map(|p| p.split(':'))
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        Ok((soname, needed, run_paths))
    }
}

impl LinkageTool for ElfTool {
    fn is_linkable(&self, path: &Path) -> bool {
        read_magic(path).is_some_and(|m| m == *b"\x7fELF")
    }

    fn inspect(&self, path: &Path) -> Result<Linkage> {
        let (id, mut libraries, run_paths) = self.read(path)?;
        libraries.extend(run_paths);
        Ok(Linkage { id, libraries })
    }

    fn change_id(&self, path: &Path, id: &str) -> Result<()> {
        self.patchelf(path, &["--set-soname", id])
    }

    fn change_install_name(&self, path: &Path, old: &str, new: &str) -> Result<()> {
        let (_, needed, run_paths) = self.read(path)?;
        if needed.iter().any(|n| n == old) {
            return self.patchelf(path, &["--replace-needed", old, new]);
        }

        if run_paths.iter().any(|p| p == old) {
            let rpath = run_paths
                .iter()
                .map(|p| if p == old { new } else { p.as_str() })
                .collect::<Vec<_>>()
                .join(":");
            return self.patchelf(path, &["--set-rpath", &rpath]);
        }

        Err(BrewError::Relocation {
            path: path.to_path_buf(),
            reason: format!("{} is not referenced", old),
        })
    }

    fn names_are_paths(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_otool_entry() {
        assert_eq!(
            otool_entry("\t/usr/lib/libSystem.B.dylib (compatibility version 1.0.0, current version 1311.0.0)"),
            Some("/usr/lib/libSystem.B.dylib")
        );
        assert_eq!(otool_entry("   "), None);
    }

    #[test]
    fn test_magic_detection() {
        let tmp = TempDir::new().unwrap();
        let macho = tmp.path().join("macho");
        fs::write(&macho, [0xcf, 0xfa, 0xed, 0xfe, 0, 0]).unwrap();
        let fat = tmp.path().join("fat");
        fs::write(&fat, [0xca, 0xfe, 0xba, 0xbe]).unwrap();
        let elf = tmp.path().join("elf");
        fs::write(&elf, b"\x7fELF\x02\x01").unwrap();
        let text = tmp.path().join("text");
        fs::write(&text, b"#!/bin/sh\n").unwrap();
        let short = tmp.path().join("short");
        fs::write(&short, b"ab").unwrap();

        assert!(MachOTool.is_linkable(&macho));
        assert!(MachOTool.is_linkable(&fat));
        assert!(!MachOTool.is_linkable(&elf));
        assert!(ElfTool.is_linkable(&elf));
        assert!(!ElfTool.is_linkable(&text));
        assert!(!ElfTool.is_linkable(&short));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_inspect_system_elf() {
        // /bin/sh is dynamically linked on every mainstream distribution
        let sh = Path::new("/bin/sh");
        let real = fs::canonicalize(sh).unwrap();
        if !ElfTool.is_linkable(&real) {
            return;
        }
        let linkage = ElfTool.inspect(&real).unwrap();
        assert!(linkage.libraries.iter().any(|l| l.starts_with("libc")));
    }
}
