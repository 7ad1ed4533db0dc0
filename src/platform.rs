//! Platform detection and bottle tag arithmetic.
//!
//! Bottles are published per platform tag, e.g. `arm64_sonoma`, `x86_64_linux`
//! or (for PowerPC-era systems) `tiger_g4`. The host's tag is matched against a
//! bottle's checksum table with a few fallbacks, see [`crate::bottle::BottleSpec::find`].
//!
//! # Examples
//!
//! ```no_run
//! use brewkit::platform;
//!
//! fn main() -> brewkit::Result<()> {
//!     let tag = platform::detect_bottle_tag()?;
//!     println!("This system pours: {}", tag);
//!     Ok(())
//! }
//! ```

use crate::error::Result;
#[cfg(not(target_os = "linux"))]
use crate::error::BrewError;
use std::cmp::Ordering;
use std::fmt;
#[cfg(target_os = "macos")]
use std::process::Command;

/// macOS release names and their versions, oldest first
const MACOS_RELEASES: &[(&str, OsVersion)] = &[
    ("tiger", OsVersion(10, 4)),
    ("leopard", OsVersion(10, 5)),
    ("snow_leopard", OsVersion(10, 6)),
    ("lion", OsVersion(10, 7)),
    ("mountain_lion", OsVersion(10, 8)),
    ("mavericks", OsVersion(10, 9)),
    ("yosemite", OsVersion(10, 10)),
    ("el_capitan", OsVersion(10, 11)),
    ("sierra", OsVersion(10, 12)),
    ("high_sierra", OsVersion(10, 13)),
    ("mojave", OsVersion(10, 14)),
    ("catalina", OsVersion(10, 15)),
    ("big_sur", OsVersion(11, 0)),
    ("monterey", OsVersion(12, 0)),
    ("ventura", OsVersion(13, 0)),
    ("sonoma", OsVersion(14, 0)),
    ("sequoia", OsVersion(15, 0)),
    ("tahoe", OsVersion(26, 0)),
];

const ARCH_PREFIXES: &[&str] = &["arm64", "x86_64"];
const CPU_SUFFIXES: &[&str] = &["_g3", "_g4", "_g4e", "_g5", "_64", "_32", "_altivec"];

/// A `major.minor` operating system version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion(pub u32, pub u32);

impl OsVersion {
    /// Parse `"10.9"`, `"14"` or `"14.2.1"`
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(|m| m.parse().ok()).unwrap_or(Some(0))?;
        Some(Self(major, minor))
    }

    /// Look up a release name such as `mavericks`
    pub fn from_release_name(name: &str) -> Option<Self> {
        MACOS_RELEASES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// The release name for this version, if it is a known macOS release
    pub fn release_name(&self) -> Option<&'static str> {
        // 11+ only track the major version
        let key = if self.0 >= 11 {
            OsVersion(self.0, 0)
        } else {
            *self
        };
        MACOS_RELEASES
            .iter()
            .find(|(_, v)| *v == key)
            .map(|(n, _)| *n)
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

/// A bottle platform tag such as `arm64_sonoma`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BottleTag(String);

impl BottleTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into the optional architecture prefix and the remainder
    fn split_arch(&self) -> (Option<&str>, &str) {
        for arch in ARCH_PREFIXES {
            if let Some(rest) = self.0.strip_prefix(arch).and_then(|r| r.strip_prefix('_')) {
                return (Some(*arch), rest);
            }
        }
        (None, &self.0)
    }

    /// Architecture prefix of the tag, if any
    pub fn arch(&self) -> Option<&str> {
        self.split_arch().0
    }

    /// The macOS version this tag targets, ignoring CPU suffixes
    pub fn os_version(&self) -> Option<OsVersion> {
        let (_, mut rest) = self.split_arch();
        for suffix in CPU_SUFFIXES {
            match rest.strip_suffix(suffix) {
                Some(stripped) if OsVersion::from_release_name(stripped).is_some() => {
                    rest = stripped;
                    break;
                }
                _ => {}
            }
        }
        OsVersion::from_release_name(rest)
    }

    /// `tiger_g4` → `tiger_altivec`; generic Altivec bottles serve all G4/G5 CPUs
    pub fn altivec_variant(&self) -> Option<BottleTag> {
        for cpu in ["_g4e", "_g4", "_g5"] {
            match self.0.strip_suffix(cpu) {
                Some(os) if !os.is_empty() => {
                    return Some(BottleTag(format!("{}_altivec", os)));
                }
                _ => {}
            }
        }
        None
    }

    /// For an `X_or_later` tag, the tag it is anchored on
    pub fn or_later_base(&self) -> Option<BottleTag> {
        self.0
            .strip_suffix("_or_later")
            .filter(|b| !b.is_empty())
            .map(|b| BottleTag(b.to_string()))
    }

    /// Whether an `X_or_later` tag covers this (host) tag
    pub fn is_covered_by_or_later(&self, key: &BottleTag) -> bool {
        let Some(base) = key.or_later_base() else {
            return false;
        };
        if base.arch() != self.arch() {
            return false;
        }
        match (base.os_version(), self.os_version()) {
            (Some(base_v), Some(host_v)) => base_v.cmp(&host_v) != Ordering::Greater,
            _ => false,
        }
    }
}

impl fmt::Display for BottleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BottleTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Homebrew names Apple Silicon `arm64`, Rust calls it `aarch64`
pub fn homebrew_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        arch => arch,
    }
}

/// Detect the current system platform for bottle selection.
///
/// Returns e.g. `arm64_sequoia` on an Apple Silicon Mac running macOS 15 or
/// `x86_64_linux` on Linux.
///
/// # Errors
///
/// Returns an error on macOS when `sw_vers` is unavailable, and on operating
/// systems that have no bottles at all.
pub fn detect_bottle_tag() -> Result<BottleTag> {
    #[cfg(target_os = "macos")]
    {
        let version = macos_version()?;
        let name = version.release_name().unwrap_or("sonoma");
        Ok(BottleTag(format!("{}_{}", homebrew_arch(), name)))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(BottleTag(format!("{}_linux", homebrew_arch())))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(BrewError::Other(anyhow::anyhow!("Unsupported platform")))
    }
}

/// The host macOS version, `None` on other systems
pub fn host_os_version() -> Option<OsVersion> {
    #[cfg(target_os = "macos")]
    {
        macos_version().ok()
    }
    #[cfg(not(target_os = "macos"))]
    {
        None
    }
}

#[cfg(target_os = "macos")]
fn macos_version() -> Result<OsVersion> {
    let output = Command::new("sw_vers").arg("-productVersion").output()?;
    let raw = String::from_utf8_lossy(&output.stdout);
    OsVersion::parse(&raw).ok_or_else(|| {
        BrewError::Other(anyhow::anyhow!("Unexpected sw_vers output: {}", raw.trim()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_bottle_tag() {
        let tag = detect_bottle_tag().unwrap();
        assert!(!tag.as_str().is_empty());
        #[cfg(target_arch = "aarch64")]
        assert!(tag.as_str().starts_with("arm64_"));
        #[cfg(target_arch = "x86_64")]
        assert!(tag.as_str().starts_with("x86_64_"));
    }

    #[test]
    fn test_release_names() {
        assert_eq!(OsVersion(15, 1).release_name(), Some("sequoia"));
        assert_eq!(OsVersion(10, 9).release_name(), Some("mavericks"));
        assert_eq!(OsVersion(10, 3).release_name(), None);
        assert_eq!(OsVersion::parse("10.10.5"), Some(OsVersion(10, 10)));
        assert_eq!(OsVersion::parse("14"), Some(OsVersion(14, 0)));
    }

    #[test]
    fn test_tag_os_version() {
        assert_eq!(BottleTag::from("arm64_sonoma").os_version(), Some(OsVersion(14, 0)));
        assert_eq!(BottleTag::from("tiger_g4e").os_version(), Some(OsVersion(10, 4)));
        assert_eq!(BottleTag::from("snow_leopard_32").os_version(), Some(OsVersion(10, 6)));
        assert_eq!(BottleTag::from("x86_64_linux").os_version(), None);
    }

    #[test]
    fn test_altivec_variant() {
        assert_eq!(
            BottleTag::from("tiger_g4e").altivec_variant(),
            Some(BottleTag::from("tiger_altivec"))
        );
        assert_eq!(
            BottleTag::from("leopard_g5").altivec_variant(),
            Some(BottleTag::from("leopard_altivec"))
        );
        assert_eq!(BottleTag::from("arm64_sonoma").altivec_variant(), None);
    }

    #[test]
    fn test_or_later_coverage() {
        let host = BottleTag::from("arm64_sonoma");
        assert!(host.is_covered_by_or_later(&BottleTag::from("arm64_ventura_or_later")));
        assert!(host.is_covered_by_or_later(&BottleTag::from("arm64_sonoma_or_later")));
        assert!(!host.is_covered_by_or_later(&BottleTag::from("arm64_sequoia_or_later")));
        assert!(!host.is_covered_by_or_later(&BottleTag::from("x86_64_ventura_or_later")));
        assert!(!host.is_covered_by_or_later(&BottleTag::from("arm64_ventura")));

        let old = BottleTag::from("leopard");
        assert!(old.is_covered_by_or_later(&BottleTag::from("tiger_or_later")));
    }
}
