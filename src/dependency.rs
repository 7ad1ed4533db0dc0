//! Dependency edges and non-package requirements.
//!
//! A [`Dependency`] names another recipe and carries [`Tag`]s describing when
//! it is needed. Two dependencies with the same name are the same dependency:
//! equality and hashing ignore tags, which lets expansion merge repeated edges.
//!
//! A [`Requirement`] is a precondition on the host (a tool on PATH, an OS
//! version, an architecture) with a fatal/non-fatal classification.

use crate::platform::{self, OsVersion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Classification on a dependency or requirement edge
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tag {
    Build,
    Optional,
    Recommended,
    Run,
    /// An option requested on the dependency, e.g. `with-ssl`
    Option(String),
}

impl From<String> for Tag {
    fn from(s: String) -> Self {
        match s.trim_start_matches('-') {
            "build" => Tag::Build,
            "optional" => Tag::Optional,
            "recommended" => Tag::Recommended,
            "run" => Tag::Run,
            other => Tag::Option(other.to_string()),
        }
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::from(s.to_string())
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Build => f.write_str("build"),
            Tag::Optional => f.write_str("optional"),
            Tag::Recommended => f.write_str("recommended"),
            Tag::Run => f.write_str("run"),
            Tag::Option(name) => f.write_str(name),
        }
    }
}

/// Shared tag queries for dependencies and requirements
pub trait Tagged {
    fn tags(&self) -> &[Tag];

    fn is_build(&self) -> bool {
        self.tags().contains(&Tag::Build)
    }

    fn is_optional(&self) -> bool {
        self.tags().contains(&Tag::Optional)
    }

    fn is_recommended(&self) -> bool {
        self.tags().contains(&Tag::Recommended)
    }

    /// Needed at runtime (the default when no build/optional tag is present)
    fn is_run(&self) -> bool {
        self.tags().contains(&Tag::Run) || !(self.is_build() || self.is_optional())
    }

    /// Options requested on this edge
    fn options(&self) -> Vec<String> {
        self.tags()
            .iter()
            .filter_map(|t| match t {
                Tag::Option(o) => Some(o.clone()),
                _ => None,
            })
            .collect()
    }
}

/// An edge to another recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, T>(name: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        let mut dep = Self::new(name);
        for tag in tags {
            dep.add_tag(tag.into());
        }
        dep
    }

    /// Name used in `with-<name>` style options; tap-qualified names use the last component
    pub fn option_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn add_tag(&mut self, tag: Tag) {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
    }

    /// Union the other edge's tags into this one, keeping first-seen order
    pub fn merge(&mut self, other: &Dependency) {
        for tag in &other.tags {
            self.add_tag(tag.clone());
        }
    }
}

impl Tagged for Dependency {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Dependency {}

impl Hash for Dependency {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Host probe used by library callers that need something the closed set can't express
#[derive(Clone)]
pub struct CustomCheck(pub Arc<dyn Fn() -> bool + Send + Sync>);

impl fmt::Debug for CustomCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomCheck(..)")
    }
}

/// How a requirement decides whether the host satisfies it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequirementCheck {
    /// An executable must be found on PATH
    Executable { name: String },
    /// Minimum macOS version, e.g. `"10.9"` or `"mavericks"`; always met off macOS
    MinimumOs { version: String },
    /// Host architecture in Homebrew naming (`arm64`, `x86_64`)
    Arch { arch: String },
    Always { satisfied: bool },
    #[serde(skip)]
    Custom(CustomCheck),
}

impl RequirementCheck {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        RequirementCheck::Custom(CustomCheck(Arc::new(f)))
    }

    pub fn is_satisfied(&self) -> bool {
        match self {
            RequirementCheck::Executable { name } => which::which(name).is_ok(),
            RequirementCheck::MinimumOs { version } => {
                let Some(host) = platform::host_os_version() else {
                    return true;
                };
                let wanted = OsVersion::parse(version)
                    .or_else(|| OsVersion::from_release_name(version));
                match wanted {
                    Some(wanted) => host >= wanted,
                    None => {
                        tracing::warn!("Unknown OS version in requirement: {}", version);
                        false
                    }
                }
            }
            RequirementCheck::Arch { arch } => platform::homebrew_arch() == arch,
            RequirementCheck::Always { satisfied } => *satisfied,
            RequirementCheck::Custom(check) => (check.0)(),
        }
    }
}

fn default_pour_bottle() -> bool {
    true
}

/// A precondition on the host rather than on another recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub fatal: bool,
    pub check: RequirementCheck,
    /// Recipe that can stand in when the host lacks the requirement
    #[serde(default)]
    pub default_formula: Option<String>,
    #[serde(default = "default_pour_bottle")]
    pub pour_bottle: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl Requirement {
    pub fn new(name: impl Into<String>, check: RequirementCheck) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            fatal: false,
            check,
            default_formula: None,
            pour_bottle: true,
            message: None,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn tagged(mut self, tag: impl Into<Tag>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_default_formula(mut self, formula: impl Into<String>) -> Self {
        self.default_formula = Some(formula.into());
        self
    }

    pub fn is_satisfied(&self) -> bool {
        self.check.is_satisfied()
    }

    /// The dependency edge that replaces this requirement, keeping its tags
    pub fn to_dependency(&self) -> Option<Dependency> {
        self.default_formula
            .as_ref()
            .map(|f| Dependency::with_tags(f.clone(), self.tags.iter().cloned()))
    }

    /// Text shown when the requirement is not met
    pub fn message(&self) -> String {
        match &self.message {
            Some(m) => m.clone(),
            None => match &self.check {
                RequirementCheck::Executable { name } => {
                    format!("{}: `{}` was not found on PATH", self.name, name)
                }
                RequirementCheck::MinimumOs { version } => {
                    format!("{}: macOS {} or newer is required", self.name, version)
                }
                RequirementCheck::Arch { arch } => {
                    format!("{}: a {} machine is required", self.name, arch)
                }
                _ => format!("{} is not satisfied", self.name),
            },
        }
    }
}

impl Tagged for Requirement {
    fn tags(&self) -> &[Tag] {
        &self.tags
    }
}

impl PartialEq for Requirement {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.tags == other.tags
    }
}

impl Eq for Requirement {}

impl Hash for Requirement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.tags.hash(state);
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
