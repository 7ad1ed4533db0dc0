//! Build options: what a recipe declares vs what an install asked for.
//!
//! Options are plain names without leading dashes (`with-foo`, `without-bar`,
//! `universal`). Optional dependencies implicitly declare `with-<dep>`,
//! recommended ones declare `without-<dep>`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// One declared option
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl BuildOption {
    pub fn new(name: impl AsRef<str>, description: impl Into<String>) -> Self {
        Self {
            name: normalize_option(name.as_ref()),
            description: description.into(),
        }
    }
}

impl fmt::Display for BuildOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "--{}", self.name)
    }
}

/// `--with-foo` and `with-foo` are the same option
pub fn normalize_option(raw: &str) -> String {
    raw.trim().trim_start_matches('-').to_string()
}

/// Options declared by a recipe plus the subset used by one install
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    declared: BTreeSet<String>,
    used: BTreeSet<String>,
}

impl BuildOptions {
    pub fn new<D, U>(declared: D, used: U) -> Self
    where
        D: IntoIterator,
        D::Item: AsRef<str>,
        U: IntoIterator,
        U::Item: AsRef<str>,
    {
        Self {
            declared: declared
                .into_iter()
                .map(|o| normalize_option(o.as_ref()))
                .collect(),
            used: used
                .into_iter()
                .map(|o| normalize_option(o.as_ref()))
                .collect(),
        }
    }

    /// The same declarations with a different set of used options
    pub fn with_used<U>(&self, used: U) -> Self
    where
        U: IntoIterator,
        U::Item: AsRef<str>,
    {
        Self::new(self.declared.iter(), used)
    }

    pub fn is_declared(&self, option: &str) -> bool {
        self.declared.contains(&normalize_option(option))
    }

    pub fn is_used(&self, option: &str) -> bool {
        self.used.contains(&normalize_option(option))
    }

    /// Whether the install wants `name`.
    ///
    /// Only options the recipe declares count: `with-<name>` has to be passed
    /// explicitly, while a declared `without-<name>` means the feature is on
    /// unless that flag was passed.
    pub fn with(&self, name: &str) -> bool {
        let with = format!("with-{}", name);
        let without = format!("without-{}", name);
        if self.declared.contains(&with) {
            self.used.contains(&with)
        } else if self.declared.contains(&without) {
            !self.used.contains(&without)
        } else {
            false
        }
    }

    pub fn without(&self, name: &str) -> bool {
        !self.with(name)
    }

    /// Used options the recipe actually declares
    pub fn used_options(&self) -> Vec<String> {
        self.used
            .iter()
            .filter(|o| self.declared.contains(*o))
            .cloned()
            .collect()
    }

    /// Declared options this install did not use
    pub fn unused_options(&self) -> Vec<String> {
        self.declared.difference(&self.used).cloned().collect()
    }

    /// True when any declared option was requested; bottles are built without any
    pub fn has_custom_options(&self) -> bool {
        !self.used_options().is_empty()
    }
}
