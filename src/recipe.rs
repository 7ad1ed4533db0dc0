//! Recipes: the declarative description of one package.
//!
//! A recipe is loaded once per process (see [`crate::formulary`]) and is
//! immutable afterwards; everything install-specific (requested options,
//! `--HEAD`, build-from-source) lives in the installer's options instead.
//!
//! Recipes are JSON documents:
//!
//! ```json
//! {
//!   "name": "wget",
//!   "stable": { "url": "https://ftp.gnu.org/gnu/wget/wget-1.21.tar.gz",
//!               "sha256": "…", "version": "1.21" },
//!   "head": { "url": "https://git.savannah.gnu.org/git/wget.git" },
//!   "dependencies": [ { "name": "openssl" },
//!                     { "name": "pkg-config", "tags": ["build"] } ],
//!   "install": [ "./configure --prefix=$PREFIX", "make install" ]
//! }
//! ```

use crate::bottle::BottleSpec;
use crate::config::Paths;
use crate::dependency::{Dependency, Requirement, Tagged};
use crate::error::{BrewError, Result};
use crate::expand::{self, Action};
use crate::options::{BuildOption, BuildOptions};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Which version spec of a recipe is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecKind {
    Stable,
    Devel,
    Head,
    /// The stable spec, installed from a precompiled bottle
    Bottle,
}

impl fmt::Display for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpecKind::Stable => "stable",
            SpecKind::Devel => "devel",
            SpecKind::Head => "head",
            SpecKind::Bottle => "bottle",
        };
        f.write_str(s)
    }
}

/// A downloadable version of the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftwareSpec {
    pub url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Download strategy hint: `curl`, `git`, `hg` or `local`
    #[serde(default)]
    pub using: Option<String>,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

/// Flags that influence the active spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecRequest {
    pub head: bool,
    pub devel: bool,
}

/// The spec chosen for an install
#[derive(Debug, Clone, Copy)]
pub struct ActiveSpec<'a> {
    pub kind: SpecKind,
    pub spec: &'a SoftwareSpec,
    pub version: &'a str,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub stable: Option<SoftwareSpec>,
    #[serde(default)]
    pub devel: Option<SoftwareSpec>,
    #[serde(default)]
    pub head: Option<SoftwareSpec>,
    #[serde(default)]
    pub bottle: Option<BottleSpec>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub options: Vec<BuildOption>,
    /// Shell commands run in the unpacked source with `$PREFIX` set to the keg
    #[serde(default)]
    pub install: Vec<String>,
    /// Reason this recipe is never linked into the prefix
    #[serde(default)]
    pub keg_only: Option<String>,
    #[serde(default = "default_true")]
    pub pour_bottle: bool,
    /// Where the recipe was loaded from, if anywhere
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl Recipe {
    /// Minimal stable-only recipe, mostly for library callers and tests
    pub fn new(name: impl Into<String>, url: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: None,
            homepage: None,
            revision: 0,
            stable: Some(SoftwareSpec {
                url: url.into(),
                sha256: None,
                version: Some(version.into()),
                using: None,
                mirrors: Vec::new(),
            }),
            devel: None,
            head: None,
            bottle: None,
            dependencies: Vec::new(),
            requirements: Vec::new(),
            options: Vec::new(),
            install: Vec::new(),
            keg_only: None,
            pour_bottle: true,
            path: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let recipe: Recipe = serde_json::from_str(json)?;
        recipe.validate()?;
        Ok(recipe)
    }

    /// Names and URLs must be non-empty and whitespace-free
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| BrewError::FormulaSpecification {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(invalid(format!("invalid name {:?}", self.name)));
        }
        if self.stable.is_none() && self.devel.is_none() && self.head.is_none() {
            return Err(invalid("formulae require at least a URL".to_string()));
        }
        for (kind, spec) in self.specs() {
            if spec.url.is_empty() || spec.url.contains(char::is_whitespace) {
                return Err(invalid(format!("invalid {} url {:?}", kind, spec.url)));
            }
            if kind != SpecKind::Head && spec_version(kind, spec).is_none() {
                return Err(invalid(format!("{} spec has no version", kind)));
            }
        }
        Ok(())
    }

    fn specs(&self) -> impl Iterator<Item = (SpecKind, &SoftwareSpec)> {
        [
            (SpecKind::Stable, self.stable.as_ref()),
            (SpecKind::Devel, self.devel.as_ref()),
            (SpecKind::Head, self.head.as_ref()),
        ]
        .into_iter()
        .filter_map(|(k, s)| s.map(|s| (k, s)))
    }

    /// Pick the active spec.
    ///
    /// Priority: `--HEAD` > `--devel` > a pourable bottle > stable >
    /// devel-only > head-only. `bottle_pourable` is decided by the caller,
    /// which knows the host tag and cellar.
    pub fn active_spec(
        &self,
        request: SpecRequest,
        bottle_pourable: bool,
    ) -> Result<ActiveSpec<'_>> {
        let (kind, spec) = match (&self.stable, &self.devel, &self.head) {
            (_, _, Some(head)) if request.head => (SpecKind::Head, head),
            (_, Some(devel), _) if request.devel => (SpecKind::Devel, devel),
            (Some(stable), _, _) if bottle_pourable && self.bottle.is_some() => {
                (SpecKind::Bottle, stable)
            }
            (Some(stable), _, _) => (SpecKind::Stable, stable),
            (None, Some(devel), _) => (SpecKind::Devel, devel),
            (None, None, Some(head)) => (SpecKind::Head, head),
            _ => {
                return Err(BrewError::FormulaSpecification {
                    name: self.name.clone(),
                    reason: "formulae require at least a URL".to_string(),
                });
            }
        };

        let version = spec_version(kind, spec).ok_or_else(|| BrewError::FormulaSpecification {
            name: self.name.clone(),
            reason: format!("{} spec has no version", kind),
        })?;

        Ok(ActiveSpec {
            kind,
            spec,
            version,
        })
    }

    /// `version` or `version_<revision>` for the given spec
    pub fn pkg_version(&self, active: &ActiveSpec<'_>) -> String {
        if self.revision > 0 && active.kind != SpecKind::Head {
            format!("{}_{}", active.version, self.revision)
        } else {
            active.version.to_string()
        }
    }

    /// Where the keg for `active` lives
    pub fn prefix(&self, paths: &Paths, active: &ActiveSpec<'_>) -> PathBuf {
        paths.keg_path(&self.name, &self.pkg_version(active))
    }

    /// The keg of an installed spec, checking head, then devel, then stable
    pub fn installed_prefix(&self, paths: &Paths) -> Option<PathBuf> {
        let mut specs: Vec<(SpecKind, &SoftwareSpec)> = self.specs().collect();
        specs.reverse();
        specs
            .into_iter()
            .filter_map(|(kind, spec)| {
                let version = spec_version(kind, spec)?;
                Some(self.prefix(paths, &ActiveSpec { kind, spec, version }))
            })
            .find(|prefix| {
                std::fs::read_dir(prefix)
                    .map(|mut entries| entries.next().is_some())
                    .unwrap_or(false)
            })
    }

    pub fn is_keg_only(&self) -> bool {
        self.keg_only.is_some()
    }

    /// Declared options, including the implicit ones from optional and
    /// recommended edges
    pub fn declared_options(&self) -> Vec<String> {
        let mut declared: Vec<String> = self.options.iter().map(|o| o.name.clone()).collect();
        let edges = self
            .dependencies
            .iter()
            .map(|d| (d.option_name(), d.tags()))
            .chain(self.requirements.iter().map(|r| (r.name.as_str(), r.tags())));
        for (name, tags) in edges {
            let probe = Dependency::with_tags(name, tags.iter().cloned());
            if probe.is_optional() {
                declared.push(format!("with-{}", name));
            } else if probe.is_recommended() {
                declared.push(format!("without-{}", name));
            }
        }
        declared
    }

    /// Options for a build that used `used`
    pub fn build_options<U>(&self, used: U) -> BuildOptions
    where
        U: IntoIterator,
        U::Item: AsRef<str>,
    {
        BuildOptions::new(self.declared_options(), used)
    }

    /// The recipe's own dependency graph, flattened with the default policy
    pub fn recursive_dependencies(
        &self,
        source: &dyn RecipeSource,
        options: &BuildOptions,
    ) -> Result<Vec<Dependency>> {
        expand::expand_dependencies(self, source, |dependent, dep| {
            let build = if dependent.name == self.name {
                options.clone()
            } else {
                dependent.build_options(Vec::<String>::new())
            };
            Ok(expand::default_action(&build, dep))
        })
    }

    /// Requirements of this recipe and its default-expanded dependencies
    pub fn recursive_requirements(
        &self,
        source: &dyn RecipeSource,
        options: &BuildOptions,
    ) -> Result<Vec<Requirement>> {
        let deps = self.recursive_dependencies(source, options)?;
        expand::expand_requirements(self, &deps, source, |dependent, req| {
            let build = if dependent.name == self.name {
                options.clone()
            } else {
                dependent.build_options(Vec::<String>::new())
            };
            if (req.is_optional() || req.is_recommended()) && build.without(&req.name) {
                Ok(Action::Prune)
            } else {
                Ok(Action::Keep)
            }
        })
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl PartialEq for Recipe {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Recipe {}

fn spec_version(kind: SpecKind, spec: &SoftwareSpec) -> Option<&str> {
    match (&spec.version, kind) {
        (Some(v), _) if !v.is_empty() => Some(v.as_str()),
        (_, SpecKind::Head) => Some("HEAD"),
        _ => None,
    }
}

/// Resolves recipe names to recipes
pub trait RecipeSource: Send + Sync {
    /// Look up `name`, failing with [`BrewError::FormulaUnavailable`]
    fn resolve(&self, name: &str) -> Result<Arc<Recipe>>;
}
