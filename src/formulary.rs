//! Recipe lookup.
//!
//! [`Formulary`] loads `<dir>/<name>.json` from one or more recipe
//! directories and keeps parsed recipes in an in-memory cache for the life of
//! the process. [`InMemorySource`] serves recipes built in code.

use crate::error::{BrewError, Result};
use crate::recipe::{Recipe, RecipeSource};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Recipes parsed from JSON files
#[derive(Clone)]
pub struct Formulary {
    dirs: Vec<PathBuf>,
    cache: moka::sync::Cache<String, Arc<Recipe>>,
}

impl Formulary {
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
            // Lasts for the command; a full dependency closure fits easily
            cache: moka::sync::Cache::new(1000),
        }
    }

    /// Recipe directories from `BREWKIT_FORMULA_PATH` (colon separated),
    /// falling back to `<prefix>/Library/Formula`
    pub fn from_env(prefix: &Path) -> Self {
        match std::env::var_os("BREWKIT_FORMULA_PATH") {
            Some(raw) if !raw.is_empty() => Self::new(std::env::split_paths(&raw)),
            _ => Self::new([prefix.join("Library/Formula")]),
        }
    }

    /// Parse and validate one recipe file
    pub fn load_path(path: &Path) -> Result<Recipe> {
        let json = fs::read_to_string(path)?;
        let mut recipe = Recipe::from_json(&json)?;

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if !stem.is_empty() && stem != recipe.name {
            return Err(BrewError::FormulaSpecification {
                name: recipe.name,
                reason: format!("declared in {}", path.display()),
            });
        }

        recipe.path = Some(path.to_path_buf());
        Ok(recipe)
    }

    fn find(&self, name: &str) -> Option<PathBuf> {
        // Tap-qualified names resolve by their last component
        let short = name.rsplit('/').next().unwrap_or(name);
        self.dirs
            .iter()
            .map(|d| d.join(format!("{}.json", short)))
            .find(|p| p.is_file())
    }

    /// Every recipe name available, sorted
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .dirs
            .iter()
            .filter_map(|d| fs::read_dir(d).ok())
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Names similar to `name`, best match first
    pub fn suggest(&self, name: &str) -> Vec<String> {
        let mut scored: Vec<(f64, String)> = self
            .all_names()
            .into_iter()
            .map(|candidate| (strsim::jaro_winkler(name, &candidate), candidate))
            .filter(|(score, _)| *score > 0.85)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(3).map(|(_, n)| n).collect()
    }
}

impl RecipeSource for Formulary {
    fn resolve(&self, name: &str) -> Result<Arc<Recipe>> {
        if let Some(recipe) = self.cache.get(name) {
            return Ok(recipe);
        }

        let path = self
            .find(name)
            .ok_or_else(|| BrewError::FormulaUnavailable {
                name: name.to_string(),
                dependent: None,
            })?;
        debug!("Loading recipe {} from {}", name, path.display());

        let recipe = Arc::new(Self::load_path(&path)?);
        self.cache.insert(name.to_string(), recipe.clone());
        Ok(recipe)
    }
}

/// Recipes held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    recipes: HashMap<String, Arc<Recipe>>,
}

impl InMemorySource {
    pub fn new(recipes: impl IntoIterator<Item = Recipe>) -> Self {
        let mut source = Self::default();
        for recipe in recipes {
            source.insert(recipe);
        }
        source
    }

    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.name.clone(), Arc::new(recipe));
    }
}

impl RecipeSource for InMemorySource {
    fn resolve(&self, name: &str) -> Result<Arc<Recipe>> {
        self.recipes
            .get(name)
            .cloned()
            .ok_or_else(|| BrewError::FormulaUnavailable {
                name: name.to_string(),
                dependent: None,
            })
    }
}
