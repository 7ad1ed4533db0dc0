//! Graph expansion: flatten a recipe's dependency edges into an install plan.
//!
//! The walk is pre-order and depth-first. For every edge the caller's
//! classifier decides what happens:
//!
//! - [`Action::Prune`]: drop the edge and everything below it
//! - [`Action::Skip`]: drop the edge but splice in its own expansion
//! - [`Action::KeepShallow`]: keep the edge, ignore its dependencies
//! - [`Action::Keep`]: expand the edge's dependencies, then append it
//!
//! Repeated names are merged afterwards: first position wins and tags are
//! unioned, so a dependency always precedes everything that needs it.

use crate::dependency::{Dependency, Requirement, Tagged};
use crate::error::{BrewError, Result};
use crate::options::BuildOptions;
use crate::recipe::{Recipe, RecipeSource};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Classifier verdict for one edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    Prune,
    Skip,
    KeepShallow,
    #[default]
    Keep,
}

/// The policy used for a recipe's own graph: drop optional and recommended
/// edges the build did not ask for
pub fn default_action(build: &BuildOptions, dep: &Dependency) -> Action {
    if (dep.is_optional() || dep.is_recommended()) && build.without(dep.option_name()) {
        Action::Prune
    } else {
        Action::Keep
    }
}

/// Expand `root`'s declared dependencies
pub fn expand_dependencies<F>(
    root: &Recipe,
    source: &dyn RecipeSource,
    classify: F,
) -> Result<Vec<Dependency>>
where
    F: FnMut(&Recipe, &Dependency) -> Result<Action>,
{
    expand_edges(root, &root.dependencies, source, classify)
}

/// Expand an explicit edge list on behalf of `root`
pub fn expand_edges<F>(
    root: &Recipe,
    edges: &[Dependency],
    source: &dyn RecipeSource,
    classify: F,
) -> Result<Vec<Dependency>>
where
    F: FnMut(&Recipe, &Dependency) -> Result<Action>,
{
    let mut walker = Walker {
        root: &root.name,
        source,
        classify,
        stack: vec![root.name.clone()],
    };
    walker.expand(root, edges)
}

struct Walker<'a, F> {
    root: &'a str,
    source: &'a dyn RecipeSource,
    classify: F,
    /// Names currently being expanded, outermost first
    stack: Vec<String>,
}

impl<F> Walker<'_, F>
where
    F: FnMut(&Recipe, &Dependency) -> Result<Action>,
{
    fn expand(&mut self, dependent: &Recipe, edges: &[Dependency]) -> Result<Vec<Dependency>> {
        let mut expanded = Vec::new();

        for dep in edges {
            // Self-edges and edges back to the root carry no information
            if dep.name == dependent.name || dep.name == self.root {
                continue;
            }

            match (self.classify)(dependent, dep)? {
                Action::Prune => {
                    debug!("{}: pruned {}", dependent.name, dep.name);
                }
                Action::Skip => {
                    let recipe = self.resolve(dependent, dep)?;
                    expanded.extend(self.descend(&recipe)?);
                }
                Action::KeepShallow => expanded.push(dep.clone()),
                Action::Keep => {
                    let recipe = self.resolve(dependent, dep)?;
                    expanded.extend(self.descend(&recipe)?);
                    expanded.push(dep.clone());
                }
            }
        }

        Ok(merge_repeats(expanded))
    }

    fn descend(&mut self, recipe: &Recipe) -> Result<Vec<Dependency>> {
        if self.stack.iter().any(|n| *n == recipe.name) {
            let mut chain = self.stack.clone();
            chain.push(recipe.name.clone());
            return Err(BrewError::CircularDependency { chain });
        }

        self.stack.push(recipe.name.clone());
        let result = self.expand(recipe, &recipe.dependencies);
        self.stack.pop();
        result
    }

    fn resolve(&self, dependent: &Recipe, dep: &Dependency) -> Result<Arc<Recipe>> {
        self.source
            .resolve(&dep.name)
            .map_err(|e| e.with_dependent(&dependent.name))
    }
}

/// Group by name, keep the first position, union the tags
pub fn merge_repeats(deps: Vec<Dependency>) -> Vec<Dependency> {
    let mut merged: Vec<Dependency> = Vec::with_capacity(deps.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for dep in deps {
        match index.get(&dep.name) {
            Some(&i) => merged[i].merge(&dep),
            None => {
                index.insert(dep.name.clone(), merged.len());
                merged.push(dep);
            }
        }
    }

    merged
}

/// Collect the requirements of `root` and of every recipe in `deps`.
///
/// Requirements are not ordered against each other; any verdict other than
/// [`Action::Prune`] keeps the requirement. Duplicates (same name and tags)
/// are reported once.
pub fn expand_requirements<F>(
    root: &Recipe,
    deps: &[Dependency],
    source: &dyn RecipeSource,
    mut classify: F,
) -> Result<Vec<Requirement>>
where
    F: FnMut(&Recipe, &Requirement) -> Result<Action>,
{
    let mut recipes: Vec<Arc<Recipe>> = Vec::with_capacity(deps.len() + 1);
    recipes.push(Arc::new(root.clone()));
    for dep in deps {
        recipes.push(
            source
                .resolve(&dep.name)
                .map_err(|e| e.with_dependent(&root.name))?,
        );
    }

    let mut reqs: Vec<Requirement> = Vec::new();
    for recipe in &recipes {
        for req in &recipe.requirements {
            if (classify)(recipe, req)? == Action::Prune {
                continue;
            }
            if !reqs.contains(req) {
                reqs.push(req.clone());
            }
        }
    }

    Ok(reqs)
}
