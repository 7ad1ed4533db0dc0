//! The installation orchestrator.
//!
//! One [`Installer::install`] call drives a formula through
//!
//! ```text
//! Created → SanityChecked → RequirementsVerified → DependenciesInstalled
//!   → Fetched → Poured | Built → Relocated → Linked → Finished
//! ```
//!
//! and any unrecoverable error moves it to `Aborted`. Every dependency in the
//! plan goes through the same machine, sharing one [`InstallContext`] that
//! holds the formula locks and the set of names already attempted.
//!
//! Side effects of a failed phase are undone before the error surfaces: a
//! failed build deletes its keg, a failed link leaves the keg unlinked, and a
//! failed dependency upgrade relinks the version it replaced.

use crate::bottle::Bottle;
use crate::build::{self, BuildJob};
use crate::config::Paths;
use crate::dependency::{Dependency, Requirement, Tagged};
use crate::download::Downloader;
use crate::error::{BrewError, Result};
use crate::expand::{self, Action};
use crate::extract;
use crate::keg::{self, Keg};
use crate::link::{self, LinkMode};
use crate::linkage::LinkageTool;
use crate::lock::LockSet;
use crate::options::BuildOptions;
use crate::platform::BottleTag;
use crate::receipt::{InstallReceipt, RuntimeDependency};
use crate::recipe::{ActiveSpec, Recipe, RecipeSource, SpecRequest};
use crate::relocate;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-install settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub build_from_source: bool,
    pub head: bool,
    pub devel: bool,
    pub ignore_dependencies: bool,
    /// Retry a failed network fetch once
    pub retry_fetch: bool,
    /// Build options such as `with-foo`
    pub options: Vec<String>,
    pub installed_on_request: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            build_from_source: false,
            head: false,
            devel: false,
            ignore_dependencies: false,
            retry_fetch: false,
            options: Vec::new(),
            installed_on_request: true,
        }
    }
}

impl InstallOptions {
    /// Settings for a dependency pulled in by another install. The root's
    /// plan already ordered and installed the whole closure.
    fn for_dependency(&self, dep: &Dependency) -> Self {
        Self {
            options: dep.options(),
            installed_on_request: false,
            ignore_dependencies: true,
            retry_fetch: self.retry_fetch,
            ..Self::default()
        }
    }

    fn spec_request(&self) -> SpecRequest {
        SpecRequest {
            head: self.head,
            devel: self.devel,
        }
    }
}

/// Orchestration state of one formula
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Created,
    SanityChecked,
    RequirementsVerified,
    DependenciesInstalled,
    Fetched,
    Poured,
    Built,
    Relocated,
    Linked,
    Finished,
    Aborted,
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State shared by a top-level install and every nested dependency install.
///
/// Dropping it releases all formula locks.
#[derive(Debug, Default)]
pub struct InstallContext {
    attempted: HashSet<String>,
    locks: LockSet,
}

impl InstallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempted(&self, name: &str) -> bool {
        self.attempted.contains(name)
    }

    pub fn locks(&self) -> &LockSet {
        &self.locks
    }
}

/// What happened to one formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub name: String,
    pub version: Option<String>,
    pub keg: Option<PathBuf>,
    pub state: InstallState,
    pub poured: bool,
    pub linked: bool,
    /// Dependencies installed along the way, in plan order
    pub dependencies: Vec<InstallOutcome>,
    /// Reported, non-fatal problems
    pub warnings: Vec<String>,
    /// Why nothing was done, for already installed or attempted formulae
    pub skipped: Option<String>,
}

impl InstallOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            keg: None,
            state: InstallState::Created,
            poured: false,
            linked: false,
            dependencies: Vec::new(),
            warnings: Vec::new(),
            skipped: None,
        }
    }

    fn skipped(name: &str, reason: &BrewError) -> Self {
        Self {
            skipped: Some(reason.to_string()),
            ..Self::new(name)
        }
    }

    fn advance(&mut self, state: InstallState) {
        debug!("{}: {} -> {}", self.name, self.state, state);
        self.state = state;
    }

    fn warn(&mut self, message: String) {
        warn!("{}: {}", self.name, message);
        self.warnings.push(message);
    }
}

/// Installs formulae into one prefix
pub struct Installer {
    paths: Paths,
    source: Arc<dyn RecipeSource>,
    tool: Arc<dyn LinkageTool>,
    downloader: Downloader,
    host_tag: BottleTag,
}

impl Installer {
    pub fn new(
        paths: Paths,
        source: Arc<dyn RecipeSource>,
        tool: Arc<dyn LinkageTool>,
        host_tag: BottleTag,
    ) -> Self {
        let downloader = Downloader::new(paths.cache.clone());
        Self {
            paths,
            source,
            tool,
            downloader,
            host_tag,
        }
    }

    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Install `name` and whatever it needs.
    ///
    /// Already installed and already attempted formulae come back as a
    /// skipped outcome rather than an error.
    pub async fn install(&self, name: &str, options: &InstallOptions) -> Result<InstallOutcome> {
        let mut ctx = InstallContext::new();
        self.install_in(&mut ctx, name, options).await
    }

    /// Install several formulae sharing one context, stopping at the first failure
    pub async fn install_all(
        &self,
        names: &[String],
        options: &InstallOptions,
    ) -> Result<Vec<InstallOutcome>> {
        let mut ctx = InstallContext::new();
        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            outcomes.push(self.install_in(&mut ctx, name, options).await?);
        }
        Ok(outcomes)
    }

    /// Install within an existing context
    pub async fn install_in(
        &self,
        ctx: &mut InstallContext,
        name: &str,
        options: &InstallOptions,
    ) -> Result<InstallOutcome> {
        let recipe = self.source.resolve(name)?;
        match self.install_formula(ctx, recipe, options).await {
            Err(e) if e.is_short_circuit() => {
                info!("{}", e);
                Ok(InstallOutcome::skipped(name, &e))
            }
            other => other,
        }
    }

    async fn install_formula(
        &self,
        ctx: &mut InstallContext,
        recipe: Arc<Recipe>,
        options: &InstallOptions,
    ) -> Result<InstallOutcome> {
        let mut outcome = InstallOutcome::new(&recipe.name);
        match self.run_phases(ctx, &recipe, options, &mut outcome).await {
            Ok(()) => Ok(outcome),
            Err(e) => {
                if !e.is_short_circuit() {
                    outcome.advance(InstallState::Aborted);
                    info!("{}: aborted: {}", recipe.name, e);
                }
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        ctx: &mut InstallContext,
        recipe: &Arc<Recipe>,
        options: &InstallOptions,
        outcome: &mut InstallOutcome,
    ) -> Result<()> {
        let name = recipe.name.as_str();
        if !ctx.attempted.insert(name.to_string()) {
            return Err(BrewError::AlreadyAttempted(name.to_string()));
        }

        let build_options = recipe.build_options(&options.options);
        // Nested installs still need the closure for the receipt
        let closure = match recipe.recursive_dependencies(self.source.as_ref(), &build_options) {
            Ok(closure) => closure,
            Err(e) if options.ignore_dependencies => {
                debug!("{}: ignoring dependencies: {}", name, e);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let default_deps = if options.ignore_dependencies {
            Vec::new()
        } else {
            closure.clone()
        };

        // The root and its whole closure stay locked until the context drops
        ctx.locks.acquire(
            &self.paths,
            std::iter::once(name).chain(default_deps.iter().map(|d| d.name.as_str())),
        )?;

        // Sanity
        let bottle = self.find_bottle(recipe, options, &build_options);
        let request = options.spec_request();
        let active = recipe.active_spec(request, bottle.is_some())?;
        let keg_path = recipe.prefix(&self.paths, &active);
        self.check_sanity(recipe, options, &default_deps, &keg_path)?;
        outcome.advance(InstallState::SanityChecked);

        // Requirements
        let req_deps = self.check_requirements(recipe, &build_options, &default_deps, bottle.is_some(), outcome)?;
        outcome.advance(InstallState::RequirementsVerified);

        // Dependencies
        let plan = if options.ignore_dependencies {
            Vec::new()
        } else {
            self.plan_dependencies(recipe, &build_options, &req_deps, bottle.is_some())?
        };
        for dep in &plan {
            let installed = self.install_dependency(ctx, recipe, dep, options).await?;
            if let Some(installed) = installed {
                outcome.dependencies.push(installed);
            }
        }
        outcome.advance(InstallState::DependenciesInstalled);

        // Pour, falling back to a source build
        let mut poured_keg = None;
        if let Some(b) = bottle.as_ref() {
            match self.pour(recipe, b, options, outcome).await {
                Ok(path) => poured_keg = Some(path),
                Err(BrewError::Interrupted) => return Err(BrewError::Interrupted),
                Err(e) => {
                    outcome.warn(format!("Bottle installation failed: building from source ({})", e));
                    remove_keg(&keg_path);
                }
            }
        }

        let (active, keg_path) = match poured_keg {
            Some(path) => {
                outcome.poured = true;
                (active, path)
            }
            None => {
                let active = recipe.active_spec(request, false)?;
                let keg_path = recipe.prefix(&self.paths, &active);
                self.build(recipe, &active, &build_options, &keg_path, options, outcome)
                    .await?;
                (active, keg_path)
            }
        };
        outcome.version = Some(recipe.pkg_version(&active));
        outcome.keg = Some(keg_path.clone());

        // Link
        let keg = Keg::open(&self.paths, &keg_path)?;
        keg.optlink()?;
        if recipe.is_keg_only() {
            info!("{} is keg-only and was not linked", name);
        } else {
            match link::link(&keg, LinkMode::default()) {
                Ok(report) => {
                    info!("Linked {} ({} links)", name, report.links);
                    outcome.linked = true;
                    outcome.advance(InstallState::Linked);
                }
                Err(e) => outcome.warn(format!("The link step did not complete successfully: {}", e)),
            }
        }

        // Finish
        let runtime = self.runtime_dependencies(closure.iter().chain(&req_deps));
        InstallReceipt::new(
            recipe,
            &active,
            &build_options,
            outcome.poured,
            options.installed_on_request,
        )
        .with_runtime_dependencies(runtime)
        .write(&keg_path)?;
        outcome.advance(InstallState::Finished);
        info!("{}: installed {}", name, keg_path.display());
        Ok(())
    }

    /// A pourable bottle for the host, if this install may use one
    fn find_bottle(
        &self,
        recipe: &Recipe,
        options: &InstallOptions,
        build_options: &BuildOptions,
    ) -> Option<Bottle> {
        if options.build_from_source
            || options.head
            || options.devel
            || !recipe.pour_bottle
            || build_options.has_custom_options()
            || recipe.requirements.iter().any(|r| !r.pour_bottle)
        {
            return None;
        }

        let spec = recipe.bottle.as_ref()?;
        if !spec.compatible_cellar(&self.paths) {
            debug!("{}: bottle cellar {} does not match", recipe.name, spec.cellar);
            return None;
        }

        let stable = recipe.active_spec(SpecRequest::default(), true).ok()?;
        spec.resolve(&recipe.name, &recipe.pkg_version(&stable), &self.host_tag)
    }

    fn check_sanity(
        &self,
        recipe: &Recipe,
        options: &InstallOptions,
        deps: &[Dependency],
        keg_path: &Path,
    ) -> Result<()> {
        let name = &recipe.name;
        let cannot = |reason: String| BrewError::CannotInstall {
            formula: name.clone(),
            reason,
        };

        if options.head && recipe.head.is_none() {
            return Err(cannot(format!("no head is defined for {}", name)));
        }
        if options.devel && recipe.devel.is_none() {
            return Err(cannot(format!("no devel block is defined for {}", name)));
        }

        if let Ok(keg) = Keg::open(&self.paths, keg_path) {
            if !keg.is_empty() {
                let linked = keg.is_linked()
                    || (recipe.is_keg_only()
                        && keg::resolved_path(&keg.opt_record())
                            .is_some_and(|p| keg::same_dir(&p, keg.path())));
                return Err(BrewError::AlreadyInstalled {
                    formula: name.clone(),
                    version: keg.version().to_string(),
                    linked,
                });
            }
        }

        if let Some(linked) = keg::linked_keg_path(&self.paths, name) {
            if !keg::same_dir(&linked, keg_path) {
                return Err(cannot(format!(
                    "{} is already linked, first unlink it",
                    linked.display()
                )));
            }
        }

        let mut unlinked = Vec::new();
        for dep in deps {
            let dep_recipe = self.source.resolve(&dep.name)?;
            let installed = !keg::installed_versions(&self.paths, &dep.name)?.is_empty();
            if installed
                && !dep_recipe.is_keg_only()
                && keg::linked_keg_path(&self.paths, &dep.name).is_none()
            {
                unlinked.push(dep.name.clone());
            }
        }
        if !unlinked.is_empty() {
            return Err(cannot(format!(
                "you must link {} before {} can be installed",
                unlinked.join(", "),
                name
            )));
        }

        Ok(())
    }

    /// Verify requirements; returns the dependency edges that replace
    /// unsatisfied requirements with a default formula
    fn check_requirements(
        &self,
        recipe: &Recipe,
        build_options: &BuildOptions,
        deps: &[Dependency],
        pour: bool,
        outcome: &mut InstallOutcome,
    ) -> Result<Vec<Dependency>> {
        let reqs = expand::expand_requirements(recipe, deps, self.source.as_ref(), |dependent, req| {
            let build = self.options_for(recipe, build_options, dependent);
            Ok(requirement_action(&build, req, pour && dependent.name == recipe.name))
        })?;

        let mut fatal = Vec::new();
        let mut replacements = Vec::new();
        for req in reqs {
            if let Some(dep) = req.to_dependency() {
                debug!("{}: {} satisfied by formula {}", recipe.name, req.name, dep.name);
                replacements.push(dep);
            } else if req.fatal {
                fatal.push(req.message());
            } else {
                outcome.warn(req.message());
            }
        }

        if fatal.is_empty() {
            Ok(replacements)
        } else {
            Err(BrewError::UnsatisfiedRequirements {
                formula: recipe.name.clone(),
                requirements: fatal,
            })
        }
    }

    /// Expand the edges that still need installing
    fn plan_dependencies(
        &self,
        recipe: &Recipe,
        build_options: &BuildOptions,
        extra: &[Dependency],
        pour: bool,
    ) -> Result<Vec<Dependency>> {
        let mut edges = recipe.dependencies.clone();
        edges.extend(extra.iter().cloned());

        let plan = expand::expand_edges(recipe, &edges, self.source.as_ref(), |dependent, dep| {
            let build = self.options_for(recipe, build_options, dependent);
            let is_root = dependent.name == recipe.name;

            if (dep.is_optional() || dep.is_recommended()) && build.without(dep.option_name()) {
                return Ok(Action::Prune);
            }
            if dep.is_build() {
                // Transitive build tools are the business of that dependency's
                // own install, should it be built from source
                if !is_root || pour {
                    return Ok(Action::Prune);
                }
                return Ok(match self.satisfied_action(dependent, dep)? {
                    Action::Skip => Action::Prune,
                    _ => Action::KeepShallow,
                });
            }
            self.satisfied_action(dependent, dep)
        })?;

        debug!(
            "{}: plan [{}]",
            recipe.name,
            plan.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(plan)
    }

    /// Installed dependencies are skipped, unless they lack requested options
    fn satisfied_action(&self, dependent: &Recipe, dep: &Dependency) -> Result<Action> {
        let dep_recipe = self
            .source
            .resolve(&dep.name)
            .map_err(|e| e.with_dependent(&dependent.name))?;
        let Some(prefix) = dep_recipe.installed_prefix(&self.paths) else {
            return Ok(Action::Keep);
        };

        let requested = dep.options();
        let receipt = InstallReceipt::read_or_default(&prefix);
        let missing = receipt.missing_options(&requested);
        if missing.is_empty() {
            Ok(Action::Skip)
        } else {
            Err(BrewError::UnsatisfiedDependency {
                formula: dependent.name.clone(),
                dependency: dep.name.clone(),
                missing: missing.into_iter().map(String::from).collect(),
            })
        }
    }

    /// The root uses the requested options; everything else its defaults
    fn options_for(&self, root: &Recipe, root_options: &BuildOptions, dependent: &Recipe) -> BuildOptions {
        if dependent.name == root.name {
            root_options.clone()
        } else {
            dependent.build_options(Vec::<String>::new())
        }
    }

    /// Install one planned dependency through the full state machine.
    ///
    /// An outdated linked version is unlinked first and relinked whenever
    /// nothing is linked for the formula afterwards.
    async fn install_dependency(
        &self,
        ctx: &mut InstallContext,
        dependent: &Recipe,
        dep: &Dependency,
        options: &InstallOptions,
    ) -> Result<Option<InstallOutcome>> {
        let dep_recipe = self
            .source
            .resolve(&dep.name)
            .map_err(|e| e.with_dependent(&dependent.name))?;

        let previous = keg::linked_keg_path(&self.paths, &dep.name)
            .and_then(|path| Keg::open(&self.paths, path).ok());
        if let Some(old) = &previous {
            info!("Unlinking outdated {} {}", old.name(), old.version());
            link::unlink(old)?;
        }

        let dep_options = options.for_dependency(dep);
        let result = Box::pin(self.install_formula(ctx, dep_recipe.clone(), &dep_options)).await;

        let installed = dep_recipe.installed_prefix(&self.paths).is_some();
        if let Some(old) = &previous {
            if keg::linked_keg_path(&self.paths, &dep.name).is_none() {
                info!("Relinking {} {}", old.name(), old.version());
                if let Err(e) = link::link(old, LinkMode::default()) {
                    warn!("Could not relink {}: {}", old.name(), e);
                }
            }
        }

        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_short_circuit() && installed => {
                debug!("{}", e);
                Ok(None)
            }
            Err(e) if e.is_short_circuit() => Err(BrewError::CannotInstall {
                formula: dependent.name.clone(),
                reason: format!("dependency {} could not be installed", dep.name),
            }),
            Err(e) => Err(e),
        }
    }

    /// Fetch, unpack and relocate a bottle; returns the keg
    async fn pour(
        &self,
        recipe: &Recipe,
        bottle: &Bottle,
        options: &InstallOptions,
        outcome: &mut InstallOutcome,
    ) -> Result<PathBuf> {
        let downloader = self.downloader.clone().with_retry(options.retry_fetch);
        let archive = downloader.fetch_bottle(bottle).await?;
        outcome.advance(InstallState::Fetched);

        let stable = recipe.active_spec(SpecRequest::default(), true)?;
        let keg_path = extract::pour_bottle(&archive, &self.paths, &recipe.name, &recipe.pkg_version(&stable))?;
        outcome.advance(InstallState::Poured);

        let spec = recipe.bottle.as_ref();
        if spec.is_some_and(|s| s.skip_relocation()) {
            debug!("{}: bottle needs no relocation", recipe.name);
        } else {
            let recorded = spec.and_then(|s| s.recorded_paths(&self.paths));
            let report = relocate::pour(&keg_path, &self.paths, recorded, self.tool.as_ref())?;
            debug!("{}: relocated {:?}", recipe.name, report);
        }
        outcome.advance(InstallState::Relocated);
        Ok(keg_path)
    }

    /// Fetch the source and run the build; a failed build leaves no keg
    async fn build(
        &self,
        recipe: &Recipe,
        active: &ActiveSpec<'_>,
        build_options: &BuildOptions,
        keg_path: &Path,
        options: &InstallOptions,
        outcome: &mut InstallOutcome,
    ) -> Result<()> {
        let downloader = self.downloader.clone().with_retry(options.retry_fetch);
        let source = downloader.fetch_source(&recipe.name, active).await?;
        outcome.advance(InstallState::Fetched);

        fs::create_dir_all(&self.paths.temp)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", recipe.name))
            .tempdir_in(&self.paths.temp)?;

        let built = async {
            let workdir = extract::stage_source(&source, staging.path())?;
            let job = BuildJob {
                recipe,
                options: build_options,
                workdir: &workdir,
                keg: keg_path,
                paths: &self.paths,
            };
            build::run(&job).await
        }
        .await;

        if let Err(e) = built {
            remove_keg(keg_path);
            return Err(e);
        }
        outcome.advance(InstallState::Built);

        let opt = self.paths.opt_record(&recipe.name);
        match relocate::fix_install_names(keg_path, &opt, &self.paths, self.tool.as_ref()) {
            Ok(report) => debug!("{}: fixed install names {:?}", recipe.name, report),
            Err(e) => outcome.warn(format!("Failed to fix install names: {}", e)),
        }
        outcome.advance(InstallState::Relocated);
        Ok(())
    }

    /// Installed, non-build dependencies as recorded in the receipt
    fn runtime_dependencies<'a>(&self, deps: impl Iterator<Item = &'a Dependency>) -> Vec<RuntimeDependency> {
        let mut seen = HashSet::new();
        deps.filter(|d| d.is_run())
            .filter(|d| seen.insert(d.name.clone()))
            .filter_map(|d| {
                let recipe = self.source.resolve(&d.name).ok()?;
                let prefix = recipe.installed_prefix(&self.paths)?;
                Some(RuntimeDependency {
                    full_name: d.name.clone(),
                    pkg_version: prefix.file_name()?.to_string_lossy().into_owned(),
                })
            })
            .collect()
    }
}

/// Classifier for requirements: drop unrequested optional ones, build-time
/// ones when pouring, and anything already satisfied
fn requirement_action(build: &BuildOptions, req: &Requirement, pour: bool) -> Action {
    if (req.is_optional() || req.is_recommended()) && build.without(&req.name) {
        Action::Prune
    } else if req.is_build() && pour {
        Action::Prune
    } else if req.is_satisfied() {
        Action::Prune
    } else {
        Action::Keep
    }
}

/// Delete a keg and its rack, if the rack is left empty
fn remove_keg(keg_path: &Path) {
    if keg_path.exists() {
        if let Err(e) = fs::remove_dir_all(keg_path) {
            warn!("Could not remove {}: {}", keg_path.display(), e);
        }
    }
    if let Some(rack) = keg_path.parent() {
        keg::rmdir_if_possible(rack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::RequirementCheck;

    #[test]
    fn test_requirement_classifier() {
        let build = BuildOptions::new(["with-x11"], Vec::<String>::new());
        let missing = RequirementCheck::Always { satisfied: false };

        let optional = Requirement::new("x11", missing.clone()).tagged("optional");
        assert_eq!(requirement_action(&build, &optional, false), Action::Prune);

        let build_only = Requirement::new("xcode", missing.clone()).tagged("build");
        assert_eq!(requirement_action(&build, &build_only, true), Action::Prune);
        assert_eq!(requirement_action(&build, &build_only, false), Action::Keep);

        let met = Requirement::new("git", RequirementCheck::Always { satisfied: true });
        assert_eq!(requirement_action(&build, &met, false), Action::Prune);
    }

    #[test]
    fn test_dependency_options() {
        let dep = Dependency::with_tags("curl", ["build", "with-ssl"]);
        let opts = InstallOptions {
            retry_fetch: true,
            build_from_source: true,
            ..InstallOptions::default()
        }
        .for_dependency(&dep);
        assert_eq!(opts.options, vec!["with-ssl"]);
        assert!(!opts.installed_on_request);
        assert!(opts.retry_fetch);
        assert!(!opts.build_from_source);
    }
}
