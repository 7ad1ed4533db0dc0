use anyhow::{Context, Result, bail};
use brewkit::bottle;
use brewkit::config::Paths;
use brewkit::dependency::Tagged;
use brewkit::download::Downloader;
use brewkit::expand::{self, Action};
use brewkit::formulary::Formulary;
use brewkit::installer::{InstallOptions, InstallOutcome, Installer};
use brewkit::keg::{self, Keg};
use brewkit::link::{self, LinkMode};
use brewkit::linkage::LinkageTool;
use brewkit::platform;
use brewkit::recipe::RecipeSource;
use brewkit::relocate;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;

pub async fn install(
    paths: &Paths,
    formulary: Formulary,
    tool: Arc<dyn LinkageTool>,
    formula_names: &[String],
    options: &InstallOptions,
) -> Result<()> {
    println!(
        "{} Installing {} formulae...",
        "📦".bold(),
        formula_names.len().to_string().bold()
    );

    let host = platform::detect_bottle_tag()?;
    let installer = Installer::new(paths.clone(), Arc::new(formulary.clone()), tool, host)
        .with_downloader(Downloader::new(paths.cache.clone()).with_progress(true));

    for name in formula_names {
        if let Err(e) = formulary.resolve(name) {
            let suggestions = formulary.suggest(name);
            if !suggestions.is_empty() {
                println!(
                    "{} Did you mean: {}?",
                    "?".yellow(),
                    suggestions.join(", ").cyan()
                );
            }
            return Err(e.into());
        }
    }

    let results = installer
        .install_all(formula_names, options)
        .await
        .context("installation failed")?;
    for outcome in &results {
        print_outcome(outcome, 0);
    }

    let installed = results.iter().filter(|o| o.skipped.is_none()).count();
    println!(
        "\n{} Installed {} packages",
        "✓".green().bold(),
        installed.to_string().bold()
    );
    Ok(())
}

fn print_outcome(outcome: &InstallOutcome, depth: usize) {
    let indent = "  ".repeat(depth + 1);
    for dep in &outcome.dependencies {
        print_outcome(dep, depth + 1);
    }

    if let Some(reason) = &outcome.skipped {
        println!("{}{} {}", indent, "⚠".yellow(), reason);
        return;
    }

    let how = if outcome.poured { "poured" } else { "built" };
    println!(
        "{}{} Installed {} {} ({})",
        indent,
        "✓".green(),
        outcome.name.bold().green(),
        outcome.version.as_deref().unwrap_or_default().dimmed(),
        how
    );
    if !outcome.linked {
        println!("{}  {} not linked into the prefix", indent, "→".dimmed());
    }
    for warning in &outcome.warnings {
        println!("{}  {} {}", indent, "⚠".yellow(), warning);
    }
}

pub fn uninstall(paths: &Paths, formula_names: &[String], force: bool) -> Result<()> {
    for name in formula_names {
        let kegs = keg::installed_versions(paths, name)?;
        if kegs.is_empty() {
            bail!("No such keg: {}", paths.rack(name).display());
        }

        if !force {
            let dependents = installed_dependents(paths, name)?;
            if !dependents.is_empty() {
                bail!(
                    "Refusing to uninstall {} because it is required by {}",
                    name,
                    dependents.join(", ")
                );
            }
        }

        for keg in &kegs {
            if keg.is_linked() {
                let removed = link::unlink(keg)?;
                println!(
                    "  {} Unlinked {} ({} symlinks removed)",
                    "✓".green(),
                    name.bold(),
                    removed.to_string().dimmed()
                );
            }
            keg.uninstall()
                .with_context(|| format!("failed to remove {}", keg.path().display()))?;
            println!(
                "  {} Uninstalled {} {}",
                "✓".green(),
                name.bold().green(),
                keg.version().dimmed()
            );
        }
    }
    Ok(())
}

/// Other installed formulae whose receipts list `name` as a runtime dependency
fn installed_dependents(paths: &Paths, name: &str) -> Result<Vec<String>> {
    let mut dependents = Vec::new();
    for keg in keg::installed_kegs(paths)? {
        if keg.name() == name {
            continue;
        }
        let Ok(receipt) = keg.receipt() else {
            continue;
        };
        if receipt
            .runtime_dependencies
            .iter()
            .any(|d| d.full_name == name)
        {
            dependents.push(keg.name().to_string());
        }
    }
    dependents.sort();
    dependents.dedup();
    Ok(dependents)
}

fn newest_keg(paths: &Paths, name: &str) -> Result<Keg> {
    keg::installed_versions(paths, name)?
        .into_iter()
        .next()
        .with_context(|| format!("{} is not installed", name))
}

pub fn link(paths: &Paths, formula_names: &[String], mode: LinkMode) -> Result<()> {
    for name in formula_names {
        let keg = newest_keg(paths, name)?;
        let report = link::link(&keg, mode)?;

        if mode.dry_run {
            let (label, entries) = if mode.overwrite {
                ("Would remove", &report.would_overwrite)
            } else {
                ("Would link", &report.would_link)
            };
            println!("{} {}:", label.bold(), name.cyan());
            for path in entries {
                println!("  {}", path.display());
            }
            continue;
        }

        println!(
            "{} Linking {}... {} symlinks created",
            "✓".green(),
            keg.path().display(),
            report.links.to_string().bold()
        );
    }
    Ok(())
}

pub fn unlink(paths: &Paths, formula_names: &[String]) -> Result<()> {
    for name in formula_names {
        let kegs = keg::installed_versions(paths, name)?;
        let Some(keg) = kegs.iter().find(|k| k.is_linked()) else {
            println!("{} {} is not linked", "⚠".yellow(), name.bold());
            continue;
        };
        let removed = link::unlink(keg)?;
        println!(
            "{} Unlinking {}... {} symlinks removed",
            "✓".green(),
            keg.path().display(),
            removed.to_string().bold()
        );
    }
    Ok(())
}

pub fn deps(formulary: &Formulary, formula: &str, skip_build: bool) -> Result<()> {
    let recipe = formulary.resolve(formula)?;
    let root_options = recipe.build_options(Vec::<String>::new());

    let deps = expand::expand_dependencies(&recipe, formulary, |dependent, dep| {
        if skip_build && dep.is_build() {
            return Ok(Action::Prune);
        }
        let build = if dependent.name == recipe.name {
            root_options.clone()
        } else {
            dependent.build_options(Vec::<String>::new())
        };
        Ok(expand::default_action(&build, dep))
    })?;

    if deps.is_empty() {
        println!("{} No dependencies", "✓".green());
        return Ok(());
    }

    for dep in &deps {
        if dep.is_build() {
            println!("{} {}", dep.name, "(build)".dimmed());
        } else {
            println!("{}", dep.name);
        }
    }
    Ok(())
}

pub fn bottle(
    paths: &Paths,
    tool: &dyn LinkageTool,
    formula_names: &[String],
    out_dir: &Path,
    rebuild: u32,
) -> Result<()> {
    let tag = platform::detect_bottle_tag()?;
    for name in formula_names {
        let keg = newest_keg(paths, name)?;
        let baked = bottle::bake_bottle(&keg, tool, out_dir, &tag, rebuild)
            .with_context(|| format!("failed to bottle {}", name))?;

        println!(
            "{} {}",
            "==>".bold().green(),
            baked.path.display().to_string().bold()
        );
        println!("{}: {}", "sha256".bold(), baked.sha256);
        println!("{}: {}", "cellar".bold(), baked.spec.cellar);
        println!("{}", serde_json::to_string_pretty(&baked.spec)?);
    }
    Ok(())
}

pub fn fix_install_names(paths: &Paths, tool: &dyn LinkageTool, formula_names: &[String]) -> Result<()> {
    for name in formula_names {
        let keg = newest_keg(paths, name)?;
        let report = relocate::fix_install_names(keg.path(), &keg.opt_record(), paths, tool)?;
        println!(
            "{} {}: {} binaries updated",
            "✓".green(),
            name.bold(),
            report.binaries.to_string().bold()
        );
    }
    Ok(())
}
