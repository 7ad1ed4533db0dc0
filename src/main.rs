mod commands;

use brewkit::config::Paths;
use brewkit::formulary::Formulary;
use brewkit::installer::InstallOptions;
use brewkit::link::LinkMode;
use brewkit::linkage::{self, LinkageTool};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "brewkit")]
#[command(author, version, about = "Build, pour and link formulae into a prefix", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install formulae and their dependencies
    Install {
        /// Formula names
        formulae: Vec<String>,

        /// Build from source even when a bottle is available
        #[arg(short = 's', long)]
        build_from_source: bool,

        /// Install the HEAD version
        #[arg(long = "HEAD")]
        head: bool,

        /// Install the development version
        #[arg(long)]
        devel: bool,

        /// Skip installing dependencies
        #[arg(long)]
        ignore_dependencies: bool,

        /// Retry a failed download once
        #[arg(long)]
        retry: bool,

        /// Build options, e.g. --with=foo or --option=with-foo
        #[arg(long = "option", value_name = "OPTION")]
        options: Vec<String>,
    },

    /// Uninstall formulae
    Uninstall {
        /// Formula names
        formulae: Vec<String>,

        /// Remove even if other formulae depend on it
        #[arg(long)]
        force: bool,
    },

    /// Symlink a formula's installed files into the prefix
    Link {
        /// Formula names
        formulae: Vec<String>,

        /// List files that would be linked or removed
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Delete conflicting files in the prefix
        #[arg(long)]
        overwrite: bool,
    },

    /// Remove a formula's symlinks from the prefix
    Unlink {
        /// Formula names
        formulae: Vec<String>,
    },

    /// Show the flattened dependencies of a formula
    Deps {
        /// Formula name
        formula: String,

        /// Leave out build-time dependencies
        #[arg(long)]
        skip_build: bool,
    },

    /// Package installed kegs as relocatable bottles
    Bottle {
        /// Formula names
        formulae: Vec<String>,

        /// Directory to write archives to
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Bottle rebuild number
        #[arg(long, default_value_t = 0)]
        rebuild: u32,
    },

    /// Repoint load paths that still name the build directory
    FixInstallNames {
        /// Formula names
        formulae: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let paths = Paths::from_env();
    let formulary = Formulary::from_env(&paths.prefix);
    let tool: Arc<dyn LinkageTool> = Arc::from(linkage::native());

    match cli.command {
        Some(Commands::Install {
            formulae,
            build_from_source,
            head,
            devel,
            ignore_dependencies,
            retry,
            options,
        }) => {
            let options = InstallOptions {
                build_from_source,
                head,
                devel,
                ignore_dependencies,
                retry_fetch: retry,
                options,
                ..InstallOptions::default()
            };
            commands::install(&paths, formulary, tool, &formulae, &options).await?;
        }
        Some(Commands::Uninstall { formulae, force }) => {
            commands::uninstall(&paths, &formulae, force)?;
        }
        Some(Commands::Link {
            formulae,
            dry_run,
            overwrite,
        }) => {
            commands::link(&paths, &formulae, LinkMode { dry_run, overwrite })?;
        }
        Some(Commands::Unlink { formulae }) => {
            commands::unlink(&paths, &formulae)?;
        }
        Some(Commands::Deps {
            formula,
            skip_build,
        }) => {
            commands::deps(&formulary, &formula, skip_build)?;
        }
        Some(Commands::Bottle {
            formulae,
            output,
            rebuild,
        }) => {
            commands::bottle(&paths, tool.as_ref(), &formulae, &output, rebuild)?;
        }
        Some(Commands::FixInstallNames { formulae }) => {
            commands::fix_install_names(&paths, tool.as_ref(), &formulae)?;
        }
        None => {
            println!("{} brewkit {}", "==>".bold(), env!("CARGO_PKG_VERSION"));
            println!("\nRun {} to see available commands.", "brewkit --help".cyan());
            println!("Prefix: {}", paths.prefix.display());
        }
    }

    Ok(())
}
