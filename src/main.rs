// ============================================
// winprovision - main.rs
// ============================================
// Entry point.
//
// The program flow is:
// 1. Parse the command line (clap)
// 2. Set up logging (tracing, -v for more)
// 3. Load the manifest (--config, next to the EXE, cwd, embedded)
// 4. Run the subcommand and turn its result into an exit code
//
// `apply-unit` is hidden: the elevated batch calls back into this EXE
// with it, once per queued unit.
// ============================================

mod backup;
mod download;
mod installers;
mod manifest;
mod obs;
mod orchestrator;
mod platform;
mod process;
mod release;
mod session;
mod status;
mod target;
mod version;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use manifest::{SetupManifest, MANIFEST_FILE};
use obs::{ObsInstaller, ObsOptions};
use orchestrator::{DeployOptions, HostContext, Orchestrator, RunSummary, Services};
use platform::RunAsLauncher;
use process::SystemRunner;
use release::GithubClient;
use session::TerminalConfirm;
use status::StatusSink;

// ============================================
// COMMAND LINE
// ============================================

#[derive(Debug, Parser)]
#[command(name = "winprovision", version, about = "Idempotent Windows workstation setup")]
struct Cli {
    /// Manifest to use instead of the lookup order
    #[arg(long, short = 'c', global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v, -vv, -vvv)
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Answer yes to every prompt
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the deployment table
    Deploy(DeployArgs),

    /// Install or update the OBS portable profiles
    Obs(ObsArgs),

    /// List the units in execution order
    Units,

    /// Show the version tag embedded in each file
    Version {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Compare two version strings (-1, 0 or 1)
    Compare { left: String, right: String },

    /// Write the default manifest to disk
    Init {
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
        #[arg(long)]
        overwrite: bool,
    },

    /// Apply one unit in this process (used by the elevated batch)
    #[command(hide = true)]
    ApplyUnit {
        name: String,
        #[arg(long)]
        force: bool,
        /// Session progress log the parent is tailing
        #[arg(long, value_name = "FILE")]
        progress_log: Option<PathBuf>,
        /// Where to write this unit's outcome for the parent
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
}

/// Files an `apply-unit` child shares with the parent's session.
#[derive(Debug)]
struct ParentLinks {
    unit: String,
    progress_log: Option<PathBuf>,
    report: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DeployArgs {
    /// Redeploy files whose version equals the installed one
    #[arg(long, short = 'f')]
    force: bool,

    /// Only units with one of these tags
    #[arg(long, short = 't', value_delimiter = ',')]
    tags: Vec<String>,

    /// Only these units
    #[arg(long, value_delimiter = ',')]
    only: Vec<String>,

    /// Keep the elevation session folder (script, progress log, results)
    #[arg(long)]
    keep_logs: bool,

    /// Stop echoing elevated progress after this many minutes
    #[arg(long, value_name = "N")]
    timeout_minutes: Option<u64>,

    /// Don't echo the elevated batch's progress
    #[arg(long)]
    no_progress: bool,
}

#[derive(Debug, Args)]
struct ObsArgs {
    /// Recreate profiles from fresh OBS files
    #[arg(long, short = 'f')]
    force: bool,

    /// Only these profiles
    #[arg(long = "profile", short = 'p')]
    profiles: Vec<String>,
}

/// Log level from -v/-q. Status lines already reach the terminal, so
/// tracing stays at warnings unless asked for more. RUST_LOG wins over -v.
fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        })
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ============================================
// MAIN FUNCTION
// ============================================

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    tracing::debug!("winprovision v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("app directory: {}", platform::app_directory().display());

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("✗").red().bold(), e);
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Deploy(args) => {
            let manifest = SetupManifest::discover(cli.config.as_deref())?;
            let options = DeployOptions {
                force: args.force,
                tags: args.tags,
                only: args.only,
                inline_only: false,
                keep_logs: args.keep_logs || manifest.settings.keep_session_logs,
                show_progress: manifest.settings.show_progress && !args.no_progress,
                progress_timeout: Some(Duration::from_secs(
                    args.timeout_minutes
                        .unwrap_or(manifest.settings.batch_timeout_minutes)
                        * 60,
                )),
            };
            deploy(&manifest, &options, cli.quiet, cli.yes, None)
        }

        Commands::ApplyUnit {
            name,
            force,
            progress_log,
            report,
        } => {
            let manifest = SetupManifest::discover(cli.config.as_deref())?;
            if manifest.unit(&name).is_none() {
                anyhow::bail!("No unit named '{}' in the manifest", name);
            }
            let links = ParentLinks {
                unit: name.clone(),
                progress_log,
                report,
            };
            let options = DeployOptions {
                force,
                only: vec![name],
                inline_only: true,
                show_progress: false,
                ..Default::default()
            };
            deploy(&manifest, &options, cli.quiet, true, Some(&links))
        }

        Commands::Obs(args) => {
            let manifest = SetupManifest::discover(cli.config.as_deref())?;
            run_obs(&manifest, args, cli.quiet)
        }

        Commands::Units => {
            let manifest = SetupManifest::discover(cli.config.as_deref())?;
            list_units(&manifest);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Version { files } => {
            for file in &files {
                match version::extract_version(file) {
                    Some(v) => println!("{}: {}", file.display(), v),
                    None => println!("{}: no version tag", file.display()),
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Compare { left, right } => {
            let result = match version::compare_str(&left, &right) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            };
            println!("{}", result);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Init { output, overwrite } => {
            let output = output.unwrap_or_else(|| PathBuf::from(MANIFEST_FILE));
            manifest::write_default(&output, overwrite)?;
            println!("Wrote {}", output.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ============================================
// SUBCOMMANDS
// ============================================

fn deploy(
    manifest: &SetupManifest,
    options: &DeployOptions,
    quiet: bool,
    yes: bool,
    parent: Option<&ParentLinks>,
) -> Result<ExitCode> {
    let runner = SystemRunner;
    let sink = StatusSink::new(quiet);
    if let Some(log) = parent.and_then(|p| p.progress_log.as_deref()) {
        sink.attach(log);
    }
    let host = HostContext::detect(manifest.settings.tools_dir.clone(), &runner)?;
    let releases = GithubClient::new(&manifest.settings.github_token_env, !quiet)?;
    let confirm = TerminalConfirm { assume_yes: yes };

    if !host.elevated && !options.inline_only {
        sink.info("Not running as administrator; admin-only units will be batched into one elevated pass");
    }

    let services = Services {
        runner: &runner,
        launcher: &RunAsLauncher,
        confirm: &confirm,
        releases: &releases,
        sink: &sink,
    };
    let summary: RunSummary = Orchestrator::new(manifest, &host, services).run(options)?;

    // Keep the child's summary out of the parent's progress echo
    sink.detach();
    if let Some(links) = parent {
        if let Some(report) = &links.report {
            if let Err(e) = orchestrator::write_outcome_report(report, &summary, &links.unit) {
                sink.warning(format!("Could not report the outcome of {}: {:#}", links.unit, e));
            }
        }
    }
    summary.print(&sink);

    Ok(exit_code(orchestrator::exit_code(&summary)))
}

fn run_obs(manifest: &SetupManifest, args: ObsArgs, quiet: bool) -> Result<ExitCode> {
    let config = manifest
        .obs
        .as_ref()
        .context("The manifest has no [obs] section")?;

    let runner = SystemRunner;
    let sink = StatusSink::new(quiet);
    let releases = GithubClient::new(&manifest.settings.github_token_env, !quiet)?;
    let installer = ObsInstaller::new(
        config,
        manifest.resolve_path(&config.install_root),
        std::env::temp_dir().join("winprovision-obs"),
        &releases,
        &runner,
        &sink,
    );

    let report = installer.run(&ObsOptions {
        force: args.force,
        profiles: args.profiles,
    })?;

    sink.header("OBS profiles");
    for profile in &report.profiles {
        sink.info(format!(
            "{}: {} ({} plugin(s) installed, {} current, {} failed)",
            profile.name,
            profile.directory.display(),
            profile.plugins_installed.len(),
            profile.plugins_current.len(),
            profile.plugins_failed.len()
        ));
    }
    for (name, reason) in &report.failed_profiles {
        sink.error(format!("{}: {}", name, reason));
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list_units(manifest: &SetupManifest) {
    match &manifest.source {
        Some(path) => println!("Manifest: {}", path.display()),
        None => println!("Manifest: embedded default"),
    }
    println!();
    println!("{:>4}  {:<24} {:<10} {:<24} {}", "PRIO", "NAME", "ADMIN", "TAGS", "SOURCE");

    for unit in manifest.ordered_units() {
        let source = match &unit.action {
            manifest::UnitAction::Copy { source_dir, pattern, .. } => {
                display_source(manifest, &source_dir.join(pattern))
            }
            manifest::UnitAction::Script { path, .. } => display_source(manifest, path),
            manifest::UnitAction::Packages { manager, packages } => {
                format!("{} ({} packages)", manager, packages.len())
            }
            manifest::UnitAction::Features { features } => format!("{} feature(s)", features.len()),
            manifest::UnitAction::Command { program, .. } => program.clone(),
            manifest::UnitAction::Obs { .. } => "[obs]".to_string(),
        };
        println!(
            "{:>4}  {:<24} {:<10} {:<24} {}",
            unit.priority,
            unit.name,
            if unit.requires_elevation { "yes" } else { "no" },
            unit.tags.join(","),
            source
        );
    }
}

fn display_source(manifest: &SetupManifest, path: &Path) -> String {
    manifest.resolve_path(path).display().to_string()
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
