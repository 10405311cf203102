// ============================================
// winprovision - orchestrator.rs
// ============================================
// Runs the deployment table.
//
// Per unit, in priority order:
//
//   1. runtime gate     needs PowerShell 7+ and we don't have it -> skip
//   2. source gate      source folder/script missing            -> skip
//   3. elevation gate   needs admin and we aren't admin          -> queue
//   4. apply inline     copy / script / packages / features / ...
//
// Queued units go to one ElevationSession. After the last unit the
// session runs them all in a single elevated pass, each one as
// `winprovision apply-unit <name>` against the same manifest.
//
// A failing unit is logged, its changes are compensated (backups
// restored, then its declared rollback), and the run moves on. Only a
// missing prerequisite (no package manager, no admin rights where they
// are strictly needed) stops the run early. The summary is printed
// either way.
// ============================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backup;
use crate::installers::{adapter_for, InstallOutcome, PackageManager, FEATURE};
use crate::manifest::{SetupManifest, UnitAction, UnitSpec};
use crate::obs::{ObsInstaller, ObsOptions};
use crate::platform::{self, has_modern_powershell};
use crate::process::CommandRunner;
use crate::release::ReleaseSource;
use crate::session::{
    run_rollbacks, BatchOptions, BatchReport, CompensatingAction, Confirm, ElevatedLauncher,
    ElevationSession, OperationStatus, RollbackAction,
};
use crate::status::StatusSink;
use crate::target::{default_tools_dir, EnvSnapshot, TargetSpec};
use crate::version::{self, VersionTag};

// ============================================
// CONTEXT
// ============================================

/// Facts about the machine, gathered once per run.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub elevated: bool,
    /// PowerShell 7+ is installed
    pub modern_shell: bool,
    pub env: EnvSnapshot,
    /// Executable the elevated batch calls back into
    pub self_exe: PathBuf,
    /// Parent folder for session and scratch folders
    pub temp_root: PathBuf,
}

impl HostContext {
    pub fn detect(tools_dir: Option<PathBuf>, runner: &dyn CommandRunner) -> Result<Self> {
        let elevated = platform::is_elevated();
        let tools_dir = tools_dir.unwrap_or_else(|| default_tools_dir(elevated));
        let host = HostContext {
            elevated,
            modern_shell: has_modern_powershell(runner),
            env: EnvSnapshot::capture(tools_dir),
            self_exe: std::env::current_exe().context("Could not locate our own executable")?,
            temp_root: std::env::temp_dir(),
        };
        tracing::debug!(
            "host: elevated={} pwsh7={} tools={}",
            host.elevated,
            host.modern_shell,
            host.env.tools_dir.display()
        );
        Ok(host)
    }
}

/// External collaborators, borrowed for the duration of a run.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub runner: &'a dyn CommandRunner,
    pub launcher: &'a dyn ElevatedLauncher,
    pub confirm: &'a dyn Confirm,
    pub releases: &'a dyn ReleaseSource,
    pub sink: &'a StatusSink,
}

/// Options for one orchestrator run.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Redeploy equal versions, recreate OBS profiles, pass -Force to scripts
    pub force: bool,
    /// Only units carrying one of these tags (all when empty)
    pub tags: Vec<String>,
    /// Only these units (all when empty)
    pub only: Vec<String>,
    /// Never queue; used by `apply-unit` inside the elevated batch
    pub inline_only: bool,
    pub keep_logs: bool,
    pub show_progress: bool,
    pub progress_timeout: Option<Duration>,
}

// ============================================
// OUTCOMES
// ============================================

/// Final state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Applied { reboot_required: bool },
    AlreadyPresent,
    Skipped(String),
    /// Waiting for the elevated batch
    Queued(Uuid),
    Failed(String),
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Applied {
                reboot_required: true,
            } => write!(f, "applied (restart required)"),
            UnitOutcome::Applied { .. } => write!(f, "applied"),
            UnitOutcome::AlreadyPresent => write!(f, "already present"),
            UnitOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            UnitOutcome::Queued(_) => write!(f, "queued for elevation"),
            UnitOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What an `apply-unit` child writes for its parent, one JSON object
/// per unit in the session folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
enum ReportedOutcome {
    Applied {
        #[serde(default)]
        reboot_required: bool,
    },
    AlreadyPresent,
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl ReportedOutcome {
    fn from_outcome(outcome: &UnitOutcome) -> Option<Self> {
        Some(match outcome {
            UnitOutcome::Applied { reboot_required } => ReportedOutcome::Applied {
                reboot_required: *reboot_required,
            },
            UnitOutcome::AlreadyPresent => ReportedOutcome::AlreadyPresent,
            UnitOutcome::Skipped(reason) => ReportedOutcome::Skipped {
                reason: reason.clone(),
            },
            UnitOutcome::Failed(reason) => ReportedOutcome::Failed {
                reason: reason.clone(),
            },
            UnitOutcome::Queued(_) => return None,
        })
    }

    fn into_outcome(self) -> UnitOutcome {
        match self {
            ReportedOutcome::Applied { reboot_required } => UnitOutcome::Applied { reboot_required },
            ReportedOutcome::AlreadyPresent => UnitOutcome::AlreadyPresent,
            ReportedOutcome::Skipped { reason } => UnitOutcome::Skipped(reason),
            ReportedOutcome::Failed { reason } => UnitOutcome::Failed(reason),
        }
    }
}

/// Where the child reports on `unit` inside a session folder.
pub fn outcome_report_path(session_dir: &Path, unit: &str) -> PathBuf {
    let safe: String = unit
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    session_dir.join(format!("outcome-{}.json", safe))
}

/// Write the outcome of `unit` from `summary` to `path`.
pub fn write_outcome_report(path: &Path, summary: &RunSummary, unit: &str) -> Result<()> {
    let outcome = summary
        .units
        .iter()
        .find(|u| u.name.eq_ignore_ascii_case(unit))
        .and_then(|u| ReportedOutcome::from_outcome(&u.outcome))
        .with_context(|| format!("No outcome recorded for '{}'", unit))?;
    let json = serde_json::to_string(&outcome)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Outcome written by the child, if it left a readable one.
fn read_outcome_report(path: &Path) -> Option<UnitOutcome> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ReportedOutcome>(text.trim_start_matches('\u{feff}')) {
        Ok(reported) => Some(reported.into_outcome()),
        Err(e) => {
            tracing::warn!("ignoring unreadable outcome report {}: {}", path.display(), e);
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitRecord {
    pub name: String,
    pub outcome: UnitOutcome,
    pub instructions: Option<String>,
}

/// End-of-run report.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub units: Vec<UnitRecord>,
    pub batch: Option<BatchReport>,
    /// Set when a missing prerequisite stopped the run
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryCounts {
    pub deployed: usize,
    pub already_present: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn counts(&self) -> SummaryCounts {
        let mut counts = SummaryCounts::default();
        for unit in &self.units {
            match unit.outcome {
                UnitOutcome::Applied { .. } => counts.deployed += 1,
                UnitOutcome::AlreadyPresent => counts.already_present += 1,
                UnitOutcome::Skipped(_) => counts.skipped += 1,
                UnitOutcome::Queued(_) | UnitOutcome::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    pub fn reboot_required(&self) -> bool {
        self.units.iter().any(|u| {
            matches!(
                u.outcome,
                UnitOutcome::Applied {
                    reboot_required: true
                }
            )
        })
    }

    pub fn is_success(&self) -> bool {
        self.fatal.is_none() && self.counts().failed == 0
    }

    #[cfg(test)]
    pub fn outcome_of(&self, name: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|u| u.name == name).map(|u| &u.outcome)
    }

    /// Print the summary through the sink.
    pub fn print(&self, sink: &StatusSink) {
        sink.header("Summary");

        for unit in &self.units {
            let line = format!("{}: {}", unit.name, unit.outcome);
            match unit.outcome {
                UnitOutcome::Applied { .. } => sink.success(line),
                UnitOutcome::AlreadyPresent => sink.info(line),
                UnitOutcome::Skipped(_) => sink.info(line),
                UnitOutcome::Queued(_) | UnitOutcome::Failed(_) => sink.error(line),
            }
        }

        let counts = self.counts();
        sink.info(format!(
            "Deployed: {}  Already present: {}  Skipped: {}  Failed: {}",
            counts.deployed, counts.already_present, counts.skipped, counts.failed
        ));

        if let Some(batch) = &self.batch {
            sink.info(format!(
                "Elevated operations: {} succeeded, {} failed{}",
                batch.succeeded,
                batch.failed,
                if batch.declined { " (elevation declined)" } else { "" }
            ));
            if let Some(rollback) = &batch.rollback {
                sink.info(format!(
                    "Rollback: {} succeeded, {} failed, {} skipped",
                    rollback.succeeded, rollback.failed, rollback.skipped
                ));
            }
        }

        let instructions: Vec<&UnitRecord> = self
            .units
            .iter()
            .filter(|u| matches!(u.outcome, UnitOutcome::Applied { .. }))
            .filter(|u| u.instructions.is_some())
            .collect();
        if !instructions.is_empty() {
            sink.header("Next steps");
            for unit in instructions {
                if let Some(text) = &unit.instructions {
                    sink.info(format!("{}: {}", unit.name, text));
                }
            }
        }

        if let Some(reason) = &self.fatal {
            sink.error(format!("Run stopped early: {}", reason));
        }
        if self.reboot_required() {
            sink.warning("A restart is required to finish some changes");
        }
    }
}

/// Why applying a unit did not succeed.
enum UnitFailure {
    /// Logged, compensated, run continues
    Recoverable(String),
    /// Stops the run
    Fatal(String),
}

impl From<anyhow::Error> for UnitFailure {
    fn from(e: anyhow::Error) -> Self {
        UnitFailure::Recoverable(format!("{:#}", e))
    }
}

/// Compensating actions collected while applying one unit inline.
struct Compensations {
    actions: Vec<RollbackAction>,
}

impl Compensations {
    fn new() -> Self {
        Compensations {
            actions: Vec::new(),
        }
    }

    fn push(&mut self, description: String, action: CompensatingAction, requires_elevation: bool) {
        let sequence = self.actions.len() as u64;
        self.actions.push(RollbackAction {
            description,
            action,
            requires_elevation,
            created_at: Utc::now(),
            sequence,
        });
    }
}

// ============================================
// VERSION GATE
// ============================================

/// Decide whether `source` should be copied over `target`.
///
/// Always when `always_apply` or the target is absent. Otherwise by
/// version: newer source deploys, equal deploys only with `force`,
/// older source never deploys.
pub fn should_deploy(source: &Path, target: &Path, always_apply: bool, force: bool) -> bool {
    if always_apply || !target.exists() {
        return true;
    }
    let source_version = version::extract_version(source);
    let target_version = version::extract_version(target);
    tracing::debug!(
        "{}: source {:?} vs target {:?}",
        source.display(),
        source_version.as_ref().map(VersionTag::to_string),
        target_version.as_ref().map(VersionTag::to_string)
    );

    match version::compare(source_version.as_ref(), target_version.as_ref()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => force,
        std::cmp::Ordering::Less => false,
    }
}

/// Files directly inside `dir` whose name matches `pattern`, sorted.
fn matching_files(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let matcher = GlobBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Invalid file pattern '{}'", pattern))?
        .compile_matcher();

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| p.file_name().is_some_and(|n| matcher.is_match(n)))
        .collect();
    files.sort();
    Ok(files)
}

// ============================================
// ORCHESTRATOR
// ============================================

pub struct Orchestrator<'a> {
    manifest: &'a SetupManifest,
    host: &'a HostContext,
    services: Services<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(manifest: &'a SetupManifest, host: &'a HostContext, services: Services<'a>) -> Self {
        Orchestrator {
            manifest,
            host,
            services,
        }
    }

    /// Units selected by the tag and name filters, in execution order.
    pub fn selected_units(&self, options: &DeployOptions) -> Vec<&'a UnitSpec> {
        let manifest: &'a SetupManifest = self.manifest;
        for name in &options.only {
            if manifest.unit(name).is_none() {
                self.services
                    .sink
                    .warning(format!("No unit named '{}' in the manifest", name));
            }
        }

        manifest
            .ordered_units()
            .into_iter()
            .filter(|u| u.matches_tags(&options.tags))
            .filter(|u| {
                options.only.is_empty()
                    || options.only.iter().any(|n| n.eq_ignore_ascii_case(&u.name))
            })
            .collect()
    }

    /// Run every selected unit, then the elevated batch.
    pub fn run(&self, options: &DeployOptions) -> Result<RunSummary> {
        let sink = self.services.sink;
        let mut summary = RunSummary::default();
        let mut session: Option<ElevationSession> = None;

        for unit in self.selected_units(options) {
            if summary.fatal.is_some() {
                break;
            }
            sink.header(&format!("{} (priority {})", unit.name, unit.priority));

            let outcome = match self.gate(unit) {
                Some(reason) => {
                    sink.info(format!("Skipping {}: {}", unit.name, reason));
                    UnitOutcome::Skipped(reason)
                }
                None if unit.requires_elevation && !self.host.elevated => {
                    if options.inline_only {
                        let reason = "administrator rights are required".to_string();
                        sink.error(format!("{}: {}", unit.name, reason));
                        summary.fatal = Some(format!("{}: {}", unit.name, reason));
                        UnitOutcome::Failed(reason)
                    } else {
                        match self.queue(unit, options, &mut session) {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                sink.error(format!("Could not queue {}: {:#}", unit.name, e));
                                UnitOutcome::Failed(format!("{:#}", e))
                            }
                        }
                    }
                }
                None => match self.apply_inline(unit, options) {
                    Ok(outcome) => outcome,
                    Err(reason) => {
                        if matches!(reason, UnitFailure::Fatal(_)) {
                            summary.fatal = Some(format!("{}: {}", unit.name, reason_text(&reason)));
                        }
                        UnitOutcome::Failed(reason_text(&reason).to_string())
                    }
                },
            };

            summary.units.push(UnitRecord {
                name: unit.name.clone(),
                outcome,
                instructions: unit.instructions.clone(),
            });
        }

        if let Some(session) = session {
            self.finish_batch(session, options, &mut summary)?;
        }

        Ok(summary)
    }

    /// Skip reason from the runtime and source gates, if any.
    fn gate(&self, unit: &UnitSpec) -> Option<String> {
        if unit.requires_minimum_runtime && !self.host.modern_shell {
            return Some(format!(
                "requires PowerShell {}+",
                platform::MINIMUM_POWERSHELL_MAJOR
            ));
        }

        match &unit.action {
            UnitAction::Copy { source_dir, .. } => {
                let dir = self.manifest.resolve_path(source_dir);
                (!dir.is_dir()).then(|| format!("source folder {} not found", dir.display()))
            }
            UnitAction::Script { path, .. } => {
                let script = self.manifest.resolve_path(path);
                (!script.is_file()).then(|| format!("script {} not found", script.display()))
            }
            _ => None,
        }
    }

    // ============================================
    // QUEUEING
    // ============================================

    fn queue(
        &self,
        unit: &UnitSpec,
        options: &DeployOptions,
        session: &mut Option<ElevationSession>,
    ) -> Result<UnitOutcome> {
        let sink = self.services.sink;

        if session.is_none() {
            let opened = ElevationSession::open(&self.host.temp_root)?;
            tracing::info!(
                "elevation session {} in {}",
                opened.id(),
                opened.directory().display()
            );
            sink.attach(&opened.directory().join("run.log"));
            *session = Some(opened);
        }
        let Some(session) = session.as_mut() else {
            anyhow::bail!("elevation session unavailable");
        };

        // Registered now, so it can be offered even though nothing ran yet
        if let Some(rollback) = &unit.rollback {
            session.register_rollback(
                &format!("undo {}", unit.name),
                rollback.clone(),
                unit.rollback_requires_elevation,
            );
        }

        let args = self.apply_unit_args(unit, options, session);
        let id = session.enqueue(&unit.name, &self.host.self_exe, args, unit.priority);
        sink.info(format!(
            "{} needs administrator rights; queued for the elevated batch",
            unit.name
        ));
        Ok(UnitOutcome::Queued(id))
    }

    /// Command line the elevated batch uses to apply `unit`. The child
    /// appends its status lines to the session progress log and leaves
    /// its outcome in the session folder.
    fn apply_unit_args(
        &self,
        unit: &UnitSpec,
        options: &DeployOptions,
        session: &ElevationSession,
    ) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(source) = &self.manifest.source {
            args.push("--config".to_string());
            args.push(source.to_string_lossy().into_owned());
        }
        args.push("--yes".to_string());
        args.push("apply-unit".to_string());
        args.push(unit.name.clone());
        if options.force {
            args.push("--force".to_string());
        }
        args.push("--progress-log".to_string());
        args.push(session.progress_log().to_string_lossy().into_owned());
        args.push("--report".to_string());
        args.push(
            outcome_report_path(session.directory(), &unit.name)
                .to_string_lossy()
                .into_owned(),
        );
        args
    }

    fn finish_batch(
        &self,
        mut session: ElevationSession,
        options: &DeployOptions,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let sink = self.services.sink;

        if summary.fatal.is_some() {
            for record in summary.units.iter_mut() {
                if matches!(record.outcome, UnitOutcome::Queued(_)) {
                    record.outcome = UnitOutcome::Skipped("run stopped before the elevated batch".into());
                }
            }
            sink.detach();
            session.close(options.keep_logs);
            return Ok(());
        }

        tracing::debug!(
            "{} operation(s) and {} rollback action(s) registered",
            session.operations().len(),
            session.rollbacks().len()
        );
        let batch_options = BatchOptions {
            show_progress: options.show_progress,
            progress_timeout: options.progress_timeout,
            elevated: self.host.elevated,
        };
        let report = session.run_batch(
            &batch_options,
            self.services.launcher,
            self.services.confirm,
            self.services.runner,
            sink,
        );

        match report {
            Ok(report) => summary.batch = Some(report),
            Err(e) => sink.error(format!("Elevated batch failed: {:#}", e)),
        }

        for record in summary.units.iter_mut() {
            let UnitOutcome::Queued(id) = record.outcome else {
                continue;
            };
            let reported = read_outcome_report(&outcome_report_path(session.directory(), &record.name));
            record.outcome = match (session.operation(id), reported) {
                (Some(op), Some(reported)) if op.status == OperationStatus::Succeeded => reported,
                // exit code 0 but no report left behind
                (Some(op), None) if op.status == OperationStatus::Succeeded => UnitOutcome::Applied {
                    reboot_required: false,
                },
                (Some(_), Some(UnitOutcome::Failed(reason))) => UnitOutcome::Failed(reason),
                (Some(op), _) => UnitOutcome::Failed(
                    op.error
                        .clone()
                        .or_else(|| op.exit_code.map(|c| format!("exit code {}", c)))
                        .unwrap_or_else(|| "elevated operation failed".to_string()),
                ),
                (None, _) => UnitOutcome::Failed("operation missing from session".to_string()),
            };
        }

        sink.detach();
        if options.keep_logs {
            sink.info(format!(
                "Session files kept: {} and {}",
                session.progress_log().display(),
                session.results_file().display()
            ));
        }
        session.close(options.keep_logs);
        Ok(())
    }

    // ============================================
    // INLINE APPLICATION
    // ============================================

    fn apply_inline(&self, unit: &UnitSpec, options: &DeployOptions) -> Result<UnitOutcome, UnitFailure> {
        let sink = self.services.sink;
        let mut compensations = Compensations::new();
        if let Some(rollback) = &unit.rollback {
            compensations.push(
                format!("undo {}", unit.name),
                rollback.clone(),
                unit.rollback_requires_elevation,
            );
        }

        let result = match &unit.action {
            UnitAction::Copy {
                source_dir,
                pattern,
                target,
            } => self.apply_copy(unit, source_dir, pattern, target, options, &mut compensations),
            UnitAction::Script { path, args } => self.apply_script(unit, path, args, options),
            UnitAction::Packages { manager, packages } => self.apply_packages(*manager, packages),
            UnitAction::Features { features } => self.apply_features(features),
            UnitAction::Command { program, args } => self.apply_command(program, args),
            UnitAction::Obs { profiles } => self.apply_obs(profiles, options),
        };

        match &result {
            Ok(outcome) => {
                tracing::info!("{}: {}", unit.name, outcome);
            }
            Err(failure) => {
                sink.error(format!("{} failed: {}", unit.name, reason_text(failure)));
                if !compensations.actions.is_empty() {
                    sink.warning(format!("Undoing changes made by {}", unit.name));
                    run_rollbacks(
                        &compensations.actions,
                        self.host.elevated,
                        self.services.runner,
                        sink,
                    );
                }
            }
        }
        result
    }

    fn apply_copy(
        &self,
        unit: &UnitSpec,
        source_dir: &Path,
        pattern: &str,
        target: &TargetSpec,
        options: &DeployOptions,
        compensations: &mut Compensations,
    ) -> Result<UnitOutcome, UnitFailure> {
        let sink = self.services.sink;
        let Some(target_dir) = target.resolve(&self.host.env) else {
            return Ok(UnitOutcome::Skipped(format!("no {} found", target.describe())));
        };

        let files = matching_files(&self.manifest.resolve_path(source_dir), pattern)?;
        if files.is_empty() {
            return Ok(UnitOutcome::Skipped(format!("no files match '{}'", pattern)));
        }

        let policy = self.manifest.settings.backup_policy();
        let mut deployed = 0;

        for file in &files {
            let Some(file_name) = file.file_name() else { continue };
            let dest = target_dir.join(file_name);

            if !should_deploy(file, &dest, unit.always_apply, options.force) {
                sink.info(format!(
                    "{} is up to date",
                    dest.display()
                ));
                continue;
            }

            fs::create_dir_all(&target_dir)
                .with_context(|| format!("Failed to create {}", target_dir.display()))?;

            if dest.exists() {
                if let Some(saved) = backup::backup(&dest, &policy, sink) {
                    compensations.push(
                        format!("restore {}", dest.display()),
                        CompensatingAction::RestoreFileFromBackup {
                            target: dest.clone(),
                            backup: saved,
                        },
                        false,
                    );
                }
            } else {
                compensations.push(
                    format!("remove {}", dest.display()),
                    CompensatingAction::DeleteFile { path: dest.clone() },
                    false,
                );
            }

            fs::copy(file, &dest).with_context(|| {
                format!("Failed to copy {} to {}", file.display(), dest.display())
            })?;

            let shown = version::extract_version(&dest)
                .map(|v| format!(" (version {})", v))
                .unwrap_or_default();
            sink.success(format!("Deployed {}{}", dest.display(), shown));
            deployed += 1;
        }

        if deployed == 0 {
            Ok(UnitOutcome::Skipped("same or newer version".to_string()))
        } else {
            Ok(UnitOutcome::Applied {
                reboot_required: false,
            })
        }
    }

    fn apply_script(
        &self,
        unit: &UnitSpec,
        path: &Path,
        args: &[String],
        options: &DeployOptions,
    ) -> Result<UnitOutcome, UnitFailure> {
        let shell = if unit.requires_minimum_runtime {
            "pwsh"
        } else {
            "powershell.exe"
        };
        let script = self.manifest.resolve_path(path);

        let mut command = vec![
            "-NoProfile".to_string(),
            "-ExecutionPolicy".to_string(),
            "Bypass".to_string(),
            "-File".to_string(),
            script.to_string_lossy().into_owned(),
        ];
        command.extend(args.iter().cloned());
        if options.force {
            command.push("-Force".to_string());
        }

        self.services.sink.info(format!("Running {}", script.display()));
        let output = self
            .services
            .runner
            .run(shell, &command)
            .with_context(|| format!("Failed to start {}", shell))?;

        match output.code {
            None | Some(0) => Ok(UnitOutcome::Applied {
                reboot_required: false,
            }),
            Some(code) => Err(UnitFailure::Recoverable(format!(
                "script exited with code {}",
                code
            ))),
        }
    }

    fn apply_packages(
        &self,
        manager: PackageManager,
        packages: &[String],
    ) -> Result<UnitOutcome, UnitFailure> {
        let adapter = adapter_for(manager);
        if manager == PackageManager::Feature {
            return self.apply_features(packages);
        }

        adapter
            .ensure_available(self.services.runner, self.host.elevated, self.services.sink)
            .map_err(|e| UnitFailure::Fatal(e.to_string()))?;

        let results = adapter.install_all(self.services.runner, packages, self.services.sink);
        Self::fold_results(results.iter().map(|r| (&r.package, &r.outcome)))
    }

    fn apply_features(&self, features: &[String]) -> Result<UnitOutcome, UnitFailure> {
        if !self.host.elevated {
            return Err(UnitFailure::Fatal(
                "enabling Windows features requires administrator rights".to_string(),
            ));
        }
        FEATURE
            .ensure_available(self.services.runner, self.host.elevated, self.services.sink)
            .map_err(|e| UnitFailure::Fatal(e.to_string()))?;

        let results = FEATURE.install_all(self.services.runner, features, self.services.sink);
        Self::fold_results(results.iter().map(|r| (&r.package, &r.outcome)))
    }

    /// Collapse per-package outcomes into one unit outcome.
    fn fold_results<'r>(
        results: impl Iterator<Item = (&'r String, &'r InstallOutcome)>,
    ) -> Result<UnitOutcome, UnitFailure> {
        let mut failed = Vec::new();
        let mut changed = false;
        let mut reboot = false;

        for (name, outcome) in results {
            match outcome {
                InstallOutcome::Installed => changed = true,
                InstallOutcome::RebootRequired => {
                    changed = true;
                    reboot = true;
                }
                InstallOutcome::AlreadyPresent => {}
                InstallOutcome::Failed(_) => failed.push(name.as_str()),
            }
        }

        if !failed.is_empty() {
            return Err(UnitFailure::Recoverable(format!(
                "{} failed to install: {}",
                failed.len(),
                failed.join(", ")
            )));
        }
        if changed {
            Ok(UnitOutcome::Applied {
                reboot_required: reboot,
            })
        } else {
            Ok(UnitOutcome::AlreadyPresent)
        }
    }

    fn apply_command(&self, program: &str, args: &[String]) -> Result<UnitOutcome, UnitFailure> {
        let output = self
            .services
            .runner
            .run(program, args)
            .with_context(|| format!("Failed to start {}", program))?;
        match output.code {
            Some(0) => Ok(UnitOutcome::Applied {
                reboot_required: false,
            }),
            code => Err(UnitFailure::Recoverable(format!(
                "{} exited with {:?}: {}",
                program,
                code,
                output.combined().trim()
            ))),
        }
    }

    fn apply_obs(&self, profiles: &[String], options: &DeployOptions) -> Result<UnitOutcome, UnitFailure> {
        let Some(config) = &self.manifest.obs else {
            return Ok(UnitOutcome::Skipped("no [obs] section in the manifest".to_string()));
        };

        let installer = ObsInstaller::new(
            config,
            self.manifest.resolve_path(&config.install_root),
            self.host.temp_root.join("winprovision-obs"),
            self.services.releases,
            self.services.runner,
            self.services.sink,
        );
        let report = installer.run(&ObsOptions {
            force: options.force,
            profiles: profiles.to_vec(),
        })?;

        if !report.is_success() {
            let names: Vec<&str> = report.failed_profiles.iter().map(|(n, _)| n.as_str()).collect();
            return Err(UnitFailure::Recoverable(format!(
                "profile(s) failed: {}",
                names.join(", ")
            )));
        }
        if report.is_noop() {
            Ok(UnitOutcome::AlreadyPresent)
        } else {
            Ok(UnitOutcome::Applied {
                reboot_required: false,
            })
        }
    }
}

fn reason_text(failure: &UnitFailure) -> &str {
    match failure {
        UnitFailure::Recoverable(reason) | UnitFailure::Fatal(reason) => reason,
    }
}

/// Map a summary to a process exit code.
pub fn exit_code(summary: &RunSummary) -> i32 {
    if summary.fatal.is_some() {
        2
    } else if summary.is_success() {
        0
    } else {
        1
    }
}
