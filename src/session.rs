// ============================================
// winprovision - session.rs
// ============================================
// Batched elevation.
//
// When we are NOT running as administrator, work that needs admin rights
// is queued instead of run. At the end of the run the queue becomes one
// generated PowerShell script, launched once through UAC:
//
//   <temp>/winprovision-<session id>/
//   ├── batch.ps1       generated script, one block per operation
//   ├── progress.log    "timestamp [Level] message" lines from the child
//   ├── results.json    one result record per operation
//   └── outcome-*.json  per-unit outcome left by `apply-unit`
//
// The child side (batch script and the apply-unit processes it starts)
// is the only writer of these files; the parent tails progress.log
// while waiting and reads the rest after exit.
//
// Rollback actions are registered as data (CompensatingAction) and run
// newest first.
//
// Only one session may be open per process (SESSION_ACTIVE guard).
// ============================================

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backup;
use crate::process::{ps_quote, CommandRunner};
use crate::status::StatusSink;

/// How often the progress log is polled while the elevated child runs.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default priority for queued operations (lower runs first).
pub const DEFAULT_PRIORITY: i32 = 5;

const SCRIPT_FILE: &str = "batch.ps1";
const PROGRESS_FILE: &str = "progress.log";
const RESULTS_FILE: &str = "results.json";

/// Set while an ElevationSession is alive.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("an elevation session is already active")]
    AlreadyActive,

    #[error("failed to prepare session directory {path}: {source}")]
    Workspace { path: PathBuf, source: io::Error },
}

// ============================================
// OPERATIONS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// One unit of work for the elevated child.
#[derive(Debug, Clone)]
pub struct ElevatedOperation {
    pub id: Uuid,
    pub name: String,
    /// Executable or .ps1 script to invoke
    pub program: PathBuf,
    pub args: Vec<String>,
    pub priority: i32,
    pub status: OperationStatus,
    pub started_at: Option<DateTime<FixedOffset>>,
    pub finished_at: Option<DateTime<FixedOffset>>,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
}

/// A result record as written by the generated script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperationResult {
    pub operation_id: String,
    #[serde(default)]
    pub operation_name: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ResultsDocument {
    Many(Vec<OperationResult>),
    One(OperationResult),
}

/// Parse results.json. A missing or empty file means zero results.
pub fn read_results(path: &Path) -> anyhow::Result<Vec<OperationResult>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    // Windows PowerShell writes UTF-8 with a BOM
    let trimmed = content.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let document: ResultsDocument = serde_json::from_str(trimmed)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(match document {
        ResultsDocument::Many(results) => results,
        ResultsDocument::One(result) => vec![result],
    })
}

// ============================================
// ROLLBACK
// ============================================

/// Something that undoes a side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CompensatingAction {
    DeleteDirectory { path: PathBuf },
    DeleteFile { path: PathBuf },
    RestoreFileFromBackup { target: PathBuf, backup: PathBuf },
    RunCommand {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Nothing automatic; tell the operator what to do
    ManualInstruction { text: String },
}

impl CompensatingAction {
    /// Carry out the action.
    pub fn execute(&self, runner: &dyn CommandRunner, sink: &StatusSink) -> anyhow::Result<()> {
        match self {
            CompensatingAction::DeleteDirectory { path } => {
                if path.exists() {
                    fs::remove_dir_all(path)
                        .with_context(|| format!("Failed to delete {}", path.display()))?;
                }
            }
            CompensatingAction::DeleteFile { path } => {
                if path.exists() {
                    fs::remove_file(path)
                        .with_context(|| format!("Failed to delete {}", path.display()))?;
                }
            }
            CompensatingAction::RestoreFileFromBackup { target, backup } => {
                backup::restore(backup, target)?;
            }
            CompensatingAction::RunCommand { program, args } => {
                let output = runner
                    .run(program, args)
                    .with_context(|| format!("Failed to run {program}"))?;
                if output.code.unwrap_or(0) != 0 {
                    anyhow::bail!("{program} exited with code {:?}", output.code);
                }
            }
            CompensatingAction::ManualInstruction { text } => {
                sink.warning(format!("Manual step required: {text}"));
            }
        }
        Ok(())
    }
}

/// A registered rollback step.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackAction {
    pub description: String,
    pub action: CompensatingAction,
    pub requires_elevation: bool,
    pub created_at: DateTime<Utc>,
    /// Registration order; breaks timestamp ties
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Run rollback actions newest first. One failing action does not stop the rest.
pub fn run_rollbacks(
    actions: &[RollbackAction],
    elevated: bool,
    runner: &dyn CommandRunner,
    sink: &StatusSink,
) -> RollbackReport {
    let mut ordered: Vec<&RollbackAction> = actions.iter().collect();
    ordered.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then(b.sequence.cmp(&a.sequence))
    });

    let mut report = RollbackReport::default();
    for entry in ordered {
        if entry.requires_elevation && !elevated {
            sink.warning(format!(
                "Skipping rollback '{}': requires administrator rights",
                entry.description
            ));
            report.skipped += 1;
            continue;
        }

        sink.info(format!("Rolling back: {}", entry.description));
        match entry.action.execute(runner, sink) {
            Ok(()) => report.succeeded += 1,
            Err(e) => {
                sink.error(format!("Rollback '{}' failed: {:#}", entry.description, e));
                report.failed += 1;
            }
        }
    }
    report
}

// ============================================
// EXTERNAL SEAMS
// ============================================

/// A running elevated child process.
pub trait ElevatedProcess {
    /// Exit code if the process has finished.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    /// Block until exit.
    fn wait(&mut self) -> io::Result<i32>;
}

/// Starts a PowerShell script with administrator rights.
pub trait ElevatedLauncher {
    fn launch(&self, script: &Path) -> io::Result<Box<dyn ElevatedProcess>>;
}

/// Yes/no questions to the operator.
pub trait Confirm {
    fn confirm(&self, question: &str, default: bool) -> bool;
}

/// Interactive prompt; `assume_yes` answers every question with yes.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm {
    pub assume_yes: bool,
}

impl Confirm for TerminalConfirm {
    fn confirm(&self, question: &str, default: bool) -> bool {
        if self.assume_yes {
            return true;
        }
        dialoguer::Confirm::new()
            .with_prompt(question)
            .default(default)
            .interact()
            .unwrap_or(false)
    }
}

// ============================================
// PROGRESS TAIL
// ============================================

/// Background reader that forwards new lines of a log file over a channel.
struct ProgressTail {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressTail {
    fn spawn(path: PathBuf, interval: Duration) -> (Self, Receiver<String>) {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut offset = 0u64;
            let mut pending = String::new();
            loop {
                let finishing = stop_flag.load(AtomicOrdering::Relaxed);
                if let Ok(chunk) = read_from(&path, &mut offset) {
                    pending.push_str(&chunk);
                    while let Some(pos) = pending.find('\n') {
                        let line: String = pending.drain(..=pos).collect();
                        let line = line.trim_end().trim_start_matches('\u{feff}');
                        if !line.is_empty() && tx.send(line.to_string()).is_err() {
                            return;
                        }
                    }
                }
                if finishing {
                    return;
                }
                thread::sleep(interval);
            }
        });

        (
            ProgressTail {
                stop,
                handle: Some(handle),
            },
            rx,
        )
    }

    /// Do one last read, then end the thread.
    fn finish(mut self) {
        self.stop.store(true, AtomicOrdering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_from(path: &Path, offset: &mut u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < *offset {
        *offset = 0;
    }
    file.seek(SeekFrom::Start(*offset))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    *offset += buf.len() as u64;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// ============================================
// SESSION
// ============================================

/// Options for `run_batch`.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Echo the child's progress log while waiting
    pub show_progress: bool,
    /// Stop echoing (not waiting) after this long
    pub progress_timeout: Option<Duration>,
    /// Whether the parent process itself is elevated (for rollback)
    pub elevated: bool,
}

/// Outcome of one elevated batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    /// The operator said no to elevation
    pub declined: bool,
    pub rollback: Option<RollbackReport>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.declined
    }
}

/// The single active elevation session.
#[derive(Debug)]
pub struct ElevationSession {
    id: Uuid,
    dir: PathBuf,
    progress_log: PathBuf,
    results_file: PathBuf,
    operations: Vec<ElevatedOperation>,
    rollbacks: Vec<RollbackAction>,
    next_sequence: u64,
    keep_logs: bool,
}

impl ElevationSession {
    /// Open the session, creating `<root>/winprovision-<id>/` with empty log files.
    pub fn open(root: &Path) -> Result<Self, SessionError> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyActive);
        }

        let id = Uuid::new_v4();
        let dir = root.join(format!("winprovision-{}", id));
        let progress_log = dir.join(PROGRESS_FILE);
        let results_file = dir.join(RESULTS_FILE);

        let prepared = fs::create_dir_all(&dir)
            .and_then(|_| File::create(&progress_log))
            .and_then(|_| File::create(&results_file));
        if let Err(source) = prepared {
            SESSION_ACTIVE.store(false, AtomicOrdering::SeqCst);
            return Err(SessionError::Workspace { path: dir, source });
        }

        tracing::debug!("opened elevation session {} in {}", id, dir.display());
        Ok(ElevationSession {
            id,
            dir,
            progress_log,
            results_file,
            operations: Vec::new(),
            rollbacks: Vec::new(),
            next_sequence: 0,
            keep_logs: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn progress_log(&self) -> &Path {
        &self.progress_log
    }

    pub fn results_file(&self) -> &Path {
        &self.results_file
    }

    pub fn operations(&self) -> &[ElevatedOperation] {
        &self.operations
    }

    pub fn rollbacks(&self) -> &[RollbackAction] {
        &self.rollbacks
    }

    pub fn operation(&self, id: Uuid) -> Option<&ElevatedOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Queue an operation for the elevated batch.
    pub fn enqueue(
        &mut self,
        name: &str,
        program: &Path,
        args: Vec<String>,
        priority: i32,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.operations.push(ElevatedOperation {
            id,
            name: name.to_string(),
            program: program.to_path_buf(),
            args,
            priority,
            status: OperationStatus::Queued,
            started_at: None,
            finished_at: None,
            exit_code: None,
            output: String::new(),
            error: None,
        });
        id
    }

    /// Register a rollback step; it runs before every step registered earlier.
    pub fn register_rollback(
        &mut self,
        description: &str,
        action: CompensatingAction,
        requires_elevation: bool,
    ) {
        self.rollbacks.push(RollbackAction {
            description: description.to_string(),
            action,
            requires_elevation,
            created_at: Utc::now(),
            sequence: self.next_sequence,
        });
        self.next_sequence += 1;
    }

    /// Queued operations in execution order: (priority, name).
    pub fn execution_order(&self) -> Vec<&ElevatedOperation> {
        let mut ordered: Vec<&ElevatedOperation> = self
            .operations
            .iter()
            .filter(|op| op.status == OperationStatus::Queued)
            .collect();
        ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        ordered
    }

    /// Run every queued operation in one elevated child process.
    pub fn run_batch(
        &mut self,
        options: &BatchOptions,
        launcher: &dyn ElevatedLauncher,
        confirm: &dyn Confirm,
        runner: &dyn CommandRunner,
        sink: &StatusSink,
    ) -> anyhow::Result<BatchReport> {
        let ordered: Vec<ElevatedOperation> =
            self.execution_order().into_iter().cloned().collect();
        if ordered.is_empty() {
            return Ok(BatchReport::default());
        }

        // ============================================
        // STEP 1: Generate the script
        // ============================================
        let script = render_batch_script(&ordered, &self.progress_log, &self.results_file);
        let script_path = self.dir.join(SCRIPT_FILE);
        fs::write(&script_path, script)
            .with_context(|| format!("Failed to write {}", script_path.display()))?;

        sink.header("Administrator operations");
        for (index, op) in ordered.iter().enumerate() {
            sink.info(format!("  {}. {} (priority {})", index + 1, op.name, op.priority));
        }

        // ============================================
        // STEP 2: Ask before elevating
        // ============================================
        let question = format!(
            "Run {} operation(s) with administrator rights?",
            ordered.len()
        );
        if !confirm.confirm(&question, true) {
            sink.warning("Elevation declined; administrator operations were not run");
            self.fail_all_queued("elevation declined");
            return Ok(BatchReport {
                failed: ordered.len(),
                declined: true,
                ..Default::default()
            });
        }

        // ============================================
        // STEP 3: Launch and wait
        // ============================================
        for op in self.operations.iter_mut() {
            if op.status == OperationStatus::Queued {
                op.status = OperationStatus::Running;
            }
        }

        let mut child = match launcher.launch(&script_path) {
            Ok(child) => child,
            Err(e) => {
                sink.error(format!("Could not start elevated process: {e}"));
                self.fail_all_running(&format!("elevated launch failed: {e}"));
                return Ok(BatchReport {
                    failed: ordered.len(),
                    declined: e.raw_os_error() == Some(1223),
                    ..Default::default()
                });
            }
        };

        let exit_code = if options.show_progress {
            self.wait_with_progress(child.as_mut(), options.progress_timeout, sink)?
        } else {
            child.wait().context("Failed waiting for elevated process")?
        };
        tracing::debug!("elevated batch exited with {exit_code}");

        // ============================================
        // STEP 4: Reconcile results
        // ============================================
        let results = match read_results(&self.results_file) {
            Ok(r) => r,
            Err(e) => {
                sink.error(format!("{e:#}"));
                Vec::new()
            }
        };
        let mut report = self.reconcile(&results, sink);

        // ============================================
        // STEP 5: Offer rollback on failure
        // ============================================
        if report.failed > 0 && !self.rollbacks.is_empty() {
            let question = format!(
                "{} operation(s) failed. Roll back {} registered change(s)?",
                report.failed,
                self.rollbacks.len()
            );
            if confirm.confirm(&question, false) {
                report.rollback = Some(self.rollback(options.elevated, runner, sink));
            }
        }

        Ok(report)
    }

    fn wait_with_progress(
        &self,
        child: &mut dyn ElevatedProcess,
        timeout: Option<Duration>,
        sink: &StatusSink,
    ) -> anyhow::Result<i32> {
        let (tail, lines) = ProgressTail::spawn(self.progress_log.clone(), PROGRESS_POLL_INTERVAL);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(code) = child.try_wait()? {
                tail.finish();
                for line in lines.try_iter() {
                    sink.raw(&line);
                }
                return Ok(code);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                sink.warning("Progress display timed out; still waiting for the elevated batch");
                tail.finish();
                return child.wait().context("Failed waiting for elevated process");
            }

            match lines.recv_timeout(PROGRESS_POLL_INTERVAL) {
                Ok(line) => sink.raw(&line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tail.finish();
                    return child.wait().context("Failed waiting for elevated process");
                }
            }
        }
    }

    fn reconcile(&mut self, results: &[OperationResult], sink: &StatusSink) -> BatchReport {
        let mut report = BatchReport::default();

        for op in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Running)
        {
            let id = op.id.to_string();
            match results.iter().find(|r| r.operation_id.eq_ignore_ascii_case(&id)) {
                Some(result) => {
                    op.started_at = parse_time(result.start_time.as_deref());
                    op.finished_at = parse_time(result.end_time.as_deref());
                    op.exit_code = result.exit_code;
                    op.output = result.output.clone().unwrap_or_default();
                    op.error = result.error.clone().filter(|e| !e.is_empty());
                    op.status = if result.success {
                        OperationStatus::Succeeded
                    } else {
                        OperationStatus::Failed
                    };
                }
                None => {
                    op.status = OperationStatus::Failed;
                    op.error = Some("no result recorded".to_string());
                }
            }

            match op.status {
                OperationStatus::Succeeded => {
                    report.succeeded += 1;
                    sink.success(format!("{}: succeeded", op.name));
                }
                _ => {
                    report.failed += 1;
                    let detail = op
                        .error
                        .clone()
                        .or_else(|| op.exit_code.map(|c| format!("exit code {c}")))
                        .unwrap_or_else(|| "failed".to_string());
                    sink.error(format!("{}: {}", op.name, detail));
                }
            }
        }

        sink.info(format!(
            "Elevated batch: {} succeeded, {} failed",
            report.succeeded, report.failed
        ));
        report
    }

    fn fail_all_queued(&mut self, reason: &str) {
        for op in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Queued)
        {
            op.status = OperationStatus::Failed;
            op.error = Some(reason.to_string());
        }
    }

    fn fail_all_running(&mut self, reason: &str) {
        for op in self
            .operations
            .iter_mut()
            .filter(|op| op.status == OperationStatus::Running)
        {
            op.status = OperationStatus::Failed;
            op.error = Some(reason.to_string());
        }
    }

    /// Run every registered rollback action, newest first.
    pub fn rollback(
        &mut self,
        elevated: bool,
        runner: &dyn CommandRunner,
        sink: &StatusSink,
    ) -> RollbackReport {
        let report = run_rollbacks(&self.rollbacks, elevated, runner, sink);
        sink.info(format!(
            "Rollback: {} succeeded, {} failed, {} skipped",
            report.succeeded, report.failed, report.skipped
        ));
        report
    }

    /// Close the session. The session directory is removed unless `keep_logs`.
    pub fn close(mut self, keep_logs: bool) {
        self.keep_logs = keep_logs;
        if keep_logs {
            tracing::info!("session logs kept in {}", self.dir.display());
        }
        // Drop does the cleanup and releases the guard
    }
}

impl Drop for ElevationSession {
    fn drop(&mut self) {
        if !self.keep_logs {
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!("could not remove {}: {}", self.dir.display(), e);
                }
            }
        }
        self.operations.clear();
        self.rollbacks.clear();
        SESSION_ACTIVE.store(false, AtomicOrdering::SeqCst);
    }
}

fn parse_time(value: Option<&str>) -> Option<DateTime<FixedOffset>> {
    value.and_then(|v| DateTime::parse_from_rfc3339(v).ok())
}

// ============================================
// SCRIPT GENERATION
// ============================================

/// Render the PowerShell script the elevated child runs.
///
/// Operations run in the given order; each one appends a result record,
/// and the full array is written to `results_file` as the last step.
pub fn render_batch_script(
    operations: &[ElevatedOperation],
    progress_log: &Path,
    results_file: &Path,
) -> String {
    let mut script = String::new();

    script.push_str("# Generated by winprovision. Runs elevated; do not edit.\r\n");
    script.push_str("$ErrorActionPreference = 'Continue'\r\n");
    script.push_str(&format!(
        "$ProgressLog = {}\r\n",
        ps_quote(&progress_log.to_string_lossy())
    ));
    script.push_str(&format!(
        "$ResultsFile = {}\r\n",
        ps_quote(&results_file.to_string_lossy())
    ));
    script.push_str("$Results = New-Object System.Collections.ArrayList\r\n\r\n");

    script.push_str(
        r#"function Write-BatchLog([string]$Level, [string]$Message) {
    $line = '{0} [{1}] {2}' -f (Get-Date -Format 'yyyy-MM-dd HH:mm:ss'), $Level, $Message
    Add-Content -LiteralPath $ProgressLog -Value $line -Encoding UTF8
}

function Invoke-BatchOperation([string]$Id, [string]$Name, [string]$Program, [string[]]$Arguments) {
    $start = Get-Date
    Write-BatchLog 'Info' "Starting $Name"
    $record = [ordered]@{
        OperationId   = $Id
        OperationName = $Name
        Success       = $false
        Message       = ''
        StartTime     = $start.ToString('o')
        EndTime       = $null
        ExitCode      = $null
        Output        = ''
        Error         = $null
    }
    try {
        $global:LASTEXITCODE = $null
        $output = & $Program @Arguments 2>&1 | Out-String
        $code = if ($null -eq $LASTEXITCODE) { 0 } else { [int]$LASTEXITCODE }
        $record.ExitCode = $code
        $record.Output = $output
        $record.Success = ($code -eq 0)
        if ($record.Success) {
            $record.Message = 'Completed'
            Write-BatchLog 'Success' "$Name completed"
        } else {
            $record.Message = "Exited with code $code"
            Write-BatchLog 'Error' "$Name exited with code $code"
        }
    } catch {
        $record.ExitCode = -1
        $record.Error = $_.Exception.Message
        $record.Message = 'Exception'
        Write-BatchLog 'Error' "$Name threw: $($_.Exception.Message)"
    }
    $record.EndTime = (Get-Date).ToString('o')
    $null = $Results.Add([pscustomobject]$record)
}

"#,
    );

    for op in operations {
        let args: Vec<String> = op.args.iter().map(|a| ps_quote(a)).collect();
        script.push_str(&format!(
            "Invoke-BatchOperation -Id {} -Name {} -Program {} -Arguments @({})\r\n",
            ps_quote(&op.id.to_string()),
            ps_quote(&op.name),
            ps_quote(&op.program.to_string_lossy()),
            args.join(", ")
        ));
    }

    script.push_str(
        "\r\nConvertTo-Json -InputObject @($Results) -Depth 4 | Set-Content -LiteralPath $ResultsFile -Encoding UTF8\r\n",
    );
    script.push_str("Write-BatchLog 'Info' 'Batch finished'\r\n");
    script
}

#[cfg(test)]
pub mod fake {
    //! Launcher and prompt doubles for batch tests.

    use super::*;
    use std::cell::RefCell;

    /// "Runs" the batch by writing results.json next to the script for
    /// each operation id it finds, with exit code 1 when a name matches
    /// one of `failing`. Text registered with `reply` is written to the
    /// path following `--report` in that operation's arguments.
    pub struct ScriptedLauncher {
        pub failing: Vec<String>,
        pub replies: Vec<(String, String)>,
        pub launched: RefCell<Vec<PathBuf>>,
    }

    impl ScriptedLauncher {
        pub fn new(failing: &[&str]) -> Self {
            ScriptedLauncher {
                failing: failing.iter().map(|s| s.to_string()).collect(),
                replies: Vec::new(),
                launched: RefCell::new(Vec::new()),
            }
        }

        pub fn reply(mut self, name: &str, text: &str) -> Self {
            self.replies.push((name.to_string(), text.to_string()));
            self
        }

        /// Contents of the most recently launched script.
        pub fn last_script(&self) -> String {
            self.launched
                .borrow()
                .last()
                .map(|p| fs::read_to_string(p).unwrap_or_default())
                .unwrap_or_default()
        }
    }

    pub struct Finished(pub i32);

    impl ElevatedProcess for Finished {
        fn try_wait(&mut self) -> io::Result<Option<i32>> {
            Ok(Some(self.0))
        }
        fn wait(&mut self) -> io::Result<i32> {
            Ok(self.0)
        }
    }

    /// Pull (id, name) pairs back out of the Invoke-BatchOperation lines.
    pub fn invoked_operations(script: &str) -> Vec<(String, String)> {
        script
            .lines()
            .filter(|l| l.starts_with("Invoke-BatchOperation -Id"))
            .map(|l| {
                let quoted: Vec<&str> = l.split('\'').collect();
                (quoted[1].to_string(), quoted[3].to_string())
            })
            .collect()
    }

    /// Value following `flag` in an operation's argument list.
    pub fn argument_after(script: &str, name: &str, flag: &str) -> Option<String> {
        let line = script
            .lines()
            .filter(|l| l.starts_with("Invoke-BatchOperation -Id"))
            .find(|l| l.split('\'').nth(3) == Some(name))?;
        // quoted values sit at odd positions: id, name, program, then arguments
        let args: Vec<&str> = line.split('\'').skip(7).step_by(2).collect();
        let at = args.iter().position(|a| *a == flag)?;
        args.get(at + 1).map(|a| a.to_string())
    }

    impl ElevatedLauncher for ScriptedLauncher {
        fn launch(&self, script: &Path) -> io::Result<Box<dyn ElevatedProcess>> {
            self.launched.borrow_mut().push(script.to_path_buf());
            let text = fs::read_to_string(script)?;
            for (name, reply) in &self.replies {
                if let Some(path) = argument_after(&text, name, "--report") {
                    fs::write(path, reply)?;
                }
            }
            let results: Vec<OperationResult> = invoked_operations(&text)
                .into_iter()
                .map(|(id, name)| {
                    let failed = self.failing.contains(&name);
                    OperationResult {
                        operation_id: id,
                        operation_name: name,
                        success: !failed,
                        message: None,
                        start_time: Some("2026-10-18T10:00:00.1234567+02:00".to_string()),
                        end_time: Some("2026-10-18T10:00:05.0000000+02:00".to_string()),
                        exit_code: Some(if failed { 1 } else { 0 }),
                        output: Some(String::new()),
                        error: None,
                    }
                })
                .collect();
            let json = serde_json::to_string(&results).map_err(io::Error::other)?;
            fs::write(script.with_file_name(RESULTS_FILE), format!("\u{feff}{json}"))?;
            Ok(Box::new(Finished(0)))
        }
    }

    /// Answers questions from a fixed list, in order; `true` once exhausted.
    pub struct Answers {
        answers: RefCell<Vec<bool>>,
        pub asked: RefCell<Vec<String>>,
    }

    impl Answers {
        pub fn new(answers: &[bool]) -> Self {
            Answers {
                answers: RefCell::new(answers.to_vec()),
                asked: RefCell::new(Vec::new()),
            }
        }
    }

    impl Confirm for Answers {
        fn confirm(&self, question: &str, _default: bool) -> bool {
            self.asked.borrow_mut().push(question.to_string());
            let mut answers = self.answers.borrow_mut();
            if answers.is_empty() {
                true
            } else {
                answers.remove(0)
            }
        }
    }
}
