// ============================================
// winprovision - installers.rs
// ============================================
// Uniform wrappers around winget, Chocolatey, Scoop and DISM features.
//
// Each adapter knows three things:
//   1. how to ask whether a package/feature is already there
//   2. how to install it
//   3. what its exit codes mean (an explicit table, see EXIT_CODES below)
//
// "Already installed" is success. A failing package is reported and the
// next package is attempted.
// ============================================

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::process::{powershell_command_args, CommandOutput, CommandRunner};
use crate::status::StatusSink;

// ============================================
// TYPES
// ============================================

/// A package source the orchestrator can install from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Winget,
    #[serde(alias = "choco")]
    Chocolatey,
    Scoop,
    /// Windows optional features through DISM
    Feature,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Winget => write!(f, "winget"),
            PackageManager::Chocolatey => write!(f, "chocolatey"),
            PackageManager::Scoop => write!(f, "scoop"),
            PackageManager::Feature => write!(f, "windows feature"),
        }
    }
}

/// What an exit code means for a given adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitMeaning {
    Success,
    AlreadyPresent,
    RebootRequired,
}

/// Result of one install attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyPresent,
    RebootRequired,
    Failed(String),
}

impl InstallOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, InstallOutcome::Failed(_))
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    /// The package manager is missing and could not be bootstrapped
    #[error("{manager} is not available: {reason}")]
    PrerequisiteMissing {
        manager: PackageManager,
        reason: String,
    },
}

/// Per-package result of `install_all`.
#[derive(Debug, Clone)]
pub struct PackageResult {
    pub package: String,
    pub outcome: InstallOutcome,
}

// ============================================
// EXIT CODE TABLES
// ============================================

/// APPINSTALLER_CLI_ERROR_PACKAGE_ALREADY_INSTALLED (0x8A150061)
const WINGET_ALREADY_INSTALLED: i32 = 0x8A15_0061_u32 as i32;
/// APPINSTALLER_CLI_ERROR_UPDATE_NOT_APPLICABLE (0x8A15002B)
const WINGET_NO_APPLICABLE_UPGRADE: i32 = 0x8A15_002B_u32 as i32;

const WINGET_CODES: &[(i32, ExitMeaning)] = &[
    (0, ExitMeaning::Success),
    (WINGET_ALREADY_INSTALLED, ExitMeaning::AlreadyPresent),
    (WINGET_NO_APPLICABLE_UPGRADE, ExitMeaning::AlreadyPresent),
];

const CHOCO_CODES: &[(i32, ExitMeaning)] = &[
    (0, ExitMeaning::Success),
    (1641, ExitMeaning::RebootRequired),
    (3010, ExitMeaning::RebootRequired),
];

const SCOOP_CODES: &[(i32, ExitMeaning)] = &[(0, ExitMeaning::Success)];

const DISM_CODES: &[(i32, ExitMeaning)] = &[
    (0, ExitMeaning::Success),
    (3010, ExitMeaning::RebootRequired),
];

/// Output fragments that mean "nothing to do".
const ALREADY_INSTALLED_SENTINELS: &[&str] = &[
    "already installed",
    "is already installed",
    "no newer package versions are available",
];

// ============================================
// ADAPTERS
// ============================================

/// Static description of one package manager.
#[derive(Debug)]
pub struct Adapter {
    pub manager: PackageManager,
    /// Program name resolved on PATH
    pub program: &'static str,
    exit_codes: &'static [(i32, ExitMeaning)],
}

pub const WINGET: Adapter = Adapter {
    manager: PackageManager::Winget,
    program: "winget",
    exit_codes: WINGET_CODES,
};

pub const CHOCOLATEY: Adapter = Adapter {
    manager: PackageManager::Chocolatey,
    program: "choco",
    exit_codes: CHOCO_CODES,
};

pub const SCOOP: Adapter = Adapter {
    manager: PackageManager::Scoop,
    program: "scoop",
    exit_codes: SCOOP_CODES,
};

pub const FEATURE: Adapter = Adapter {
    manager: PackageManager::Feature,
    program: "dism",
    exit_codes: DISM_CODES,
};

/// Look up the adapter for a package manager.
pub fn adapter_for(manager: PackageManager) -> &'static Adapter {
    match manager {
        PackageManager::Winget => &WINGET,
        PackageManager::Chocolatey => &CHOCOLATEY,
        PackageManager::Scoop => &SCOOP,
        PackageManager::Feature => &FEATURE,
    }
}

impl Adapter {
    /// Arguments that install `id`.
    pub fn install_args(&self, id: &str) -> Vec<String> {
        let args: Vec<&str> = match self.manager {
            PackageManager::Winget => vec![
                "install",
                "--id",
                id,
                "--exact",
                "--silent",
                "--accept-package-agreements",
                "--accept-source-agreements",
            ],
            PackageManager::Chocolatey => vec!["install", id, "-y", "--no-progress"],
            PackageManager::Scoop => vec!["install", id],
            PackageManager::Feature => {
                return vec![
                    "/online".to_string(),
                    "/enable-feature".to_string(),
                    format!("/featurename:{id}"),
                    "/all".to_string(),
                    "/norestart".to_string(),
                ]
            }
        };
        args.into_iter().map(String::from).collect()
    }

    /// Arguments that query whether `id` is present.
    fn query_args(&self, id: &str) -> Vec<String> {
        let args: Vec<&str> = match self.manager {
            PackageManager::Winget => vec!["list", "--id", id, "--exact"],
            PackageManager::Chocolatey => vec!["list", "--exact", id, "--limit-output"],
            PackageManager::Scoop => vec!["list", id],
            PackageManager::Feature => {
                return vec![
                    "/online".to_string(),
                    "/get-featureinfo".to_string(),
                    format!("/featurename:{id}"),
                ]
            }
        };
        args.into_iter().map(String::from).collect()
    }

    /// Interpret a finished install command.
    pub fn interpret(&self, output: &CommandOutput) -> InstallOutcome {
        let Some(code) = output.code else {
            return InstallOutcome::Failed("process terminated without an exit code".to_string());
        };

        let meaning = self
            .exit_codes
            .iter()
            .find(|(known, _)| *known == code)
            .map(|(_, meaning)| *meaning);

        let text = output.combined().to_lowercase();
        let sentinel = ALREADY_INSTALLED_SENTINELS.iter().any(|s| text.contains(s));

        match meaning {
            Some(ExitMeaning::AlreadyPresent) => InstallOutcome::AlreadyPresent,
            Some(ExitMeaning::RebootRequired) => InstallOutcome::RebootRequired,
            Some(ExitMeaning::Success) if sentinel => InstallOutcome::AlreadyPresent,
            Some(ExitMeaning::Success) => InstallOutcome::Installed,
            None => {
                let tail = last_line(&output.combined());
                InstallOutcome::Failed(format!("exit code {code} (0x{:X}): {tail}", code as u32))
            }
        }
    }

    /// Is `id` already installed / enabled?
    pub fn is_present(&self, runner: &dyn CommandRunner, id: &str) -> bool {
        let output = match runner.run(self.program, &self.query_args(id)) {
            Ok(o) => o,
            Err(e) => {
                tracing::debug!("{} query for {id} failed: {e}", self.program);
                return false;
            }
        };

        let text = output.stdout.to_lowercase();
        let id_lower = id.to_lowercase();
        match self.manager {
            // winget exits non-zero when nothing matches
            PackageManager::Winget => output.code == Some(0) && text.contains(&id_lower),
            // choco --limit-output prints "name|version"
            PackageManager::Chocolatey => text
                .lines()
                .any(|line| line.split('|').next() == Some(id_lower.as_str())),
            PackageManager::Scoop => text
                .lines()
                .any(|line| line.split_whitespace().next() == Some(id_lower.as_str())),
            PackageManager::Feature => text
                .lines()
                .any(|line| line.starts_with("state") && line.trim_end().ends_with(": enabled")),
        }
    }

    /// Check for an already-present package, otherwise install it.
    pub fn install(&self, runner: &dyn CommandRunner, id: &str) -> InstallOutcome {
        if self.is_present(runner, id) {
            return InstallOutcome::AlreadyPresent;
        }

        match runner.run(self.program, &self.install_args(id)) {
            Ok(output) => self.interpret(&output),
            Err(e) => InstallOutcome::Failed(format!("failed to run {}: {e}", self.program)),
        }
    }

    /// Make sure the package manager itself exists, bootstrapping it if possible.
    pub fn ensure_available(
        &self,
        runner: &dyn CommandRunner,
        elevated: bool,
        sink: &StatusSink,
    ) -> Result<(), InstallError> {
        if runner.locate(self.program).is_some() {
            return Ok(());
        }

        let Some(script) = bootstrap_script(self.manager, elevated) else {
            return Err(InstallError::PrerequisiteMissing {
                manager: self.manager,
                reason: format!("{} was not found on PATH", self.program),
            });
        };

        sink.info(format!("{} not found, installing it...", self.manager));
        let result = runner.run("powershell.exe", &powershell_command_args(script));
        let bootstrapped = matches!(&result, Ok(o) if o.code == Some(0));

        if bootstrapped && runner.locate(self.program).is_some() {
            sink.success(format!("{} installed", self.manager));
            return Ok(());
        }

        let reason = match result {
            Ok(o) => format!("bootstrap exited with {:?}: {}", o.code, last_line(&o.combined())),
            Err(e) => format!("bootstrap could not start: {e}"),
        };
        Err(InstallError::PrerequisiteMissing {
            manager: self.manager,
            reason,
        })
    }

    /// Install every package in order, continuing past failures.
    pub fn install_all(
        &self,
        runner: &dyn CommandRunner,
        packages: &[String],
        sink: &StatusSink,
    ) -> Vec<PackageResult> {
        let total = packages.len();
        let mut results = Vec::with_capacity(total);

        for (index, package) in packages.iter().enumerate() {
            sink.info(format!("[{}/{}] {} {}", index + 1, total, self.manager, package));
            let outcome = self.install(runner, package);

            match &outcome {
                InstallOutcome::Installed => sink.success(format!("Installed {package}")),
                InstallOutcome::AlreadyPresent => {
                    sink.info(format!("{package} is already installed"))
                }
                InstallOutcome::RebootRequired => {
                    sink.warning(format!("Installed {package} (restart required)"))
                }
                InstallOutcome::Failed(reason) => {
                    sink.error(format!("Failed to install {package}: {reason}"))
                }
            }

            results.push(PackageResult {
                package: package.clone(),
                outcome,
            });
        }

        let ok = results.iter().filter(|r| r.outcome.is_success()).count();
        tracing::info!("{}: {} of {} succeeded", self.manager, ok, total);
        results
    }
}

/// PowerShell one-liners that install a missing package manager.
fn bootstrap_script(manager: PackageManager, elevated: bool) -> Option<&'static str> {
    match manager {
        PackageManager::Chocolatey => Some(
            "Set-ExecutionPolicy Bypass -Scope Process -Force; \
             [System.Net.ServicePointManager]::SecurityProtocol = \
             [System.Net.ServicePointManager]::SecurityProtocol -bor 3072; \
             iex ((New-Object System.Net.WebClient).DownloadString('https://community.chocolatey.org/install.ps1'))",
        ),
        PackageManager::Scoop if elevated => {
            Some("iex \"& {$(irm get.scoop.sh)} -RunAsAdmin\"")
        }
        PackageManager::Scoop => Some("irm get.scoop.sh | iex"),
        PackageManager::Winget | PackageManager::Feature => None,
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}
