// ============================================
// winprovision - manifest.rs
// ============================================
// The deployment manifest (winprovision.toml).
//
// One TOML document holds everything a run needs:
//
//   [settings]        tools dir, backup naming, batch options
//   [[unit]]          the deployment table, run in priority order
//   [obs]             OBS portable profiles and their plugins
//
// Lookup order: --config, next to the EXE, current directory, and
// finally the copy embedded in the binary. Relative paths inside a
// manifest are relative to the manifest's own folder.
// ============================================

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::backup::{BackupMode, BackupPolicy};
use crate::installers::PackageManager;
use crate::obs::ObsConfig;
use crate::platform::app_directory;
use crate::session::CompensatingAction;
use crate::target::TargetSpec;

/// Manifest file name looked up next to the EXE and in the current directory.
pub const MANIFEST_FILE: &str = "winprovision.toml";

/// Manifest compiled into the binary, used when no file is found.
pub const DEFAULT_MANIFEST: &str = include_str!("../assets/default.toml");

// ============================================
// DATA STRUCTURES
// ============================================

/// Global options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base folder for portable tools; chosen from elevation when unset
    pub tools_dir: Option<PathBuf>,
    pub backup_mode: BackupMode,
    pub backup_extension: String,
    /// Environment variable holding a GitHub token
    pub github_token_env: String,
    pub batch_timeout_minutes: u64,
    pub show_progress: bool,
    pub keep_session_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            tools_dir: None,
            backup_mode: BackupMode::Timestamped,
            backup_extension: ".bak".to_string(),
            github_token_env: "GITHUB_TOKEN".to_string(),
            batch_timeout_minutes: 30,
            show_progress: true,
            keep_session_logs: false,
        }
    }
}

impl Settings {
    pub fn backup_policy(&self) -> BackupPolicy {
        BackupPolicy {
            mode: self.backup_mode,
            extension: self.backup_extension.clone(),
        }
    }
}

/// What applying a unit actually does.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UnitAction {
    /// Copy every file in `source_dir` matching `pattern` into the target folder
    Copy {
        source_dir: PathBuf,
        #[serde(default = "default_pattern")]
        pattern: String,
        target: TargetSpec,
    },
    /// Run a PowerShell script
    Script {
        path: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Install packages through one package manager
    Packages {
        manager: PackageManager,
        packages: Vec<String>,
    },
    /// Enable Windows optional features
    Features { features: Vec<String> },
    /// Run a program; exit code 0 is success
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Install OBS portable profiles (all of them when `profiles` is empty)
    Obs {
        #[serde(default)]
        profiles: Vec<String>,
    },
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_priority() -> i32 {
    50
}

/// One row of the deployment table.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitSpec {
    pub name: String,

    /// Lower runs first
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Task groups this unit belongs to (selected with --tags)
    #[serde(default)]
    pub tags: Vec<String>,

    /// Skip the version comparison and always apply
    #[serde(default)]
    pub always_apply: bool,

    #[serde(default)]
    pub requires_elevation: bool,

    /// Needs PowerShell 7+
    #[serde(default)]
    pub requires_minimum_runtime: bool,

    /// Shown in the summary after the unit applied
    #[serde(default)]
    pub instructions: Option<String>,

    /// Declared compensating action
    #[serde(default)]
    pub rollback: Option<CompensatingAction>,

    /// The rollback itself needs administrator rights
    #[serde(default)]
    pub rollback_requires_elevation: bool,

    pub action: UnitAction,
}

impl UnitSpec {
    /// True when the unit is selected by `tags` (an empty filter selects everything).
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        tags.is_empty()
            || tags
                .iter()
                .any(|t| self.tags.iter().any(|own| own.eq_ignore_ascii_case(t)))
    }
}

/// A loaded manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct SetupManifest {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default, rename = "unit")]
    pub units: Vec<UnitSpec>,

    #[serde(default)]
    pub obs: Option<ObsConfig>,

    /// Folder relative paths resolve against (not from TOML)
    #[serde(skip)]
    pub base_dir: PathBuf,

    /// File this manifest was read from; `None` for the embedded default
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

// ============================================
// LOADING
// ============================================

impl SetupManifest {
    /// Parse manifest text. Relative paths will resolve against `base_dir`.
    pub fn parse(content: &str, base_dir: &Path) -> Result<Self> {
        let mut manifest: SetupManifest =
            toml::from_str(content).context("Failed to parse manifest")?;
        manifest.base_dir = base_dir.to_path_buf();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut manifest = Self::parse(&content, &base_dir)
            .with_context(|| format!("Invalid manifest {}", path.display()))?;
        manifest.source = Some(path.to_path_buf());
        Ok(manifest)
    }

    /// The embedded default, with paths relative to the EXE folder.
    pub fn embedded() -> Result<Self> {
        Self::parse(DEFAULT_MANIFEST, &app_directory())
    }

    /// Load following the lookup order. An explicit path must exist.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        match locate(&app_directory(), &std::env::current_dir().unwrap_or_default()) {
            Some(path) => {
                tracing::debug!("using manifest {}", path.display());
                Self::load(&path)
            }
            None => {
                tracing::debug!("no {} found, using embedded default", MANIFEST_FILE);
                Self::embedded()
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for unit in &self.units {
            if unit.name.trim().is_empty() {
                bail!("A unit has an empty name");
            }
            if !seen.insert(unit.name.to_lowercase()) {
                bail!("Duplicate unit name '{}'", unit.name);
            }
        }
        Ok(())
    }

    /// Make a manifest-relative path absolute.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Units in execution order: priority, then name.
    pub fn ordered_units(&self) -> Vec<&UnitSpec> {
        let mut units: Vec<&UnitSpec> = self.units.iter().collect();
        units.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        units
    }

    pub fn unit(&self, name: &str) -> Option<&UnitSpec> {
        self.units.iter().find(|u| u.name.eq_ignore_ascii_case(name))
    }
}

/// First manifest found next to the EXE, then in `cwd`.
pub fn locate(app_dir: &Path, cwd: &Path) -> Option<PathBuf> {
    [app_dir.join(MANIFEST_FILE), cwd.join(MANIFEST_FILE)]
        .into_iter()
        .find(|p| p.is_file())
}

/// Write the embedded default manifest to `output`.
pub fn write_default(output: &Path, overwrite: bool) -> Result<()> {
    if output.exists() && !overwrite {
        bail!(
            "{} already exists (use --overwrite to replace it)",
            output.display()
        );
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(output, DEFAULT_MANIFEST)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let manifest = SetupManifest::parse(DEFAULT_MANIFEST, Path::new("/app")).unwrap();
        assert!(!manifest.units.is_empty());

        let priorities: Vec<i32> = manifest.ordered_units().iter().map(|u| u.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);

        let obs = manifest.obs.as_ref().unwrap();
        assert!(!obs.profiles.is_empty());
        assert!(manifest.unit("firefox-userchrome").is_some());
    }

    #[test]
    fn test_unit_defaults_and_actions() {
        let manifest = SetupManifest::parse(
            r#"
[settings]
backup_mode = "fixed"

[[unit]]
name = "profile"
action = { kind = "copy", source_dir = "config/powershell", target = { kind = "documents", subdir = "PowerShell" } }

[[unit]]
name = "wsl"
priority = 20
tags = ["features"]
requires_elevation = true
rollback = { kind = "manual-instruction", text = "Disable WSL in Windows Features" }
action = { kind = "features", features = ["Microsoft-Windows-Subsystem-Linux"] }

[[unit]]
name = "apps"
priority = 31
action = { kind = "packages", manager = "choco", packages = ["git", "7zip"] }
"#,
            Path::new("/base"),
        )
        .unwrap();

        assert_eq!(manifest.settings.backup_policy().mode, BackupMode::Fixed);
        assert_eq!(manifest.settings.batch_timeout_minutes, 30);
        assert_eq!(manifest.settings.github_token_env, "GITHUB_TOKEN");

        let profile = manifest.unit("profile").unwrap();
        assert_eq!(profile.priority, 50);
        match &profile.action {
            UnitAction::Copy { pattern, .. } => assert_eq!(pattern, "*"),
            other => panic!("unexpected action {:?}", other),
        }

        let wsl = manifest.unit("WSL").unwrap();
        assert!(wsl.requires_elevation);
        assert!(matches!(
            wsl.rollback,
            Some(CompensatingAction::ManualInstruction { .. })
        ));

        let apps = manifest.unit("apps").unwrap();
        assert!(matches!(
            apps.action,
            UnitAction::Packages {
                manager: PackageManager::Chocolatey,
                ..
            }
        ));

        let order: Vec<&str> = manifest.ordered_units().iter().map(|u| u.name.as_str()).collect();
        assert_eq!(order, vec!["wsl", "apps", "profile"]);
        assert!(manifest.obs.is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let text = r#"
[[unit]]
name = "a"
action = { kind = "command", program = "x" }
[[unit]]
name = "A"
action = { kind = "command", program = "y" }
"#;
        assert!(SetupManifest::parse(text, Path::new(".")).is_err());
    }

    #[test]
    fn test_tag_filter() {
        let manifest = SetupManifest::parse(
            r#"
[[unit]]
name = "power"
tags = ["power", "config"]
action = { kind = "command", program = "powercfg" }
"#,
            Path::new("."),
        )
        .unwrap();
        let unit = manifest.unit("power").unwrap();
        assert!(unit.matches_tags(&[]));
        assert!(unit.matches_tags(&["Power".to_string()]));
        assert!(!unit.matches_tags(&["obs".to_string()]));
    }

    #[test]
    fn test_load_resolves_relative_to_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        fs::write(
            &path,
            "[[unit]]\nname = \"s\"\naction = { kind = \"script\", path = \"scripts/setup.ps1\" }\n",
        )
        .unwrap();

        let manifest = SetupManifest::load(&path).unwrap();
        assert_eq!(manifest.source.as_deref(), Some(path.as_path()));
        assert_eq!(
            manifest.resolve_path(Path::new("scripts/setup.ps1")),
            dir.path().join("scripts/setup.ps1")
        );
        assert_eq!(locate(dir.path(), Path::new("/nonexistent")), Some(path));
    }

    #[test]
    fn test_write_default_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested").join(MANIFEST_FILE);
        write_default(&out, false).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), DEFAULT_MANIFEST);
        assert!(write_default(&out, false).is_err());
        write_default(&out, true).unwrap();
    }
}
