// ============================================
// winprovision - obs.rs
// ============================================
// OBS Studio portable multi-profile installer.
//
// One OBS download feeds any number of independent portable installs:
//
//   <install_root>/
//   ├── Streaming/
//   │   ├── bin/64bit/obs64.exe
//   │   ├── obs-plugins/ data/ ...        (copied from the shared extraction)
//   │   ├── portable_mode.txt             (makes OBS keep its config here)
//   │   └── installed-plugins.json        (plugin name -> installed version)
//   └── Recording/ ...
//
// The OBS archive is fetched at most once per run, and only when a
// profile has no obs64.exe yet (or --force). Plugins are tracked per
// profile and only downloaded when the resolved version differs from
// the recorded one.
// ============================================

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::download::{copy_dir_all, extract_zip, ScratchDir};
use crate::process::{powershell_command_args, ps_quote, CommandRunner};
use crate::release::{ReleaseInfo, ReleaseSource};
use crate::status::StatusSink;

/// Main executable, relative to a profile directory.
pub const MAIN_EXE: &str = "bin/64bit/obs64.exe";
/// Its presence makes OBS store settings next to the binaries.
pub const PORTABLE_MARKER: &str = "portable_mode.txt";
/// Per-profile plugin metadata.
pub const PLUGIN_RECORDS_FILE: &str = "installed-plugins.json";

/// Version used when a plugin source cannot tell us one.
pub const LATEST: &str = "latest";

const OBSPROJECT_BASE: &str = "https://obsproject.com/forum/resources";

// ============================================
// CONFIGURATION
// ============================================

fn default_repo() -> String {
    "obsproject/obs-studio".to_string()
}

fn default_asset_pattern() -> String {
    "OBS-Studio-*-Windows*.zip".to_string()
}

fn default_true() -> bool {
    true
}

/// The `[obs]` manifest section.
#[derive(Debug, Clone, Deserialize)]
pub struct ObsConfig {
    /// GitHub repository OBS itself is downloaded from
    #[serde(default = "default_repo")]
    pub repo: String,

    #[serde(default = "default_asset_pattern")]
    pub asset_pattern: String,

    /// Parent folder of the profile folders
    pub install_root: PathBuf,

    #[serde(default = "default_true")]
    pub create_shortcuts: bool,

    #[serde(default, rename = "profile")]
    pub profiles: Vec<ObsProfile>,
}

/// One portable OBS install.
#[derive(Debug, Clone, Deserialize)]
pub struct ObsProfile {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Defaults to `<install_root>/<name>`
    #[serde(default)]
    pub directory: Option<PathBuf>,

    #[serde(default, rename = "plugin")]
    pub plugins: Vec<PluginSpec>,
}

/// A plugin entry as written in the manifest.
///
/// Which fields are required depends on `strategy`; the combination is
/// checked when converting to a `DownloadStrategy`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    /// `github`, `direct` or `obsproject`
    pub strategy: String,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default, alias = "filePattern")]
    pub file_pattern: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default, alias = "resourceId")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "fileId")]
    pub file_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ObsError {
    #[error("plugin '{plugin}' is misconfigured: {reason}")]
    InvalidPlugin { plugin: String, reason: String },

    #[error("plugin '{plugin}' could not be downloaded: {reason}")]
    Download { plugin: String, reason: String },

    #[error("plugin '{plugin}' could not be installed: {reason}")]
    Install { plugin: String, reason: String },
}

/// A validated plugin source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// Latest release asset matching a glob
    Github { repo: String, file_pattern: String },
    /// A fixed URL
    Direct {
        url: String,
        filename: Option<String>,
        version: Option<String>,
    },
    /// An obsproject.com forum resource
    ObsProject {
        resource_id: String,
        version: Option<String>,
        file_id: Option<String>,
        filename: Option<String>,
    },
}

impl TryFrom<&PluginSpec> for DownloadStrategy {
    type Error = ObsError;

    fn try_from(spec: &PluginSpec) -> Result<Self, ObsError> {
        let invalid = |reason: &str| ObsError::InvalidPlugin {
            plugin: spec.name.clone(),
            reason: reason.to_string(),
        };
        let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());

        match spec.strategy.to_ascii_lowercase().as_str() {
            "github" => Ok(DownloadStrategy::Github {
                repo: non_empty(&spec.repo).ok_or_else(|| invalid("github strategy needs 'repo'"))?,
                file_pattern: non_empty(&spec.file_pattern)
                    .ok_or_else(|| invalid("github strategy needs 'file_pattern'"))?,
            }),
            "direct" => Ok(DownloadStrategy::Direct {
                url: non_empty(&spec.url).ok_or_else(|| invalid("direct strategy needs 'url'"))?,
                filename: non_empty(&spec.filename),
                version: non_empty(&spec.version),
            }),
            "obsproject" => Ok(DownloadStrategy::ObsProject {
                resource_id: non_empty(&spec.resource_id)
                    .ok_or_else(|| invalid("obsproject strategy needs 'resource_id'"))?,
                version: non_empty(&spec.version),
                file_id: non_empty(&spec.file_id),
                filename: non_empty(&spec.filename),
            }),
            other => Err(invalid(&format!("unknown download strategy '{}'", other))),
        }
    }
}

// ============================================
// PLUGIN RESOLUTION
// ============================================

/// Forum download URL for a resource. A "latest" version leaves the
/// version segment out, which is how the forum serves the newest file.
pub fn obsproject_url(resource_id: &str, version: Option<&str>, file_id: Option<&str>) -> String {
    let mut url = match version.filter(|v| !v.eq_ignore_ascii_case(LATEST)) {
        Some(v) => format!("{}/{}/version/{}/download", OBSPROJECT_BASE, resource_id, v),
        None => format!("{}/{}/download", OBSPROJECT_BASE, resource_id),
    };
    if let Some(file) = file_id {
        url.push_str(&format!("?file={}", file));
    }
    url
}

/// Last path segment of a URL, ignoring any query string.
fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Work out where a plugin comes from and what version that is.
pub fn resolve_plugin(
    name: &str,
    strategy: &DownloadStrategy,
    source: &dyn ReleaseSource,
) -> Result<ReleaseInfo, ObsError> {
    match strategy {
        DownloadStrategy::Github { repo, file_pattern } => source
            .latest_github(repo, file_pattern)
            .map_err(|e| ObsError::Download {
                plugin: name.to_string(),
                reason: format!("{:#}", e),
            }),
        DownloadStrategy::Direct {
            url,
            filename,
            version,
        } => {
            let file_name = filename
                .clone()
                .or_else(|| file_name_from_url(url))
                .unwrap_or_else(|| format!("{}.zip", name));
            Ok(ReleaseInfo {
                url: url.clone(),
                file_name,
                size: source.probe_size(url),
                version: version.clone().unwrap_or_else(|| LATEST.to_string()),
            })
        }
        DownloadStrategy::ObsProject {
            resource_id,
            version,
            file_id,
            filename,
        } => Ok(ReleaseInfo {
            url: obsproject_url(resource_id, version.as_deref(), file_id.as_deref()),
            file_name: filename
                .clone()
                .unwrap_or_else(|| format!("plugin_{}.zip", resource_id)),
            size: 0,
            version: version.clone().unwrap_or_else(|| LATEST.to_string()),
        }),
    }
}

/// Should a plugin be (re)downloaded?
///
/// No record: yes. A "latest" requirement with any record: no, since
/// there is nothing concrete to compare against. Otherwise: when the
/// versions differ.
pub fn needs_update(recorded: Option<&str>, required: &str) -> bool {
    match recorded {
        None => true,
        Some(_) if required == LATEST => false,
        Some(recorded) => recorded != required,
    }
}

// ============================================
// INSTALLED PLUGIN RECORDS
// ============================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub version: String,
}

/// Contents of installed-plugins.json.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecords {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginRecord>,
}

impl PluginRecords {
    /// Load a profile's records. Missing or unreadable metadata is an empty record set.
    pub fn load(profile_dir: &Path) -> Self {
        let path = profile_dir.join(PLUGIN_RECORDS_FILE);
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };
        match serde_json::from_str(content.trim_start_matches('\u{feff}')) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("ignoring corrupt {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&mut self, profile_dir: &Path) -> Result<()> {
        self.last_updated = Some(Utc::now());
        let path = profile_dir.join(PLUGIN_RECORDS_FILE);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize plugin records")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn version_of(&self, plugin: &str) -> Option<&str> {
        self.plugins.get(plugin).map(|r| r.version.as_str())
    }

    pub fn set(&mut self, plugin: &str, version: &str) {
        self.plugins.insert(
            plugin.to_string(),
            PluginRecord {
                version: version.to_string(),
            },
        );
    }
}

// ============================================
// PAYLOAD PLACEMENT
// ============================================

/// Folders a well-formed plugin archive carries.
const PAYLOAD_DIRS: &[&str] = &["obs-plugins", "data"];

/// Extensions placed under data/obs-plugins by the fallback classification.
const DATA_EXTENSIONS: &[&str] = &["json", "effect", "png", "jpg"];

/// Find the folder holding `obs-plugins/` or `data/` (archives often wrap
/// everything in one top-level folder).
fn payload_root(extracted: &Path) -> Option<PathBuf> {
    WalkDir::new(extracted)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .find(|dir| PAYLOAD_DIRS.iter().any(|p| dir.join(p).is_dir()))
}

/// Copy extracted plugin files into a profile. Returns the number of files placed.
pub fn install_payload(extracted: &Path, profile_dir: &Path) -> Result<usize> {
    if let Some(root) = payload_root(extracted) {
        let mut copied = 0;
        for dir in PAYLOAD_DIRS {
            let src = root.join(dir);
            if src.is_dir() {
                copied += copy_dir_all(&src, &profile_dir.join(dir))?;
            }
        }
        return Ok(copied);
    }

    // No standard layout: classify files by extension
    let mut copied = 0;
    for entry in WalkDir::new(extracted).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let target = if ext == "dll" {
            let Some(file_name) = path.file_name() else { continue };
            profile_dir.join("obs-plugins").join("64bit").join(file_name)
        } else if DATA_EXTENSIONS.contains(&ext.as_str()) {
            let relative = path.strip_prefix(extracted)?;
            profile_dir.join("data").join("obs-plugins").join(relative)
        } else {
            continue;
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path, &target)
            .with_context(|| format!("Failed to copy {}", path.display()))?;
        copied += 1;
    }

    if copied == 0 {
        anyhow::bail!("archive contains no recognizable plugin files");
    }
    Ok(copied)
}

/// OBS zips sometimes wrap everything in one folder; return the folder holding `bin/`.
fn obs_content_root(extracted: &Path) -> PathBuf {
    if extracted.join("bin").is_dir() {
        return extracted.to_path_buf();
    }
    WalkDir::new(extracted)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .find(|d| d.join("bin").is_dir())
        .unwrap_or_else(|| extracted.to_path_buf())
}

// ============================================
// INSTALLER
// ============================================

/// Options for one installer run.
#[derive(Debug, Clone, Default)]
pub struct ObsOptions {
    /// Recreate every profile from fresh OBS files
    pub force: bool,
    /// Only these profiles (all when empty)
    pub profiles: Vec<String>,
}

/// What happened to one profile.
#[derive(Debug, Clone, Default)]
pub struct ProfileReport {
    pub name: String,
    pub directory: PathBuf,
    /// OBS base files were (re)copied
    pub fresh: bool,
    pub plugins_installed: Vec<String>,
    pub plugins_current: Vec<String>,
    pub plugins_failed: Vec<String>,
}

/// What happened in one installer run.
#[derive(Debug, Clone, Default)]
pub struct ObsReport {
    /// OBS version downloaded this run, if any
    pub shared_version: Option<String>,
    pub profiles: Vec<ProfileReport>,
    /// (profile, reason)
    pub failed_profiles: Vec<(String, String)>,
}

impl ObsReport {
    pub fn is_success(&self) -> bool {
        self.failed_profiles.is_empty()
    }

    /// True when nothing was downloaded or copied.
    pub fn is_noop(&self) -> bool {
        self.shared_version.is_none()
            && self
                .profiles
                .iter()
                .all(|p| !p.fresh && p.plugins_installed.is_empty())
    }
}

enum PluginOutcome {
    Installed(String),
    Current,
}

/// Installs and updates OBS profiles.
pub struct ObsInstaller<'a> {
    config: &'a ObsConfig,
    install_root: PathBuf,
    scratch_root: PathBuf,
    source: &'a dyn ReleaseSource,
    runner: &'a dyn CommandRunner,
    sink: &'a StatusSink,
}

impl<'a> ObsInstaller<'a> {
    /// `install_root` is the already-resolved `config.install_root`;
    /// downloads and extractions happen in scratch folders under `scratch_root`.
    pub fn new(
        config: &'a ObsConfig,
        install_root: PathBuf,
        scratch_root: PathBuf,
        source: &'a dyn ReleaseSource,
        runner: &'a dyn CommandRunner,
        sink: &'a StatusSink,
    ) -> Self {
        ObsInstaller {
            config,
            install_root,
            scratch_root,
            source,
            runner,
            sink,
        }
    }

    pub fn profile_dir(&self, profile: &ObsProfile) -> PathBuf {
        match &profile.directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.install_root.join(dir),
            None => self.install_root.join(&profile.name),
        }
    }

    fn selected_profiles(&self, wanted: &[String]) -> Vec<&'a ObsProfile> {
        for name in wanted {
            if !self
                .config
                .profiles
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(name))
            {
                self.sink.warning(format!("Unknown OBS profile '{}'", name));
            }
        }
        let config: &'a ObsConfig = self.config;
        config
            .profiles
            .iter()
            .filter(|p| wanted.is_empty() || wanted.iter().any(|w| w.eq_ignore_ascii_case(&p.name)))
            .collect()
    }

    /// Install or update every selected profile.
    pub fn run(&self, options: &ObsOptions) -> Result<ObsReport> {
        let profiles = self.selected_profiles(&options.profiles);
        let mut report = ObsReport::default();
        if profiles.is_empty() {
            self.sink.info("No OBS profiles selected");
            return Ok(report);
        }

        fs::create_dir_all(&self.scratch_root)
            .with_context(|| format!("Failed to create {}", self.scratch_root.display()))?;

        // ============================================
        // STEP 1: Shared OBS files, at most once
        // ============================================
        let needs_base = options.force
            || profiles
                .iter()
                .any(|p| !self.profile_dir(p).join(MAIN_EXE).is_file());

        let mut shared: Option<(ScratchDir, PathBuf)> = None;
        if needs_base {
            match self.fetch_shared() {
                Ok((scratch, root, version)) => {
                    report.shared_version = Some(version);
                    shared = Some((scratch, root));
                }
                Err(e) => self.sink.error(format!("OBS download failed: {:#}", e)),
            }
        }
        let shared_root = shared.as_ref().map(|(_, root)| root.as_path());

        // ============================================
        // STEP 2: Profiles, one at a time
        // ============================================
        for profile in profiles {
            self.sink.header(&format!("OBS profile: {}", profile.name));
            match self.install_profile(profile, shared_root, options.force) {
                Ok(profile_report) => report.profiles.push(profile_report),
                Err(e) => {
                    self.sink
                        .error(format!("Profile '{}' failed: {:#}", profile.name, e));
                    report
                        .failed_profiles
                        .push((profile.name.clone(), format!("{:#}", e)));
                }
            }
        }

        Ok(report)
    }

    fn fetch_shared(&self) -> Result<(ScratchDir, PathBuf, String)> {
        let release = self
            .source
            .latest_github(&self.config.repo, &self.config.asset_pattern)?;
        self.sink.info(format!(
            "Downloading OBS Studio {} ({})",
            release.version,
            crate::download::format_size(release.size)
        ));

        let scratch = ScratchDir::new(&self.scratch_root, "obs-shared")?;
        let archive = scratch.path().join(&release.file_name);
        self.source.download(&release.url, &archive)?;

        let extracted = scratch.path().join("files");
        extract_zip(&archive, &extracted)?;
        let root = obs_content_root(&extracted);
        self.sink.success(format!("OBS Studio {} ready", release.version));
        Ok((scratch, root, release.version))
    }

    /// Create or update one profile.
    pub fn install_profile(
        &self,
        profile: &ObsProfile,
        shared: Option<&Path>,
        force: bool,
    ) -> Result<ProfileReport> {
        let dir = self.profile_dir(profile);
        let exe = dir.join(MAIN_EXE);
        let mut report = ProfileReport {
            name: profile.name.clone(),
            directory: dir.clone(),
            ..Default::default()
        };

        // ============================================
        // STEP 1: Base files
        // ============================================
        if force || !exe.is_file() {
            // Nothing is removed until fresh files are in hand.
            let shared = shared.context("OBS base files are not available")?;
            if dir.exists() {
                tracing::debug!("recreating {}", dir.display());
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to remove {}", dir.display()))?;
            }
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let copied = copy_dir_all(shared, &dir)?;
            fs::write(dir.join(PORTABLE_MARKER), "")
                .with_context(|| format!("Failed to write {}", PORTABLE_MARKER))?;
            self.sink
                .success(format!("Copied {} OBS files to {}", copied, dir.display()));
            report.fresh = true;
        }

        // ============================================
        // STEP 2: Plugins
        // ============================================
        let mut records = PluginRecords::load(&dir);
        for plugin in &profile.plugins {
            match self.install_plugin(plugin, &dir, &mut records) {
                Ok(PluginOutcome::Installed(version)) => {
                    self.sink
                        .success(format!("Installed plugin {} ({})", plugin.name, version));
                    report.plugins_installed.push(plugin.name.clone());
                }
                Ok(PluginOutcome::Current) => {
                    self.sink
                        .info(format!("Plugin {} is up to date", plugin.name));
                    report.plugins_current.push(plugin.name.clone());
                }
                Err(e) => {
                    self.sink.warning(e.to_string());
                    report.plugins_failed.push(plugin.name.clone());
                }
            }
        }
        records.save(&dir)?;

        // ============================================
        // STEP 3: Shortcuts
        // ============================================
        if self.config.create_shortcuts {
            if let Err(e) = self.create_shortcuts(profile, &exe) {
                self.sink.warning(format!(
                    "Could not create shortcuts for {}: {:#}",
                    profile.name, e
                ));
            }
        }

        if !report.plugins_failed.is_empty() {
            self.sink.warning(format!(
                "{} plugin(s) failed in profile {}",
                report.plugins_failed.len(),
                profile.name
            ));
        }
        Ok(report)
    }

    fn install_plugin(
        &self,
        plugin: &PluginSpec,
        profile_dir: &Path,
        records: &mut PluginRecords,
    ) -> Result<PluginOutcome, ObsError> {
        let strategy = DownloadStrategy::try_from(plugin)?;
        let release = resolve_plugin(&plugin.name, &strategy, self.source)?;

        if !needs_update(records.version_of(&plugin.name), &release.version) {
            return Ok(PluginOutcome::Current);
        }

        let install_err = |e: anyhow::Error| ObsError::Install {
            plugin: plugin.name.clone(),
            reason: format!("{:#}", e),
        };

        let scratch = ScratchDir::new(&self.scratch_root, "obs-plugin").map_err(install_err)?;
        let archive = scratch.path().join(&release.file_name);
        self.source
            .download(&release.url, &archive)
            .map_err(|e| ObsError::Download {
                plugin: plugin.name.clone(),
                reason: format!("{:#}", e),
            })?;

        let extracted = scratch.path().join("extracted");
        let is_zip = archive
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if is_zip {
            extract_zip(&archive, &extracted).map_err(install_err)?;
        } else {
            // A bare file (usually a .dll); classify it like an extracted one
            fs::create_dir_all(&extracted)
                .and_then(|_| fs::copy(&archive, extracted.join(&release.file_name)))
                .map_err(|e| install_err(e.into()))?;
        }

        install_payload(&extracted, profile_dir).map_err(install_err)?;
        records.set(&plugin.name, &release.version);
        Ok(PluginOutcome::Installed(release.version))
    }

    fn create_shortcuts(&self, profile: &ObsProfile, exe: &Path) -> Result<()> {
        let working_dir = exe.parent().unwrap_or(exe);
        let link_name = format!("OBS - {}.lnk", profile.name);
        let script = format!(
            "$shell = New-Object -ComObject WScript.Shell; \
             $menu = Join-Path ([Environment]::GetFolderPath('Programs')) 'OBS Profiles'; \
             New-Item -ItemType Directory -Force -Path $menu | Out-Null; \
             foreach ($dir in @([Environment]::GetFolderPath('Desktop'), $menu)) {{ \
             $link = $shell.CreateShortcut((Join-Path $dir {name})); \
             $link.TargetPath = {target}; \
             $link.WorkingDirectory = {workdir}; \
             $link.Description = {description}; \
             $link.Save() }}",
            name = ps_quote(&link_name),
            target = ps_quote(&exe.to_string_lossy()),
            workdir = ps_quote(&working_dir.to_string_lossy()),
            description = ps_quote(&profile.description),
        );

        let output = self
            .runner
            .run("powershell.exe", &powershell_command_args(&script))
            .context("Failed to start PowerShell")?;
        if output.code != Some(0) {
            anyhow::bail!("PowerShell exited with {:?}: {}", output.code, output.combined().trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::testing::write_zip;
    use crate::process::fake::FakeRunner;
    use crate::process::CommandOutput;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Serves releases and archives from a temp folder and counts downloads.
    struct FakeSource {
        releases: RefCell<HashMap<String, (String, PathBuf)>>,
        files: RefCell<HashMap<String, PathBuf>>,
        downloads: RefCell<Vec<String>>,
    }

    impl FakeSource {
        fn new() -> Self {
            FakeSource {
                releases: RefCell::new(HashMap::new()),
                files: RefCell::new(HashMap::new()),
                downloads: RefCell::new(Vec::new()),
            }
        }

        fn release(&self, repo: &str, version: &str, archive: &Path) {
            self.releases
                .borrow_mut()
                .insert(repo.to_string(), (version.to_string(), archive.to_path_buf()));
        }

        fn file(&self, url: &str, path: &Path) {
            self.files
                .borrow_mut()
                .insert(url.to_string(), path.to_path_buf());
        }

        fn downloads_of(&self, needle: &str) -> usize {
            self.downloads
                .borrow()
                .iter()
                .filter(|u| u.contains(needle))
                .count()
        }
    }

    impl ReleaseSource for FakeSource {
        fn latest_github(&self, repo: &str, _pattern: &str) -> Result<ReleaseInfo> {
            let releases = self.releases.borrow();
            let (version, path) = releases
                .get(repo)
                .with_context(|| format!("no release for {repo}"))?;
            let url = format!("https://github.test/{repo}/{version}.zip");
            self.files.borrow_mut().insert(url.clone(), path.clone());
            Ok(ReleaseInfo {
                url,
                file_name: format!("{}.zip", repo.replace('/', "-")),
                size: 1,
                version: version.clone(),
            })
        }

        fn probe_size(&self, _url: &str) -> u64 {
            0
        }

        fn download(&self, url: &str, dest: &Path) -> Result<u64> {
            self.downloads.borrow_mut().push(url.to_string());
            let files = self.files.borrow();
            let src = files.get(url).with_context(|| format!("404 {url}"))?;
            Ok(fs::copy(src, dest)?)
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        scratch: PathBuf,
        source: FakeSource,
        runner: FakeRunner,
        sink: StatusSink,
        config: ObsConfig,
    }

    fn github_plugin(name: &str, repo: &str) -> PluginSpec {
        PluginSpec {
            name: name.to_string(),
            strategy: "github".to_string(),
            repo: Some(repo.to_string()),
            file_pattern: Some("*.zip".to_string()),
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let assets = tmp.path().join("assets");
        fs::create_dir_all(&assets).unwrap();

        let obs_zip = assets.join("obs.zip");
        write_zip(
            &obs_zip,
            &[
                ("bin/64bit/obs64.exe", "obs"),
                ("data/libobs/default.effect", "fx"),
                ("obs-plugins/64bit/obs-x264.dll", "x264"),
            ],
        );
        let shader_zip = assets.join("shader.zip");
        write_zip(
            &shader_zip,
            &[
                ("obs-shaderfilter/obs-plugins/64bit/obs-shaderfilter.dll", "v1"),
                ("obs-shaderfilter/data/obs-plugins/obs-shaderfilter/en-US.ini", "x"),
            ],
        );
        let loose_zip = assets.join("loose.zip");
        write_zip(
            &loose_zip,
            &[
                ("move-transition.dll", "dll"),
                ("effects/move.effect", "fx"),
                ("README.txt", "ignored"),
            ],
        );

        let source = FakeSource::new();
        source.release("obsproject/obs-studio", "31.0.2", &obs_zip);
        source.release("exeldro/obs-shaderfilter", "2.3.0", &shader_zip);
        source.file("https://plugins.test/move-transition.zip", &loose_zip);

        let config = ObsConfig {
            repo: default_repo(),
            asset_pattern: default_asset_pattern(),
            install_root: tmp.path().join("OBS"),
            create_shortcuts: true,
            profiles: vec![
                ObsProfile {
                    name: "Streaming".to_string(),
                    description: "Live streaming".to_string(),
                    directory: None,
                    plugins: vec![
                        github_plugin("shaderfilter", "exeldro/obs-shaderfilter"),
                        PluginSpec {
                            name: "move-transition".to_string(),
                            strategy: "direct".to_string(),
                            url: Some("https://plugins.test/move-transition.zip".to_string()),
                            ..Default::default()
                        },
                    ],
                },
                ObsProfile {
                    name: "Recording".to_string(),
                    description: String::new(),
                    directory: Some(PathBuf::from("Rec")),
                    plugins: vec![github_plugin("shaderfilter", "exeldro/obs-shaderfilter")],
                },
            ],
        };

        Fixture {
            root: tmp.path().join("OBS"),
            scratch: tmp.path().join("scratch"),
            _tmp: tmp,
            source,
            runner: FakeRunner::new(),
            sink: StatusSink::new(true),
            config,
        }
    }

    fn run(f: &Fixture, options: &ObsOptions) -> ObsReport {
        ObsInstaller::new(
            &f.config,
            f.root.clone(),
            f.scratch.clone(),
            &f.source,
            &f.runner,
            &f.sink,
        )
        .run(options)
        .unwrap()
    }

    #[test]
    fn test_needs_update_rules() {
        assert!(needs_update(None, "1.0"));
        assert!(needs_update(None, LATEST));
        assert!(!needs_update(Some("1.0"), "1.0"));
        assert!(needs_update(Some("1.0"), "1.1"));
        assert!(!needs_update(Some("1.0"), LATEST));
        assert!(!needs_update(Some(LATEST), LATEST));
        // a recorded "latest" does not satisfy a concrete requirement
        assert!(needs_update(Some(LATEST), "2.0"));
    }

    #[test]
    fn test_obsproject_url_template() {
        assert_eq!(
            obsproject_url("1105", Some("5915"), Some("110234")),
            "https://obsproject.com/forum/resources/1105/version/5915/download?file=110234"
        );
        assert_eq!(
            obsproject_url("1105", None, None),
            "https://obsproject.com/forum/resources/1105/download"
        );
        assert_eq!(
            obsproject_url("1105", None, Some("7")),
            "https://obsproject.com/forum/resources/1105/download?file=7"
        );
        assert_eq!(
            obsproject_url("1105", Some(LATEST), None),
            "https://obsproject.com/forum/resources/1105/download"
        );
    }

    #[test]
    fn test_obsproject_latest_keeps_record_version() {
        let strategy = DownloadStrategy::ObsProject {
            resource_id: "source-record.1285".into(),
            version: Some(LATEST.into()),
            file_id: None,
            filename: None,
        };
        let info = resolve_plugin("source-record", &strategy, &FakeSource::new()).unwrap();
        assert_eq!(
            info.url,
            "https://obsproject.com/forum/resources/source-record.1285/download"
        );
        assert_eq!(info.version, LATEST);
    }

    #[test]
    fn test_strategy_validation() {
        let missing_repo = PluginSpec {
            name: "x".into(),
            strategy: "github".into(),
            ..Default::default()
        };
        assert!(matches!(
            DownloadStrategy::try_from(&missing_repo),
            Err(ObsError::InvalidPlugin { .. })
        ));

        let unknown = PluginSpec {
            name: "x".into(),
            strategy: "ftp".into(),
            ..Default::default()
        };
        let err = DownloadStrategy::try_from(&unknown).unwrap_err();
        assert!(err.to_string().contains("unknown download strategy 'ftp'"));

        let forum = PluginSpec {
            name: "x".into(),
            strategy: "ObsProject".into(),
            resource_id: Some("42".into()),
            ..Default::default()
        };
        let info = resolve_plugin(
            "x",
            &DownloadStrategy::try_from(&forum).unwrap(),
            &FakeSource::new(),
        )
        .unwrap();
        assert_eq!(info.file_name, "plugin_42.zip");
        assert_eq!(info.version, LATEST);
    }

    #[test]
    fn test_direct_file_name_from_url() {
        let strategy = DownloadStrategy::Direct {
            url: "https://x.test/dl/plugin-1.2.zip?token=abc".into(),
            filename: None,
            version: Some("1.2".into()),
        };
        let info = resolve_plugin("p", &strategy, &FakeSource::new()).unwrap();
        assert_eq!(info.file_name, "plugin-1.2.zip");
        assert_eq!(info.version, "1.2");
        assert_eq!(info.size, 0);
    }

    #[test]
    fn test_records_tolerate_corruption() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PLUGIN_RECORDS_FILE), "{not json").unwrap();
        assert!(PluginRecords::load(dir.path()).plugins.is_empty());

        let mut records = PluginRecords::default();
        records.set("a", "1.0");
        records.save(dir.path()).unwrap();
        let text = fs::read_to_string(dir.path().join(PLUGIN_RECORDS_FILE)).unwrap();
        assert!(text.contains("\"lastUpdated\""));
        assert_eq!(PluginRecords::load(dir.path()).version_of("a"), Some("1.0"));
    }

    #[test]
    fn test_fresh_install_downloads_obs_once() {
        let f = fixture();
        let report = run(&f, &ObsOptions::default());

        assert!(report.is_success());
        assert_eq!(report.shared_version.as_deref(), Some("31.0.2"));
        assert_eq!(f.source.downloads_of("obs-studio"), 1);

        let streaming = f.root.join("Streaming");
        let recording = f.root.join("Rec");
        for dir in [&streaming, &recording] {
            assert!(dir.join(MAIN_EXE).is_file());
            assert!(dir.join(PORTABLE_MARKER).is_file());
            assert!(dir.join("obs-plugins/64bit/obs-shaderfilter.dll").is_file());
            assert!(dir
                .join("data/obs-plugins/obs-shaderfilter/en-US.ini")
                .is_file());
        }

        // fallback classification for the loose archive
        assert!(streaming.join("obs-plugins/64bit/move-transition.dll").is_file());
        assert!(streaming
            .join("data/obs-plugins/effects/move.effect")
            .is_file());
        assert!(!streaming.join("README.txt").exists());

        let records = PluginRecords::load(&streaming);
        assert_eq!(records.version_of("shaderfilter"), Some("2.3.0"));
        assert_eq!(records.version_of("move-transition"), Some(LATEST));

        // two profiles, one powershell call each for shortcuts
        assert_eq!(f.runner.calls_to("powershell.exe").len(), 2);

        // scratch folders cleaned up
        assert_eq!(fs::read_dir(&f.scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_second_run_is_noop() {
        let f = fixture();
        run(&f, &ObsOptions::default());
        let before = f.source.downloads.borrow().len();

        let report = run(&f, &ObsOptions::default());
        assert!(report.is_noop());
        assert_eq!(f.source.downloads.borrow().len(), before);
        assert_eq!(report.profiles[0].plugins_current.len(), 2);
    }

    #[test]
    fn test_new_release_triggers_one_redownload() {
        let f = fixture();
        let options = ObsOptions {
            profiles: vec!["streaming".to_string()],
            ..Default::default()
        };
        run(&f, &options);
        assert_eq!(f.source.downloads_of("obs-shaderfilter"), 1);

        let v2 = f._tmp.path().join("assets/shader2.zip");
        write_zip(&v2, &[("obs-plugins/64bit/obs-shaderfilter.dll", "v2")]);
        f.source.release("exeldro/obs-shaderfilter", "2.4.0", &v2);

        let report = run(&f, &options);
        assert_eq!(report.profiles[0].plugins_installed, vec!["shaderfilter"]);
        assert_eq!(f.source.downloads_of("obs-shaderfilter"), 2);
        assert_eq!(f.source.downloads_of("obs-studio"), 1);

        let dir = f.root.join("Streaming");
        assert_eq!(
            fs::read_to_string(dir.join("obs-plugins/64bit/obs-shaderfilter.dll")).unwrap(),
            "v2"
        );
        assert_eq!(PluginRecords::load(&dir).version_of("shaderfilter"), Some("2.4.0"));

        run(&f, &options);
        assert_eq!(f.source.downloads_of("obs-shaderfilter"), 2);
    }

    #[test]
    fn test_missing_exe_recreates_profile() {
        let f = fixture();
        run(&f, &ObsOptions::default());

        let streaming = f.root.join("Streaming");
        fs::write(streaming.join("stale.txt"), "x").unwrap();
        fs::remove_file(streaming.join(MAIN_EXE)).unwrap();

        let report = run(&f, &ObsOptions::default());
        assert_eq!(f.source.downloads_of("obs-studio"), 2);
        assert!(streaming.join(MAIN_EXE).is_file());
        assert!(!streaming.join("stale.txt").exists());

        let fresh: Vec<bool> = report.profiles.iter().map(|p| p.fresh).collect();
        assert_eq!(fresh, vec![true, false]);
    }

    #[test]
    fn test_bad_plugin_does_not_fail_profile() {
        let mut f = fixture();
        f.config.profiles[1].plugins.push(PluginSpec {
            name: "broken".into(),
            strategy: "carrier-pigeon".into(),
            ..Default::default()
        });
        f.config.profiles[1].plugins.push(github_plugin("gone", "nobody/nothing"));

        let report = run(&f, &ObsOptions::default());
        assert!(report.is_success());
        let recording = &report.profiles[1];
        assert_eq!(recording.plugins_failed, vec!["broken", "gone"]);
        assert_eq!(recording.plugins_installed, vec!["shaderfilter"]);
    }

    #[test]
    fn test_shortcut_failure_is_warning() {
        let f = fixture();
        f.runner.respond(
            "powershell.exe -NoProfile",
            CommandOutput::with_code(1).with_stdout("COM error"),
        );
        let report = run(&f, &ObsOptions::default());
        assert!(report.is_success());
        assert!(f
            .sink
            .history()
            .iter()
            .any(|(_, m)| m.contains("Could not create shortcuts")));
    }

    #[test]
    fn test_download_failure_fails_only_new_profiles() {
        let f = fixture();
        f.source.releases.borrow_mut().remove("obsproject/obs-studio");
        let report = run(&f, &ObsOptions::default());
        assert_eq!(report.failed_profiles.len(), 2);
        assert!(report.failed_profiles[0].1.contains("not available"));
    }

    #[test]
    fn test_forced_run_without_obs_files_keeps_profiles() {
        let f = fixture();
        run(&f, &ObsOptions::default());

        let streaming = f.root.join("Streaming");
        fs::write(streaming.join("basic.ini"), "[General]\nName=Streaming").unwrap();
        f.source.releases.borrow_mut().remove("obsproject/obs-studio");

        let report = run(
            &f,
            &ObsOptions {
                force: true,
                ..Default::default()
            },
        );
        assert_eq!(report.failed_profiles.len(), 2);
        assert!(report.failed_profiles[0].1.contains("not available"));
        assert!(streaming.join(MAIN_EXE).is_file());
        assert_eq!(
            fs::read_to_string(streaming.join("basic.ini")).unwrap(),
            "[General]\nName=Streaming"
        );
        assert!(f.root.join("Rec").join(MAIN_EXE).is_file());
    }
}
