// ============================================
// winprovision - target.rs
// ============================================
// Where config files go.
//
// The environment is captured once (EnvSnapshot::capture) and every
// target is then a pure function of that snapshot. "No target" is a
// normal answer: no Firefox profile simply means nothing to deploy.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Known folders and discovered app profiles at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    pub home: Option<PathBuf>,
    pub documents: Option<PathBuf>,
    /// %APPDATA% (roaming)
    pub app_data: Option<PathBuf>,
    /// %LOCALAPPDATA%
    pub local_app_data: Option<PathBuf>,
    /// Base directory for portable tools
    pub tools_dir: PathBuf,
    /// Firefox profile directories, sorted by name
    pub firefox_profiles: Vec<PathBuf>,
}

impl EnvSnapshot {
    /// Read known folders from the running system.
    pub fn capture(tools_dir: PathBuf) -> Self {
        let app_data = dirs::config_dir();
        let firefox_profiles = app_data
            .as_deref()
            .map(|roaming| list_firefox_profiles(&roaming.join("Mozilla").join("Firefox").join("Profiles")))
            .unwrap_or_default();

        EnvSnapshot {
            home: dirs::home_dir(),
            documents: dirs::document_dir(),
            app_data,
            local_app_data: dirs::data_local_dir(),
            tools_dir,
            firefox_profiles,
        }
    }
}

/// Default tools directory: a machine-wide folder when elevated, per-user otherwise.
pub fn default_tools_dir(elevated: bool) -> PathBuf {
    if elevated {
        return PathBuf::from(r"C:\Tools");
    }
    dirs::data_local_dir()
        .map(|d| d.join("Tools"))
        .unwrap_or_else(|| PathBuf::from("Tools"))
}

fn list_firefox_profiles(profiles_root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(profiles_root) else {
        return Vec::new();
    };

    let mut profiles: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    profiles.sort();
    profiles
}

/// Pick the Firefox profile to customize.
///
/// Prefers `*.default-release`, then `*.default`, then the first profile.
pub fn select_firefox_profile(profiles: &[PathBuf]) -> Option<&PathBuf> {
    let name_ends_with = |suffix: &str| {
        profiles.iter().find(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().ends_with(suffix))
                .unwrap_or(false)
        })
    };

    name_ends_with(".default-release")
        .or_else(|| name_ends_with(".default"))
        .or_else(|| profiles.first())
}

/// How a unit's target directory is found.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TargetSpec {
    Static { path: PathBuf },
    Home {
        #[serde(default)]
        subdir: PathBuf,
    },
    Documents {
        #[serde(default)]
        subdir: PathBuf,
    },
    AppData {
        #[serde(default)]
        subdir: PathBuf,
    },
    LocalAppData {
        #[serde(default)]
        subdir: PathBuf,
    },
    Tools {
        #[serde(default)]
        subdir: PathBuf,
    },
    /// `<firefox profile>/chrome`
    FirefoxChrome,
}

impl TargetSpec {
    /// Resolve against a snapshot. `None` means the prerequisite app or folder is absent.
    pub fn resolve(&self, env: &EnvSnapshot) -> Option<PathBuf> {
        let join = |base: Option<&PathBuf>, subdir: &Path| base.map(|b| b.join(subdir));

        match self {
            TargetSpec::Static { path } => Some(path.clone()),
            TargetSpec::Home { subdir } => join(env.home.as_ref(), subdir.as_path()),
            TargetSpec::Documents { subdir } => join(env.documents.as_ref(), subdir.as_path()),
            TargetSpec::AppData { subdir } => join(env.app_data.as_ref(), subdir.as_path()),
            TargetSpec::LocalAppData { subdir } => join(env.local_app_data.as_ref(), subdir.as_path()),
            TargetSpec::Tools { subdir } => Some(env.tools_dir.join(subdir)),
            TargetSpec::FirefoxChrome => {
                select_firefox_profile(&env.firefox_profiles).map(|p| p.join("chrome"))
            }
        }
    }

    /// Short description for skip messages.
    pub fn describe(&self) -> String {
        match self {
            TargetSpec::Static { path } => path.display().to_string(),
            TargetSpec::Home { .. } => "home folder".to_string(),
            TargetSpec::Documents { .. } => "Documents folder".to_string(),
            TargetSpec::AppData { .. } => "roaming AppData".to_string(),
            TargetSpec::LocalAppData { .. } => "local AppData".to_string(),
            TargetSpec::Tools { .. } => "tools directory".to_string(),
            TargetSpec::FirefoxChrome => "Firefox profile".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> EnvSnapshot {
        EnvSnapshot {
            home: Some(PathBuf::from("/home/u")),
            documents: Some(PathBuf::from("/home/u/Documents")),
            app_data: None,
            local_app_data: Some(PathBuf::from("/home/u/AppData/Local")),
            tools_dir: PathBuf::from("/tools"),
            firefox_profiles: vec![],
        }
    }

    #[test]
    fn test_firefox_prefers_default_release() {
        let profiles = vec![
            PathBuf::from("/p/abc.default"),
            PathBuf::from("/p/xyz.default-release"),
            PathBuf::from("/p/zzz.dev-edition-default"),
        ];
        assert_eq!(
            select_firefox_profile(&profiles),
            Some(&PathBuf::from("/p/xyz.default-release"))
        );

        let profiles = vec![PathBuf::from("/p/a.work"), PathBuf::from("/p/b.default")];
        assert_eq!(select_firefox_profile(&profiles), Some(&PathBuf::from("/p/b.default")));

        let profiles = vec![PathBuf::from("/p/a.work")];
        assert_eq!(select_firefox_profile(&profiles), Some(&PathBuf::from("/p/a.work")));
    }

    #[test]
    fn test_firefox_absent_is_none() {
        assert_eq!(TargetSpec::FirefoxChrome.resolve(&snapshot()), None);

        let mut env = snapshot();
        env.firefox_profiles = vec![PathBuf::from("/p/q.default-release")];
        assert_eq!(
            TargetSpec::FirefoxChrome.resolve(&env),
            Some(PathBuf::from("/p/q.default-release/chrome"))
        );
    }

    #[test]
    fn test_known_folder_targets() {
        let env = snapshot();
        let docs = TargetSpec::Documents {
            subdir: PathBuf::from("PowerShell"),
        };
        assert_eq!(docs.resolve(&env), Some(PathBuf::from("/home/u/Documents/PowerShell")));

        let roaming = TargetSpec::AppData {
            subdir: PathBuf::from("x"),
        };
        assert_eq!(roaming.resolve(&env), None);

        let tools = TargetSpec::Tools {
            subdir: PathBuf::from("bin"),
        };
        assert_eq!(tools.resolve(&env), Some(PathBuf::from("/tools/bin")));
    }

    #[test]
    fn test_target_spec_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            target: TargetSpec,
        }
        let w: Wrapper = toml::from_str("target = { kind = \"firefox-chrome\" }").unwrap();
        assert_eq!(w.target, TargetSpec::FirefoxChrome);

        let w: Wrapper =
            toml::from_str("target = { kind = \"documents\", subdir = \"PowerShell\" }").unwrap();
        assert_eq!(
            w.target,
            TargetSpec::Documents {
                subdir: PathBuf::from("PowerShell")
            }
        );
    }
}
