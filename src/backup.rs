// ============================================
// winprovision - backup.rs
// ============================================
// Copy a file aside before we overwrite it.
//
//   profile.ps1  ->  profile.ps1.20261018-140211.bak   (timestamped)
//   profile.ps1  ->  profile.ps1.bak                   (fixed)
//
// A failed backup never stops a deployment. It is reported as a
// warning and the copy goes ahead without a safety net.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::status::StatusSink;

/// How backup file names are formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupMode {
    /// `<file>.<yyyymmdd-hhmmss><ext>`, never overwrites an earlier backup
    #[default]
    Timestamped,
    /// `<file><ext>`, replaced on every backup
    Fixed,
}

/// Backup naming policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    pub mode: BackupMode,
    /// Extension appended to the backup, e.g. ".bak"
    pub extension: String,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        BackupPolicy {
            mode: BackupMode::Timestamped,
            extension: ".bak".to_string(),
        }
    }
}

impl BackupPolicy {
    /// The path a backup of `path` would be written to right now.
    pub fn backup_path_for(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        if self.mode == BackupMode::Timestamped {
            name.push(format!(".{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));
        }
        name.push(&self.extension);
        let candidate = PathBuf::from(name);

        if self.mode == BackupMode::Fixed || !candidate.exists() {
            return candidate;
        }

        // Two backups within the same second: add a counter.
        (1..)
            .map(|n| {
                let mut name = candidate.as_os_str().to_os_string();
                name.push(format!(".{n}"));
                PathBuf::from(name)
            })
            .find(|p| !p.exists())
            .unwrap_or(candidate)
    }
}

/// Back up `path` if it exists.
///
/// Returns the backup location, or `None` when there was nothing to back
/// up or the copy failed (the failure is reported to the operator).
pub fn backup(path: &Path, policy: &BackupPolicy, sink: &StatusSink) -> Option<PathBuf> {
    if !path.is_file() {
        return None;
    }

    let target = policy.backup_path_for(path);
    match fs::copy(path, &target) {
        Ok(_) => {
            sink.warning(format!("Backed up existing file to {}", target.display()));
            Some(target)
        }
        Err(e) => {
            sink.warning(format!(
                "Could not back up {} ({}); continuing without a backup",
                path.display(),
                e
            ));
            None
        }
    }
}

/// Put a backup back in place of `target`.
pub fn restore(backup: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(backup, target).with_context(|| {
        format!(
            "Failed to restore {} from {}",
            target.display(),
            backup.display()
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Level;

    #[test]
    fn test_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let sink = StatusSink::new(true);
        let result = backup(&dir.path().join("nope.ps1"), &BackupPolicy::default(), &sink);
        assert!(result.is_none());
        assert!(sink.history().is_empty());
    }

    #[test]
    fn test_backup_then_restore_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("userChrome.css");
        let original = b"/* Version: 1.0 */\n\x00\xffbinary-ish".to_vec();
        fs::write(&path, &original).unwrap();

        let sink = StatusSink::new(true);
        let saved = backup(&path, &BackupPolicy::default(), &sink).unwrap();
        assert!(saved.to_string_lossy().ends_with(".bak"));

        fs::write(&path, b"overwritten").unwrap();
        restore(&saved, &path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), original);

        let history = sink.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].0, Level::Warning);
        assert!(history[0].1.contains(&*saved.to_string_lossy()));
    }

    #[test]
    fn test_fixed_suffix_overwrites_previous_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.ps1");
        let policy = BackupPolicy {
            mode: BackupMode::Fixed,
            extension: ".bak".to_string(),
        };
        let sink = StatusSink::new(true);

        fs::write(&path, "first").unwrap();
        let a = backup(&path, &policy, &sink).unwrap();
        fs::write(&path, "second").unwrap();
        let b = backup(&path, &policy, &sink).unwrap();

        assert_eq!(a, b);
        assert_eq!(a, dir.path().join("profile.ps1.bak"));
        assert_eq!(fs::read_to_string(&b).unwrap(), "second");
    }

    #[test]
    fn test_timestamped_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.ps1");
        let policy = BackupPolicy::default();
        let sink = StatusSink::new(true);

        fs::write(&path, "first").unwrap();
        let a = backup(&path, &policy, &sink).unwrap();
        fs::write(&path, "second").unwrap();
        let b = backup(&path, &policy, &sink).unwrap();

        assert_ne!(a, b);
        assert_eq!(fs::read_to_string(&a).unwrap(), "first");
        assert_eq!(fs::read_to_string(&b).unwrap(), "second");
    }
}
