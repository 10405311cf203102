// ============================================
// winprovision - download.rs
// ============================================
// File transfer helpers used by the OBS installer:
//   - stream an HTTP response to disk with a progress bar
//   - extract a ZIP (entries may not escape the destination)
//   - mirror a directory tree
//   - scratch folders that delete themselves
// ============================================

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use walkdir::WalkDir;

const BAR_TEMPLATE: &str =
    "{prefix:>12.cyan.bold} [{elapsed_precise}] {wide_bar:.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

// ============================================
// DOWNLOAD
// ============================================

/// Build a progress bar for a transfer of `total` bytes (0 = unknown).
pub fn transfer_bar(label: &str, total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }

    let bar = if total > 0 {
        ProgressBar::new(total)
    } else {
        ProgressBar::new_spinner()
    };
    if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
        bar.set_style(style.progress_chars("█▓▒░  "));
    }
    bar.set_prefix(label.to_string());
    bar
}

/// Copy `reader` into a new file at `dest`, advancing `bar`. Returns bytes written.
pub fn stream_to_file(mut reader: impl Read, dest: &Path, bar: &ProgressBar) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut file =
        File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut buffer = [0u8; 8192];
    let mut written: u64 = 0;

    loop {
        let bytes_read = reader.read(&mut buffer).context("Download interrupted")?;
        if bytes_read == 0 {
            break;
        }
        file.write_all(&buffer[..bytes_read])?;
        written += bytes_read as u64;
        bar.inc(bytes_read as u64);
    }

    // Flush before anyone opens the file for extraction
    file.flush()?;
    bar.finish_and_clear();
    Ok(written)
}

/// Human readable byte count.
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}

// ============================================
// ZIP EXTRACTION
// ============================================

/// Extract every entry of `zip_path` into `dest`. Returns the number of files written.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<usize> {
    let file =
        File::open(zip_path).with_context(|| format!("Failed to open {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("{} is not a valid ZIP archive", zip_path.display()))?;

    fs::create_dir_all(dest)?;
    let mut extracted = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        // Reject "../" and absolute paths
        let Some(relative) = entry.enclosed_name() else {
            anyhow::bail!("Archive entry '{}' escapes the destination", entry.name());
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }

    tracing::debug!("extracted {} files from {}", extracted, zip_path.display());
    Ok(extracted)
}

// ============================================
// DIRECTORY COPY
// ============================================

/// Recursively copy the contents of `src` into `dest`, overwriting files.
/// Returns the number of files copied.
pub fn copy_dir_all(src: &Path, dest: &Path) -> Result<usize> {
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut copied = 0;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry.path().strip_prefix(src)?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", entry.path().display(), target.display())
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

// ============================================
// SCRATCH DIRECTORY GUARD
// ============================================

/// A uniquely named temp folder, removed when dropped.
///
/// Same idea as an RAII mount guard: whatever happens between creation
/// and the end of scope (errors, early returns), the folder goes away.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<parent>/<prefix>-<uuid>/`.
    pub fn new(parent: &Path, prefix: &str) -> Result<Self> {
        let path = parent.join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create scratch folder {}", path.display()))?;
        Ok(ScratchDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("could not remove scratch folder {}: {}", self.path.display(), e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::write_zip;
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 bytes");
        assert_eq!(format_size(512_000), "500 KB");
        assert_eq!(format_size(9_000_000), "8.6 MB");
        assert_eq!(format_size(1_500_000_000), "1.4 GB");
    }

    #[test]
    fn test_extract_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("a.zip");
        write_zip(
            &zip_path,
            &[("bin/64bit/obs64.exe", "exe"), ("data/locale/en-US.ini", "x=y")],
        );

        let out = dir.path().join("out");
        assert_eq!(extract_zip(&zip_path, &out).unwrap(), 2);
        assert_eq!(fs::read_to_string(out.join("bin/64bit/obs64.exe")).unwrap(), "exe");
        assert!(out.join("data/locale/en-US.ini").is_file());
    }

    #[test]
    fn test_extract_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        write_zip(&zip_path, &[("../outside.txt", "nope")]);

        let out = dir.path().join("out");
        assert!(extract_zip(&zip_path, &out).is_err());
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn test_extract_rejects_non_zip() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("x.zip");
        fs::write(&bogus, "<html>rate limited</html>").unwrap();
        assert!(extract_zip(&bogus, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_copy_dir_all_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/c.txt"), "new").unwrap();
        fs::write(src.join("top.txt"), "top").unwrap();

        let dest = dir.path().join("dest");
        fs::create_dir_all(dest.join("a/b")).unwrap();
        fs::write(dest.join("a/b/c.txt"), "old").unwrap();

        assert_eq!(copy_dir_all(&src, &dest).unwrap(), 2);
        assert_eq!(fs::read_to_string(dest.join("a/b/c.txt")).unwrap(), "new");
        assert!(dest.join("top.txt").exists());
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::new(dir.path(), "obs-extract").unwrap();
            fs::write(scratch.path().join("f"), "x").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_stream_to_file_counts_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested/file.bin");
        let bar = transfer_bar("test", 0, false);
        let written = stream_to_file(&b"hello world"[..], &dest, &bar).unwrap();
        assert_eq!(written, 11);
        assert_eq!(fs::read(&dest).unwrap(), b"hello world");
    }
}
