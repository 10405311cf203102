// ============================================
// winprovision - status.rs
// ============================================
// Leveled status messages for the operator.
//
// Every message is:
//   1. printed to the terminal with a colored marker
//   2. mirrored as a tracing event (visible with -v)
//   3. appended to the session progress file, when one is attached
//
// Progress file lines look like:
//   2026-10-18 14:02:11 [Warning] Backed up profile.ps1
// ============================================

use std::cell::RefCell;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use console::style;

/// Severity of a status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Success => write!(f, "Success"),
            Level::Info => write!(f, "Info"),
            Level::Warning => write!(f, "Warning"),
            Level::Error => write!(f, "Error"),
        }
    }
}

/// Format one progress-file line.
pub fn format_line(level: Level, message: &str) -> String {
    format!(
        "{} [{}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        level,
        message
    )
}

/// Operator-facing message sink.
///
/// Single-threaded by construction: the orchestrator and the batch
/// manager share it by reference on the main thread.
#[derive(Debug, Default)]
pub struct StatusSink {
    quiet: bool,
    progress_file: RefCell<Option<PathBuf>>,
    history: RefCell<Vec<(Level, String)>>,
}

impl StatusSink {
    pub fn new(quiet: bool) -> Self {
        StatusSink {
            quiet,
            ..Default::default()
        }
    }

    /// Start appending messages to `path`.
    pub fn attach(&self, path: &Path) {
        *self.progress_file.borrow_mut() = Some(path.to_path_buf());
    }

    /// Stop appending to the progress file.
    pub fn detach(&self) {
        *self.progress_file.borrow_mut() = None;
    }

    pub fn success(&self, message: impl AsRef<str>) {
        self.emit(Level::Success, message.as_ref());
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(Level::Info, message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.emit(Level::Warning, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(Level::Error, message.as_ref());
    }

    /// Echo a line verbatim (progress lines coming back from the elevated child).
    pub fn raw(&self, line: &str) {
        if !self.quiet {
            println!("  {}", style(line).dim());
        }
    }

    /// Print a section header.
    pub fn header(&self, title: &str) {
        if !self.quiet {
            println!("\n{}", style(title).bold().underlined());
        }
    }

    /// Every message emitted so far, oldest first.
    #[allow(dead_code)]
    pub fn history(&self) -> Vec<(Level, String)> {
        self.history.borrow().clone()
    }

    fn emit(&self, level: Level, message: &str) {
        match level {
            Level::Success | Level::Info => tracing::info!(%level, "{message}"),
            Level::Warning => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }

        if !self.quiet || level == Level::Error {
            match level {
                Level::Success => println!("{} {}", style("✓").green().bold(), message),
                Level::Info => println!("{} {}", style("ℹ").blue().bold(), message),
                Level::Warning => eprintln!("{} {}", style("⚠").yellow().bold(), message),
                Level::Error => eprintln!("{} {}", style("✗").red().bold(), message),
            }
        }

        self.history.borrow_mut().push((level, message.to_string()));
        self.append_to_progress_file(level, message);
    }

    fn append_to_progress_file(&self, level: Level, message: &str) {
        let target = self.progress_file.borrow();
        let Some(path) = target.as_ref() else {
            return;
        };

        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", format_line(level, message)));

        if let Err(e) = written {
            tracing::debug!("could not append to {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_file_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("progress.log");

        let sink = StatusSink::new(true);
        sink.info("not recorded");
        sink.attach(&log);
        sink.warning("Backed up profile.ps1");
        sink.error("copy failed");
        sink.detach();
        sink.success("also not recorded");

        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[Warning] Backed up profile.ps1"));
        assert!(lines[1].ends_with("[Error] copy failed"));
    }

    #[test]
    fn test_history_keeps_every_level() {
        let sink = StatusSink::new(true);
        sink.success("a");
        sink.info("b");
        let history = sink.history();
        assert_eq!(history[0], (Level::Success, "a".to_string()));
        assert_eq!(history[1], (Level::Info, "b".to_string()));
    }
}
