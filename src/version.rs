// ============================================
// winprovision - version.rs
// ============================================
// Version tags embedded in config file headers, and their ordering.
//
// Config files we deploy carry a version in their leading comments:
//   PowerShell:  # Version: 1.2.0      or   <# ... Version: 1.2.0 ... #>
//   CSS:         /* Version: 2.1.0 */  or   @version 2.1.0
//   other:       # Version: / /* Version: */ / // Version:
//
// The orchestrator compares the source file's tag with the deployed
// file's tag to decide whether a copy is needed.
// ============================================

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

/// An ordered sequence of numeric components, e.g. `1.2.0`.
///
/// Missing trailing components compare as zero, so `1.2 == 1.2.0`.
#[derive(Debug, Clone, Eq)]
pub struct VersionTag(Vec<u64>);

/// Error for a string that is not a dotted list of integers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version string: {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for VersionTag {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);

        if body.is_empty() {
            return Err(ParseVersionError(s.to_string()));
        }

        body.split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map(VersionTag)
            .map_err(|_| ParseVersionError(s.to_string()))
    }
}

impl Ord for VersionTag {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for VersionTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for VersionTag {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u64::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Compare two possibly-absent versions.
///
/// An absent version sorts below any present one; two absent versions are equal.
pub fn compare(a: Option<&VersionTag>, b: Option<&VersionTag>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Compare two version strings, treating unparseable input as absent.
pub fn compare_str(a: &str, b: &str) -> Ordering {
    compare(a.parse().ok().as_ref(), b.parse().ok().as_ref())
}

// ============================================
// EXTRACTION
// ============================================

/// Which comment patterns apply to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternFamily {
    Css,
    Script,
    Generic,
}

impl PatternFamily {
    fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "css" => PatternFamily::Css,
            "ps1" | "psm1" | "psd1" => PatternFamily::Script,
            _ => PatternFamily::Generic,
        }
    }

    fn patterns(self) -> &'static [Regex] {
        static CSS: OnceLock<Vec<Regex>> = OnceLock::new();
        static SCRIPT: OnceLock<Vec<Regex>> = OnceLock::new();
        static GENERIC: OnceLock<Vec<Regex>> = OnceLock::new();

        match self {
            PatternFamily::Css => CSS.get_or_init(|| {
                compile(&[
                    r"(?is)/\*.*?Version:\s*([\w.\-]+)",
                    r"(?i)@version\s+([\w.\-]+)",
                ])
            }),
            PatternFamily::Script => SCRIPT.get_or_init(|| {
                compile(&[
                    r"(?im)^\s*#\s*Version:\s*([\w.\-]+)",
                    r"(?is)<#.*?Version:\s*([\w.\-]+).*?#>",
                ])
            }),
            PatternFamily::Generic => GENERIC.get_or_init(|| {
                compile(&[
                    r"(?im)^\s*#\s*Version:\s*([\w.\-]+)",
                    r"(?is)/\*.*?Version:\s*([\w.\-]+)",
                    r"(?im)^\s*//\s*Version:\s*([\w.\-]+)",
                ])
            }),
        }
    }
}

fn compile(sources: &[&str]) -> Vec<Regex> {
    sources
        .iter()
        .filter_map(|src| match Regex::new(src) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::error!("bad version pattern {src}: {e}");
                None
            }
        })
        .collect()
}

/// Find a version tag in `content`, using the patterns for `path`'s extension.
///
/// The first pattern whose capture parses wins. A capture that does not
/// parse falls through to the next pattern of the same family.
pub fn extract_from_str(path: &Path, content: &str) -> Option<VersionTag> {
    PatternFamily::for_path(path)
        .patterns()
        .iter()
        .filter_map(|re| re.captures(content))
        .filter_map(|caps| caps.get(1))
        .find_map(|m| m.as_str().trim_end_matches('.').parse().ok())
}

/// Read `path` and extract its version tag. Missing or unreadable files yield `None`.
pub fn extract_version(path: &Path) -> Option<VersionTag> {
    let bytes = fs::read(path).ok()?;
    let content = String::from_utf8_lossy(&bytes);
    extract_from_str(path, &content)
}
