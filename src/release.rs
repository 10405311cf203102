// ============================================
// winprovision - release.rs
// ============================================
// Finding downloads on GitHub releases.
//
// How it works:
//   1. GET /repos/{owner}/{repo}/releases/latest
//   2. Pick the asset whose name matches a glob (case-insensitive)
//   3. Return its URL, size, and the release tag as the version
//
// The OBS installer talks to a ReleaseSource, so tests can serve
// releases and archives from disk instead of the network.
// ============================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};
use serde::Deserialize;

use crate::download::{stream_to_file, transfer_bar};

const GITHUB_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("winprovision/", env!("CARGO_PKG_VERSION"));

// ============================================
// DATA STRUCTURES
// ============================================

/// The fields of a GitHub release we use; serde ignores the rest.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    /// e.g. "31.0.2"
    pub tag_name: String,
    pub assets: Vec<GitHubAsset>,
}

/// A downloadable file attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    pub size: u64,
}

/// Where to get something and what version it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub url: String,
    pub file_name: String,
    /// Reported size in bytes, 0 when unknown
    pub size: u64,
    pub version: String,
}

/// Release lookups and downloads.
pub trait ReleaseSource {
    /// Latest release of `repo` ("owner/name") with its asset matching `asset_pattern`.
    fn latest_github(&self, repo: &str, asset_pattern: &str) -> Result<ReleaseInfo>;

    /// Size of the resource at `url` from a HEAD request; 0 when unavailable.
    fn probe_size(&self, url: &str) -> u64;

    /// Download `url` to `dest`, returning the number of bytes written.
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

// ============================================
// ASSET MATCHING
// ============================================

/// Case-insensitive glob matcher for asset names.
pub fn asset_matcher(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()
        .with_context(|| format!("Invalid asset pattern '{}'", pattern))?;
    Ok(glob.compile_matcher())
}

/// Pick the first asset matching `pattern`.
pub fn select_asset<'a>(release: &'a GitHubRelease, pattern: &str) -> Result<&'a GitHubAsset> {
    let matcher = asset_matcher(pattern)?;
    release
        .assets
        .iter()
        .find(|a| matcher.is_match(&a.name))
        .with_context(|| {
            let names: Vec<&str> = release.assets.iter().map(|a| a.name.as_str()).collect();
            format!(
                "No asset matching '{}' in release {} (available: {})",
                pattern,
                release.tag_name,
                if names.is_empty() { "none".to_string() } else { names.join(", ") }
            )
        })
}

/// Turn a release into a ReleaseInfo for the asset matching `pattern`.
pub fn release_info(release: &GitHubRelease, pattern: &str) -> Result<ReleaseInfo> {
    let asset = select_asset(release, pattern)?;
    Ok(ReleaseInfo {
        url: asset.browser_download_url.clone(),
        file_name: asset.name.clone(),
        size: asset.size,
        version: release.tag_name.clone(),
    })
}

// ============================================
// HTTP CLIENT
// ============================================

/// GitHub API + plain HTTP downloads over a blocking reqwest client.
pub struct GithubClient {
    client: reqwest::blocking::Client,
    api_base: String,
    token: Option<String>,
    show_progress: bool,
}

impl GithubClient {
    /// `token_env` names the environment variable holding an API token (optional).
    pub fn new(token_env: &str, show_progress: bool) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;

        let token = std::env::var(token_env)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if token.is_some() {
            tracing::debug!("using GitHub token from {}", token_env);
        }

        Ok(GithubClient {
            client,
            api_base: GITHUB_API_BASE.to_string(),
            token,
            show_progress,
        })
    }

    fn fetch_latest(&self, repo: &str) -> Result<GitHubRelease> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, repo);
        tracing::debug!("GET {}", url);

        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .with_context(|| format!("Could not reach GitHub for {}", repo))?;
        if !response.status().is_success() {
            anyhow::bail!("GitHub API returned status {} for {}", response.status(), repo);
        }

        // Parse from text to keep reqwest's json feature off
        let body = response.text().context("Failed to read release response")?;
        serde_json::from_str(&body).with_context(|| format!("Failed to parse release info for {}", repo))
    }
}

impl ReleaseSource for GithubClient {
    fn latest_github(&self, repo: &str, asset_pattern: &str) -> Result<ReleaseInfo> {
        let release = self.fetch_latest(repo)?;
        release_info(&release, asset_pattern)
    }

    fn probe_size(&self, url: &str) -> u64 {
        match self.client.head(url).send() {
            Ok(r) if r.status().is_success() => r.content_length().unwrap_or(0),
            Ok(r) => {
                tracing::debug!("HEAD {} returned {}", url, r.status());
                0
            }
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                0
            }
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        tracing::info!("downloading {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .context("Failed to connect to download server")?;
        if !response.status().is_success() {
            anyhow::bail!("Download failed with status: {}", response.status());
        }

        let label = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let bar = transfer_bar(&label, response.content_length().unwrap_or(0), self.show_progress);
        stream_to_file(response, dest, &bar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release() -> GitHubRelease {
        serde_json::from_str(
            r#"{
                "tag_name": "31.0.2",
                "name": "OBS Studio 31.0.2",
                "assets": [
                    {"name": "OBS-Studio-31.0.2-macOS-Apple.dmg", "browser_download_url": "https://x/mac.dmg", "size": 10},
                    {"name": "OBS-Studio-31.0.2-Windows.zip", "browser_download_url": "https://x/win.zip", "size": 20},
                    {"name": "OBS-Studio-31.0.2-Windows-Installer.exe", "browser_download_url": "https://x/win.exe", "size": 30}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_release_info_uses_matching_asset_and_tag() {
        let info = release_info(&release(), "OBS-Studio-*-Windows*.zip").unwrap();
        assert_eq!(info.url, "https://x/win.zip");
        assert_eq!(info.file_name, "OBS-Studio-31.0.2-Windows.zip");
        assert_eq!(info.size, 20);
        assert_eq!(info.version, "31.0.2");
    }

    #[test]
    fn test_asset_match_is_case_insensitive() {
        let info = release_info(&release(), "obs-studio-*-windows.zip").unwrap();
        assert_eq!(info.size, 20);
    }

    #[test]
    fn test_no_match_lists_available_assets() {
        let err = release_info(&release(), "*.tar.gz").unwrap_err().to_string();
        assert!(err.contains("*.tar.gz"));
        assert!(err.contains("OBS-Studio-31.0.2-Windows.zip"));
    }

    #[test]
    fn test_invalid_pattern_is_error() {
        assert!(asset_matcher("[unclosed").is_err());
    }
}
