//! Fetching sources and bottles into the download cache.
//!
//! The strategy is picked once per URL ([`DownloadStrategy::detect`]); HTTP
//! downloads stream into `<cache>/<file>.incomplete` and are renamed when
//! complete, so a cache entry is never half-written. Ctrl-C or a failed
//! transfer removes the partial file before the error is returned.

use crate::bottle::Bottle;
use crate::error::{BrewError, Result};
use crate::recipe::{ActiveSpec, SpecKind};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// How a URL is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// http, https and ftp
    Curl,
    Git,
    Mercurial,
    /// `file://` URLs and plain paths
    Local,
}

impl DownloadStrategy {
    /// An explicit `using` hint wins over the URL's shape
    pub fn detect(url: &str, using: Option<&str>) -> Self {
        match using {
            Some("git") => return DownloadStrategy::Git,
            Some("hg") | Some("mercurial") => return DownloadStrategy::Mercurial,
            Some("curl") => return DownloadStrategy::Curl,
            Some("local") => return DownloadStrategy::Local,
            Some(other) => warn!("Unknown download strategy {}, guessing from URL", other),
            None => {}
        }

        if url.starts_with("git://") || url.starts_with("git@") || url.ends_with(".git") {
            DownloadStrategy::Git
        } else if url.starts_with("hg://") || url.starts_with("https://hg.") {
            DownloadStrategy::Mercurial
        } else if url.starts_with("file://") || url.starts_with('/') {
            DownloadStrategy::Local
        } else {
            DownloadStrategy::Curl
        }
    }
}

/// SHA256 of a file, lowercase hex
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Fail with [`BrewError::ChecksumMismatch`] unless `path` hashes to `expected`
pub fn verify_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(BrewError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// The fetch collaborator
#[derive(Debug, Clone)]
pub struct Downloader {
    cache: PathBuf,
    client: reqwest::Client,
    retry: bool,
    progress: bool,
}

impl Downloader {
    pub fn new(cache: impl Into<PathBuf>) -> Self {
        Self {
            cache: cache.into(),
            client: reqwest::Client::new(),
            retry: false,
            progress: false,
        }
    }

    /// Retry a failed network fetch once
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn cache(&self) -> &Path {
        &self.cache
    }

    /// Fetch a bottle archive and verify it
    pub async fn fetch_bottle(&self, bottle: &Bottle) -> Result<PathBuf> {
        let target = self.cache.join(&bottle.filename);
        self.fetch_file(&bottle.name, &bottle.url, &[], &target, Some(&bottle.sha256))
            .await
    }

    /// Fetch the source for `active`. Returns an archive for Curl/Local and a
    /// checkout directory for Git/Mercurial. Head sources are not checksummed.
    pub async fn fetch_source(&self, name: &str, active: &ActiveSpec<'_>) -> Result<PathBuf> {
        let spec = active.spec;
        let strategy = DownloadStrategy::detect(&spec.url, spec.using.as_deref());
        let sha256 = match active.kind {
            SpecKind::Head => None,
            _ => spec.sha256.as_deref(),
        };
        debug!("{}: fetching {} with {:?}", name, spec.url, strategy);

        match strategy {
            DownloadStrategy::Git => self.clone_repo("git", name, &spec.url).await,
            DownloadStrategy::Mercurial => self.clone_repo("hg", name, &spec.url).await,
            DownloadStrategy::Curl | DownloadStrategy::Local => {
                let target = self
                    .cache
                    .join(format!("{}--{}", name, url_basename(&spec.url, active.version)));
                self.fetch_file(name, &spec.url, &spec.mirrors, &target, sha256)
                    .await
            }
        }
    }

    async fn fetch_file(
        &self,
        name: &str,
        url: &str,
        mirrors: &[String],
        target: &Path,
        sha256: Option<&str>,
    ) -> Result<PathBuf> {
        if DownloadStrategy::detect(url, None) == DownloadStrategy::Local {
            let local = local_path(url);
            if !local.is_file() {
                return Err(BrewError::FetchFailed {
                    url: url.to_string(),
                    reason: "no such file".to_string(),
                });
            }
            if let Some(expected) = sha256 {
                verify_checksum(&local, expected)?;
            }
            return Ok(local);
        }

        // A verified cache entry is reused
        if target.exists() {
            match sha256 {
                Some(expected) if verify_checksum(target, expected).is_ok() => {
                    debug!("{}: using cached {}", name, target.display());
                    return Ok(target.to_path_buf());
                }
                _ => fs::remove_file(target).await?,
            }
        }

        fs::create_dir_all(&self.cache).await?;

        let mut last_error = None;
        for candidate in std::iter::once(url).chain(mirrors.iter().map(String::as_str)) {
            match self.download_with_retry(name, candidate, target).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(BrewError::Interrupted) => return Err(BrewError::Interrupted),
                Err(e) => {
                    warn!("{}: {}", name, e);
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }

        if let Some(expected) = sha256 {
            if let Err(e) = verify_checksum(target, expected) {
                fs::remove_file(target).await?;
                return Err(e);
            }
        }

        Ok(target.to_path_buf())
    }

    async fn download_with_retry(&self, name: &str, url: &str, target: &Path) -> Result<()> {
        match self.download(name, url, target).await {
            Err(BrewError::FetchFailed { .. }) | Err(BrewError::HttpError(_)) if self.retry => {
                info!("{}: retrying {}", name, url);
                self.download(name, url, target).await
            }
            other => other,
        }
    }

    /// Stream `url` to `<target>.incomplete`, then rename into place
    async fn download(&self, name: &str, url: &str, target: &Path) -> Result<()> {
        let partial = incomplete_path(target);

        let outcome = tokio::select! {
            result = self.stream_to(name, url, &partial) => result,
            _ = tokio::signal::ctrl_c() => Err(BrewError::Interrupted),
        };

        match outcome {
            Ok(()) => {
                fs::rename(&partial, target).await?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, name: &str, url: &str, partial: &Path) -> Result<()> {
        let failed = |reason: String| BrewError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        let pb = self.progress.then(|| {
            let pb = ProgressBar::new(response.content_length().unwrap_or(0));
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb.set_message(format!("⬇ {}", name));
            pb
        });

        let mut file = fs::File::create(partial).await?;
        let mut downloaded: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(pb) = &pb {
                pb.set_position(downloaded);
            }
        }
        file.flush().await?;

        if let Some(pb) = &pb {
            pb.finish_with_message(format!("✓ {}", name));
        }
        Ok(())
    }

    /// Clone (or update) a repository checkout in the cache
    async fn clone_repo(&self, program: &str, name: &str, url: &str) -> Result<PathBuf> {
        let checkout = self.cache.join(format!("{}--{}", name, program));
        fs::create_dir_all(&self.cache).await?;

        let mut command = Command::new(program);
        let fresh = !checkout.exists();
        match (program, fresh) {
            ("git", true) => command.args(["clone", "--depth", "1", url]).arg(&checkout),
            ("git", false) => command.arg("-C").arg(&checkout).args(["pull", "--ff-only"]),
            (_, true) => command.args(["clone", url]).arg(&checkout),
            (_, false) => command.arg("pull").arg("-u").arg("-R").arg(&checkout),
        };
        command.kill_on_drop(true);

        let status = tokio::select! {
            status = command.status() => status.map_err(|e| BrewError::FetchFailed {
                url: url.to_string(),
                reason: format!("failed to run {}: {}", program, e),
            }),
            _ = tokio::signal::ctrl_c() => Err(BrewError::Interrupted),
        };

        match status {
            Ok(s) if s.success() => Ok(checkout),
            other => {
                if fresh {
                    let _ = fs::remove_dir_all(&checkout).await;
                }
                match other {
                    Ok(s) => Err(BrewError::FetchFailed {
                        url: url.to_string(),
                        reason: format!("{} exited with {}", program, s),
                    }),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

fn incomplete_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".incomplete");
    target.with_file_name(name)
}

fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

/// Last URL path component without query, or `<version>` if there is none
fn url_basename(url: &str, version: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(base) if !base.is_empty() => base.to_string(),
        _ => version.to_string(),
    }
}
