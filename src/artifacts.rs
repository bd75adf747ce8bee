use crate::config::RenderConfig;
use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub dir: PathBuf,
    pub keep_last: usize,
    pub max_age: Duration,
}

impl CleanupPolicy {
    /// `None` when no build directory is configured.
    pub fn from_config(render: &RenderConfig) -> Option<Self> {
        Some(Self {
            dir: render.build_dir.clone()?,
            keep_last: render.keep_last,
            max_age: render.max_age(),
        })
    }

    /// Keeps exactly the `keep` newest artifacts, whatever their age.
    pub fn keep_newest(self, keep: usize) -> Self {
        Self {
            keep_last: keep,
            max_age: Duration::MAX,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
}

fn is_artifact(name: &str) -> bool {
    name.starts_with("render-") && name.ends_with(".txt")
}

/// Keeps the `keep_last` newest artifacts that are younger than `max_age`
/// and deletes the rest. A missing directory is not an error.
pub fn cleanup(policy: &CleanupPolicy) -> Result<CleanupReport> {
    if !policy.dir.exists() {
        return Ok(CleanupReport::default());
    }

    let mut artifacts: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
    for entry in WalkDir::new(&policy.dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("Failed to list {}", policy.dir.display()))?;
        if !entry.file_type().is_file() || !entry.file_name().to_str().is_some_and(is_artifact) {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        artifacts.push((entry.into_path(), modified, meta.len()));
    }
    artifacts.sort_by(|a, b| b.1.cmp(&a.1));

    let now = SystemTime::now();
    let stale = artifacts
        .into_iter()
        .enumerate()
        .filter(|(rank, (_, modified, _))| {
            let age = now.duration_since(*modified).unwrap_or_default();
            *rank >= policy.keep_last || age > policy.max_age
        })
        .map(|(_, (path, _, len))| (path, len));
    Ok(remove_all(stale))
}

/// A file that cannot be removed is logged and skipped.
fn remove_all(stale: impl IntoIterator<Item = (PathBuf, u64)>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for (path, len) in stale {
        match fs::remove_file(&path) {
            Ok(()) => {
                report.files_removed += 1;
                report.bytes_freed += len;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove artifact");
            }
        }
    }
    report
}

/// Runs [`cleanup`] on a background thread. Failures are only logged.
pub fn spawn_cleanup(policy: CleanupPolicy) {
    let spawned = thread::Builder::new()
        .name("marksync-cleanup".to_string())
        .spawn(move || match cleanup(&policy) {
            Ok(report) if report.files_removed > 0 => {
                tracing::debug!(
                    dir = %policy.dir.display(),
                    files = report.files_removed,
                    bytes = report.bytes_freed,
                    "removed stale render artifacts"
                );
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "artifact cleanup failed"),
        });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "failed to spawn artifact cleanup");
    }
}
