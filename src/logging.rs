use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn,marksync=info";

/// Keeps the background writer alive; dropping it flushes the file.
pub struct LogGuard {
    _file_guard: WorkerGuard,
    pub log_file: PathBuf,
}

/// Filter priority: `MARKSYNC_LOG`, then `RUST_LOG`, then `warn,marksync=info`.
pub fn init(log_file: Option<PathBuf>) -> Result<LogGuard> {
    let (dir, filename) = resolve_log_path(log_file);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(&dir, &filename);
    let (writer, file_guard) = tracing_appender::non_blocking(appender);
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(create_filter(
            env::var("MARKSYNC_LOG").ok().as_deref(),
            env::var("RUST_LOG").ok().as_deref(),
        ));

    Registry::default()
        .with(layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(LogGuard {
        _file_guard: file_guard,
        log_file: dir.join(filename),
    })
}

/// Splits an override into (directory, file name). A path without an
/// extension is taken as a directory.
pub fn resolve_log_path(override_path: Option<PathBuf>) -> (PathBuf, String) {
    let filename = format!("marksync-{}.log", std::process::id());

    if let Some(path) = override_path {
        if path.extension().is_some() {
            let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(filename);
            return (dir, name);
        }
        return (path, filename);
    }

    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("marksync")
        .join("logs");
    (dir, filename)
}

fn filter_directives(marksync_log: Option<&str>, rust_log: Option<&str>) -> String {
    if let Some(level) = marksync_log {
        if level.contains(['=', ':', ',']) {
            return level.to_string();
        }
        return format!("warn,marksync={level}");
    }
    if let Some(rust_log) = rust_log {
        return rust_log.to_string();
    }
    DEFAULT_FILTER.to_string()
}

fn create_filter(marksync_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let directives = filter_directives(marksync_log, rust_log);
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(None, None, "warn,marksync=info")]
    #[case(Some("debug"), Some("trace"), "warn,marksync=debug")]
    #[case(Some("marksync::sync=trace"), None, "marksync::sync=trace")]
    #[case(None, Some("info"), "info")]
    fn filter_priority(
        #[case] marksync_log: Option<&str>,
        #[case] rust_log: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(filter_directives(marksync_log, rust_log), expected);
    }

    #[test]
    fn file_override_splits_dir_and_name() {
        let (dir, name) = resolve_log_path(Some(PathBuf::from("/tmp/logs/run.log")));
        assert_eq!(dir, PathBuf::from("/tmp/logs"));
        assert_eq!(name, "run.log");
    }

    #[test]
    fn directory_override_keeps_default_name() {
        let (dir, name) = resolve_log_path(Some(PathBuf::from("/tmp/logs")));
        assert_eq!(dir, PathBuf::from("/tmp/logs"));
        assert!(name.starts_with("marksync-") && name.ends_with(".log"));
    }
}
