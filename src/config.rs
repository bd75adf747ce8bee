use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub editor: EditorConfig,
    pub render: RenderConfig,
    pub sync: SyncConfig,
    pub log: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub tab_width: usize,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self { tab_width: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Quiet period after an edit before the text is submitted for compile.
    pub settle_ms: u64,
    pub page_width: u16,
    pub page_rows: u16,
    /// Where rendered artifacts are written. An empty string keeps renders
    /// in memory.
    #[serde(with = "optional_path")]
    pub build_dir: Option<PathBuf>,
    pub keep_last: usize,
    pub max_age_secs: u64,
    /// A recoverable compile notice for the same cause shows at most once per window.
    pub notice_window_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            settle_ms: 400,
            page_width: 72,
            page_rows: 48,
            build_dir: dirs::cache_dir().map(|dir| dir.join("marksync").join("build")),
            keep_last: 10,
            max_age_secs: 30 * 60,
            notice_window_ms: 3_000,
        }
    }
}

impl RenderConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn notice_window(&self) -> Duration {
        Duration::from_millis(self.notice_window_ms)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub typing_idle_ms: u64,
    pub scroll_settle_ms: u64,
    pub guard_ms: u64,
    pub tolerance_px: f32,
    pub top_margin_px: f32,
    /// Anchors further than this many lines outside the visible range are not
    /// considered a confident match.
    pub nearby_lines: usize,
    /// Fraction of the document used when no anchor is nearby.
    pub fallback_depth: f32,
    pub resolve_interval_ms: u64,
    pub resolve_attempts: u32,
    pub resolve_timeout_ms: u64,
    pub startup_timeout_ms: u64,
    pub startup_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: 800,
            scroll_settle_ms: 50,
            guard_ms: 60,
            tolerance_px: 2.0,
            top_margin_px: 8.0,
            nearby_lines: 50,
            fallback_depth: 0.25,
            resolve_interval_ms: 120,
            resolve_attempts: 8,
            resolve_timeout_ms: 200,
            startup_timeout_ms: 5_000,
            startup_poll_ms: 120,
        }
    }
}

impl SyncConfig {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn scroll_settle(&self) -> Duration {
        Duration::from_millis(self.scroll_settle_ms)
    }

    pub fn guard(&self) -> Duration {
        Duration::from_millis(self.guard_ms)
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_interval_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn startup_poll(&self) -> Duration {
        Duration::from_millis(self.startup_poll_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub file: Option<PathBuf>,
}

pub fn config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Could not determine config directory")?;
    Ok(base.join("marksync").join("config.toml"))
}

pub fn ensure_config_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    Ok(())
}

pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = Config::default();
        write_config(&cfg)?;
        return Ok(cfg);
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let (cfg, changed) = parse_config(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if changed {
        write_config(&cfg)?;
    }
    Ok(cfg)
}

/// Parses a config file, reporting whether defaults had to fill any gaps.
pub fn parse_config(raw: &str) -> Result<(Config, bool)> {
    let cfg: Config = toml::from_str(raw)?;
    let on_disk: toml::Value = toml::from_str(raw)?;
    let complete = toml::Value::try_from(&cfg)?;
    Ok((cfg, has_missing_keys(&on_disk, &complete)))
}

fn has_missing_keys(on_disk: &toml::Value, complete: &toml::Value) -> bool {
    match (on_disk, complete) {
        (toml::Value::Table(disk), toml::Value::Table(full)) => {
            full.iter().any(|(key, value)| match disk.get(key) {
                Some(existing) => has_missing_keys(existing, value),
                None => true,
            })
        }
        _ => false,
    }
}

mod optional_path {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::path::PathBuf;

    pub fn serialize<S: Serializer>(path: &Option<PathBuf>, serializer: S) -> Result<S::Ok, S::Error> {
        match path {
            Some(path) => path.serialize(serializer),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
        let path = Option::<PathBuf>::deserialize(deserializer)?;
        Ok(path.filter(|p| !p.as_os_str().is_empty()))
    }
}

pub fn write_config(cfg: &Config) -> Result<()> {
    let path = config_path()?;
    ensure_config_dir(&path)?;
    let text = toml::to_string_pretty(cfg).context("Failed to serialize config")?;
    fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn open_config_in_editor() -> Result<()> {
    let path = config_path()?;
    if !path.exists() {
        let cfg = Config::default();
        write_config(&cfg)?;
    }

    let editor = env::var("EDITOR").unwrap_or_else(|_| "nvim".to_string());
    let mut parts = match shell_words::split(&editor) {
        Ok(p) if !p.is_empty() => p,
        _ => vec![editor],
    };
    let cmd = parts.remove(0);
    let status = Command::new(cmd)
        .args(parts)
        .arg(&path)
        .status()
        .with_context(|| format!("Failed to launch editor for {}", path.display()))?;
    if !status.success() {
        anyhow::bail!("Editor exited with status {}", status);
    }
    Ok(())
}
