//! Bidirectional scroll sync between the editor and the paged preview.
//!
//! Each pane has its own [`ScrollGuard`]: a scroll this controller applies
//! arms the guard, and scroll events reported while it is armed are treated
//! as the echo of that write rather than as user input.

use crate::anchor::{AnchorId, AnchorIndex, IndexedAnchor};
use crate::compiler::RenderedOutput;
use crate::config::SyncConfig;
use crate::resolve::PageLayout;
use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};

pub trait EditorViewport {
    /// Pixels scrolled from the top of the document.
    fn scroll_top(&self) -> f32;
    fn set_scroll_top(&mut self, px: f32);
    fn line_height(&self) -> f32;
    /// Source lines currently on screen, end exclusive.
    fn visible_lines(&self) -> Range<usize>;
    fn line_count(&self) -> usize;
}

pub trait PreviewViewport: PageLayout {
    fn scroll_top(&self) -> f32;
    fn set_scroll_top(&mut self, px: f32);
    fn present(&mut self, output: &RenderedOutput);
    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    AwaitingFirstRender,
    Auto,
    Manual,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncMode::AwaitingFirstRender => "waiting",
            SyncMode::Auto => "auto",
            SyncMode::Manual => "manual",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Editor,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollGuard {
    #[default]
    Idle,
    Programmatic {
        until: Instant,
    },
}

impl ScrollGuard {
    pub fn engage(&mut self, until: Instant) {
        *self = ScrollGuard::Programmatic { until };
    }

    /// Releases an expired guard; reports whether it is still armed.
    pub fn is_active(&mut self, now: Instant) -> bool {
        match *self {
            ScrollGuard::Idle => false,
            ScrollGuard::Programmatic { until } if now >= until => {
                *self = ScrollGuard::Idle;
                false
            }
            ScrollGuard::Programmatic { .. } => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSettings {
    pub settle: Duration,
    pub guard: Duration,
    pub tolerance: f32,
    pub top_margin: f32,
    pub nearby_lines: usize,
    pub fallback_depth: f32,
    pub startup_timeout: Duration,
    pub startup_poll: Duration,
}

impl From<&SyncConfig> for SyncSettings {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            settle: cfg.scroll_settle(),
            guard: cfg.guard(),
            tolerance: cfg.tolerance_px,
            top_margin: cfg.top_margin_px,
            nearby_lines: cfg.nearby_lines,
            fallback_depth: cfg.fallback_depth.clamp(0.0, 1.0),
            startup_timeout: cfg.startup_timeout(),
            startup_poll: cfg.startup_poll(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Applied { pane: Pane, target: f32, anchor: AnchorId },
    /// Target was within tolerance of the current position.
    WithinTolerance { pane: Pane, anchor: AnchorId },
    /// No usable anchor; nothing moved.
    NoAnchor,
    /// Preview-driven correction held back while the user types.
    Suppressed,
    /// Sync is not running yet.
    Inactive,
}

#[derive(Debug, Clone, Copy)]
struct PendingScroll {
    pane: Pane,
    due: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Startup {
    deadline: Instant,
    next_poll: Instant,
}

#[derive(Debug)]
pub struct ScrollSyncController {
    settings: SyncSettings,
    mode: SyncMode,
    index: Option<AnchorIndex>,
    editor_guard: ScrollGuard,
    preview_guard: ScrollGuard,
    pending: Option<PendingScroll>,
    startup: Option<Startup>,
    active: Option<AnchorId>,
    touched: bool,
}

impl ScrollSyncController {
    pub fn new(settings: SyncSettings, now: Instant) -> Self {
        Self {
            settings,
            mode: SyncMode::AwaitingFirstRender,
            index: None,
            editor_guard: ScrollGuard::Idle,
            preview_guard: ScrollGuard::Idle,
            pending: None,
            startup: Some(Startup {
                deadline: now + settings.startup_timeout,
                next_poll: now,
            }),
            active: None,
            touched: false,
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn active_anchor_id(&self) -> Option<&AnchorId> {
        self.active.as_ref()
    }

    pub fn index(&self) -> Option<&AnchorIndex> {
        self.index.as_ref()
    }

    pub fn is_starting(&self) -> bool {
        self.startup.is_some()
    }

    fn set_mode(&mut self, mode: SyncMode, why: &str) {
        if self.mode != mode {
            tracing::debug!(from = %self.mode, to = %mode, why, "sync mode changed");
            self.mode = mode;
        }
    }

    /// A compile was published.
    pub fn note_published(&mut self, first: bool) {
        if first && self.mode == SyncMode::AwaitingFirstRender {
            self.set_mode(SyncMode::Auto, "first render");
        } else if self.mode == SyncMode::Manual && !self.touched {
            self.set_mode(SyncMode::Auto, "recompiled without user scroll");
        }
        self.touched = false;
    }

    /// Installs a freshly resolved index. Returns `true` when the caller
    /// should run an editor-to-preview pass now; during startup the watcher
    /// runs that pass itself.
    pub fn install_index(&mut self, index: AnchorIndex) -> bool {
        tracing::debug!(generation = %index.generation(), anchors = index.len(), "anchor index installed");
        self.index = Some(index);
        self.startup.is_none()
    }

    /// Drops the index after a blocking compile error. With no offsets to
    /// follow, sync is manual until the next clean publish.
    pub fn clear_index(&mut self) {
        if self.mode == SyncMode::Auto {
            self.set_mode(SyncMode::Manual, "anchor index cleared");
        }
        self.index = None;
        self.active = None;
        self.pending = None;
    }

    pub fn on_editor_scroll(&mut self, now: Instant) {
        self.on_scroll(Pane::Editor, now);
    }

    pub fn on_preview_scroll(&mut self, now: Instant) {
        self.on_scroll(Pane::Preview, now);
    }

    fn on_scroll(&mut self, pane: Pane, now: Instant) {
        if self.mode == SyncMode::AwaitingFirstRender {
            return;
        }
        let guard = match pane {
            Pane::Editor => &mut self.editor_guard,
            Pane::Preview => &mut self.preview_guard,
        };
        if guard.is_active(now) {
            tracing::trace!(?pane, "programmatic scroll echo ignored");
            return;
        }
        self.touched = true;
        self.pending = Some(PendingScroll {
            pane,
            due: now + self.settings.settle,
        });
    }

    /// Runs the startup watcher and any scroll whose settle window passed.
    pub fn tick(
        &mut self,
        now: Instant,
        typing: bool,
        editor: &mut dyn EditorViewport,
        preview: &mut dyn PreviewViewport,
    ) -> Option<SyncOutcome> {
        self.editor_guard.is_active(now);
        self.preview_guard.is_active(now);

        if let Some(startup) = self.startup {
            if now >= startup.next_poll {
                if self.index.is_some() {
                    self.startup = None;
                    tracing::debug!("startup sync pass");
                    return Some(self.sync_from_editor(now, editor, preview));
                }
                if now >= startup.deadline {
                    self.startup = None;
                    if self.mode == SyncMode::AwaitingFirstRender {
                        self.set_mode(SyncMode::Manual, "startup timed out");
                    }
                } else {
                    self.startup = Some(Startup {
                        next_poll: now + self.settings.startup_poll,
                        ..startup
                    });
                }
            }
        }

        let pending = self.pending?;
        if now < pending.due {
            return None;
        }
        self.pending = None;
        Some(match pending.pane {
            Pane::Editor => self.sync_from_editor(now, editor, preview),
            Pane::Preview => self.sync_from_preview(now, typing, editor, preview),
        })
    }

    /// Immediate editor-to-preview pass, dropping any settling scroll.
    pub fn force_sync(
        &mut self,
        now: Instant,
        editor: &mut dyn EditorViewport,
        preview: &mut dyn PreviewViewport,
    ) -> SyncOutcome {
        self.pending = None;
        self.sync_from_editor(now, editor, preview)
    }

    pub fn sync_from_editor(
        &mut self,
        now: Instant,
        editor: &mut dyn EditorViewport,
        preview: &mut dyn PreviewViewport,
    ) -> SyncOutcome {
        if self.mode == SyncMode::AwaitingFirstRender {
            return SyncOutcome::Inactive;
        }
        let Some(index) = self.index.as_ref().filter(|index| !index.is_empty()) else {
            self.set_mode(SyncMode::Manual, "no anchors");
            return SyncOutcome::NoAnchor;
        };

        let visible = editor.visible_lines();
        let top = visible.start;
        let last = visible.end.saturating_sub(1).max(top);
        let window = top.saturating_sub(self.settings.nearby_lines)
            ..=last.saturating_add(self.settings.nearby_lines);
        let (entry, confident) = match index.nearest_to_line(top, window) {
            Some(entry) => (entry.clone(), true),
            None => {
                let depth = editor.line_count() as f32 * self.settings.fallback_depth;
                match index.nearest_any(depth as usize) {
                    Some(entry) => (entry.clone(), false),
                    None => return SyncOutcome::NoAnchor,
                }
            }
        };
        if confident {
            self.set_mode(SyncMode::Auto, "editor anchor match");
        } else {
            self.set_mode(SyncMode::Manual, "no anchor near editor viewport");
        }

        let target = (entry.offset.offset - self.settings.top_margin).max(0.0);
        self.active = Some(entry.anchor.id.clone());
        if (preview.scroll_top() - target).abs() < self.settings.tolerance {
            return SyncOutcome::WithinTolerance {
                pane: Pane::Preview,
                anchor: entry.anchor.id,
            };
        }
        self.preview_guard.engage(now + self.settings.guard);
        preview.set_scroll_top(target);
        tracing::trace!(anchor = %entry.anchor.id, target, confident, "preview scrolled to anchor");
        SyncOutcome::Applied {
            pane: Pane::Preview,
            target,
            anchor: entry.anchor.id,
        }
    }

    pub fn sync_from_preview(
        &mut self,
        now: Instant,
        typing: bool,
        editor: &mut dyn EditorViewport,
        preview: &mut dyn PreviewViewport,
    ) -> SyncOutcome {
        if self.mode == SyncMode::AwaitingFirstRender {
            return SyncOutcome::Inactive;
        }
        if typing {
            return SyncOutcome::Suppressed;
        }
        let probe = preview.scroll_top() + self.settings.top_margin;
        let Some(entry) = self
            .index
            .as_ref()
            .and_then(|index| index.at_offset(probe))
            .cloned()
        else {
            self.set_mode(SyncMode::Manual, "no anchors");
            return SyncOutcome::NoAnchor;
        };
        self.set_mode(SyncMode::Auto, "preview anchor match");
        self.apply_to_editor(now, entry, editor)
    }

    fn apply_to_editor(
        &mut self,
        now: Instant,
        entry: IndexedAnchor,
        editor: &mut dyn EditorViewport,
    ) -> SyncOutcome {
        let target = entry.anchor.line as f32 * editor.line_height();
        self.active = Some(entry.anchor.id.clone());
        if (editor.scroll_top() - target).abs() < self.settings.tolerance {
            return SyncOutcome::WithinTolerance {
                pane: Pane::Editor,
                anchor: entry.anchor.id,
            };
        }
        self.editor_guard.engage(now + self.settings.guard);
        editor.set_scroll_top(target);
        tracing::trace!(anchor = %entry.anchor.id, line = entry.anchor.line, "editor scrolled to anchor");
        SyncOutcome::Applied {
            pane: Pane::Editor,
            target,
            anchor: entry.anchor.id,
        }
    }
}
