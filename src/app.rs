use crate::anchor::AnchorId;
use crate::clock::SystemClock;
use crate::compiler::{CompileWorker, MarkdownCompiler, RenderedOutput};
use crate::config::Config;
use crate::paginate::PageSetup;
use crate::render::RenderStatus;
use crate::resolve::{AnchorLocation, PageLayout, PageMetric, PageMetrics};
use crate::session::{SyncSession, TextChange};
use crate::sync::{EditorViewport, Pane, PreviewViewport};
use anyhow::{Context, Result};
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, MouseEvent, MouseEventKind,
};
use crossterm::execute;
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode};
use notify::{RecursiveMode, Watcher};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Clear, Paragraph, Wrap};
use ropey::Rope;
use std::fs;
use std::io::{self, Stdout};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use unicode_width::UnicodeWidthChar;

/// Pixels per terminal row.
pub const CELL_PX: f32 = 16.0;

const TICK_RATE: Duration = Duration::from_millis(50);
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(150);
const WHEEL_ROWS: usize = 3;

pub fn run_app(path: PathBuf, config: Config) -> Result<()> {
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut app = App::new(path, config, text);

    let mut terminal = setup_terminal()?;
    let _guard = TerminalGuard;

    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&app.file_path, RecursiveMode::NonRecursive)?;

    loop {
        let size = terminal.size()?;
        let layout = app.layout(size);
        app.editor.height = layout.editor_height as usize;
        app.preview.height = layout.preview_height as usize;

        app.session.tick(&mut app.editor, &mut app.preview);
        app.collect_notice();

        terminal.draw(|f| ui(f, &app, &layout))?;

        if event::poll(TICK_RATE)? {
            match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => {
                    if app.handle_key(key) {
                        break;
                    }
                }
                Event::Mouse(mouse) => app.handle_mouse(mouse, &layout),
                Event::Resize(_, _) => app.session.note_page_metrics_changed(),
                _ => {}
            }
        }

        while let Ok(msg) = rx.try_recv() {
            if let Ok(event) = msg {
                app.on_fs_event(event);
            }
        }

        app.handle_pending_reload();
    }

    app.session.shutdown();
    Ok(())
}

struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = execute!(stdout, DisableMouseCapture, LeaveAlternateScreen);
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

/// Rope-backed editor pane.
struct EditorPane {
    rope: Rope,
    cursor_char: usize,
    preferred_col: Option<usize>,
    /// First visible line.
    scroll: usize,
    height: usize,
}

impl EditorPane {
    fn new(text: &str) -> Self {
        Self {
            rope: Rope::from_str(text),
            cursor_char: 0,
            preferred_col: None,
            scroll: 0,
            height: 1,
        }
    }

    fn max_scroll(&self) -> usize {
        self.rope.len_lines().saturating_sub(1)
    }

    fn scroll_by(&mut self, delta: isize) {
        self.scroll = self
            .scroll
            .saturating_add_signed(delta)
            .min(self.max_scroll());
    }

    fn cursor_line_col(&self) -> (usize, usize) {
        let line = self.rope.char_to_line(self.cursor_char);
        let col = self.cursor_char.saturating_sub(self.rope.line_to_char(line));
        (line, col)
    }

    fn insert_char(&mut self, c: char) {
        self.rope.insert_char(self.cursor_char, c);
        self.cursor_char += 1;
        self.preferred_col = None;
    }

    fn insert_str(&mut self, text: &str) {
        self.rope.insert(self.cursor_char, text);
        self.cursor_char += text.chars().count();
        self.preferred_col = None;
    }

    /// Returns `false` when there was nothing to delete.
    fn backspace(&mut self) -> bool {
        if self.cursor_char == 0 {
            return false;
        }
        let prev = self.cursor_char - 1;
        self.rope.remove(prev..self.cursor_char);
        self.cursor_char = prev;
        self.preferred_col = None;
        true
    }

    fn delete(&mut self) -> bool {
        if self.cursor_char >= self.rope.len_chars() {
            return false;
        }
        self.rope.remove(self.cursor_char..self.cursor_char + 1);
        self.preferred_col = None;
        true
    }

    fn move_left(&mut self) {
        self.cursor_char = self.cursor_char.saturating_sub(1);
        self.preferred_col = None;
    }

    fn move_right(&mut self) {
        if self.cursor_char < self.rope.len_chars() {
            self.cursor_char += 1;
        }
        self.preferred_col = None;
    }

    fn move_lines(&mut self, delta: isize) {
        let (line, col) = self.cursor_line_col();
        let target = line
            .saturating_add_signed(delta)
            .min(self.rope.len_lines().saturating_sub(1));
        if target == line {
            return;
        }
        let desired = self.preferred_col.unwrap_or(col);
        let target_col = desired.min(line_len_chars(&self.rope, target));
        self.cursor_char = self.rope.line_to_char(target) + target_col;
        self.preferred_col = Some(desired);
    }

    fn move_line_start(&mut self) {
        let (line, _) = self.cursor_line_col();
        self.cursor_char = self.rope.line_to_char(line);
        self.preferred_col = None;
    }

    fn move_line_end(&mut self) {
        let (line, _) = self.cursor_line_col();
        self.cursor_char = self.rope.line_to_char(line) + line_len_chars(&self.rope, line);
        self.preferred_col = None;
    }

    fn ensure_cursor_visible(&mut self) {
        let (line, _) = self.cursor_line_col();
        let height = self.height.max(1);
        if line < self.scroll {
            self.scroll = line;
        } else if line >= self.scroll + height {
            self.scroll = line + 1 - height;
        }
    }

    fn visible_text(&self, tab_width: usize) -> Text<'static> {
        let lines: Vec<Line<'static>> = (self.scroll..self.rope.len_lines())
            .take(self.height)
            .map(|idx| {
                let line = self.rope.line(idx).to_string();
                let line = line.trim_end_matches(['\n', '\r']);
                Line::from(line.replace('\t', &" ".repeat(tab_width.max(1))))
            })
            .collect();
        Text::from(lines)
    }
}

impl EditorViewport for EditorPane {
    fn scroll_top(&self) -> f32 {
        self.scroll as f32 * CELL_PX
    }

    fn set_scroll_top(&mut self, px: f32) {
        self.scroll = ((px / CELL_PX).round().max(0.0) as usize).min(self.max_scroll());
    }

    fn line_height(&self) -> f32 {
        CELL_PX
    }

    fn visible_lines(&self) -> Range<usize> {
        let end = (self.scroll + self.height.max(1)).min(self.rope.len_lines());
        self.scroll..end.max(self.scroll)
    }

    fn line_count(&self) -> usize {
        self.rope.len_lines()
    }
}

/// Pages stacked top to bottom, one separator row after each page.
#[derive(Default)]
struct PreviewPane {
    output: Option<RenderedOutput>,
    lines: Vec<Line<'static>>,
    page_rows: usize,
    scroll: usize,
    height: usize,
}

impl PreviewPane {
    fn scroll_by(&mut self, delta: isize) {
        self.scroll = self
            .scroll
            .saturating_add_signed(delta)
            .min(self.lines.len().saturating_sub(1));
    }

    fn stride(&self) -> usize {
        self.page_rows + 1
    }

    fn current_page(&self) -> Option<(usize, usize)> {
        let output = self.output.as_ref()?;
        let page = (self.scroll / self.stride().max(1)).min(output.page_count().saturating_sub(1));
        Some((page + 1, output.page_count()))
    }

    fn visible_text(&self) -> Text<'static> {
        let start = self.scroll.min(self.lines.len());
        let end = (start + self.height).min(self.lines.len());
        Text::from(self.lines[start..end].to_vec())
    }
}

impl PageLayout for PreviewPane {
    fn page_metrics(&self) -> PageMetrics {
        let Some(output) = &self.output else {
            return PageMetrics::default();
        };
        let stride = self.stride() as f32;
        PageMetrics {
            pages: (0..output.page_count())
                .map(|page| PageMetric {
                    top: page as f32 * stride * CELL_PX,
                    height: self.page_rows as f32,
                    scale: CELL_PX,
                })
                .collect(),
            settled: true,
        }
    }

    fn locate_anchor(&self, id: &AnchorId) -> Option<AnchorLocation> {
        self.output.as_ref()?.document().locate(id)
    }
}

impl PreviewViewport for PreviewPane {
    fn scroll_top(&self) -> f32 {
        self.scroll as f32 * CELL_PX
    }

    fn set_scroll_top(&mut self, px: f32) {
        let row = (px / CELL_PX).round().max(0.0) as usize;
        self.scroll = row.min(self.lines.len().saturating_sub(1));
    }

    fn present(&mut self, output: &RenderedOutput) {
        let document = output.document();
        let rows = document.setup().rows as usize;
        let width = document.setup().width as usize;
        let total = document.page_count();
        let mut lines = Vec::with_capacity(total * (rows + 1));
        for (idx, page) in document.pages().iter().enumerate() {
            lines.extend(page.lines.iter().cloned());
            lines.extend(std::iter::repeat_n(Line::default(), rows.saturating_sub(page.lines.len())));
            let label = format!(" {} / {total} ", idx + 1);
            let rule = "┄".repeat(width.saturating_sub(label.len()) / 2);
            lines.push(Line::from(Span::styled(
                format!("{rule}{label}{rule}"),
                Style::default().fg(Color::DarkGray),
            )));
        }
        self.page_rows = rows;
        self.lines = lines;
        self.output = Some(output.clone());
        self.scroll = self.scroll.min(self.lines.len().saturating_sub(1));
    }

    fn clear(&mut self) {
        self.output = None;
        self.lines.clear();
        self.scroll = 0;
    }
}

#[derive(Default)]
struct FsReload {
    pending: bool,
    deadline: Option<Instant>,
}

struct Toast {
    message: String,
    until: Instant,
}

struct LayoutInfo {
    status: Rect,
    editor: Rect,
    preview: Rect,
    editor_width: u16,
    editor_height: u16,
    preview_height: u16,
}

struct App {
    file_path: PathBuf,
    config: Config,
    session: SyncSession,
    editor: EditorPane,
    preview: PreviewPane,
    focus: Pane,
    dirty: bool,
    status: Option<String>,
    toast: Option<Toast>,
    reload: FsReload,
    suppress_reload_until: Option<Instant>,
}

impl App {
    fn new(path: PathBuf, config: Config, text: String) -> Self {
        let setup = PageSetup {
            width: config.render.page_width,
            rows: config.render.page_rows,
            tab_width: config.editor.tab_width,
        };
        let compiler = MarkdownCompiler::new(setup, config.render.build_dir.clone());
        let mut session = SyncSession::new(
            &config,
            Box::new(CompileWorker::new(compiler)),
            Box::new(SystemClock),
            Some(path.clone()),
        );
        let editor = EditorPane::new(&text);
        session.load(text);
        Self {
            file_path: path,
            config,
            session,
            editor,
            preview: PreviewPane::default(),
            focus: Pane::Editor,
            dirty: false,
            status: None,
            toast: None,
            reload: FsReload::default(),
            suppress_reload_until: None,
        }
    }

    fn layout(&self, size: Rect) -> LayoutInfo {
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1)])
            .split(size);
        let split = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(vertical[0]);

        LayoutInfo {
            status: vertical[1],
            editor: split[0],
            preview: split[1],
            editor_width: split[0].width.saturating_sub(2).max(1),
            editor_height: split[0].height.saturating_sub(2).max(1),
            preview_height: split[1].height.saturating_sub(2).max(1),
        }
    }

    fn collect_notice(&mut self) {
        if let Some(notice) = self.session.take_notice() {
            self.toast = Some(Toast {
                message: notice.message,
                until: Instant::now() + self.config.render.notice_window(),
            });
        }
        if self.toast.as_ref().is_some_and(|t| Instant::now() >= t.until) {
            self.toast = None;
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('q') => return true,
                KeyCode::Char('s') => self.save_buffer(),
                KeyCode::Char('r') => {
                    self.session.force_render();
                    self.status = Some("Rendering".to_string());
                }
                KeyCode::Char('l') => {
                    self.session.force_sync(&mut self.editor, &mut self.preview);
                }
                KeyCode::Char('p') => {
                    self.focus = match self.focus {
                        Pane::Editor => Pane::Preview,
                        Pane::Preview => Pane::Editor,
                    };
                }
                _ => {}
            }
            return false;
        }
        match self.focus {
            Pane::Editor => self.handle_editor_key(key),
            Pane::Preview => self.handle_preview_key(key),
        }
        false
    }

    fn handle_editor_key(&mut self, key: KeyEvent) {
        let page = self.editor.height.max(1) as isize;
        let before = self.editor.scroll;
        let edited = match key.code {
            KeyCode::Left => {
                self.editor.move_left();
                false
            }
            KeyCode::Right => {
                self.editor.move_right();
                false
            }
            KeyCode::Up => {
                self.editor.move_lines(-1);
                false
            }
            KeyCode::Down => {
                self.editor.move_lines(1);
                false
            }
            KeyCode::PageUp => {
                self.editor.move_lines(-page);
                false
            }
            KeyCode::PageDown => {
                self.editor.move_lines(page);
                false
            }
            KeyCode::Home => {
                self.editor.move_line_start();
                false
            }
            KeyCode::End => {
                self.editor.move_line_end();
                false
            }
            KeyCode::Backspace => self.editor.backspace(),
            KeyCode::Delete => self.editor.delete(),
            KeyCode::Enter => {
                self.editor.insert_char('\n');
                true
            }
            KeyCode::Tab => {
                let spaces = " ".repeat(self.config.editor.tab_width.max(1));
                self.editor.insert_str(&spaces);
                true
            }
            KeyCode::Char(c) => {
                self.editor.insert_char(c);
                true
            }
            _ => false,
        };

        if edited {
            self.dirty = true;
            self.session.on_text_changed(TextChange {
                text: self.editor.rope.to_string(),
                is_user_edit: true,
            });
        }
        self.editor.ensure_cursor_visible();
        if self.editor.scroll != before {
            self.session.on_editor_scroll();
        }
    }

    fn handle_preview_key(&mut self, key: KeyEvent) {
        let page = self.preview.height.max(1) as isize;
        let before = self.preview.scroll;
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => self.preview.scroll_by(-1),
            KeyCode::Down | KeyCode::Char('j') => self.preview.scroll_by(1),
            KeyCode::PageUp => self.preview.scroll_by(-page),
            KeyCode::PageDown | KeyCode::Char(' ') => self.preview.scroll_by(page),
            KeyCode::Home | KeyCode::Char('g') => self.preview.scroll = 0,
            KeyCode::End | KeyCode::Char('G') => {
                self.preview.scroll = self.preview.lines.len().saturating_sub(1);
            }
            _ => {}
        }
        if self.preview.scroll != before {
            self.session.on_preview_scroll();
        }
    }

    fn handle_mouse(&mut self, mouse: MouseEvent, layout: &LayoutInfo) {
        let delta = match mouse.kind {
            MouseEventKind::ScrollUp => -(WHEEL_ROWS as isize),
            MouseEventKind::ScrollDown => WHEEL_ROWS as isize,
            _ => return,
        };
        if mouse.column >= layout.preview.x {
            let before = self.preview.scroll;
            self.preview.scroll_by(delta);
            if self.preview.scroll != before {
                self.session.on_preview_scroll();
            }
        } else {
            let before = self.editor.scroll;
            self.editor.scroll_by(delta);
            if self.editor.scroll != before {
                self.session.on_editor_scroll();
            }
        }
    }

    fn save_buffer(&mut self) {
        let text = self.editor.rope.to_string();
        if let Err(err) = fs::write(&self.file_path, &text) {
            tracing::warn!(path = %self.file_path.display(), error = %err, "save failed");
            self.status = Some(format!("Save failed: {err}"));
            return;
        }
        self.dirty = false;
        self.suppress_reload_until = Some(Instant::now() + Duration::from_millis(300));
        self.status = Some("Saved".to_string());
    }

    fn request_reload(&mut self) {
        self.reload.pending = true;
        self.reload.deadline = Some(Instant::now() + RELOAD_DEBOUNCE);
    }

    fn on_fs_event(&mut self, _event: notify::Event) {
        if self.dirty {
            self.status = Some("External change ignored (unsaved edits)".to_string());
            return;
        }
        if let Some(until) = self.suppress_reload_until {
            if Instant::now() < until {
                return;
            }
            self.suppress_reload_until = None;
        }
        self.request_reload();
    }

    fn handle_pending_reload(&mut self) {
        if !self.reload.pending {
            return;
        }
        if self.reload.deadline.is_some_and(|deadline| Instant::now() < deadline) {
            return;
        }
        self.reload = FsReload::default();
        self.reload_file();
    }

    fn reload_file(&mut self) {
        let text = match fs::read_to_string(&self.file_path) {
            Ok(text) => text,
            Err(err) => {
                self.status = Some(format!("Failed to reload: {err}"));
                return;
            }
        };
        if self.editor.rope == text.as_str() {
            return;
        }
        self.editor.rope = Rope::from_str(&text);
        self.editor.cursor_char = self.editor.cursor_char.min(self.editor.rope.len_chars());
        self.editor.scroll = self.editor.scroll.min(self.editor.max_scroll());
        self.session.on_text_changed(TextChange {
            text,
            is_user_edit: false,
        });
        tracing::info!(path = %self.file_path.display(), "reloaded after external change");
        self.status = Some("Reloaded".to_string());
    }

    fn status_line(&self) -> Line<'static> {
        let muted = Style::default().fg(Color::DarkGray);
        let accent = Style::default().fg(Color::Cyan);
        let sep = || Span::styled(" | ", muted);

        let render_style = match self.session.compile_status() {
            RenderStatus::Error(_) => Style::default().fg(Color::Red),
            RenderStatus::Running => Style::default().fg(Color::Yellow),
            _ => accent,
        };
        let mut parts = vec![
            Span::styled("marksync", accent.add_modifier(Modifier::BOLD)),
            sep(),
            Span::raw(self.file_path.to_string_lossy().to_string()),
            sep(),
            Span::styled(format!("render: {}", self.session.compile_status().label()), render_style),
            sep(),
            Span::styled(format!("sync: {}", self.session.sync_mode()), accent),
        ];
        if let Some(anchor) = self.session.active_anchor_id() {
            parts.push(sep());
            parts.push(Span::styled(format!("@{anchor}"), muted));
        }
        if let Some(msg) = &self.status {
            parts.push(sep());
            parts.push(Span::styled(msg.clone(), accent));
        }
        Line::from(parts)
    }

    fn cursor_screen_position(&self, layout: &LayoutInfo) -> Option<(u16, u16)> {
        if self.focus != Pane::Editor {
            return None;
        }
        let (line, col) = self.editor.cursor_line_col();
        let visible_line = line.checked_sub(self.editor.scroll)?;
        if visible_line >= layout.editor_height as usize {
            return None;
        }
        let tab_width = self.config.editor.tab_width.max(1);
        let width: usize = self
            .editor
            .rope
            .line(line)
            .chars()
            .take(col)
            .map(|ch| match ch {
                '\t' => tab_width,
                _ => UnicodeWidthChar::width(ch).unwrap_or(0),
            })
            .sum();
        let x = layout
            .editor
            .x
            .saturating_add(1)
            .saturating_add(width.min(layout.editor_width as usize).try_into().ok()?);
        let y = layout
            .editor
            .y
            .saturating_add(1)
            .saturating_add(visible_line.try_into().ok()?);
        Some((x, y))
    }
}

fn pane_block(title: String, focused: bool) -> Block<'static> {
    let border = if focused { Color::Cyan } else { Color::DarkGray };
    Block::bordered()
        .title(title)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(border))
}

fn ui(f: &mut ratatui::Frame, app: &App, layout: &LayoutInfo) {
    f.render_widget(Paragraph::new(app.status_line()), layout.status);

    let file_name = app
        .file_path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("marksync");
    let title = if app.dirty {
        format!(" *{file_name} ")
    } else {
        format!(" {file_name} ")
    };
    let editor = Paragraph::new(app.editor.visible_text(app.config.editor.tab_width))
        .block(pane_block(title, app.focus == Pane::Editor));
    f.render_widget(editor, layout.editor);

    let preview_focused = app.focus == Pane::Preview;
    match app.session.compile_status() {
        RenderStatus::Error(failure) => {
            let text = Text::from(vec![
                Line::from(Span::styled(
                    failure.message.clone(),
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                )),
                Line::default(),
                Line::from(failure.detail.clone()),
            ]);
            let panel = Paragraph::new(text)
                .wrap(Wrap { trim: false })
                .block(pane_block(" Error ".to_string(), preview_focused));
            f.render_widget(panel, layout.preview);
        }
        _ if app.preview.output.is_none() => {
            let panel = Paragraph::new(Span::styled("Rendering…", Style::default().fg(Color::DarkGray)))
                .block(pane_block(" Preview ".to_string(), preview_focused));
            f.render_widget(panel, layout.preview);
        }
        _ => {
            let title = match app.preview.current_page() {
                Some((page, total)) => format!(" Preview · page {page}/{total} "),
                None => " Preview ".to_string(),
            };
            let panel = Paragraph::new(app.preview.visible_text()).block(pane_block(title, preview_focused));
            f.render_widget(panel, layout.preview);
        }
    }

    if let Some(toast) = &app.toast {
        let width = (toast.message.chars().count() as u16)
            .saturating_add(4)
            .min(layout.preview.width);
        let area = Rect {
            x: layout.preview.right().saturating_sub(width),
            y: layout.preview.y,
            width,
            height: 3.min(layout.preview.height),
        };
        f.render_widget(Clear, area);
        f.render_widget(
            Paragraph::new(Span::styled(toast.message.clone(), Style::default().fg(Color::Yellow)))
                .block(
                    Block::bordered()
                        .border_type(BorderType::Rounded)
                        .border_style(Style::default().fg(Color::Yellow)),
                ),
            area,
        );
    }

    if let Some((x, y)) = app.cursor_screen_position(layout) {
        f.set_cursor(x, y);
    }
}

fn line_len_chars(rope: &Rope, line: usize) -> usize {
    if line >= rope.len_lines() {
        return 0;
    }
    let slice = rope.line(line);
    let len = slice.len_chars();
    if len > 0 && slice.char(len - 1) == '\n' {
        len - 1
    } else {
        len
    }
}
