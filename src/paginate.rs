//! Built-in page renderer: markdown to fixed-width, fixed-height text pages.
//!
//! Layout mirrors a print renderer closely enough for scroll sync: every
//! block start is recorded against the row it lands on, so each anchor can
//! later be located as (page, row within page).

use crate::anchor::{Anchor, AnchorId};
use crate::compiler::AbortSignal;
use crate::extract::{body_start, parser_options};
use crate::resolve::AnchorLocation;
use pulldown_cmark::{CodeBlockKind, Event, LinkType, Parser, Tag, TagEnd};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use std::collections::HashMap;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSetup {
    pub width: u16,
    pub rows: u16,
    pub tab_width: usize,
}

impl Default for PageSetup {
    fn default() -> Self {
        Self {
            width: 72,
            rows: 48,
            tab_width: 4,
        }
    }
}

/// A `[text](#label)` link, kept so the compiler can check its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalLink {
    pub label: String,
    pub source_offset: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub lines: Vec<Line<'static>>,
}

#[derive(Debug, Clone)]
pub struct PagedDocument {
    setup: PageSetup,
    pages: Vec<Page>,
    locations: HashMap<AnchorId, AnchorLocation>,
    links: Vec<InternalLink>,
}

impl PagedDocument {
    pub fn setup(&self) -> PageSetup {
        self.setup
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn locate(&self, id: &AnchorId) -> Option<AnchorLocation> {
        self.locations.get(id).copied()
    }

    pub fn internal_links(&self) -> &[InternalLink] {
        &self.links
    }

    /// Plain text of every page, separated by form feeds.
    pub fn to_plain_text(&self) -> String {
        let mut out = String::new();
        for (idx, page) in self.pages.iter().enumerate() {
            if idx > 0 {
                out.push('\u{c}');
                out.push('\n');
            }
            for line in &page.lines {
                for span in &line.spans {
                    out.push_str(span.content.as_ref());
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Lays out `source` into pages. Returns `None` once `signal` is aborted.
pub fn paginate(
    source: &str,
    anchors: &[Anchor],
    setup: PageSetup,
    signal: &AbortSignal,
) -> Option<PagedDocument> {
    let start = body_start(source);
    let body = &source[start..];
    let mut layout = BlockLayout::new(setup);

    for (event, range) in Parser::new_ext(body, parser_options()).into_offset_iter() {
        if signal.is_aborted() {
            return None;
        }
        layout.handle(event, range.start + start);
    }
    layout.flush();

    let rows = wrap_rows(&layout.raw_lines, setup.width as usize);
    let mut wrapped_start = Vec::with_capacity(layout.raw_lines.len());
    let mut lines = Vec::new();
    for raw in rows {
        wrapped_start.push(lines.len());
        lines.extend(raw);
    }

    let mut marks = layout.marks;
    marks.sort_by_key(|(offset, _)| *offset);
    let page_rows = setup.rows.max(1) as usize;
    let locations = anchors
        .iter()
        .map(|anchor| {
            let row = marks
                .partition_point(|(offset, _)| *offset <= anchor.source_offset)
                .checked_sub(1)
                .map_or(0, |idx| wrapped_start[marks[idx].1]);
            let location = AnchorLocation {
                page: row / page_rows,
                y: (row % page_rows) as f32,
            };
            (anchor.id.clone(), location)
        })
        .collect();

    let mut pages: Vec<Page> = lines
        .chunks(page_rows)
        .map(|chunk| Page {
            lines: chunk.to_vec(),
        })
        .collect();
    if pages.is_empty() {
        pages.push(Page::default());
    }

    Some(PagedDocument {
        setup,
        pages,
        locations,
        links: layout.links,
    })
}

struct StyleState {
    bold: u8,
    italic: u8,
    strike: u8,
    link: u8,
}

impl StyleState {
    fn new() -> Self {
        Self {
            bold: 0,
            italic: 0,
            strike: 0,
            link: 0,
        }
    }

    fn current(&self) -> Style {
        let mut style = Style::default();
        if self.link > 0 {
            style = style.add_modifier(Modifier::UNDERLINED);
        }
        if self.bold > 0 {
            style = style.add_modifier(Modifier::BOLD);
        }
        if self.italic > 0 {
            style = style.add_modifier(Modifier::ITALIC);
        }
        if self.strike > 0 {
            style = style.add_modifier(Modifier::CROSSED_OUT);
        }
        style
    }
}

enum ListKind {
    Bullet,
    Ordered { next: u64 },
}

struct CodeBlock {
    lang: String,
    text: String,
}

struct BlockLayout {
    setup: PageSetup,
    raw_lines: Vec<Line<'static>>,
    /// (source offset of a block start, raw line where its content begins)
    marks: Vec<(usize, usize)>,
    pending_marks: Vec<usize>,
    links: Vec<InternalLink>,
    spans: Vec<Span<'static>>,
    style: StyleState,
    heading: Option<(u8, String)>,
    code: Option<CodeBlock>,
    table: Option<Vec<Vec<String>>>,
    lists: Vec<ListKind>,
    item_prefix: Option<String>,
    quote_depth: usize,
}

impl BlockLayout {
    fn new(setup: PageSetup) -> Self {
        Self {
            setup,
            raw_lines: Vec::new(),
            marks: Vec::new(),
            pending_marks: Vec::new(),
            links: Vec::new(),
            spans: Vec::new(),
            style: StyleState::new(),
            heading: None,
            code: None,
            table: None,
            lists: Vec::new(),
            item_prefix: None,
            quote_depth: 0,
        }
    }

    fn handle(&mut self, event: Event<'_>, offset: usize) {
        match event {
            Event::Start(tag) => self.start(tag, offset),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => self.text(&text, self.style.current()),
            Event::Code(text) => {
                let style = self.style.current().add_modifier(Modifier::REVERSED);
                self.text(&text, style);
            }
            Event::SoftBreak => self.text(" ", self.style.current()),
            Event::HardBreak => self.flush(),
            Event::Rule => {
                self.pending_marks.push(offset);
                self.flush();
                let width = (self.setup.width as usize).min(48);
                self.emit(Line::from(Span::styled("─".repeat(width), dim())));
                self.blank();
            }
            Event::TaskListMarker(checked) => {
                let marker = if checked { "[x] " } else { "[ ] " };
                self.text(marker, dim());
            }
            Event::Html(html) | Event::InlineHtml(html) => self.text(html.trim_end(), dim()),
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>, offset: usize) {
        match tag {
            Tag::Paragraph | Tag::HtmlBlock | Tag::FootnoteDefinition(_) => {
                self.pending_marks.push(offset);
            }
            Tag::Heading { level, .. } => {
                self.flush();
                self.pending_marks.push(offset);
                self.heading = Some((level as u8, String::new()));
            }
            Tag::CodeBlock(kind) => {
                self.flush();
                self.pending_marks.push(offset);
                let lang = match kind {
                    CodeBlockKind::Fenced(lang) => lang.split_whitespace().next().unwrap_or("").to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.code = Some(CodeBlock {
                    lang,
                    text: String::new(),
                });
            }
            Tag::Table(_) => {
                self.flush();
                self.pending_marks.push(offset);
                self.table = Some(Vec::new());
            }
            Tag::TableHead | Tag::TableRow => {
                if let Some(rows) = self.table.as_mut() {
                    rows.push(Vec::new());
                }
            }
            Tag::TableCell => {
                if let Some(row) = self.table.as_mut().and_then(|rows| rows.last_mut()) {
                    row.push(String::new());
                }
            }
            Tag::List(start) => {
                self.flush();
                self.pending_marks.push(offset);
                self.lists.push(match start {
                    Some(next) => ListKind::Ordered { next },
                    None => ListKind::Bullet,
                });
            }
            Tag::Item => {
                self.flush();
                self.item_prefix = Some(self.next_item_prefix());
            }
            Tag::BlockQuote => {
                self.flush();
                self.pending_marks.push(offset);
                self.quote_depth += 1;
            }
            Tag::Emphasis => self.style.italic += 1,
            Tag::Strong => self.style.bold += 1,
            Tag::Strikethrough => self.style.strike += 1,
            Tag::Link {
                link_type,
                dest_url,
                ..
            } => {
                self.style.link += 1;
                if matches!(link_type, LinkType::Inline | LinkType::Reference | LinkType::Collapsed | LinkType::Shortcut) {
                    if let Some(label) = dest_url.strip_prefix('#') {
                        if !label.is_empty() {
                            self.links.push(InternalLink {
                                label: label.to_string(),
                                source_offset: offset,
                            });
                        }
                    }
                }
            }
            Tag::Image { dest_url, .. } => {
                let name = dest_url.rsplit('/').next().unwrap_or("").to_string();
                self.text(&format!("[image: {name}] "), dim());
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph | TagEnd::HtmlBlock | TagEnd::FootnoteDefinition => {
                if self.table.is_none() {
                    self.flush();
                    if self.lists.is_empty() {
                        self.blank();
                    }
                }
            }
            TagEnd::Heading(_) => {
                if let Some((level, text)) = self.heading.take() {
                    let text = text.trim().to_string();
                    let style = Style::default().add_modifier(Modifier::BOLD);
                    self.emit(Line::from(Span::styled(text.clone(), style)));
                    if level <= 2 {
                        let ch = if level == 1 { '═' } else { '─' };
                        let width = text.chars().count().clamp(4, self.setup.width as usize);
                        self.raw_lines
                            .push(Line::from(Span::styled(ch.to_string().repeat(width), dim())));
                    }
                    self.blank();
                }
            }
            TagEnd::CodeBlock => {
                if let Some(block) = self.code.take() {
                    self.emit_code(block);
                    self.blank();
                }
            }
            TagEnd::Table => {
                if let Some(rows) = self.table.take() {
                    self.emit_table(rows);
                    self.blank();
                }
            }
            TagEnd::List(_) => {
                self.flush();
                self.lists.pop();
                if self.lists.is_empty() {
                    self.blank();
                }
            }
            TagEnd::Item => {
                self.flush();
                self.item_prefix = None;
            }
            TagEnd::BlockQuote => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
                if self.quote_depth == 0 {
                    self.blank();
                }
            }
            TagEnd::Emphasis => self.style.italic = self.style.italic.saturating_sub(1),
            TagEnd::Strong => self.style.bold = self.style.bold.saturating_sub(1),
            TagEnd::Strikethrough => self.style.strike = self.style.strike.saturating_sub(1),
            TagEnd::Link => self.style.link = self.style.link.saturating_sub(1),
            _ => {}
        }
    }

    fn text(&mut self, text: &str, style: Style) {
        if let Some((_, heading)) = self.heading.as_mut() {
            heading.push_str(text);
            return;
        }
        if let Some(block) = self.code.as_mut() {
            block.text.push_str(text);
            return;
        }
        if let Some(cell) = self
            .table
            .as_mut()
            .and_then(|rows| rows.last_mut())
            .and_then(|row| row.last_mut())
        {
            cell.push_str(text);
            return;
        }
        if self.spans.is_empty() {
            let prefix = self.prefix();
            if !prefix.is_empty() {
                self.spans.push(Span::styled(prefix, dim()));
            }
        }
        self.spans
            .push(Span::styled(expand_tabs(text, self.setup.tab_width), style));
    }

    fn prefix(&self) -> String {
        let mut out = "│ ".repeat(self.quote_depth);
        if let Some(item) = &self.item_prefix {
            out.push_str(item);
        } else if !self.lists.is_empty() {
            out.push_str(&"  ".repeat(self.lists.len()));
        }
        out
    }

    fn next_item_prefix(&mut self) -> String {
        let depth = self.lists.len().max(1);
        let indent = "  ".repeat(depth - 1);
        let marker = match self.lists.last_mut() {
            Some(ListKind::Ordered { next }) => {
                let current = *next;
                *next = next.saturating_add(1);
                format!("{current}. ")
            }
            Some(ListKind::Bullet) | None => match depth % 2 {
                1 => "• ".to_string(),
                _ => "◦ ".to_string(),
            },
        };
        format!("{indent}{marker}")
    }

    fn flush(&mut self) {
        if self.spans.is_empty() {
            return;
        }
        let spans = std::mem::take(&mut self.spans);
        self.emit(Line::from(spans));
    }

    fn emit(&mut self, line: Line<'static>) {
        let idx = self.raw_lines.len();
        self.marks
            .extend(self.pending_marks.drain(..).map(|offset| (offset, idx)));
        self.raw_lines.push(line);
    }

    fn blank(&mut self) {
        if self.raw_lines.last().is_some_and(|line| line.spans.is_empty()) {
            return;
        }
        self.raw_lines.push(Line::default());
    }

    fn emit_code(&mut self, block: CodeBlock) {
        let style = Style::default().add_modifier(Modifier::DIM);
        if !block.lang.is_empty() {
            self.emit(Line::from(Span::styled(format!("┌ {}", block.lang), dim())));
        }
        let text = expand_tabs(block.text.trim_end_matches('\n'), self.setup.tab_width);
        for code_line in text.split('\n') {
            self.emit(Line::from(vec![
                Span::styled("│ ", dim()),
                Span::styled(code_line.to_string(), style),
            ]));
        }
    }

    fn emit_table(&mut self, rows: Vec<Vec<String>>) {
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        if columns == 0 {
            return;
        }
        let mut widths = vec![0usize; columns];
        for row in &rows {
            for (idx, cell) in row.iter().enumerate() {
                widths[idx] = widths[idx].max(UnicodeWidthStr::width(cell.trim()));
            }
        }
        for (row_idx, row) in rows.iter().enumerate() {
            let mut text = String::from("│");
            for (idx, width) in widths.iter().enumerate() {
                let cell = row.get(idx).map_or("", |c| c.trim());
                let pad = width.saturating_sub(UnicodeWidthStr::width(cell));
                text.push(' ');
                text.push_str(cell);
                text.push_str(&" ".repeat(pad));
                text.push_str(" │");
            }
            let style = if row_idx == 0 {
                Style::default().add_modifier(Modifier::BOLD)
            } else {
                Style::default()
            };
            self.emit(Line::from(Span::styled(text, style)));
            if row_idx == 0 {
                let rule: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
                self.raw_lines
                    .push(Line::from(Span::styled(format!("├{}┤", rule.join("┼")), dim())));
            }
        }
    }
}

fn dim() -> Style {
    Style::default().add_modifier(Modifier::DIM)
}

fn expand_tabs(text: &str, tab_width: usize) -> String {
    if !text.contains('\t') {
        return text.to_string();
    }
    text.replace('\t', &" ".repeat(tab_width.max(1)))
}

fn wrap_rows(lines: &[Line<'static>], width: usize) -> Vec<Vec<Line<'static>>> {
    lines.iter().map(|line| wrap_line(line, width)).collect()
}

fn wrap_line(line: &Line<'static>, width: usize) -> Vec<Line<'static>> {
    if width == 0 || line.width() <= width {
        return vec![line.clone()];
    }

    let mut out = Vec::new();
    let mut current: Vec<Span<'static>> = Vec::new();
    let mut current_width = 0usize;

    for (word, style) in tokens(line) {
        let word_width = UnicodeWidthStr::width(word.as_str());
        let is_space = word.chars().all(char::is_whitespace);
        if is_space {
            if current.is_empty() || current_width + word_width > width {
                continue;
            }
            current.push(Span::styled(word, style));
            current_width += word_width;
            continue;
        }
        if current_width + word_width > width && !current.is_empty() {
            out.push(finish_row(&mut current));
            current_width = 0;
        }
        if word_width <= width {
            current.push(Span::styled(word, style));
            current_width += word_width;
            continue;
        }
        let mut buf = String::new();
        let mut buf_width = 0usize;
        for ch in word.chars() {
            let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
            if buf_width + ch_width > width && !buf.is_empty() {
                out.push(Line::from(Span::styled(std::mem::take(&mut buf), style)));
                buf_width = 0;
            }
            buf.push(ch);
            buf_width += ch_width;
        }
        if !buf.is_empty() {
            current.push(Span::styled(buf, style));
            current_width = buf_width;
        }
    }
    if !current.is_empty() {
        out.push(finish_row(&mut current));
    }
    out
}

fn finish_row(current: &mut Vec<Span<'static>>) -> Line<'static> {
    while current
        .last()
        .is_some_and(|span| span.content.chars().all(char::is_whitespace))
    {
        current.pop();
    }
    Line::from(std::mem::take(current))
}

fn tokens(line: &Line<'static>) -> Vec<(String, Style)> {
    let mut out = Vec::new();
    for span in &line.spans {
        let mut buf = String::new();
        let mut in_space: Option<bool> = None;
        for ch in span.content.chars() {
            let space = ch.is_whitespace();
            if in_space.is_some_and(|prev| prev != space) {
                out.push((std::mem::take(&mut buf), span.style));
            }
            in_space = Some(space);
            buf.push(ch);
        }
        if !buf.is_empty() {
            out.push((buf, span.style));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_anchors;

    fn setup(width: u16, rows: u16) -> PageSetup {
        PageSetup {
            width,
            rows,
            tab_width: 4,
        }
    }

    fn render(source: &str, width: u16, rows: u16) -> (Vec<Anchor>, PagedDocument) {
        let anchors = extract_anchors(source);
        let doc = paginate(source, &anchors, setup(width, rows), &AbortSignal::new())
            .expect("not aborted");
        (anchors, doc)
    }

    fn plain(line: &Line<'static>) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    #[test]
    fn headings_land_on_their_rows() {
        let source = "# Title\n\nFirst paragraph.\n\n## Next\n\nMore.\n";
        let (anchors, doc) = render(source, 40, 100);
        let title = doc.locate(&AnchorId::from("title")).unwrap();
        let next = doc.locate(&AnchorId::from("next")).unwrap();
        assert_eq!(title, AnchorLocation { page: 0, y: 0.0 });
        assert!(next.y > title.y);
        let page = &doc.pages()[0];
        assert_eq!(plain(&page.lines[next.y as usize]), "Next");
        assert_eq!(anchors.len(), doc.locations.len());
    }

    #[test]
    fn rows_spill_onto_following_pages() {
        let mut source = String::new();
        for idx in 0..30 {
            source.push_str(&format!("Paragraph {idx}\n\n"));
        }
        let (anchors, doc) = render(&source, 40, 10);
        assert_eq!(doc.page_count(), 6);
        let last = anchors.last().unwrap();
        let location = doc.locate(&last.id).unwrap();
        assert_eq!(location.page, 5);
        assert!(location.y < 10.0);
    }

    #[test]
    fn long_lines_wrap_to_page_width() {
        let source = "one two three four five six seven eight nine ten\n";
        let (_, doc) = render(source, 12, 50);
        let rows: Vec<String> = doc.pages()[0].lines.iter().map(plain).collect();
        assert!(rows.iter().all(|row| UnicodeWidthStr::width(row.as_str()) <= 12));
        assert!(rows.len() >= 5);
    }

    #[test]
    fn internal_links_are_collected() {
        let source = "# Intro\n\nSee [setup](#setup) and [web](https://example.com).\n";
        let (_, doc) = render(source, 60, 50);
        let labels: Vec<&str> = doc.internal_links().iter().map(|l| l.label.as_str()).collect();
        assert_eq!(labels, vec!["setup"]);
    }

    #[test]
    fn aborted_signal_stops_layout() {
        let signal = AbortSignal::new();
        signal.abort();
        assert!(paginate("# Hi\n", &[], PageSetup::default(), &signal).is_none());
    }

    #[test]
    fn tables_and_code_render_as_rows() {
        let source = "| A | B |\n|---|---|\n| 1 | 2 |\n\n```rust\nfn main() {}\n```\n";
        let (_, doc) = render(source, 60, 50);
        let text = doc.to_plain_text();
        assert!(text.contains("│ A │ B │"));
        assert!(text.contains("┌ rust"));
        assert!(text.contains("│ fn main() {}"));
    }
}
