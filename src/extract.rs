//! Anchor extraction from markdown source.
//!
//! Every block the preview can scroll to gets an anchor at its first source
//! line. Headings use GitHub-style slugs so `[text](#slug)` links resolve
//! against the same id space.

use crate::anchor::{Anchor, AnchorId};
use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use std::collections::HashMap;
use std::ops::Range;

pub const DOC_START: &str = "tf-doc-start";

pub fn parser_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_HEADING_ATTRIBUTES
}

/// Byte offset to (line, column) lookups over one source text.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(idx, _)| idx + 1),
        );
        Self { starts }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }

    pub fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&start| start <= offset).saturating_sub(1)
    }

    /// Column is counted in chars from the line start.
    pub fn line_col(&self, source: &str, offset: usize) -> (usize, usize) {
        let line = self.line_of(offset);
        let start = self.starts[line];
        let end = offset.min(source.len());
        let column = source.get(start..end).map_or(0, |s| s.chars().count());
        (line, column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frontmatter {
    Absent,
    /// Body starts at this byte offset.
    Closed { body_start: usize },
    /// Opening `---` with no closing fence.
    Unterminated { line: usize },
}

/// A leading `---` only opens frontmatter when the next non-blank line is a
/// `key:` pair or the closing fence; otherwise it is a thematic break.
pub fn frontmatter(source: &str) -> Frontmatter {
    let trimmed = source.trim_start();
    let open = source.len() - trimmed.len();
    let first_line = trimmed.lines().next().unwrap_or("");
    if first_line.trim_end() != "---" {
        return Frontmatter::Absent;
    }
    let after_open = open + first_line.len();
    let rest = &source[after_open..];
    let next = rest.lines().map(str::trim).find(|line| !line.is_empty());
    if !next.is_some_and(|line| line == "---" || is_yaml_key(line)) {
        return Frontmatter::Absent;
    }
    match rest.find("\n---") {
        Some(rel) => {
            let mut body_start = after_open + rel + 4;
            if source.as_bytes().get(body_start) == Some(&b'\r') {
                body_start += 1;
            }
            if source.as_bytes().get(body_start) == Some(&b'\n') {
                body_start += 1;
            }
            Frontmatter::Closed { body_start }
        }
        None => Frontmatter::Unterminated {
            line: LineIndex::new(source).line_of(open),
        },
    }
}

fn is_yaml_key(line: &str) -> bool {
    line.split_once(':').is_some_and(|(key, _)| {
        !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    })
}

/// Offset where markdown content begins, skipping a closed frontmatter block.
pub fn body_start(source: &str) -> usize {
    match frontmatter(source) {
        Frontmatter::Closed { body_start } => body_start,
        Frontmatter::Absent | Frontmatter::Unterminated { .. } => 0,
    }
}

pub fn extract_anchors(source: &str) -> Vec<Anchor> {
    let start = body_start(source);
    let mut extractor = Extractor::new(source);
    extractor.push_doc_start(start);

    let body = &source[start..];
    for (event, range) in Parser::new_ext(body, parser_options()).into_offset_iter() {
        let range = (range.start + start)..(range.end + start);
        extractor.handle(event, range);
    }
    extractor.anchors
}

struct HeadingCapture {
    start: usize,
    explicit: Option<String>,
    text: String,
}

struct Extractor<'a> {
    source: &'a str,
    lines: LineIndex,
    anchors: Vec<Anchor>,
    claimed: HashMap<usize, Claim>,
    slugs: HashMap<String, usize>,
    heading: Option<HeadingCapture>,
    quote_depth: usize,
    table_depth: usize,
    code_blocks: usize,
    images: usize,
    rules: usize,
    tables: usize,
}

impl<'a> Extractor<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            lines: LineIndex::new(source),
            anchors: Vec::new(),
            claimed: HashMap::new(),
            slugs: HashMap::new(),
            heading: None,
            quote_depth: 0,
            table_depth: 0,
            code_blocks: 0,
            images: 0,
            rules: 0,
            tables: 0,
        }
    }

    fn handle(&mut self, event: Event<'_>, range: Range<usize>) {
        match event {
            Event::Start(Tag::Heading { id, .. }) => {
                self.heading = Some(HeadingCapture {
                    start: range.start,
                    explicit: id.map(|id| id.to_string()),
                    text: String::new(),
                });
            }
            Event::Text(text) | Event::Code(text) => {
                if let Some(heading) = self.heading.as_mut() {
                    heading.text.push_str(&text);
                }
            }
            Event::End(TagEnd::Heading(_)) => self.finish_heading(),
            Event::Rule => {
                self.rules += 1;
                let id = format!("tf-hr-{}", self.rules);
                self.push(range.start, id);
            }
            Event::Start(Tag::CodeBlock(kind)) => {
                self.code_blocks += 1;
                let id = match kind {
                    CodeBlockKind::Fenced(lang) => match lang.split_whitespace().next() {
                        Some(lang) => format!("tf-code-{lang}-{}", self.code_blocks),
                        None => format!("tf-code-{}", self.code_blocks),
                    },
                    CodeBlockKind::Indented => format!("tf-code-{}", self.code_blocks),
                };
                self.push(range.start, id);
            }
            Event::Start(Tag::Image { dest_url, .. }) => {
                self.images += 1;
                let stem = image_stem(&dest_url);
                let id = if stem.is_empty() {
                    format!("tf-img-{}", self.images)
                } else {
                    format!("tf-img-{stem}-{}", self.images)
                };
                self.push(range.start, id);
            }
            Event::Start(Tag::Table(_)) => {
                if self.table_depth == 0 && self.quote_depth == 0 {
                    self.tables += 1;
                    let id = format!("tf-table-{}", self.tables);
                    self.push(range.start, id);
                }
                self.table_depth += 1;
            }
            Event::End(TagEnd::Table) => {
                self.table_depth = self.table_depth.saturating_sub(1);
            }
            Event::Start(Tag::BlockQuote) => {
                if self.quote_depth == 0 && self.table_depth == 0 {
                    self.push_generic(range.start);
                }
                self.quote_depth += 1;
            }
            Event::End(TagEnd::BlockQuote) => {
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            Event::Start(Tag::Paragraph | Tag::List(_) | Tag::FootnoteDefinition(_) | Tag::HtmlBlock) => {
                if self.quote_depth == 0 && self.table_depth == 0 {
                    self.push_generic(range.start);
                }
            }
            _ => {}
        }
    }

    fn finish_heading(&mut self) {
        let Some(heading) = self.heading.take() else {
            return;
        };
        let base = heading
            .explicit
            .unwrap_or_else(|| slugify(&heading.text));
        if base.is_empty() {
            return;
        }
        let seen = self.slugs.entry(base.clone()).or_insert(0);
        let slug = if *seen == 0 {
            base
        } else {
            format!("{base}-{seen}")
        };
        *seen += 1;
        self.push(heading.start, slug);
    }

    /// The document start never claims its line, so a heading on the first
    /// line still gets its own slug.
    fn push_doc_start(&mut self, offset: usize) {
        let (line, column) = self.lines.line_col(self.source, offset);
        self.anchors.push(Anchor {
            id: AnchorId::from(DOC_START),
            source_offset: offset,
            line,
            column,
        });
    }

    fn push_generic(&mut self, offset: usize) {
        let id = format!("tf-{offset}-{}", self.anchors.len());
        self.claim(offset, id, true);
    }

    fn push(&mut self, offset: usize, id: String) {
        self.claim(offset, id, false);
    }

    /// At most one anchor per source line. A named anchor takes over a line
    /// claimed by a generic block anchor; otherwise the first claim wins.
    fn claim(&mut self, offset: usize, id: String, generic: bool) {
        let (line, column) = self.lines.line_col(self.source, offset);
        match self.claimed.get_mut(&line) {
            Some(claim) if claim.generic && !generic => {
                self.anchors[claim.index].id = AnchorId::from(id);
                claim.generic = false;
            }
            Some(_) => {}
            None => {
                self.claimed.insert(
                    line,
                    Claim {
                        index: self.anchors.len(),
                        generic,
                    },
                );
                self.anchors.push(Anchor {
                    id: AnchorId::from(id),
                    source_offset: offset,
                    line,
                    column,
                });
            }
        }
    }
}

struct Claim {
    index: usize,
    generic: bool,
}

fn image_stem(dest: &str) -> String {
    let file = dest.rsplit('/').next().unwrap_or("");
    let stem = file.split('.').next().unwrap_or("");
    stem.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(20)
        .collect()
}

/// GitHub-style heading slug: lowercase alphanumerics joined by single dashes.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut dash = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            dash = false;
        } else if matches!(c, '-' | '/' | '\\' | '—' | '–') || c.is_whitespace() {
            if !slug.is_empty() && !dash {
                slug.push('-');
                dash = true;
            }
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ids(anchors: &[Anchor]) -> Vec<&str> {
        anchors.iter().map(|a| a.id.as_str()).collect()
    }

    #[rstest]
    #[case("Hello World", "hello-world")]
    #[case("API Reference", "api-reference")]
    #[case("What's New?", "whats-new")]
    #[case("  -- Leading / trailing --  ", "leading-trailing")]
    #[case("Ünïcode Title", "ünïcode-title")]
    fn slugify_matches_github_style(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(slugify(input), expected);
    }

    #[test]
    fn document_start_and_headings_get_anchors() {
        let anchors = extract_anchors("# Hello\n\nWorld\n");
        assert_eq!(ids(&anchors)[..2], ["tf-doc-start", "hello"]);
        let hello = &anchors[1];
        assert_eq!((hello.line, hello.column, hello.source_offset), (0, 0, 0));
        let world = &anchors[2];
        assert!(world.id.as_str().starts_with("tf-9-"));
        assert_eq!(world.line, 2);
    }

    #[test]
    fn doc_start_shares_the_first_line() {
        let anchors = extract_anchors("Just a paragraph\n");
        assert_eq!(ids(&anchors), vec!["tf-doc-start", "tf-0-1"]);
        assert_eq!(anchors[0].source_offset, anchors[1].source_offset);
    }

    #[test]
    fn duplicate_headings_are_numbered() {
        let anchors = extract_anchors("intro\n\n# Intro\n\n# Intro\n\n# Intro\n");
        let ids = ids(&anchors);
        assert!(ids.contains(&"intro"));
        assert!(ids.contains(&"intro-1"));
        assert!(ids.contains(&"intro-2"));
    }

    #[test]
    fn explicit_heading_id_wins() {
        let anchors = extract_anchors("text\n\n## Setup {#install}\n");
        assert!(ids(&anchors).contains(&"install"));
    }

    #[test]
    fn blocks_are_labelled_by_kind() {
        let source = "intro\n\n---\n\n```rust\nfn main() {}\n```\n\n![shot](img/screen.png)\n";
        let anchors = extract_anchors(source);
        let ids = ids(&anchors);
        assert!(ids.contains(&"tf-hr-1"));
        assert!(ids.contains(&"tf-code-rust-1"));
        assert!(ids.contains(&"tf-img-screen-1"));
    }

    #[test]
    fn quoted_paragraphs_share_the_quote_anchor() {
        let source = "intro\n\n> first\n>\n> second\n";
        let anchors = extract_anchors(source);
        let quoted: Vec<&Anchor> = anchors.iter().filter(|a| a.line >= 2).collect();
        assert_eq!(quoted.len(), 1);
        assert_eq!(quoted[0].line, 2);
    }

    #[test]
    fn list_items_do_not_get_their_own_anchor() {
        let source = "intro\n\n- one\n- two\n- three\n";
        let anchors = extract_anchors(source);
        let in_list: Vec<usize> = anchors.iter().filter(|a| a.line >= 2).map(|a| a.line).collect();
        assert_eq!(in_list, vec![2]);
    }

    #[test]
    fn frontmatter_is_skipped_but_offsets_stay_absolute() {
        let source = "---\ntitle: Test\n---\n# Hello\n";
        let anchors = extract_anchors(source);
        assert_eq!(anchors[0].id.as_str(), DOC_START);
        assert_eq!(anchors[0].line, 3);
        assert!(anchors.iter().all(|a| a.line >= 3));
    }

    #[test]
    fn unterminated_frontmatter_is_reported() {
        assert_eq!(
            frontmatter("\n---\ntitle: x\n# body"),
            Frontmatter::Unterminated { line: 1 }
        );
        assert_eq!(frontmatter("# plain"), Frontmatter::Absent);
        assert_eq!(
            frontmatter("---\na: 1\n---\nrest"),
            Frontmatter::Closed { body_start: 13 }
        );
    }

    #[test]
    fn leading_rule_is_not_frontmatter() {
        assert_eq!(frontmatter("---\n\nSome notes after a rule.\n"), Frontmatter::Absent);
        assert_eq!(frontmatter("---\n\nIntro\n\n---\n\nMore\n"), Frontmatter::Absent);
        assert_eq!(frontmatter("----\ntitle: x\n"), Frontmatter::Absent);
        assert_eq!(body_start("---\n\nSome notes after a rule.\n"), 0);
    }

    #[test]
    fn line_index_counts_chars_for_columns() {
        let source = "ab\nçdé\n";
        let lines = LineIndex::new(source);
        assert_eq!(lines.line_count(), 3);
        assert_eq!(lines.line_col(source, 0), (0, 0));
        assert_eq!(lines.line_col(source, 3), (1, 0));
        let e_offset = source.find('é').unwrap();
        assert_eq!(lines.line_col(source, e_offset), (1, 2));
    }
}
