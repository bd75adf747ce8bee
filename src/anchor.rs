//! Stable identifiers shared between the source text and the rendered pages.
//!
//! Anchors are produced fresh by every successful compile and stamped with a
//! [`Generation`]. Offsets are only ever combined with anchors of the same
//! generation: [`AnchorIndex::pair`] is the single place where a source map
//! and an offset table meet, and it refuses mismatched generations.

use std::collections::HashMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorId(Arc<str>);

impl AnchorId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnchorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnchorId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AnchorId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A point in the source text that the compiler carries into its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
    pub id: AnchorId,
    /// Byte offset into the source text.
    pub source_offset: usize,
    /// Zero-based source line.
    pub line: usize,
    pub column: usize,
}

/// Monotonic counter of successful compiles within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Immutable anchor snapshot of one compile. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct SourceMap {
    generation: Generation,
    anchors: Vec<Anchor>,
    by_id: HashMap<AnchorId, usize>,
}

impl SourceMap {
    pub fn new(generation: Generation, mut anchors: Vec<Anchor>) -> Self {
        anchors.sort_by_key(|a| (a.line, a.source_offset));
        let by_id = anchors
            .iter()
            .enumerate()
            .map(|(idx, anchor)| (anchor.id.clone(), idx))
            .collect();
        Self {
            generation,
            anchors,
            by_id,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Anchors ordered by source line.
    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn get(&self, id: &AnchorId) -> Option<&Anchor> {
        self.by_id.get(id).map(|&idx| &self.anchors[idx])
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

/// Pixel offset of an anchor inside the preview scroll container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedOffset {
    pub offset: f32,
    pub page: usize,
}

/// Anchor id to pixel offset, built for exactly one [`Generation`].
///
/// Two anchors landing on the same offset stay distinct entries.
#[derive(Debug, Clone, Default)]
pub struct AnchorOffsetTable {
    generation: Generation,
    entries: HashMap<AnchorId, ResolvedOffset>,
}

impl AnchorOffsetTable {
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            entries: HashMap::new(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn insert(&mut self, id: AnchorId, offset: ResolvedOffset) {
        self.entries.insert(id, offset);
    }

    pub fn get(&self, id: &AnchorId) -> Option<ResolvedOffset> {
        self.entries.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AnchorId, &ResolvedOffset)> {
        self.entries.iter()
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("offset table {table} does not belong to source map {map}")]
pub struct GenerationMismatch {
    pub map: Generation,
    pub table: Generation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedAnchor {
    pub anchor: Anchor,
    pub offset: ResolvedOffset,
}

/// A source map joined with the offsets resolved for the same generation.
///
/// Only anchors that have an offset are indexed; everything else is
/// unreachable for scroll sync until the next resolution.
#[derive(Debug, Clone)]
pub struct AnchorIndex {
    generation: Generation,
    entries: Vec<IndexedAnchor>,
    by_offset: Vec<usize>,
}

impl AnchorIndex {
    pub fn pair(
        map: &SourceMap,
        table: &AnchorOffsetTable,
    ) -> Result<Self, GenerationMismatch> {
        if map.generation() != table.generation() {
            return Err(GenerationMismatch {
                map: map.generation(),
                table: table.generation(),
            });
        }

        let entries: Vec<IndexedAnchor> = map
            .anchors()
            .iter()
            .filter_map(|anchor| {
                table.get(&anchor.id).map(|offset| IndexedAnchor {
                    anchor: anchor.clone(),
                    offset,
                })
            })
            .collect();

        let mut by_offset: Vec<usize> = (0..entries.len()).collect();
        by_offset.sort_by(|&a, &b| entries[a].offset.offset.total_cmp(&entries[b].offset.offset));

        Ok(Self {
            generation: map.generation(),
            entries,
            by_offset,
        })
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[IndexedAnchor] {
        &self.entries
    }

    pub fn get(&self, id: &AnchorId) -> Option<&IndexedAnchor> {
        self.entries.iter().find(|entry| &entry.anchor.id == id)
    }

    /// Anchor closest to `line` among those inside `search`.
    ///
    /// Equidistant anchors resolve to the earlier one, i.e. the anchor at or
    /// above `line`.
    pub fn nearest_to_line(
        &self,
        line: usize,
        search: RangeInclusive<usize>,
    ) -> Option<&IndexedAnchor> {
        let mut best: Option<(&IndexedAnchor, usize)> = None;
        for entry in &self.entries {
            if !search.contains(&entry.anchor.line) {
                continue;
            }
            let dist = entry.anchor.line.abs_diff(line);
            match best {
                Some((_, best_dist)) if dist >= best_dist => {}
                _ => best = Some((entry, dist)),
            }
        }
        best.map(|(entry, _)| entry)
    }

    /// Anchor closest to `line` with no window restriction.
    pub fn nearest_any(&self, line: usize) -> Option<&IndexedAnchor> {
        self.nearest_to_line(line, 0..=usize::MAX)
    }

    /// Anchor at or just above the pixel offset `px`; when `px` lies above
    /// every anchor, the topmost one.
    pub fn at_offset(&self, px: f32) -> Option<&IndexedAnchor> {
        let first = *self.by_offset.first()?;
        let below = self
            .by_offset
            .partition_point(|&idx| self.entries[idx].offset.offset <= px);
        if below == 0 {
            return Some(&self.entries[first]);
        }
        let mut pick = below - 1;
        let target = self.entries[self.by_offset[pick]].offset.offset;
        while pick > 0 && self.entries[self.by_offset[pick - 1]].offset.offset == target {
            pick -= 1;
        }
        Some(&self.entries[self.by_offset[pick]])
    }
}
