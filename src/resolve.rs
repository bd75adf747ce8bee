//! Anchor offset resolution against the preview's page layout.
//!
//! Layout is not trusted to be final right after a compile, so resolution is
//! a bounded retry: a fixed number of attempts inside a hard time limit,
//! ending in the best table seen even when it never became complete.

use crate::anchor::{AnchorId, AnchorOffsetTable, ResolvedOffset, SourceMap};
use crate::config::SyncConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Placement of one page inside the preview scroll container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageMetric {
    /// Pixel offset of the page's top edge.
    pub top: f32,
    /// Page height in layout units.
    pub height: f32,
    /// Pixels per layout unit.
    pub scale: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageMetrics {
    pub pages: Vec<PageMetric>,
    /// `false` while the renderer may still move pages around.
    pub settled: bool,
}

/// Where the renderer placed an anchor: page index and layout units from
/// that page's top.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorLocation {
    pub page: usize,
    pub y: f32,
}

pub trait PageLayout {
    fn page_metrics(&self) -> PageMetrics;
    fn locate_anchor(&self, id: &AnchorId) -> Option<AnchorLocation>;
}

#[derive(Debug, Clone)]
pub struct Attempt {
    pub table: AnchorOffsetTable,
    pub complete: bool,
}

/// One resolution pass. Locations outside the page range clamp to the
/// nearest page edge.
pub fn resolve_offsets<L: PageLayout + ?Sized>(map: &SourceMap, layout: &L) -> Attempt {
    let metrics = layout.page_metrics();
    let mut table = AnchorOffsetTable::new(map.generation());
    let Some(last) = metrics.pages.len().checked_sub(1) else {
        return Attempt {
            table,
            complete: false,
        };
    };

    let mut complete = metrics.settled;
    for anchor in map.anchors() {
        let Some(location) = layout.locate_anchor(&anchor.id) else {
            complete = false;
            continue;
        };
        let (page, y) = if location.page > last {
            (last, metrics.pages[last].height)
        } else {
            let metric = &metrics.pages[location.page];
            (location.page, location.y.clamp(0.0, metric.height.max(0.0)))
        };
        let metric = &metrics.pages[page];
        table.insert(
            anchor.id.clone(),
            ResolvedOffset {
                offset: metric.top + y * metric.scale,
                page,
            },
        );
    }
    Attempt { table, complete }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveSettings {
    pub interval: Duration,
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl From<&SyncConfig> for ResolveSettings {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            interval: cfg.resolve_interval(),
            max_attempts: cfg.resolve_attempts.max(1),
            timeout: cfg.resolve_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub table: AnchorOffsetTable,
    /// `false` when the attempts ran out before layout settled.
    pub complete: bool,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub enum ResolvePoll {
    Pending { next_at: Instant },
    Ready(Resolution),
}

/// Bounded polling resolution for one source map.
#[derive(Debug)]
pub struct ResolveTask {
    map: Arc<SourceMap>,
    settings: ResolveSettings,
    started: Instant,
    next_at: Instant,
    attempts: u32,
    best: Option<AnchorOffsetTable>,
}

impl ResolveTask {
    pub fn new(map: Arc<SourceMap>, settings: ResolveSettings, now: Instant) -> Self {
        Self {
            map,
            settings,
            started: now,
            next_at: now,
            attempts: 0,
            best: None,
        }
    }

    pub fn source_map(&self) -> &Arc<SourceMap> {
        &self.map
    }

    pub fn next_at(&self) -> Instant {
        self.next_at
    }

    pub fn poll<L: PageLayout + ?Sized>(&mut self, layout: &L, now: Instant) -> ResolvePoll {
        if now < self.next_at {
            return ResolvePoll::Pending {
                next_at: self.next_at,
            };
        }

        let attempt = resolve_offsets(&self.map, layout);
        self.attempts += 1;
        if attempt.complete {
            tracing::debug!(
                generation = %self.map.generation(),
                attempts = self.attempts,
                anchors = attempt.table.len(),
                "anchor offsets resolved"
            );
            return ResolvePoll::Ready(Resolution {
                table: attempt.table,
                complete: true,
                attempts: self.attempts,
            });
        }
        if self
            .best
            .as_ref()
            .is_none_or(|best| attempt.table.len() >= best.len())
        {
            self.best = Some(attempt.table);
        }

        let out_of_time = now.duration_since(self.started) >= self.settings.timeout;
        if self.attempts >= self.settings.max_attempts || out_of_time {
            let table = self
                .best
                .take()
                .unwrap_or_else(|| AnchorOffsetTable::new(self.map.generation()));
            tracing::debug!(
                generation = %self.map.generation(),
                attempts = self.attempts,
                anchors = table.len(),
                "anchor resolution gave up, using best effort"
            );
            return ResolvePoll::Ready(Resolution {
                table,
                complete: false,
                attempts: self.attempts,
            });
        }

        self.next_at = now + self.settings.interval;
        ResolvePoll::Pending {
            next_at: self.next_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{Anchor, Generation};
    use std::cell::Cell;
    use std::collections::HashMap;

    struct FakeLayout {
        metrics: PageMetrics,
        locations: HashMap<AnchorId, AnchorLocation>,
        settle_after: Cell<u32>,
    }

    impl FakeLayout {
        fn new(pages: usize, locations: &[(&str, usize, f32)]) -> Self {
            Self {
                metrics: PageMetrics {
                    pages: (0..pages)
                        .map(|idx| PageMetric {
                            top: idx as f32 * 1_000.0,
                            height: 100.0,
                            scale: 9.0,
                        })
                        .collect(),
                    settled: true,
                },
                locations: locations
                    .iter()
                    .map(|(id, page, y)| (AnchorId::from(*id), AnchorLocation { page: *page, y: *y }))
                    .collect(),
                settle_after: Cell::new(0),
            }
        }
    }

    impl PageLayout for FakeLayout {
        fn page_metrics(&self) -> PageMetrics {
            let remaining = self.settle_after.get();
            let mut metrics = self.metrics.clone();
            if remaining > 0 {
                self.settle_after.set(remaining - 1);
                metrics.settled = false;
            }
            metrics
        }

        fn locate_anchor(&self, id: &AnchorId) -> Option<AnchorLocation> {
            self.locations.get(id).copied()
        }
    }

    fn map(ids: &[&str]) -> Arc<SourceMap> {
        let anchors = ids
            .iter()
            .enumerate()
            .map(|(line, id)| Anchor {
                id: AnchorId::from(*id),
                source_offset: line,
                line,
                column: 0,
            })
            .collect();
        Arc::new(SourceMap::new(Generation::new(1), anchors))
    }

    fn settings() -> ResolveSettings {
        ResolveSettings {
            interval: Duration::from_millis(120),
            max_attempts: 8,
            timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn offsets_combine_page_top_and_scaled_y() {
        let layout = FakeLayout::new(2, &[("a", 0, 10.0), ("b", 1, 20.0)]);
        let attempt = resolve_offsets(&map(&["a", "b"]), &layout);
        assert!(attempt.complete);
        assert_eq!(attempt.table.get(&AnchorId::from("a")).unwrap().offset, 90.0);
        let b = attempt.table.get(&AnchorId::from("b")).unwrap();
        assert_eq!((b.offset, b.page), (1_180.0, 1));
    }

    #[test]
    fn locations_past_the_last_page_clamp_to_its_bottom() {
        let layout = FakeLayout::new(2, &[("late", 5, 3.0), ("deep", 0, 500.0)]);
        let attempt = resolve_offsets(&map(&["late", "deep"]), &layout);
        let late = attempt.table.get(&AnchorId::from("late")).unwrap();
        assert_eq!((late.offset, late.page), (1_900.0, 1));
        assert_eq!(attempt.table.get(&AnchorId::from("deep")).unwrap().offset, 900.0);
    }

    #[test]
    fn shared_offsets_keep_both_entries() {
        let layout = FakeLayout::new(1, &[("a", 0, 4.0), ("b", 0, 4.0)]);
        let attempt = resolve_offsets(&map(&["a", "b"]), &layout);
        assert_eq!(attempt.table.len(), 2);
    }

    #[test]
    fn no_pages_is_incomplete() {
        let layout = FakeLayout::new(0, &[("a", 0, 4.0)]);
        let attempt = resolve_offsets(&map(&["a"]), &layout);
        assert!(!attempt.complete);
        assert!(attempt.table.is_empty());
    }

    #[test]
    fn task_retries_until_layout_settles() {
        let layout = FakeLayout::new(1, &[("a", 0, 1.0)]);
        layout.settle_after.set(1);
        let start = Instant::now();
        let mut task = ResolveTask::new(map(&["a"]), settings(), start);

        let next_at = match task.poll(&layout, start) {
            ResolvePoll::Pending { next_at } => next_at,
            ResolvePoll::Ready(_) => panic!("layout was not settled yet"),
        };
        assert_eq!(next_at, start + Duration::from_millis(120));
        assert!(matches!(
            task.poll(&layout, start + Duration::from_millis(60)),
            ResolvePoll::Pending { .. }
        ));
        match task.poll(&layout, next_at) {
            ResolvePoll::Ready(resolution) => {
                assert!(resolution.complete);
                assert_eq!(resolution.attempts, 2);
            }
            ResolvePoll::Pending { .. } => panic!("expected resolution"),
        }
    }

    #[test]
    fn task_commits_best_effort_after_timeout() {
        let layout = FakeLayout::new(1, &[("a", 0, 1.0)]);
        let start = Instant::now();
        let mut task = ResolveTask::new(map(&["a", "missing"]), settings(), start);
        let mut now = start;
        let resolution = loop {
            match task.poll(&layout, now) {
                ResolvePoll::Pending { next_at } => now = next_at,
                ResolvePoll::Ready(resolution) => break resolution,
            }
        };
        assert!(!resolution.complete);
        assert_eq!(resolution.table.len(), 1);
        assert!(now.duration_since(start) <= Duration::from_millis(240));
        assert!(resolution.attempts <= 8);
    }
}
