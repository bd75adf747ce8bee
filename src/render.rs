//! Render coalescing.
//!
//! Edits settle for a short quiet period before they are submitted. At most
//! one compile runs at a time; text submitted meanwhile lands in a single
//! pending slot where newer text overwrites older, so only the latest text
//! is ever compiled next.

use crate::anchor::{Generation, SourceMap};
use crate::compiler::{
    AbortSignal, CompileError, CompileJob, CompileRequest, FinishedJob, JobId, RenderedOutput,
};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileFailure {
    pub message: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub enum RenderStatus {
    Idle,
    Running,
    Ok(RenderedOutput),
    Error(CompileFailure),
}

impl RenderStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RenderStatus::Idle => "idle",
            RenderStatus::Running => "running",
            RenderStatus::Ok(_) => "ok",
            RenderStatus::Error(_) => "error",
        }
    }

    pub fn output(&self) -> Option<&RenderedOutput> {
        match self {
            RenderStatus::Ok(output) => Some(output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Leaves the current output in place. `cause` keys notice rate limiting.
    Recoverable { cause: String },
    Blocking,
}

static RECOVERABLE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"label [`<]*([^\s`<>]+)[`>]* does not exist",
        r"undefined reference(?: to)? [`'<]*([^\s`'<>]+)",
        r"unknown reference(?: to)? [`'<]*([^\s`'<>]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

pub fn classify(message: &str) -> ErrorClass {
    RECOVERABLE
        .iter()
        .find_map(|re| re.captures(message))
        .map_or(ErrorClass::Blocking, |caps| ErrorClass::Recoverable {
            cause: caps
                .get(1)
                .map_or_else(|| message.to_string(), |m| m.as_str().to_string()),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub cause: String,
    pub message: String,
}

/// Lets a notice through at most once per cause per window.
#[derive(Debug)]
pub struct NoticeLimiter {
    window: Duration,
    last_shown: HashMap<String, Instant>,
}

impl NoticeLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_shown: HashMap::new(),
        }
    }

    pub fn admit(&mut self, cause: &str, now: Instant) -> bool {
        let window = self.window;
        self.last_shown
            .retain(|_, shown| now.duration_since(*shown) < window);
        if self.last_shown.contains_key(cause) {
            return false;
        }
        self.last_shown.insert(cause.to_string(), now);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingText {
    pub text: String,
    pub change_generation: u64,
}

#[derive(Debug)]
struct InFlight {
    id: JobId,
    change_generation: u64,
    signal: AbortSignal,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Published {
        source_map: Arc<SourceMap>,
        rendered: RenderedOutput,
        /// First successful compile of the session.
        first: bool,
    },
    /// Recoverable failure; the previous output stays. `notice` is `None`
    /// when the same cause was already shown recently.
    Suppressed { notice: Option<Notice> },
    /// Blocking failure; the previous output is gone.
    Failed(CompileFailure),
    Aborted,
    /// A result for a job this coalescer no longer tracks.
    Stale,
}

#[derive(Debug)]
pub struct Completion {
    pub outcome: Outcome,
    /// Job to launch next, built from the pending slot.
    pub next: Option<CompileJob>,
}

#[derive(Debug)]
pub struct RenderCoalescer {
    settle: Duration,
    context_path: Option<PathBuf>,
    next_id: JobId,
    in_flight: Option<InFlight>,
    pending: Option<PendingText>,
    draft: Option<PendingText>,
    settle_deadline: Option<Instant>,
    generation: Generation,
    status: RenderStatus,
    settled: RenderStatus,
    limiter: NoticeLimiter,
}

impl RenderCoalescer {
    pub fn new(settle: Duration, notice_window: Duration, context_path: Option<PathBuf>) -> Self {
        Self {
            settle,
            context_path,
            next_id: JobId::new(1),
            in_flight: None,
            pending: None,
            draft: None,
            settle_deadline: None,
            generation: Generation::default(),
            status: RenderStatus::Idle,
            settled: RenderStatus::Idle,
            limiter: NoticeLimiter::new(notice_window),
        }
    }

    pub fn status(&self) -> &RenderStatus {
        &self.status
    }

    /// Generation of the last published source map.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending(&self) -> Option<&PendingText> {
        self.pending.as_ref()
    }

    pub fn settle_deadline(&self) -> Option<Instant> {
        self.settle_deadline
    }

    pub fn set_context_path(&mut self, path: Option<PathBuf>) {
        self.context_path = path;
    }

    /// Restarts the edit-settle window with the latest text.
    pub fn note_edit(&mut self, text: String, change_generation: u64, now: Instant) {
        self.draft = Some(PendingText {
            text,
            change_generation,
        });
        self.settle_deadline = Some(now + self.settle);
    }

    /// Submits the draft once its settle window has passed.
    pub fn tick(&mut self, now: Instant) -> Option<CompileJob> {
        let deadline = self.settle_deadline?;
        if now < deadline {
            return None;
        }
        self.settle_deadline = None;
        let draft = self.draft.take()?;
        self.submit(draft.text, draft.change_generation)
    }

    /// Skips the settle window.
    pub fn force(&mut self, text: String, change_generation: u64) -> Option<CompileJob> {
        self.draft = None;
        self.settle_deadline = None;
        self.submit(text, change_generation)
    }

    pub fn submit(&mut self, text: String, change_generation: u64) -> Option<CompileJob> {
        if let Some(running) = &self.in_flight {
            if let Some(old) = &self.pending {
                tracing::debug!(
                    superseded = old.change_generation,
                    by = change_generation,
                    "pending text superseded"
                );
            } else {
                tracing::debug!(in_flight = %running.id, change_generation, "compile queued behind in-flight job");
            }
            self.pending = Some(PendingText {
                text,
                change_generation,
            });
            return None;
        }
        Some(self.launch(text, change_generation))
    }

    fn launch(&mut self, text: String, change_generation: u64) -> CompileJob {
        let id = self.next_id;
        self.next_id = id.next();
        let signal = AbortSignal::new();
        self.in_flight = Some(InFlight {
            id,
            change_generation,
            signal: signal.clone(),
        });
        self.status = RenderStatus::Running;
        tracing::debug!(%id, change_generation, "compile launched");
        CompileJob {
            id,
            request: CompileRequest {
                text,
                context_path: self.context_path.clone(),
            },
            change_generation,
            signal,
        }
    }

    pub fn complete(&mut self, finished: FinishedJob, now: Instant) -> Completion {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|running| running.id == finished.id);
        if !matches {
            tracing::debug!(id = %finished.id, "ignoring result of untracked job");
            return Completion {
                outcome: Outcome::Stale,
                next: None,
            };
        }
        let change_generation = self
            .in_flight
            .take()
            .map_or(0, |running| running.change_generation);

        let outcome = match finished.result {
            Ok(output) => {
                let first = self.generation == Generation::default();
                self.generation = self.generation.next();
                let source_map = Arc::new(SourceMap::new(self.generation, output.anchors));
                tracing::info!(
                    generation = %self.generation,
                    change_generation,
                    anchors = source_map.len(),
                    pages = output.rendered.page_count(),
                    "render published"
                );
                self.settled = RenderStatus::Ok(output.rendered.clone());
                self.status = self.settled.clone();
                Outcome::Published {
                    source_map,
                    rendered: output.rendered,
                    first,
                }
            }
            Err(CompileError::Aborted) => {
                tracing::debug!(change_generation, "compile aborted");
                self.status = self.settled.clone();
                Outcome::Aborted
            }
            Err(CompileError::Diagnostic { message, detail }) => match classify(&message) {
                ErrorClass::Recoverable { cause } => {
                    self.status = self.settled.clone();
                    let notice = self.limiter.admit(&cause, now).then(|| Notice {
                        cause: cause.clone(),
                        message: message.clone(),
                    });
                    tracing::debug!(%cause, shown = notice.is_some(), "recoverable compile error");
                    Outcome::Suppressed { notice }
                }
                ErrorClass::Blocking => {
                    tracing::warn!(%message, %detail, "compile failed");
                    let failure = CompileFailure { message, detail };
                    self.settled = RenderStatus::Error(failure.clone());
                    self.status = self.settled.clone();
                    Outcome::Failed(failure)
                }
            },
        };

        let next = self
            .pending
            .take()
            .map(|pending| self.launch(pending.text, pending.change_generation));
        Completion { outcome, next }
    }

    /// Aborts the in-flight compile and drops everything queued.
    pub fn shutdown(&mut self) {
        if let Some(running) = self.in_flight.take() {
            tracing::debug!(id = %running.id, "aborting in-flight compile");
            running.signal.abort();
        }
        self.pending = None;
        self.draft = None;
        self.settle_deadline = None;
        self.status = self.settled.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{Anchor, AnchorId};
    use crate::compiler::CompileOutput;
    use crate::paginate::{PageSetup, paginate};
    use rstest::rstest;

    const SETTLE: Duration = Duration::from_millis(400);
    const WINDOW: Duration = Duration::from_secs(3);

    fn coalescer() -> RenderCoalescer {
        RenderCoalescer::new(SETTLE, WINDOW, None)
    }

    fn output(text: &str) -> CompileOutput {
        let anchors = vec![Anchor {
            id: AnchorId::from("a"),
            source_offset: 0,
            line: 0,
            column: 0,
        }];
        let document = paginate(text, &anchors, PageSetup::default(), &AbortSignal::new()).unwrap();
        CompileOutput {
            rendered: RenderedOutput::new(document, None),
            anchors,
        }
    }

    fn ok(job: &CompileJob) -> FinishedJob {
        FinishedJob {
            id: job.id,
            result: Ok(output(&job.request.text)),
        }
    }

    fn failed(job: &CompileJob, message: &str) -> FinishedJob {
        FinishedJob {
            id: job.id,
            result: Err(CompileError::diagnostic(message, "detail")),
        }
    }

    #[test]
    fn rapid_submits_compile_only_the_latest_text() {
        let now = Instant::now();
        let mut render = coalescer();
        let first = render.submit("v1".into(), 1).unwrap();
        for (change, text) in [(2, "v2"), (3, "v3"), (4, "v4")] {
            assert!(render.submit(text.into(), change).is_none());
        }
        assert_eq!(render.pending().map(|p| p.text.as_str()), Some("v4"));

        let done = render.complete(ok(&first), now);
        let next = done.next.expect("pending text launches");
        assert_eq!(next.request.text, "v4");
        assert_eq!(next.change_generation, 4);

        let done = render.complete(ok(&next), now);
        assert!(done.next.is_none());
        assert!(!render.is_in_flight());
    }

    #[test]
    fn never_more_than_one_job_in_flight() {
        let now = Instant::now();
        let mut render = coalescer();
        let mut running: Option<CompileJob> = None;
        let mut launched = 0;
        for step in 0..50u64 {
            if let Some(job) = render.submit(format!("text {step}"), step) {
                assert!(running.is_none(), "second job launched while one runs");
                running = Some(job);
                launched += 1;
            }
            if step % 7 == 6 {
                if let Some(job) = running.take() {
                    running = render.complete(ok(&job), now).next;
                    if running.is_some() {
                        launched += 1;
                    }
                }
            }
        }
        assert!(launched < 50);
        assert!(render.is_in_flight());
    }

    #[test]
    fn edits_wait_for_the_settle_window() {
        let start = Instant::now();
        let mut render = coalescer();
        render.note_edit("a".into(), 1, start);
        render.note_edit("ab".into(), 2, start + Duration::from_millis(300));
        assert!(render.tick(start + Duration::from_millis(600)).is_none());
        let job = render.tick(start + Duration::from_millis(700)).unwrap();
        assert_eq!(job.request.text, "ab");
        assert!(render.tick(start + Duration::from_millis(800)).is_none());
    }

    #[test]
    fn first_publish_is_flagged_and_generations_advance() {
        let now = Instant::now();
        let mut render = coalescer();
        let job = render.submit("one".into(), 1).unwrap();
        match render.complete(ok(&job), now).outcome {
            Outcome::Published { source_map, first, .. } => {
                assert!(first);
                assert_eq!(source_map.generation(), Generation::new(1));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let job = render.submit("two".into(), 2).unwrap();
        match render.complete(ok(&job), now).outcome {
            Outcome::Published { source_map, first, .. } => {
                assert!(!first);
                assert_eq!(source_map.generation(), Generation::new(2));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(render.status().label(), "ok");
    }

    #[test]
    fn blocking_error_after_success_drops_the_output() {
        let now = Instant::now();
        let mut render = coalescer();
        let job = render.submit("good".into(), 1).unwrap();
        render.complete(ok(&job), now);
        let job = render.submit("bad".into(), 2).unwrap();
        let done = render.complete(failed(&job, "unexpected end of input"), now);
        assert!(matches!(done.outcome, Outcome::Failed(ref f) if f.detail == "detail"));
        assert!(matches!(render.status(), RenderStatus::Error(_)));
        assert!(render.status().output().is_none());
    }

    #[test]
    fn repeated_recoverable_errors_show_one_notice() {
        let start = Instant::now();
        let mut render = coalescer();
        let job = render.submit("good".into(), 1).unwrap();
        render.complete(ok(&job), start);

        let mut shown = 0;
        for step in 0..5u64 {
            let now = start + Duration::from_millis(step * 200);
            let job = render.submit(format!("bad {step}"), step + 2).unwrap();
            let done = render.complete(failed(&job, "label <intro> does not exist in the document"), now);
            match done.outcome {
                Outcome::Suppressed { notice } => shown += usize::from(notice.is_some()),
                other => panic!("unexpected outcome {other:?}"),
            }
            assert_eq!(render.status().label(), "ok");
        }
        assert_eq!(shown, 1);
    }

    #[test]
    fn notice_returns_after_the_window() {
        let start = Instant::now();
        let mut limiter = NoticeLimiter::new(WINDOW);
        assert!(limiter.admit("intro", start));
        assert!(!limiter.admit("intro", start + Duration::from_secs(2)));
        assert!(limiter.admit("other", start + Duration::from_secs(2)));
        assert!(limiter.admit("intro", start + WINDOW));
    }

    #[test]
    fn results_of_unknown_jobs_are_stale() {
        let now = Instant::now();
        let mut render = coalescer();
        let job = render.submit("x".into(), 1).unwrap();
        let stray = FinishedJob {
            id: job.id.next(),
            result: Ok(output("y")),
        };
        assert!(matches!(render.complete(stray, now).outcome, Outcome::Stale));
        assert!(render.is_in_flight());
    }

    #[test]
    fn shutdown_aborts_the_running_job() {
        let now = Instant::now();
        let mut render = coalescer();
        let job = render.submit("x".into(), 1).unwrap();
        render.submit("y".into(), 2);
        render.shutdown();
        assert!(job.signal.is_aborted());
        assert!(render.pending().is_none());
        assert!(matches!(render.complete(ok(&job), now).outcome, Outcome::Stale));
    }

    #[test]
    fn abort_restores_previous_status() {
        let now = Instant::now();
        let mut render = coalescer();
        let job = render.submit("x".into(), 1).unwrap();
        let done = render.complete(
            FinishedJob {
                id: job.id,
                result: Err(CompileError::Aborted),
            },
            now,
        );
        assert!(matches!(done.outcome, Outcome::Aborted));
        assert_eq!(render.status().label(), "idle");
    }

    #[rstest]
    #[case("label <intro> does not exist in the document", Some("intro"))]
    #[case("label `<setup>` does not exist in the document", Some("setup"))]
    #[case("undefined reference to `fig-1`", Some("fig-1"))]
    #[case("unknown reference 'eq'", Some("eq"))]
    #[case("unterminated frontmatter block", None)]
    #[case("failed to write /tmp/x", None)]
    fn classification(#[case] message: &str, #[case] cause: Option<&str>) {
        let expected = match cause {
            Some(cause) => ErrorClass::Recoverable {
                cause: cause.to_string(),
            },
            None => ErrorClass::Blocking,
        };
        assert_eq!(classify(message), expected);
    }
}
