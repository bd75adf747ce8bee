use crate::anchor::{AnchorId, AnchorIndex, SourceMap};
use crate::artifacts::{CleanupPolicy, spawn_cleanup};
use crate::clock::Clock;
use crate::compiler::{CompileJob, CompileRunner, FinishedJob};
use crate::config::Config;
use crate::render::{Notice, Outcome, RenderCoalescer, RenderStatus};
use crate::resolve::{ResolvePoll, ResolveSettings, ResolveTask};
use crate::sync::{EditorViewport, PreviewViewport, ScrollSyncController, SyncMode, SyncSettings};
use crate::typing::TypingDetector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub text: String,
    /// `false` for reloads and other changes the user did not type.
    pub is_user_edit: bool,
}

pub struct SyncSession {
    clock: Box<dyn Clock>,
    runner: Box<dyn CompileRunner>,
    typing: TypingDetector,
    render: RenderCoalescer,
    sync: ScrollSyncController,
    resolve_settings: ResolveSettings,
    resolving: Option<ResolveTask>,
    source_map: Option<Arc<SourceMap>>,
    cleanup: Option<CleanupPolicy>,
    text: String,
    change_generation: u64,
    notice: Option<Notice>,
}

impl SyncSession {
    pub fn new(
        cfg: &Config,
        runner: Box<dyn CompileRunner>,
        clock: Box<dyn Clock>,
        context_path: Option<PathBuf>,
    ) -> Self {
        let now = clock.now();
        let cleanup = CleanupPolicy::from_config(&cfg.render);
        Self {
            clock,
            runner,
            typing: TypingDetector::new(cfg.sync.typing_idle()),
            render: RenderCoalescer::new(
                cfg.render.settle(),
                cfg.render.notice_window(),
                context_path,
            ),
            sync: ScrollSyncController::new(SyncSettings::from(&cfg.sync), now),
            resolve_settings: ResolveSettings::from(&cfg.sync),
            resolving: None,
            source_map: None,
            cleanup,
            text: String::new(),
            change_generation: 0,
            notice: None,
        }
    }

    /// Sets the initial text and compiles it without waiting for the settle
    /// window.
    pub fn load(&mut self, text: String) {
        self.text = text;
        self.change_generation += 1;
        self.force_render();
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn compile_status(&self) -> &RenderStatus {
        self.render.status()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync.mode()
    }

    pub fn active_anchor_id(&self) -> Option<&AnchorId> {
        self.sync.active_anchor_id()
    }

    pub fn source_map(&self) -> Option<&Arc<SourceMap>> {
        self.source_map.as_ref()
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_typing(self.clock.now())
    }

    /// Pending notice for a recoverable compile error, if one was admitted.
    pub fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    pub fn on_text_changed(&mut self, change: TextChange) {
        let now = self.clock.now();
        if change.is_user_edit {
            self.typing.note_edit(now);
        }
        self.change_generation += 1;
        self.text = change.text;
        self.render
            .note_edit(self.text.clone(), self.change_generation, now);
    }

    pub fn on_editor_scroll(&mut self) {
        self.sync.on_editor_scroll(self.clock.now());
    }

    pub fn on_preview_scroll(&mut self) {
        self.sync.on_preview_scroll(self.clock.now());
    }

    /// The renderer moved its pages, e.g. after a resize; offsets are
    /// resolved again for the current source map.
    pub fn note_page_metrics_changed(&mut self) {
        if let Some(map) = &self.source_map {
            self.resolving = Some(ResolveTask::new(
                Arc::clone(map),
                self.resolve_settings,
                self.clock.now(),
            ));
        }
    }

    pub fn force_render(&mut self) {
        if let Some(job) = self.render.force(self.text.clone(), self.change_generation) {
            self.launch(job);
        }
    }

    pub fn force_sync(&mut self, editor: &mut dyn EditorViewport, preview: &mut dyn PreviewViewport) {
        let now = self.clock.now();
        let outcome = self.sync.force_sync(now, editor, preview);
        tracing::debug!(?outcome, "forced sync");
    }

    pub fn tick(&mut self, editor: &mut dyn EditorViewport, preview: &mut dyn PreviewViewport) {
        let now = self.clock.now();
        self.typing.poll(now);

        if let Some(job) = self.render.tick(now) {
            self.launch(job);
        }
        while let Some(finished) = self.runner.try_finished() {
            self.finish(finished, preview, now);
        }
        self.poll_resolution(editor, preview, now);

        let typing = self.typing.is_typing(now);
        self.sync.tick(now, typing, editor, preview);
    }

    /// Aborts the running compile and drops queued text.
    pub fn shutdown(&mut self) {
        self.render.shutdown();
        self.resolving = None;
    }

    fn launch(&mut self, job: CompileJob) {
        self.runner.launch(job);
    }

    fn finish(&mut self, finished: FinishedJob, preview: &mut dyn PreviewViewport, now: Instant) {
        let completion = self.render.complete(finished, now);
        if let Some(next) = completion.next {
            self.launch(next);
        }

        match completion.outcome {
            Outcome::Published {
                source_map,
                rendered,
                first,
            } => {
                preview.present(&rendered);
                self.sync.note_published(first);
                self.resolving = Some(ResolveTask::new(
                    Arc::clone(&source_map),
                    self.resolve_settings,
                    now,
                ));
                self.source_map = Some(source_map);
                if let Some(policy) = &self.cleanup {
                    spawn_cleanup(policy.clone());
                }
            }
            Outcome::Suppressed { notice } => {
                if notice.is_some() {
                    self.notice = notice;
                }
            }
            Outcome::Failed(_) => {
                self.source_map = None;
                self.resolving = None;
                self.sync.clear_index();
                preview.clear();
            }
            Outcome::Aborted | Outcome::Stale => {}
        }
    }

    fn poll_resolution(
        &mut self,
        editor: &mut dyn EditorViewport,
        preview: &mut dyn PreviewViewport,
        now: Instant,
    ) {
        let Some(task) = self.resolving.as_mut() else {
            return;
        };
        let resolution = match task.poll(&*preview, now) {
            ResolvePoll::Pending { .. } => return,
            ResolvePoll::Ready(resolution) => resolution,
        };
        let Some(task) = self.resolving.take() else {
            return;
        };
        match AnchorIndex::pair(task.source_map(), &resolution.table) {
            Ok(index) => {
                if self.sync.install_index(index) {
                    self.sync.sync_from_editor(now, editor, preview);
                }
            }
            Err(err) => tracing::warn!(error = %err, "dropping offsets from another generation"),
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compiler::{CompileError, Compiler, MarkdownCompiler};
    use crate::paginate::PageSetup;
    use crate::sync::tests::{FakeEditor, FakePreview};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct Script {
        launched: Vec<CompileJob>,
        finished: VecDeque<FinishedJob>,
        in_flight: usize,
        max_in_flight: usize,
    }

    /// Records launches; results are delivered when the test says so.
    #[derive(Clone, Default)]
    struct ScriptedRunner(Rc<RefCell<Script>>);

    impl ScriptedRunner {
        fn launched(&self) -> Vec<String> {
            self.0.borrow().launched.iter().map(|job| job.request.text.clone()).collect()
        }

        /// Compiles the most recent job for real and queues its result.
        fn finish_latest(&self) {
            let mut script = self.0.borrow_mut();
            let job = script.launched.last().cloned().expect("a launched job");
            let result = MarkdownCompiler::new(PageSetup::default(), None).compile(&job.request, &job.signal);
            script.in_flight -= 1;
            script.finished.push_back(FinishedJob { id: job.id, result });
        }

        fn fail_latest(&self, error: CompileError) {
            let mut script = self.0.borrow_mut();
            let job = script.launched.last().cloned().expect("a launched job");
            script.in_flight -= 1;
            script.finished.push_back(FinishedJob {
                id: job.id,
                result: Err(error),
            });
        }
    }

    impl CompileRunner for ScriptedRunner {
        fn launch(&mut self, job: CompileJob) {
            let mut script = self.0.borrow_mut();
            script.in_flight += 1;
            script.max_in_flight = script.max_in_flight.max(script.in_flight);
            script.launched.push(job);
        }

        fn try_finished(&mut self) -> Option<FinishedJob> {
            self.0.borrow_mut().finished.pop_front()
        }
    }

    struct Harness {
        clock: ManualClock,
        runner: ScriptedRunner,
        session: SyncSession,
        editor: FakeEditor,
        preview: FakePreview,
    }

    impl Harness {
        fn new(lines: usize) -> Self {
            let mut cfg = Config::default();
            cfg.render.build_dir = None;
            let clock = ManualClock::new();
            let runner = ScriptedRunner::default();
            let session = SyncSession::new(
                &cfg,
                Box::new(runner.clone()),
                Box::new(clock.clone()),
                None,
            );
            Self {
                clock,
                runner,
                session,
                editor: FakeEditor::new(lines),
                preview: FakePreview::default(),
            }
        }

        fn tick(&mut self) {
            self.session.tick(&mut self.editor, &mut self.preview);
        }

        fn type_text(&mut self, text: &str) {
            self.session.on_text_changed(TextChange {
                text: text.to_string(),
                is_user_edit: true,
            });
        }
    }

    fn document(sections: usize) -> String {
        let mut text = String::new();
        for idx in 0..sections {
            text.push_str(&format!("## Section {idx}\n\n"));
            for line in 0..8 {
                text.push_str(&format!("Line {line} of section {idx}.\n"));
            }
            text.push('\n');
        }
        text
    }

    #[test]
    fn first_render_enables_auto_sync() {
        let mut h = Harness::new(200);
        h.session.load(document(10));
        assert_eq!(h.session.sync_mode(), SyncMode::AwaitingFirstRender);
        assert_eq!(h.session.compile_status().label(), "running");

        h.runner.finish_latest();
        h.tick();
        assert_eq!(h.session.compile_status().label(), "ok");
        assert_eq!(h.session.sync_mode(), SyncMode::Auto);
        assert_eq!(h.preview.presented, 1);
        assert!(h.session.source_map().is_some());
        assert_eq!(
            h.session.active_anchor_id().map(AnchorId::as_str),
            Some("tf-doc-start")
        );
    }

    #[test]
    fn edits_settle_then_compile_latest_text() {
        let mut h = Harness::new(200);
        h.session.load("# Start\n".to_string());
        h.runner.finish_latest();
        h.tick();

        h.type_text("# Start\n\na");
        h.clock.advance_ms(100);
        h.type_text("# Start\n\nab");
        h.tick();
        assert_eq!(h.runner.launched().len(), 1);

        h.clock.advance_ms(400);
        h.tick();
        assert_eq!(h.runner.launched().last().map(String::as_str), Some("# Start\n\nab"));
    }

    #[test]
    fn edits_during_a_compile_queue_only_the_latest() {
        let mut h = Harness::new(200);
        h.session.load("# v0\n".to_string());
        for step in 1..=4 {
            h.type_text(&format!("# v{step}\n"));
            h.clock.advance_ms(450);
            h.tick();
        }
        assert_eq!(h.runner.launched(), vec!["# v0\n".to_string()]);

        h.runner.finish_latest();
        h.tick();
        assert_eq!(h.runner.launched(), vec!["# v0\n".to_string(), "# v4\n".to_string()]);
        assert_eq!(h.runner.0.borrow().max_in_flight, 1);
    }

    #[test]
    fn blocking_error_clears_map_and_keeps_editor_text() {
        let mut h = Harness::new(200);
        h.session.load(document(3));
        h.runner.finish_latest();
        h.tick();
        let scrolls_before = h.editor.sets.len();

        let broken = format!("---\ntitle: draft\n\n{}", document(3));
        h.session.on_text_changed(TextChange {
            text: broken.clone(),
            is_user_edit: true,
        });
        h.session.force_render();
        h.runner.finish_latest();
        h.tick();

        assert!(h.session.source_map().is_none());
        match h.session.compile_status() {
            RenderStatus::Error(failure) => {
                assert!(failure.message.contains("frontmatter"));
                assert!(failure.detail.contains("line 1"));
            }
            other => panic!("expected error status, got {}", other.label()),
        }
        assert_eq!(h.preview.cleared, 1);
        assert_eq!(h.session.sync_mode(), SyncMode::Manual);
        assert_eq!(h.session.text(), broken);
        assert_eq!(h.editor.sets.len(), scrolls_before);
    }

    #[test]
    fn recoverable_errors_keep_output_and_rate_limit_notices() {
        let mut h = Harness::new(200);
        h.session.load(document(3));
        h.runner.finish_latest();
        h.tick();

        let mut notices = 0;
        for step in 0..5 {
            h.type_text(&format!("{}\nsee [x](#nowhere) {step}\n", document(3)));
            h.session.force_render();
            h.runner.finish_latest();
            h.clock.advance_ms(200);
            h.tick();
            notices += usize::from(h.session.take_notice().is_some());
        }
        assert_eq!(notices, 1);
        assert_eq!(h.session.compile_status().label(), "ok");
        assert!(h.session.source_map().is_some());
        assert_eq!(h.preview.cleared, 0);
    }

    #[test]
    fn aborted_compile_keeps_previous_output() {
        let mut h = Harness::new(200);
        h.session.load(document(2));
        h.runner.finish_latest();
        h.tick();

        h.type_text(&document(3));
        h.session.force_render();
        assert_eq!(h.session.compile_status().label(), "running");
        h.runner.fail_latest(CompileError::Aborted);
        h.tick();
        assert_eq!(h.session.compile_status().label(), "ok");
        assert!(h.session.source_map().is_some());
        assert_eq!(h.preview.cleared, 0);
    }

    #[test]
    fn reloads_do_not_count_as_typing() {
        let mut h = Harness::new(200);
        h.session.on_text_changed(TextChange {
            text: "# Reloaded\n".to_string(),
            is_user_edit: false,
        });
        assert!(!h.session.is_typing());
        h.type_text("# Typed\n");
        assert!(h.session.is_typing());
        h.clock.advance_ms(800);
        h.tick();
        assert!(!h.session.is_typing());
    }

    #[test]
    fn editor_scroll_moves_preview_to_section() {
        let mut h = Harness::new(200);
        h.session.load(document(10));
        h.runner.finish_latest();
        h.tick();

        // "## Section 5" sits on source line 55.
        h.editor.scroll_top = 55.0 * crate::sync::tests::LINE_PX;
        h.clock.advance_ms(200);
        h.session.on_editor_scroll();
        h.clock.advance_ms(50);
        h.tick();
        assert_eq!(
            h.session.active_anchor_id().map(AnchorId::as_str),
            Some("section-5")
        );
        assert!(h.preview.scroll_top > 0.0);
    }

    #[test]
    fn shutdown_aborts_running_compile() {
        let mut h = Harness::new(10);
        h.session.load("# Hi\n".to_string());
        h.session.shutdown();
        let script = h.runner.0.borrow();
        assert!(script.launched[0].signal.is_aborted());
    }

    #[test]
    fn metrics_change_reresolves_offsets() {
        let mut h = Harness::new(200);
        h.session.load(document(4));
        h.runner.finish_latest();
        h.tick();
        h.session.note_page_metrics_changed();
        assert!(h.session.resolving.is_some());
        h.tick();
        assert!(h.session.resolving.is_none());
    }
}
