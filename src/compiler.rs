//! The compile step: contract, the built-in markdown compiler, and the
//! worker that runs compiles off the UI thread.

use crate::anchor::Anchor;
use crate::extract::{Frontmatter, LineIndex, extract_anchors, frontmatter};
use crate::paginate::{PageSetup, PagedDocument, paginate};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use thiserror::Error;

/// Cooperative cancellation flag shared between a job and its owner.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub text: String,
    /// File the text belongs to, if any. Relative paths resolve against it.
    pub context_path: Option<PathBuf>,
}

/// Handle to one compile's rendered pages.
#[derive(Debug, Clone)]
pub struct RenderedOutput {
    document: Arc<PagedDocument>,
    artifact: Option<PathBuf>,
}

impl RenderedOutput {
    pub fn new(document: PagedDocument, artifact: Option<PathBuf>) -> Self {
        Self {
            document: Arc::new(document),
            artifact,
        }
    }

    pub fn document(&self) -> &PagedDocument {
        &self.document
    }

    pub fn artifact(&self) -> Option<&Path> {
        self.artifact.as_deref()
    }

    pub fn page_count(&self) -> usize {
        self.document.page_count()
    }
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub rendered: RenderedOutput,
    pub anchors: Vec<Anchor>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("compile aborted")]
    Aborted,
    /// Structured compiler failure: a one-line message and free-form detail.
    #[error("{message}")]
    Diagnostic { message: String, detail: String },
}

impl CompileError {
    pub fn diagnostic(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Diagnostic {
            message: message.into(),
            detail: detail.into(),
        }
    }
}

pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        request: &CompileRequest,
        signal: &AbortSignal,
    ) -> Result<CompileOutput, CompileError>;
}

/// Markdown to fixed-size text pages.
#[derive(Debug)]
pub struct MarkdownCompiler {
    setup: PageSetup,
    build_dir: Option<PathBuf>,
    renders: AtomicU64,
}

impl MarkdownCompiler {
    pub fn new(setup: PageSetup, build_dir: Option<PathBuf>) -> Self {
        Self {
            setup,
            build_dir,
            renders: AtomicU64::new(0),
        }
    }

    fn write_artifact(&self, dir: &Path, document: &PagedDocument) -> Result<PathBuf, CompileError> {
        let n = self.renders.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("render-{}-{n:06}.txt", std::process::id()));
        fs::create_dir_all(dir)
            .and_then(|_| fs::write(&path, document.to_plain_text()))
            .map_err(|err| {
                CompileError::diagnostic(
                    format!("failed to write {}", path.display()),
                    err.to_string(),
                )
            })?;
        Ok(path)
    }
}

impl Compiler for MarkdownCompiler {
    fn compile(
        &self,
        request: &CompileRequest,
        signal: &AbortSignal,
    ) -> Result<CompileOutput, CompileError> {
        let text = request.text.as_str();
        if let Frontmatter::Unterminated { line } = frontmatter(text) {
            return Err(CompileError::diagnostic(
                "unterminated frontmatter block",
                format!("line {}: opening `---` has no closing fence", line + 1),
            ));
        }

        let anchors = extract_anchors(text);
        if signal.is_aborted() {
            return Err(CompileError::Aborted);
        }
        let document = paginate(text, &anchors, self.setup, signal).ok_or(CompileError::Aborted)?;

        let known: HashSet<&str> = anchors.iter().map(|a| a.id.as_str()).collect();
        if let Some(link) = document
            .internal_links()
            .iter()
            .find(|link| !known.contains(link.label.as_str()))
        {
            let (line, column) = LineIndex::new(text).line_col(text, link.source_offset);
            return Err(CompileError::diagnostic(
                format!("label <{}> does not exist in the document", link.label),
                format!("{}:{}: link target #{}", line + 1, column + 1, link.label),
            ));
        }

        let artifact = match &self.build_dir {
            Some(dir) => Some(self.write_artifact(dir, &document)?),
            None => None,
        };
        Ok(CompileOutput {
            rendered: RenderedOutput::new(document, artifact),
            anchors,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CompileJob {
    pub id: JobId,
    pub request: CompileRequest,
    /// Editor change counter the text was taken at.
    pub change_generation: u64,
    pub signal: AbortSignal,
}

#[derive(Debug)]
pub struct FinishedJob {
    pub id: JobId,
    pub result: Result<CompileOutput, CompileError>,
}

/// Runs compile jobs and hands back their results on the caller's thread.
pub trait CompileRunner {
    fn launch(&mut self, job: CompileJob);
    fn try_finished(&mut self) -> Option<FinishedJob>;
}

/// One short-lived thread per job; results come back over a channel.
pub struct CompileWorker<C> {
    compiler: Arc<C>,
    tx: Sender<FinishedJob>,
    rx: Receiver<FinishedJob>,
}

impl<C: Compiler + 'static> CompileWorker<C> {
    pub fn new(compiler: C) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            compiler: Arc::new(compiler),
            tx,
            rx,
        }
    }
}

impl<C: Compiler + 'static> CompileRunner for CompileWorker<C> {
    fn launch(&mut self, job: CompileJob) {
        let id = job.id;
        let compiler = Arc::clone(&self.compiler);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("marksync-{id}"))
            .spawn(move || {
                let result = compiler.compile(&job.request, &job.signal);
                let _ = tx.send(FinishedJob { id: job.id, result });
            });
        if let Err(err) = spawned {
            tracing::warn!(%id, error = %err, "failed to spawn compile thread");
            let _ = self.tx.send(FinishedJob {
                id,
                result: Err(CompileError::diagnostic(
                    "failed to start compile",
                    err.to_string(),
                )),
            });
        }
    }

    fn try_finished(&mut self) -> Option<FinishedJob> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn request(text: &str) -> CompileRequest {
        CompileRequest {
            text: text.to_string(),
            context_path: None,
        }
    }

    fn compiler() -> MarkdownCompiler {
        MarkdownCompiler::new(PageSetup::default(), None)
    }

    #[test]
    fn compiles_pages_and_anchors() {
        let output = compiler()
            .compile(&request("# One\n\ntext\n\n# Two\n"), &AbortSignal::new())
            .unwrap();
        assert_eq!(output.rendered.page_count(), 1);
        let ids: Vec<&str> = output.anchors.iter().map(|a| a.id.as_str()).collect();
        assert!(ids.contains(&"one"));
        assert!(ids.contains(&"two"));
        assert!(output.rendered.artifact().is_none());
    }

    #[test]
    fn dangling_label_is_reported_by_name() {
        let err = compiler()
            .compile(&request("# Intro\n\nsee [x](#missing)\n"), &AbortSignal::new())
            .unwrap_err();
        match err {
            CompileError::Diagnostic { message, detail } => {
                assert_eq!(message, "label <missing> does not exist in the document");
                assert!(detail.starts_with("3:"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn links_to_existing_headings_compile() {
        let result = compiler().compile(
            &request("# Intro\n\nsee [x](#intro)\n"),
            &AbortSignal::new(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn unterminated_frontmatter_fails() {
        let err = compiler()
            .compile(&request("---\ntitle: x\n\n# Body\n"), &AbortSignal::new())
            .unwrap_err();
        assert!(matches!(err, CompileError::Diagnostic { ref message, .. } if message.contains("frontmatter")));
    }

    #[test]
    fn document_opening_with_a_rule_compiles() {
        let output = compiler()
            .compile(&request("---\n\nSome notes after a rule.\n"), &AbortSignal::new())
            .unwrap();
        assert!(output.anchors.iter().any(|a| a.id.as_str() == "tf-hr-1"));
        assert!(output.rendered.document().to_plain_text().contains("Some notes after a rule."));
    }

    #[test]
    fn aborted_compile_reports_abort() {
        let signal = AbortSignal::new();
        signal.abort();
        let err = compiler().compile(&request("# Hi\n"), &signal).unwrap_err();
        assert_eq!(err, CompileError::Aborted);
    }

    #[test]
    fn artifacts_are_written_to_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = MarkdownCompiler::new(PageSetup::default(), Some(dir.path().join("build")));
        let output = compiler
            .compile(&request("# Hello\n"), &AbortSignal::new())
            .unwrap();
        let path = output.rendered.artifact().unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(fs::read_to_string(path).unwrap().contains("Hello"));
    }

    #[test]
    fn worker_returns_results_on_the_channel() {
        let mut worker = CompileWorker::new(compiler());
        worker.launch(CompileJob {
            id: JobId::new(7),
            request: request("# Hi\n"),
            change_generation: 1,
            signal: AbortSignal::new(),
        });
        let deadline = Instant::now() + Duration::from_secs(5);
        let finished = loop {
            if let Some(done) = worker.try_finished() {
                break done;
            }
            assert!(Instant::now() < deadline, "worker never finished");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(finished.id, JobId::new(7));
        assert!(finished.result.is_ok());
    }
}
