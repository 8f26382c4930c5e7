use crate::{
    client::CaptionModel,
    error::{AnalyzeError, BatchError},
};
use serde::Serialize;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use walkdir::WalkDir;

/// Image extensions picked up by the folder scan.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tiff", "tif"];

/// Caption for one processed file.
///
/// `caption` is either the generated description or a human-readable error
/// message; it is never empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AnalysisResult {
    pub file_path: PathBuf,
    pub file_name: String,
    pub caption: String,
}

/// Progress of a running batch, updated after every emitted result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// Number of results emitted so far.
    pub current: usize,
    pub total: usize,
    /// Name of the file behind the most recent result.
    pub file_name: String,
}

/// Lifecycle of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Enumerating,
    Processing { completed: usize, total: usize },
    Completed,
    Cancelled,
    /// The folder could not be enumerated, or the batch ended without a
    /// result for every file and without being cancelled.
    Failed(String),
}

impl BatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Idle => "idle",
            BatchState::Enumerating => "enumerating",
            BatchState::Processing { .. } => "processing",
            BatchState::Completed => "completed",
            BatchState::Cancelled => "cancelled",
            BatchState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::Cancelled | BatchState::Failed(_)
        )
    }
}

/// Outcome of a non-blocking poll on a [`BatchRun`].
#[derive(Debug)]
pub enum BatchPoll {
    /// A result was ready.
    Result(AnalysisResult),
    /// Nothing ready yet; the batch is still in the given state.
    Pending(BatchState),
    /// Every result has been emitted.
    Finished(BatchState),
}

/// Runs a caption model over every image in a folder with a fixed-size
/// pool of workers.
///
/// The runner tracks the state of the batch it most recently started.
pub struct BatchRunner<M: CaptionModel> {
    model: Arc<M>,
    concurrency: usize,
    state: Arc<Mutex<BatchState>>,
}

impl<M: CaptionModel> BatchRunner<M> {
    /// Creates a runner that keeps at most `concurrency` analyze calls in
    /// flight. A concurrency of 0 is treated as 1.
    pub fn new(model: Arc<M>, concurrency: usize) -> Self {
        Self {
            model,
            concurrency: concurrency.max(1),
            state: Arc::new(Mutex::new(BatchState::Idle)),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// State of the most recently started batch.
    pub fn state(&self) -> BatchState {
        lock(&self.state).clone()
    }

    /// Scans `folder` recursively for files whose extension is in
    /// `extensions` and starts captioning them.
    ///
    /// The scan runs on the blocking thread pool. Enumeration failures abort
    /// the batch before any request is sent.
    pub async fn run(&self, folder: &Path, extensions: &[&str]) -> Result<BatchRun, BatchError> {
        set_state(&self.state, BatchState::Enumerating);

        let scan = {
            let folder = folder.to_path_buf();
            let extensions: Vec<String> = extensions.iter().map(|e| e.to_string()).collect();
            tokio::task::spawn_blocking(move || {
                let extensions: Vec<&str> = extensions.iter().map(String::as_str).collect();
                find_images(&folder, &extensions)
            })
        };

        let files = match scan.await.unwrap_or_else(|e| Err(BatchError::ScanAborted(e))) {
            Ok(files) => files,
            Err(e) => {
                log::error!("{e}");
                set_state(&self.state, BatchState::Failed(e.to_string()));
                return Err(e);
            }
        };

        let total = files.len();
        log::info!("Found {total} images under {}", folder.display());

        set_state(
            &self.state,
            if total == 0 {
                BatchState::Completed
            } else {
                BatchState::Processing {
                    completed: 0,
                    total,
                }
            },
        );

        let queue = Arc::new(Mutex::new(files.into_iter().collect::<VecDeque<_>>()));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let workers = (0..self.concurrency.min(total))
            .map(|worker_id| {
                spawn_worker(
                    worker_id,
                    self.model.clone(),
                    queue.clone(),
                    cancelled.clone(),
                    result_tx.clone(),
                )
            })
            .collect();

        Ok(BatchRun {
            state: self.state.clone(),
            progress: BatchProgress {
                current: 0,
                total,
                file_name: String::new(),
            },
            result_rx,
            cancelled,
            workers,
        })
    }
}

/// Handle on a running batch. Yields each [`AnalysisResult`] once, as soon
/// as its analyze call finishes.
///
/// With a concurrency of 1 results follow enumeration order; otherwise they
/// arrive in completion order.
pub struct BatchRun {
    state: Arc<Mutex<BatchState>>,
    progress: BatchProgress,
    result_rx: mpsc::UnboundedReceiver<AnalysisResult>,
    cancelled: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchRun {
    pub fn total(&self) -> usize {
        self.progress.total
    }

    pub fn progress(&self) -> &BatchProgress {
        &self.progress
    }

    pub fn state(&self) -> BatchState {
        lock(&self.state).clone()
    }

    /// Waits for the next result. Returns `None` once the batch is over.
    pub async fn next(&mut self) -> Option<AnalysisResult> {
        match self.result_rx.recv().await {
            Some(result) => {
                self.record(&result);
                Some(result)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    /// Returns a ready result without waiting.
    pub fn try_poll(&mut self) -> BatchPoll {
        match self.result_rx.try_recv() {
            Ok(result) => {
                self.record(&result);
                BatchPoll::Result(result)
            }
            Err(mpsc::error::TryRecvError::Empty) => BatchPoll::Pending(self.state()),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.finish();
                BatchPoll::Finished(self.state())
            }
        }
    }

    /// Stops handing out new files. Requests already in flight run to
    /// completion (or time out) and their results are still delivered.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            log::info!("Cancelling batch after {} results", self.progress.current);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Drains the batch, returning every remaining result.
    pub async fn collect(mut self) -> Vec<AnalysisResult> {
        let mut results = Vec::with_capacity(self.progress.total - self.progress.current);
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }

    fn record(&mut self, result: &AnalysisResult) {
        self.progress.current += 1;
        self.progress.file_name = result.file_name.clone();
        log::debug!(
            "[{}/{}] {}",
            self.progress.current,
            self.progress.total,
            self.progress.file_name
        );
        set_state(
            &self.state,
            BatchState::Processing {
                completed: self.progress.current,
                total: self.progress.total,
            },
        );
    }

    fn finish(&mut self) {
        if lock(&self.state).is_terminal() {
            return;
        }

        let (current, total) = (self.progress.current, self.progress.total);
        let state = if current >= total {
            BatchState::Completed
        } else if self.is_cancelled() {
            BatchState::Cancelled
        } else {
            let missing = total - current;
            log::error!("Batch workers stopped with {missing} of {total} images unprocessed");
            BatchState::Failed(format!("{missing} of {total} images were not processed"))
        };

        log::info!("Batch {} with {current}/{total} results", state.as_str());
        set_state(&self.state, state);
        self.workers.clear();
    }
}

impl Drop for BatchRun {
    fn drop(&mut self) {
        // Remaining workers finish their current request and exit.
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn spawn_worker<M: CaptionModel>(
    worker_id: usize,
    model: Arc<M>,
    queue: Arc<Mutex<VecDeque<PathBuf>>>,
    cancelled: Arc<AtomicBool>,
    result_tx: mpsc::UnboundedSender<AnalysisResult>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !cancelled.load(Ordering::SeqCst) {
            let Some(path) = next_job(&queue) else {
                break;
            };

            let file_name = file_name_of(&path);
            log::debug!("Worker {worker_id} analyzing {file_name}");

            // A panicking model only costs this file its caption.
            let task = {
                let model = model.clone();
                let path = path.clone();
                tokio::spawn(async move { model.caption(&path).await })
            };
            let caption = match task.await {
                Ok(caption) => caption,
                Err(e) => {
                    log::error!("Worker {worker_id} lost {file_name}: {e}");
                    AnalyzeError::Unexpected(format!("analysis of {file_name} aborted: {e}"))
                        .to_string()
                }
            };
            let result = AnalysisResult {
                file_path: path,
                file_name,
                caption,
            };

            if result_tx.send(result).is_err() {
                log::debug!("Result channel closed, worker {worker_id} stopping");
                break;
            }
        }
    })
}

fn next_job(queue: &Mutex<VecDeque<PathBuf>>) -> Option<PathBuf> {
    lock(queue).pop_front()
}

/// Recursively lists files under `folder` whose extension matches one of
/// `extensions` (case-insensitive, leading dot optional), sorted by path.
pub fn find_images(folder: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>, BatchError> {
    if !folder.is_dir() {
        return Err(BatchError::NotADirectory(folder.to_path_buf()));
    }

    let extensions: Vec<String> = extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect();

    let mut files = Vec::new();
    for entry in WalkDir::new(folder).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|source| BatchError::Enumeration {
            path: folder.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let matches = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)));
        if matches {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_state(state: &Mutex<BatchState>, new_state: BatchState) {
    *lock(state) = new_state;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::atomic::AtomicUsize,
        time::Duration,
    };

    /// Fake model that captions by file name and tracks how many calls
    /// overlap.
    #[derive(Default)]
    struct FakeModel {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FakeModel {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }
    }

    impl CaptionModel for FakeModel {
        async fn caption(&self, image_path: &Path) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let name = file_name_of(image_path);
            if name.starts_with("bad") {
                format!("Error: cannot read {name}")
            } else {
                format!("caption of {name}")
            }
        }
    }

    fn touch(dir: &Path, relative: &str) -> PathBuf {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn find_images_filters_recursively_and_ignores_case() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "B.PNG");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "nested/deeper/c.TiF");
        touch(dir.path(), "nested/d.webp");

        let files = find_images(dir.path(), SUPPORTED_EXTENSIONS).unwrap();
        let names: Vec<String> = files.iter().map(|p| file_name_of(p)).collect();

        assert_eq!(names.len(), 3);
        assert!(names.contains(&"a.jpg".to_string()));
        assert!(names.contains(&"B.PNG".to_string()));
        assert!(names.contains(&"c.TiF".to_string()));
    }

    #[test]
    fn find_images_accepts_dotted_extensions() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "photo.jpeg");

        let files = find_images(dir.path(), &[".JPEG"]).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn find_images_rejects_missing_folder() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = find_images(&missing, SUPPORTED_EXTENSIONS).unwrap_err();
        assert!(matches!(err, BatchError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn sequential_batch_keeps_enumeration_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.png", "a.jpg", "b.gif"] {
            touch(dir.path(), name);
        }

        let runner = BatchRunner::new(Arc::new(FakeModel::default()), 1);
        let run = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await.unwrap();
        assert_eq!(run.total(), 3);

        let results = run.collect().await;
        let names: Vec<&str> = results.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, ["a.jpg", "b.gif", "c.png"]);
        assert_eq!(results[0].caption, "caption of a.jpg");
        assert_eq!(runner.state(), BatchState::Completed);
    }

    #[tokio::test]
    async fn failures_stay_in_their_own_result() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "bad.jpg");
        touch(dir.path(), "good.jpg");

        let runner = BatchRunner::new(Arc::new(FakeModel::default()), 1);
        let results = runner
            .run(dir.path(), SUPPORTED_EXTENSIONS)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].caption, "Error: cannot read bad.jpg");
        assert_eq!(results[1].caption, "caption of good.jpg");
    }

    #[tokio::test]
    async fn progress_is_reported_after_each_result() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "one.png");
        touch(dir.path(), "two.png");

        let runner = BatchRunner::new(Arc::new(FakeModel::default()), 1);
        let mut run = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await.unwrap();

        run.next().await.unwrap();
        assert_eq!(
            run.progress(),
            &BatchProgress {
                current: 1,
                total: 2,
                file_name: "one.png".to_string()
            }
        );
        assert_eq!(
            run.state(),
            BatchState::Processing {
                completed: 1,
                total: 2
            }
        );

        run.next().await.unwrap();
        assert_eq!(run.progress().current, 2);
        assert_eq!(run.progress().file_name, "two.png");

        assert!(run.next().await.is_none());
        assert_eq!(run.state(), BatchState::Completed);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_and_results_are_attributable() {
        let dir = tempfile::tempdir().unwrap();
        let mut expected = HashSet::new();
        for i in 0..10 {
            expected.insert(touch(dir.path(), &format!("img{i:02}.png")));
        }

        let model = Arc::new(FakeModel::with_delay(Duration::from_millis(30)));
        let runner = BatchRunner::new(model.clone(), 3);
        let results = runner
            .run(dir.path(), SUPPORTED_EXTENSIONS)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 10);
        let seen: HashSet<PathBuf> = results.iter().map(|r| r.file_path.clone()).collect();
        assert_eq!(seen, expected);
        for result in &results {
            assert_eq!(result.caption, format!("caption of {}", result.file_name));
        }

        let max = model.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3, "at most 3 calls in flight, saw {max}");
        assert!(max > 1, "calls should overlap with concurrency 3");
    }

    #[tokio::test]
    async fn empty_folder_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "readme.md");

        let runner = BatchRunner::new(Arc::new(FakeModel::default()), 2);
        let mut run = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await.unwrap();

        assert_eq!(run.total(), 0);
        assert!(run.next().await.is_none());
        assert_eq!(runner.state(), BatchState::Completed);
    }

    #[tokio::test]
    async fn enumeration_failure_yields_no_results() {
        let dir = tempfile::tempdir().unwrap();
        let model = Arc::new(FakeModel::default());
        let runner = BatchRunner::new(model.clone(), 1);

        let err = runner
            .run(&dir.path().join("missing"), SUPPORTED_EXTENSIONS)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, BatchError::NotADirectory(_)));
        assert!(matches!(runner.state(), BatchState::Failed(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_stops_new_requests_but_keeps_in_flight_ones() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            touch(dir.path(), &format!("img{i}.jpg"));
        }

        let model = Arc::new(FakeModel::with_delay(Duration::from_millis(50)));
        let runner = BatchRunner::new(model.clone(), 1);
        let mut run = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await.unwrap();

        let first = run.next().await.unwrap();
        assert_eq!(first.file_name, "img0.jpg");
        run.cancel();

        let rest = run.collect().await;
        // The worker may already have picked up the second image.
        assert!(rest.len() <= 1);
        assert!(model.calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(runner.state(), BatchState::Cancelled);
    }

    #[tokio::test]
    async fn try_poll_reports_pending_then_finished() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "slow.png");

        let model = Arc::new(FakeModel::with_delay(Duration::from_millis(100)));
        let runner = BatchRunner::new(model, 1);
        let mut run = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await.unwrap();

        assert!(matches!(run.try_poll(), BatchPoll::Pending(BatchState::Processing { .. })));

        let mut results = Vec::new();
        loop {
            match run.try_poll() {
                BatchPoll::Result(result) => results.push(result),
                BatchPoll::Pending(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                BatchPoll::Finished(state) => {
                    assert_eq!(state, BatchState::Completed);
                    break;
                }
            }
        }
        assert_eq!(results.len(), 1);
    }

    /// Model that panics on files whose name starts with "b".
    struct PanickingModel;

    impl CaptionModel for PanickingModel {
        async fn caption(&self, image_path: &Path) -> String {
            let name = file_name_of(image_path);
            if name.starts_with('b') {
                panic!("decoder blew up on {name}");
            }
            format!("caption of {name}")
        }
    }

    #[tokio::test]
    async fn panicking_model_costs_only_its_own_file() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            touch(dir.path(), name);
        }

        let runner = BatchRunner::new(Arc::new(PanickingModel), 1);
        let results = runner
            .run(dir.path(), SUPPORTED_EXTENSIONS)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].caption, "caption of a.png");
        assert!(results[1].caption.contains("b.png"), "{}", results[1].caption);
        assert_eq!(results[2].caption, "caption of c.png");
        assert_eq!(runner.state(), BatchState::Completed);
    }

    #[tokio::test]
    async fn lost_worker_ends_batch_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.png"] {
            touch(dir.path(), name);
        }

        let model = Arc::new(FakeModel::with_delay(Duration::from_millis(50)));
        let runner = BatchRunner::new(model, 1);
        let mut run = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await.unwrap();
        run.workers[0].abort();

        let results = run.collect().await;
        assert!(results.len() < 3);
        match runner.state() {
            BatchState::Failed(reason) => assert!(reason.contains("of 3 images"), "{reason}"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn find_images_follows_symlinked_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = touch(dir.path(), "store/original.jpg");
        let scan_root = dir.path().join("album");
        std::fs::create_dir_all(&scan_root).unwrap();
        std::os::unix::fs::symlink(&target, scan_root.join("linked.jpg")).unwrap();

        let files = find_images(&scan_root, SUPPORTED_EXTENSIONS).unwrap();
        assert_eq!(files, vec![scan_root.join("linked.jpg")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_subfolder_fails_whole_batch() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        touch(dir.path(), "locked/b.png");
        let locked = dir.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not stop root.
        if std::fs::read_dir(&locked).is_ok() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let model = Arc::new(FakeModel::default());
        let runner = BatchRunner::new(model.clone(), 1);
        let outcome = runner.run(dir.path(), SUPPORTED_EXTENSIONS).await;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = outcome.err().unwrap();
        assert!(matches!(err, BatchError::Enumeration { .. }), "{err}");
        assert!(matches!(runner.state(), BatchState::Failed(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }
}
