// Orchestration of a VOD download run: key prefetch, worker pool, retry,
// pause/cancel, the run state machine, and finalization.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::combine::{Combiner, ConcatCombiner};
use crate::config::DownloadConfig;
use crate::decrypt::{Aes128CbcDecryptor, Decryptor};
use crate::error::DownloadError;
use crate::fetch::{ByteStream, Fetcher, HttpFetcher, read_to_end};
use crate::notify::{DownloadState, ProgressListener, StateListener, StateNotifier};
use crate::playlist::{self, Playlist, Segment, VariantSelector};
use crate::progress::{FileProgressStore, ProgressStore};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// Path of the file a segment is written to: `segment_{N}.ts`, `N = index + 1`.
pub fn segment_path(work_dir: &Path, index: u64) -> PathBuf {
    work_dir.join(format!("segment_{}.ts", index + 1))
}

/// Cooperative pause gate. Pausing arms the gate; workers entering it block
/// until released. Cancellation overrides pause.
struct PauseGate {
    state: watch::Sender<bool>,
}

impl PauseGate {
    fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    fn pause(&self) {
        self.state.send_replace(true);
    }

    fn resume(&self) {
        self.state.send_replace(false);
    }

    async fn wait_ready(&self, token: &CancellationToken) -> Result<(), DownloadError> {
        let mut rx = self.state.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(DownloadError::Interrupted);
                    }
                }
            }
        }
    }
}

/// Per-invocation control surface shared between the orchestrator and the
/// worker tasks.
struct RunControl {
    token: CancellationToken,
    pause: PauseGate,
}

impl RunControl {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            pause: PauseGate::new(),
        }
    }
}

/// Downloads one HLS VOD presentation into a single local file.
///
/// Collaborators (fetcher, decryptor, progress store, combiner, variant
/// selector) are injected; the defaults cover plain HTTP(S) AES-128 streams.
pub struct VodDownloader {
    config: Arc<DownloadConfig>,
    fetcher: Arc<dyn Fetcher>,
    decryptor: Arc<dyn Decryptor>,
    store: Arc<dyn ProgressStore>,
    combiner: Arc<dyn Combiner>,
    selector: Arc<dyn VariantSelector>,
    progress: Option<Arc<dyn ProgressListener>>,
    notifier: StateNotifier,
    run: Mutex<Option<Arc<RunControl>>>,
    cached_playlist: Mutex<Option<(Url, Arc<Playlist>)>>,
}

impl VodDownloader {
    pub fn new(config: DownloadConfig) -> Result<Self, DownloadError> {
        config.validate()?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config)?);
        let store: Arc<dyn ProgressStore> = Arc::new(FileProgressStore::new(&config.work_dir));
        let combiner: Arc<dyn Combiner> =
            Arc::new(ConcatCombiner::new(config.cleanup_segments_on_complete));
        let selector: Arc<dyn VariantSelector> = Arc::new(config.variant_policy);
        Ok(Self {
            config: Arc::new(config),
            fetcher,
            decryptor: Arc::new(Aes128CbcDecryptor),
            store,
            combiner,
            selector,
            progress: None,
            notifier: StateNotifier::new(None),
            run: Mutex::new(None),
            cached_playlist: Mutex::new(None),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = decryptor;
        self
    }

    pub fn with_progress_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_combiner(mut self, combiner: Arc<dyn Combiner>) -> Self {
        self.combiner = combiner;
        self
    }

    pub fn with_variant_selector(mut self, selector: Arc<dyn VariantSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_progress_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.progress = Some(listener);
        self
    }

    pub fn with_state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.notifier = StateNotifier::new(Some(listener));
        self
    }

    fn current_run(&self) -> Option<Arc<RunControl>> {
        self.run.lock().clone()
    }

    /// Request cooperative cancellation of the active run. Safe to call from
    /// notification callbacks.
    pub fn cancel(&self) {
        if let Some(run) = self.current_run() {
            info!("Cancellation requested");
            run.token.cancel();
        }
    }

    /// Pause the active run. Workers finish their current suspension point
    /// and block at the gate.
    pub fn pause(&self) {
        if let Some(run) = self.current_run() {
            run.pause.pause();
            self.notifier.notify(DownloadState::Paused, "download paused");
        }
    }

    /// Release a pause. The gate re-arms for the next pause.
    pub fn resume(&self) {
        if let Some(run) = self.current_run() {
            run.pause.resume();
            self.notifier
                .notify(DownloadState::Resumed, "download resumed");
        }
    }

    /// Download the presentation at `url` into `config.output_path`.
    ///
    /// Emits STARTED exactly once up front, one terminal state
    /// (COMPLETED / CANCELLED / ERROR), and STOPPED last.
    pub async fn download(&self, url: &str) -> Result<(), DownloadError> {
        let url = Url::parse(url)
            .map_err(|e| DownloadError::invalid_config(format!("invalid URL `{url}`: {e}")))?;

        let run = Arc::new(RunControl::new());
        {
            let mut slot = self.run.lock();
            if slot.is_some() {
                return Err(DownloadError::invalid_config(
                    "a download is already in progress",
                ));
            }
            *slot = Some(Arc::clone(&run));
        }

        self.notifier.reset();
        self.notifier
            .notify(DownloadState::Started, "download started");

        let outcome = self.run_to_completion(&url, &run).await;

        match &outcome {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => {
                // Partial progress is deliberately discarded on cancel.
                if let Err(cleanup_err) = self.store.cleanup().await {
                    warn!(error = %cleanup_err, "Failed to remove progress state after cancel");
                }
                self.notifier
                    .notify(DownloadState::Cancelled, "download cancelled");
            }
            Err(err) => {
                self.notifier
                    .notify(DownloadState::Error, &format!("download failed: {err}"));
            }
        }

        self.notifier
            .notify(DownloadState::Stopped, "downloader stopped");
        *self.run.lock() = None;
        outcome
    }

    async fn run_to_completion(&self, url: &Url, run: &RunControl) -> Result<(), DownloadError> {
        fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(|e| DownloadError::io(&self.config.work_dir, e))?;

        // Make the state file present from the first moment of the run,
        // carrying over whatever a previous run recorded.
        let done = self.store.load().await?;
        self.store.save(&done).await?;

        let playlist = self.load_or_reuse_playlist(url, run).await?;
        let total = playlist.len() as u64;
        info!(
            segments = total,
            media_sequence = playlist.media_sequence,
            "Playlist ready"
        );

        self.prefetch_keys(&playlist, run).await?;

        if run.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let todo: Vec<u64> = (0..total).filter(|i| !done.contains(i)).collect();
        debug!(
            todo = todo.len(),
            resumed = done.len(),
            "Materialized work list"
        );

        self.drive_workers(&playlist, todo, done, total, run).await?;
        self.finalize(total).await
    }

    async fn load_or_reuse_playlist(
        &self,
        url: &Url,
        run: &RunControl,
    ) -> Result<Arc<Playlist>, DownloadError> {
        if let Some((cached_url, playlist)) = self.cached_playlist.lock().clone()
            && &cached_url == url
        {
            debug!("Reusing playlist parsed earlier in this process");
            return Ok(playlist);
        }

        let playlist = tokio::select! {
            biased;
            _ = run.token.cancelled() => return Err(DownloadError::Cancelled),
            res = playlist::load_playlist(
                self.fetcher.as_ref(),
                url,
                self.config.strict_parse,
                self.selector.as_ref(),
            ) => res?,
        };
        let playlist = Arc::new(playlist);
        *self.cached_playlist.lock() = Some((url.clone(), Arc::clone(&playlist)));
        Ok(playlist)
    }

    /// Fetch and cache the key bytes for every encryption spec that does not
    /// have them yet. One fetch per unique spec.
    async fn prefetch_keys(
        &self,
        playlist: &Playlist,
        run: &RunControl,
    ) -> Result<(), DownloadError> {
        let pending: Vec<_> = playlist
            .unique_encryption_specs()
            .into_iter()
            .filter(|spec| spec.key().is_none())
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        info!(keys = pending.len(), "Prefetching decryption keys");

        let policy = RetryPolicy::from_config(&self.config);
        for spec in pending {
            let uri = spec.key_uri.clone();
            let bytes = retry_with_backoff(&policy, &run.token, |_| {
                let uri = uri.clone();
                async move {
                    let fetched = tokio::select! {
                        biased;
                        _ = run.token.cancelled() => {
                            return RetryAction::Fail(DownloadError::Cancelled);
                        }
                        res = async { read_to_end(self.fetcher.fetch(&uri).await?).await } => res,
                    };
                    match fetched {
                        Ok(bytes) => RetryAction::Success(bytes),
                        Err(e) if e.is_retryable() => RetryAction::Retry(e),
                        Err(e) => RetryAction::Fail(e),
                    }
                }
            })
            .await
            .map_err(|e| {
                if e.is_cancellation() {
                    e
                } else {
                    DownloadError::KeyFetchFailed {
                        uri: uri.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;

            if bytes.len() != 16 {
                return Err(DownloadError::KeyLengthInvalid {
                    uri: uri.to_string(),
                    len: bytes.len(),
                });
            }
            let mut key = [0u8; 16];
            key.copy_from_slice(&bytes);
            spec.set_key(key);
            debug!(uri = %uri, "Cached decryption key");
        }
        Ok(())
    }

    async fn drive_workers(
        &self,
        playlist: &Arc<Playlist>,
        todo: Vec<u64>,
        done: BTreeSet<u64>,
        total: u64,
        run: &RunControl,
    ) -> Result<(), DownloadError> {
        if todo.is_empty() {
            return Ok(());
        }

        let shared = Arc::new(tokio::sync::Mutex::new(done));
        let mut queue = todo.into_iter();
        let mut tasks = FuturesUnordered::new();
        let mut first_error: Option<DownloadError> = None;
        let mut cancelled = false;

        loop {
            while tasks.len() < self.config.num_workers {
                let Some(index) = queue.next() else { break };
                let segment = playlist.segments[index as usize].clone();
                let iv_index = playlist.iv_index(&segment);
                let shared = Arc::clone(&shared);
                tasks.push(async move {
                    let result = self
                        .segment_task(&segment, iv_index, total, &shared, run)
                        .await;
                    (segment.index, result)
                });
            }

            match tasks.next().await {
                None => break,
                Some((index, Ok(()))) => {
                    debug!(index, "Segment complete");
                }
                Some((index, Err(err))) => {
                    if err.is_cancellation() {
                        cancelled = true;
                    } else if first_error.is_none() {
                        warn!(index, error = %err, "Segment task failed; interrupting remaining workers");
                        first_error = Some(err);
                        run.token.cancel();
                    } else {
                        debug!(index, error = %err, "Further segment failure after terminal error");
                    }
                }
            }

            if run.token.is_cancelled() {
                cancelled = true;
                // Terminal condition: stop feeding, wind down what is in
                // flight, abandon stragglers after the grace period.
                let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                    while let Some((index, result)) = tasks.next().await {
                        match result {
                            Ok(()) => debug!(index, "Segment completed during wind-down"),
                            Err(err) if err.is_cancellation() => {}
                            Err(err) => {
                                if first_error.is_none() {
                                    first_error = Some(err);
                                }
                            }
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!(
                        outstanding = tasks.len(),
                        "Workers did not stop within the grace period; abandoning them"
                    );
                }
                break;
            }
        }

        // A terminal task error also interrupts the pool; the genuine fault
        // wins over the cancellations it induced.
        if let Some(err) = first_error {
            return Err(err);
        }
        if cancelled || run.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    async fn segment_task(
        &self,
        segment: &Segment,
        iv_index: u64,
        total: u64,
        shared: &tokio::sync::Mutex<BTreeSet<u64>>,
        run: &RunControl,
    ) -> Result<(), DownloadError> {
        run.pause.wait_ready(&run.token).await?;
        if run.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let stream = self.open_segment_stream(segment, iv_index, run).await?;
        let path = segment_path(&self.config.work_dir, segment.index);
        write_stream(stream, &path, &run.token)
            .await
            .map_err(|e| wrap_segment_error(segment.index, e))?;

        {
            let mut done = shared.lock().await;
            done.insert(segment.index);
            self.store.save(&done).await?;
            let count = done.len() as u64;
            if let Some(listener) = &self.progress {
                listener.on_progress(count, total);
            }
        }

        // A cancellation that lands after the write still cancels the run.
        if run.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }

    /// The streaming pipeline for one segment: fetch (with retry), then wrap
    /// in the decryptor when the segment carries an encryption spec. The
    /// returned stream owns the underlying ciphertext stream.
    async fn open_segment_stream(
        &self,
        segment: &Segment,
        iv_index: u64,
        run: &RunControl,
    ) -> Result<ByteStream, DownloadError> {
        if run.token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let policy = RetryPolicy::from_config(&self.config);
        let uri = &segment.uri;
        let index = segment.index;
        let stream = retry_with_backoff(&policy, &run.token, |attempt| async move {
            if attempt > 1 {
                debug!(index, attempt, "Retrying segment fetch");
            }
            let fetched = tokio::select! {
                biased;
                _ = run.token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                res = self.fetcher.fetch(uri) => res,
            };
            match fetched {
                Ok(stream) => RetryAction::Success(stream),
                Err(e) if e.is_retryable() => RetryAction::Retry(e),
                Err(e) => RetryAction::Fail(e),
            }
        })
        .await
        .map_err(|e| wrap_segment_error(index, e))?;

        match &segment.encryption {
            None => Ok(stream),
            Some(spec) => {
                let key = spec
                    .key()
                    .ok_or(DownloadError::KeyMissing { index })?;
                self.decryptor.decrypt(stream, &key, spec, iv_index)
            }
        }
    }

    async fn finalize(&self, total: u64) -> Result<(), DownloadError> {
        let work_dir = &self.config.work_dir;
        let mut inputs = Vec::with_capacity(total as usize);
        for index in 0..total {
            let path = segment_path(work_dir, index);
            let present = fs::try_exists(&path)
                .await
                .map_err(|e| DownloadError::io(&path, e))?;
            if !present {
                return Err(DownloadError::MissingSegment { index });
            }
            inputs.push(path);
        }

        self.combiner
            .combine(&inputs, work_dir, &self.config.output_path)
            .await?;
        self.store.cleanup().await?;
        self.notifier
            .notify(DownloadState::Completed, "download completed");
        Ok(())
    }
}

/// Terminal fetch and local-write failures are attributed to their segment;
/// cancellation and the distinct decryption kinds pass through unchanged.
fn wrap_segment_error(index: u64, err: DownloadError) -> DownloadError {
    match err {
        e if e.is_cancellation() => e,
        e @ (DownloadError::DecryptionFailed { .. } | DownloadError::KeyMissing { .. }) => e,
        e @ DownloadError::SegmentFailed { .. } => e,
        other => DownloadError::SegmentFailed {
            index,
            reason: other.to_string(),
        },
    }
}

/// Copy a byte stream into `path` with create-or-truncate semantics,
/// observing cancellation between chunks.
async fn write_stream(
    mut stream: ByteStream,
    path: &Path,
    token: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => file
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(path, e))?,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    file.flush()
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::stream_from_bytes;
    use bytes::Bytes;
    use std::time::Duration;

    #[test]
    fn segment_files_are_one_indexed() {
        let path = segment_path(Path::new("/tmp/work"), 0);
        assert_eq!(path, PathBuf::from("/tmp/work/segment_1.ts"));
        let path = segment_path(Path::new("/tmp/work"), 41);
        assert_eq!(path, PathBuf::from("/tmp/work/segment_42.ts"));
    }

    #[test]
    fn wrap_segment_error_preserves_cancellation_and_decryption_kinds() {
        assert!(matches!(
            wrap_segment_error(3, DownloadError::Cancelled),
            DownloadError::Cancelled
        ));
        assert!(matches!(
            wrap_segment_error(3, DownloadError::decryption("bad padding")),
            DownloadError::DecryptionFailed { .. }
        ));
        match wrap_segment_error(
            3,
            DownloadError::FetchTransient {
                reason: "reset".to_string(),
            },
        ) {
            DownloadError::SegmentFailed { index, .. } => assert_eq!(index, 3),
            other => panic!("expected SegmentFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = Arc::new(PauseGate::new());
        let token = CancellationToken::new();

        gate.pause();
        let waiter = {
            let gate = Arc::clone(&gate);
            let token = token.clone();
            tokio::spawn(async move { gate.wait_ready(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        waiter
            .await
            .expect("join")
            .expect("gate should open on resume");
    }

    #[tokio::test]
    async fn cancel_overrides_pause() {
        let gate = PauseGate::new();
        let token = CancellationToken::new();
        gate.pause();

        let wait = gate.wait_ready(&token);
        tokio::pin!(wait);
        assert!(
            futures::poll!(&mut wait).is_pending(),
            "gate should be closed"
        );

        token.cancel();
        let result = wait.await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }

    #[tokio::test]
    async fn pause_gate_passes_through_when_not_paused() {
        let gate = PauseGate::new();
        let token = CancellationToken::new();
        gate.wait_ready(&token).await.expect("open gate");
    }

    #[tokio::test]
    async fn write_stream_lands_bytes_and_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment_1.ts");
        tokio::fs::write(&path, b"stale contents that are longer")
            .await
            .expect("seed");

        let token = CancellationToken::new();
        write_stream(stream_from_bytes(Bytes::from_static(b"fresh")), &path, &token)
            .await
            .expect("write");
        assert_eq!(tokio::fs::read(&path).await.expect("read"), b"fresh");
    }

    #[tokio::test]
    async fn write_stream_observes_cancellation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment_1.ts");
        let token = CancellationToken::new();
        token.cancel();

        let stream: ByteStream = Box::pin(futures::stream::pending());
        let result = write_stream(stream, &path, &token).await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
    }
}
