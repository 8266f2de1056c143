use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::{self, ArchiveFormat};
use crate::cancel::CancelToken;
use crate::checksum::ChecksumValidator;
use crate::config::DownloadConfig;
use crate::domain::{DataFile, Policy, UriInput};
use crate::error::AtlasError;
use crate::fetch::{Fetcher, HttpTransport, Transport};
use crate::progress::{ProgressSink, Reporter};
use crate::store::Store;

/// Where one resource is in its pipeline. Only `Fetching` and `Verifying`
/// lead to `Failed` on their own; any stage may fail on I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    Pending,
    Fetching,
    Verifying,
    Extracting,
    Done,
    Failed,
}

/// Outcome of a completed pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub uri: String,
    pub name: String,
    /// Manifest path when the resource was extracted, else the file itself.
    pub path: PathBuf,
    pub local_file: PathBuf,
    pub md5: String,
    pub format: Option<ArchiveFormat>,
    /// Bytes were transferred during this call.
    pub fetched: bool,
    /// Members were unpacked during this call.
    pub extracted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    AllSucceeded,
    PartialSuccess,
    TotalFailure,
}

/// Per-key results of one batch call.
#[derive(Debug, Clone)]
pub struct BatchReport<K> {
    items: BTreeMap<K, Result<Resolved, AtlasError>>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl<K: Ord> BatchReport<K> {
    pub fn status(&self) -> BatchStatus {
        let failed = self.failures().count();
        if failed == 0 {
            BatchStatus::AllSucceeded
        } else if failed == self.items.len() {
            BatchStatus::TotalFailure
        } else {
            BatchStatus::PartialSuccess
        }
    }

    pub fn get(&self, key: &K) -> Option<&Result<Resolved, AtlasError>> {
        self.items.get(key)
    }

    pub fn items(&self) -> &BTreeMap<K, Result<Resolved, AtlasError>> {
        &self.items
    }

    pub fn succeeded(&self) -> impl Iterator<Item = (&K, &Resolved)> {
        self.items
            .iter()
            .filter_map(|(key, result)| result.as_ref().ok().map(|resolved| (key, resolved)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&K, &AtlasError)> {
        self.items
            .iter()
            .filter_map(|(key, result)| result.as_ref().err().map(|err| (key, err)))
    }

    /// Final path per successful key.
    pub fn paths(&self) -> BTreeMap<&K, &Path> {
        self.succeeded()
            .map(|(key, resolved)| (key, resolved.path.as_path()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    /// All-or-nothing view of the batch.
    pub fn into_result(self) -> Result<BTreeMap<K, PathBuf>, AtlasError> {
        let total = self.items.len();
        let failed = self.failures().count();
        if failed > 0 {
            return Err(AtlasError::BatchFailed { failed, total });
        }
        Ok(self
            .items
            .into_iter()
            .filter_map(|(key, result)| result.ok().map(|resolved| (key, resolved.path)))
            .collect())
    }
}

/// One mutex per destination path, shared by every call on a manager.
#[derive(Default)]
struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    fn handle(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = lock_ignoring_poison(&self.locks);
        locks.entry(path.to_path_buf()).or_default().clone()
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Flushes the reporter when a call returns, on every path.
struct FlushOnDrop<'a>(&'a Reporter);

impl Drop for FlushOnDrop<'_> {
    fn drop(&mut self) {
        self.0.flush();
    }
}

/// Composes fetch, checksum and extraction per resource and runs batches of
/// resources over a bounded pool of worker threads.
pub struct DownloadManager<T = HttpTransport> {
    config: DownloadConfig,
    store: Store,
    fetcher: Fetcher<T>,
    checksums: ChecksumValidator,
    reporter: Reporter,
    cancel: CancelToken,
    locks: PathLocks,
}

impl DownloadManager<HttpTransport> {
    pub fn new(config: DownloadConfig) -> Result<Self, AtlasError> {
        let transport = HttpTransport::new(config.fetch_timeout)?;
        Ok(Self::with_transport(config, transport))
    }
}

impl<T: Transport> DownloadManager<T> {
    pub fn with_transport(config: DownloadConfig, transport: T) -> Self {
        Self {
            store: Store::new(config.cache_dir.clone()),
            fetcher: Fetcher::new(transport, config.io_buffer_size),
            checksums: ChecksumValidator::new(config.io_buffer_size),
            reporter: Reporter::silent(),
            cancel: CancelToken::new(),
            locks: PathLocks::default(),
            config,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.reporter = Reporter::new(sink);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling the returned token aborts in-flight and pending work.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn transport(&self) -> &T {
        self.fetcher.transport()
    }

    /// Fetch stage alone: returns the local file, downloading it if the
    /// download policy requires.
    pub fn download(&self, input: impl Into<UriInput>) -> Result<PathBuf, AtlasError> {
        let file = DataFile::parse(input)?;
        let _flush = FlushOnDrop(&self.reporter);
        self.materialize(&file).map(|(path, _)| path)
    }

    /// Verify stage alone, over an already materialized file.
    pub fn compute_checksum(&self, input: impl Into<UriInput>) -> Result<String, AtlasError> {
        let file = DataFile::parse(input)?;
        let _flush = FlushOnDrop(&self.reporter);
        let path = self.existing_local_file(&file)?;
        self.verify(&file, &path)
    }

    /// Extract stage alone, over an already materialized file. Returns the
    /// manifest path, or the file itself when it is not an archive.
    pub fn extract(&self, input: impl Into<UriInput>) -> Result<PathBuf, AtlasError> {
        let file = DataFile::parse(input)?;
        let _flush = FlushOnDrop(&self.reporter);
        let path = self.existing_local_file(&file)?;
        self.unpack(&file, &path).map(|unpacked| unpacked.path)
    }

    pub fn download_and_extract(&self, input: impl Into<UriInput>) -> Result<Resolved, AtlasError> {
        let file = DataFile::parse(input)?;
        let _flush = FlushOnDrop(&self.reporter);
        self.run_pipeline(&file)
    }

    /// Flat form of [`Self::download_and_extract_batch`], keyed by position.
    pub fn download_and_extract_all<I, V>(&self, inputs: I) -> BatchReport<usize>
    where
        I: IntoIterator<Item = V>,
        V: Into<UriInput>,
    {
        self.download_and_extract_batch(inputs.into_iter().enumerate())
    }

    /// Runs every resource through the pipeline and reports per key.
    ///
    /// Keys resolving to the same local path share one pipeline run; the
    /// first descriptor seen for a path wins. A failing resource never
    /// stops its siblings.
    pub fn download_and_extract_batch<K, I, V>(&self, inputs: I) -> BatchReport<K>
    where
        K: Ord + Clone,
        I: IntoIterator<Item = (K, V)>,
        V: Into<UriInput>,
    {
        let started_at = Utc::now();
        let _flush = FlushOnDrop(&self.reporter);
        let mut items = BTreeMap::new();

        let mut jobs: Vec<DataFile> = Vec::new();
        let mut job_keys: Vec<Vec<K>> = Vec::new();
        let mut by_path: HashMap<PathBuf, usize> = HashMap::new();
        for (key, input) in inputs {
            let file = match DataFile::parse(input) {
                Ok(file) => file,
                Err(err) => {
                    tracing::warn!(error = %err, "rejected resource");
                    items.insert(key, Err(err));
                    continue;
                }
            };
            let work_key = self.work_key(&file);
            match by_path.get(&work_key) {
                Some(&idx) => {
                    if jobs[idx].checksum() != file.checksum() {
                        tracing::warn!(
                            uri = %file,
                            "duplicate resource declares a different checksum; using the first"
                        );
                    }
                    job_keys[idx].push(key);
                }
                None => {
                    by_path.insert(work_key, jobs.len());
                    jobs.push(file);
                    job_keys.push(vec![key]);
                }
            }
        }

        let mut results = self.run_pool(jobs);
        for (idx, keys) in job_keys.into_iter().enumerate() {
            let result = results
                .remove(&idx)
                .unwrap_or_else(|| Err(AtlasError::Cancelled("worker pool stopped".to_string())));
            for key in keys {
                items.insert(key, result.clone());
            }
        }

        BatchReport {
            items,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn run_pool(&self, jobs: Vec<DataFile>) -> HashMap<usize, Result<Resolved, AtlasError>> {
        if jobs.is_empty() {
            return HashMap::new();
        }
        let workers = self.config.max_workers.max(1).min(jobs.len());
        tracing::debug!(resources = jobs.len(), workers, "starting batch");

        let queue = Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = lock_ignoring_poison(queue).pop_front();
                        let Some((idx, file)) = next else {
                            break;
                        };
                        let result = match self.cancel.check(file.uri()) {
                            Ok(()) => self.run_pipeline(&file),
                            Err(err) => Err(err),
                        };
                        if tx.send((idx, result)).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(tx);
        rx.into_iter().collect()
    }

    /// Identity used to collapse duplicates within a batch.
    fn work_key(&self, file: &DataFile) -> PathBuf {
        match file.local_path() {
            Some(path) => path.to_path_buf(),
            None => self.store.download_path(file),
        }
    }

    fn run_pipeline(&self, file: &DataFile) -> Result<Resolved, AtlasError> {
        transition(file, ResourceState::Pending);
        let outcome = self.run_stages(file);
        match &outcome {
            Ok(_) => transition(file, ResourceState::Done),
            Err(err) => {
                transition(file, ResourceState::Failed);
                tracing::warn!(uri = %file, error = %err, "resource failed");
            }
        }
        outcome
    }

    fn run_stages(&self, file: &DataFile) -> Result<Resolved, AtlasError> {
        transition(file, ResourceState::Fetching);
        let (local_file, fetched) = self.materialize(file)?;

        self.cancel.check(file.uri())?;
        transition(file, ResourceState::Verifying);
        let md5 = self.verify(file, &local_file)?;

        self.cancel.check(file.uri())?;
        transition(file, ResourceState::Extracting);
        let unpacked = self.unpack(file, &local_file)?;

        Ok(Resolved {
            uri: file.uri().to_string(),
            name: file.name().to_string(),
            path: unpacked.path,
            local_file,
            md5,
            format: unpacked.format,
            fetched,
            extracted: unpacked.extracted,
        })
    }

    /// Returns the local file for `file` and whether it was transferred now.
    fn materialize(&self, file: &DataFile) -> Result<(PathBuf, bool), AtlasError> {
        if file.is_local()? {
            if let Some(path) = file.local_path() {
                return Ok((path.to_path_buf(), false));
            }
        }

        let destination = self.store.download_path(file);
        let handle = self.locks.handle(&destination);
        let _guard = lock_ignoring_poison(&handle);

        let cached = destination.is_file();
        match self.config.download_policy {
            Policy::Never if cached => Ok((destination, false)),
            Policy::Never => Err(AtlasError::DownloadDisallowed(file.uri().to_string())),
            Policy::Missing if cached => {
                tracing::debug!(uri = %file, path = %destination.display(), "reusing cached download");
                Ok((destination, false))
            }
            Policy::Missing | Policy::Always => {
                let path = self.fetch_with_retries(file, &destination)?;
                Ok((path, true))
            }
        }
    }

    fn fetch_with_retries(&self, file: &DataFile, destination: &Path) -> Result<PathBuf, AtlasError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            self.cancel.check(file.uri())?;
            match self
                .fetcher
                .fetch(file, destination, &self.reporter, &self.cancel)
            {
                Ok(path) => {
                    ChecksumValidator::invalidate(&path)?;
                    return Ok(path);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(uri = %file, attempt, error = %err, "transfer failed, retrying");
                    thread::sleep(self.config.retry_delay * attempt);
                    attempt += 1;
                }
                Err(mut err) => {
                    if let AtlasError::Fetch { attempts, .. } = &mut err {
                        *attempts = attempt;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// The digest is computed and memoized even when validation is off.
    fn verify(&self, file: &DataFile, path: &Path) -> Result<String, AtlasError> {
        let handle = self.locks.handle(path);
        let _guard = lock_ignoring_poison(&handle);
        let digest = self.checksums.compute_or_load(path, &self.reporter)?;
        if self.config.validate_checksums && self.checksums.validate(file, &digest)? {
            tracing::debug!(uri = %file, md5 = %digest, "checksum verified");
        }
        Ok(digest)
    }

    fn unpack(&self, file: &DataFile, path: &Path) -> Result<Unpacked, AtlasError> {
        let passthrough = |format| Unpacked {
            path: path.to_path_buf(),
            format,
            extracted: false,
        };
        if self.config.extract_policy == Policy::Never {
            return Ok(passthrough(None));
        }
        let Some(format) = archive::detect_format(path)? else {
            tracing::debug!(uri = %file, "not an archive, passing through");
            return Ok(passthrough(None));
        };

        let target = self.store.extraction_dir(file);
        let manifest_path = Store::manifest_path(&target);
        let handle = self.locks.handle(&target);
        let _guard = lock_ignoring_poison(&handle);

        if self.config.extract_policy == Policy::Missing && manifest_path.is_file() {
            tracing::debug!(uri = %file, manifest = %manifest_path.display(), "reusing extraction");
            return Ok(Unpacked {
                path: manifest_path,
                format: Some(format),
                extracted: false,
            });
        }

        self.cancel.check(file.uri())?;
        let manifest = archive::extract(path, format, &target, &self.reporter)?;
        manifest.write(&manifest_path)?;
        tracing::info!(
            uri = %file,
            format = %format,
            members = manifest.len(),
            target = %target.display(),
            "extracted"
        );
        Ok(Unpacked {
            path: manifest_path,
            format: Some(format),
            extracted: true,
        })
    }

    /// Local file of a resource that must already be on disk.
    fn existing_local_file(&self, file: &DataFile) -> Result<PathBuf, AtlasError> {
        if file.is_local()? {
            if let Some(path) = file.local_path() {
                return Ok(path.to_path_buf());
            }
        }
        let cached = self.store.download_path(file);
        if cached.is_file() {
            Ok(cached)
        } else {
            Err(AtlasError::MissingLocalFile(cached))
        }
    }
}

struct Unpacked {
    path: PathBuf,
    format: Option<ArchiveFormat>,
    extracted: bool,
}

fn transition(file: &DataFile, state: ResourceState) {
    tracing::debug!(uri = %file, state = ?state, "resource state");
}
