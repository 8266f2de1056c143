#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use md5::{Digest, Md5};
use reqwest::Url;

use st_atlas_datasets::cancel::CancelToken;
use st_atlas_datasets::config::DownloadConfig;
use st_atlas_datasets::error::AtlasError;
use st_atlas_datasets::fetch::{RemoteBody, Transport};
use st_atlas_datasets::progress::{ProgressEvent, ProgressSink};

pub fn config(root: &Path) -> DownloadConfig {
    let cache_dir = Utf8PathBuf::from_path_buf(root.to_path_buf()).unwrap();
    DownloadConfig {
        max_workers: 4,
        retry_delay: Duration::ZERO,
        ..DownloadConfig::with_cache_dir(cache_dir)
    }
}

pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

#[derive(Default)]
struct MockState {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, VecDeque<AtlasError>>>,
    cancel_on_read: Mutex<HashMap<String, CancelToken>>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight_same_url: AtomicUsize,
    in_flight_total: AtomicUsize,
    max_in_flight_total: AtomicUsize,
}

/// In-memory transport. Clones share state, so a test can keep one clone
/// for assertions while the manager owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` holds its transfer slot for `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.state
            .bodies
            .lock()
            .unwrap()
            .insert(key(url), body.into());
    }

    /// Queues an error returned by the next `open` of `url`.
    pub fn fail_next(&self, url: &str, error: AtlasError) {
        self.state
            .failures
            .lock()
            .unwrap()
            .entry(key(url))
            .or_default()
            .push_back(error);
    }

    /// Cancels `token` as soon as the body of `url` is first read.
    pub fn cancel_while_reading(&self, url: &str, token: CancelToken) {
        self.state
            .cancel_on_read
            .lock()
            .unwrap()
            .insert(key(url), token);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .get(&key(url))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight_total.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_same_url(&self) -> usize {
        self.state.max_in_flight_same_url.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &Url) -> Result<RemoteBody, AtlasError> {
        let url_key = url.as_str().to_string();
        *self
            .state
            .calls
            .lock()
            .unwrap()
            .entry(url_key.clone())
            .or_default() += 1;

        let injected = self
            .state
            .failures
            .lock()
            .unwrap()
            .get_mut(&url_key)
            .and_then(VecDeque::pop_front);
        if let Some(err) = injected {
            return Err(err);
        }
        let body = self.state.bodies.lock().unwrap().get(&url_key).cloned();
        let Some(body) = body else {
            return Err(not_found(url.as_str()));
        };

        {
            let mut in_flight = self.state.in_flight.lock().unwrap();
            let same = in_flight.entry(url_key.clone()).or_default();
            *same += 1;
            self.state
                .max_in_flight_same_url
                .fetch_max(*same, Ordering::SeqCst);
        }
        let total = self.state.in_flight_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_in_flight_total
            .fetch_max(total, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let cancel = self.state.cancel_on_read.lock().unwrap().get(&url_key).cloned();
        let length = body.len() as u64;
        Ok(RemoteBody {
            reader: Box::new(TrackedBody {
                inner: Cursor::new(body),
                state: self.state.clone(),
                url: url_key,
                cancel,
            }),
            total: Some(length),
        })
    }
}

/// Releases its in-flight slot when the fetcher drops it.
struct TrackedBody {
    inner: Cursor<Vec<u8>>,
    state: Arc<MockState>,
    url: String,
    cancel: Option<CancelToken>,
}

impl Read for TrackedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
        self.inner.read(buf)
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.state.in_flight.lock() {
            if let Some(count) = in_flight.get_mut(&self.url) {
                *count -= 1;
            }
        }
        self.state.in_flight_total.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn not_found(url: &str) -> AtlasError {
    AtlasError::Fetch {
        uri: url.to_string(),
        message: "server answered 404 Not Found".to_string(),
        attempts: 1,
        transient: false,
    }
}

pub fn unavailable(url: &str) -> AtlasError {
    AtlasError::Fetch {
        uri: url.to_string(),
        message: "server answered 503 Service Unavailable".to_string(),
        attempts: 1,
        transient: true,
    }
}

/// Keeps every event and counts flushes.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    flushes: AtomicUsize,
}

impl RecordingProgress {
    pub fn started_labels(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::Started { label, .. } => Some(*label),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl ProgressSink for RecordingProgress {
    fn event(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    append_files(&mut builder, files);
    builder.into_inner().unwrap()
}

pub fn tar_gz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_files(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn tar_bz2_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_files(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn tar_xz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    let mut builder = tar::Builder::new(encoder);
    append_files(&mut builder, files);
    builder.into_inner().unwrap().finish().unwrap()
}

fn append_files<W: Write>(builder: &mut tar::Builder<W>, files: &[(&str, &[u8])]) {
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
}

/// A tar whose single member climbs out of the extraction directory.
/// `Builder::append_data` refuses such names, so the header is written raw.
pub fn traversal_tar_bytes(member: &str, data: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..member.len()].copy_from_slice(member.as_bytes());
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, data).unwrap();
    builder.into_inner().unwrap()
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn key(url: &str) -> String {
    Url::parse(url).unwrap().as_str().to_string()
}
