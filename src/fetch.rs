use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::cancel::CancelToken;
use crate::domain::DataFile;
use crate::error::AtlasError;
use crate::progress::{Reporter, TASK_DOWNLOAD};
use crate::store::Store;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// An open response body and its advertised length, if any.
pub struct RemoteBody {
    pub reader: Box<dyn Read + Send>,
    pub total: Option<u64>,
}

/// Source of remote bytes. Failures must come back as
/// [`AtlasError::Fetch`] with `transient` set for faults worth retrying.
pub trait Transport: Send + Sync {
    fn open(&self, url: &Url) -> Result<RemoteBody, AtlasError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `timeout` is a stall deadline: it bounds the wait for response
    /// headers and then each read of the body, not the attempt as a whole.
    pub fn new(timeout: Duration) -> Result<Self, AtlasError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("st-atlas/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AtlasError::Http(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|err| AtlasError::Http(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &Url) -> Result<RemoteBody, AtlasError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|err| AtlasError::fetch(url.as_str(), err.to_string(), is_retryable_error(&err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AtlasError::fetch(
                url.as_str(),
                format!("server answered {status}"),
                is_retryable_status(status.as_u16()),
            ));
        }
        let total = response.content_length();
        Ok(RemoteBody {
            reader: Box::new(response),
            total,
        })
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Streams one resource to disk. A single call is a single attempt; retries
/// belong to the caller.
pub struct Fetcher<T> {
    transport: T,
    buffer_size: usize,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, buffer_size: usize) -> Self {
        Self {
            transport,
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Materializes `file` at `destination` and returns the resulting path.
    ///
    /// A descriptor that already names a local file is returned as is, with
    /// no I/O. Remote bytes land in `{destination}.part` first and are only
    /// renamed onto `destination` once the transfer is complete; a failed or
    /// cancelled attempt leaves the partial file behind.
    pub fn fetch(
        &self,
        file: &DataFile,
        destination: &Path,
        reporter: &Reporter,
        cancel: &CancelToken,
    ) -> Result<PathBuf, AtlasError> {
        if file.is_local()? {
            if let Some(path) = file.local_path() {
                return Ok(path.to_path_buf());
            }
        }
        let url = file.remote_url().ok_or_else(|| {
            AtlasError::InvalidResource(format!("{} has no remote location", file.uri()))
        })?;
        cancel.check(file.uri())?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| AtlasError::fetch(file.uri(), err.to_string(), false))?;
        }
        let partial = Store::partial_path(destination);
        let body = self.transport.open(url)?;
        let total = body.total.or(file.size());
        tracing::debug!(uri = %file, total = ?total, path = %partial.display(), "transfer started");

        let mut task = reporter.task(TASK_DOWNLOAD, file.name(), total);
        let out = File::create(&partial).map_err(|err| {
            AtlasError::fetch(file.uri(), format!("create {}: {err}", partial.display()), false)
        })?;
        let mut out = BufWriter::new(out);
        let mut reader = body.reader;
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            cancel.check(file.uri())?;
            let read = match reader.read(&mut buffer) {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(AtlasError::fetch(file.uri(), err.to_string(), true)),
            };
            if read == 0 {
                break;
            }
            out.write_all(&buffer[..read]).map_err(|err| {
                AtlasError::fetch(file.uri(), format!("write {}: {err}", partial.display()), false)
            })?;
            task.advance(read as u64);
        }
        out.flush().map_err(|err| {
            AtlasError::fetch(file.uri(), format!("write {}: {err}", partial.display()), false)
        })?;
        drop(out);

        let written = task.done();
        task.finish();
        if let Some(expected) = file.size() {
            if expected != written {
                return Err(AtlasError::fetch(
                    file.uri(),
                    format!("expected {expected} bytes, received {written}"),
                    true,
                ));
            }
        }

        fs::rename(&partial, destination).map_err(|err| {
            AtlasError::fetch(
                file.uri(),
                format!("rename {}: {err}", destination.display()),
                false,
            )
        })?;
        tracing::info!(uri = %file, bytes = written, path = %destination.display(), "downloaded");
        Ok(destination.to_path_buf())
    }
}
