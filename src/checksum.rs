use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::domain::DataFile;
use crate::error::AtlasError;
use crate::progress::{Reporter, TASK_CHECKSUM};
use crate::store::Store;

pub const DIGEST_ALGORITHM: &str = "md5";

/// Sidecar record of the last computed digest. The digest is only trusted
/// while the file still has the size and modification time recorded here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumMemo {
    pub md5: String,
    pub size: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl ChecksumMemo {
    fn for_file(path: &Path, md5: String) -> Result<Self, AtlasError> {
        let (size, modified_secs, modified_nanos) = fingerprint(path)?;
        Ok(Self {
            md5,
            size,
            modified_secs,
            modified_nanos,
        })
    }

    fn matches(&self, path: &Path) -> bool {
        fingerprint(path)
            .map(|(size, secs, nanos)| {
                size == self.size && secs == self.modified_secs && nanos == self.modified_nanos
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct ChecksumValidator {
    buffer_size: usize,
}

impl ChecksumValidator {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// `{file}.md5sum` next to the file.
    pub fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{DIGEST_ALGORITHM}sum"));
        path.with_file_name(name)
    }

    /// Returns the memoized digest if the sidecar is present and its
    /// fingerprint still matches the file.
    pub fn load_memo(path: &Path) -> Option<String> {
        let raw = fs::read_to_string(Self::sidecar_path(path)).ok()?;
        let memo: ChecksumMemo = serde_json::from_str(&raw).ok()?;
        memo.matches(path).then_some(memo.md5)
    }

    pub fn compute_or_load(&self, path: &Path, reporter: &Reporter) -> Result<String, AtlasError> {
        if let Some(digest) = Self::load_memo(path) {
            tracing::debug!(path = %path.display(), "using memoized checksum");
            return Ok(digest);
        }
        // Fingerprint before hashing so a concurrent edit invalidates the memo.
        let memo_base = ChecksumMemo::for_file(path, String::new())?;
        let digest = self.compute(path, reporter)?;
        let memo = ChecksumMemo {
            md5: digest.clone(),
            ..memo_base
        };
        let bytes =
            serde_json::to_vec(&memo).map_err(|err| AtlasError::Filesystem(err.to_string()))?;
        Store::write_bytes_atomic(&Self::sidecar_path(path), &bytes)?;
        Ok(digest)
    }

    /// Streams the file through MD5 without consulting the memo.
    pub fn compute(&self, path: &Path, reporter: &Reporter) -> Result<String, AtlasError> {
        let mut file = File::open(path)
            .map_err(|err| AtlasError::Filesystem(format!("open {}: {err}", path.display())))?;
        let total = file.metadata().ok().map(|meta| meta.len());
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut task = reporter.task(TASK_CHECKSUM, &name, total);

        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; self.buffer_size];
        loop {
            let read = file
                .read(&mut buffer)
                .map_err(|err| AtlasError::Filesystem(format!("read {}: {err}", path.display())))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            task.advance(read as u64);
        }
        task.finish();
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn invalidate(path: &Path) -> Result<(), AtlasError> {
        match fs::remove_file(Self::sidecar_path(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AtlasError::Filesystem(err.to_string())),
        }
    }

    /// `Ok(true)` when the expected checksum was compared and matched,
    /// `Ok(false)` when the descriptor declares none.
    pub fn validate(&self, file: &DataFile, computed: &str) -> Result<bool, AtlasError> {
        let Some(expected) = file.checksum() else {
            return Ok(false);
        };
        if expected != computed {
            return Err(AtlasError::ChecksumMismatch {
                path: file.uri().to_string(),
                expected: expected.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(true)
    }
}

fn fingerprint(path: &Path) -> Result<(u64, u64, u32), AtlasError> {
    let meta = fs::metadata(path)
        .map_err(|err| AtlasError::Filesystem(format!("stat {}: {err}", path.display())))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .unwrap_or_default();
    Ok((meta.len(), modified.as_secs(), modified.subsec_nanos()))
}
