use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum AtlasError {
    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error("local file does not exist: {}", .0.display())]
    MissingLocalFile(PathBuf),

    #[error("download policy is 'never' and {0} is not available locally")]
    DownloadDisallowed(String),

    #[error("failed to fetch {uri} (attempt {attempts}): {message}")]
    Fetch {
        uri: String,
        message: String,
        attempts: u32,
        transient: bool,
    },

    #[error("checksum mismatch for {path}: expected {expected}, computed {computed}")]
    #[diagnostic(help("re-run with download policy 'always' to fetch a fresh copy"))]
    ChecksumMismatch {
        path: String,
        expected: String,
        computed: String,
    },

    #[error("failed to extract {archive}: {message}")]
    Extraction {
        archive: String,
        member: Option<String>,
        message: String,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("failed to read config file at {}", .0.display())]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("{failed} of {total} resources failed")]
    BatchFailed { failed: usize, total: usize },
}

impl AtlasError {
    /// Only transient transfer faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AtlasError::Fetch {
                transient: true,
                ..
            }
        )
    }

    pub(crate) fn fetch(uri: &str, message: impl Into<String>, transient: bool) -> Self {
        AtlasError::Fetch {
            uri: uri.to_string(),
            message: message.into(),
            attempts: 1,
            transient,
        }
    }

    pub(crate) fn extraction(archive: &std::path::Path, message: impl Into<String>) -> Self {
        AtlasError::Extraction {
            archive: archive.display().to_string(),
            member: None,
            message: message.into(),
        }
    }
}
