use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;

use crate::domain::DataFile;
use crate::error::AtlasError;

pub const MANIFEST_FILE_NAME: &str = "extracted_files.json";

/// Layout of the local cache, the only durable state of the engine:
///
/// ```text
/// {root}/downloads/{md5(uri)}/{name}          fetched bytes
/// {root}/downloads/{md5(uri)}/{name}.md5sum   checksum memo
/// {root}/extracted/{md5(uri)}/{name}/          extraction target
/// {root}/extracted/{md5(uri)}/{name}/extracted_files.json
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Utf8PathBuf {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("st-atlas-datasets"))
                    .ok()
            })
            .unwrap_or_else(|| Utf8PathBuf::from("data"))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn downloads_dir(&self) -> Utf8PathBuf {
        self.root.join("downloads")
    }

    pub fn extracted_dir(&self) -> Utf8PathBuf {
        self.root.join("extracted")
    }

    pub fn download_path(&self, file: &DataFile) -> PathBuf {
        file.cache_path(self.root.as_std_path())
    }

    pub fn extraction_dir(&self, file: &DataFile) -> PathBuf {
        self.extracted_dir()
            .as_std_path()
            .join(file.uri_hash())
            .join(file.name())
    }

    pub fn manifest_path(extraction_dir: &Path) -> PathBuf {
        extraction_dir.join(MANIFEST_FILE_NAME)
    }

    /// Sibling a transfer streams into before it is renamed into place.
    pub fn partial_path(destination: &Path) -> PathBuf {
        let mut name = destination
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        destination.with_file_name(name)
    }

    pub fn clear(&self) -> Result<bool, AtlasError> {
        if !self.root.as_std_path().exists() {
            return Ok(false);
        }
        fs::remove_dir_all(self.root.as_std_path())
            .map_err(|err| AtlasError::Filesystem(format!("clear {}: {err}", self.root)))?;
        Ok(true)
    }

    /// Writes through a uniquely named sibling temp file, then renames it
    /// over `path`.
    pub fn write_bytes_atomic(path: &Path, content: &[u8]) -> Result<(), AtlasError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|err| AtlasError::Filesystem(err.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| AtlasError::Filesystem(format!("temp file in {}: {err}", parent.display())))?;
        tmp.write_all(content)
            .map_err(|err| AtlasError::Filesystem(format!("write {}: {err}", path.display())))?;
        tmp.persist(path)
            .map_err(|err| AtlasError::Filesystem(format!("rename {}: {}", path.display(), err.error)))?;
        Ok(())
    }
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}
