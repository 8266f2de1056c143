use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use md5::{Digest, Md5};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::AtlasError;

const REMOTE_SCHEMES: &[&str] = &["http", "https"];

/// Whether an action is forced, forbidden, or only performed when its output
/// is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Always,
    Never,
    #[default]
    Missing,
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Always => write!(f, "always"),
            Policy::Never => write!(f, "never"),
            Policy::Missing => write!(f, "missing"),
        }
    }
}

impl FromStr for Policy {
    type Err = AtlasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Policy::Always),
            "never" => Ok(Policy::Never),
            "missing" => Ok(Policy::Missing),
            _ => Err(AtlasError::InvalidConfig(format!(
                "unknown policy '{value}' (expected always, never or missing)"
            ))),
        }
    }
}

/// Structured form of a resource, as found in dataset configs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileRecord {
    pub uri: String,
    #[serde(default, alias = "md5sum")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

impl DataFileRecord {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            checksum: None,
            size: None,
            name: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ResourceEntry {
    Shorthand(String),
    Detailed(DataFileRecord),
}

/// Every shape a caller may hand to the engine. Normalized to a [`DataFile`]
/// at the boundary by [`DataFile::parse`].
#[derive(Debug, Clone)]
pub enum UriInput {
    FromString(String),
    FromPath(PathBuf),
    FromRecord(DataFileRecord),
    Descriptor(DataFile),
}

impl From<&str> for UriInput {
    fn from(value: &str) -> Self {
        UriInput::FromString(value.to_string())
    }
}

impl From<String> for UriInput {
    fn from(value: String) -> Self {
        UriInput::FromString(value)
    }
}

impl From<PathBuf> for UriInput {
    fn from(value: PathBuf) -> Self {
        UriInput::FromPath(value)
    }
}

impl From<&Path> for UriInput {
    fn from(value: &Path) -> Self {
        UriInput::FromPath(value.to_path_buf())
    }
}

impl From<DataFileRecord> for UriInput {
    fn from(value: DataFileRecord) -> Self {
        UriInput::FromRecord(value)
    }
}

impl From<DataFile> for UriInput {
    fn from(value: DataFile) -> Self {
        UriInput::Descriptor(value)
    }
}

impl From<&DataFile> for UriInput {
    fn from(value: &DataFile) -> Self {
        UriInput::Descriptor(value.clone())
    }
}

impl From<ResourceEntry> for UriInput {
    fn from(value: ResourceEntry) -> Self {
        match value {
            ResourceEntry::Shorthand(uri) => UriInput::FromString(uri),
            ResourceEntry::Detailed(record) => UriInput::FromRecord(record),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Remote(Url),
    Local(PathBuf),
}

/// Immutable description of one remote or local artifact.
///
/// Pipeline stages never mutate a descriptor; they derive a new one with
/// [`DataFile::with_changes`] or one of its shorthands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    uri: String,
    location: Location,
    checksum: Option<String>,
    size: Option<u64>,
    name: String,
}

/// Fields to replace in [`DataFile::with_changes`]. `None` keeps the current
/// value; the nested options allow clearing a field.
#[derive(Debug, Clone, Default)]
pub struct DataFileChanges {
    pub uri: Option<String>,
    pub checksum: Option<Option<String>>,
    pub size: Option<Option<u64>>,
    pub name: Option<String>,
}

impl DataFile {
    pub fn parse(input: impl Into<UriInput>) -> Result<Self, AtlasError> {
        match input.into() {
            UriInput::FromString(uri) => Self::from_parts(&uri, None, None, None),
            UriInput::FromPath(path) => {
                if !path.is_file() {
                    return Err(AtlasError::InvalidResource(format!(
                        "{} is not an existing local file",
                        path.display()
                    )));
                }
                let uri = path.display().to_string();
                Self::build(uri, Location::Local(path), None, None, None)
            }
            UriInput::FromRecord(record) => {
                Self::from_parts(&record.uri, record.checksum, record.size, record.name)
            }
            UriInput::Descriptor(file) => Ok(file),
        }
    }

    fn from_parts(
        uri: &str,
        checksum: Option<String>,
        size: Option<u64>,
        name: Option<String>,
    ) -> Result<Self, AtlasError> {
        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(AtlasError::InvalidResource("empty URI".to_string()));
        }
        let location = match Url::parse(trimmed) {
            // Windows drive letters parse as one-letter schemes.
            Ok(url) if url.scheme().len() > 1 => locate_url(url)?,
            _ => {
                let path = PathBuf::from(trimmed);
                if !path.is_file() {
                    return Err(AtlasError::InvalidResource(format!(
                        "{trimmed} is neither an existing local file nor a supported URI"
                    )));
                }
                Location::Local(path)
            }
        };
        Self::build(trimmed.to_string(), location, checksum, size, name)
    }

    fn build(
        uri: String,
        location: Location,
        checksum: Option<String>,
        size: Option<u64>,
        name: Option<String>,
    ) -> Result<Self, AtlasError> {
        let name = match name.map(|value| value.trim().to_string()) {
            Some(value) if !value.is_empty() => value,
            _ => derive_name(&location).ok_or_else(|| {
                AtlasError::InvalidResource(format!("cannot derive a file name from {uri}"))
            })?,
        };
        if name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(AtlasError::InvalidResource(format!(
                "file name must not contain path separators: {name}"
            )));
        }
        let checksum = checksum
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        Ok(Self {
            uri,
            location,
            checksum,
            size,
            name,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_url(&self) -> Option<&Url> {
        match &self.location {
            Location::Remote(url) => Some(url),
            Location::Local(_) => None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.location {
            Location::Remote(_) => None,
            Location::Local(path) => Some(path),
        }
    }

    /// Whether the descriptor already points at a file on disk. A local
    /// location whose file has disappeared is an error, not a download.
    pub fn is_local(&self) -> Result<bool, AtlasError> {
        match &self.location {
            Location::Remote(_) => Ok(false),
            Location::Local(path) if path.is_file() => Ok(true),
            Location::Local(path) => Err(AtlasError::MissingLocalFile(path.clone())),
        }
    }

    /// Every suffix of the file name, e.g. `.tar.gz` for `spatial.tar.gz`.
    pub fn extension(&self) -> &str {
        match self.name.char_indices().skip(1).find(|(_, ch)| *ch == '.') {
            Some((idx, _)) => &self.name[idx..],
            None => "",
        }
    }

    pub fn stem(&self) -> &str {
        let ext = self.extension();
        &self.name[..self.name.len() - ext.len()]
    }

    pub fn uri_hash(&self) -> String {
        hex::encode(Md5::digest(self.uri.as_bytes()))
    }

    /// `{cache_dir}/downloads/{md5(uri)}/{name}`. Pure: no filesystem access.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir
            .join("downloads")
            .join(self.uri_hash())
            .join(&self.name)
    }

    pub fn with_changes(&self, changes: DataFileChanges) -> Result<Self, AtlasError> {
        let (uri, location) = match changes.uri {
            Some(uri) if uri != self.uri => {
                let parsed = Self::from_parts(&uri, None, None, Some(self.name.clone()))?;
                (parsed.uri, parsed.location)
            }
            _ => (self.uri.clone(), self.location.clone()),
        };
        Self::build(
            uri,
            location,
            changes.checksum.unwrap_or_else(|| self.checksum.clone()),
            changes.size.unwrap_or(self.size),
            Some(changes.name.unwrap_or_else(|| self.name.clone())),
        )
    }
}

impl fmt::Display for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

impl FromStr for DataFile {
    type Err = AtlasError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

fn locate_url(url: Url) -> Result<Location, AtlasError> {
    if REMOTE_SCHEMES.contains(&url.scheme()) {
        return Ok(Location::Remote(url));
    }
    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|_| AtlasError::InvalidResource(format!("invalid file URI: {url}")))?;
        return Ok(Location::Local(path));
    }
    Err(AtlasError::InvalidResource(format!(
        "unsupported URI scheme '{}' in {url}",
        url.scheme()
    )))
}

fn derive_name(location: &Location) -> Option<String> {
    match location {
        Location::Remote(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(str::to_string),
        Location::Local(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    }
}
