use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use tar::Archive;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::error::AtlasError;
use crate::progress::{ProgressReader, Reporter, TASK_EXTRACT};
use crate::store::{Store, atomic_rename_dir};

const TAR_BLOCK: usize = 512;
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZIP_MAGICS: &[&[u8]] = &[b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveFormat {
    /// Registration order; magic probing follows it.
    pub const ALL: [ArchiveFormat; 5] = [
        ArchiveFormat::Tar,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarBz2,
        ArchiveFormat::TarXz,
        ArchiveFormat::Zip,
    ];

    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            ArchiveFormat::Tar => &[".tar"],
            ArchiveFormat::TarGz => &[".tar.gz", ".tgz"],
            ArchiveFormat::TarBz2 => &[".tar.bz2", ".tbz2"],
            ArchiveFormat::TarXz => &[".tar.xz", ".txz"],
            ArchiveFormat::Zip => &[".zip"],
        }
    }

    pub fn is_tar_family(self) -> bool {
        !matches!(self, ArchiveFormat::Zip)
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.extensions().iter().any(|ext| lower.ends_with(ext)))
    }

    fn matches_magic(self, path: &Path) -> Result<bool, AtlasError> {
        let mut file = open(path)?;
        let mut magic = [0u8; 6];
        let read = read_up_to(&mut file, &mut magic)?;
        let magic = &magic[..read];
        let matched = match self {
            ArchiveFormat::Tar => head_is_tar(open(path)?),
            ArchiveFormat::TarGz => {
                magic.starts_with(GZIP_MAGIC) && head_is_tar(GzDecoder::new(open(path)?))
            }
            ArchiveFormat::TarBz2 => {
                magic.starts_with(BZIP2_MAGIC) && head_is_tar(BzDecoder::new(open(path)?))
            }
            ArchiveFormat::TarXz => {
                magic.starts_with(XZ_MAGIC) && head_is_tar(XzDecoder::new(open(path)?))
            }
            ArchiveFormat::Zip => ZIP_MAGICS.iter().any(|sig| magic.starts_with(sig)),
        };
        Ok(matched)
    }
}

impl std::fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ext = self.extensions()[0].trim_start_matches('.');
        write!(f, "{ext}")
    }
}

/// Classifies a file: extension first, then magic bytes in registration
/// order. `Ok(None)` means the file is not an archive and passes through.
pub fn detect_format(path: &Path) -> Result<Option<ArchiveFormat>, AtlasError> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(format) = ArchiveFormat::from_file_name(&name) {
        return Ok(Some(format));
    }
    for format in ArchiveFormat::ALL {
        if format.matches_magic(path)? {
            return Ok(Some(format));
        }
    }
    Ok(None)
}

/// Archive member (relative, `/`-separated) to extracted absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionManifest(BTreeMap<String, PathBuf>);

impl ExtractionManifest {
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn get(&self, member: &str) -> Option<&Path> {
        self.0.get(member).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn read(path: &Path) -> Result<Self, AtlasError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AtlasError::Filesystem(format!("read {}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| AtlasError::Filesystem(format!("parse {}: {err}", path.display())))
    }

    pub fn write(&self, path: &Path) -> Result<(), AtlasError> {
        let content =
            serde_json::to_vec_pretty(self).map_err(|err| AtlasError::Filesystem(err.to_string()))?;
        Store::write_bytes_atomic(path, &content)
    }
}

/// Unpacks every member of `archive` into `target_dir`.
///
/// All member paths are validated before anything is written; an archive
/// with a member that would escape `target_dir` is rejected whole. Members
/// are unpacked into a staging directory next to `target_dir`, which then
/// replaces `target_dir`.
pub fn extract(
    archive: &Path,
    format: ArchiveFormat,
    target_dir: &Path,
    reporter: &Reporter,
) -> Result<ExtractionManifest, AtlasError> {
    let members = if format.is_tar_family() {
        scan_tar(archive, format)?
    } else {
        scan_zip(archive)?
    };

    let parent = target_dir.parent().ok_or_else(|| {
        AtlasError::extraction(archive, format!("invalid target {}", target_dir.display()))
    })?;
    fs::create_dir_all(parent).map_err(|err| AtlasError::Filesystem(err.to_string()))?;
    let staging = tempfile::Builder::new()
        .prefix(".extract-")
        .tempdir_in(parent)
        .map_err(|err| AtlasError::Filesystem(err.to_string()))?;

    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let total = fs::metadata(archive).ok().map(|meta| meta.len());
    let task = reporter.task(TASK_EXTRACT, &name, total);
    if format.is_tar_family() {
        let reader = ProgressReader::new(BufReader::new(open(archive)?), task);
        unpack_tar(archive, decoder_for(format, reader), staging.path())?;
    } else {
        unpack_zip(archive, staging.path(), task)?;
    }

    let staging_path = staging.keep();
    atomic_rename_dir(&staging_path, target_dir).map_err(|err| {
        AtlasError::extraction(archive, format!("move into {}: {err}", target_dir.display()))
    })?;

    Ok(ExtractionManifest(
        members
            .into_iter()
            .map(|(member, relative)| (member, target_dir.join(relative)))
            .collect(),
    ))
}

fn decoder_for<'a, R: Read + 'a>(format: ArchiveFormat, reader: R) -> Box<dyn Read + 'a> {
    match format {
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(reader)),
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(reader)),
        ArchiveFormat::TarXz => Box::new(XzDecoder::new(reader)),
        ArchiveFormat::Tar | ArchiveFormat::Zip => Box::new(reader),
    }
}

/// Validation pass over a tar stream; returns the regular-file members.
fn scan_tar(archive: &Path, format: ArchiveFormat) -> Result<Vec<(String, PathBuf)>, AtlasError> {
    let mut tar = Archive::new(decoder_for(format, BufReader::new(open(archive)?)));
    let entries = tar
        .entries()
        .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;

    let mut members = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| AtlasError::extraction(archive, err.to_string()))?
            .into_owned();
        let relative = safe_member_path(&path).ok_or_else(|| unsafe_member(archive, &path))?;
        let link = entry
            .link_name()
            .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
        if let Some(link) = link {
            if safe_member_path(&link).is_none() {
                return Err(unsafe_member(archive, &path));
            }
        }
        if entry.header().entry_type().is_file() && !relative.as_os_str().is_empty() {
            members.push((member_key(&relative), relative));
        }
    }
    Ok(members)
}

fn unpack_tar(archive: &Path, reader: Box<dyn Read + '_>, staging: &Path) -> Result<(), AtlasError> {
    let mut tar = Archive::new(reader);
    let entries = tar
        .entries()
        .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
        let path = entry
            .path()
            .map_err(|err| AtlasError::extraction(archive, err.to_string()))?
            .into_owned();
        let unpacked = entry
            .unpack_in(staging)
            .map_err(|err| AtlasError::Extraction {
                archive: archive.display().to_string(),
                member: Some(path.display().to_string()),
                message: err.to_string(),
            })?;
        if !unpacked {
            return Err(unsafe_member(archive, &path));
        }
    }
    Ok(())
}

fn scan_zip(archive: &Path) -> Result<Vec<(String, PathBuf)>, AtlasError> {
    let mut zip = ZipArchive::new(open(archive)?)
        .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
    let mut members = Vec::new();
    for i in 0..zip.len() {
        let entry = zip
            .by_index(i)
            .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
        let raw = PathBuf::from(entry.name());
        let relative = match (entry.enclosed_name(), safe_member_path(&raw)) {
            (Some(_), Some(relative)) => relative,
            _ => return Err(unsafe_member(archive, &raw)),
        };
        if !entry.is_dir() && !relative.as_os_str().is_empty() {
            members.push((member_key(&relative), relative));
        }
    }
    Ok(members)
}

fn unpack_zip(
    archive: &Path,
    staging: &Path,
    mut task: crate::progress::ProgressTask<'_>,
) -> Result<(), AtlasError> {
    let mut zip = ZipArchive::new(open(archive)?)
        .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|err| AtlasError::extraction(archive, err.to_string()))?;
        let raw = PathBuf::from(entry.name());
        let relative = safe_member_path(&raw).ok_or_else(|| unsafe_member(archive, &raw))?;
        let entry_path = staging.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| AtlasError::Filesystem(err.to_string()))?;
            continue;
        }
        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| AtlasError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            File::create(&entry_path).map_err(|err| AtlasError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| AtlasError::Extraction {
            archive: archive.display().to_string(),
            member: Some(entry.name().to_string()),
            message: err.to_string(),
        })?;
        task.advance(entry.compressed_size());
    }
    task.finish();
    Ok(())
}

/// Relative path with `.` segments dropped, or `None` if the path is
/// absolute or climbs with `..`.
fn safe_member_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

fn member_key(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn unsafe_member(archive: &Path, member: &Path) -> AtlasError {
    AtlasError::Extraction {
        archive: archive.display().to_string(),
        member: Some(member.display().to_string()),
        message: format!(
            "member {} escapes the extraction directory",
            member.display()
        ),
    }
}

fn open(path: &Path) -> Result<File, AtlasError> {
    File::open(path).map_err(|err| AtlasError::Filesystem(format!("open {}: {err}", path.display())))
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, AtlasError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(AtlasError::Filesystem(err.to_string())),
        }
    }
    Ok(filled)
}

/// Corrupt or short streams simply do not match.
fn head_is_tar(mut reader: impl Read) -> bool {
    let mut block = [0u8; TAR_BLOCK];
    reader.read_exact(&mut block).is_ok() && is_tar_header(&block)
}

fn is_tar_header(block: &[u8; TAR_BLOCK]) -> bool {
    if &block[257..262] == b"ustar" {
        return true;
    }
    let Some(stored) = parse_octal(&block[148..156]) else {
        return false;
    };
    let sum: u64 = block
        .iter()
        .enumerate()
        .map(|(idx, byte)| {
            if (148..156).contains(&idx) {
                u64::from(b' ')
            } else {
                u64::from(*byte)
            }
        })
        .sum();
    sum == stored
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(field).ok()?;
    let trimmed = text.trim_matches(|ch: char| ch == '\0' || ch == ' ');
    if trimmed.is_empty() {
        return None;
    }
    u64::from_str_radix(trimmed, 8).ok()
}
