//! Staging tree archiving.
//!
//! The archive is written to a temporary file next to the destination and
//! renamed into place once the encoder has finished and the output is
//! flushed, so readers only ever see a complete archive.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Highest deflate level.
pub const MAX_COMPRESSION_LEVEL: i64 = 9;

const COPY_BUFFER: usize = 64 * 1024;

/// Archive failures. Exactly one is reported per attempt.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("source directory does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    /// The destination could not be created, written, flushed or persisted.
    #[error("cannot write archive {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The encoder failed or a source file could not be read.
    #[error("{0}")]
    Encoding(String),
}

/// A finished archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Files plus directories written.
    pub entries: usize,
}

/// Turns a directory tree into an archive file.
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn archive(&self, source: &Path, dest: &Path) -> Result<ArchiveSummary, ArchiveError>;
}

/// Zip archiver (deflate).
#[derive(Debug, Clone, Copy)]
pub struct ZipArchiver {
    compression_level: i64,
}

impl Default for ZipArchiver {
    fn default() -> Self {
        Self {
            compression_level: MAX_COMPRESSION_LEVEL,
        }
    }
}

impl ZipArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(compression_level: i64) -> Self {
        Self { compression_level }
    }

    /// Synchronous archive; runs on the caller's thread.
    pub fn archive_blocking(
        &self,
        source: &Path,
        dest: &Path,
    ) -> Result<ArchiveSummary, ArchiveError> {
        if !source.is_dir() {
            return Err(ArchiveError::SourceMissing(source.to_path_buf()));
        }

        let output = |source: io::Error| ArchiveError::Output {
            path: dest.to_path_buf(),
            source,
        };

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(output)?;
        let mut tmp = NamedTempFile::new_in(parent).map_err(output)?;

        let (size_bytes, entries) = {
            let writer = CountingWriter::new(BufWriter::new(tmp.as_file_mut()));
            let mut zip = ZipWriter::new(writer);
            let entries = self.write_entries(&mut zip, source, dest)?;

            let mut counted = zip.finish().map_err(|e| zip_error(dest, e))?;
            counted.flush().map_err(output)?;
            let size = counted.len();
            counted
                .into_inner()
                .into_inner()
                .map_err(|e| output(e.into_error()))?;
            (size, entries)
        };

        tmp.as_file().sync_all().map_err(output)?;
        tmp.persist(dest).map_err(|e| output(e.error))?;

        info!(
            source = %source.display(),
            dest = %dest.display(),
            size_bytes,
            entries,
            "Archive written"
        );
        Ok(ArchiveSummary {
            path: dest.to_path_buf(),
            size_bytes,
            entries,
        })
    }

    fn write_entries<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        source: &Path,
        dest: &Path,
    ) -> Result<usize, ArchiveError> {
        let base = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level));

        let mut entries = 0;
        let mut buf = vec![0u8; COPY_BUFFER];

        for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|e| ArchiveError::Encoding(format!("cannot walk source: {e}")))?;
            if entry.depth() == 0 {
                continue;
            }
            let path = entry.path();
            let name = entry_name(source, path)?;
            let metadata = fs::metadata(path).map_err(|e| {
                ArchiveError::Encoding(format!("cannot stat {}: {e}", path.display()))
            })?;
            let options = with_permissions(base, &metadata);

            if entry.file_type().is_dir() {
                zip.add_directory(format!("{name}/"), options)
                    .map_err(|e| zip_error(dest, e))?;
            } else if metadata.is_file() {
                let options = options.large_file(metadata.len() >= u64::from(u32::MAX));
                zip.start_file(name, options)
                    .map_err(|e| zip_error(dest, e))?;
                let mut file = File::open(path).map_err(|e| {
                    ArchiveError::Encoding(format!("cannot read {}: {e}", path.display()))
                })?;
                loop {
                    let n = file.read(&mut buf).map_err(|e| {
                        ArchiveError::Encoding(format!("cannot read {}: {e}", path.display()))
                    })?;
                    if n == 0 {
                        break;
                    }
                    zip.write_all(&buf[..n]).map_err(|source| ArchiveError::Output {
                        path: dest.to_path_buf(),
                        source,
                    })?;
                }
            } else {
                warn!(path = %path.display(), "Skipping entry that is neither file nor directory");
                continue;
            }

            debug!(entry = %path.display(), "Archived");
            entries += 1;
        }
        Ok(entries)
    }
}

#[async_trait]
impl Archiver for ZipArchiver {
    async fn archive(&self, source: &Path, dest: &Path) -> Result<ArchiveSummary, ArchiveError> {
        let archiver = *self;
        let source = source.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || archiver.archive_blocking(&source, &dest))
            .await
            .map_err(|e| ArchiveError::Encoding(format!("archive task failed: {e}")))?
    }
}

fn zip_error(dest: &Path, err: ZipError) -> ArchiveError {
    match err {
        ZipError::Io(source) => ArchiveError::Output {
            path: dest.to_path_buf(),
            source,
        },
        other => ArchiveError::Encoding(other.to_string()),
    }
}

fn entry_name(source: &Path, path: &Path) -> Result<String, ArchiveError> {
    let relative = path.strip_prefix(source).map_err(|_| {
        ArchiveError::Encoding(format!("{} escapes the source tree", path.display()))
    })?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

#[cfg(unix)]
fn with_permissions(options: SimpleFileOptions, metadata: &fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn with_permissions(options: SimpleFileOptions, _metadata: &fs::Metadata) -> SimpleFileOptions {
    options
}

/// Tracks the extent of everything written through it.
struct CountingWriter<W> {
    inner: W,
    position: u64,
    len: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            position: 0,
            len: 0,
        }
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        self.len = self.len.max(self.position);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for CountingWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.inner.seek(pos)?;
        Ok(self.position)
    }
}
