//! Byte-range input sources.
//!
//! An [`InputSource`] gives the synthesis session random access to the bytes
//! of a MIDI file regardless of where they live. Small files are copied into
//! memory when opened so the render path never touches the disk for them;
//! large files stay on disk and every read is one seek plus one read.

use crate::config::DEFAULT_SLURP_THRESHOLD;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Locator scheme for an interactive session with no media content.
pub const INTERACTIVE_LOCATOR: &str = "device://midi";

/// Errors that can occur while reading from a source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source could not be opened.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A read started outside the source.
    #[error("offset {offset} is outside a source of {len} bytes")]
    OutOfRange { offset: u64, len: u64 },

    /// A seek or read failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Names the content a session should play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// A file on disk.
    Path(PathBuf),
    /// Bytes supplied by the caller.
    Memory(Vec<u8>),
    /// No media; the session only plays events written to it.
    Interactive,
}

impl Locator {
    /// Parses a textual locator.
    ///
    /// `device://midi` selects an interactive session. A `file://` prefix is
    /// stripped; anything else is taken as a filesystem path.
    pub fn parse(locator: &str) -> Self {
        if locator == INTERACTIVE_LOCATOR {
            Locator::Interactive
        } else if let Some(path) = locator.strip_prefix("file://") {
            Locator::Path(PathBuf::from(path))
        } else {
            Locator::Path(PathBuf::from(locator))
        }
    }

    /// Resolves the locator into a source. Interactive locators have none.
    pub fn open(self, slurp_threshold: u64) -> Result<Option<InputSource>, SourceError> {
        match self {
            Locator::Path(path) => InputSource::open_with_threshold(path, slurp_threshold).map(Some),
            Locator::Memory(bytes) => Ok(Some(InputSource::from_vec(bytes))),
            Locator::Interactive => Ok(None),
        }
    }
}

enum Backing {
    Memory(Box<[u8]>),
    File(File),
}

/// Random-access reader over a file or an owned byte buffer.
pub struct InputSource {
    len: u64,
    backing: Backing,
}

impl InputSource {
    /// Opens a file, reading it into memory if it is smaller than 5 MiB.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        Self::open_with_threshold(path, DEFAULT_SLURP_THRESHOLD)
    }

    /// Opens a file, reading it into memory if it is shorter than `threshold`.
    ///
    /// # Arguments
    ///
    /// * `path` - File to open read-only
    /// * `threshold` - Size in bytes below which the file is held in memory
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened, measured, or read.
    pub fn open_with_threshold<P: AsRef<Path>>(path: P, threshold: u64) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        if len < threshold {
            let mut data = Vec::with_capacity(len as usize);
            file.read_to_end(&mut data)?;
            // The handle is dropped here; later reads are served from memory.
            tracing::debug!(path = %path.display(), len, "source held in memory");
            return Ok(Self {
                len: data.len() as u64,
                backing: Backing::Memory(data.into_boxed_slice()),
            });
        }

        tracing::debug!(path = %path.display(), len, "source read from disk");
        Ok(Self {
            len,
            backing: Backing::File(file),
        })
    }

    /// Creates a source over a private copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len() as u64,
            backing: Backing::Memory(bytes.into()),
        }
    }

    /// Creates a source that takes ownership of `bytes` without copying.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            len: bytes.len() as u64,
            backing: Backing::Memory(bytes.into_boxed_slice()),
        }
    }

    /// Total size in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if every read is served from memory.
    pub fn is_resident(&self) -> bool {
        matches!(self.backing, Backing::Memory(_))
    }

    /// Copies bytes starting at `offset` into `buf`.
    ///
    /// Reads are clamped to the end of the source, so the returned count may
    /// be smaller than `buf.len()`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::OutOfRange`] if `offset` is not inside the
    /// source, or [`SourceError::Io`] if the disk read fails.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, SourceError> {
        if offset >= self.len {
            return Err(SourceError::OutOfRange {
                offset,
                len: self.len,
            });
        }
        let count = (self.len - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..count];

        match &mut self.backing {
            Backing::Memory(data) => {
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + count]);
            }
            Backing::File(file) => {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
            }
        }
        Ok(count)
    }
}

impl std::fmt::Debug for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSource")
            .field("len", &self.len)
            .field("resident", &self.is_resident())
            .finish()
    }
}
