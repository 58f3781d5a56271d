//! Byte sources a request can read from.
//!
//! A [`StreamSource`] is either a filesystem path, a forward-only reader, or
//! a seekable reader together with a flag saying whether seeking relative to
//! the end is allowed. Refusing end-seeks lets a partially written file be
//! probed without waiting for it to be finished.
//!
//! [`GrowingFile`] models exactly that case: a producer appends to a file
//! while any number of [`GrowingFileReader`]s consume it. Readers block until
//! bytes are available, and report the final size once the producer calls
//! [`GrowingFile::finish`].

use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// A seekable byte source.
///
/// The two provided methods let sources whose length is not known up front
/// cooperate with the pipeline. Ordinary files and in-memory cursors keep
/// the defaults.
pub trait SeekableSource: Read + Seek + Send {
    /// Final length of the source, once it is known to be complete.
    ///
    /// When this returns `Some`, end-relative seeks are accepted even if the
    /// request was opened with `allow_seek_to_end = false`.
    fn completed_size(&self) -> Option<u64> {
        None
    }

    /// Block until the source is complete and return a path holding all of
    /// its bytes, if there is one. Lets the raster stage read the file in
    /// place instead of copying it.
    fn wait_for_path(&mut self) -> Option<PathBuf> {
        None
    }
}

impl SeekableSource for File {}

impl<T> SeekableSource for Cursor<T> where T: AsRef<[u8]> + Send {}

/// Where a request reads its bytes from.
pub enum StreamSource {
    /// A file on disk.
    Path(PathBuf),
    /// A forward-only reader. Seeking is never possible.
    Reader(Box<dyn Read + Send>),
    /// A seekable reader.
    Seekable {
        /// The reader.
        source: Box<dyn SeekableSource>,
        /// Whether end-relative seeks and size queries may be served before
        /// the source reports completion.
        allow_seek_to_end: bool,
    },
}

impl StreamSource {
    /// A file on disk.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        StreamSource::Path(path.as_ref().to_path_buf())
    }

    /// A forward-only reader such as a socket or pipe.
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Self {
        StreamSource::Reader(Box::new(reader))
    }

    /// A seekable reader.
    pub fn from_read_seeker<S: SeekableSource + 'static>(source: S, allow_seek_to_end: bool) -> Self {
        StreamSource::Seekable {
            source: Box::new(source),
            allow_seek_to_end,
        }
    }

    /// The path, for path sources.
    pub fn path(&self) -> Option<&Path> {
        match self {
            StreamSource::Path(path) => Some(path),
            _ => None,
        }
    }

    /// Short human readable description used in log lines and errors.
    pub(crate) fn describe(&self) -> String {
        match self {
            StreamSource::Path(path) => path.display().to_string(),
            StreamSource::Reader(_) => "<reader>".to_string(),
            StreamSource::Seekable { .. } => "<seekable reader>".to_string(),
        }
    }
}

impl Debug for StreamSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StreamSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            StreamSource::Reader(_) => f.write_str("Reader"),
            StreamSource::Seekable {
                allow_seek_to_end, ..
            } => f
                .debug_struct("Seekable")
                .field("allow_seek_to_end", allow_seek_to_end)
                .finish(),
        }
    }
}

#[derive(Debug, Default)]
struct GrowthState {
    written: u64,
    finished: bool,
    abandoned: bool,
}

#[derive(Debug)]
struct GrowthShared {
    path: PathBuf,
    state: Mutex<GrowthState>,
    changed: Condvar,
}

impl GrowthShared {
    fn lock(&self) -> MutexGuard<'_, GrowthState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, GrowthState>) -> MutexGuard<'a, GrowthState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer side of a file that is read while it is being written.
///
/// Dropping the producer without calling [`finish`](GrowingFile::finish)
/// marks the file as abandoned: readers get an error once they reach the end
/// of what was written.
///
/// ```no_run
/// use std::io::Write;
///
/// use mediathumb::GrowingFile;
///
/// let mut upload = GrowingFile::create("/tmp/upload.mp4")?;
/// let reader = upload.reader()?;
/// upload.write_all(b"...")?;
/// upload.finish()?;
/// # drop(reader);
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug)]
pub struct GrowingFile {
    file: File,
    shared: Arc<GrowthShared>,
    finished: bool,
}

impl GrowingFile {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            shared: Arc::new(GrowthShared {
                path,
                state: Mutex::new(GrowthState::default()),
                changed: Condvar::new(),
            }),
            finished: false,
        })
    }

    /// Open a new reader positioned at the start of the file.
    pub fn reader(&self) -> IoResult<GrowingFileReader> {
        Ok(GrowingFileReader {
            file: File::open(&self.shared.path)?,
            shared: Arc::clone(&self.shared),
            position: 0,
        })
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.shared.lock().written
    }

    /// Flush and mark the file complete. Readers see end of file from now on.
    pub fn finish(mut self) -> IoResult<u64> {
        self.file.flush()?;
        self.file.sync_data()?;
        self.finished = true;
        let mut state = self.shared.lock();
        state.finished = true;
        self.shared.changed.notify_all();
        Ok(state.written)
    }
}

impl Write for GrowingFile {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        let count = self.file.write(buf)?;
        let mut state = self.shared.lock();
        state.written += count as u64;
        self.shared.changed.notify_all();
        Ok(count)
    }

    fn flush(&mut self) -> IoResult<()> {
        self.file.flush()
    }
}

impl Drop for GrowingFile {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.shared.lock();
            state.abandoned = true;
            self.shared.changed.notify_all();
        }
    }
}

/// Consumer side of a [`GrowingFile`].
#[derive(Debug)]
pub struct GrowingFileReader {
    file: File,
    shared: Arc<GrowthShared>,
    position: u64,
}

impl GrowingFileReader {
    fn abandoned_error() -> IoError {
        IoError::new(ErrorKind::UnexpectedEof, "growing file was abandoned by its producer")
    }
}

impl Read for GrowingFileReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let available = {
            let mut state = self.shared.lock();
            loop {
                if state.written > self.position {
                    break state.written - self.position;
                }
                if state.finished {
                    return Ok(0);
                }
                if state.abandoned {
                    return Err(Self::abandoned_error());
                }
                state = self.shared.wait(state);
            }
        };

        let limit = buf.len().min(usize::try_from(available).unwrap_or(usize::MAX));
        self.file.seek(SeekFrom::Start(self.position))?;
        let count = self.file.read(&mut buf[..limit])?;
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for GrowingFileReader {
    fn seek(&mut self, pos: SeekFrom) -> IoResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => {
                let size = self.completed_size().ok_or_else(|| {
                    IoError::new(ErrorKind::WouldBlock, "size of a growing file is not known yet")
                })?;
                size.checked_add_signed(delta)
            }
        };
        let target = target.ok_or_else(|| {
            IoError::new(ErrorKind::InvalidInput, "seek to a negative position")
        })?;
        self.position = target;
        Ok(target)
    }
}

impl SeekableSource for GrowingFileReader {
    fn completed_size(&self) -> Option<u64> {
        let state = self.shared.lock();
        state.finished.then_some(state.written)
    }

    fn wait_for_path(&mut self) -> Option<PathBuf> {
        let mut state = self.shared.lock();
        while !state.finished && !state.abandoned {
            state = self.shared.wait(state);
        }
        state.finished.then(|| self.shared.path.clone())
    }
}
