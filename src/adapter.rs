//! Bridge between a [`StreamSource`] and FFmpeg's pull-based I/O.
//!
//! FFmpeg reads through an `AVIOContext` whose callbacks receive an opaque
//! pointer. That pointer carries a [`SessionId`], never an address of Rust
//! memory; callbacks resolve the id through a process-wide registry guarded
//! by a read/write lock. An adapter is registered before FFmpeg can call back
//! into it and deregistered before any of its memory is released, so a
//! late callback finds no entry and fails instead of touching freed state.

use std::collections::HashMap;
use std::ffi::{CString, c_int, c_void};
use std::io::{Error as IoError, ErrorKind, Read, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, RwLock};

use ffmpeg_next::Error as FfmpegError;
use ffmpeg_sys_next::{AVFormatContext, AVIOContext, AVIOInterruptCB};

use crate::error::ThumbnailError;
use crate::progress::CancellationToken;
use crate::source::{SeekableSource, StreamSource};

const IO_BUFFER_SIZE: usize = 64 * 1024;

const SEEK_SET: c_int = 0;
const SEEK_CUR: c_int = 1;
const SEEK_END: c_int = 2;
const AVSEEK_SIZE: c_int = 0x10000;
const AVSEEK_FORCE: c_int = 0x20000;

/// Identity of one decode session, as seen by native callbacks.
pub(crate) type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

static REGISTRY: LazyLock<RwLock<HashMap<SessionId, Arc<AdapterEntry>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn averror(error: FfmpegError) -> c_int {
    c_int::from(error)
}

enum SourceIo {
    Forward(Box<dyn Read + Send>),
    Seekable(Box<dyn SeekableSource>),
}

/// Mutable I/O state behind one registry entry.
pub(crate) struct AdapterState {
    io: SourceIo,
    allow_seek_to_end: bool,
    cached_size: Option<u64>,
    last_io_error: Option<IoError>,
}

impl AdapterState {
    fn new(io: SourceIo, allow_seek_to_end: bool) -> Self {
        Self {
            io,
            allow_seek_to_end,
            cached_size: None,
            last_io_error: None,
        }
    }

    fn is_seekable(&self) -> bool {
        matches!(self.io, SourceIo::Seekable(_))
    }

    /// Fill `buf`, returning a byte count or an `AVERROR` code.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> c_int {
        loop {
            let result = match &mut self.io {
                SourceIo::Forward(reader) => reader.read(buf),
                SourceIo::Seekable(source) => source.read(buf),
            };
            match result {
                Ok(0) => return averror(FfmpegError::Eof),
                Ok(count) => return c_int::try_from(count).unwrap_or(c_int::MAX),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    log::debug!("stream read failed: {error}");
                    self.last_io_error = Some(error);
                    return averror(FfmpegError::Unknown);
                }
            }
        }
    }

    /// Seek or answer a size query, returning the new offset, the size, or
    /// an `AVERROR` code.
    pub(crate) fn seek(&mut self, offset: i64, whence: c_int) -> i64 {
        let unknown = i64::from(averror(FfmpegError::Unknown));
        let whence = whence & !AVSEEK_FORCE;
        let SourceIo::Seekable(source) = &mut self.io else {
            return unknown;
        };

        if (whence == AVSEEK_SIZE || whence == SEEK_END) && !self.allow_seek_to_end {
            // A source that has finished growing may be measured from now on.
            match source.completed_size() {
                Some(size) => {
                    self.allow_seek_to_end = true;
                    self.cached_size = Some(size);
                }
                None => return unknown,
            }
        }

        if whence == AVSEEK_SIZE {
            if let Some(size) = self.cached_size.filter(|&size| size > 0) {
                return i64::try_from(size).unwrap_or(unknown);
            }
            let measured = source.stream_position().and_then(|position| {
                let end = source.seek(SeekFrom::End(0))?;
                source.seek(SeekFrom::Start(position))?;
                Ok(end)
            });
            return match measured {
                Ok(size) => {
                    self.cached_size = Some(size);
                    i64::try_from(size).unwrap_or(unknown)
                }
                Err(error) => {
                    self.last_io_error = Some(error);
                    unknown
                }
            };
        }

        let target = match whence {
            SEEK_SET => match u64::try_from(offset) {
                Ok(position) => SeekFrom::Start(position),
                Err(_) => return unknown,
            },
            SEEK_CUR => SeekFrom::Current(offset),
            SEEK_END => SeekFrom::End(offset),
            _ => return unknown,
        };

        match source.seek(target) {
            Ok(position) => {
                if whence == SEEK_END && self.cached_size.is_none() {
                    self.cached_size = offset
                        .checked_neg()
                        .and_then(|back| position.checked_add_signed(back));
                }
                i64::try_from(position).unwrap_or(unknown)
            }
            Err(error) => {
                self.last_io_error = Some(error);
                unknown
            }
        }
    }
}

/// Registry entry: the lockable I/O state plus the cancellation token, which
/// the interrupt callback reads without taking the I/O lock.
pub(crate) struct AdapterEntry {
    state: Mutex<AdapterState>,
    cancellation: Option<CancellationToken>,
}

impl AdapterEntry {
    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }
}

#[cfg(test)]
thread_local! {
    static ISSUED: std::cell::RefCell<Vec<SessionId>> = const { std::cell::RefCell::new(Vec::new()) };
}

/// Ids registered by the current thread, oldest first.
#[cfg(test)]
pub(crate) fn issued_on_this_thread() -> Vec<SessionId> {
    ISSUED.with(|issued| issued.borrow().clone())
}

fn register(entry: Arc<AdapterEntry>) -> SessionId {
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    REGISTRY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(id, entry);
    #[cfg(test)]
    ISSUED.with(|issued| issued.borrow_mut().push(id));
    id
}

fn deregister(id: SessionId) -> bool {
    REGISTRY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .remove(&id)
        .is_some()
}

fn lookup(id: SessionId) -> Option<Arc<AdapterEntry>> {
    REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&id)
        .cloned()
}

#[cfg(test)]
pub(crate) fn is_registered(id: SessionId) -> bool {
    lookup(id).is_some()
}

fn session_of(opaque: *mut c_void) -> SessionId {
    opaque as usize as SessionId
}

unsafe extern "C" fn read_packet(opaque: *mut c_void, buf: *mut u8, buf_size: c_int) -> c_int {
    let id = session_of(opaque);
    panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(entry) = lookup(id) else {
            return averror(FfmpegError::Unknown);
        };
        if entry.is_cancelled() {
            return averror(FfmpegError::Exit);
        }
        let Ok(len) = usize::try_from(buf_size) else {
            return averror(FfmpegError::Unknown);
        };
        if buf.is_null() || len == 0 {
            return 0;
        }
        let slice = unsafe { std::slice::from_raw_parts_mut(buf, len) };
        entry.lock().read(slice)
    }))
    .unwrap_or_else(|_| averror(FfmpegError::Unknown))
}

unsafe extern "C" fn seek_packet(opaque: *mut c_void, offset: i64, whence: c_int) -> i64 {
    let id = session_of(opaque);
    panic::catch_unwind(AssertUnwindSafe(|| match lookup(id) {
        Some(entry) => entry.lock().seek(offset, whence),
        None => i64::from(averror(FfmpegError::Unknown)),
    }))
    .unwrap_or_else(|_| i64::from(averror(FfmpegError::Unknown)))
}

unsafe extern "C" fn interrupt(opaque: *mut c_void) -> c_int {
    let id = session_of(opaque);
    panic::catch_unwind(|| lookup(id).is_some_and(|entry| entry.is_cancelled()))
        .map(c_int::from)
        .unwrap_or(1)
}

/// Owner of one registered source and its `AVIOContext`.
///
/// Dropping the adapter deregisters it and frees the I/O context. The
/// format context using it must be closed in between; see
/// [`ProbeSession`](crate::session::ProbeSession).
pub(crate) struct StreamAdapter {
    id: SessionId,
    entry: Arc<AdapterEntry>,
    avio: *mut AVIOContext,
    url: Option<CString>,
    registered: bool,
}

impl StreamAdapter {
    /// Register `source` and allocate an I/O context for it.
    pub(crate) fn new(
        source: StreamSource,
        cancellation: Option<CancellationToken>,
    ) -> Result<Self, ThumbnailError> {
        let (io, allow_seek_to_end, url) = match source {
            StreamSource::Path(path) => {
                let file = std::fs::File::open(&path).map_err(|error| ThumbnailError::FileOpen {
                    path: path.clone(),
                    reason: error.to_string(),
                })?;
                // The path is passed along as a probing hint for formats that
                // are recognised by extension.
                let url = CString::new(path.to_string_lossy().into_owned()).ok();
                (SourceIo::Seekable(Box::new(file)), true, url)
            }
            StreamSource::Reader(reader) => (SourceIo::Forward(reader), false, None),
            StreamSource::Seekable {
                source,
                allow_seek_to_end,
            } => (SourceIo::Seekable(source), allow_seek_to_end, None),
        };

        let seekable = matches!(io, SourceIo::Seekable(_));
        let entry = Arc::new(AdapterEntry {
            state: Mutex::new(AdapterState::new(io, allow_seek_to_end)),
            cancellation,
        });
        let id = register(Arc::clone(&entry));
        let mut adapter = Self {
            id,
            entry,
            avio: ptr::null_mut(),
            url,
            registered: true,
        };

        unsafe {
            let buffer = ffmpeg_sys_next::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                return Err(ThumbnailError::OutOfMemory);
            }
            let avio = ffmpeg_sys_next::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                0,
                id as usize as *mut c_void,
                Some(read_packet),
                None,
                if seekable { Some(seek_packet) } else { None },
            );
            if avio.is_null() {
                ffmpeg_sys_next::av_free(buffer as *mut c_void);
                return Err(ThumbnailError::OutOfMemory);
            }
            if !seekable {
                (*avio).seekable = 0;
            }
            adapter.avio = avio;
        }

        log::debug!(
            "registered session {id} (seekable: {seekable}, end seeks: {allow_seek_to_end})"
        );
        Ok(adapter)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Probing hint passed as the URL to `avformat_open_input`.
    pub(crate) fn url(&self) -> Option<&CString> {
        self.url.as_ref()
    }

    /// Route `context`'s I/O and interrupt checks through this adapter.
    ///
    /// # Safety
    ///
    /// `context` must be a valid, not yet opened format context.
    pub(crate) unsafe fn attach(&self, context: *mut AVFormatContext) {
        unsafe {
            (*context).pb = self.avio;
            (*context).flags |= ffmpeg_sys_next::AVFMT_FLAG_CUSTOM_IO as c_int;
            (*context).interrupt_callback = AVIOInterruptCB {
                callback: Some(interrupt),
                opaque: self.id as usize as *mut c_void,
            };
        }
    }

    pub(crate) fn is_seekable(&self) -> bool {
        self.entry.lock().is_seekable()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.entry.is_cancelled()
    }

    /// The last I/O error reported by the source, if any.
    pub(crate) fn take_io_error(&self) -> Option<IoError> {
        self.entry.lock().last_io_error.take()
    }

    /// Remove the registry entry. Idempotent; later callbacks fail.
    pub(crate) fn deregister(&mut self) {
        if self.registered {
            deregister(self.id);
            self.registered = false;
            log::debug!("deregistered session {}", self.id);
        }
    }
}

impl Drop for StreamAdapter {
    fn drop(&mut self) {
        self.deregister();
        if !self.avio.is_null() {
            unsafe {
                ffmpeg_sys_next::av_freep(&mut (*self.avio).buffer as *mut *mut u8 as *mut c_void);
                ffmpeg_sys_next::avio_context_free(&mut self.avio);
            }
        }
    }
}
