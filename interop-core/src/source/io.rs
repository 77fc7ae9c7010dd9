//! Byte-stream adaptation for sources that are not named resources.
//!
//! A host hands over an [`IoCallbacks`] object (or a pair of closures through
//! [`CallbackIo`]); [`IoAdapter`] turns it into a buffered `Read + Seek` the
//! demuxers can own. No process-wide hooks are involved: every adapter captures
//! its own callbacks.

use std::io::{self, BufReader, Read, Seek, SeekFrom};

/// Size of the read buffer between the demuxer and the host stream.
pub const IO_BUFFER_SIZE: usize = 16384;

/// Seek origin for [`IoCallbacks::seek_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
    /// Query only: return the total stream size without moving.
    Size,
}

/// Read/seek pair supplied by the host.
pub trait IoCallbacks: Send {
    /// Fill `buf`. `Ok(0)` means end of file.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Move to `offset` relative to `whence`, returning the new position (or
    /// the size for [`Whence::Size`]).
    fn seek_to(&mut self, offset: i64, whence: Whence) -> io::Result<u64>;
}

/// Anything seekable already satisfies the callback contract.
impl<T: Read + Seek + Send> IoCallbacks for T {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn seek_to(&mut self, offset: i64, whence: Whence) -> io::Result<u64> {
        match whence {
            Whence::Start => {
                let offset = u64::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "negative offset"))?;
                Seek::seek(self, SeekFrom::Start(offset))
            }
            Whence::Current => Seek::seek(self, SeekFrom::Current(offset)),
            Whence::End => Seek::seek(self, SeekFrom::End(offset)),
            Whence::Size => {
                let current = self.stream_position()?;
                let end = Seek::seek(self, SeekFrom::End(0))?;
                Seek::seek(self, SeekFrom::Start(current))?;
                Ok(end)
            }
        }
    }
}

/// Callbacks built from two closures.
pub struct CallbackIo<R, S> {
    read: R,
    seek: S,
}

impl<R, S> CallbackIo<R, S>
where
    R: FnMut(&mut [u8]) -> io::Result<usize> + Send,
    S: FnMut(i64, Whence) -> io::Result<u64> + Send,
{
    pub fn new(read: R, seek: S) -> Self {
        Self { read, seek }
    }
}

impl<R, S> Read for CallbackIo<R, S>
where
    R: FnMut(&mut [u8]) -> io::Result<usize> + Send,
    S: FnMut(i64, Whence) -> io::Result<u64> + Send,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (self.read)(buf)
    }
}

impl<R, S> Seek for CallbackIo<R, S>
where
    R: FnMut(&mut [u8]) -> io::Result<usize> + Send,
    S: FnMut(i64, Whence) -> io::Result<u64> + Send,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
                (self.seek)(offset, Whence::Start)
            }
            SeekFrom::Current(offset) => (self.seek)(offset, Whence::Current),
            SeekFrom::End(offset) => (self.seek)(offset, Whence::End),
        }
    }
}

/// Unbuffered bridge from the callback object to `Read + Seek`.
struct CallbackStream {
    callbacks: Box<dyn IoCallbacks>,
}

impl Read for CallbackStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.callbacks.read_into(buf)
    }
}

impl Seek for CallbackStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
                self.callbacks.seek_to(offset, Whence::Start)
            }
            SeekFrom::Current(offset) => self.callbacks.seek_to(offset, Whence::Current),
            SeekFrom::End(offset) => self.callbacks.seek_to(offset, Whence::End),
        }
    }
}

/// Buffered `Read + Seek` over host callbacks.
pub struct IoAdapter {
    inner: BufReader<CallbackStream>,
}

impl IoAdapter {
    pub fn new(callbacks: Box<dyn IoCallbacks>) -> Self {
        Self {
            inner: BufReader::with_capacity(IO_BUFFER_SIZE, CallbackStream { callbacks }),
        }
    }

    /// Total stream size as reported by the host.
    pub fn size(&mut self) -> io::Result<u64> {
        self.inner.get_mut().callbacks.seek_to(0, Whence::Size)
    }
}

impl Read for IoAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for IoAdapter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl std::fmt::Debug for IoAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoAdapter")
            .field("buffered", &self.inner.buffer().len())
            .finish()
    }
}
