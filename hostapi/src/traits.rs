//! Stream trait: the host side of the guest's client I/O callbacks.
//!
//! The guest library performs all file I/O through five procedures (read,
//! write, seek, size, close). When a file is opened on a host stream, the
//! sandbox routes each of those callbacks to a `GuestStream` registered in
//! the instance's [`StreamTable`](crate::StreamTable).
//!
//! Pointer validation happens in the sandbox, not here. This trait works
//! with Rust slices only.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::error::{GuestDiagnostic, HostError};

/// A host-side byte stream the guest can read, write and seek.
///
/// Implementations must be `Send`: the owning instance may be driven from
/// any host thread, one call at a time.
pub trait GuestStream: Send {
    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Move the cursor and return the new absolute position.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Total length of the stream in bytes.
    fn size(&mut self) -> io::Result<u64>;

    /// Flush and release the stream. Called at most once.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Callback invoked for every warning the guest reports on a stream.
pub type WarningHandler = Arc<dyn Fn(&GuestDiagnostic) + Send + Sync>;

/// Adapter exposing any `Read + Write + Seek` value (a `File`, a `Cursor`)
/// as a [`GuestStream`].
#[derive(Debug)]
pub struct IoStream<T> {
    inner: T,
}

impl<T> IoStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Write + Seek + Send> GuestStream for IoStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }

    fn size(&mut self) -> io::Result<u64> {
        stream_len(&mut self.inner)
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Adapter for read-only sources. Writes fail with `Unsupported`.
#[derive(Debug)]
pub struct ReadOnlyStream<T> {
    inner: T,
}

impl<T> ReadOnlyStream<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }
}

impl<T: Read + Seek + Send> GuestStream for ReadOnlyStream<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(HostError::unsupported("write to a read-only stream").into_io())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }

    fn size(&mut self) -> io::Result<u64> {
        stream_len(&mut self.inner)
    }
}

/// Length of a seekable stream, restoring the cursor afterwards.
fn stream_len<S: Seek>(s: &mut S) -> io::Result<u64> {
    let pos = s.stream_position()?;
    let len = s.seek(SeekFrom::End(0))?;
    if pos != len {
        s.seek(SeekFrom::Start(pos))?;
    }
    Ok(len)
}
