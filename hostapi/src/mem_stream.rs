//! In-memory guest stream.
//!
//! `MemStream` is a cloneable handle over a shared growable buffer. One
//! clone is handed to the sandbox while the caller keeps another to inspect
//! what the guest wrote once the file is closed.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::traits::GuestStream;

/// Shared in-memory stream backed by `Cursor<Vec<u8>>`.
#[derive(Debug, Clone, Default)]
pub struct MemStream {
    inner: Arc<Mutex<Cursor<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MemStream {
    /// Create an empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a stream pre-populated with `data`, positioned at the start.
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Cursor::new(data))),
            closed: Arc::default(),
        }
    }

    /// Snapshot of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().get_ref().clone()
    }

    /// Returns the number of bytes held.
    pub fn len(&self) -> usize {
        self.lock().get_ref().len()
    }

    /// Returns true if the stream holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`GuestStream::close`] has been called on any clone.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, Cursor<Vec<u8>>> {
        // A panic while holding the lock leaves plain bytes behind; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl GuestStream for MemStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.lock().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.lock().seek(pos)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.lock().get_ref().len() as u64)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
