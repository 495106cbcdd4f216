//! Per-instance table of host resources reachable from guest callbacks.
//!
//! Every file the sandbox opens gets one entry, whether or not it is backed
//! by a host stream. The entry id is handed to the guest both as the client
//! data of the I/O callbacks and as the user data of the error and warning
//! handlers, so every diagnostic lands on the resource that caused it.
//!
//! Warning handlers never run from inside a guest callback. Recorded warnings
//! wait in the entry until [`StreamTable::deliver_warnings`] is called once
//! the guest call that raised them has returned.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{GuestDiagnostic, HostError};
use crate::traits::{GuestStream, WarningHandler};
use crate::types::StreamId;

/// One registered resource.
#[derive(Default)]
struct StreamEntry {
    stream: Option<Box<dyn GuestStream>>,
    last_error: Option<GuestDiagnostic>,
    warnings: Vec<GuestDiagnostic>,
    undelivered: Vec<GuestDiagnostic>,
    on_warning: Option<WarningHandler>,
}

/// Table of open resources for one guest instance.
///
/// Callbacks of a single instance are already serialized by the instance's
/// call guard; the internal mutex only protects against host threads reading
/// diagnostics while a call is in flight on another thread.
pub struct StreamTable {
    entries: Mutex<HashMap<StreamId, StreamEntry>>,
    next_id: AtomicU32,
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("entries", &self.len())
            .finish()
    }
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Register a new entry, optionally backed by a host stream.
    pub fn register(&self, stream: Option<Box<dyn GuestStream>>) -> StreamId {
        let id = StreamId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(
            id,
            StreamEntry {
                stream,
                ..StreamEntry::default()
            },
        );
        tracing::trace!(%id, "registered stream entry");
        id
    }

    /// Install a callback invoked for every warning recorded on `id` from now on.
    pub fn set_warning_handler(&self, id: StreamId, handler: WarningHandler) -> Result<(), HostError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(HostError::UnknownStream(id))?;
        entry.on_warning = Some(handler);
        Ok(())
    }

    /// Run `f` against the stream attached to `id`.
    pub fn with_stream<R>(
        &self,
        id: StreamId,
        f: impl FnOnce(&mut dyn GuestStream) -> io::Result<R>,
    ) -> Result<R, HostError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(HostError::UnknownStream(id))?;
        let stream = entry.stream.as_mut().ok_or(HostError::StreamDetached(id))?;
        Ok(f(stream.as_mut())?)
    }

    /// Close and detach the stream of `id`. The entry itself stays so its
    /// diagnostics remain readable. Closing an already detached entry is a no-op.
    pub fn close_stream(&self, id: StreamId) -> Result<(), HostError> {
        let stream = {
            let mut entries = self.lock();
            let entry = entries.get_mut(&id).ok_or(HostError::UnknownStream(id))?;
            entry.stream.take()
        };
        match stream {
            Some(mut s) => Ok(s.close()?),
            None => Ok(()),
        }
    }

    /// Record `diag` as the most recent error of `id`.
    pub fn record_error(&self, id: StreamId, diag: GuestDiagnostic) -> Result<(), HostError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(HostError::UnknownStream(id))?;
        entry.last_error = Some(diag);
        Ok(())
    }

    /// Append a warning to `id`. If the entry has a handler, the warning is
    /// also queued for the next [`deliver_warnings`](Self::deliver_warnings).
    pub fn record_warning(&self, id: StreamId, diag: GuestDiagnostic) -> Result<(), HostError> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&id).ok_or(HostError::UnknownStream(id))?;
        if entry.on_warning.is_some() {
            entry.undelivered.push(diag.clone());
        }
        entry.warnings.push(diag);
        Ok(())
    }

    /// Run the handlers of every entry on the warnings queued since the last
    /// delivery, oldest first. Handlers run without the table lock held and
    /// may use the table themselves.
    pub fn deliver_warnings(&self) {
        let queued: Vec<(WarningHandler, Vec<GuestDiagnostic>)> = self
            .lock()
            .values_mut()
            .filter(|e| !e.undelivered.is_empty())
            .filter_map(|e| {
                let batch = std::mem::take(&mut e.undelivered);
                e.on_warning.clone().map(|handler| (handler, batch))
            })
            .collect();
        for (handler, batch) in queued {
            for diag in &batch {
                handler(diag);
            }
        }
    }

    /// Most recent error recorded on `id`, leaving it in place.
    pub fn last_error(&self, id: StreamId) -> Option<GuestDiagnostic> {
        self.lock().get(&id).and_then(|e| e.last_error.clone())
    }

    /// Remove and return the most recent error recorded on `id`.
    pub fn take_error(&self, id: StreamId) -> Option<GuestDiagnostic> {
        self.lock().get_mut(&id).and_then(|e| e.last_error.take())
    }

    /// All warnings recorded on `id`, oldest first.
    pub fn warnings(&self, id: StreamId) -> Vec<GuestDiagnostic> {
        self.lock()
            .get(&id)
            .map(|e| e.warnings.clone())
            .unwrap_or_default()
    }

    /// Remove and return the warnings recorded on `id` so far.
    pub fn take_warnings(&self, id: StreamId) -> Vec<GuestDiagnostic> {
        self.lock()
            .get_mut(&id)
            .map(|e| std::mem::take(&mut e.warnings))
            .unwrap_or_default()
    }

    /// Drop the entry for `id`, closing its stream if still attached.
    pub fn remove(&self, id: StreamId) -> Result<(), HostError> {
        let entry = self.lock().remove(&id).ok_or(HostError::UnknownStream(id))?;
        match entry.stream {
            Some(mut s) => Ok(s.close()?),
            None => Ok(()),
        }
    }

    /// Remove every entry, closing attached streams. Returns the failures;
    /// a failing stream does not stop the others from being closed.
    pub fn close_all(&self) -> Vec<(StreamId, HostError)> {
        let drained: Vec<(StreamId, StreamEntry)> = self.lock().drain().collect();
        let mut failures = Vec::new();
        for (id, entry) in drained {
            if let Some(mut stream) = entry.stream {
                if let Err(e) = stream.close() {
                    failures.push((id, HostError::Io(e)));
                }
            }
        }
        failures
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Returns the number of registered entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, StreamEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_stream::MemStream;
    use std::io::SeekFrom;
    use std::sync::Arc;

    struct FailingClose;

    impl GuestStream for FailingClose {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
            Ok(0)
        }
        fn size(&mut self) -> io::Result<u64> {
            Ok(0)
        }
        fn close(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "flush failed"))
        }
    }

    #[test]
    fn test_ids_are_unique_and_nonzero() {
        let table = StreamTable::new();
        let a = table.register(None);
        let b = table.register(None);
        assert_ne!(a, b);
        assert_ne!(a.get(), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_with_stream_routes_to_registered_stream() {
        let table = StreamTable::new();
        let mem = MemStream::with_data(b"WTIF".to_vec());
        let id = table.register(Some(Box::new(mem)));

        let mut buf = [0u8; 4];
        let n = table.with_stream(id, |s| s.read(&mut buf)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"WTIF");
    }

    #[test]
    fn test_unknown_and_detached_streams() {
        let table = StreamTable::new();
        match table.with_stream(StreamId::new(99), |s| s.size()) {
            Err(HostError::UnknownStream(id)) => assert_eq!(id.get(), 99),
            other => panic!("expected UnknownStream, got {:?}", other.map(|_| ())),
        }

        let id = table.register(None);
        match table.with_stream(id, |s| s.size()) {
            Err(HostError::StreamDetached(_)) => {}
            other => panic!("expected StreamDetached, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_close_stream_keeps_diagnostics() {
        let table = StreamTable::new();
        let mem = MemStream::new();
        let id = table.register(Some(Box::new(mem.clone())));
        table
            .record_error(id, GuestDiagnostic::new("TIFFClose", "boom"))
            .unwrap();

        table.close_stream(id).unwrap();
        assert!(mem.is_closed());
        // second close is a no-op
        table.close_stream(id).unwrap();
        assert_eq!(table.last_error(id).unwrap().message, "boom");
        assert_eq!(table.take_error(id).unwrap().module, "TIFFClose");
        assert!(table.last_error(id).is_none());
    }

    #[test]
    fn test_warnings_invoke_handler() {
        let table = StreamTable::new();
        let id = table.register(None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        table
            .set_warning_handler(
                id,
                Arc::new(move |d: &GuestDiagnostic| sink.lock().unwrap().push(d.message.clone())),
            )
            .unwrap();

        table.record_warning(id, GuestDiagnostic::new("m", "first")).unwrap();
        table.record_warning(id, GuestDiagnostic::new("m", "second")).unwrap();
        assert_eq!(table.warnings(id).len(), 2);
        assert!(seen.lock().unwrap().is_empty());

        table.deliver_warnings();
        assert_eq!(*seen.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
        // delivered once only
        table.deliver_warnings();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_handler_may_use_the_table() {
        let table = Arc::new(StreamTable::new());
        let id = table.register(None);
        let counts = Arc::new(Mutex::new(Vec::new()));
        let (inner, sink) = (Arc::clone(&table), Arc::clone(&counts));
        table
            .set_warning_handler(
                id,
                Arc::new(move |_: &GuestDiagnostic| sink.lock().unwrap().push(inner.warnings(id).len())),
            )
            .unwrap();

        table.record_warning(id, GuestDiagnostic::new("m", "only")).unwrap();
        table.deliver_warnings();
        assert_eq!(*counts.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_take_warnings_drains() {
        let table = StreamTable::new();
        let id = table.register(None);
        table.record_warning(id, GuestDiagnostic::new("m", "a")).unwrap();
        table.record_warning(id, GuestDiagnostic::new("m", "b")).unwrap();

        let taken = table.take_warnings(id);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[1].message, "b");
        assert!(table.warnings(id).is_empty());
        assert!(table.take_warnings(StreamId::new(77)).is_empty());
    }

    #[test]
    fn test_close_all_collects_failures() {
        let table = StreamTable::new();
        let ok = MemStream::new();
        table.register(Some(Box::new(ok.clone())));
        let bad = table.register(Some(Box::new(FailingClose)));
        table.register(None);

        let failures = table.close_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, bad);
        assert!(ok.is_closed());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_unknown_entry() {
        let table = StreamTable::new();
        assert!(matches!(
            table.remove(StreamId::new(5)),
            Err(HostError::UnknownStream(_))
        ));
    }
}
