//! An open file inside a library-mode guest instance.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tiffbridge_hostapi::{GuestDiagnostic, StreamId, WarningHandler};
use wasmtime::Val;

use crate::abi::{self, GuestHandle};
use crate::directory::Directories;
use crate::error::{BridgeError, Result};
use crate::field::{self, FieldShape, FieldTag, FieldType, FieldValue, Lookup};
use crate::introspect::{self, FieldInfo};
use crate::memory;
use crate::raster::RasterView;
use crate::runtime::GuestInstance;
use crate::session::Session;
use crate::tags;

/// One open file: the guest handle, the stream-table entry its callbacks and
/// diagnostics route to, and the host's view of the current directory.
///
/// Every operation acquires the instance's call guard, so a `TiffFile` can be
/// shared between threads; operations on it are serialized.
pub struct TiffFile {
    instance: Arc<GuestInstance>,
    handle: GuestHandle,
    entry: StreamId,
    name: String,
    current: AtomicU32,
    closed: AtomicBool,
}

impl fmt::Debug for TiffFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TiffFile")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("entry", &self.entry)
            .field("current_directory", &self.current_directory())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TiffFile {
    pub(crate) fn new(
        instance: Arc<GuestInstance>,
        handle: GuestHandle,
        entry: StreamId,
        name: String,
    ) -> Self {
        Self {
            instance,
            handle,
            entry,
            name,
            current: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> GuestHandle {
        self.handle
    }

    /// Stream-table entry of this file.
    pub fn entry(&self) -> StreamId {
        self.entry
    }

    pub fn instance(&self) -> &Arc<GuestInstance> {
        &self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Acquire the call guard and forget the diagnostic of an earlier call, so
    /// a failure is only ever blamed on the operation that caused it.
    fn session(&self) -> Result<Session<'_>> {
        if self.is_closed() {
            return Err(BridgeError::Closed("file"));
        }
        let session = self.instance.session()?;
        self.instance.streams().take_error(self.entry);
        Ok(session)
    }

    /// Error for a sentinel return: the guest's own diagnostic when it
    /// reported one, the operation and its arguments otherwise.
    fn failure(&self, operation: &str, detail: impl fmt::Display) -> BridgeError {
        match self.instance.streams().last_error(self.entry) {
            Some(diag) => BridgeError::Guest(diag),
            None => BridgeError::call_failed(operation, format!("{} on {}", detail, self.name)),
        }
    }

    // ── Fields ──

    /// Read `tag` from the current directory.
    pub fn get<T: FieldType>(&self, tag: impl Into<FieldTag>) -> Result<T> {
        let tag = tag.into();
        let value = self.get_value(tag, T::SHAPE)?;
        T::from_value(value).ok_or_else(|| {
            BridgeError::call_failed("get field", format!("tag {} decoded with the wrong shape", tag))
        })
    }

    /// Read `tag`, falling back to the library default when it is unset.
    pub fn get_defaulted<T: FieldType>(&self, tag: impl Into<FieldTag>) -> Result<T> {
        let tag = tag.into();
        let mut session = self.session()?;
        let value = field::get_field(&mut session, self.handle, tag, T::SHAPE, Lookup::Defaulted)?;
        T::from_value(value).ok_or_else(|| {
            BridgeError::call_failed("get defaulted field", format!("tag {} decoded with the wrong shape", tag))
        })
    }

    pub fn get_value(&self, tag: FieldTag, shape: FieldShape) -> Result<FieldValue> {
        let mut session = self.session()?;
        field::get_field(&mut session, self.handle, tag, shape, Lookup::Explicit)
    }

    /// Read a tag from the tag table using its declared shape.
    pub fn get_known(&self, tag: FieldTag) -> Result<FieldValue> {
        let shape = tags::shape_of(tag).ok_or_else(|| {
            BridgeError::call_failed("get field", format!("tag {} has no declared shape", tag))
        })?;
        self.get_value(tag, shape)
    }

    /// Write `value` to `tag` in the current directory.
    pub fn set<T: FieldType>(&self, tag: impl Into<FieldTag>, value: T) -> Result<()> {
        self.set_value(tag.into(), value.into_value())
    }

    pub fn set_text(&self, tag: impl Into<FieldTag>, text: &str) -> Result<()> {
        self.set_value(tag.into(), FieldValue::Text(text.to_owned()))
    }

    pub fn set_value(&self, tag: FieldTag, value: FieldValue) -> Result<()> {
        let mut session = self.session()?;
        match field::set_field(&mut session, self.handle, tag, &value) {
            Err(BridgeError::FieldSet { tag, .. }) => Err(BridgeError::FieldSet {
                tag,
                diagnostic: self.instance.streams().last_error(self.entry),
            }),
            other => other,
        }
    }

    /// Read a u32 field inside an already held session.
    fn dimension(&self, session: &mut Session<'_>, tag: FieldTag, lookup: Lookup) -> Result<u32> {
        let value = field::get_field(session, self.handle, tag, FieldShape::U32, lookup)?;
        u32::from_value(value).ok_or_else(|| {
            BridgeError::call_failed("get field", format!("tag {} decoded with the wrong shape", tag))
        })
    }

    // ── Tag introspection ──

    /// Tags set in the current directory.
    pub fn tag_list(&self) -> Result<Vec<FieldTag>> {
        let mut session = self.session()?;
        let code = session.call_i32(abi::GET_TAG_LIST_COUNT, &[Val::I32(self.handle.raw())])?;
        let count = u32::try_from(code)
            .map_err(|_| self.failure(abi::GET_TAG_LIST_COUNT, "current directory"))?;

        (0..count)
            .map(|index| {
                let tag = session.call_i32(
                    abi::GET_TAG_LIST_ENTRY,
                    &[Val::I32(self.handle.raw()), Val::I32(index as i32)],
                )?;
                if tag == -1 {
                    return Err(BridgeError::call_failed(
                        abi::GET_TAG_LIST_ENTRY,
                        format!("entry {} of {} on {}", index, count, self.name),
                    ));
                }
                Ok(FieldTag(tag as u32))
            })
            .collect()
    }

    /// Descriptor of `tag`, or `None` if the library does not know it.
    pub fn field_with_tag(&self, tag: impl Into<FieldTag>) -> Result<Option<FieldInfo>> {
        let tag = tag.into();
        let mut session = self.session()?;
        let ptr = session.call_i32(
            abi::FIELD_WITH_TAG,
            &[Val::I32(self.handle.raw()), Val::I32(tag.0 as i32)],
        )?;
        match ptr {
            0 => Ok(None),
            ptr => introspect::describe_field(&mut session, memory::guest_ptr(ptr)).map(Some),
        }
    }

    /// Descriptor of the field called `name`, or `None` if there is none.
    pub fn field_with_name(&self, name: &str) -> Result<Option<FieldInfo>> {
        let mut session = self.session()?;
        let handle = self.handle;
        let ptr = session.with_cstring(name, |s, text| {
            s.call_i32(abi::FIELD_WITH_NAME, &[Val::I32(handle.raw()), Val::I32(text as i32)])
        })?;
        match ptr {
            0 => Ok(None),
            ptr => introspect::describe_field(&mut session, memory::guest_ptr(ptr)).map(Some),
        }
    }

    // ── Directories ──

    /// Index of the current directory as last observed by the host.
    pub fn current_directory(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Ask the guest for the current directory and remember the answer.
    pub fn query_current_directory(&self) -> Result<u32> {
        let mut session = self.session()?;
        let index = self.sync_current(&mut session)?;
        Ok(index)
    }

    fn sync_current(&self, session: &mut Session<'_>) -> Result<u32> {
        let raw = session.call_i32(abi::CURRENT_DIRECTORY, &[Val::I32(self.handle.raw())])?;
        // tdir_t is unsigned; the guest's "none" value wraps to the maximum.
        let index = raw as u32;
        self.current.store(index, Ordering::Release);
        Ok(index)
    }

    pub fn number_of_directories(&self) -> Result<u32> {
        let mut session = self.session()?;
        let count = session.call_i32(abi::NUMBER_OF_DIRECTORIES, &[Val::I32(self.handle.raw())])?;
        Ok(count as u32)
    }

    /// Advance to the next directory. `Ok(false)` when there is none.
    pub fn read_directory(&self) -> Result<bool> {
        let mut session = self.session()?;
        let code = session.call_i32(abi::READ_DIRECTORY, &[Val::I32(self.handle.raw())])?;
        if abi::succeeded(code) {
            self.sync_current(&mut session)?;
            return Ok(true);
        }
        // End of chain and a corrupt directory share the sentinel; only the
        // latter reports through the error handler.
        match self.instance.streams().last_error(self.entry) {
            Some(diag) => Err(BridgeError::Guest(diag)),
            None => Ok(false),
        }
    }

    /// Position on directory `index`.
    pub fn set_directory(&self, index: u32) -> Result<()> {
        let mut session = self.session()?;
        let code = session.call_i32(
            abi::SET_DIRECTORY,
            &[Val::I32(self.handle.raw()), Val::I32(index as i32)],
        )?;
        if !abi::succeeded(code) {
            return Err(self.failure(abi::SET_DIRECTORY, format_args!("index {}", index)));
        }
        self.current.store(index, Ordering::Release);
        Ok(())
    }

    pub fn is_last_directory(&self) -> Result<bool> {
        let mut session = self.session()?;
        let code = session.call_i32(abi::LAST_DIRECTORY, &[Val::I32(self.handle.raw())])?;
        Ok(abi::succeeded(code))
    }

    /// Flush the current directory and start a new, empty one.
    pub fn write_directory(&self) -> Result<()> {
        let mut session = self.session()?;
        let code = session.call_i32(abi::WRITE_DIRECTORY, &[Val::I32(self.handle.raw())])?;
        if !abi::succeeded(code) {
            return Err(self.failure(abi::WRITE_DIRECTORY, "current directory"));
        }
        self.sync_current(&mut session)?;
        Ok(())
    }

    /// Write the current directory without starting a new one, so a reader
    /// opening the file now sees it.
    pub fn checkpoint_directory(&self) -> Result<()> {
        self.persist(abi::CHECKPOINT_DIRECTORY)
    }

    /// Write the current directory again after it was modified.
    pub fn rewrite_directory(&self) -> Result<()> {
        self.persist(abi::REWRITE_DIRECTORY)
    }

    /// Push pending data and directory changes to the stream.
    pub fn flush(&self) -> Result<()> {
        self.persist(abi::FLUSH)
    }

    /// Push pending image data, leaving directories alone.
    pub fn flush_data(&self) -> Result<()> {
        self.persist(abi::FLUSH_DATA)
    }

    fn persist(&self, export: &str) -> Result<()> {
        let mut session = self.session()?;
        let code = session.call_i32(export, &[Val::I32(self.handle.raw())])?;
        if !abi::succeeded(code) {
            return Err(self.failure(export, "current directory"));
        }
        Ok(())
    }

    /// Iterate directory indices starting at the current one.
    pub fn directories(&self) -> Directories<'_> {
        Directories::new(self)
    }

    // ── Strips ──

    pub fn strip_size(&self) -> Result<u64> {
        let mut session = self.session()?;
        self.chunk_size(&mut session, abi::STRIP_SIZE)
    }

    pub fn number_of_strips(&self) -> Result<u32> {
        let mut session = self.session()?;
        let count = session.call_i32(abi::NUMBER_OF_STRIPS, &[Val::I32(self.handle.raw())])?;
        Ok(count as u32)
    }

    /// Decode one strip of the current directory.
    pub fn read_encoded_strip(&self, strip: u32) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let size = self.chunk_size(&mut session, abi::STRIP_SIZE)?;
        self.read_chunk(&mut session, abi::READ_ENCODED_STRIP, "strip", strip, size)
    }

    /// Encode `data` into strip `strip` of the current directory. Returns the
    /// number of bytes the guest accepted.
    pub fn write_encoded_strip(&self, strip: u32, data: &[u8]) -> Result<u64> {
        let mut session = self.session()?;
        self.write_chunk(&mut session, abi::WRITE_ENCODED_STRIP, "strip", strip, data)
    }

    /// Stored bytes of one strip, without decoding.
    pub fn read_raw_strip(&self, strip: u32) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let size = self.chunk_size(&mut session, abi::STRIP_SIZE)?;
        self.read_chunk(&mut session, abi::READ_RAW_STRIP, "raw strip", strip, size)
    }

    /// Strip holding `row` of plane `sample`.
    pub fn compute_strip(&self, row: u32, sample: u16) -> Result<u32> {
        let mut session = self.session()?;
        let strip = session.call_i32(
            abi::COMPUTE_STRIP,
            &[
                Val::I32(self.handle.raw()),
                Val::I32(row as i32),
                Val::I32(i32::from(sample)),
            ],
        )?;
        Ok(strip as u32)
    }

    /// Bytes in one decoded row.
    pub fn scanline_size(&self) -> Result<u64> {
        let mut session = self.session()?;
        self.scanline_len(&mut session)
    }

    fn scanline_len(&self, session: &mut Session<'_>) -> Result<u64> {
        let code = session.call_i32(abi::SCANLINE_SIZE, &[Val::I32(self.handle.raw())])?;
        match abi::size_or_none(code) {
            Some(0) | None => Err(self.failure(abi::SCANLINE_SIZE, "current directory")),
            Some(n) => Ok(n),
        }
    }

    /// Bytes in a strip of `rows` decoded rows. `u32::MAX` means the whole image.
    pub fn vstrip_size(&self, rows: u32) -> Result<u64> {
        let mut session = self.session()?;
        let code = session.call_i32(
            abi::VSTRIP_SIZE,
            &[Val::I32(self.handle.raw()), Val::I32(rows as i32)],
        )?;
        abi::size_or_none(code)
            .ok_or_else(|| self.failure(abi::VSTRIP_SIZE, format_args!("{} rows", rows)))
    }

    /// Rows per strip the library would choose. A non-zero `request` is
    /// usually returned as is.
    pub fn default_strip_size(&self, request: u32) -> Result<u32> {
        let mut session = self.session()?;
        let rows = session.call_i32(
            abi::DEFAULT_STRIP_SIZE,
            &[Val::I32(self.handle.raw()), Val::I32(request as i32)],
        )?;
        Ok(rows as u32)
    }

    /// Decode row `row` of plane `sample`.
    pub fn read_scanline(&self, row: u32, sample: u16) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let size = self.scanline_len(&mut session)?;
        let handle = self.handle;
        session.with_allocation(size, |s, buf| {
            let code = s.call_i32(
                abi::READ_SCANLINE,
                &[
                    Val::I32(handle.raw()),
                    Val::I32(buf as i32),
                    Val::I32(row as i32),
                    Val::I32(i32::from(sample)),
                ],
            )?;
            if code < 0 {
                return Err(self.failure(abi::READ_SCANLINE, format_args!("row {}", row)));
            }
            s.read_buffer(buf, size)
        })
    }

    // ── Tiles ──

    pub fn is_tiled(&self) -> Result<bool> {
        let mut session = self.session()?;
        let code = session.call_i32(abi::IS_TILED, &[Val::I32(self.handle.raw())])?;
        Ok(abi::succeeded(code))
    }

    /// Bytes in one decoded tile; 0 when the image is organised in strips.
    pub fn tile_size(&self) -> Result<u64> {
        let mut session = self.session()?;
        self.chunk_size(&mut session, abi::TILE_SIZE)
    }

    pub fn number_of_tiles(&self) -> Result<u32> {
        let mut session = self.session()?;
        let count = session.call_i32(abi::NUMBER_OF_TILES, &[Val::I32(self.handle.raw())])?;
        Ok(count as u32)
    }

    /// Index of the tile containing pixel `(x, y)`, plane `z` and `sample`.
    pub fn compute_tile(&self, x: u32, y: u32, z: u32, sample: u16) -> Result<u32> {
        let mut session = self.session()?;
        let tile = session.call_i32(
            abi::COMPUTE_TILE,
            &[
                Val::I32(self.handle.raw()),
                Val::I32(x as i32),
                Val::I32(y as i32),
                Val::I32(z as i32),
                Val::I32(i32::from(sample)),
            ],
        )?;
        Ok(tile as u32)
    }

    /// Decode one tile of the current directory.
    pub fn read_encoded_tile(&self, tile: u32) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let size = self.tile_len(&mut session, abi::READ_ENCODED_TILE)?;
        self.read_chunk(&mut session, abi::READ_ENCODED_TILE, "tile", tile, size)
    }

    /// Stored bytes of one tile, without decoding.
    pub fn read_raw_tile(&self, tile: u32) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let size = self.tile_len(&mut session, abi::READ_RAW_TILE)?;
        self.read_chunk(&mut session, abi::READ_RAW_TILE, "raw tile", tile, size)
    }

    /// Tile dimensions the library would choose, starting from the hints.
    /// A zero hint leaves the choice to the library.
    pub fn default_tile_size(&self, width_hint: u32, height_hint: u32) -> Result<(u32, u32)> {
        let mut session = self.session()?;
        let handle = self.handle;
        session.with_allocation(8, |s, dims| {
            s.write_buffer(dims, &width_hint.to_le_bytes())?;
            s.write_buffer(dims + 4, &height_hint.to_le_bytes())?;
            s.call_unit(
                abi::DEFAULT_TILE_SIZE,
                &[Val::I32(handle.raw()), Val::I32(dims as i32), Val::I32(dims as i32 + 4)],
            )?;
            Ok((s.read_u32(dims)?, s.read_u32(dims + 4)?))
        })
    }

    pub fn write_encoded_tile(&self, tile: u32, data: &[u8]) -> Result<u64> {
        let mut session = self.session()?;
        self.write_chunk(&mut session, abi::WRITE_ENCODED_TILE, "tile", tile, data)
    }

    /// Tile size for a read through `export`; an error for strip images.
    fn tile_len(&self, session: &mut Session<'_>, export: &str) -> Result<u64> {
        match self.chunk_size(session, abi::TILE_SIZE)? {
            0 => Err(BridgeError::call_failed(
                export,
                format_args!("{} is not tiled", self.name),
            )),
            size => Ok(size),
        }
    }

    fn chunk_size(&self, session: &mut Session<'_>, export: &str) -> Result<u64> {
        let code = session.call_i32(export, &[Val::I32(self.handle.raw())])?;
        abi::size_or_none(code).ok_or_else(|| self.failure(export, "current directory"))
    }

    fn read_chunk(
        &self,
        session: &mut Session<'_>,
        export: &str,
        unit: &str,
        index: u32,
        size: u64,
    ) -> Result<Vec<u8>> {
        let handle = self.handle;
        session.with_allocation(size, |s, buf| {
            let code = s.call_i32(
                export,
                &[
                    Val::I32(handle.raw()),
                    Val::I32(index as i32),
                    Val::I32(buf as i32),
                    Val::I32(size as i32),
                ],
            )?;
            let read = abi::size_or_none(code)
                .ok_or_else(|| self.failure(export, format_args!("{} {}", unit, index)))?;
            s.read_buffer(buf, read)
        })
    }

    fn write_chunk(
        &self,
        session: &mut Session<'_>,
        export: &str,
        unit: &str,
        index: u32,
        data: &[u8],
    ) -> Result<u64> {
        let handle = self.handle;
        session.with_allocation(data.len() as u64, |s, buf| {
            s.write_buffer(buf, data)?;
            let code = s.call_i32(
                export,
                &[
                    Val::I32(handle.raw()),
                    Val::I32(index as i32),
                    Val::I32(buf as i32),
                    Val::I32(data.len() as i32),
                ],
            )?;
            abi::size_or_none(code).ok_or_else(|| {
                self.failure(
                    export,
                    format_args!("{} {} ({} bytes)", unit, index, data.len()),
                )
            })
        })
    }

    // ── Rasters ──

    /// Decode the current directory into a `width` x `height` RGBA raster
    /// with a top-left origin, returned as a view over guest memory.
    ///
    /// The view holds the instance's call guard until it is released or
    /// dropped. Other threads using the instance wait for it; any call on
    /// this instance from the thread holding the view fails with
    /// [`BridgeError::Reentrant`].
    pub fn read_rgba_image(&self, width: u32, height: u32) -> Result<RasterView<'_>> {
        let len = u64::from(width) * u64::from(height) * 4;
        let mut session = self.session()?;
        let raster = session.allocate(len)?;

        let code = session.call_i32(
            abi::READ_RGBA_IMAGE_ORIENTED,
            &[
                Val::I32(self.handle.raw()),
                Val::I32(width as i32),
                Val::I32(height as i32),
                Val::I32(raster as i32),
                Val::I32(abi::ORIENTATION_TOPLEFT),
                Val::I32(0),
            ],
        );
        let ok = match code {
            Ok(code) => abi::succeeded(code),
            Err(e) => {
                release_quietly(&mut session, raster);
                return Err(e);
            }
        };
        if !ok {
            release_quietly(&mut session, raster);
            return Err(self.failure(
                abi::READ_RGBA_IMAGE_ORIENTED,
                format_args!("{}x{} raster", width, height),
            ));
        }
        Ok(RasterView::new(session, raster, width, height))
    }

    /// Decode the strip starting at `row` into RGBA pixels, four bytes each,
    /// rows in the order the library produces them. `row` must be the first
    /// row of a strip.
    pub fn read_rgba_strip(&self, row: u32) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let width = self.dimension(&mut session, tags::IMAGE_WIDTH, Lookup::Explicit)?;
        let height = self.dimension(&mut session, tags::IMAGE_LENGTH, Lookup::Explicit)?;
        let per_strip = self.dimension(&mut session, tags::ROWS_PER_STRIP, Lookup::Defaulted)?;
        if row >= height {
            return Err(BridgeError::call_failed(
                abi::READ_RGBA_STRIP,
                format_args!("row {} is beyond the {} rows of {}", row, height, self.name),
            ));
        }
        let rows = per_strip.min(height - row);
        let len = u64::from(width) * u64::from(rows) * 4;

        let handle = self.handle;
        session.with_allocation(len, |s, raster| {
            let code = s.call_i32(
                abi::READ_RGBA_STRIP,
                &[Val::I32(handle.raw()), Val::I32(row as i32), Val::I32(raster as i32)],
            )?;
            if !abi::succeeded(code) {
                return Err(self.failure(abi::READ_RGBA_STRIP, format_args!("row {}", row)));
            }
            s.read_buffer(raster, len)
        })
    }

    /// Decode the tile whose origin is `(col, row)` into RGBA pixels, a full
    /// TileWidth x TileLength block.
    pub fn read_rgba_tile(&self, col: u32, row: u32) -> Result<Vec<u8>> {
        let mut session = self.session()?;
        let tile_width = self.dimension(&mut session, tags::TILE_WIDTH, Lookup::Explicit)?;
        let tile_length = self.dimension(&mut session, tags::TILE_LENGTH, Lookup::Explicit)?;
        let len = u64::from(tile_width) * u64::from(tile_length) * 4;

        let handle = self.handle;
        session.with_allocation(len, |s, raster| {
            let code = s.call_i32(
                abi::READ_RGBA_TILE,
                &[
                    Val::I32(handle.raw()),
                    Val::I32(col as i32),
                    Val::I32(row as i32),
                    Val::I32(raster as i32),
                ],
            )?;
            if !abi::succeeded(code) {
                return Err(self.failure(abi::READ_RGBA_TILE, format_args!("tile at {},{}", col, row)));
            }
            s.read_buffer(raster, len)
        })
    }

    // ── Diagnostics ──

    /// The error the guest reported during the most recent operation on this
    /// file, if any.
    pub fn last_error(&self) -> Option<GuestDiagnostic> {
        self.instance.streams().last_error(self.entry)
    }

    /// Every warning the guest reported for this file.
    pub fn warnings(&self) -> Vec<GuestDiagnostic> {
        self.instance.streams().warnings(self.entry)
    }

    /// Remove and return the warnings reported so far.
    pub fn take_warnings(&self) -> Vec<GuestDiagnostic> {
        self.instance.streams().take_warnings(self.entry)
    }

    /// Invoke `handler` for each warning reported from now on.
    ///
    /// The handler runs once the operation that raised the warning has
    /// returned and the call guard is free, so it may use this file.
    pub fn on_warning(&self, handler: WarningHandler) -> Result<()> {
        self.instance
            .streams()
            .set_warning_handler(self.entry, handler)
            .map_err(BridgeError::from)
    }

    // ── Close ──

    /// Close the guest handle and the host stream behind it.
    ///
    /// Closing twice is a no-op. Closing after the owning library was closed
    /// succeeds without touching the guest.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut session = match self.instance.session() {
            Ok(session) => session,
            Err(BridgeError::Closed(_)) => return Ok(()),
            Err(e) => {
                // Nothing was closed; leave the file usable for a retry.
                self.closed.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let closed = session.call_unit(abi::CLOSE, &[Val::I32(self.handle.raw())]);
        drop(session);

        // The guest usually closed the stream through its close procedure;
        // removing the entry closes it otherwise.
        let removed = self.instance.streams().remove(self.entry).map_err(BridgeError::from);
        closed.and(removed)
    }
}

fn release_quietly(session: &mut Session<'_>, ptr: u32) {
    if let Err(e) = session.release(ptr) {
        tracing::warn!(ptr, error = %e, "releasing raster after failed decode");
    }
}

impl Drop for TiffFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(file = %self.name, error = %e, "closing file on drop");
        }
    }
}
