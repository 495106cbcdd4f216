//! Names and conventions of the guest ABI.
//!
//! Export names are the C symbols of the guest library plus a few glue
//! exports compiled next to it. Import names are the host callbacks the glue
//! declares under the `env` module.

/// Module name of the host callbacks.
pub const ENV_MODULE: &str = "env";
/// Module name of the WASI preview1 system interface.
pub const WASI_MODULE: &str = "wasi_snapshot_preview1";

// ── Runtime exports ──

pub const MEMORY: &str = "memory";
pub const MALLOC: &str = "malloc";
pub const FREE: &str = "free";
pub const INITIALIZE: &str = "_initialize";
pub const START: &str = "_start";
pub const VSNPRINTF: &str = "vsnprintf";

// ── Host callbacks (imports) ──

pub const READ_PROC: &str = "tiff_read_proc";
pub const WRITE_PROC: &str = "tiff_write_proc";
pub const SEEK_PROC: &str = "tiff_seek_proc";
pub const CLOSE_PROC: &str = "tiff_close_proc";
pub const SIZE_PROC: &str = "tiff_size_proc";
pub const MAP_PROC: &str = "tiff_map_proc";
pub const UNMAP_PROC: &str = "tiff_unmap_proc";
pub const ERROR_HANDLER: &str = "tiff_error_handler";
pub const WARNING_HANDLER: &str = "tiff_warning_handler";

/// Every `env` import the host provides.
pub const HOST_CALLBACKS: &[&str] = &[
    READ_PROC,
    WRITE_PROC,
    SEEK_PROC,
    CLOSE_PROC,
    SIZE_PROC,
    MAP_PROC,
    UNMAP_PROC,
    ERROR_HANDLER,
    WARNING_HANDLER,
];

// ── Open options ──

pub const OPEN_OPTIONS_ALLOC: &str = "TIFFOpenOptionsAlloc";
pub const OPEN_OPTIONS_FREE: &str = "TIFFOpenOptionsFree";
pub const OPEN_OPTIONS_MAX_SINGLE: &str = "TIFFOpenOptionsSetMaxSingleMemAlloc";
pub const OPEN_OPTIONS_MAX_CUMULATED: &str = "TIFFOpenOptionsSetMaxCumulatedMemAlloc";
pub const OPEN_OPTIONS_HOST_HANDLERS: &str = "TIFFOpenOptionsSetHostHandlers";

// ── Files ──

pub const OPEN: &str = "TIFFOpenExt";
pub const CLIENT_OPEN: &str = "TIFFClientOpenHost";
pub const CLOSE: &str = "TIFFClose";

// ── Directories ──

pub const CURRENT_DIRECTORY: &str = "TIFFCurrentDirectory";
pub const NUMBER_OF_DIRECTORIES: &str = "TIFFNumberOfDirectories";
pub const READ_DIRECTORY: &str = "TIFFReadDirectory";
pub const SET_DIRECTORY: &str = "TIFFSetDirectory";
pub const LAST_DIRECTORY: &str = "TIFFLastDirectory";
pub const WRITE_DIRECTORY: &str = "TIFFWriteDirectory";
pub const CHECKPOINT_DIRECTORY: &str = "TIFFCheckpointDirectory";
pub const REWRITE_DIRECTORY: &str = "TIFFRewriteDirectory";
pub const FLUSH: &str = "TIFFFlush";
pub const FLUSH_DATA: &str = "TIFFFlushData";

// ── Strips, tiles and rasters ──

pub const STRIP_SIZE: &str = "TIFFStripSize";
pub const NUMBER_OF_STRIPS: &str = "TIFFNumberOfStrips";
pub const READ_ENCODED_STRIP: &str = "TIFFReadEncodedStrip";
pub const WRITE_ENCODED_STRIP: &str = "TIFFWriteEncodedStrip";
pub const IS_TILED: &str = "TIFFIsTiled";
pub const TILE_SIZE: &str = "TIFFTileSize";
pub const NUMBER_OF_TILES: &str = "TIFFNumberOfTiles";
pub const COMPUTE_TILE: &str = "TIFFComputeTile";
pub const READ_ENCODED_TILE: &str = "TIFFReadEncodedTile";
pub const WRITE_ENCODED_TILE: &str = "TIFFWriteEncodedTile";
pub const READ_RGBA_IMAGE_ORIENTED: &str = "TIFFReadRGBAImageOriented";
pub const READ_RGBA_STRIP: &str = "TIFFReadRGBAStrip";
pub const READ_RGBA_TILE: &str = "TIFFReadRGBATile";
pub const READ_RAW_STRIP: &str = "TIFFReadRawStrip";
pub const READ_RAW_TILE: &str = "TIFFReadRawTile";
pub const READ_SCANLINE: &str = "TIFFReadScanline";
pub const SCANLINE_SIZE: &str = "TIFFScanlineSize";
pub const VSTRIP_SIZE: &str = "TIFFVStripSize";
pub const COMPUTE_STRIP: &str = "TIFFComputeStrip";
pub const DEFAULT_STRIP_SIZE: &str = "TIFFDefaultStripSize";
pub const DEFAULT_TILE_SIZE: &str = "TIFFDefaultTileSize";

// ── Tag introspection ──

pub const GET_TAG_LIST_COUNT: &str = "TIFFGetTagListCount";
pub const GET_TAG_LIST_ENTRY: &str = "TIFFGetTagListEntry";
pub const FIELD_WITH_TAG: &str = "TIFFFieldWithTag";
pub const FIELD_WITH_NAME: &str = "TIFFFieldWithName";
pub const FIELD_NAME: &str = "TIFFFieldName";
pub const FIELD_TAG: &str = "TIFFFieldTag";
pub const FIELD_DATA_TYPE: &str = "TIFFFieldDataType";
pub const FIELD_READ_COUNT: &str = "TIFFFieldReadCount";
pub const FIELD_WRITE_COUNT: &str = "TIFFFieldWriteCount";
pub const FIELD_PASS_COUNT: &str = "TIFFFieldPassCount";
pub const FIELD_IS_ANONYMOUS: &str = "TIFFFieldIsAnonymous";
pub const FIELD_SET_GET_SIZE: &str = "TIFFFieldSetGetSize";
pub const FIELD_SET_GET_COUNT_SIZE: &str = "TIFFFieldSetGetCountSize";

// ── Library information ──

pub const GET_VERSION: &str = "TIFFGetVersion";
pub const DATA_WIDTH: &str = "TIFFDataWidth";
pub const GET_CONFIGURED_CODECS: &str = "TIFFGetConfiguredCODECs";

/// `TIFFCodec` on wasm32: name pointer at 0, u16 scheme at 4, init pointer at 8.
pub const CODEC_ENTRY_LEN: u32 = 12;

/// Special field counts: `TIFF_VARIABLE`, `TIFF_SPP`, `TIFF_VARIABLE2`.
pub const COUNT_VARIABLE: i32 = -1;
pub const COUNT_SAMPLES_PER_PIXEL: i32 = -2;
pub const COUNT_VARIABLE2: i32 = -3;

/// Size of the guest buffer diagnostics are formatted into.
pub const DIAGNOSTIC_BUFFER_LEN: i32 = 1024;

/// `ORIENTATION_TOPLEFT`, the row order of rasters returned to the host.
pub const ORIENTATION_TOPLEFT: i32 = 1;

/// Opaque handle the guest returns from an open call. Never dereferenced
/// by the host; only passed back into guest exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuestHandle(i32);

impl GuestHandle {
    /// `None` for the null handle a failed open returns.
    pub fn from_raw(raw: i32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

/// Boolean-style exports return 0 on failure.
pub fn succeeded(code: i32) -> bool {
    code != 0
}

/// Size and count exports return a negative value on failure.
pub fn size_or_none(code: i32) -> Option<u64> {
    u64::try_from(code).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(!succeeded(0));
        assert!(succeeded(1));
        assert!(succeeded(-7));
        assert_eq!(size_or_none(-1), None);
        assert_eq!(size_or_none(0), Some(0));
        assert_eq!(size_or_none(4096), Some(4096));
    }

    #[test]
    fn test_null_handle() {
        assert_eq!(GuestHandle::from_raw(0), None);
        assert_eq!(GuestHandle::from_raw(65536).map(GuestHandle::raw), Some(65536));
    }

    #[test]
    fn test_host_callbacks_are_unique() {
        let mut names = HOST_CALLBACKS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), HOST_CALLBACKS.len());
    }
}
