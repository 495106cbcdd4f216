//! Tag constants and their declared shapes.
//!
//! Generated from one table so the number, name, and shape of a tag cannot
//! drift apart. Shapes follow the typed accessor the guest exposes for the
//! tag, not the on-disk TIFF type.

use crate::field::{FieldShape, FieldTag};

macro_rules! tag_table {
    ($($(#[$doc:meta])* $name:ident = $num:literal => $shape:ident;)*) => {
        $(
            $(#[$doc])*
            pub const $name: FieldTag = FieldTag($num);
        )*

        /// Every tag in the table, in ascending order.
        pub const ALL: &[FieldTag] = &[$($name),*];

        /// Declared shape of a known tag.
        pub fn shape_of(tag: FieldTag) -> Option<FieldShape> {
            match tag.0 {
                $($num => Some(FieldShape::$shape),)*
                _ => None,
            }
        }

        /// Constant name of a known tag.
        pub fn name_of(tag: FieldTag) -> Option<&'static str> {
            match tag.0 {
                $($num => Some(stringify!($name)),)*
                _ => None,
            }
        }
    };
}

tag_table! {
    SUBFILE_TYPE = 254 => U32;
    IMAGE_WIDTH = 256 => U32;
    IMAGE_LENGTH = 257 => U32;
    BITS_PER_SAMPLE = 258 => U16;
    COMPRESSION = 259 => U16;
    PHOTOMETRIC = 262 => U16;
    THRESHHOLDING = 263 => U16;
    /// Bit order within a byte; defaults to MSB first.
    FILL_ORDER = 266 => U16;
    DOCUMENT_NAME = 269 => Text;
    IMAGE_DESCRIPTION = 270 => Text;
    MAKE = 271 => Text;
    MODEL = 272 => Text;
    ORIENTATION = 274 => U16;
    SAMPLES_PER_PIXEL = 277 => U16;
    ROWS_PER_STRIP = 278 => U32;
    MIN_SAMPLE_VALUE = 280 => U16;
    MAX_SAMPLE_VALUE = 281 => U16;
    X_RESOLUTION = 282 => F32;
    Y_RESOLUTION = 283 => F32;
    PLANAR_CONFIG = 284 => U16;
    PAGE_NAME = 285 => Text;
    X_POSITION = 286 => F32;
    Y_POSITION = 287 => F32;
    RESOLUTION_UNIT = 296 => U16;
    /// Page index and total page count.
    PAGE_NUMBER = 297 => PairU16;
    SOFTWARE = 305 => Text;
    DATE_TIME = 306 => Text;
    ARTIST = 315 => Text;
    HOST_COMPUTER = 316 => Text;
    PREDICTOR = 317 => U16;
    HALFTONE_HINTS = 321 => PairU16;
    TILE_WIDTH = 322 => U32;
    TILE_LENGTH = 323 => U32;
    INK_SET = 332 => U16;
    SAMPLE_FORMAT = 339 => U16;
    YCBCR_SUBSAMPLING = 530 => PairU16;
    COPYRIGHT = 33432 => Text;
    /// Sample value to nits.
    STONITS = 37439 => F64;
    /// Pseudo-tag: JPEG codec quality, never written to disk.
    JPEG_QUALITY = 65537 => Int;
    /// Pseudo-tag: deflate codec level, never written to disk.
    ZIP_QUALITY = 65557 => Int;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_tags() {
        assert_eq!(shape_of(IMAGE_WIDTH), Some(FieldShape::U32));
        assert_eq!(shape_of(PAGE_NUMBER), Some(FieldShape::PairU16));
        assert_eq!(shape_of(STONITS), Some(FieldShape::F64));
        assert_eq!(name_of(SOFTWARE), Some("SOFTWARE"));
        assert_eq!(IMAGE_LENGTH, FieldTag(257));
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(shape_of(FieldTag(1)), None);
        assert_eq!(name_of(FieldTag(1)), None);
    }

    #[test]
    fn test_table_is_sorted_and_unique() {
        assert!(ALL.windows(2).all(|w| w[0] < w[1]));
        assert!(ALL.iter().all(|t| shape_of(*t).is_some()));
    }
}
