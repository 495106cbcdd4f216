//! Codec table, tag lists and field descriptors.

mod common;

use common::*;
use tiffbridge_sandbox::{tags, BridgeError, FieldCount, FieldTag};

#[test]
fn test_configured_codecs() {
    let lib = library();
    let codecs = lib.configured_codecs().unwrap();
    let summary: Vec<(&str, u16)> = codecs.iter().map(|c| (c.name.as_str(), c.scheme)).collect();
    assert_eq!(
        summary,
        vec![("None", 1), ("LZW", 5), ("PackBits", 32773), ("Deflate", 8)]
    );
    // the table is rebuilt for every call
    assert_eq!(lib.configured_codecs().unwrap(), codecs);
}

#[test]
fn test_tag_list_follows_the_current_directory() {
    let lib = library();
    let file = open_dims(&lib, &[(8, 4), (2, 2)]);
    assert_eq!(file.tag_list().unwrap(), vec![tags::IMAGE_WIDTH, tags::IMAGE_LENGTH]);

    file.set(tags::ORIENTATION, 3u16).unwrap();
    assert_eq!(
        file.tag_list().unwrap(),
        vec![tags::IMAGE_WIDTH, tags::IMAGE_LENGTH, tags::ORIENTATION]
    );

    file.set_directory(1).unwrap();
    assert_eq!(file.tag_list().unwrap().len(), 2);

    let (empty, _sink) = create(&lib);
    assert!(empty.tag_list().unwrap().is_empty());
}

#[test]
fn test_field_with_tag() {
    let lib = library();
    let file = open_dims(&lib, &[(1, 1)]);

    let width = file.field_with_tag(tags::IMAGE_WIDTH).unwrap().expect("ImageWidth is known");
    assert_eq!(width.tag, tags::IMAGE_WIDTH);
    assert_eq!(width.name, "ImageWidth");
    assert_eq!(width.read_count, FieldCount::Fixed(1));
    assert_eq!(width.write_count, FieldCount::Fixed(1));
    assert!(!width.pass_count);
    assert!(!width.anonymous);
    assert_eq!(width.set_get_size, 4);
    // LONG
    assert_eq!(width.data_type, 4);
    assert_eq!(lib.data_width(width.data_type).unwrap(), 4);

    let description = file.field_with_tag(270u32).unwrap().unwrap();
    assert_eq!(description.name, "ImageDescription");
    assert_eq!(description.read_count, FieldCount::Variable);
    assert_eq!(description.data_type, 2);

    assert_eq!(file.field_with_tag(FieldTag(65000)).unwrap(), None);
}

#[test]
fn test_field_with_name() {
    let lib = library();
    let file = open_dims(&lib, &[(1, 1)]);

    let extra = file.field_with_name("ExtraSamples").unwrap().expect("ExtraSamples is known");
    assert_eq!(extra.tag, FieldTag(338));
    assert_eq!(extra.write_count, FieldCount::Variable);
    assert!(extra.pass_count);
    assert_eq!(extra.set_get_count_size, 2);

    let by_name = file.field_with_name("Orientation").unwrap().unwrap();
    assert_eq!(Some(by_name), file.field_with_tag(tags::ORIENTATION).unwrap());

    assert_eq!(file.field_with_name("NoSuchField").unwrap(), None);
    match file.field_with_name("Image\0Width") {
        Err(BridgeError::CallFailed { detail, .. }) => assert!(detail.contains("NUL")),
        other => panic!("expected CallFailed, got {:?}", other),
    }
    // the file is still usable
    assert_eq!(file.get::<u32>(tags::IMAGE_WIDTH).unwrap(), 1);
}
