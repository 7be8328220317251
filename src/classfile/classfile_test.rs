// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{ClassFile, ImageSource, SupportedFeatures};

/// Builds a tiny but complete image: one class (no superclass, no
/// fields), no constants, one string `"hi"`, and one non-clinit method.
fn tiny_image(feature_mask: u32) -> Vec<u8> {
    let mut bytes = Vec::new();

    let magic_and_features = (0x12_u32 << 24) | (feature_mask & 0x00FF_FFFF);
    bytes.extend_from_slice(&magic_and_features.to_le_bytes()); // magic_and_features
    bytes.push(1); // version
    bytes.push(1); // method_count
    bytes.extend_from_slice(&0_u16.to_le_bytes()); // main_method_index
    bytes.extend_from_slice(&17_u16.to_le_bytes()); // constant_pool_offset
    bytes.extend_from_slice(&17_u16.to_le_bytes()); // string_pool_offset
    bytes.extend_from_slice(&20_u16.to_le_bytes()); // method_table_offset
    bytes.push(0); // static_field_count

    // one class: no superclass, no fields
    bytes.push(0xFF);
    bytes.push(0);

    assert_eq!(bytes.len(), 17);

    // no constants; one string "hi\0"
    bytes.extend_from_slice(b"hi\0");
    assert_eq!(bytes.len(), 20);

    // one method: code_index=0, class_id=0, method_id=0, flags=0, args=0, max_locals=1, max_stack=2
    bytes.extend_from_slice(&0_u16.to_le_bytes()); // code_index
    bytes.extend_from_slice(&0_u16.to_le_bytes()); // id (class 0, method 0)
    bytes.push(0); // flags
    bytes.push(0); // args
    bytes.push(1); // max_locals
    bytes.push(2); // max_stack

    bytes
}

#[test]
fn valid_image_initializes_and_reports_header_fields() {
    let bytes = tiny_image(0);
    let cf = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build()).unwrap();
    assert_eq!(cf.version(), 1);
    assert_eq!(cf.method_count(), 1);
    assert_eq!(cf.class_count(), 1);
    assert_eq!(cf.static_field_count(), 0);
}

#[test]
fn class_header_reports_no_superclass() {
    let bytes = tiny_image(0);
    let cf = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build()).unwrap();
    let class = cf.get_class_fields(0).unwrap();
    assert!(!class.has_superclass());
    assert_eq!(class.field_count, 0);
}

#[test]
fn method_lookup_by_class_and_id() {
    let bytes = tiny_image(0);
    let cf = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build()).unwrap();
    let hdr = cf.get_method_by_class_and_id(0, 0).unwrap();
    assert_eq!(hdr.max_locals, 1);
    assert_eq!(hdr.max_stack, 2);
    assert!(!hdr.is_clinit());
}

#[test]
fn string_pool_resolves_by_scanning_null_terminators() {
    let bytes = tiny_image(0);
    let cf = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build()).unwrap();
    let addr = cf.get_addr(0).unwrap();
    let mut buf = [0_u8; 2];
    cf.read_bytes(addr, &mut buf);
    assert_eq!(&buf, b"hi");
}

/// S6 — image with an unsupported feature bit fails validation.
#[test]
fn unsupported_feature_bit_is_rejected() {
    let supported = SupportedFeatures { arrays: true, switch: true, inheritance: true };
    let bytes = tiny_image(0x08); // bit 3: not a feature this build understands
    let err = ClassFile::init(ImageSource::Ram(&bytes), supported).unwrap_err();
    assert_eq!(err, crate::error::VmError::NvmFileUnsupported);
}

#[test]
fn wrong_magic_is_rejected() {
    let mut bytes = tiny_image(0);
    bytes[3] = 0x99; // high byte of the little-endian u32 is the magic byte
    let err = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build()).unwrap_err();
    assert_eq!(err, crate::error::VmError::NvmFileUnsupported);
}

#[test]
fn wrong_version_is_rejected() {
    let mut bytes = tiny_image(0);
    bytes[4] = 9;
    let err = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build()).unwrap_err();
    assert_eq!(err, crate::error::VmError::NvmFileWrongVersion);
}
