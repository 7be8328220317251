// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::ChunkHeader;
use crate::platform::HostMemory;
use crate::types::HeapAddr;

#[test]
fn fieldref_and_len_pack_into_one_u16() {
    let h = ChunkHeader::new(7, true, 100);
    assert_eq!(h.id(), 7);
    assert!(h.fieldref());
    assert_eq!(h.len(), 100);

    let h = ChunkHeader::new(7, false, 100);
    assert!(!h.fieldref());
    assert_eq!(h.len(), 100);
}

#[test]
fn round_trips_through_memory() {
    let mut mem = HostMemory::new(32);
    let addr = HeapAddr::new(4);
    ChunkHeader::new(9, true, 0x1234).write(&mut mem, addr);
    let back = ChunkHeader::read(&mem, addr);
    assert_eq!(back.id(), 9);
    assert!(back.fieldref());
    assert_eq!(back.len(), 0x1234);
}

#[test]
fn len_is_capped_at_fifteen_bits() {
    let h = ChunkHeader::new(1, false, 0xFFFF);
    assert_eq!(h.len(), 0x7FFF);
}
