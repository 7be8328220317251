// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::HostMemory;
use crate::platform::Memory;
use crate::types::HeapAddr;

#[test]
fn read_write_round_trip() {
    let mut mem = HostMemory::new(64);
    mem.write(HeapAddr::new(4), 0xBEEF_u16);
    assert_eq!(mem.read::<u16>(HeapAddr::new(4)), 0xBEEF);
}

#[test]
fn zero_clears_region() {
    let mut mem = HostMemory::new(16);
    mem.write(HeapAddr::new(0), 0xFFFF_FFFF_u32);
    mem.zero(HeapAddr::new(0), 4);
    assert_eq!(mem.read::<u32>(HeapAddr::new(0)), 0);
}

#[test]
fn copy_within_handles_overlap_upward() {
    let mut mem = HostMemory::new(16);
    for i in 0..8_u16 {
        mem.write(HeapAddr::new(i), i as u8);
    }
    mem.copy_within(HeapAddr::new(0), HeapAddr::new(4), 8);
    for i in 0..8_u16 {
        assert_eq!(mem.read::<u8>(HeapAddr::new(4 + i)), i as u8);
    }
}

#[test]
fn len_matches_construction_size() {
    let mem = HostMemory::new(100);
    assert_eq!(mem.len(), 100);
    assert!(!mem.is_empty());
}
