// SPDX-License-Identifier: GPL-3.0-or-later

//! The bump-from-the-top, compacting-by-shifting heap.
//!
//! A single contiguous buffer (shared with [`crate::stack::Stack`], which
//! claims bytes off the low end via [`Heap::steal`]) holds a sequence of
//! chunks. Exactly one chunk — the free chunk — always starts at `base`;
//! every allocation carves bytes off its high end, so chunks accumulate
//! from the top of the buffer down toward `base`. [`Heap::gc`] reclaims
//! unreachable chunks by shifting everything below them up and growing the
//! free chunk, never by moving survivors.

mod header;

use header::ChunkHeader;

pub use header::HEADER_SIZE;

use crate::error::VmError;
use crate::platform::Memory;
use crate::types::HeapAddr;

/// Reserved chunk id meaning "this chunk is free."
pub const HEAP_ID_FREE: u8 = 0;
/// Reserved chunk id meaning "awaiting collection" (set by [`Heap::realloc`]
/// on the chunk it just replaced).
pub const HEAP_ID_TOMBSTONE: u8 = 0xFF;

/// The heap over a [`Memory`] buffer.
///
/// `Heap` itself holds no bytes — it only tracks `base` (the stolen
/// boundary, moved by [`Heap::steal`]/[`Heap::unsteal`]) and the
/// configuration it was constructed with. Every operation takes the
/// backing [`Memory`] explicitly, which is what lets the same heap logic
/// run against a host-side buffer in tests and target SRAM on device.
pub struct Heap {
    base: HeapAddr,
    size: u16,
    alloc_zeroing: bool,
}

impl Heap {
    /// Creates a heap over the first `size` bytes of `mem` and writes the
    /// initial single free chunk spanning the whole region.
    ///
    /// `alloc_zeroing` mirrors the original's `NVM_INITIALIZE_ALLOCATED`
    /// build toggle (the §6 `enable_alloc_zeroing` configuration item):
    /// when set, freshly allocated payloads are zero-filled.
    pub fn new<M: Memory>(mem: &mut M, size: u16, alloc_zeroing: bool) -> Self {
        let base = HeapAddr::new(0);
        let free = ChunkHeader::new(HEAP_ID_FREE, false, size - HEADER_SIZE);
        free.write(mem, base);
        Self { base, size, alloc_zeroing }
    }

    /// The current stolen boundary; bytes below this belong to the stack.
    #[must_use]
    pub const fn base(&self) -> HeapAddr {
        self.base
    }

    /// Total backing buffer size, `H`.
    #[must_use]
    pub const fn size(&self) -> u16 {
        self.size
    }

    /// Bytes currently free, i.e. the length of the one free chunk.
    pub fn free_len<M: Memory>(&self, mem: &M) -> u16 {
        ChunkHeader::read(mem, self.base).len()
    }

    fn search<M: Memory>(&self, mem: &M, id: u8) -> Option<HeapAddr> {
        let mut current = self.base;
        while current.as_u16() < self.size {
            let header = ChunkHeader::read(mem, current);
            if header.id() == id {
                return Some(current);
            }
            current = current.add(header.len() + HEADER_SIZE);
        }
        None
    }

    fn new_id<M: Memory>(&self, mem: &M) -> Option<u8> {
        (1..HEAP_ID_TOMBSTONE).find(|&id| self.search(mem, id).is_none())
    }

    /// Places a new chunk at the top of the free span, shrinking it by
    /// `size + HEADER_SIZE`. Returns `false` if the free span is too small;
    /// callers retry after a `gc`.
    fn alloc_internal<M: Memory>(&mut self, mem: &mut M, id: u8, fieldref: bool, size: u16) -> bool {
        let free = ChunkHeader::read(mem, self.base);
        let Some(required) = size.checked_add(HEADER_SIZE) else {
            return false;
        };
        if free.len() < required {
            return false;
        }

        let new_free_len = free.len() - required;
        ChunkHeader::new(HEAP_ID_FREE, false, new_free_len).write(mem, self.base);

        let chunk_addr = self.base.add(HEADER_SIZE + new_free_len);
        ChunkHeader::new(id, fieldref, size).write(mem, chunk_addr);
        if self.alloc_zeroing {
            mem.zero(chunk_addr.add(HEADER_SIZE), size as usize);
        }
        true
    }

    /// Allocates a new chunk, collecting garbage once and retrying if the
    /// free span was initially too small.
    ///
    /// # Errors
    /// Returns `HeapOutOfMemory` if there is still not enough room after a
    /// collection, or if every chunk id is in use.
    pub fn alloc<M: Memory>(
        &mut self,
        mem: &mut M,
        fieldref: bool,
        size: u16,
        is_root: impl Fn(u8) -> bool,
    ) -> Result<u8, VmError> {
        let id = self.new_id(mem).ok_or(VmError::HeapOutOfMemory)?;
        if self.alloc_internal(mem, id, fieldref, size) {
            return Ok(id);
        }
        self.gc(mem, is_root);
        if self.alloc_internal(mem, id, fieldref, size) {
            return Ok(id);
        }
        Err(VmError::HeapOutOfMemory)
    }

    /// Resizes the chunk `id` to `new_size`, preserving its id and
    /// `fieldref` flag across the move.
    ///
    /// Mirrors the original's somewhat surprising collection policy: a
    /// `gc` runs first only when the free span is *already* big enough to
    /// satisfy the request without one — i.e. the collection is a
    /// best-effort attempt to avoid growing the heap's high-water mark
    /// further, not a last resort. The allocate-copy-tombstone sequence
    /// that follows always runs regardless of whether that `gc` happened.
    ///
    /// # Errors
    /// Returns `HeapChunkDoesNotExist` if `id` is not live, or
    /// `HeapOutOfMemory` if the resize cannot be satisfied.
    pub fn realloc<M: Memory>(
        &mut self,
        mem: &mut M,
        id: u8,
        new_size: u16,
        is_root: impl Fn(u8) -> bool,
    ) -> Result<(), VmError> {
        let free = ChunkHeader::read(mem, self.base);
        if free.len() >= new_size + HEADER_SIZE {
            // `id` itself must survive this collection even if nothing
            // else roots it — it's the chunk being resized, not garbage,
            // and the `search` just below depends on finding it again.
            self.gc(mem, |candidate| candidate == id || is_root(candidate));
        }

        let old_addr = self.search(mem, id).ok_or(VmError::HeapChunkDoesNotExist)?;
        let old = ChunkHeader::read(mem, old_addr);
        let old_payload_len = old.len();

        if !self.alloc_internal(mem, id, old.fieldref(), new_size) {
            return Err(VmError::HeapOutOfMemory);
        }

        let new_addr = self.search(mem, id).ok_or(VmError::HeapChunkDoesNotExist)?;
        let copy_len = old_payload_len.min(new_size) as usize;
        mem.copy_within(
            old_addr.add(HEADER_SIZE),
            new_addr.add(HEADER_SIZE),
            copy_len,
        );

        ChunkHeader::new(HEAP_ID_TOMBSTONE, old.fieldref(), old.len()).write(mem, old_addr);
        Ok(())
    }

    /// Payload length of chunk `id`.
    ///
    /// # Errors
    /// Returns `HeapChunkDoesNotExist` if `id` is not live.
    pub fn len<M: Memory>(&self, mem: &M, id: u8) -> Result<u16, VmError> {
        let addr = self.search(mem, id).ok_or(VmError::HeapChunkDoesNotExist)?;
        Ok(ChunkHeader::read(mem, addr).len())
    }

    /// Address of chunk `id`'s payload (just past its header).
    ///
    /// # Errors
    /// Returns `HeapChunkDoesNotExist` if `id` is not live.
    pub fn addr<M: Memory>(&self, mem: &M, id: u8) -> Result<HeapAddr, VmError> {
        let addr = self.search(mem, id).ok_or(VmError::HeapChunkDoesNotExist)?;
        Ok(addr.add(HEADER_SIZE))
    }

    /// Whether chunk `id` is a `fieldref` object.
    ///
    /// # Errors
    /// Returns `HeapChunkDoesNotExist` if `id` is not live.
    pub fn is_fieldref<M: Memory>(&self, mem: &M, id: u8) -> Result<bool, VmError> {
        let addr = self.search(mem, id).ok_or(VmError::HeapChunkDoesNotExist)?;
        Ok(ChunkHeader::read(mem, addr).fieldref())
    }

    /// Whether any `fieldref` chunk's payload contains a heap [`Ref`] equal
    /// to `id` — the second half of the liveness test (§4.1).
    ///
    /// [`Ref`]: crate::value::Ref
    fn contains_fieldref_to<M: Memory>(&self, mem: &M, id: u8) -> bool {
        use crate::value::Ref;

        let target = Ref::heap(u16::from(id));
        let mut current = self.base;
        while current.as_u16() < self.size {
            let header = ChunkHeader::read(mem, current);
            if header.fieldref() {
                let payload = header.payload_addr(current);
                let slots = header.len() / 2;
                for slot in 0..slots {
                    let candidate = mem.read::<u16>(payload.add(slot * 2));
                    if Ref::from_bits(candidate) == target {
                        return true;
                    }
                }
            }
            current = current.add(header.len() + HEADER_SIZE);
        }
        false
    }

    /// Walks the heap once, removing every chunk that is neither a stack
    /// root (`is_root`) nor referenced from another `fieldref` chunk,
    /// compacting by shifting the bytes below it up.
    ///
    /// Cyclic `fieldref` chains that reference each other but nothing else
    /// are, by design, kept alive (§9 "Cyclic object graphs").
    pub fn gc<M: Memory>(&mut self, mem: &mut M, is_root: impl Fn(u8) -> bool) {
        let mut current = self.base;
        while current.as_u16() < self.size {
            let header = ChunkHeader::read(mem, current);
            let chunk_total = header.len() + HEADER_SIZE;

            let removable = header.id() != HEAP_ID_FREE
                && !is_root(header.id())
                && !self.contains_fieldref_to(mem, header.id());

            if removable {
                let shift_len = current.diff(self.base);
                debug_assert!(shift_len >= 0);
                if shift_len > 0 {
                    mem.copy_within(self.base, self.base.add(chunk_total), shift_len as usize);
                }
                let grown = ChunkHeader::read(mem, self.base).len() + chunk_total;
                ChunkHeader::new(HEAP_ID_FREE, false, grown).write(mem, self.base);
            }

            current = current.add(chunk_total);
        }
    }

    /// Shrinks the free chunk by `bytes` and raises `base` by the same
    /// amount, running a `gc` first if the free span is currently too
    /// small to satisfy the request.
    ///
    /// # Errors
    /// Returns `HeapOutOfStackMemory` if there still isn't enough free
    /// space after collecting.
    pub fn steal<M: Memory>(
        &mut self,
        mem: &mut M,
        bytes: u16,
        is_root: impl Fn(u8) -> bool,
    ) -> Result<(), VmError> {
        let mut free_len = ChunkHeader::read(mem, self.base).len();
        if free_len < bytes {
            self.gc(mem, is_root);
            free_len = ChunkHeader::read(mem, self.base).len();
        }
        if free_len < bytes {
            return Err(VmError::HeapOutOfStackMemory);
        }

        self.base = self.base.add(bytes);
        ChunkHeader::new(HEAP_ID_FREE, false, free_len - bytes).write(mem, self.base);
        Ok(())
    }

    /// Gives `bytes` back to the heap, lowering `base`.
    ///
    /// # Errors
    /// Returns `HeapStackUnderrun` if `bytes` exceeds the current `base`.
    pub fn unsteal<M: Memory>(&mut self, mem: &mut M, bytes: u16) -> Result<(), VmError> {
        if self.base.as_u16() < bytes {
            return Err(VmError::HeapStackUnderrun);
        }
        let free_len = ChunkHeader::read(mem, self.base).len();
        self.base = self.base.sub(bytes);
        ChunkHeader::new(HEAP_ID_FREE, false, free_len + bytes).write(mem, self.base);
        Ok(())
    }
}
