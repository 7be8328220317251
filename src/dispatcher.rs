// SPDX-License-Identifier: GPL-3.0-or-later

//! Method resolution, virtual dispatch, object/field access, and the
//! native call-out boundary (§4.4).
//!
//! `Dispatcher` is a namespace, not a value — like [`crate::vm::Vm`], all
//! state lives in the [`VmContext`] every function here takes explicitly.

#[cfg(any(test, feature = "std"))]
use std::vec::Vec;

#[cfg(not(any(test, feature = "std")))]
use alloc::vec::Vec;

use crate::classfile::{ClassFile, MethodHdr};
use crate::context::VmContext;
use crate::error::VmError;
use crate::native::NativeMethods;
use crate::platform::Memory;
use crate::stack::StackValue;
use crate::value::{Ref, RefSpace};

/// Slot width of one `Ref`-typed field, in bytes — every object field and
/// statics slot is exactly this wide (§4.3 "index into the chunk treated
/// as a `Ref` array").
const FIELD_SLOT_SIZE: u16 = 2;

/// Object instances reserve field slot 0 for their class id (§4.4 "Class
/// tagging of objects", the "reserve field 0" option); user-declared
/// fields are shifted up by one slot. The statics object carries no such
/// tag — it isn't an instance of any class.
const CLASS_TAG_SLOT: u16 = 0;
const FIELD_SLOT_OFFSET: u16 = 1;

/// Converts a popped operand-stack value into the `Ref`-sized
/// representation fields, statics, and native-method arguments share.
///
/// An `Int` that doesn't fit in 14 bits is truncated (§4.3 `new`/
/// `getfield`/`putfield`; see [`crate::value::Ref::from_int14`]).
#[must_use]
pub fn stack_value_to_ref(value: StackValue) -> Ref {
    match value {
        StackValue::Ref(r) => r,
        StackValue::Int(n) => Ref::from_int14(n),
    }
}

/// The inverse of [`stack_value_to_ref`]: an `IntegerLiteral` ref decodes
/// back to a tagged int; every other ref space stays a ref.
#[must_use]
pub fn ref_to_stack_value(r: Ref) -> StackValue {
    if matches!(r.space(), RefSpace::IntegerLiteral) {
        StackValue::Int(r.as_signed_literal())
    } else {
        StackValue::Ref(r)
    }
}

fn stack_values_to_refs(values: &[StackValue]) -> Vec<Ref> {
    values.iter().copied().map(stack_value_to_ref).collect()
}

pub(crate) fn read_ref_slot(ctx: &VmContext, id: u8, slot: u16) -> Result<Ref, VmError> {
    let len = ctx.heap.len(&ctx.mem, id)?;
    let offset = slot.checked_mul(FIELD_SLOT_SIZE).ok_or(VmError::VmIllegalReference)?;
    if offset.checked_add(FIELD_SLOT_SIZE).is_none_or(|end| end > len) {
        return Err(VmError::VmIllegalReference);
    }
    let addr = ctx.heap.addr(&ctx.mem, id)?.add(offset);
    Ok(Ref::from_bits(ctx.mem.read::<u16>(addr)))
}

pub(crate) fn write_ref_slot(ctx: &mut VmContext, id: u8, slot: u16, value: Ref) -> Result<(), VmError> {
    let len = ctx.heap.len(&ctx.mem, id)?;
    let offset = slot.checked_mul(FIELD_SLOT_SIZE).ok_or(VmError::VmIllegalReference)?;
    if offset.checked_add(FIELD_SLOT_SIZE).is_none_or(|end| end > len) {
        return Err(VmError::VmIllegalReference);
    }
    let addr = ctx.heap.addr(&ctx.mem, id)?.add(offset);
    ctx.mem.write(addr, value.to_bits());
    Ok(())
}

/// Stateless namespace for the §4.4 responsibilities.
pub struct Dispatcher;

impl Dispatcher {
    /// Allocates a new `fieldref` object of `class_index` and tags it
    /// with its class id at field slot 0.
    ///
    /// # Errors
    /// Whatever [`crate::heap::Heap::alloc`] or `get_class_fields` returns.
    pub fn new_object(ctx: &mut VmContext, class_index: u8) -> Result<Ref, VmError> {
        let class_hdr = ctx.classfile.get_class_fields(class_index)?;
        let size = (u16::from(class_hdr.field_count) + FIELD_SLOT_OFFSET) * FIELD_SLOT_SIZE;
        let id = ctx.heap_alloc(true, size)?;
        write_ref_slot(ctx, id, CLASS_TAG_SLOT, Ref::integer_literal(u16::from(class_index)))?;
        Ok(Ref::heap(u16::from(id)))
    }

    /// The class id an object of heap id `id` was tagged with at `new`.
    ///
    /// # Errors
    /// Returns `HeapChunkDoesNotExist` if `id` isn't live.
    pub fn object_class_id(ctx: &VmContext, id: u8) -> Result<u8, VmError> {
        let tag = read_ref_slot(ctx, id, CLASS_TAG_SLOT)?;
        Ok(tag.id() as u8)
    }

    /// `getfield`: reads user field `field_index` of object `id`
    /// (shifted past the class-id tag slot).
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `field_index` is out of range.
    pub fn get_field(ctx: &VmContext, id: u8, field_index: u8) -> Result<StackValue, VmError> {
        let slot = u16::from(field_index) + FIELD_SLOT_OFFSET;
        Ok(ref_to_stack_value(read_ref_slot(ctx, id, slot)?))
    }

    /// `putfield`: writes user field `field_index` of object `id`.
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `field_index` is out of range.
    pub fn put_field(ctx: &mut VmContext, id: u8, field_index: u8, value: StackValue) -> Result<(), VmError> {
        let slot = u16::from(field_index) + FIELD_SLOT_OFFSET;
        write_ref_slot(ctx, id, slot, stack_value_to_ref(value))
    }

    /// `getstatic`: reads statics slot `field_index` (no class tag, the
    /// statics object isn't an instance of anything).
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `field_index` is out of range.
    pub fn get_static(ctx: &VmContext, field_index: u8) -> Result<StackValue, VmError> {
        let id = ctx.statics;
        Ok(ref_to_stack_value(read_ref_slot(ctx, id, u16::from(field_index))?))
    }

    /// `putstatic`: writes statics slot `field_index`.
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `field_index` is out of range.
    pub fn put_static(ctx: &mut VmContext, field_index: u8, value: StackValue) -> Result<(), VmError> {
        let id = ctx.statics;
        write_ref_slot(ctx, id, u16::from(field_index), stack_value_to_ref(value))
    }

    /// Resolves `(class_id, method_id)` with no virtual lookup — the
    /// target of `invokestatic`, of every `CLINIT` method, and of `main`.
    ///
    /// # Errors
    /// Returns `NativeUnknownMethod` if no method table entry matches.
    pub fn resolve_static(classfile: &ClassFile, class_id: u8, method_id: u8) -> Result<MethodHdr, VmError> {
        classfile.get_method_by_class_and_id(class_id, method_id)
    }

    /// Resolves `method_id` starting at `start_class`, walking the
    /// `super` chain when `inheritance_enabled` and the class itself
    /// doesn't define it (§4.4 "Virtual dispatch").
    ///
    /// # Errors
    /// Returns `NativeUnknownMethod` if the walk reaches a class with no
    /// superclass (or if inheritance is disabled) without a match.
    pub fn resolve_virtual(
        classfile: &ClassFile,
        start_class: u8,
        method_id: u8,
        inheritance_enabled: bool,
    ) -> Result<MethodHdr, VmError> {
        let mut class_id = start_class;
        loop {
            match classfile.get_method_by_class_and_id(class_id, method_id) {
                Ok(hdr) => return Ok(hdr),
                Err(err) => {
                    if !inheritance_enabled {
                        return Err(err);
                    }
                    let class_hdr = classfile.get_class_fields(class_id)?;
                    if !class_hdr.has_superclass() {
                        return Err(VmError::NativeUnknownMethod);
                    }
                    class_id = class_hdr.super_index;
                }
            }
        }
    }

    /// Pops `args` into the native hook and pushes its return value, if
    /// any. The Dispatcher never peeks at what a native method does
    /// (§1) — it only converts stack values to `Ref`s and back.
    ///
    /// # Errors
    /// Whatever `natives.call` returns, including `NativeUnknownClass`/
    /// `NativeUnknownMethod` for an unrecognized pair.
    pub fn call_native<N: NativeMethods>(
        ctx: &mut VmContext,
        natives: &mut N,
        class_id: u8,
        method_id: u8,
        args: &[StackValue],
    ) -> Result<Option<Ref>, VmError> {
        let refs = stack_values_to_refs(args);
        natives.call(ctx, class_id, method_id, &refs)
    }

    /// Runs every `CLINIT`-flagged method in method-table (declaration)
    /// order (§9 Open Question (a)).
    ///
    /// # Errors
    /// Propagates the first fatal error any class initializer raises.
    pub fn run_clinits<N: NativeMethods>(ctx: &mut VmContext, natives: &mut N) -> Result<(), VmError> {
        let clinits: Vec<MethodHdr> = ctx.classfile.clinit_methods().collect();
        for hdr in clinits {
            crate::vm::Vm::run(ctx, natives, hdr.class_id, hdr.method_id, &[])?;
        }
        Ok(())
    }

    /// Runs class initializers, then locates and calls `main` to
    /// completion — the embedding's `nvmfile_call_main()` (§6).
    ///
    /// # Errors
    /// Propagates the first fatal error raised by a class initializer or
    /// by `main` itself.
    pub fn call_main<N: NativeMethods>(ctx: &mut VmContext, natives: &mut N) -> Result<(), VmError> {
        Self::run_clinits(ctx, natives)?;
        let main_index = ctx.classfile.main_method_index() as u8;
        let hdr = ctx.classfile.get_method_hdr(main_index)?;
        crate::vm::Vm::run(ctx, natives, hdr.class_id, hdr.method_id, &[])?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "dispatcher_test.rs"]
mod dispatcher_test;
