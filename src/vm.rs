// SPDX-License-Identifier: GPL-3.0-or-later

//! The fetch/decode/execute loop.
//!
//! `Vm::run` is intentionally flat: rather than recursing through the host
//! call stack on every `invokestatic`/`invokevirtual` (the way a tree-walk
//! interpreter would), it swaps `pc`/`class_id`/`method_id` locals and
//! loops — mirroring the original's design constraint of running with a
//! host call stack of only a few frames. [`crate::stack::Frame`] carries
//! the equivalent of what would otherwise be the native stack's return
//! address.

#[cfg(any(test, feature = "std"))]
use std::vec::Vec;

#[cfg(not(any(test, feature = "std")))]
use alloc::vec::Vec;

use crate::bytecode::{elem_is_ref, elem_size, elem_type, op};
use crate::classfile::MethodHdr;
use crate::context::VmContext;
use crate::dispatcher::{read_ref_slot, ref_to_stack_value, write_ref_slot, Dispatcher};
use crate::error::VmError;
use crate::native::NativeMethods;
use crate::platform::Memory;
use crate::stack::{ReturnSite, StackValue};
use crate::types::HeapAddr;
use crate::value::Ref;

/// Fetch/decode/execute, namespaced the same way as [`Dispatcher`] — no
/// state of its own, everything lives in the [`VmContext`] it's handed.
pub struct Vm;

impl Vm {
    /// Runs `(class_id, method_id)` to completion with `args` as its
    /// initial locals, and returns its value if it declares one.
    ///
    /// This is the entry point for `main`, for every class initializer,
    /// and recursively for every `invokestatic`/`invokevirtual` the
    /// bytecode itself executes.
    ///
    /// # Errors
    /// Propagates any fatal [`VmError`] raised while resolving or
    /// executing the method, including an unsupported opcode.
    pub fn run<N: NativeMethods>(
        ctx: &mut VmContext,
        natives: &mut N,
        class_id: u8,
        method_id: u8,
        args: &[StackValue],
    ) -> Result<Option<StackValue>, VmError> {
        let hdr = Dispatcher::resolve_static(&ctx.classfile, class_id, method_id)?;
        if hdr.is_native() {
            let result = Dispatcher::call_native(ctx, natives, class_id, method_id, args)?;
            return Ok(result.map(ref_to_stack_value));
        }

        let code_base = ctx.classfile.code_base();
        // Never consulted: depth reaches 0 and Vm::run returns before any
        // `RETURN` looks at this frame's own return site.
        let top_level = ReturnSite { pc: 0, class_id: 0, method_id: 0 };
        ctx.enter_frame(args, hdr.max_locals, hdr.max_stack, top_level, hdr.returns_value())?;

        let mut class_id = hdr.class_id;
        let mut method_id = hdr.method_id;
        let mut pc = hdr.code_index;
        let mut depth: u32 = 1;

        loop {
            let opcode_addr = pc;
            let opcode = ctx.classfile.read8(code_base + pc);
            pc += 1;

            match opcode {
                op::ACONST_NULL => ctx.push_ref(Ref::NULL)?,
                op::ICONST => {
                    let value = ctx.classfile.read32(code_base + pc) as i32;
                    pc += 4;
                    ctx.push_int(value)?;
                }
                op::LDC_STRING => {
                    let index = ctx.classfile.read16(code_base + pc);
                    pc += 2;
                    ctx.push_ref(Ref::classfile_string(index))?;
                }
                op::LDC_CONST => {
                    // Resolved eagerly to a plain int, not a lazy
                    // `RefSpace::ClassfileConstant` ref: the arithmetic
                    // opcodes require an `Int`-tagged operand and there is
                    // no separate "unbox" instruction to produce one from
                    // a ref. See DESIGN.md.
                    let index = ctx.classfile.read16(code_base + pc);
                    pc += 2;
                    let value = ctx.classfile.get_constant(index)? as i32;
                    ctx.push_int(value)?;
                }

                op::LOAD => {
                    let index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let value = ctx.stack.load_local(&ctx.mem, index)?;
                    ctx.push_value(value)?;
                }
                op::STORE => {
                    let index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let value = ctx.pop_value()?;
                    ctx.stack.store_local(&mut ctx.mem, index, value)?;
                }

                op::IADD => Self::binop(ctx, |a, b| Ok(a.wrapping_add(b)))?,
                op::ISUB => Self::binop(ctx, |a, b| Ok(a.wrapping_sub(b)))?,
                op::IMUL => Self::binop(ctx, |a, b| Ok(a.wrapping_mul(b)))?,
                op::IDIV => Self::binop(ctx, |a, b| {
                    if b == 0 {
                        Err(VmError::VmDivisionByZero)
                    } else {
                        Ok(a.wrapping_div(b))
                    }
                })?,
                op::IREM => Self::binop(ctx, |a, b| {
                    if b == 0 {
                        Err(VmError::VmDivisionByZero)
                    } else {
                        Ok(a.wrapping_rem(b))
                    }
                })?,
                op::IAND => Self::binop(ctx, |a, b| Ok(a & b))?,
                op::IOR => Self::binop(ctx, |a, b| Ok(a | b))?,
                op::IXOR => Self::binop(ctx, |a, b| Ok(a ^ b))?,
                op::ISHL => Self::binop(ctx, |a, b| Ok(a.wrapping_shl((b & 0x1F) as u32)))?,
                op::ISHR => Self::binop(ctx, |a, b| Ok(a.wrapping_shr((b & 0x1F) as u32)))?,
                op::IUSHR => Self::binop(ctx, |a, b| {
                    Ok(((a as u32).wrapping_shr((b & 0x1F) as u32)) as i32)
                })?,

                op::IFEQ => Self::branch_if(ctx, opcode_addr, &mut pc, code_base, |v| v == 0)?,
                op::IFNE => Self::branch_if(ctx, opcode_addr, &mut pc, code_base, |v| v != 0)?,
                op::IFLT => Self::branch_if(ctx, opcode_addr, &mut pc, code_base, |v| v < 0)?,
                op::IFGE => Self::branch_if(ctx, opcode_addr, &mut pc, code_base, |v| v >= 0)?,
                op::IFGT => Self::branch_if(ctx, opcode_addr, &mut pc, code_base, |v| v > 0)?,
                op::IFLE => Self::branch_if(ctx, opcode_addr, &mut pc, code_base, |v| v <= 0)?,
                op::IF_ICMPEQ => Self::branch_icmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a == b)?,
                op::IF_ICMPNE => Self::branch_icmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a != b)?,
                op::IF_ICMPLT => Self::branch_icmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a < b)?,
                op::IF_ICMPGE => Self::branch_icmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a >= b)?,
                op::IF_ICMPGT => Self::branch_icmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a > b)?,
                op::IF_ICMPLE => Self::branch_icmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a <= b)?,
                op::IF_ACMPEQ => Self::branch_acmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a == b)?,
                op::IF_ACMPNE => Self::branch_acmp(ctx, opcode_addr, &mut pc, code_base, |a, b| a != b)?,
                op::GOTO => {
                    let offset = ctx.classfile.read16(code_base + pc) as i16;
                    pc = (i32::from(opcode_addr) + i32::from(offset)) as u16;
                }

                op::NEW => {
                    let class_index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let r = Dispatcher::new_object(ctx, class_index)?;
                    ctx.push_ref(r)?;
                }
                op::GETFIELD => {
                    let field_index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let id = Self::expect_heap_ref(ctx.pop_ref()?)?;
                    let value = Dispatcher::get_field(ctx, id, field_index)?;
                    ctx.push_value(value)?;
                }
                op::PUTFIELD => {
                    let field_index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let value = ctx.pop_value()?;
                    let id = Self::expect_heap_ref(ctx.pop_ref()?)?;
                    Dispatcher::put_field(ctx, id, field_index, value)?;
                }
                op::GETSTATIC => {
                    let field_index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let value = Dispatcher::get_static(ctx, field_index)?;
                    ctx.push_value(value)?;
                }
                op::PUTSTATIC => {
                    let field_index = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let value = ctx.pop_value()?;
                    Dispatcher::put_static(ctx, field_index, value)?;
                }

                op::NEWARRAY => Self::newarray(ctx, code_base, &mut pc)?,
                op::ARRAYLENGTH => Self::arraylength(ctx)?,
                op::BALOAD => Self::aload(ctx, elem_type::BYTE)?,
                op::BASTORE => Self::astore(ctx, elem_type::BYTE)?,
                op::SALOAD => Self::aload(ctx, elem_type::SHORT)?,
                op::SASTORE => Self::astore(ctx, elem_type::SHORT)?,
                op::IALOAD => Self::aload(ctx, elem_type::INT)?,
                op::IASTORE => Self::astore(ctx, elem_type::INT)?,
                op::AALOAD => Self::aload(ctx, elem_type::REF)?,
                op::AASTORE => Self::astore(ctx, elem_type::REF)?,

                op::TABLESWITCH => Self::tableswitch(ctx, opcode_addr, &mut pc, code_base)?,

                op::INVOKESTATIC => {
                    let callee_class = ctx.classfile.read8(code_base + pc);
                    let callee_method = ctx.classfile.read8(code_base + pc + 1);
                    pc += 2;
                    let callee_hdr = Dispatcher::resolve_static(&ctx.classfile, callee_class, callee_method)?;
                    let return_site = ReturnSite { pc, class_id, method_id };
                    if let Some((new_class, new_method, new_pc)) = Self::invoke(ctx, natives, callee_hdr, return_site, false)? {
                        class_id = new_class;
                        method_id = new_method;
                        pc = new_pc;
                        depth += 1;
                    }
                }
                op::INVOKEVIRTUAL => {
                    let callee_method = ctx.classfile.read8(code_base + pc);
                    pc += 1;
                    let receiver = ctx.peek(0)?;
                    let receiver_id = match receiver {
                        StackValue::Ref(r) if r.is_heap() => r.id() as u8,
                        _ => return Err(VmError::VmIllegalReference),
                    };
                    let receiver_class = Dispatcher::object_class_id(ctx, receiver_id)?;
                    let inheritance = cfg!(feature = "enable_inheritance");
                    let callee_hdr =
                        Dispatcher::resolve_virtual(&ctx.classfile, receiver_class, callee_method, inheritance)?;
                    let return_site = ReturnSite { pc, class_id, method_id };
                    if let Some((new_class, new_method, new_pc)) = Self::invoke(ctx, natives, callee_hdr, return_site, true)? {
                        class_id = new_class;
                        method_id = new_method;
                        pc = new_pc;
                        depth += 1;
                    }
                }
                op::RETURN => {
                    let (return_site, value) = ctx.leave_frame()?;
                    depth -= 1;
                    if depth == 0 {
                        return Ok(value);
                    }
                    class_id = return_site.class_id;
                    method_id = return_site.method_id;
                    pc = return_site.pc;
                    if let Some(v) = value {
                        ctx.push_value(v)?;
                    }
                }

                op::POP => {
                    ctx.pop_value()?;
                }
                op::DUP => ctx.dup()?,
                op::SWAP => ctx.stack_swap()?,

                _ => return Err(VmError::VmUnsupportedOpcode),
            }
        }
    }

    fn expect_heap_ref(r: Ref) -> Result<u8, VmError> {
        if r.is_heap() {
            Ok(r.id() as u8)
        } else {
            Err(VmError::VmIllegalReference)
        }
    }

    fn binop(ctx: &mut VmContext, f: impl FnOnce(i32, i32) -> Result<i32, VmError>) -> Result<(), VmError> {
        let b = ctx.pop_int()?;
        let a = ctx.pop_int()?;
        ctx.push_int(f(a, b)?)
    }

    fn branch_if(
        ctx: &mut VmContext,
        opcode_addr: u16,
        pc: &mut u16,
        code_base: u16,
        test: impl FnOnce(i32) -> bool,
    ) -> Result<(), VmError> {
        let offset = ctx.classfile.read16(code_base + *pc) as i16;
        *pc += 2;
        let v = ctx.pop_int()?;
        if test(v) {
            *pc = (i32::from(opcode_addr) + i32::from(offset)) as u16;
        }
        Ok(())
    }

    fn branch_icmp(
        ctx: &mut VmContext,
        opcode_addr: u16,
        pc: &mut u16,
        code_base: u16,
        test: impl FnOnce(i32, i32) -> bool,
    ) -> Result<(), VmError> {
        let offset = ctx.classfile.read16(code_base + *pc) as i16;
        *pc += 2;
        let b = ctx.pop_int()?;
        let a = ctx.pop_int()?;
        if test(a, b) {
            *pc = (i32::from(opcode_addr) + i32::from(offset)) as u16;
        }
        Ok(())
    }

    fn branch_acmp(
        ctx: &mut VmContext,
        opcode_addr: u16,
        pc: &mut u16,
        code_base: u16,
        test: impl FnOnce(Ref, Ref) -> bool,
    ) -> Result<(), VmError> {
        let offset = ctx.classfile.read16(code_base + *pc) as i16;
        *pc += 2;
        let b = ctx.pop_ref()?;
        let a = ctx.pop_ref()?;
        if test(a, b) {
            *pc = (i32::from(opcode_addr) + i32::from(offset)) as u16;
        }
        Ok(())
    }

    /// `newarray`: pops the element count, allocates a chunk sized for
    /// `count` elements of `elem_type` plus the one-slot element-type tag
    /// at payload offset 0 (§4.4 "Array element-type tagging" — there is
    /// no spare header bit for this, unlike the class-id tag object
    /// headers reuse field slot 0 for; see DESIGN.md).
    fn newarray(ctx: &mut VmContext, code_base: u16, pc: &mut u16) -> Result<(), VmError> {
        if !cfg!(feature = "enable_arrays") {
            return Err(VmError::VmUnsupportedOpcode);
        }
        let elem_type_tag = ctx.classfile.read8(code_base + *pc);
        *pc += 1;
        let length = ctx.pop_int()?;
        if length < 0 {
            return Err(VmError::VmIllegalReference);
        }
        let elem_sz = elem_size(elem_type_tag)?;
        let is_ref = elem_is_ref(elem_type_tag)?;
        let payload_size = ARRAY_TAG_SIZE
            .checked_add((length as u16).checked_mul(elem_sz).ok_or(VmError::HeapIllegalChunkSize)?)
            .ok_or(VmError::HeapIllegalChunkSize)?;
        let id = ctx.heap_alloc(is_ref, payload_size)?;
        write_ref_slot(ctx, id, 0, Ref::integer_literal(u16::from(elem_type_tag)))?;
        ctx.push_ref(Ref::heap(u16::from(id)))
    }

    fn array_elem_type(ctx: &VmContext, id: u8) -> Result<u8, VmError> {
        Ok(read_ref_slot(ctx, id, 0)?.id() as u8)
    }

    fn array_len(ctx: &VmContext, id: u8, elem_sz: u16) -> Result<u16, VmError> {
        let payload_len = ctx.heap.len(&ctx.mem, id)?;
        Ok((payload_len - ARRAY_TAG_SIZE) / elem_sz)
    }

    fn arraylength(ctx: &mut VmContext) -> Result<(), VmError> {
        if !cfg!(feature = "enable_arrays") {
            return Err(VmError::VmUnsupportedOpcode);
        }
        let id = Self::expect_heap_ref(ctx.pop_ref()?)?;
        let elem_type_tag = Self::array_elem_type(ctx, id)?;
        let elem_sz = elem_size(elem_type_tag)?;
        let count = Self::array_len(ctx, id, elem_sz)?;
        ctx.push_int(i32::from(count))
    }

    /// Resolves, bounds-checks, and returns the byte address of element
    /// `index` of array `id`, verifying its runtime element-type tag
    /// matches `expected` (§4.4 array bounds / type checking).
    fn array_elem_addr(ctx: &VmContext, id: u8, expected: u8, index: i32) -> Result<HeapAddr, VmError> {
        let actual = Self::array_elem_type(ctx, id)?;
        if actual != expected {
            return Err(VmError::ArrayIllegalElementType);
        }
        if index < 0 {
            return Err(VmError::VmIllegalReference);
        }
        let elem_sz = elem_size(expected)?;
        let count = Self::array_len(ctx, id, elem_sz)?;
        if index as u16 >= count {
            return Err(VmError::VmIllegalReference);
        }
        let base = ctx.heap.addr(&ctx.mem, id)?.add(ARRAY_TAG_SIZE);
        Ok(base.add(index as u16 * elem_sz))
    }

    fn aload(ctx: &mut VmContext, expected: u8) -> Result<(), VmError> {
        if !cfg!(feature = "enable_arrays") {
            return Err(VmError::VmUnsupportedOpcode);
        }
        let index = ctx.pop_int()?;
        let id = Self::expect_heap_ref(ctx.pop_ref()?)?;
        let addr = Self::array_elem_addr(ctx, id, expected, index)?;
        match expected {
            elem_type::BYTE => ctx.push_int(i32::from(ctx.mem.read::<u8>(addr) as i8)),
            elem_type::SHORT => ctx.push_int(i32::from(ctx.mem.read::<u16>(addr) as i16)),
            elem_type::INT => ctx.push_int(ctx.mem.read::<u32>(addr) as i32),
            _ => ctx.push_ref(Ref::from_bits(ctx.mem.read::<u16>(addr))),
        }
    }

    fn astore(ctx: &mut VmContext, expected: u8) -> Result<(), VmError> {
        if !cfg!(feature = "enable_arrays") {
            return Err(VmError::VmUnsupportedOpcode);
        }
        let value = if expected == elem_type::REF { StackValue::Ref(ctx.pop_ref()?) } else { StackValue::Int(ctx.pop_int()?) };
        let index = ctx.pop_int()?;
        let id = Self::expect_heap_ref(ctx.pop_ref()?)?;
        let addr = Self::array_elem_addr(ctx, id, expected, index)?;
        match (expected, value) {
            (elem_type::BYTE, StackValue::Int(v)) => ctx.mem.write(addr, v as u8),
            (elem_type::SHORT, StackValue::Int(v)) => ctx.mem.write(addr, v as u16),
            (elem_type::INT, StackValue::Int(v)) => ctx.mem.write(addr, v as u32),
            (_, StackValue::Ref(r)) => ctx.mem.write(addr, r.to_bits()),
            _ => return Err(VmError::VmStackCorrupted),
        }
        Ok(())
    }

    /// `tableswitch`: every offset (default and per-entry) is relative to
    /// `opcode_addr`, the address of the `tableswitch` opcode byte itself.
    fn tableswitch(ctx: &mut VmContext, opcode_addr: u16, pc: &mut u16, code_base: u16) -> Result<(), VmError> {
        if !cfg!(feature = "enable_switch") {
            return Err(VmError::VmUnsupportedOpcode);
        }
        let default_offset = ctx.classfile.read16(code_base + *pc) as i16;
        *pc += 2;
        let low = ctx.classfile.read32(code_base + *pc) as i32;
        *pc += 4;
        let high = ctx.classfile.read32(code_base + *pc) as i32;
        *pc += 4;
        let table_pc = *pc;

        let key = ctx.pop_int()?;
        let offset = if key < low || key > high {
            default_offset
        } else {
            let entry = (key - low) as u16;
            ctx.classfile.read16(code_base + table_pc + entry * 2) as i16
        };
        *pc = (i32::from(opcode_addr) + i32::from(offset)) as u16;
        Ok(())
    }

    /// Pops `hdr.args` arguments (in call order), then either calls
    /// straight into the native hook (no frame) or pushes a new frame and
    /// returns the interpreter locals the caller should resume with.
    /// `is_virtual` is `invokevirtual`'s receiver convention: the receiver
    /// is pushed last (on top of the declared arguments), so after the
    /// pop-and-reverse below it lands at the end of `args` instead of the
    /// front. Rotate it back to `args[0]` so it lands in `locals[0]`,
    /// matching the declared-arguments-after-`this` layout a method body
    /// expects.
    fn invoke<N: NativeMethods>(
        ctx: &mut VmContext,
        natives: &mut N,
        hdr: MethodHdr,
        return_site: ReturnSite,
        is_virtual: bool,
    ) -> Result<Option<(u8, u8, u16)>, VmError> {
        let mut args = Vec::with_capacity(usize::from(hdr.args));
        for _ in 0..hdr.args {
            args.push(ctx.pop_value()?);
        }
        args.reverse();
        if is_virtual && !args.is_empty() {
            args.rotate_right(1);
        }

        if hdr.is_native() {
            let result = Dispatcher::call_native(ctx, natives, hdr.class_id, hdr.method_id, &args)?;
            if let Some(r) = result {
                ctx.push_value(ref_to_stack_value(r))?;
            }
            Ok(None)
        } else {
            ctx.enter_frame(&args, hdr.max_locals, hdr.max_stack, return_site, hdr.returns_value())?;
            Ok(Some((hdr.class_id, hdr.method_id, hdr.code_index)))
        }
    }
}

/// Width, in bytes, of an array's element-type tag at payload offset 0.
const ARRAY_TAG_SIZE: u16 = 2;

#[cfg(test)]
#[path = "vm_test.rs"]
mod vm_test;
