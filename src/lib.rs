// SPDX-License-Identifier: GPL-3.0-or-later

//! # nanovm-core
//!
//! Runtime core for a tiny stack-based virtual machine that executes a
//! compact bytecode derived from Java class files, on extremely
//! resource-constrained targets (RAM on the order of 1 KiB).
//!
//! This crate provides:
//! - A compacting, bump-style heap allocator and garbage collector
//!   ([`heap`]), sharing its backing buffer with the operand stack.
//! - An operand stack with tagged slots and frame bookkeeping ([`stack`]).
//! - A read-only accessor over an externally supplied class-file image
//!   ([`classfile`]).
//! - A bytecode fetch/decode/execute loop ([`vm`]) and its opcode table
//!   ([`bytecode`]).
//! - Method resolution, virtual dispatch, and native call-out
//!   ([`dispatcher`]).
//!
//! The core never touches hardware, a filesystem, or an OS thread directly:
//! everything it needs is reached through the [`platform::Memory`] trait
//! (for the heap/stack buffer) and the [`native::NativeMethods`] trait (for
//! native method bodies). This makes the whole core runnable and testable
//! on a desktop host exactly the way it runs on the target.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(any(test, feature = "std"))]
extern crate std;

extern crate alloc;

pub mod bytecode;
pub mod classfile;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod heap;
pub mod native;
pub mod platform;
pub mod stack;
pub mod types;
pub mod value;
pub mod vm;

#[cfg(test)]
mod test_support;


pub use context::VmContext;
pub use error::VmError;
pub use types::HeapAddr;
pub use value::Ref;

/// Crate version, exposed for embedders that report it over a debug link.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
