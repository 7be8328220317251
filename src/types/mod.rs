// SPDX-License-Identifier: GPL-3.0-or-later

//! Small newtypes shared across the core.

mod address;

pub use address::HeapAddr;
