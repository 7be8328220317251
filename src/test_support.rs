// SPDX-License-Identifier: GPL-3.0-or-later

//! Shared class-image builder for unit and integration tests.
//!
//! Hand-assembles the byte layout [`crate::classfile::classfile_test`]
//! exercises piecemeal, but as a small fluent builder so tests that need a
//! handful of classes/methods/constants don't each re-derive the header
//! offset arithmetic.

#![allow(dead_code)]

use std::string::String;
use std::vec::Vec;

#[derive(Clone)]
struct MethodSpec {
    class_id: u8,
    method_id: u8,
    flags: u8,
    args: u8,
    max_locals: u8,
    max_stack: u8,
    code: Vec<u8>,
}

/// Builds a well-formed class-file image byte-by-byte.
#[derive(Default)]
pub struct ImageBuilder {
    feature_mask: u32,
    static_field_count: u8,
    main_class: u8,
    main_method: u8,
    classes: Vec<(u8, u8)>,
    constants: Vec<u32>,
    strings: Vec<String>,
    methods: Vec<MethodSpec>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn feature_mask(mut self, mask: u32) -> Self {
        self.feature_mask = mask;
        self
    }

    #[must_use]
    pub const fn static_field_count(mut self, count: u8) -> Self {
        self.static_field_count = count;
        self
    }

    /// Sets which `(class_id, method_id)` `main_method_index` should point
    /// at; it must match a method added via [`Self::method`] or
    /// [`Self::native_method`].
    #[must_use]
    pub const fn main(mut self, class_id: u8, method_id: u8) -> Self {
        self.main_class = class_id;
        self.main_method = method_id;
        self
    }

    /// Appends a per-class header; the class index is its position in
    /// declaration order (0-based).
    #[must_use]
    pub fn class(mut self, super_index: u8, field_count: u8) -> Self {
        self.classes.push((super_index, field_count));
        self
    }

    /// Appends a constant-pool entry; its index is its position in
    /// declaration order.
    #[must_use]
    pub fn constant(mut self, value: u32) -> Self {
        self.constants.push(value);
        self
    }

    /// Appends a string-pool entry; its index is its position in
    /// declaration order.
    #[must_use]
    pub fn string(mut self, value: &str) -> Self {
        self.strings.push(value.into());
        self
    }

    /// Appends a bytecode-bodied method.
    #[must_use]
    pub fn method(
        mut self,
        class_id: u8,
        method_id: u8,
        flags: u8,
        args: u8,
        max_locals: u8,
        max_stack: u8,
        code: &[u8],
    ) -> Self {
        self.methods.push(MethodSpec { class_id, method_id, flags, args, max_locals, max_stack, code: code.into() });
        self
    }

    /// Appends a native method (no code body; `code_index` is unused).
    #[must_use]
    pub fn native_method(self, class_id: u8, method_id: u8, flags: u8, args: u8) -> Self {
        use crate::classfile::FLAG_NATIVE;
        self.method(class_id, method_id, flags | FLAG_NATIVE, args, 0, 0, &[])
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        const FIXED_HEADER_SIZE: u16 = 15;
        const CLASS_HEADER_SIZE: u16 = 2;
        const METHOD_HEADER_SIZE: u16 = 8;

        let main_method_index = self
            .methods
            .iter()
            .position(|m| m.class_id == self.main_class && m.method_id == self.main_method)
            .map_or(0_u16, |i| i as u16);

        let class_area_size = CLASS_HEADER_SIZE * self.classes.len() as u16;
        let constant_pool_offset = FIXED_HEADER_SIZE + class_area_size;
        let constant_area_size = 4 * self.constants.len() as u16;
        let string_pool_offset = constant_pool_offset + constant_area_size;
        let string_area_size: u16 = self.strings.iter().map(|s| s.len() as u16 + 1).sum();
        let method_table_offset = string_pool_offset + string_area_size;
        let method_area_size = METHOD_HEADER_SIZE * self.methods.len() as u16;

        let mut bytes = Vec::new();

        let magic_and_features = (0x12_u32 << 24) | (self.feature_mask & 0x00FF_FFFF);
        bytes.extend_from_slice(&magic_and_features.to_le_bytes());
        bytes.push(1); // version
        bytes.push(self.methods.len() as u8); // method_count
        bytes.extend_from_slice(&main_method_index.to_le_bytes());
        bytes.extend_from_slice(&constant_pool_offset.to_le_bytes());
        bytes.extend_from_slice(&string_pool_offset.to_le_bytes());
        bytes.extend_from_slice(&method_table_offset.to_le_bytes());
        bytes.push(self.static_field_count);
        assert_eq!(bytes.len(), FIXED_HEADER_SIZE as usize, "fixed header size drifted");

        for (super_index, field_count) in &self.classes {
            bytes.push(*super_index);
            bytes.push(*field_count);
        }

        for constant in &self.constants {
            bytes.extend_from_slice(&constant.to_le_bytes());
        }

        for string in &self.strings {
            bytes.extend_from_slice(string.as_bytes());
            bytes.push(0);
        }

        let mut code_index = 0_u16;
        let mut code_bytes = Vec::new();
        let mut method_table = Vec::new();
        for spec in &self.methods {
            let id = (u16::from(spec.class_id) << 8) | u16::from(spec.method_id);
            method_table.extend_from_slice(&code_index.to_le_bytes());
            method_table.extend_from_slice(&id.to_le_bytes());
            method_table.push(spec.flags);
            method_table.push(spec.args);
            method_table.push(spec.max_locals);
            method_table.push(spec.max_stack);
            code_index += spec.code.len() as u16;
            code_bytes.extend_from_slice(&spec.code);
        }
        assert_eq!(method_table.len(), method_area_size as usize, "method table size drifted");

        bytes.extend_from_slice(&method_table);
        bytes.extend_from_slice(&code_bytes);
        bytes
    }
}
