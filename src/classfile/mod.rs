// SPDX-License-Identifier: GPL-3.0-or-later

//! The read-only accessor over a packed class-file image.
//!
//! Every interpreter access to code, constants, strings, class headers and
//! method headers goes through [`ClassFile`], which is oblivious to
//! whether the bytes behind it are a plain slice or some tagged secondary
//! storage — see [`image::ImageSource`].

mod header;
mod image;

pub use header::{ClassHdr, MethodHdr, FLAG_CLINIT, FLAG_NATIVE, FLAG_RETURNS_VALUE, NO_SUPERCLASS};
pub use image::{ClassImageMemory, ImageSource};

use header::{CLASS_HEADER_SIZE, FIXED_HEADER_SIZE, MAGIC, METHOD_HEADER_SIZE};

use crate::error::VmError;

/// Compile-time feature bits this build understands, checked against an
/// image's feature mask on [`ClassFile::init`] (§4.5, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct SupportedFeatures {
    pub arrays: bool,
    pub switch: bool,
    pub inheritance: bool,
}

impl SupportedFeatures {
    /// The feature set this build was actually compiled with.
    #[must_use]
    pub const fn from_build() -> Self {
        Self {
            arrays: cfg!(feature = "enable_arrays"),
            switch: cfg!(feature = "enable_switch"),
            inheritance: cfg!(feature = "enable_inheritance"),
        }
    }

    const fn mask(self) -> u32 {
        (self.arrays as u32) | ((self.switch as u32) << 1) | ((self.inheritance as u32) << 2)
    }
}

const SUPPORTED_VERSION: u8 = 1;

/// A validated, read-only class-file image.
pub struct ClassFile<'a> {
    source: ImageSource<'a>,
    feature_mask: u32,
    version: u8,
    method_count: u8,
    main_method_index: u16,
    constant_pool_offset: u16,
    string_pool_offset: u16,
    method_table_offset: u16,
    static_field_count: u8,
}

impl<'a> ClassFile<'a> {
    /// Validates `source`'s header and, on success, wraps it as a usable
    /// `ClassFile` (§4.5 "Image validation").
    ///
    /// # Errors
    /// Returns `NvmFileUnsupported` if the magic byte is wrong or the
    /// image requires a feature this build wasn't compiled with, or
    /// `NvmFileWrongVersion` if the version doesn't match.
    pub fn init(source: ImageSource<'a>, supported: SupportedFeatures) -> Result<Self, VmError> {
        let magic_and_features = source.read32(0);
        let magic = (magic_and_features >> 24) as u8;
        let feature_mask = magic_and_features & 0x00FF_FFFF;

        if magic != MAGIC {
            return Err(VmError::NvmFileUnsupported);
        }
        if feature_mask & !supported.mask() != 0 {
            return Err(VmError::NvmFileUnsupported);
        }

        let version = source.read8(4);
        if version != SUPPORTED_VERSION {
            return Err(VmError::NvmFileWrongVersion);
        }

        let method_count = source.read8(5);
        let main_method_index = source.read16(6);
        let constant_pool_offset = source.read16(8);
        let string_pool_offset = source.read16(10);
        let method_table_offset = source.read16(12);
        let static_field_count = source.read8(14);

        Ok(Self {
            source,
            feature_mask,
            version,
            method_count,
            main_method_index,
            constant_pool_offset,
            string_pool_offset,
            method_table_offset,
            static_field_count,
        })
    }

    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub const fn feature_mask(&self) -> u32 {
        self.feature_mask
    }

    #[must_use]
    pub const fn method_count(&self) -> u8 {
        self.method_count
    }

    #[must_use]
    pub const fn main_method_index(&self) -> u16 {
        self.main_method_index
    }

    #[must_use]
    pub const fn static_field_count(&self) -> u8 {
        self.static_field_count
    }

    /// Number of per-class headers, derived from the gap between the fixed
    /// header and the constant pool (the format has no explicit class
    /// count field; see DESIGN.md for this resolution).
    #[must_use]
    pub fn class_count(&self) -> u16 {
        (self.constant_pool_offset - FIXED_HEADER_SIZE) / CLASS_HEADER_SIZE
    }

    /// Byte offset where the code area begins: just past the method
    /// table. A method's `code_index` is relative to this, not to the
    /// start of the image (§6 "code bytes ... opcode stream referenced by
    /// method.code_index").
    #[must_use]
    pub fn code_base(&self) -> u16 {
        self.method_table_offset + u16::from(self.method_count) * METHOD_HEADER_SIZE
    }

    pub fn read8(&self, offset: u16) -> u8 {
        self.source.read8(offset)
    }

    pub fn read16(&self, offset: u16) -> u16 {
        self.source.read16(offset)
    }

    pub fn read32(&self, offset: u16) -> u32 {
        self.source.read32(offset)
    }

    pub fn read_bytes<'buf>(&self, offset: u16, out: &'buf mut [u8]) -> &'buf [u8] {
        self.source.read_bytes(offset, out)
    }

    /// Per-class header for `class_index`.
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `class_index` is out of range.
    pub fn get_class_fields(&self, class_index: u8) -> Result<ClassHdr, VmError> {
        if u16::from(class_index) >= self.class_count() {
            return Err(VmError::VmIllegalReference);
        }
        let offset = FIXED_HEADER_SIZE + u16::from(class_index) * CLASS_HEADER_SIZE;
        Ok(ClassHdr { super_index: self.read8(offset), field_count: self.read8(offset + 1) })
    }

    /// All field counts for the statics object (a single `fieldref` chunk
    /// sized `static_field_count * sizeof(Ref)`, per §3 "Statics").
    #[must_use]
    pub fn get_static_fields(&self) -> u8 {
        self.static_field_count
    }

    /// The 32-bit literal at constant-pool index `index`.
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `index` is out of range.
    pub fn get_constant(&self, index: u16) -> Result<u32, VmError> {
        let offset = self.constant_pool_offset + index * 4;
        if offset >= self.string_pool_offset {
            return Err(VmError::VmIllegalReference);
        }
        Ok(self.read32(offset))
    }

    /// Resolves a string-pool index to its byte offset, scanning past
    /// `index` null terminators (the format stores no string-offset
    /// table, only the pool's start; see DESIGN.md).
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `index` runs past the method table.
    pub fn get_addr(&self, index: u16) -> Result<u16, VmError> {
        let mut offset = self.string_pool_offset;
        let mut remaining = index;
        while remaining > 0 {
            if offset >= self.method_table_offset {
                return Err(VmError::VmIllegalReference);
            }
            while self.read8(offset) != 0 {
                offset += 1;
            }
            offset += 1;
            remaining -= 1;
        }
        if offset >= self.method_table_offset {
            return Err(VmError::VmIllegalReference);
        }
        Ok(offset)
    }

    fn method_hdr_at(&self, offset: u16) -> MethodHdr {
        let code_index = self.read16(offset);
        let id = self.read16(offset + 2);
        MethodHdr {
            code_index,
            class_id: (id >> 8) as u8,
            method_id: (id & 0xFF) as u8,
            flags: self.read8(offset + 4),
            args: self.read8(offset + 5),
            max_locals: self.read8(offset + 6),
            max_stack: self.read8(offset + 7),
        }
    }

    /// The method header at table index `index`.
    ///
    /// # Errors
    /// Returns `VmIllegalReference` if `index >= method_count`.
    pub fn get_method_hdr(&self, index: u8) -> Result<MethodHdr, VmError> {
        if index >= self.method_count {
            return Err(VmError::VmIllegalReference);
        }
        let offset = self.method_table_offset + u16::from(index) * METHOD_HEADER_SIZE;
        Ok(self.method_hdr_at(offset))
    }

    /// Linear search for the method header matching `(class_id, method_id)`.
    ///
    /// # Errors
    /// Returns `NativeUnknownMethod` if no method table entry matches.
    pub fn get_method_by_class_and_id(&self, class_id: u8, method_id: u8) -> Result<MethodHdr, VmError> {
        for index in 0..self.method_count {
            let hdr = self.get_method_hdr(index)?;
            if hdr.class_id == class_id && hdr.method_id == method_id {
                return Ok(hdr);
            }
        }
        Err(VmError::NativeUnknownMethod)
    }

    /// Every method header flagged `FLAG_CLINIT`, in declaration (table)
    /// order (§9 Open Question (a), resolved as the spec directs).
    pub fn clinit_methods(&self) -> impl Iterator<Item = MethodHdr> + '_ {
        (0..self.method_count).filter_map(move |i| {
            let hdr = self.method_hdr_at(self.method_table_offset + u16::from(i) * METHOD_HEADER_SIZE);
            hdr.is_clinit().then_some(hdr)
        })
    }
}

#[cfg(test)]
mod classfile_test;
