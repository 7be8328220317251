// SPDX-License-Identifier: GPL-3.0-or-later

//! The host-side image loader: the external "UNIX-side loader" of §1/§6,
//! standing in for the serial uploader that puts an image on the real
//! target. Reads a class-file image from disk, validates it, and runs
//! its class initializers followed by `main` to completion.

use std::env;
use std::fs;
use std::process::ExitCode;

use nanovm_core::classfile::{ClassFile, ImageSource, SupportedFeatures};
use nanovm_core::context::VmContext;
use nanovm_core::dispatcher::Dispatcher;
use nanovm_core::error::VmError;
#[cfg(not(feature = "enable_stdio_native"))]
use nanovm_core::native::NoNatives;
#[cfg(feature = "enable_stdio_native")]
use nanovm_core::native::stdio::StdioNative;

/// Default heap/stack buffer size when the caller doesn't override it.
const DEFAULT_HEAP_SIZE: u16 = 1024;

fn report_fatal(err: VmError) -> ExitCode {
    eprintln!("ERR:{} ({err})", err.letter() as char);
    ExitCode::from(err.code() + 1)
}

fn run(path: &str, heap_size: u16) -> Result<(), VmError> {
    let bytes = fs::read(path).map_err(|_| VmError::NvmFileUnsupported)?;
    let classfile = ClassFile::init(ImageSource::Ram(&bytes), SupportedFeatures::from_build())?;
    let mut ctx = VmContext::new(heap_size, cfg!(feature = "enable_alloc_zeroing"), classfile);

    #[cfg(feature = "enable_stdio_native")]
    let mut natives = StdioNative;
    #[cfg(not(feature = "enable_stdio_native"))]
    let mut natives = NoNatives;

    Dispatcher::call_main(&mut ctx, &mut natives)
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(path) = args.get(1) else {
        eprintln!("usage: nanovm <image-file> [heap-size]");
        return ExitCode::FAILURE;
    };
    let heap_size = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_HEAP_SIZE);

    match run(path, heap_size) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report_fatal(err),
    }
}
