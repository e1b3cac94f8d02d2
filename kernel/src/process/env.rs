//! Process image environment: argv/envp/auxv placement
//!
//! After the external loader has placed the ELF segments, the initial user
//! stack is materialized in the POSIX layout, growing down from the stack
//! top: the argument and environment strings first, then the auxv pairs,
//! the NULL-terminated envp and argv pointer arrays, and finally argc at
//! the resulting rsp.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::{
    error::KernelResult,
    mm::{uaccess, AddressSpace},
};

/// auxv keys consumed by the dynamic linker.
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;

/// What the external ELF loader reports back after placing an image.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadedImage {
    /// Entry point (the interpreter's, when one was loaded).
    pub entry: u64,
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
}

/// Per-process image state carried across fork and replaced by exec.
#[derive(Clone, Default)]
pub struct ProcessEnv {
    pub file_path: String,
    pub interp_path: Option<String>,
    pub image: LoadedImage,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub is_loaded: bool,
}

impl ProcessEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write argv/envp/auxv below `stack_top` in `space`; returns the
    /// initial rsp (pointing at argc).
    pub fn place_params(&self, space: &Arc<AddressSpace>, stack_top: u64) -> KernelResult<u64> {
        let mut string_cursor = stack_top;
        let mut argv_ptrs: Vec<u64> = Vec::with_capacity(self.argv.len());
        let mut envp_ptrs: Vec<u64> = Vec::with_capacity(self.envp.len());

        // Strings at the very top, NUL terminated, envp first to mirror
        // the traditional layout.
        for env in self.envp.iter().rev() {
            string_cursor -= env.len() as u64 + 1;
            uaccess::copy_to_user(space, string_cursor, env.as_bytes())?;
            uaccess::write_val(space, string_cursor + env.len() as u64, &0u8)?;
            envp_ptrs.push(string_cursor);
        }
        for arg in self.argv.iter().rev() {
            string_cursor -= arg.len() as u64 + 1;
            uaccess::copy_to_user(space, string_cursor, arg.as_bytes())?;
            uaccess::write_val(space, string_cursor + arg.len() as u64, &0u8)?;
            argv_ptrs.push(string_cursor);
        }
        envp_ptrs.reverse();
        argv_ptrs.reverse();

        // Pointer area below the strings, 16-byte aligned, padded so that
        // rsp lands 16-aligned after argc.
        let words = 1 // argc
            + argv_ptrs.len() + 1
            + envp_ptrs.len() + 1
            + 2 * 5; // four auxv pairs + AT_NULL
        let mut cursor = (string_cursor & !0xF) - (words as u64 * 8);
        if words % 2 == 1 {
            cursor -= 8;
        }
        let rsp = cursor;

        // argc
        uaccess::write_val(space, cursor, &(self.argv.len() as u64))?;
        cursor += 8;

        // argv[] + NULL
        for ptr in &argv_ptrs {
            uaccess::write_val(space, cursor, ptr)?;
            cursor += 8;
        }
        uaccess::write_val(space, cursor, &0u64)?;
        cursor += 8;

        // envp[] + NULL
        for ptr in &envp_ptrs {
            uaccess::write_val(space, cursor, ptr)?;
            cursor += 8;
        }
        uaccess::write_val(space, cursor, &0u64)?;
        cursor += 8;

        // auxv
        for (key, value) in [
            (AT_PHDR, self.image.phdr),
            (AT_PHENT, self.image.phent),
            (AT_PHNUM, self.image.phnum),
            (AT_ENTRY, self.image.entry),
            (0, 0),
        ] {
            uaccess::write_val(space, cursor, &key)?;
            cursor += 8;
            uaccess::write_val(space, cursor, &value)?;
            cursor += 8;
        }

        Ok(rsp)
    }
}
