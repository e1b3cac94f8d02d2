//! Kernel access to user memory
//!
//! Copies go through the target address space's translations and the
//! direct physical window, so they work on spaces that are not currently
//! loaded (signal delivery and exec set up stacks for threads picked on
//! other CPUs). Demand pages are faulted in on the way.

use alloc::sync::Arc;

use crate::{
    error::{KernelError, KernelResult},
    mm::{self, AddressSpace, PAGE_SIZE},
};

/// Translate one user page, demand-faulting it in when absent.
fn resolve_page(space: &Arc<AddressSpace>, page: u64, write: bool) -> KernelResult<u64> {
    if let Some(phys) = space.resolve(page) {
        if !write {
            return Ok(phys);
        }
        // A write may still need COW promotion.
        if space.handle_fault(page, true, true) || space.resolve(page).is_some() {
            return space.resolve(page).ok_or(KernelError::UnmappedMemory {
                addr: page as usize,
            });
        }
        return Ok(phys);
    }

    if !space.handle_fault(page, write, false) {
        return Err(KernelError::UnmappedMemory {
            addr: page as usize,
        });
    }

    space.resolve(page).ok_or(KernelError::UnmappedMemory {
        addr: page as usize,
    })
}

/// Copy `bytes` into `space` at `vaddr`.
pub fn copy_to_user(space: &Arc<AddressSpace>, vaddr: u64, bytes: &[u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < bytes.len() {
        let addr = vaddr + done as u64;
        let page = mm::page_align_down(addr);
        let offset = (addr - page) as usize;
        let chunk = (PAGE_SIZE - offset).min(bytes.len() - done);

        let phys = resolve_page(space, page, true)?;
        // SAFETY: resolved frame, offset bounded within the page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes[done..].as_ptr(),
                (mm::phys_to_virt(phys) as *mut u8).add(offset),
                chunk,
            );
        }

        done += chunk;
    }
    Ok(())
}

/// Copy `out.len()` bytes out of `space` at `vaddr`.
pub fn copy_from_user(space: &Arc<AddressSpace>, vaddr: u64, out: &mut [u8]) -> KernelResult<()> {
    let mut done = 0usize;
    while done < out.len() {
        let addr = vaddr + done as u64;
        let page = mm::page_align_down(addr);
        let offset = (addr - page) as usize;
        let chunk = (PAGE_SIZE - offset).min(out.len() - done);

        let phys = resolve_page(space, page, false)?;
        // SAFETY: resolved frame, offset bounded within the page.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (mm::phys_to_virt(phys) as *const u8).add(offset),
                out[done..].as_mut_ptr(),
                chunk,
            );
        }

        done += chunk;
    }
    Ok(())
}

/// Write one `T` into user memory.
pub fn write_val<T: Copy>(space: &Arc<AddressSpace>, vaddr: u64, value: &T) -> KernelResult<()> {
    // SAFETY: T is Copy/plain-old-data by contract of this module's users.
    let bytes = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to_user(space, vaddr, bytes)
}

/// Read one `T` out of user memory.
pub fn read_val<T: Copy + Default>(space: &Arc<AddressSpace>, vaddr: u64) -> KernelResult<T> {
    let mut value = T::default();
    // SAFETY: as in write_val.
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(
            &mut value as *mut T as *mut u8,
            core::mem::size_of::<T>(),
        )
    };
    copy_from_user(space, vaddr, bytes)?;
    Ok(value)
}

/// Read a NUL-terminated string (bounded) out of user memory.
pub fn read_cstring(
    space: &Arc<AddressSpace>,
    vaddr: u64,
    max: usize,
) -> KernelResult<alloc::string::String> {
    let mut out = alloc::vec::Vec::new();
    for i in 0..max as u64 {
        let byte: u8 = read_val(space, vaddr + i)?;
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    alloc::string::String::from_utf8(out).map_err(|_| KernelError::InvalidArgument)
}
