//! Architecture layer
//!
//! The kernel targets x86-64; this module is the seam the portable code
//! goes through. Every function has a host-build fallback so the crate's
//! unit tests run under `cargo test` on the build machine, where none of
//! the privileged instructions may execute.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use crate::sched::task::{FxArea, RegFrame};

/// Segment selectors fixed by the GDT layout (see `x86_64::gdt`). The
/// user selectors carry RPL 3, ordered for sysret (SS = base + 8,
/// CS = base + 16).
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_SS: u16 = 0x10;
pub const USER_SS: u16 = 0x1B;
pub const USER_CS: u16 = 0x23;

/// Interrupt vectors.
pub const TIMER_VECTOR: u8 = 32;
pub const RESCHED_VECTOR: u8 = 253;
pub const SPURIOUS_VECTOR: u8 = 255;

/// The register image interrupt stubs and the syscall entry push onto the
/// kernel stack, lowest address first.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IrqFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl IrqFrame {
    /// Copy the general-purpose state into a thread's saved frame.
    pub fn save_into(&self, regs: &mut RegFrame) {
        regs.rax = self.rax;
        regs.rbx = self.rbx;
        regs.rcx = self.rcx;
        regs.rdx = self.rdx;
        regs.rbp = self.rbp;
        regs.rdi = self.rdi;
        regs.rsi = self.rsi;
        regs.r8 = self.r8;
        regs.r9 = self.r9;
        regs.r10 = self.r10;
        regs.r11 = self.r11;
        regs.r12 = self.r12;
        regs.r13 = self.r13;
        regs.r14 = self.r14;
        regs.r15 = self.r15;
        regs.rip = self.rip;
        regs.rsp = self.rsp;
        regs.cs = self.cs;
        regs.ss = self.ss;
        regs.rflags = self.rflags;
    }

    /// Load a thread's saved frame for the return path.
    pub fn load_from(&mut self, regs: &RegFrame) {
        self.rax = regs.rax;
        self.rbx = regs.rbx;
        self.rcx = regs.rcx;
        self.rdx = regs.rdx;
        self.rbp = regs.rbp;
        self.rdi = regs.rdi;
        self.rsi = regs.rsi;
        self.r8 = regs.r8;
        self.r9 = regs.r9;
        self.r10 = regs.r10;
        self.r11 = regs.r11;
        self.r12 = regs.r12;
        self.r13 = regs.r13;
        self.r14 = regs.r14;
        self.r15 = regs.r15;
        self.rip = regs.rip;
        self.rsp = regs.rsp;
        self.cs = regs.cs;
        self.ss = regs.ss;
        self.rflags = regs.rflags;
    }
}

// ---------------------------------------------------------------------------
// Bare-metal implementations
// ---------------------------------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use super::*;

    pub fn cpu_id() -> usize {
        x86_64::apic::lapic_id() as usize
    }

    pub fn read_tsc() -> u64 {
        // SAFETY: rdtsc is unprivileged.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    pub fn read_cr3() -> u64 {
        ::x86_64::registers::control::Cr3::read()
            .0
            .start_address()
            .as_u64()
    }

    pub fn write_cr3(root: u64) {
        use ::x86_64::{
            registers::control::{Cr3, Cr3Flags},
            structures::paging::PhysFrame,
            PhysAddr,
        };
        // SAFETY: `root` is the physical address of a valid top-level
        // table kept alive by its owning address space.
        unsafe {
            Cr3::write(
                PhysFrame::containing_address(PhysAddr::new(root)),
                Cr3Flags::empty(),
            );
        }
    }

    pub fn save_fx(area: &mut FxArea) {
        // SAFETY: the area is 512 bytes, 16-byte aligned.
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) area.0.as_mut_ptr(), options(nostack));
        }
    }

    pub fn load_fx(area: &FxArea) {
        // SAFETY: as save_fx; the area holds a valid FXSAVE image.
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) area.0.as_ptr(), options(nostack));
        }
    }

    pub fn get_mxcsr() -> u32 {
        let mut mxcsr: u32 = 0;
        // SAFETY: stmxcsr writes four bytes to the given location.
        unsafe {
            core::arch::asm!("stmxcsr [{}]", in(reg) &mut mxcsr, options(nostack));
        }
        mxcsr
    }

    pub fn set_mxcsr(mxcsr: u32) {
        // SAFETY: ldmxcsr reads four bytes from the given location.
        unsafe {
            core::arch::asm!("ldmxcsr [{}]", in(reg) &mxcsr, options(nostack));
        }
    }

    pub fn get_fcw() -> u16 {
        let mut fcw: u16 = 0;
        // SAFETY: fnstcw writes two bytes to the given location.
        unsafe {
            core::arch::asm!("fnstcw [{}]", in(reg) &mut fcw, options(nostack));
        }
        fcw
    }

    pub fn set_fcw(fcw: u16) {
        // SAFETY: fldcw reads two bytes from the given location.
        unsafe {
            core::arch::asm!("fldcw [{}]", in(reg) &fcw, options(nostack));
        }
    }

    pub fn halt_until_interrupt() {
        ::x86_64::instructions::interrupts::enable_and_hlt();
    }

    pub fn init_sse() {
        use ::x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
        // SAFETY: standard SSE bring-up on a CPU that supports it.
        unsafe {
            let mut cr0 = Cr0::read();
            cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
            cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
            Cr0::write(cr0);

            let mut cr4 = Cr4::read();
            cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
            Cr4::write(cr4);
        }
    }

    pub fn init_syscalls() {
        x86_64::syscall::init();
    }

    pub fn set_kernel_stacks(kstack: u64) {
        x86_64::gdt::set_kernel_stacks(kstack);
        x86_64::syscall::set_kernel_stack(kstack);
    }

    pub fn broadcast_reschedule() {
        x86_64::apic::send_ipi_all_but_self(RESCHED_VECTOR);
    }

    pub fn reschedule_self() {
        ::x86_64::instructions::interrupts::enable();
        x86_64::apic::send_ipi_self(RESCHED_VECTOR);
        ::x86_64::instructions::hlt();
    }

    pub fn set_fs_base(base: u64) {
        ::x86_64::registers::model_specific::FsBase::write(::x86_64::VirtAddr::new(base));
    }

    pub fn get_fs_base() -> u64 {
        ::x86_64::registers::model_specific::FsBase::read().as_u64()
    }

    /// While in the kernel the user's GS base sits in KERNEL_GS_BASE
    /// (swapped at syscall entry); that is the one user-visible writes
    /// target.
    pub fn set_user_gs_base(base: u64) {
        ::x86_64::registers::model_specific::KernelGsBase::write(::x86_64::VirtAddr::new(base));
    }

    pub fn get_user_gs_base() -> u64 {
        ::x86_64::registers::model_specific::KernelGsBase::read().as_u64()
    }
}

// ---------------------------------------------------------------------------
// Host (unit test) fallbacks: nothing privileged may run.
// ---------------------------------------------------------------------------

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use super::*;

    pub fn cpu_id() -> usize {
        0
    }

    pub fn read_tsc() -> u64 {
        0
    }

    pub fn read_cr3() -> u64 {
        0
    }

    pub fn write_cr3(_root: u64) {}

    pub fn save_fx(_area: &mut FxArea) {}

    pub fn load_fx(_area: &FxArea) {}

    pub fn get_mxcsr() -> u32 {
        0x1F80
    }

    pub fn set_mxcsr(_value: u32) {}

    pub fn get_fcw() -> u16 {
        0x33F
    }

    pub fn set_fcw(_fcw: u16) {}

    pub fn halt_until_interrupt() {
        core::hint::spin_loop();
    }

    pub fn init_sse() {}

    pub fn init_syscalls() {}

    pub fn set_kernel_stacks(_kstack: u64) {}

    pub fn broadcast_reschedule() {}

    pub fn reschedule_self() {
        core::hint::spin_loop();
    }

    pub fn set_fs_base(_base: u64) {}

    pub fn get_fs_base() -> u64 {
        0
    }

    pub fn set_user_gs_base(_base: u64) {}

    pub fn get_user_gs_base() -> u64 {
        0
    }
}

pub use imp::*;
