//! `syscall`/`sysret` entry path
//!
//! The entry stub swaps to the per-CPU kernel stack through the stash
//! pointed at by KERNEL_GS_BASE, materializes the same frame layout the
//! interrupt stubs use, and calls the dispatcher. The exit path normally
//! leaves via `sysretq`; if signal dispatch rewrote the frame to a
//! kernel-mode continuation (fatal default actions), it takes the `iretq`
//! road instead.

use core::arch::naked_asm;

use x86_64::registers::model_specific::Msr;

use crate::sched::smp::{self, MAX_CPUS};

const MSR_EFER: u32 = 0xC000_0080;
const MSR_STAR: u32 = 0xC000_0081;
const MSR_LSTAR: u32 = 0xC000_0082;
const MSR_SFMASK: u32 = 0xC000_0084;
const MSR_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// Reached via `gs:` from the entry stub; layout is ABI with the asm
/// below.
#[repr(C)]
struct SyscallStash {
    /// gs:[0] — kernel stack for the running thread.
    kstack: u64,
    /// gs:[8] — user rsp scratch across the stack switch.
    user_rsp: u64,
}

static mut STASH: [SyscallStash; MAX_CPUS] = [const {
    SyscallStash {
        kstack: 0,
        user_rsp: 0,
    }
}; MAX_CPUS];

/// Program the syscall MSRs on this CPU.
pub fn init() {
    // STAR: syscall loads CS/SS from bits 32..47 (0x08/0x10), sysret from
    // bits 48..63 + 16/+ 8 (0x23/0x1B with the RPL-3 base 0x13).
    let star: u64 = (0x13u64 << 48) | (0x08u64 << 32);

    // SAFETY: architectural MSRs, standard syscall setup.
    unsafe {
        let mut efer = Msr::new(MSR_EFER);
        efer.write(efer.read() | 1); // SCE

        Msr::new(MSR_STAR).write(star);
        Msr::new(MSR_LSTAR).write(syscall_entry as usize as u64);
        // Mask IF while on the entry path.
        Msr::new(MSR_SFMASK).write(1 << 9);

        let cpu = smp::current_cpu_id();
        Msr::new(MSR_KERNEL_GS_BASE).write(core::ptr::addr_of!(STASH[cpu]) as u64);
    }
}

/// Update the stashed kernel stack on context switch.
pub fn set_kernel_stack(kstack: u64) {
    let cpu = smp::current_cpu_id();
    // SAFETY: per-CPU slot written with IRQs off.
    unsafe {
        (*core::ptr::addr_of_mut!(STASH[cpu])).kstack = kstack;
    }
}

/// The `syscall` instruction lands here with rcx = user rip and r11 =
/// user rflags. Builds an [`crate::arch::IrqFrame`] on the kernel stack
/// (int_no/err zero, iret slice synthesized from the syscall registers)
/// and calls the dispatcher.
#[unsafe(naked)]
extern "C" fn syscall_entry() {
    naked_asm!(
        "swapgs",
        "mov gs:[8], rsp",
        "mov rsp, gs:[0]",
        // Synthesized iret slice: ss, rsp, rflags, cs, rip.
        "push 0x1B",
        "push qword ptr gs:[8]",
        "push r11",
        "push 0x23",
        "push rcx",
        // int_no / err.
        "push 0",
        "push 0",
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rbp",
        "push rdi",
        "push rsi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "cld",
        "call {dispatch}",
        // Signal dispatch may have rewritten the frame into a kernel-mode
        // continuation; those must leave via iretq.
        "cmp qword ptr [rsp + 144], 0x08",
        "je 2f",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "pop rcx",    // rip
        "add rsp, 8", // cs
        "pop r11",    // rflags
        "mov rsp, [rsp]",
        "swapgs",
        "sysretq",
        "2:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rsi",
        "pop rdi",
        "pop rbp",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "swapgs",
        "iretq",
        dispatch = sym crate::syscall::syscall_dispatch,
    );
}
