// Interrupt Descriptor Table
//
// Hand-rolled descriptors with naked stubs that push the full GPR frame,
// because the context switch consumes (and rewrites) every register of
// the interrupted thread, which the compiler-generated interrupt ABI does
// not expose. All stubs funnel into `irq_common` with a pointer to the
// frame on the kernel stack.

use core::{arch::naked_asm, sync::atomic::Ordering};

use crate::{
    arch::{self, IrqFrame},
    mm, sched,
    sched::task::ThreadState,
    signal,
};

const IDT_ENTRIES: usize = 256;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    ist: u8,
    attributes: u8,
    offset_mid: u16,
    offset_hi: u32,
    reserved: u32,
}

impl IdtEntry {
    const fn empty() -> Self {
        Self {
            offset_lo: 0,
            selector: 0,
            ist: 0,
            attributes: 0,
            offset_mid: 0,
            offset_hi: 0,
            reserved: 0,
        }
    }

    fn set(&mut self, handler: u64, ist: u8) {
        self.offset_lo = handler as u16;
        self.selector = arch::KERNEL_CS;
        self.ist = ist;
        // Present, DPL 0, 64-bit interrupt gate.
        self.attributes = 0x8E;
        self.offset_mid = (handler >> 16) as u16;
        self.offset_hi = (handler >> 32) as u32;
        self.reserved = 0;
    }
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::empty(); IDT_ENTRIES];

/// Stub for a vector without a CPU-pushed error code.
macro_rules! isr {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                concat!("push ", $vector),
                "jmp {common}",
                common = sym irq_entry,
            );
        }
    };
}

/// Stub for a vector where the CPU pushes an error code.
macro_rules! isr_err {
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                concat!("push ", $vector),
                "jmp {common}",
                common = sym irq_entry,
            );
        }
    };
}

isr!(isr_divide, 0);
isr!(isr_debug, 1);
isr!(isr_nmi, 2);
isr!(isr_breakpoint, 3);
isr!(isr_overflow, 4);
isr!(isr_bound, 5);
isr!(isr_invalid_opcode, 6);
isr!(isr_no_fpu, 7);
isr_err!(isr_double_fault, 8);
isr_err!(isr_invalid_tss, 10);
isr_err!(isr_no_segment, 11);
isr_err!(isr_stack_fault, 12);
isr_err!(isr_gp_fault, 13);
isr_err!(isr_page_fault, 14);
isr!(isr_fpu_error, 16);
isr_err!(isr_alignment, 17);
isr!(isr_machine_check, 18);
isr!(isr_simd, 19);
isr!(isr_timer, 32);
isr!(isr_resched, 253);
isr!(isr_spurious, 255);

/// Common entry: capture the GPR frame and hand it to `irq_common`.
#[unsafe(naked)]
extern "C" fn irq_entry() {
    naked_asm!(
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
        "call {handler}",
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
        "iretq",
        handler = sym irq_common,
    );
}

/// After an exception touched a user thread's saved state (fault signal),
/// run the signal pipeline before resuming it, and park before the iretq
/// back to user mode when a stop signal landed.
fn return_to_user_checks(frame: &mut IrqFrame) {
    if frame.cs & 3 != 3 {
        return;
    }
    let Some(thread) = sched::current_thread() else {
        return;
    };
    let Some(proc) = thread.process() else {
        return;
    };

    loop {
        {
            let mut ctx = thread.ctx.lock();
            frame.save_into(&mut ctx.regs);
        }
        signal::process_signals(&proc, &thread);
        {
            let ctx = thread.ctx.lock();
            frame.load_from(&ctx.regs);
        }

        if thread.state() != ThreadState::Blocked {
            break;
        }

        // A stop parked this thread; yield here and re-run the pipeline
        // once continued. Dispatch stays latched off while parked so the
        // saved kernel context is never mistaken for a user frame.
        thread.in_syscall.store(true, Ordering::Release);
        while thread.state() == ThreadState::Blocked {
            sched::retick();
        }
        thread.in_syscall.store(false, Ordering::Release);
    }
}

extern "C" fn irq_common(frame: &mut IrqFrame) {
    match frame.int_no {
        0 => {
            fault_signal(frame, signal::SIGFPE, "divide error");
        }
        6 => {
            fault_signal(frame, signal::SIGILL, "invalid opcode");
        }
        13 => {
            fault_signal(frame, signal::SIGSEGV, "general protection fault");
        }
        14 => {
            let cr2 = x86_64::registers::control::Cr2::read_raw();
            if !mm::page_fault::handle(cr2, frame.err) && frame.cs & 3 != 3 {
                panic!(
                    "kernel page fault at {:#x}, rip {:#x}, error {:#x}",
                    cr2, frame.rip, frame.err
                );
            }
            return_to_user_checks(frame);
        }
        32 => {
            pit_eoi();
            sched::tick_bsp(frame);
        }
        253 => {
            apic_eoi();
            sched::tick_ap(frame);
        }
        255 => {
            // Spurious; no EOI.
        }
        vector => {
            if frame.cs & 3 == 3 {
                fault_signal(frame, signal::SIGILL, "unexpected exception");
            } else {
                panic!(
                    "unhandled kernel exception {} at rip {:#x} (error {:#x})",
                    vector, frame.rip, frame.err
                );
            }
        }
    }
}

/// Synchronous fault in user mode becomes a signal on the faulting
/// thread; in kernel mode it is fatal.
fn fault_signal(frame: &mut IrqFrame, sig: i32, what: &str) {
    if frame.cs & 3 != 3 {
        panic!(
            "{} in kernel mode at rip {:#x} (error {:#x})",
            what, frame.rip, frame.err
        );
    }

    let thread = sched::current_thread().expect("user-mode fault without a thread");
    log::debug!(target: "arch", "{}: tid {} at {:#x}", what, thread.tid(), frame.rip);
    signal::force_thread_signal(&thread, sig);
    return_to_user_checks(frame);
}

fn pit_eoi() {
    super::pit::end_of_interrupt();
}

fn apic_eoi() {
    super::apic::end_of_interrupt();
}

/// Populate and load the IDT.
pub fn init() {
    // SAFETY: bring-up path, single writer before interrupts are enabled.
    unsafe {
        let idt = &mut *core::ptr::addr_of_mut!(IDT);
        idt[0].set(isr_divide as usize as u64, 0);
        idt[1].set(isr_debug as usize as u64, 0);
        idt[2].set(isr_nmi as usize as u64, 0);
        idt[3].set(isr_breakpoint as usize as u64, 0);
        idt[4].set(isr_overflow as usize as u64, 0);
        idt[5].set(isr_bound as usize as u64, 0);
        idt[6].set(isr_invalid_opcode as usize as u64, 0);
        idt[7].set(isr_no_fpu as usize as u64, 0);
        idt[8].set(isr_double_fault as usize as u64, 1);
        idt[10].set(isr_invalid_tss as usize as u64, 0);
        idt[11].set(isr_no_segment as usize as u64, 0);
        idt[12].set(isr_stack_fault as usize as u64, 0);
        idt[13].set(isr_gp_fault as usize as u64, 0);
        idt[14].set(isr_page_fault as usize as u64, 0);
        idt[16].set(isr_fpu_error as usize as u64, 0);
        idt[17].set(isr_alignment as usize as u64, 0);
        idt[18].set(isr_machine_check as usize as u64, 0);
        idt[19].set(isr_simd as usize as u64, 0);
        idt[32].set(isr_timer as usize as u64, 0);
        idt[253].set(isr_resched as usize as u64, 0);
        idt[255].set(isr_spurious as usize as u64, 0);
    }

    load();
}

/// Load the IDT on this CPU (APs reuse the BSP-built table).
pub fn load() {
    use x86_64::structures::DescriptorTablePointer;

    let pointer = DescriptorTablePointer {
        limit: (core::mem::size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
        base: x86_64::VirtAddr::new(core::ptr::addr_of!(IDT) as u64),
    };

    // SAFETY: the IDT is static and fully initialized by `init`.
    unsafe {
        x86_64::instructions::tables::lidt(&pointer);
    }
}
