// Global Descriptor Table
//
// One GDT + TSS per CPU. Selector order is fixed by the sysret contract:
// kernel code 0x08, kernel data 0x10, user data 0x18 (RPL 3 -> 0x1B),
// user code 0x20 (RPL 3 -> 0x23), TSS 0x28. The context switch repoints
// rsp0 and IST[0] at the incoming thread's kernel stack.

use core::mem::MaybeUninit;

use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    PrivilegeLevel, VirtAddr,
};

use crate::sched::smp::{self, MAX_CPUS};

static mut TSS: [TaskStateSegment; MAX_CPUS] = [const { TaskStateSegment::new() }; MAX_CPUS];
static mut GDT: [MaybeUninit<GlobalDescriptorTable>; MAX_CPUS] =
    [const { MaybeUninit::uninit() }; MAX_CPUS];

/// Build and load this CPU's GDT and TSS.
pub fn init() {
    let cpu = smp::current_cpu_id();

    // SAFETY: each CPU touches only its own slot, once, during bring-up.
    unsafe {
        let tss: &'static TaskStateSegment = &*core::ptr::addr_of!(TSS[cpu]);

        let mut gdt = GlobalDescriptorTable::new();
        let kernel_cs = gdt.append(Descriptor::kernel_code_segment());
        let kernel_ss = gdt.append(Descriptor::kernel_data_segment());
        gdt.append(Descriptor::user_data_segment());
        gdt.append(Descriptor::user_code_segment());
        let tss_sel = gdt.append(Descriptor::tss_segment(tss));

        let slot = &mut *core::ptr::addr_of_mut!(GDT[cpu]);
        slot.write(gdt);
        slot.assume_init_ref().load_unsafe();

        CS::set_reg(kernel_cs);
        SS::set_reg(kernel_ss);
        load_tss(tss_sel);
    }
}

/// Point rsp0 and IST[0] at `kstack` (the incoming thread's kernel stack
/// top).
pub fn set_kernel_stacks(kstack: u64) {
    let cpu = smp::current_cpu_id();
    // SAFETY: per-CPU slot, mutated only by its own CPU with IRQs off.
    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS[cpu]);
        tss.privilege_stack_table[0] = VirtAddr::new(kstack);
        tss.interrupt_stack_table[0] = VirtAddr::new(kstack);
    }
}

/// Selector for the user data segment with RPL 3.
pub fn user_ss() -> SegmentSelector {
    SegmentSelector::new(3, PrivilegeLevel::Ring3)
}

/// Selector for the user code segment with RPL 3.
pub fn user_cs() -> SegmentSelector {
    SegmentSelector::new(4, PrivilegeLevel::Ring3)
}
