//! Interrupt descriptor table
//!
//! Exception gates plus sixteen legacy IRQ gates at vectors 32..47, each
//! forwarding into the shared dispatch table, and the APIC spurious
//! vector at 0xFF.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::IRQ_VECTOR_BASE;

/// APIC spurious interrupt vector
pub const SPURIOUS_VECTOR: u8 = 0xFF;

macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            super::dispatch_irq($irq);
        }
    };
}

irq_stub!(irq0, 0);
irq_stub!(irq1, 1);
irq_stub!(irq2, 2);
irq_stub!(irq3, 3);
irq_stub!(irq4, 4);
irq_stub!(irq5, 5);
irq_stub!(irq6, 6);
irq_stub!(irq7, 7);
irq_stub!(irq8, 8);
irq_stub!(irq9, 9);
irq_stub!(irq10, 10);
irq_stub!(irq11, 11);
irq_stub!(irq12, 12);
irq_stub!(irq13, 13);
irq_stub!(irq14, 14);
irq_stub!(irq15, 15);

extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {
    // No EOI for a genuinely spurious APIC interrupt
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    crate::log_warn!("[INT] breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    panic!("invalid opcode at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _code: u64) -> ! {
    panic!("double fault\n{:#?}", frame);
}

extern "x86-interrupt" fn gp_fault_handler(frame: InterruptStackFrame, code: u64) {
    panic!("general protection fault (code {:#x})\n{:#?}", code, frame);
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, code: PageFaultErrorCode) {
    use x86_64::registers::control::Cr2;
    panic!(
        "page fault at {:?} (code {:?})\n{:#?}",
        Cr2::read(),
        code,
        frame
    );
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault.set_handler_fn(gp_fault_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
        }

        let base = IRQ_VECTOR_BASE as usize;
        idt[base].set_handler_fn(irq0);
        idt[base + 1].set_handler_fn(irq1);
        idt[base + 2].set_handler_fn(irq2);
        idt[base + 3].set_handler_fn(irq3);
        idt[base + 4].set_handler_fn(irq4);
        idt[base + 5].set_handler_fn(irq5);
        idt[base + 6].set_handler_fn(irq6);
        idt[base + 7].set_handler_fn(irq7);
        idt[base + 8].set_handler_fn(irq8);
        idt[base + 9].set_handler_fn(irq9);
        idt[base + 10].set_handler_fn(irq10);
        idt[base + 11].set_handler_fn(irq11);
        idt[base + 12].set_handler_fn(irq12);
        idt[base + 13].set_handler_fn(irq13);
        idt[base + 14].set_handler_fn(irq14);
        idt[base + 15].set_handler_fn(irq15);

        idt[SPURIOUS_VECTOR as usize].set_handler_fn(spurious_handler);

        idt
    };
}

/// Load the IDT
pub fn init() {
    IDT.load();
    crate::log!("[INT] IDT loaded");
}
