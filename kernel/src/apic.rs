//! APIC interrupt controller (LAPIC + IO-APIC)
//!
//! Preferred over the 8259 pair when the CPU advertises an APIC and the
//! MADT describes an IO-APIC. Legacy IRQ routing comes from the MADT
//! interrupt source overrides; unmapped lines keep the identity route
//! with edge/high signaling.

use crate::interrupts::{self, IrqController, IRQ_VECTOR_BASE};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;
use x86_64::instructions::port::Port;

// LAPIC register offsets
const LAPIC_ID: u64 = 0x020;
const LAPIC_TPR: u64 = 0x080;
const LAPIC_EOI: u64 = 0x0B0;
const LAPIC_SVR: u64 = 0x0F0;
const LAPIC_LVT_TIMER: u64 = 0x320;
const LAPIC_LVT_LINT0: u64 = 0x350;
const LAPIC_LVT_LINT1: u64 = 0x360;
const LAPIC_LVT_ERROR: u64 = 0x370;

const LAPIC_SVR_ENABLE: u32 = 1 << 8;
const LVT_MASKED: u32 = 1 << 16;

// IO-APIC indirect registers
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REG_REDTBL: u32 = 0x10;

const REDIR_MASKED: u64 = 1 << 16;
const REDIR_LEVEL: u64 = 1 << 15;
const REDIR_ACTIVE_LOW: u64 = 1 << 13;

const GSI_UNMAPPED: u32 = u32::MAX;

/// Route for one legacy IRQ line, derived from MADT overrides
#[derive(Debug, Clone, Copy)]
pub struct IrqRoute {
    pub gsi: u32,
    pub active_low: bool,
    pub level_triggered: bool,
}

impl IrqRoute {
    const fn identity(irq: u32) -> Self {
        Self {
            gsi: irq,
            active_low: false,
            level_triggered: false,
        }
    }

    fn redir_flags(&self) -> u64 {
        let mut flags = 0;
        if self.active_low {
            flags |= REDIR_ACTIVE_LOW;
        }
        if self.level_triggered {
            flags |= REDIR_LEVEL;
        }
        flags
    }
}

static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static IOAPIC_BASE: AtomicU64 = AtomicU64::new(0);
static GSI_COUNT: AtomicU32 = AtomicU32::new(0);
static LAPIC_BSP_ID: AtomicU32 = AtomicU32::new(0);

static IRQ_ROUTES: Mutex<[IrqRoute; 16]> = Mutex::new([
    IrqRoute::identity(0),
    IrqRoute::identity(1),
    IrqRoute::identity(2),
    IrqRoute::identity(3),
    IrqRoute::identity(4),
    IrqRoute::identity(5),
    IrqRoute::identity(6),
    IrqRoute::identity(7),
    IrqRoute::identity(8),
    IrqRoute::identity(9),
    IrqRoute::identity(10),
    IrqRoute::identity(11),
    IrqRoute::identity(12),
    IrqRoute::identity(13),
    IrqRoute::identity(14),
    IrqRoute::identity(15),
]);

/// Reverse map GSI -> owning IRQ, for the GSI-based controller entry points
static GSI_TO_IRQ: Mutex<[u32; 256]> = Mutex::new([GSI_UNMAPPED; 256]);

/// CPUID APIC feature flag
pub fn supported() -> bool {
    let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
    leaf.edx & (1 << 9) != 0
}

unsafe fn lapic_read(offset: u64) -> u32 {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    core::ptr::read_volatile((base + offset) as *const u32)
}

unsafe fn lapic_write(offset: u64, value: u32) {
    let base = LAPIC_BASE.load(Ordering::Relaxed);
    core::ptr::write_volatile((base + offset) as *mut u32, value);
}

fn lapic_eoi() {
    unsafe { lapic_write(LAPIC_EOI, 0) }
}

fn lapic_id() -> u32 {
    unsafe { lapic_read(LAPIC_ID) >> 24 }
}

unsafe fn ioapic_write(reg: u32, value: u32) {
    let base = IOAPIC_BASE.load(Ordering::Relaxed);
    core::ptr::write_volatile(base as *mut u32, reg);
    core::ptr::write_volatile((base + 0x10) as *mut u32, value);
}

unsafe fn ioapic_read(reg: u32) -> u32 {
    let base = IOAPIC_BASE.load(Ordering::Relaxed);
    core::ptr::write_volatile(base as *mut u32, reg);
    core::ptr::read_volatile((base + 0x10) as *const u32)
}

/// Maximum redirection entry index from the version register.
/// A zero read back means the MMIO window is not responding.
fn ioapic_max_redirs() -> u32 {
    let ver = unsafe { ioapic_read(IOAPIC_REG_VER) };
    (ver >> 16) & 0xFF
}

/// Program one redirection entry. High dword (destination) is written
/// first; the low dword carrying the mask bit goes last so the entry only
/// becomes live in its final shape.
unsafe fn ioapic_set_redir(gsi: u32, vector: u8, dest_apic: u32, flags: u64, masked: bool) {
    let reg_lo = IOAPIC_REG_REDTBL + gsi * 2;
    let mut lo = vector as u64 | flags;
    if masked {
        lo |= REDIR_MASKED;
    }
    ioapic_write(reg_lo + 1, (dest_apic << 24) as u32);
    ioapic_write(reg_lo, lo as u32);
}

unsafe fn ioapic_mask_gsi(gsi: u32, masked: bool) {
    let reg_lo = IOAPIC_REG_REDTBL + gsi * 2;
    let lo = ioapic_read(reg_lo);
    if masked {
        ioapic_write(reg_lo, lo | REDIR_MASKED as u32);
    } else {
        ioapic_write(reg_lo, lo & !(REDIR_MASKED as u32));
    }
}

fn ioapic_is_masked(gsi: u32) -> bool {
    let reg_lo = IOAPIC_REG_REDTBL + gsi * 2;
    unsafe { ioapic_read(reg_lo) & REDIR_MASKED as u32 != 0 }
}

/// Mask the LAPIC down to a known state before enabling it:
/// TPR blocks everything, every LVT masked, SVR disabled at vector 0xFF.
fn lapic_sanitize() {
    unsafe {
        lapic_write(LAPIC_TPR, 0xFF);
        for reg in [LAPIC_LVT_LINT0, LAPIC_LVT_LINT1, LAPIC_LVT_TIMER, LAPIC_LVT_ERROR] {
            let v = lapic_read(reg);
            lapic_write(reg, v | LVT_MASKED);
        }
        let mut svr = lapic_read(LAPIC_SVR);
        svr &= !LAPIC_SVR_ENABLE;
        svr = (svr & !0xFF) | crate::interrupts::idt::SPURIOUS_VECTOR as u32;
        lapic_write(LAPIC_SVR, svr);
        lapic_write(LAPIC_EOI, 0);
        lapic_write(LAPIC_TPR, 0);
    }
}

/// Legacy IMCR route from PIC wires to the APIC. Harmless where absent.
fn route_imcr_to_apic() {
    unsafe {
        Port::<u8>::new(0x22).write(0x70);
        Port::<u8>::new(0x23).write(0x01);
    }
}

/// The APIC controller singleton
pub struct Apic;

pub static APIC: Apic = Apic;

impl IrqController for Apic {
    fn name(&self) -> &'static str {
        "APIC"
    }

    fn init(&self) -> bool {
        let info = match crate::acpi::get_info() {
            Some(i) => i,
            None => {
                crate::log_warn!("[APIC] no ACPI info, cannot initialize");
                return false;
            }
        };
        let ioapic = match info.io_apics.first() {
            Some(i) => i,
            None => {
                crate::log_warn!("[APIC] MADT lists no IO-APIC");
                return false;
            }
        };

        // PIC must be silent before the APICs take over
        crate::interrupts::pic::mask_all();

        let lapic_phys = info.local_apic_addr;
        let lapic_virt = match crate::memory::map_mmio(lapic_phys, 4096) {
            Ok(v) => v,
            Err(e) => {
                crate::log_warn!("[APIC] LAPIC map failed at {:#x}: {}", lapic_phys, e);
                return false;
            }
        };
        LAPIC_BASE.store(lapic_virt, Ordering::SeqCst);

        let ioapic_virt = match crate::memory::map_mmio(ioapic.address, 4096) {
            Ok(v) => v,
            Err(e) => {
                crate::log_warn!("[APIC] IO-APIC map failed at {:#x}: {}", ioapic.address, e);
                return false;
            }
        };
        IOAPIC_BASE.store(ioapic_virt, Ordering::SeqCst);

        lapic_sanitize();

        let max_redirs = ioapic_max_redirs();
        if max_redirs == 0 {
            crate::log_error!(
                "[APIC] IO-APIC at {:#x} not responding (version read back zero)",
                ioapic.address
            );
            return false;
        }
        GSI_COUNT.store(max_redirs + 1, Ordering::SeqCst);

        unsafe {
            for gsi in 0..=max_redirs {
                ioapic_mask_gsi(gsi, true);
            }
        }

        // Enable the LAPIC, then re-read its id: firmware may have left
        // x2APIC state that made the sanitized-mode read return zero.
        unsafe {
            let svr = lapic_read(LAPIC_SVR);
            lapic_write(LAPIC_SVR, svr | LAPIC_SVR_ENABLE);
        }
        let bsp_id = lapic_id();
        LAPIC_BSP_ID.store(bsp_id, Ordering::SeqCst);

        // Fold the MADT overrides into the identity routes
        {
            let mut routes = IRQ_ROUTES.lock();
            for ovr in &info.int_overrides {
                if (ovr.source as usize) < routes.len() {
                    routes[ovr.source as usize] = IrqRoute {
                        gsi: ovr.gsi,
                        active_low: ovr.polarity == 3,
                        level_triggered: ovr.trigger == 3,
                    };
                    crate::log!(
                        "[APIC] override IRQ{} -> GSI{} (pol={} trig={})",
                        ovr.source,
                        ovr.gsi,
                        ovr.polarity,
                        ovr.trigger
                    );
                }
            }

            // Program the legacy lines, masked. When two IRQs land on the
            // same GSI the lowest-numbered one wins and the other is skipped.
            let mut gsi_to_irq = GSI_TO_IRQ.lock();
            for irq in 0..16u32 {
                let route = routes[irq as usize];
                let vector = IRQ_VECTOR_BASE + irq as u8;
                if (route.gsi as usize) < gsi_to_irq.len() {
                    let owner = gsi_to_irq[route.gsi as usize];
                    if owner != GSI_UNMAPPED && owner != irq {
                        crate::log!(
                            "[APIC] GSI{} already owned by IRQ{}, skipping IRQ{}",
                            route.gsi,
                            owner,
                            irq
                        );
                        continue;
                    }
                    gsi_to_irq[route.gsi as usize] = irq;
                }
                unsafe {
                    ioapic_set_redir(route.gsi, vector, bsp_id, route.redir_flags(), true);
                }
            }
        }

        route_imcr_to_apic();

        crate::log!(
            "[APIC] initialized: lapic id={} ioapic gsi_base={} redirs={}",
            bsp_id,
            ioapic.gsi_base,
            max_redirs
        );
        true
    }

    fn enable(&self, irq: u32) {
        if irq < 16 {
            let gsi = IRQ_ROUTES.lock()[irq as usize].gsi;
            unsafe { ioapic_mask_gsi(gsi, false) }
        }
    }

    fn disable(&self, irq: u32) {
        if irq < 16 {
            let gsi = IRQ_ROUTES.lock()[irq as usize].gsi;
            unsafe { ioapic_mask_gsi(gsi, true) }
        }
    }

    fn ack(&self, _irq: u32) {
        // The IO-APIC needs no per-line EOI; the LAPIC does
        lapic_eoi();
    }

    fn is_enabled(&self, irq: u32) -> bool {
        if irq >= 16 {
            return false;
        }
        let gsi = IRQ_ROUTES.lock()[irq as usize].gsi;
        !ioapic_is_masked(gsi)
    }

    fn register_handler(&self, irq: u32, handler: fn()) {
        interrupts::set_irq_handler(irq, handler);
    }

    fn unregister_handler(&self, irq: u32) {
        interrupts::clear_irq_handler(irq);
    }

    fn enable_gsi(&self, gsi: u32) {
        if gsi < GSI_COUNT.load(Ordering::Relaxed) {
            unsafe { ioapic_mask_gsi(gsi, false) }
        }
    }

    fn disable_gsi(&self, gsi: u32) {
        if gsi < GSI_COUNT.load(Ordering::Relaxed) {
            unsafe { ioapic_mask_gsi(gsi, true) }
        }
    }

    fn ack_gsi(&self, _gsi: u32) {
        lapic_eoi();
    }

    fn is_enabled_gsi(&self, gsi: u32) -> bool {
        gsi < GSI_COUNT.load(Ordering::Relaxed) && !ioapic_is_masked(gsi)
    }

    fn register_handler_gsi(&self, gsi: u32, handler: fn()) {
        // Dispatch slots are per legacy IRQ; map the GSI back when known
        let irq = if (gsi as usize) < 256 {
            let owner = GSI_TO_IRQ.lock()[gsi as usize];
            if owner != GSI_UNMAPPED {
                owner
            } else {
                gsi
            }
        } else {
            gsi
        };
        interrupts::set_irq_handler(irq, handler);
    }
}
