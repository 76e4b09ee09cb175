//! Device drivers
//!
//! Drivers share a tiny lifecycle interface so boot can register and
//! bring them up in a fixed order. A driver whose `init` fails stays
//! disabled; boot continues with whatever fallback exists.

pub mod ahci;
pub mod ata;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Driver lifecycle interface
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;
    /// Probe and claim hardware; false leaves the driver disabled
    fn init(&self) -> bool;
    fn enable(&self);
    fn disable(&self);
}

struct Registered {
    driver: &'static dyn Driver,
    enabled: AtomicBool,
}

static REGISTRY: Mutex<Vec<Registered>> = Mutex::new(Vec::new());

/// Register a driver, run its `init`, and enable it on success
pub fn register_and_enable(driver: &'static dyn Driver) -> bool {
    let ok = driver.init();
    if ok {
        driver.enable();
        crate::log!("[DRV] '{}' enabled", driver.name());
    } else {
        crate::log_warn!("[DRV] '{}' failed to initialize, left disabled", driver.name());
    }
    REGISTRY.lock().push(Registered {
        driver,
        enabled: AtomicBool::new(ok),
    });
    ok
}

/// Whether a named driver initialized and is enabled
pub fn is_enabled(name: &str) -> bool {
    REGISTRY
        .lock()
        .iter()
        .any(|r| r.driver.name() == name && r.enabled.load(Ordering::Relaxed))
}
